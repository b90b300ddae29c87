//! Integration test: verify that `templates/workbench.yaml` parses into a
//! valid `Config` and that bad files are rejected.

use std::path::Path;

use workbench_gateway::config::Config;

#[tokio::test]
async fn template_config_parses_and_validates() {
    let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("templates/workbench.yaml");
    let cfg = Config::from_file(&path).await.expect("template should parse");
    cfg.validate().expect("template should validate");

    let defaults = Config::default();
    assert_eq!(cfg.preview.port, defaults.preview.port);
    assert_eq!(cfg.preview.render_args(), defaults.preview.render_args());
    assert_eq!(cfg.reserved_prefixes, defaults.reserved_prefixes);
    assert_eq!(cfg.logs.noise_patterns, defaults.logs.noise_patterns);
    assert_eq!(cfg.agent.model, defaults.agent.model);
}

#[tokio::test]
async fn partial_file_keeps_defaults() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("workbench.yaml");
    std::fs::write(
        &path,
        "workspace_root: /srv/project\npreview:\n  port: 5199\n",
    )
    .unwrap();

    let cfg = Config::from_file(&path).await.unwrap();
    assert_eq!(cfg.workspace_root, Path::new("/srv/project"));
    assert_eq!(cfg.preview.port, 5199);
    assert_eq!(cfg.preview.host, "127.0.0.1");
    assert_eq!(cfg.logs.buffer_capacity, 50);
}

#[tokio::test]
async fn unknown_keys_are_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("workbench.yaml");
    std::fs::write(&path, "preview:\n  prot: 5173\n").unwrap();

    let err = Config::from_file(&path).await.unwrap_err();
    assert!(format!("{err:#}").contains("prot"), "{err:#}");
}

#[tokio::test]
async fn invalid_noise_pattern_fails_validation() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("workbench.yaml");
    std::fs::write(&path, "logs:\n  noise_patterns: ['(unclosed']\n").unwrap();

    let cfg = Config::from_file(&path).await.unwrap();
    assert!(cfg.validate().is_err());
    assert!(Config::load(Some(&path)).await.is_err());
}

#[tokio::test]
async fn explicit_missing_file_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let err = Config::load(Some(&tmp.path().join("absent.yaml")))
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("failed to read config file"), "{err:#}");
}
