//! Sandboxed project workspace.
//!
//! All file-system writes made on behalf of the agent go through
//! [`Workspace`].  Every path is resolved relative to the root and rejected
//! if it could land outside it, either lexically (`..`, absolute paths) or
//! through a symlinked ancestor.

use std::path::{Component, Path, PathBuf};

use anyhow::Context;
use serde_json::Value;
use tracing::{debug, warn};

use crate::operations::{raw_kind, Operation};

#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create the root directory if it does not exist yet.
    pub async fn ensure_root(&self) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .with_context(|| format!("failed to create workspace root {}", self.root.display()))
    }

    /// Apply raw operation items in order, best-effort.
    ///
    /// Returns exactly one log line per item.  A failing item never stops
    /// the items after it.
    pub async fn apply_operations(&self, items: &[Value]) -> Vec<String> {
        let mut lines = Vec::with_capacity(items.len());
        for item in items {
            let line = match Operation::from_value(item) {
                Ok(op) => match self.apply(&op).await {
                    Ok(line) => line,
                    Err(e) => format!("Error applying {}: {e:#}", op.kind()),
                },
                Err(e) => format!("Error applying {}: {e}", raw_kind(item)),
            };
            if line.starts_with("Error applying") {
                warn!(root = %self.root.display(), "{line}");
            } else {
                debug!(root = %self.root.display(), "{line}");
            }
            lines.push(line);
        }
        lines
    }

    /// Apply a single decoded operation and return its log line.
    pub async fn apply(&self, op: &Operation) -> anyhow::Result<String> {
        self.ensure_root().await?;
        match op {
            Operation::Create { path, content } | Operation::Update { path, content } => {
                let target = self.resolve(path)?;
                if let Some(parent) = target.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&target, content).await?;
                Ok(format!("{} {path}", op.kind()))
            }
            Operation::Delete { path } => {
                let target = self.resolve_entry(path)?;
                match tokio::fs::symlink_metadata(&target).await {
                    Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&target).await?,
                    Ok(_) => tokio::fs::remove_file(&target).await?,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                Ok(format!("delete {path}"))
            }
            Operation::Rename { old_path, new_path } => {
                let from = self.resolve_entry(old_path)?;
                let to = self.resolve_entry(new_path)?;
                if let Some(parent) = to.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::rename(&from, &to).await?;
                Ok(format!("rename {old_path} -> {new_path}"))
            }
        }
    }

    /// Resolve a workspace-relative path to an absolute one inside the root.
    pub fn resolve(&self, raw: &str) -> anyhow::Result<PathBuf> {
        let relative = lexical_relative(raw)?;
        let root = self.canonical_root()?;
        let resolved = canon_or_resolve(&root.join(&relative))?;
        if !resolved.starts_with(&root) {
            anyhow::bail!("path escapes workspace: {raw}");
        }
        Ok(resolved)
    }

    /// Like [`resolve`](Self::resolve), but the final component is kept
    /// as-is so a symlink names the link itself, not its target.
    ///
    /// Used for deletes and renames.  The root itself is never an entry.
    pub fn resolve_entry(&self, raw: &str) -> anyhow::Result<PathBuf> {
        let relative = lexical_relative(raw)?;
        let Some(name) = relative.file_name() else {
            anyhow::bail!("refusing to touch the workspace root");
        };
        let root = self.canonical_root()?;
        let parent = relative.parent().unwrap_or(Path::new(""));
        let parent = canon_or_resolve(&root.join(parent))?;
        if !parent.starts_with(&root) {
            anyhow::bail!("path escapes workspace: {raw}");
        }
        Ok(parent.join(name))
    }

    /// Contents of a hinted file, or `None` when the hint is unsafe,
    /// missing or not UTF-8.
    pub async fn read_file(&self, hint: &str) -> Option<String> {
        let path = self.resolve(hint).ok()?;
        tokio::fs::read_to_string(&path).await.ok()
    }

    /// Concatenate hinted files into prompt blocks of the form
    /// `"\n\n=== <hint> ===\n<content>"`.  Unreadable hints are skipped.
    pub async fn build_file_context(&self, hints: &[String]) -> String {
        let mut out = String::new();
        for hint in hints {
            match self.read_file(hint).await {
                Some(content) => {
                    out.push_str("\n\n=== ");
                    out.push_str(hint);
                    out.push_str(" ===\n");
                    out.push_str(&content);
                }
                None => debug!(hint = %hint, "skipping unreadable file hint"),
            }
        }
        out
    }

    fn canonical_root(&self) -> anyhow::Result<PathBuf> {
        self.root
            .canonicalize()
            .with_context(|| format!("workspace root unavailable: {}", self.root.display()))
    }
}

/// Normalise `raw` lexically into a root-relative path, rejecting
/// absolute paths and `..` that climbs above the root.
fn lexical_relative(raw: &str) -> anyhow::Result<PathBuf> {
    if raw.trim().is_empty() {
        anyhow::bail!("path is empty");
    }
    if raw.contains('\0') {
        anyhow::bail!("path contains a NUL byte");
    }
    let candidate = Path::new(raw);
    if candidate.is_absolute() || candidate.has_root() {
        anyhow::bail!("absolute paths are not allowed: {raw}");
    }

    let mut relative = PathBuf::new();
    for component in candidate.components() {
        match component {
            Component::Normal(part) => relative.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                if !relative.pop() {
                    anyhow::bail!("path escapes workspace: {raw}");
                }
            }
            Component::RootDir | Component::Prefix(_) => {
                anyhow::bail!("absolute paths are not allowed: {raw}");
            }
        }
    }

    Ok(relative)
}

/// Canonicalize the longest existing prefix of `p` and re-append the rest.
///
/// Existence is checked without following links, so a dangling symlink
/// fails canonicalization instead of being written through.
fn canon_or_resolve(p: &Path) -> anyhow::Result<PathBuf> {
    let mut existing = p.to_path_buf();
    let mut tail = Vec::new();
    while existing.symlink_metadata().is_err() {
        let name = existing
            .file_name()
            .ok_or_else(|| anyhow::anyhow!("cannot resolve path: {}", p.display()))?
            .to_os_string();
        tail.push(name);
        existing = existing
            .parent()
            .ok_or_else(|| anyhow::anyhow!("cannot resolve path: {}", p.display()))?
            .to_path_buf();
    }
    let mut resolved = existing.canonicalize()?;
    for part in tail.into_iter().rev() {
        resolved.push(part);
    }
    Ok(resolved)
}
