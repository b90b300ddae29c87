//! File operations emitted by the agent.
//!
//! The agent answers with a JSON array of operations.  [`parsing`] turns
//! raw text into that array without judging individual items;
//! [`Operation::from_value`] decodes one item and is where malformed
//! entries are rejected (by the workspace mutator, one item at a time).

pub mod parsing;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use parsing::{parse, ParseResult};

/// One file-system mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    Create {
        path: String,
        content: String,
    },
    Update {
        path: String,
        content: String,
    },
    Delete {
        path: String,
    },
    Rename {
        #[serde(rename = "oldPath")]
        old_path: String,
        #[serde(rename = "newPath")]
        new_path: String,
    },
}

impl Operation {
    /// Operation kind as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::Create { .. } => "create",
            Operation::Update { .. } => "update",
            Operation::Delete { .. } => "delete",
            Operation::Rename { .. } => "rename",
        }
    }

    /// Decode one raw array item.
    ///
    /// The error message names what is wrong with the item; the caller
    /// pairs it with [`raw_kind`] for the log line.
    pub fn from_value(value: &Value) -> anyhow::Result<Operation> {
        if !value.is_object() {
            anyhow::bail!("operation must be a JSON object");
        }
        match raw_kind(value).as_str() {
            "create" | "update" | "delete" | "rename" => {}
            "unknown" => anyhow::bail!("missing operation type"),
            other => anyhow::bail!("unsupported operation type '{other}'"),
        }
        serde_json::from_value(value.clone()).map_err(|e| anyhow::anyhow!("{e}"))
    }
}

/// The `type` field of a raw item, or `"unknown"`.
pub fn raw_kind(value: &Value) -> String {
    value
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("unknown")
        .to_string()
}
