//! # Capabilities Module
//!
//! A small set of local capabilities the CLI offers to `execute_capability`
//! nodes, so the agent loop can act without any network service.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

use cognigraph::{CapabilityInvoker, CapabilityOutcome, CollaboratorError};

// =============================================================================
// CUSTOM ERROR TYPE
// =============================================================================
#[derive(Error, Debug)]
pub enum CapabilityError {
    #[error("unknown capability: {0}")]
    Unknown(String),

    #[error("capability '{name}' expects {expected}")]
    BadArguments { name: String, expected: &'static str },
}

impl From<CapabilityError> for CollaboratorError {
    fn from(err: CapabilityError) -> Self {
        match err {
            CapabilityError::Unknown(name) => CollaboratorError::UnknownCapability(name),
            other => CollaboratorError::failed("capability", other.to_string()),
        }
    }
}

// =============================================================================
// LOCAL CAPABILITIES
// =============================================================================
/// `echo`, `clock` and `word_count`
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalCapabilities;

impl LocalCapabilities {
    pub const NAMES: [&'static str; 3] = ["echo", "clock", "word_count"];

    pub fn new() -> Self {
        Self
    }

    fn invoke(&self, name: &str, args: &Value) -> Result<Value, CapabilityError> {
        match name {
            "echo" => Ok(args.clone()),
            "clock" => Ok(json!({ "utc": Utc::now().to_rfc3339() })),
            "word_count" => {
                let text = args
                    .get("input")
                    .or_else(|| args.get("text"))
                    .and_then(Value::as_str)
                    .or_else(|| args.as_str())
                    .ok_or(CapabilityError::BadArguments {
                        name: name.to_string(),
                        expected: "a string `text` or `input` argument",
                    })?;
                Ok(json!({ "words": text.split_whitespace().count() }))
            }
            other => Err(CapabilityError::Unknown(other.to_string())),
        }
    }
}

#[async_trait]
impl CapabilityInvoker for LocalCapabilities {
    async fn execute_capability(&self, name: &str, args: &Value) -> Result<CapabilityOutcome, CollaboratorError> {
        debug!(capability = %name, "Executing capability");
        let output = self.invoke(name, args)?;
        info!(capability = %name, "Capability finished");
        Ok(CapabilityOutcome::ok(output))
    }
}
