//! # Configuration Module
//!
//! Loads CLI configuration from environment variables (and a `.env` file when
//! present), then turns it into the engine's [`EngineConfig`].

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use cognigraph::EngineConfig;

// =============================================================================
// CONFIGURATION STRUCT
// =============================================================================
/// Configuration for the `cognigraph` command-line runner.
#[derive(Debug, Clone)]
pub struct Config {
    /// The Ollama model answering `call_model` nodes (e.g., "llama3.2")
    pub model: String,

    /// Ollama server URL (default: http://localhost:11434)
    pub ollama_host: String,

    /// Default sampling temperature, used when a node sets none
    pub temperature: f64,

    /// Where trace records are written, one file per request
    pub trace_dir: PathBuf,

    /// Compress trace files with zstd
    pub compress_traces: bool,

    /// Budget for one node invocation
    pub node_timeout: Duration,

    /// Budget for the whole request, fallback excluded
    pub request_timeout: Duration,

    /// Budget for the fallback pipeline
    pub fallback_timeout: Duration,

    /// Bound for templates' agent loops
    pub max_iterations: u32,

    /// Optional JSON file holding the persona context
    pub persona_file: Option<PathBuf>,

    /// Log level for the application
    pub log_level: String,
}

// =============================================================================
// DEFAULT IMPLEMENTATION
// =============================================================================
impl Default for Config {
    fn default() -> Self {
        Self {
            model: "llama3.2".to_string(),
            ollama_host: "http://localhost:11434".to_string(),
            temperature: 0.7,
            trace_dir: default_trace_dir(),
            compress_traces: false,
            node_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            fallback_timeout: Duration::from_secs(30),
            max_iterations: 5,
            persona_file: None,
            log_level: "info".to_string(),
        }
    }
}

/// `<data dir>/cognigraph/traces`, or `./traces` when the platform has none
fn default_trace_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join("cognigraph").join("traces"))
        .unwrap_or_else(|| PathBuf::from("traces"))
}

fn parse_secs(name: &str, value: &str) -> Result<Duration> {
    let secs: u64 = value
        .parse()
        .with_context(|| format!("{} must be a whole number of seconds", name))?;
    Ok(Duration::from_secs(secs))
}

// =============================================================================
// CONFIGURATION LOADING
// =============================================================================
impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Example
    /// ```ignore
    /// let config = Config::from_env()?;
    /// println!("Using model: {}", config.model);
    /// ```
    pub fn from_env() -> Result<Self> {
        // Load .env file if it exists (silently ignore if not found)
        let _ = dotenvy::dotenv();

        let mut config = Config::default();

        if let Ok(val) = env::var("OLLAMA_MODEL") {
            config.model = val;
        }

        if let Ok(val) = env::var("OLLAMA_API_BASE_URL") {
            config.ollama_host = val;
        }

        if let Ok(val) = env::var("TEMPERATURE") {
            config.temperature = val
                .parse()
                .context("TEMPERATURE must be a valid floating-point number (e.g., 0.7)")?;
        }

        if let Ok(val) = env::var("COGNIGRAPH_TRACE_DIR") {
            config.trace_dir = PathBuf::from(val);
        }

        if let Ok(val) = env::var("COGNIGRAPH_COMPRESS_TRACES") {
            config.compress_traces = matches!(val.to_ascii_lowercase().as_str(), "1" | "true" | "yes");
        }

        if let Ok(val) = env::var("NODE_TIMEOUT_SECS") {
            config.node_timeout = parse_secs("NODE_TIMEOUT_SECS", &val)?;
        }

        if let Ok(val) = env::var("REQUEST_TIMEOUT_SECS") {
            config.request_timeout = parse_secs("REQUEST_TIMEOUT_SECS", &val)?;
        }

        if let Ok(val) = env::var("FALLBACK_TIMEOUT_SECS") {
            config.fallback_timeout = parse_secs("FALLBACK_TIMEOUT_SECS", &val)?;
        }

        if let Ok(val) = env::var("MAX_ITERATIONS") {
            config.max_iterations = val
                .parse()
                .context("MAX_ITERATIONS must be a valid positive integer")?;
        }

        if let Ok(val) = env::var("PERSONA_FILE") {
            config.persona_file = Some(PathBuf::from(val));
        }

        if let Ok(val) = env::var("RUST_LOG") {
            config.log_level = val;
        }

        Ok(config)
    }

    /// Validate the configuration before anything runs.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.temperature) {
            anyhow::bail!(
                "Temperature must be between 0.0 and 2.0, got: {}",
                self.temperature
            );
        }

        if self.max_iterations == 0 {
            anyhow::bail!("MAX_ITERATIONS must be at least 1");
        }

        if self.model.is_empty() {
            anyhow::bail!("OLLAMA_MODEL cannot be empty");
        }

        if self.node_timeout.is_zero() || self.request_timeout.is_zero() {
            anyhow::bail!("Timeouts must be greater than zero");
        }

        if self.node_timeout > self.request_timeout {
            anyhow::bail!(
                "NODE_TIMEOUT_SECS ({:?}) cannot exceed REQUEST_TIMEOUT_SECS ({:?})",
                self.node_timeout,
                self.request_timeout
            );
        }

        Ok(())
    }

    /// Runtime limits handed to the engine
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig::default()
            .with_node_timeout(self.node_timeout)
            .with_request_timeout(self.request_timeout)
    }
}
