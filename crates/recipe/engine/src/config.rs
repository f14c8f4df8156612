//! Configuration for the recipe runtime

use recipe_types::{DiagnosticsMode, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Main runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Diagnostics mode used when a run does not choose one
    #[serde(default)]
    pub diagnostics: DiagnosticsMode,

    /// Pause session configuration
    #[serde(default)]
    pub sessions: SessionConfig,

    /// Retry defaults
    #[serde(default)]
    pub retry: RetryDefaults,

    /// Telemetry configuration
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Pause session configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Sessions untouched for longer than this are swept
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,

    /// Check the store for a token before resolving adapters on resume
    #[serde(default = "default_true")]
    pub fail_fast_store_check: bool,
}

impl SessionConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.ttl_secs).unwrap_or(i64::MAX))
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_ttl(),
            fail_fast_store_check: true,
        }
    }
}

/// Policy applied when neither the call nor the adapter supplies one
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryDefaults {
    #[serde(default)]
    pub policy: Option<RetryPolicy>,
}

/// Telemetry configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Install the log subscriber
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Filter used when `RUST_LOG` is unset
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Externalize trace and diagnostics through the event stream
    #[serde(default = "default_true")]
    pub emit_events: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_filter: default_log_filter(),
            emit_events: true,
        }
    }
}

// Default value helpers
fn default_true() -> bool {
    true
}

fn default_ttl() -> u64 {
    3600
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl RuntimeConfig {
    /// Load configuration from file
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&RuntimeConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        // RECIPE__SESSIONS__TTL_SECS=60 and friends
        builder = builder.add_source(
            config::Environment::with_prefix("RECIPE")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    /// Configuration that promotes contract diagnostics to errors
    pub fn strict() -> Self {
        Self {
            diagnostics: DiagnosticsMode::Strict,
            ..Default::default()
        }
    }
}
