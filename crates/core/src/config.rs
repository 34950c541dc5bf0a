use serde::Deserialize;

/// Root application configuration. Loaded from environment variables
/// with the prefix `FUNNELFLOW__` and optional TOML config files.
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default)]
    pub engine: EngineConfig,
}

/// Tuning knobs for the funnel automation engine.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Seconds between processing passes of the tick driver.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// Maximum number of due enrollments advanced per pass.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Seconds after which a claimed-but-never-released enrollment
    /// becomes eligible for pickup again.
    #[serde(default = "default_claim_lease_secs")]
    pub claim_lease_secs: u64,
    /// Re-check cadence for condition steps that wait without a retry
    /// budget configured.
    #[serde(default = "default_recheck_interval_secs")]
    pub recheck_interval_secs: u64,
    /// Number of parallel workers advancing a pass.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

fn default_node_id() -> String {
    "node-01".to_string()
}
fn default_tick_interval_secs() -> u64 {
    60
}
fn default_batch_size() -> usize {
    500
}
fn default_claim_lease_secs() -> u64 {
    120
}
fn default_recheck_interval_secs() -> u64 {
    3600
}
fn default_workers() -> usize {
    4
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            node_id: default_node_id(),
            engine: EngineConfig::default(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: default_tick_interval_secs(),
            batch_size: default_batch_size(),
            claim_lease_secs: default_claim_lease_secs(),
            recheck_interval_secs: default_recheck_interval_secs(),
            workers: default_workers(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment variables and optional config file.
    pub fn load() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(
                config::Environment::with_prefix("FUNNELFLOW")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(","),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }
}
