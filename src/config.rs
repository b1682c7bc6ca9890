//! Engine configuration
//!
//! Env-var driven, `.env` friendly. Flags on the binary override these.

use std::env;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub db_path: String,
    pub sweep_interval_secs: u64,
    pub sweep_batch: usize,
    /// Paper collaborators instead of the HTTP hub/treasury.
    pub paper: bool,
    pub hub_base_url: String,
    pub hub_api_key: String,
    pub treasury_base_url: String,
    pub treasury_api_key: String,
    pub notify_base_url: String,
    pub notify_api_key: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_path: "gauntlet.db".to_string(),
            sweep_interval_secs: 15,
            sweep_batch: 50,
            paper: true,
            hub_base_url: "http://localhost:8791".to_string(),
            hub_api_key: String::new(),
            treasury_base_url: "http://localhost:8792".to_string(),
            treasury_api_key: String::new(),
            notify_base_url: "http://localhost:8793".to_string(),
            notify_api_key: String::new(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = env::var("GAUNTLET_DB_PATH") {
            if !v.is_empty() {
                config.db_path = v;
            }
        }
        if let Ok(v) = env::var("GAUNTLET_SWEEP_INTERVAL_SECS") {
            if let Ok(secs) = v.parse() {
                config.sweep_interval_secs = secs;
            }
        }
        if let Ok(v) = env::var("GAUNTLET_SWEEP_BATCH") {
            if let Ok(batch) = v.parse() {
                config.sweep_batch = batch;
            }
        }
        if let Ok(v) = env::var("GAUNTLET_PAPER") {
            config.paper = matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON");
        }
        if let Ok(v) = env::var("GAUNTLET_HUB_URL") {
            config.hub_base_url = v;
        }
        if let Ok(v) = env::var("GAUNTLET_HUB_API_KEY") {
            config.hub_api_key = v;
        }
        if let Ok(v) = env::var("GAUNTLET_TREASURY_URL") {
            config.treasury_base_url = v;
        }
        if let Ok(v) = env::var("GAUNTLET_TREASURY_API_KEY") {
            config.treasury_api_key = v;
        }
        if let Ok(v) = env::var("GAUNTLET_NOTIFY_URL") {
            config.notify_base_url = v;
        }
        if let Ok(v) = env::var("GAUNTLET_NOTIFY_API_KEY") {
            config.notify_api_key = v;
        }

        config
    }
}
