//! Runtime configuration for the orchestrator.
//!
//! Every knob has a serde default and an environment override so embedders
//! can construct a config in code while deployments tune via `FLEX_*`
//! variables.

use serde::{Deserialize, Serialize};

/// Orchestrator-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlexConfig {
    /// TTL for the cached capability snapshot in milliseconds.
    #[serde(default = "default_capability_cache_ttl_ms")]
    pub capability_cache_ttl_ms: u64,
    /// Maximum number of CRCS rows handed to the planner service.
    #[serde(default = "default_crcs_max_rows")]
    pub crcs_max_rows: usize,
    /// Default retry bound for failed capability post-conditions.
    #[serde(default = "default_post_condition_max_retries")]
    pub post_condition_max_retries: u32,
    /// Attempts a capability client makes when self-registering.
    #[serde(default = "default_self_register_retries")]
    pub self_register_retries: u32,
    /// Delay before the first self-registration attempt, in milliseconds.
    #[serde(default = "default_self_register_initial_delay_ms")]
    pub self_register_initial_delay_ms: u64,
    /// Interval between heartbeat refreshes for self-registered capabilities.
    #[serde(default = "default_registration_refresh_ms")]
    pub registration_refresh_ms: u64,
    /// Planner invocations allowed per run (initial plan plus replans).
    #[serde(default = "default_planner_max_attempts")]
    pub planner_max_attempts: u32,
    /// HITL requests allowed per run before further raises are denied.
    #[serde(default = "default_hitl_max_requests")]
    pub hitl_max_requests: u32,
    /// Completed-sibling outputs included in a capability prompt.
    #[serde(default = "default_prompt_sibling_cap")]
    pub prompt_sibling_cap: usize,
}

fn default_capability_cache_ttl_ms() -> u64 {
    5_000
}

fn default_crcs_max_rows() -> usize {
    80
}

fn default_post_condition_max_retries() -> u32 {
    1
}

fn default_self_register_retries() -> u32 {
    5
}

fn default_self_register_initial_delay_ms() -> u64 {
    500
}

fn default_registration_refresh_ms() -> u64 {
    30_000
}

fn default_planner_max_attempts() -> u32 {
    2
}

fn default_hitl_max_requests() -> u32 {
    3
}

fn default_prompt_sibling_cap() -> usize {
    3
}

impl Default for FlexConfig {
    fn default() -> Self {
        Self {
            capability_cache_ttl_ms: default_capability_cache_ttl_ms(),
            crcs_max_rows: default_crcs_max_rows(),
            post_condition_max_retries: default_post_condition_max_retries(),
            self_register_retries: default_self_register_retries(),
            self_register_initial_delay_ms: default_self_register_initial_delay_ms(),
            registration_refresh_ms: default_registration_refresh_ms(),
            planner_max_attempts: default_planner_max_attempts(),
            hitl_max_requests: default_hitl_max_requests(),
            prompt_sibling_cap: default_prompt_sibling_cap(),
        }
    }
}

impl FlexConfig {
    /// Build a config from defaults plus `FLEX_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ttl) = read_env_u64("FLEX_CAPABILITY_CACHE_TTL_MS") {
            config.capability_cache_ttl_ms = ttl;
        }
        if let Some(rows) = read_env_u64("FLEX_PLANNER_CRCS_MAX_ROWS") {
            // A zero cap would hide every capability from the planner.
            config.crcs_max_rows = (rows as usize).max(1);
        }
        if let Some(retries) = read_env_u64("FLEX_CAPABILITY_POST_CONDITION_MAX_RETRIES") {
            config.post_condition_max_retries = retries as u32;
        }
        if let Some(retries) = read_env_u64("FLEX_CAPABILITY_SELF_REGISTER_RETRIES") {
            config.self_register_retries = retries as u32;
        }
        if let Some(delay) = read_env_u64("FLEX_CAPABILITY_SELF_REGISTER_INITIAL_DELAY_MS") {
            config.self_register_initial_delay_ms = delay;
        }
        if let Some(interval) = read_env_u64("FLEX_CAPABILITY_REGISTRATION_REFRESH_MS") {
            config.registration_refresh_ms = interval;
        }
        if let Some(attempts) = read_env_u64("FLEX_PLANNER_MAX_ATTEMPTS") {
            config.planner_max_attempts = (attempts as u32).max(1);
        }
        if let Some(cap) = read_env_u64("FLEX_HITL_MAX_REQUESTS") {
            config.hitl_max_requests = cap as u32;
        }

        config
    }

    /// Effective CRCS row cap, never below one.
    pub fn crcs_row_cap(&self) -> usize {
        self.crcs_max_rows.max(1)
    }
}

fn read_env_u64(name: &str) -> Option<u64> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().parse::<u64>() {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring unparseable {}={:?}", name, raw);
                None
            }
        },
        Err(_) => None,
    }
}
