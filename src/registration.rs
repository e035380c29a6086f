//! Self-registration helper for capability clients.
//!
//! A capability process registers itself with the orchestrator on startup,
//! retrying while the registry comes up, then keeps its heartbeat fresh on
//! an interval.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::FlexConfig;
use crate::models::{CapabilityRecord, CapabilityRegistration};
use crate::registry::{CapabilityRegistry, RegistrationError};

/// Register with bounded retries and an initial delay.
///
/// Contract rejections are permanent and returned immediately; only the
/// final attempt's outcome is returned otherwise.
pub async fn register_with_retries(
    registry: &CapabilityRegistry,
    payload: CapabilityRegistration,
    config: &FlexConfig,
) -> Result<CapabilityRecord, RegistrationError> {
    let attempts = config.self_register_retries.max(1);
    let mut delay = Duration::from_millis(config.self_register_initial_delay_ms);

    let mut last_error = None;
    for attempt in 1..=attempts {
        match registry.register(payload.clone()).await {
            Ok(record) => {
                info!(
                    capability_id = %record.capability_id,
                    attempt,
                    "capability self-registered"
                );
                return Ok(record);
            }
            Err(err) => {
                // Contract rejections will not heal with time.
                if matches!(
                    err,
                    RegistrationError::FacetContract(_) | RegistrationError::MissingOutputContract
                ) {
                    return Err(err);
                }
                warn!(
                    capability_id = %payload.capability_id,
                    attempt,
                    error = %err,
                    "self-registration attempt failed"
                );
                last_error = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                }
            }
        }
    }
    Err(last_error.expect("at least one attempt ran"))
}

/// Spawn a background task refreshing `last_seen_at` on an interval.
/// Dropping the returned handle stops the refresher.
pub fn spawn_heartbeat_refresher(
    registry: Arc<CapabilityRegistry>,
    capability_id: String,
    config: &FlexConfig,
) -> tokio::task::JoinHandle<()> {
    let interval = Duration::from_millis(config.registration_refresh_ms.max(100));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if !registry.heartbeat(&capability_id).await {
                warn!(capability_id, "heartbeat refresher stopping: capability unknown");
                break;
            }
        }
    })
}
