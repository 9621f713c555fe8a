//! Shuts down previews that have seen no deployment for too long.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sitebot_core::{ContextField, InstanceRecord, PrId};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info};

use crate::comments::template_ids;
use crate::github::CommentTarget;
use crate::instances::InstanceManager;

pub const REAP_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub async fn reaper_loop(manager: Arc<InstanceManager>, threshold: ChronoDuration) {
    let mut interval = interval(REAP_INTERVAL);

    loop {
        interval.tick().await;
        reap_idle_instances(&manager, threshold, Utc::now()).await;
    }
}

/// PRs whose last deployment (or creation) is older than `threshold` at `now`.
pub fn expired_instances(
    records: &[InstanceRecord],
    now: DateTime<Utc>,
    threshold: ChronoDuration,
) -> Vec<PrId> {
    records
        .iter()
        .filter(|record| now - record.last_activity() > threshold)
        .map(InstanceRecord::pr_id)
        .collect()
}

/// Remove every idle instance and tell its pull request. Returns the PRs removed.
pub async fn reap_idle_instances(
    manager: &InstanceManager,
    threshold: ChronoDuration,
    now: DateTime<Utc>,
) -> Vec<PrId> {
    let records = manager.registry().list().await;
    let expired = expired_instances(&records, now, threshold);
    if expired.is_empty() {
        return expired;
    }

    info!("Reaping {} idle instance(s)", expired.len());
    let idle_since = now - threshold;
    let composer = manager.composer();
    let mut removed = Vec::new();

    for pr in expired {
        // Re-checked under the PR lock: a deployment may have landed since listing
        match manager.remove_if_idle(pr, idle_since).await {
            Ok(Some(record)) => {
                let context = composer
                    .request_context(&record.data)
                    .with(ContextField::IdleHours, threshold.num_hours());
                composer
                    .notify(
                        &CommentTarget::from(&record.data),
                        template_ids::EXPIRED,
                        &context,
                    )
                    .await;
                removed.push(pr);
            }
            Ok(None) => info!("PR #{} was redeployed, keeping it", pr),
            Err(e) => error!("Failed to reap PR #{}: {}", pr, e),
        }
    }

    removed
}
