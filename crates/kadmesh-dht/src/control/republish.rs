//! Periodic maintenance
//!
//! Four independent jobs, each driven by its own timer in the facade:
//! routing maintenance (probe one doubtful contact, refresh idle buckets),
//! original republish of values this node created, cache republish of
//! values other nodes stored here, and expiry.

use super::DhtControl;
use crate::db::value::StoredValue;
use crate::node_id::NodeId;
use crate::rpc::{DhtTransportExt, Priority};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

/// What one maintenance pass did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    /// Contacts probed
    pub pinged: usize,
    /// Buckets refreshed by a lookup
    pub refreshed: usize,
    /// Keys republished
    pub republished: usize,
    /// Values sent to nodes that lacked them
    pub values_sent: usize,
    /// Values expired
    pub expired: usize,
}

impl DhtControl {
    /// Router tick: update transport estimates, probe the contact most in
    /// need of it and refresh idle buckets. Skipped while suspended.
    pub async fn maintain_routing(self: &Arc<Self>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if self.is_suspended() {
            return report;
        }
        self.transport.tick();

        let now = Instant::now();
        let candidate = self.router().contact_to_ping(now);
        if let Some(contact) = candidate {
            report.pinged = 1;
            if let Err(e) = self.ping(&contact, Priority::Low).await {
                tracing::trace!("Maintenance ping to {} failed: {}", contact, e);
            }
        }

        if self.router().is_empty() {
            return report;
        }
        let targets = self.router().refresh_targets(now);
        for target in targets {
            self.lookup_nodes(target, false).await;
            report.refreshed += 1;
        }
        if report.refreshed > 0 {
            tracing::debug!("Refreshed {} buckets", report.refreshed);
        }
        report
    }

    /// Republish this node's values whose republish interval has elapsed
    pub async fn republish_originals(self: &Arc<Self>) -> MaintenanceReport {
        self.republish_local(false).await
    }

    /// Republish every value this node originated, due or not
    pub async fn republish_all_originals(self: &Arc<Self>) -> MaintenanceReport {
        self.republish_local(true).await
    }

    async fn republish_local(self: &Arc<Self>, all: bool) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if self.is_suspended() {
            return report;
        }
        let now = Instant::now();
        let default_interval = self.config.original_republish_interval();
        let local = self.db.local_values();
        let due: Vec<StoredValue> = {
            let published = self.published.lock().unwrap_or_else(|e| e.into_inner());
            local
                .into_iter()
                .filter(|v| {
                    let interval = v.replication_control.republish_interval(default_interval);
                    all || published
                        .get(&v.key)
                        .is_none_or(|at| now.saturating_duration_since(*at) >= interval)
                })
                .collect()
        };

        for value in due {
            let key = value.key;
            self.mark_published(key);
            match self.replicate(value, Priority::Low).await {
                Ok(result) => {
                    report.republished += 1;
                    report.values_sent += result.acks;
                }
                Err(e) => tracing::debug!("Republish of {} failed: {}", key, e),
            }
        }
        if report.republished > 0 {
            tracing::info!("Republished {} original values", report.republished);
        }
        report
    }

    /// Push cached values to the current closest nodes of each key.
    ///
    /// Each holder is first asked which values it lacks, so values it
    /// already has are not resent.
    pub async fn republish_cache(self: &Arc<Self>) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();
        if self.is_suspended() || self.is_sleeping() {
            return report;
        }

        let mut by_key: HashMap<NodeId, Vec<StoredValue>> = HashMap::new();
        for value in self.db.stored_values() {
            by_key.entry(value.key).or_default().push(value);
        }

        let options = self.options(Priority::Low);
        for (key, values) in by_key {
            let entries: Vec<(NodeId, u64)> = values.iter().map(|v| (key, v.fingerprint())).collect();
            let closest = self.lookup_nodes(key, false).await;
            for contact in closest {
                let missing = match self
                    .transport
                    .query_store(&contact, entries.clone(), options)
                    .await
                {
                    Ok(missing) => {
                        self.reply_received(&contact, &[]);
                        missing
                    }
                    Err(e) => {
                        self.request_failed(&contact, &e);
                        continue;
                    }
                };
                let send: Vec<StoredValue> = missing
                    .iter()
                    .filter_map(|&i| values.get(i as usize).cloned())
                    .collect();
                if send.is_empty() {
                    continue;
                }
                let count = send.len();
                if self.store_to(&contact, send, options).await.is_ok() {
                    report.values_sent += count;
                }
            }
            report.republished += 1;
        }
        if report.values_sent > 0 {
            tracing::debug!(
                "Cache republish sent {} values across {} keys",
                report.values_sent,
                report.republished
            );
        }
        report
    }

    /// Drop values past their lifetime
    pub fn expire_values(&self) -> MaintenanceReport {
        MaintenanceReport {
            expired: self.db.expire(Instant::now()),
            ..MaintenanceReport::default()
        }
    }
}
