//! Speed tester handle
//!
//! What a bandwidth estimator needs from the DHT: a supply of live contacts
//! and round-trip measurements against them. The facade hands one out while
//! the node is active and destroys it when the node goes to sleep.

use crate::contact::Contact;
use crate::control::DhtControl;
use crate::error::{DhtError, Result};
use crate::rpc::Priority;
use rand::seq::SliceRandom;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

static NEXT_TESTER_ID: AtomicU64 = AtomicU64::new(1);

/// RTT probe handle bound to one DHT instance
pub struct SpeedTester {
    id: u64,
    control: Arc<DhtControl>,
    destroyed: AtomicBool,
}

impl SpeedTester {
    pub(crate) fn new(control: Arc<DhtControl>) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_TESTER_ID.fetch_add(1, Ordering::Relaxed),
            control,
            destroyed: AtomicBool::new(false),
        })
    }

    /// Process-unique id; a new tester is created on every wake-up
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Up to `count` live contacts in random order
    #[must_use]
    pub fn candidates(&self, count: usize) -> Vec<Contact> {
        if self.is_destroyed() {
            return Vec::new();
        }
        let mut live = self.control.live_contacts();
        live.shuffle(&mut rand::thread_rng());
        live.truncate(count);
        live
    }

    /// Round-trip time of a high-priority PING to `contact`
    ///
    /// # Errors
    ///
    /// - `DhtError::Destroyed` once the tester has been destroyed
    /// - `DhtError::Rpc` if the contact does not answer
    pub async fn probe(&self, contact: &Contact) -> Result<Duration> {
        if self.is_destroyed() {
            return Err(DhtError::Destroyed);
        }
        let started = Instant::now();
        self.control.ping(contact, Priority::High).await?;
        let rtt = started.elapsed();
        tracing::trace!("Probe of {} took {:?}", contact, rtt);
        Ok(rtt)
    }

    /// Whether the tester has been destroyed
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) fn destroy(&self) {
        if !self.destroyed.swap(true, Ordering::AcqRel) {
            tracing::debug!("Speed tester {} destroyed", self.id);
        }
    }
}

impl std::fmt::Debug for SpeedTester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpeedTester")
            .field("id", &self.id)
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DhtConfig;
    use crate::db::diversify::LocalStorageAdapter;
    use crate::node_id::NodeId;
    use crate::rpc::loopback::{LoopbackConfig, LoopbackNetwork};

    fn control(network: &LoopbackNetwork) -> Arc<DhtControl> {
        let transport = network.create_transport(NodeId::random(), 1);
        DhtControl::new(
            DhtConfig::default(),
            transport,
            Arc::new(LocalStorageAdapter::default()),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_probe_and_destroy() {
        let network = LoopbackNetwork::new(LoopbackConfig::default());
        let a = control(&network);
        let b = control(&network);
        a.add_contact(b.local_contact(), true);

        let tester = SpeedTester::new(a.clone());
        let candidates = tester.candidates(5);
        assert_eq!(candidates.len(), 1);
        assert!(tester.probe(&candidates[0]).await.is_ok());

        tester.destroy();
        assert!(tester.is_destroyed());
        assert!(tester.candidates(5).is_empty());
        assert!(matches!(
            tester.probe(&b.local_contact()).await,
            Err(DhtError::Destroyed)
        ));
        assert_ne!(SpeedTester::new(a).id(), tester.id());
    }
}
