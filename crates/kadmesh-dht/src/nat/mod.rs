//! NAT traversal
//!
//! A node the transport considers unreachable picks one of its live
//! contacts as rendezvous and publishes it in the DHT under
//! [`rendezvous_key`]. Peers that want to reach it look the rendezvous up
//! and hand both contacts to a [`PunchAdapter`], which does the actual
//! probing.
//!
//! The puncher follows the facade's lifecycle: it is paused while the DHT
//! is suspended and refuses all work once destroyed.

pub mod hole_punch;

use crate::contact::Contact;
use crate::control::DhtControl;
use crate::db::value::ReplicationControl;
use crate::error::DhtError;
use crate::node_id::NodeId;
use crate::rpc::Priority;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

pub use hole_punch::UdpHolePuncher;

/// Domain separator for rendezvous keys
const RENDEZVOUS_DOMAIN: &[u8] = b"nat-rendezvous";

/// Lifetime of a published rendezvous record
const RENDEZVOUS_LIFE_HOURS: u8 = 1;

/// Hole punching errors
#[derive(Debug, thiserror::Error)]
pub enum PunchError {
    /// Socket failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// All probing strategies failed
    #[error("Hole punching timeout")]
    Timeout,

    /// No internal address provided for the LAN strategy
    #[error("No internal address for LAN strategy")]
    NoInternalAddress,

    /// The target published no rendezvous
    #[error("No rendezvous published for {0}")]
    NoRendezvous(NodeId),

    /// The rendezvous lookup failed
    #[error("Rendezvous lookup failed: {0}")]
    Lookup(String),

    /// The puncher is paused
    #[error("NAT puncher paused")]
    Paused,

    /// The puncher has been destroyed
    #[error("NAT puncher destroyed")]
    Destroyed,
}

/// Performs the probing once a rendezvous is known
#[async_trait]
pub trait PunchAdapter: Send + Sync {
    /// Open a path to `target`, whose NAT binding is held open towards
    /// `rendezvous`; returns the address the target answered from
    async fn punch(&self, rendezvous: &Contact, target: &Contact) -> Result<SocketAddr, PunchError>;
}

/// DHT key a node publishes its rendezvous under
#[must_use]
pub fn rendezvous_key(id: &NodeId) -> NodeId {
    let mut data = Vec::with_capacity(RENDEZVOUS_DOMAIN.len() + id.as_bytes().len());
    data.extend_from_slice(RENDEZVOUS_DOMAIN);
    data.extend_from_slice(id.as_bytes());
    NodeId::hash(&data)
}

#[derive(Debug, Default)]
struct PunchState {
    rendezvous: Option<Contact>,
    paused: bool,
    destroyed: bool,
}

/// Rendezvous publication and lookup for one DHT instance
pub struct NatPuncher {
    control: Arc<DhtControl>,
    adapter: Arc<dyn PunchAdapter>,
    state: Mutex<PunchState>,
}

impl NatPuncher {
    /// Create a puncher over `control`, probing through `adapter`
    pub fn new(control: Arc<DhtControl>, adapter: Arc<dyn PunchAdapter>) -> Self {
        Self {
            control,
            adapter,
            state: Mutex::new(PunchState::default()),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, PunchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_active(&self) -> Result<(), PunchError> {
        let state = self.state();
        if state.destroyed {
            Err(PunchError::Destroyed)
        } else if state.paused {
            Err(PunchError::Paused)
        } else {
            Ok(())
        }
    }

    /// Currently published rendezvous
    #[must_use]
    pub fn rendezvous(&self) -> Option<Contact> {
        self.state().rendezvous.clone()
    }

    /// Keep the published rendezvous current.
    ///
    /// Reachable nodes withdraw any earlier record. Unreachable nodes keep
    /// their rendezvous while it stays live, otherwise pick the live
    /// contact closest to the local id and publish it.
    ///
    /// # Errors
    ///
    /// Returns `DhtError::InvalidState` when paused or destroyed, and
    /// replication failures from the put
    pub async fn maintain(&self) -> Result<Option<Contact>, DhtError> {
        if let Err(e) = self.check_active() {
            return Err(DhtError::InvalidState(e.to_string().into()));
        }
        let key = rendezvous_key(&self.control.local_id());

        if self.control.transport().is_reachable() {
            let previous = self.state().rendezvous.take();
            if previous.is_some() {
                tracing::debug!("Reachable again, withdrawing rendezvous record");
                if let Err(e) = self.control.remove(key, Priority::Low).await {
                    tracing::debug!("Rendezvous withdrawal failed: {}", e);
                }
            }
            return Ok(None);
        }

        let live = self.control.live_contacts();
        let current = self.rendezvous();
        if let Some(current) = current.filter(|c| live.iter().any(|l| l.id == c.id)) {
            return Ok(Some(current));
        }

        let local_id = self.control.local_id();
        let Some(chosen) = live
            .into_iter()
            .filter(|c| !c.sleeping)
            .min_by_key(|c| c.id.distance(&local_id))
        else {
            tracing::debug!("Unreachable but no live contact to use as rendezvous");
            return Ok(None);
        };

        let payload =
            bincode::serialize(&chosen).map_err(|e| DhtError::InvalidState(e.to_string().into()))?;
        self.control
            .put(
                key,
                payload,
                0,
                RENDEZVOUS_LIFE_HOURS,
                ReplicationControl::DEFAULT,
                Priority::Low,
            )
            .await?;
        tracing::info!("Published rendezvous {}", chosen);
        self.state().rendezvous = Some(chosen.clone());
        Ok(Some(chosen))
    }

    /// Open a path to `target` through its published rendezvous
    ///
    /// # Errors
    ///
    /// - `PunchError::Paused` / `PunchError::Destroyed` outside the active state
    /// - `PunchError::NoRendezvous` if the target published none
    /// - adapter failures
    pub async fn punch(&self, target: &Contact) -> Result<SocketAddr, PunchError> {
        self.check_active()?;
        let found = self
            .control
            .get(rendezvous_key(&target.id), 1, false)
            .await
            .map_err(|e| PunchError::Lookup(e.to_string()))?;
        let rendezvous = found
            .values
            .iter()
            .find_map(|v| bincode::deserialize::<Contact>(&v.payload).ok())
            .ok_or(PunchError::NoRendezvous(target.id))?;

        tracing::debug!("Punching {} via rendezvous {}", target, rendezvous);
        self.adapter.punch(&rendezvous, target).await
    }

    /// Stop maintenance and punching until [`NatPuncher::resume`]
    pub fn pause(&self) {
        self.state().paused = true;
    }

    /// Leave the paused state
    pub fn resume(&self) {
        self.state().paused = false;
    }

    /// Whether paused
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.state().paused
    }

    /// Refuse all further work
    pub fn destroy(&self) {
        let mut state = self.state();
        state.destroyed = true;
        state.rendezvous = None;
    }

    /// Whether destroyed
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state().destroyed
    }
}

impl std::fmt::Debug for NatPuncher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatPuncher")
            .field("state", &*self.state())
            .finish_non_exhaustive()
    }
}
