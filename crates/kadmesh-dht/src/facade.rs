//! DHT facade
//!
//! [`Dht`] is the single entry point a host application uses. It wires the
//! transport, control, speed tester and NAT puncher together, runs the
//! maintenance timers and tracks the host's lifecycle:
//!
//! ```text
//! Starting -> Active <-> Sleeping      (run-state signal)
//!             Active <-> Suspended     (explicit call)
//!             any    ->  Destroyed     (terminal)
//! ```
//!
//! Listeners learn about speed tester availability and state changes. Each
//! callback is isolated: an error or panic in one listener is logged and
//! does not stop delivery to the others.

use crate::config::DhtConfig;
use crate::contact::Contact;
use crate::control::{ControlStats, DhtControl, GetResult, PutResult};
use crate::db::diversify::{LocalStorageAdapter, StorageAdapter};
use crate::db::key_block::KeyBlock;
use crate::db::value::{ReplicationControl, StoredValue};
use crate::error::{DhtError, Result};
use crate::nat::{NatPuncher, PunchAdapter, PunchError};
use crate::node_id::NodeId;
use crate::rpc::udp::UdpDhtTransport;
use crate::rpc::{DhtTransport, Priority};
use crate::speed::SpeedTester;
use kadmesh_transport::MuxRegistry;
use std::fmt::Write as _;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};

/// Upper bound on how long an original value waits past its republish time
const ORIGINAL_REPUBLISH_CHECK: Duration = Duration::from_secs(5 * 60);

/// Rendezvous maintenance period
const NAT_MAINTENANCE_PERIOD: Duration = Duration::from_secs(2 * 60);

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhtState {
    /// Created, not yet joined
    Starting,
    /// Fully operational
    Active,
    /// Host is sleeping; replacement caches shrink and cache republish stops
    Sleeping,
    /// Stores refused and routing maintenance paused
    Suspended,
    /// Terminal
    Destroyed,
}

impl std::fmt::Display for DhtState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Active => "active",
            Self::Sleeping => "sleeping",
            Self::Suspended => "suspended",
            Self::Destroyed => "destroyed",
        };
        f.write_str(name)
    }
}

/// Events delivered to listeners
#[derive(Debug, Clone)]
pub enum DhtEvent {
    /// A speed tester is available
    SpeedTesterAvailable(Arc<SpeedTester>),
    /// The speed tester with this id was destroyed
    SpeedTesterDestroyed {
        /// Id of the destroyed tester
        id: u64,
    },
    /// Lifecycle state changed
    StateChanged(DhtState),
}

/// Error a listener may return from a callback
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Observer of [`DhtEvent`]s
pub trait DhtListener: Send + Sync {
    /// Called for every event, outside of any internal lock
    ///
    /// # Errors
    ///
    /// Errors are logged and otherwise ignored
    fn on_event(&self, event: &DhtEvent) -> std::result::Result<(), ListenerError>;
}

/// Handle returned by [`Dht::add_listener`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Host run-state signal
pub trait RunStateSource: Send + Sync {
    /// Whether the host application is sleeping
    fn is_sleeping(&self) -> bool;
}

/// Construction options
#[derive(Clone)]
pub struct DhtOptions {
    /// DHT configuration
    pub config: DhtConfig,
    /// Node id; random when unset
    pub node_id: Option<NodeId>,
    /// Diversification storage; in-memory when unset
    pub storage: Option<Arc<dyn StorageAdapter>>,
    /// Run-state signal; the node never sleeps when unset
    pub run_state: Option<Arc<dyn RunStateSource>>,
    /// Hole punching adapter; no NAT puncher when unset
    pub punch_adapter: Option<Arc<dyn PunchAdapter>>,
    /// Whether to run the maintenance timers
    pub timers: bool,
}

impl DhtOptions {
    /// Options with `config` and every collaborator defaulted
    #[must_use]
    pub fn new(config: DhtConfig) -> Self {
        Self {
            config,
            node_id: None,
            storage: None,
            run_state: None,
            punch_adapter: None,
            timers: true,
        }
    }

    /// Use a fixed node id
    #[must_use]
    pub fn with_node_id(mut self, id: NodeId) -> Self {
        self.node_id = Some(id);
        self
    }

    /// Use `storage` for diversification records
    #[must_use]
    pub fn with_storage(mut self, storage: Arc<dyn StorageAdapter>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Follow `source` for sleeping transitions
    #[must_use]
    pub fn with_run_state(mut self, source: Arc<dyn RunStateSource>) -> Self {
        self.run_state = Some(source);
        self
    }

    /// Enable the NAT puncher with `adapter`
    #[must_use]
    pub fn with_punch_adapter(mut self, adapter: Arc<dyn PunchAdapter>) -> Self {
        self.punch_adapter = Some(adapter);
        self
    }

    /// Do not run maintenance timers; maintenance is then driven by hand
    #[must_use]
    pub fn without_timers(mut self) -> Self {
        self.timers = false;
        self
    }
}

impl std::fmt::Debug for DhtOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DhtOptions")
            .field("config", &self.config)
            .field("node_id", &self.node_id)
            .field("run_state", &self.run_state.is_some())
            .field("punch_adapter", &self.punch_adapter.is_some())
            .field("timers", &self.timers)
            .finish_non_exhaustive()
    }
}

/// Facade counters
#[derive(Debug, Clone, Copy)]
pub struct DhtStats {
    /// Lifecycle state
    pub state: DhtState,
    /// Control-level counters
    pub control: ControlStats,
    /// Id of the live speed tester
    pub speed_tester: Option<u64>,
    /// Registered listeners
    pub listeners: usize,
}

struct Lifecycle {
    started: bool,
    sleeping: bool,
    suspended: bool,
    destroyed: bool,
    speed_tester: Option<Arc<SpeedTester>>,
    listeners: Vec<(ListenerId, Arc<dyn DhtListener>)>,
    next_listener: u64,
}

impl Lifecycle {
    fn state(&self) -> DhtState {
        if self.destroyed {
            DhtState::Destroyed
        } else if !self.started {
            DhtState::Starting
        } else if self.suspended {
            DhtState::Suspended
        } else if self.sleeping {
            DhtState::Sleeping
        } else {
            DhtState::Active
        }
    }
}

/// One DHT instance
pub struct Dht {
    control: Arc<DhtControl>,
    run_state: Option<Arc<dyn RunStateSource>>,
    nat: Option<Arc<NatPuncher>>,
    lifecycle: Mutex<Lifecycle>,
    timers: Mutex<JoinSet<()>>,
    destroying: AtomicBool,
}

impl Dht {
    /// Bind a UDP transport on `registry`, join the configured bootstrap
    /// nodes and start maintenance
    ///
    /// # Errors
    ///
    /// - `DhtError::InvalidConfig` if the configuration does not validate
    /// - `DhtError::Mux` if the network is already registered on the port
    pub async fn create(registry: Arc<MuxRegistry>, options: DhtOptions) -> Result<Arc<Self>> {
        options.config.validate()?;
        let id = options.node_id.unwrap_or_else(NodeId::random);
        let transport = UdpDhtTransport::bind(registry, &options.config, id, rand::random()).await?;
        Self::with_transport(transport, options).await
    }

    /// Build a DHT over an existing transport
    ///
    /// # Errors
    ///
    /// Returns `DhtError::InvalidConfig` if the configuration does not
    /// validate
    pub async fn with_transport(transport: Arc<dyn DhtTransport>, options: DhtOptions) -> Result<Arc<Self>> {
        let storage = options.storage.clone().unwrap_or_else(|| {
            Arc::new(LocalStorageAdapter::new(options.config.diversification.clone()))
        });
        let seeds = options.config.bootstrap.clone();
        let control = DhtControl::new(options.config.clone(), transport, storage)?;
        let nat = options
            .punch_adapter
            .clone()
            .map(|adapter| Arc::new(NatPuncher::new(control.clone(), adapter)));

        let dht = Arc::new(Self {
            control,
            run_state: options.run_state.clone(),
            nat,
            lifecycle: Mutex::new(Lifecycle {
                started: false,
                sleeping: false,
                suspended: false,
                destroyed: false,
                speed_tester: None,
                listeners: Vec::new(),
                next_listener: 1,
            }),
            timers: Mutex::new(JoinSet::new()),
            destroying: AtomicBool::new(false),
        });

        if !seeds.is_empty() {
            dht.control.bootstrap(&seeds).await;
        }
        if options.timers {
            dht.start_timers();
        }
        dht.start();
        Ok(dht)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.lifecycle().destroyed {
            return Err(DhtError::Destroyed);
        }
        Ok(())
    }

    fn host_sleeping(&self) -> bool {
        self.run_state.as_ref().is_some_and(|s| s.is_sleeping())
    }

    fn start(&self) {
        let sleeping = self.host_sleeping();
        let events = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.destroyed {
                return;
            }
            lifecycle.started = true;
            lifecycle.sleeping = sleeping;
            let mut events = Vec::new();
            if !sleeping {
                let tester = SpeedTester::new(self.control.clone());
                lifecycle.speed_tester = Some(tester.clone());
                events.push(DhtEvent::SpeedTesterAvailable(tester));
            }
            events.push(DhtEvent::StateChanged(lifecycle.state()));
            events
        };
        self.control.set_sleeping(sleeping);
        tracing::info!("DHT {} started", self.control.local_contact());
        self.dispatch(events);
    }

    fn start_timers(&self) {
        let config = self.control.config();
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());

        let control = self.control.clone();
        timers.spawn(every(config.router_tick(), move || {
            let control = control.clone();
            async move {
                control.maintain_routing().await;
            }
        }));

        let control = self.control.clone();
        let original = config.original_republish_interval().min(ORIGINAL_REPUBLISH_CHECK);
        timers.spawn(every(original, move || {
            let control = control.clone();
            async move {
                control.republish_originals().await;
            }
        }));

        let control = self.control.clone();
        timers.spawn(every(config.cache_republish_interval(), move || {
            let control = control.clone();
            async move {
                control.republish_cache().await;
            }
        }));

        let control = self.control.clone();
        timers.spawn(every(config.expiry_check_interval(), move || {
            let control = control.clone();
            async move {
                let report = control.expire_values();
                if report.expired > 0 {
                    tracing::debug!("Expired {} values", report.expired);
                }
            }
        }));

        if let Some(nat) = &self.nat {
            let nat = nat.clone();
            timers.spawn(every(NAT_MAINTENANCE_PERIOD, move || {
                let nat = nat.clone();
                async move {
                    if let Err(e) = nat.maintain().await {
                        tracing::debug!("Rendezvous maintenance failed: {}", e);
                    }
                }
            }));
        }
    }

    /// Deliver `events` to every listener, isolating each callback
    fn dispatch(&self, events: Vec<DhtEvent>) {
        if events.is_empty() {
            return;
        }
        let listeners: Vec<Arc<dyn DhtListener>> = self
            .lifecycle()
            .listeners
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for event in &events {
            for listener in &listeners {
                notify(listener.as_ref(), event);
            }
        }
    }

    /// Re-read the run-state signal and enter or leave sleeping mode.
    ///
    /// Going to sleep destroys the speed tester; waking up creates a fresh
    /// one and announces it.
    pub fn run_state_changed(&self) {
        let sleeping = self.host_sleeping();
        let events = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.destroyed || !lifecycle.started || lifecycle.sleeping == sleeping {
                return;
            }
            lifecycle.sleeping = sleeping;
            let mut events = Vec::new();
            if sleeping {
                if let Some(tester) = lifecycle.speed_tester.take() {
                    tester.destroy();
                    events.push(DhtEvent::SpeedTesterDestroyed { id: tester.id() });
                }
            } else if lifecycle.speed_tester.is_none() {
                let tester = SpeedTester::new(self.control.clone());
                lifecycle.speed_tester = Some(tester.clone());
                events.push(DhtEvent::SpeedTesterAvailable(tester));
            }
            events.push(DhtEvent::StateChanged(lifecycle.state()));
            events
        };
        self.control.set_sleeping(sleeping);
        tracing::info!("DHT {}", if sleeping { "sleeping" } else { "awake" });
        self.dispatch(events);
    }

    /// Enter or leave suspended mode; the NAT puncher pauses with it
    pub fn set_suspended(&self, suspended: bool) {
        let events = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.destroyed || lifecycle.suspended == suspended {
                return;
            }
            lifecycle.suspended = suspended;
            vec![DhtEvent::StateChanged(lifecycle.state())]
        };
        self.control.set_suspended(suspended);
        if let Some(nat) = &self.nat {
            if suspended {
                nat.pause();
            } else {
                nat.resume();
            }
        }
        tracing::info!("DHT {}", if suspended { "suspended" } else { "resumed" });
        self.dispatch(events);
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> DhtState {
        self.lifecycle().state()
    }

    /// Control layer
    #[must_use]
    pub fn control(&self) -> &Arc<DhtControl> {
        &self.control
    }

    /// Local contact as advertised
    #[must_use]
    pub fn local_contact(&self) -> Contact {
        self.control.local_contact()
    }

    /// Live speed tester, if any
    #[must_use]
    pub fn speed_tester(&self) -> Option<Arc<SpeedTester>> {
        self.lifecycle().speed_tester.clone()
    }

    /// NAT puncher, when a punch adapter was configured
    #[must_use]
    pub fn nat_puncher(&self) -> Option<&Arc<NatPuncher>> {
        self.nat.as_ref()
    }

    /// Join the network through `seeds`; returns the routing table size
    ///
    /// # Errors
    ///
    /// Returns `DhtError::Destroyed` after [`Dht::destroy`]
    pub async fn bootstrap(&self, seeds: &[SocketAddr]) -> Result<usize> {
        self.ensure_alive()?;
        Ok(self.control.bootstrap(seeds).await)
    }

    /// Store `value` under `key`
    ///
    /// # Errors
    ///
    /// - `DhtError::Destroyed` after [`Dht::destroy`]
    /// - `DhtError::ValueTooLarge` if `value` cannot fit in one STORE
    /// - `DhtError::KeyBlocked` if a key-block covers the key
    /// - `DhtError::QuorumNotReached` if too few nodes accepted the value
    pub async fn put(
        &self,
        key: &[u8],
        value: Vec<u8>,
        flags: u8,
        life_hours: u8,
        replication_control: ReplicationControl,
        high_priority: bool,
    ) -> Result<PutResult> {
        self.ensure_alive()?;
        self.control
            .put(
                NodeId::hash(key),
                value,
                flags,
                life_hours,
                replication_control,
                priority(high_priority),
            )
            .await
    }

    /// Look up values under `key`, newest first; `max_values` 0 means all
    ///
    /// # Errors
    ///
    /// - `DhtError::Destroyed` after [`Dht::destroy`]
    /// - `DhtError::KeyBlocked` if a key-block covers the key
    pub async fn get(&self, key: &[u8], max_values: u16, exhaustive: bool) -> Result<GetResult> {
        self.ensure_alive()?;
        self.control.get(NodeId::hash(key), max_values, exhaustive).await
    }

    /// Withdraw this node's value under `key`
    ///
    /// # Errors
    ///
    /// - `DhtError::Destroyed` after [`Dht::destroy`]
    /// - `DhtError::InvalidState` if this node holds no value under `key`
    pub async fn remove(&self, key: &[u8], high_priority: bool) -> Result<PutResult> {
        self.ensure_alive()?;
        self.control
            .remove(NodeId::hash(key), priority(high_priority))
            .await
    }

    /// Withdraw this node's value under `key` from explicit `contacts`
    ///
    /// # Errors
    ///
    /// As for [`Dht::remove`]
    pub async fn remove_from(&self, key: &[u8], contacts: &[Contact], high_priority: bool) -> Result<PutResult> {
        self.ensure_alive()?;
        self.control
            .remove_from(NodeId::hash(key), contacts, priority(high_priority))
            .await
    }

    /// Apply and spread a signed key-block; returns the number of nodes
    /// that accepted it
    ///
    /// # Errors
    ///
    /// - `DhtError::Destroyed` after [`Dht::destroy`]
    /// - `DhtError::KeyBlock` if the block does not verify
    pub async fn publish_key_block(&self, block: KeyBlock) -> Result<usize> {
        self.ensure_alive()?;
        self.control.publish_key_block(block).await
    }

    /// This node's own value under `key`
    #[must_use]
    pub fn get_local_value(&self, key: &[u8]) -> Option<StoredValue> {
        self.control.database().local_value(&NodeId::hash(key))
    }

    /// Values other nodes stored here
    #[must_use]
    pub fn get_stored_values(&self) -> Vec<StoredValue> {
        self.control.database().stored_values()
    }

    /// Open a path to `target` through its published rendezvous
    ///
    /// # Errors
    ///
    /// - `PunchError::Destroyed` if no NAT puncher is configured or the
    ///   DHT was destroyed
    /// - lookup and adapter failures
    pub async fn punch(&self, target: &Contact) -> std::result::Result<SocketAddr, PunchError> {
        match &self.nat {
            Some(nat) => nat.punch(target).await,
            None => Err(PunchError::Destroyed),
        }
    }

    /// Write up to `max_contacts` contacts to `writer`; 0 uses the
    /// configured limit
    ///
    /// # Errors
    ///
    /// - `DhtError::Destroyed` after [`Dht::destroy`]
    /// - `DhtError::State` if writing fails
    pub fn export_state<W: Write>(&self, writer: &mut W, max_contacts: usize) -> Result<usize> {
        self.ensure_alive()?;
        let max = match max_contacts {
            0 => self.control.config().max_export_contacts,
            n => n,
        };
        Ok(self.control.export_state(writer, max)?)
    }

    /// Seed the routing table from an exported state
    ///
    /// # Errors
    ///
    /// - `DhtError::Destroyed` after [`Dht::destroy`]
    /// - `DhtError::State` for a foreign or corrupt stream
    pub fn import_state<R: Read>(&self, reader: &mut R) -> Result<usize> {
        self.ensure_alive()?;
        Ok(self.control.import_state(reader)?)
    }

    /// Register `listener`. If a speed tester is live the listener is told
    /// about it right away.
    pub fn add_listener(&self, listener: Arc<dyn DhtListener>) -> ListenerId {
        let (id, tester) = {
            let mut lifecycle = self.lifecycle();
            let id = ListenerId(lifecycle.next_listener);
            lifecycle.next_listener += 1;
            lifecycle.listeners.push((id, listener.clone()));
            (id, lifecycle.speed_tester.clone())
        };
        if let Some(tester) = tester {
            notify(listener.as_ref(), &DhtEvent::SpeedTesterAvailable(tester));
        }
        id
    }

    /// Unregister a listener; returns whether it was registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut lifecycle = self.lifecycle();
        let before = lifecycle.listeners.len();
        lifecycle.listeners.retain(|(l, _)| *l != id);
        lifecycle.listeners.len() != before
    }

    /// Counters
    #[must_use]
    pub fn stats(&self) -> DhtStats {
        let (state, speed_tester, listeners) = {
            let lifecycle = self.lifecycle();
            (
                lifecycle.state(),
                lifecycle.speed_tester.as_ref().map(|t| t.id()),
                lifecycle.listeners.len(),
            )
        };
        DhtStats {
            state,
            control: self.control.stats(),
            speed_tester,
            listeners,
        }
    }

    /// Log the diagnostic report at info level and return it
    pub fn print(&self) -> String {
        let stats = self.stats();
        let mut report = String::new();
        let _ = writeln!(
            report,
            "state={} speed_tester={:?} listeners={} nat={}",
            stats.state,
            stats.speed_tester,
            stats.listeners,
            self.nat
                .as_ref()
                .and_then(|n| n.rendezvous())
                .map_or_else(|| "-".to_string(), |c| c.to_string())
        );
        report.push_str(&self.control.describe());
        for line in report.lines() {
            tracing::info!("{}", line);
        }
        report
    }

    /// Stop timers, release the speed tester and NAT puncher and close the
    /// transport. Safe to call more than once and concurrently with
    /// lifecycle callbacks.
    pub async fn destroy(&self) {
        if self.destroying.swap(true, Ordering::AcqRel) {
            return;
        }
        let (events, listeners) = {
            let mut lifecycle = self.lifecycle();
            lifecycle.destroyed = true;
            let mut events = Vec::new();
            if let Some(tester) = lifecycle.speed_tester.take() {
                tester.destroy();
                events.push(DhtEvent::SpeedTesterDestroyed { id: tester.id() });
            }
            events.push(DhtEvent::StateChanged(DhtState::Destroyed));
            (events, std::mem::take(&mut lifecycle.listeners))
        };

        self.timers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .abort_all();
        if let Some(nat) = &self.nat {
            nat.destroy();
        }
        self.control.shutdown().await;
        tracing::info!("DHT {} destroyed", self.control.local_id());

        for event in &events {
            for (_, listener) in &listeners {
                notify(listener.as_ref(), event);
            }
        }
    }
}

impl std::fmt::Debug for Dht {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dht")
            .field("local_id", &self.control.local_id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn priority(high: bool) -> Priority {
    if high { Priority::High } else { Priority::Low }
}

fn notify(listener: &dyn DhtListener, event: &DhtEvent) {
    match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!("Listener failed on {:?}: {}", event, e),
        Err(_) => tracing::error!("Listener panicked on {:?}", event),
    }
}

/// Run `job` every `period`, starting one period from now
async fn every<F, Fut>(period: Duration, mut job: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    let mut interval = tokio::time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        job().await;
    }
}
