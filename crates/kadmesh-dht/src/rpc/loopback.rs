//! In-process loopback transport for tests
//!
//! A [`LoopbackNetwork`] owns a registry of transports and a single
//! dispatch thread. Every request is queued to that thread in FIFO order,
//! optionally delayed by a fixed latency, and fails with the configured
//! probability before it reaches the target's handler. Because all traffic
//! is serialized through one queue, multi-node tests run in a reproducible
//! order.

use super::messages::{ErrorCode, Reply, Request, RequestKind};
use super::{
    DhtTransport, RequestHandler, RpcCounters, RpcError, RpcOptions, RpcResult, RpcStats,
    check_reply,
};
use crate::contact::Contact;
use crate::node_id::NodeId;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU16, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

const FIRST_PORT: u16 = 10_000;

/// Loopback network settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopbackConfig {
    /// Delay applied to every request before delivery
    pub latency: Duration,
    /// Percentage of requests that fail, 0..=100
    pub fail_percentage: u8,
    /// Seed of the failure injection generator
    pub seed: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            fail_percentage: 0,
            seed: 0,
        }
    }
}

struct Job {
    from: Contact,
    to: SocketAddr,
    request: Request,
    due: Instant,
    reply: oneshot::Sender<RpcResult<(Contact, Reply)>>,
}

struct Shared {
    transports: RwLock<HashMap<SocketAddr, Weak<LoopbackTransport>>>,
    fail_percentage: AtomicU8,
    rng: Mutex<StdRng>,
}

impl Shared {
    fn should_fail(&self) -> bool {
        let percentage = self.fail_percentage.load(Ordering::Relaxed);
        if percentage == 0 {
            return false;
        }
        let roll: u8 = self
            .rng
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .gen_range(0..100);
        roll < percentage
    }

    fn lookup(&self, addr: &SocketAddr) -> Option<Arc<LoopbackTransport>> {
        self.transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(addr)
            .and_then(Weak::upgrade)
    }

    fn deliver(&self, job: Job) {
        let now = Instant::now();
        if job.due > now {
            thread::sleep(job.due - now);
        }
        let result = if self.should_fail() {
            Err(RpcError::Timeout { addr: job.to })
        } else {
            match self.lookup(&job.to) {
                Some(target) if target.suspended.load(Ordering::Acquire) => {
                    Err(RpcError::Timeout { addr: job.to })
                }
                Some(target) => Ok(target.serve(&job.from, job.request)),
                None => Err(RpcError::Unreachable(job.to)),
            }
        };
        let _ = job.reply.send(result);
    }
}

struct Inner {
    shared: Arc<Shared>,
    queue: Mutex<mpsc::Sender<Job>>,
    latency: Duration,
    next_port: AtomicU16,
}

/// Registry and dispatcher shared by the transports created from it
#[derive(Clone)]
pub struct LoopbackNetwork {
    inner: Arc<Inner>,
}

impl LoopbackNetwork {
    /// Start a network and its dispatch thread
    #[must_use]
    pub fn new(config: LoopbackConfig) -> Self {
        let shared = Arc::new(Shared {
            transports: RwLock::new(HashMap::new()),
            fail_percentage: AtomicU8::new(config.fail_percentage.min(100)),
            rng: Mutex::new(StdRng::seed_from_u64(config.seed)),
        });
        let (tx, rx) = mpsc::channel::<Job>();
        let dispatcher = shared.clone();
        let spawned = thread::Builder::new()
            .name("kadmesh-loopback".to_string())
            .spawn(move || {
                while let Ok(job) = rx.recv() {
                    dispatcher.deliver(job);
                }
            });
        if let Err(e) = spawned {
            tracing::error!("Cannot start loopback dispatcher: {}", e);
        }

        Self {
            inner: Arc::new(Inner {
                shared,
                queue: Mutex::new(tx),
                latency: config.latency,
                next_port: AtomicU16::new(FIRST_PORT),
            }),
        }
    }

    /// Create a transport for node `id` at a fresh loopback address
    #[must_use]
    pub fn create_transport(&self, id: NodeId, instance_id: u32) -> Arc<LoopbackTransport> {
        let port = self.inner.next_port.fetch_add(1, Ordering::Relaxed);
        let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
        let transport = Arc::new(LoopbackTransport {
            network: self.inner.clone(),
            local: RwLock::new(Contact::new(id, addr).with_instance(instance_id)),
            handler: RwLock::new(None),
            counters: RpcCounters::default(),
            reachable: AtomicBool::new(true),
            suspended: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        self.inner
            .shared
            .transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(addr, Arc::downgrade(&transport));
        transport
    }

    /// Change the failure percentage, clamped to 100
    pub fn set_fail_percentage(&self, percentage: u8) {
        self.inner
            .shared
            .fail_percentage
            .store(percentage.min(100), Ordering::Relaxed);
    }

    /// Take the transport at `addr` off the network
    pub fn remove(&self, addr: &SocketAddr) -> bool {
        self.inner
            .shared
            .transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(addr)
            .is_some()
    }

    /// Number of registered transports that are still alive
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner
            .shared
            .transports
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|t| t.strong_count() > 0)
            .count()
    }

    /// Whether no transport is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for LoopbackNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackNetwork")
            .field("transports", &self.len())
            .field("latency", &self.inner.latency)
            .finish()
    }
}

/// One node's endpoint on a [`LoopbackNetwork`]
pub struct LoopbackTransport {
    network: Arc<Inner>,
    local: RwLock<Contact>,
    handler: RwLock<Option<Weak<dyn RequestHandler>>>,
    counters: RpcCounters,
    reachable: AtomicBool,
    suspended: AtomicBool,
    closed: AtomicBool,
}

impl LoopbackTransport {
    /// Override the reachability this transport reports, as if it sat
    /// behind a NAT
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::Release);
    }

    /// Handle a request on the dispatch thread
    fn serve(&self, from: &Contact, request: Request) -> (Contact, Reply) {
        self.counters.record_received(request.kind(), false);
        let local = self.local_contact();
        if self.closed.load(Ordering::Acquire) {
            return (local, Reply::Error(ErrorCode::Unavailable));
        }
        let handler = self
            .handler
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .and_then(Weak::upgrade);
        let reply = match handler {
            Some(handler) => handler.handle_request(from, request),
            None => Reply::Error(ErrorCode::Unavailable),
        };
        (local, reply)
    }

    fn finish(&self, kind: RequestKind, result: RpcResult<(Contact, Reply)>) -> RpcResult<(Contact, Reply)> {
        let result = result.and_then(|(sender, reply)| Ok((sender, check_reply(reply)?)));
        match &result {
            Ok(_) => self.counters.record_success(kind),
            Err(_) => self.counters.record_failure(kind),
        }
        result
    }
}

#[async_trait]
impl DhtTransport for LoopbackTransport {
    fn local_contact(&self) -> Contact {
        self.local.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_request_handler(&self, handler: Weak<dyn RequestHandler>) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    async fn request(
        &self,
        to: &Contact,
        request: Request,
        options: RpcOptions,
    ) -> RpcResult<(Contact, Reply)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Closed);
        }
        let kind = request.kind();
        self.counters.record_sent(kind);

        let (tx, rx) = oneshot::channel();
        let job = Job {
            from: self.local_contact(),
            to: to.addr,
            request,
            due: Instant::now() + self.network.latency,
            reply: tx,
        };
        let queued = self
            .network
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .send(job);
        if queued.is_err() {
            return self.finish(kind, Err(RpcError::Closed));
        }

        let result = match tokio::time::timeout(options.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RpcError::Closed),
            Err(_) => Err(RpcError::Timeout { addr: to.addr }),
        };
        self.finish(kind, result)
    }

    fn stats(&self) -> RpcStats {
        self.counters.snapshot()
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::Acquire)
    }

    fn set_sleeping(&self, sleeping: bool) {
        self.local.write().unwrap_or_else(|e| e.into_inner()).sleeping = sleeping;
    }

    fn set_suspended(&self, suspended: bool) {
        self.suspended.store(suspended, Ordering::Release);
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let addr = self.local_contact().addr;
        self.network
            .shared
            .transports
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&addr);
    }
}

impl std::fmt::Debug for LoopbackTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackTransport")
            .field("local", &self.local_contact())
            .finish_non_exhaustive()
    }
}
