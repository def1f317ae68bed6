//! Server-to-server mesh.
//!
//! The [`PeerManager`] owns the peer listener, every [`PeerLink`], the
//! [`PeerDirectory`] that names them, and the retry sweep. Links exchange
//! newline-delimited JSON envelopes over plain TCP; any topology works,
//! cycles included, because every envelope carries the route it took and
//! a per-origin event id.
//!
//! Layout:
//! - `link`: socket tasks, one reader and one writer per peer
//! - `handshake`: HELLO exchange and identity admission
//! - `directory`: canonical peer ids and aliases
//! - `router`: inbound envelopes, local dispatch, relays
//! - `outbound`: everything this node originates

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::{NodeConfig, PeerAddress};
use crate::delivery::{PendingMessage, ReliableDeliveryTracker};
use crate::error::LinkError;
use crate::events::EventBus;
use crate::gateway::LocalDeliveryGateway;
use crate::identity::LocalAliases;
use crate::metrics::{self, ReplicationMetrics};
use crate::presence::PresenceDirectory;
use crate::protocol::ReplicationStatusPayload;
use crate::sync::StateSynchronizer;

mod directory;
mod handshake;
mod link;
mod outbound;
mod router;

pub use directory::{Admission, PeerDirectory};
pub use handshake::Handshake;
pub use link::PeerLink;
pub use router::USER_STATUS_CHANGED;

/// Max event ids remembered for duplicate suppression.
const DEDUP_CAPACITY: usize = 10_000;

/// How long `stop` waits for the retry sweep before aborting it.
const SWEEP_SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Bounded set of recently seen event ids.
///
/// Flooding can deliver one envelope along several paths; the first copy
/// wins and the rest are dropped here. Oldest ids are evicted first.
pub struct DedupSet {
    inner: Mutex<DedupRing>,
    capacity: usize,
}

#[derive(Default)]
struct DedupRing {
    seen: HashSet<String>,
    order: VecDeque<String>,
}

impl DedupSet {
    pub fn new() -> Self {
        Self::with_capacity(DEDUP_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self { inner: Mutex::new(DedupRing::default()), capacity: capacity.max(1) }
    }

    /// Returns true if `event_id` is new. Empty ids are never deduplicated.
    pub fn check_and_insert(&self, event_id: &str) -> bool {
        if event_id.is_empty() {
            return true;
        }
        let mut ring = self.inner.lock();
        if ring.seen.contains(event_id) {
            return false;
        }
        if ring.seen.len() >= self.capacity {
            if let Some(oldest) = ring.order.pop_front() {
                ring.seen.remove(&oldest);
            }
        }
        ring.seen.insert(event_id.to_string());
        ring.order.push_back(event_id.to_string());
        true
    }

    pub fn len(&self) -> usize {
        self.inner.lock().seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for DedupSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Observer for peers coming and going. Called after a handshake completes
/// and after an established peer's link is removed. A panicking listener is
/// logged and otherwise ignored.
pub trait PeerStatusListener: Send + Sync {
    fn on_peer_connected(&self, _server_id: &str) {}
    fn on_peer_disconnected(&self, _server_id: &str) {}
}

/// Collaborators the mesh works with.
pub struct MeshContext {
    pub sync: Arc<StateSynchronizer>,
    pub presence: Arc<PresenceDirectory>,
    pub gateway: Arc<dyn LocalDeliveryGateway>,
    pub events: EventBus,
    pub metrics: Arc<ReplicationMetrics>,
}

pub struct PeerManager {
    aliases: Arc<LocalAliases>,
    listen_addr: String,
    bootstrap: Vec<PeerAddress>,
    connect_timeout: Duration,
    directory: PeerDirectory,
    /// Every open link by generation, including ones mid-handshake.
    links: RwLock<HashMap<u64, Arc<PeerLink>>>,
    conn_gen: AtomicU64,
    presence: Arc<PresenceDirectory>,
    sync: Arc<StateSynchronizer>,
    gateway: Arc<dyn LocalDeliveryGateway>,
    events: EventBus,
    metrics: Arc<ReplicationMetrics>,
    delivery: ReliableDeliveryTracker,
    dedup: DedupSet,
    listeners: RwLock<Vec<Arc<dyn PeerStatusListener>>>,
    /// Latest REPLICATION_STATUS per server.
    statuses: RwLock<BTreeMap<String, ReplicationStatusPayload>>,
    running: AtomicBool,
    bound_addr: Mutex<Option<SocketAddr>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    sweep_task: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl PeerManager {
    pub fn new(config: &NodeConfig, ctx: MeshContext) -> Arc<Self> {
        let instance_id = uuid::Uuid::new_v4().to_string();
        let aliases = Arc::new(LocalAliases::new(&config.server_id, &instance_id));
        Arc::new(Self {
            directory: PeerDirectory::new(Arc::clone(&aliases)),
            aliases,
            listen_addr: config.listen_addr.clone(),
            bootstrap: config.bootstrap_peers(),
            connect_timeout: config.connect_timeout(),
            links: RwLock::new(HashMap::new()),
            conn_gen: AtomicU64::new(0),
            delivery: ReliableDeliveryTracker::new(config.delivery_policy(), Arc::clone(&ctx.metrics)),
            presence: ctx.presence,
            sync: ctx.sync,
            gateway: ctx.gateway,
            events: ctx.events,
            metrics: ctx.metrics,
            dedup: DedupSet::new(),
            listeners: RwLock::new(Vec::new()),
            statuses: RwLock::new(BTreeMap::new()),
            running: AtomicBool::new(false),
            bound_addr: Mutex::new(None),
            accept_task: Mutex::new(None),
            sweep_task: Mutex::new(None),
        })
    }

    // ── Accessors ──────────────────────────────────────────────────────

    pub fn server_id(&self) -> &str {
        self.aliases.server_id()
    }

    pub fn instance_id(&self) -> &str {
        self.aliases.instance_id()
    }

    pub fn directory(&self) -> &PeerDirectory {
        &self.directory
    }

    pub fn presence(&self) -> &Arc<PresenceDirectory> {
        &self.presence
    }

    pub fn synchronizer(&self) -> &Arc<StateSynchronizer> {
        &self.sync
    }

    pub fn metrics(&self) -> &Arc<ReplicationMetrics> {
        &self.metrics
    }

    pub fn delivery(&self) -> &ReliableDeliveryTracker {
        &self.delivery
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Address the peer listener is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.bound_addr.lock()
    }

    pub fn connected_peer_ids(&self) -> Vec<String> {
        self.directory.connected_ids()
    }

    pub fn replication_statuses(&self) -> BTreeMap<String, ReplicationStatusPayload> {
        self.statuses.read().clone()
    }

    pub fn add_status_listener(&self, listener: Arc<dyn PeerStatusListener>) {
        let mut listeners = self.listeners.write();
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_status_listener(&self, listener: &Arc<dyn PeerStatusListener>) {
        self.listeners.write().retain(|l| !Arc::ptr_eq(l, listener));
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Bind the peer listener, start the retry sweep and dial the
    /// bootstrap peers. Returns the bound address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr, LinkError> {
        if let Some(addr) = self.local_addr().filter(|_| self.is_running()) {
            return Ok(addr);
        }
        let listener = TcpListener::bind(&self.listen_addr).await?;
        let addr = listener.local_addr()?;
        *self.bound_addr.lock() = Some(addr);
        self.running.store(true, Ordering::Release);
        tracing::info!(server = %self.server_id(), instance = %self.instance_id(), "Peer listener on {addr}");

        let manager = Arc::clone(self);
        *self.accept_task.lock() = Some(tokio::spawn(async move {
            manager.accept_loop(listener).await;
        }));

        self.start_sweep();

        for peer in self.bootstrap.clone() {
            let manager = Arc::clone(self);
            tokio::spawn(async move {
                if let Err(e) = manager.connect_to_peer(&peer.host, peer.port).await {
                    tracing::warn!(peer = %peer, "Bootstrap connect failed: {e}");
                }
            });
        }
        Ok(addr)
    }

    /// Close the listener and every link, and stop the retry sweep.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }

        let sweep = self.sweep_task.lock().take();
        if let Some((shutdown, mut task)) = sweep {
            let _ = shutdown.send(true);
            if tokio::time::timeout(SWEEP_SHUTDOWN_GRACE, &mut task).await.is_err() {
                tracing::warn!("Retry sweep did not stop in time, aborting");
                task.abort();
            }
        }

        let links: Vec<Arc<PeerLink>> = self.links.read().values().cloned().collect();
        for link in links {
            self.close_link(&link);
        }
        self.directory.clear();
        tracing::info!(server = %self.server_id(), "Peer manager stopped");
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    if !self.is_running() {
                        break;
                    }
                    tracing::info!(addr = %addr, "Incoming peer connection");
                    if let Err(e) = self.attach(stream, true) {
                        tracing::warn!(addr = %addr, "Failed to attach incoming peer: {e}");
                    }
                }
                Err(e) => {
                    tracing::error!("Peer accept error: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// Dial a peer node. Validates the address and refuses this node's own
    /// listener.
    pub async fn connect_to_peer(self: &Arc<Self>, host: &str, port: u16) -> Result<(), LinkError> {
        if !self.is_running() {
            return Err(LinkError::NotRunning);
        }
        let host = host.trim();
        if host.is_empty() {
            return Err(LinkError::InvalidAddress("host is required".into()));
        }
        if port == 0 {
            return Err(LinkError::InvalidAddress(format!("port must be between 1 and 65535, got {port}")));
        }
        if self.is_own_endpoint(host, port) {
            return Err(LinkError::SelfConnection(format!("{host}:{port}")));
        }

        let addr = PeerAddress::new(host, port).to_string();
        let stream = match tokio::time::timeout(self.connect_timeout, TcpStream::connect((host, port))).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(LinkError::ConnectTimeout { addr, secs: self.connect_timeout.as_secs() });
            }
        };
        tracing::info!(peer = %addr, "Connected to peer");
        self.attach(stream, false)?;
        Ok(())
    }

    fn is_own_endpoint(&self, host: &str, port: u16) -> bool {
        let Some(bound) = self.local_addr() else {
            return false;
        };
        if port != bound.port() {
            return false;
        }
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.eq_ignore_ascii_case("localhost") {
            return true;
        }
        match host.parse::<std::net::IpAddr>() {
            Ok(ip) => ip.is_loopback() || ip.is_unspecified() || ip == bound.ip(),
            Err(_) => false,
        }
    }

    fn start_sweep(self: &Arc<Self>) {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let period = self.delivery.policy().sweep_interval;
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => manager.run_sweep(Instant::now()),
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Retry sweep stopped");
        });
        *self.sweep_task.lock() = Some((shutdown_tx, task));
    }

    /// One pass of the retry sweep: resend what timed out, give up on what
    /// ran out of retries.
    pub fn run_sweep(&self, now: Instant) {
        let swept = self.delivery.sweep(now);
        for pending in &swept.resend {
            self.resend(pending);
        }
        if !swept.failed.is_empty() {
            tracing::debug!(failed = swept.failed.len(), pending = self.delivery.pending_count(), "Sweep dropped messages");
        }
    }

    pub fn pending_messages(&self) -> Vec<PendingMessage> {
        self.delivery.pending()
    }

    // ── Link bookkeeping ───────────────────────────────────────────────

    fn next_generation(&self) -> u64 {
        self.conn_gen.fetch_add(1, Ordering::Relaxed)
    }

    fn track_link(&self, link: &Arc<PeerLink>) {
        self.links.write().insert(link.generation(), Arc::clone(link));
    }

    /// Tear a link down. Runs once per link however many paths get here:
    /// the reader on EOF, the writer on error, handshake rejection, stop.
    pub(crate) fn close_link(&self, link: &Arc<PeerLink>) {
        if !link.mark_closed() {
            return;
        }
        link.shutdown();
        self.links.write().remove(&link.generation());

        let Some(peer_id) = link.remote_id() else {
            tracing::info!(addr = %link.remote_addr(), gen = link.generation(), "Peer link closed before handshake");
            return;
        };
        if !self.directory.remove(link) {
            tracing::info!(peer = %peer_id, gen = link.generation(), "Peer link closed (entry kept, newer link exists)");
            return;
        }

        let drained = self.presence.drain_remote_sessions(&peer_id);
        for session in &drained {
            self.announce_remote_disconnect(session);
            self.relay_link_disconnect(&peer_id, session);
        }
        tracing::info!(peer = %peer_id, gen = link.generation(), drained = drained.len(), "Peer link closed");
        self.notify_peer_disconnected(&peer_id);
    }

    // ── Status listeners ───────────────────────────────────────────────

    fn notify_peer_connected(&self, server_id: &str) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_peer_connected(server_id))).is_err() {
                tracing::warn!(peer = %server_id, "Peer status listener panicked on connect");
            }
        }
    }

    fn notify_peer_disconnected(&self, server_id: &str) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener.on_peer_disconnected(server_id))).is_err() {
                tracing::warn!(peer = %server_id, "Peer status listener panicked on disconnect");
            }
        }
    }

    fn count_sent(&self, n: usize) {
        if n > 0 {
            self.metrics.add(metrics::SENT, n as u64);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dedup_rejects_repeats() {
        let dedup = DedupSet::new();
        assert!(dedup.check_and_insert("alpha:1"));
        assert!(!dedup.check_and_insert("alpha:1"));
        assert!(dedup.check_and_insert("beta:1"));
        assert!(dedup.check_and_insert(""));
        assert!(dedup.check_and_insert(""));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn dedup_evicts_oldest() {
        let dedup = DedupSet::with_capacity(3);
        for id in ["a", "b", "c", "d"] {
            assert!(dedup.check_and_insert(id));
        }
        assert_eq!(dedup.len(), 3);
        // "a" was evicted, so it reads as new again
        assert!(dedup.check_and_insert("a"));
        assert!(!dedup.check_and_insert("d"));
    }
}
