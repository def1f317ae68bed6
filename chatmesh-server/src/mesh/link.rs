//! One TCP connection to one peer node.
//!
//! Each link runs a reader task that decodes newline-delimited envelopes and
//! hands them to the manager, and a writer task that drains the link's
//! outbound queue so envelopes hit the socket one at a time, in submission
//! order. Closing is idempotent: the first caller wins and every later call
//! is a no-op.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::{Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::PeerManager;
use super::handshake::Handshake;
use crate::identity::normalize;
use crate::protocol::{MessageKind, PeerEnvelope};
use crate::redact;

pub struct PeerLink {
    generation: u64,
    incoming: bool,
    remote_addr: SocketAddr,
    tx: Mutex<Option<mpsc::UnboundedSender<PeerEnvelope>>>,
    handshake: Mutex<Handshake>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl PeerLink {
    fn new(generation: u64, incoming: bool, remote_addr: SocketAddr, tx: mpsc::UnboundedSender<PeerEnvelope>) -> Self {
        Self {
            generation,
            incoming,
            remote_addr,
            tx: Mutex::new(Some(tx)),
            handshake: Mutex::new(Handshake::default()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_incoming(&self) -> bool {
        self.incoming
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// The peer's IP as text, used to build fallback identities.
    pub fn remote_host(&self) -> String {
        self.remote_addr.ip().to_string()
    }

    pub fn handshake(&self) -> MutexGuard<'_, Handshake> {
        self.handshake.lock()
    }

    /// Canonical id, once the handshake resolved one.
    pub fn remote_id(&self) -> Option<String> {
        self.handshake.lock().resolved_id.clone()
    }

    pub fn declared_id(&self) -> Option<String> {
        self.handshake.lock().declared_id.clone()
    }

    pub fn instance_id(&self) -> Option<String> {
        self.handshake.lock().instance_id.clone()
    }

    pub fn is_established(&self) -> bool {
        self.handshake.lock().is_complete() && !self.is_closed()
    }

    /// The identifier this peer writes into envelope routes.
    pub fn route_identifier(&self) -> Option<String> {
        let h = self.handshake.lock();
        h.instance_id.clone().or_else(|| h.resolved_id.clone())
    }

    /// True if `candidate` names this peer by its canonical, declared or
    /// instance id.
    pub fn matches_identity(&self, candidate: &str) -> bool {
        let candidate = normalize(candidate);
        if candidate.is_empty() {
            return false;
        }
        let h = self.handshake.lock();
        [&h.resolved_id, &h.declared_id, &h.instance_id]
            .into_iter()
            .flatten()
            .any(|id| normalize(id) == candidate)
    }

    /// Label for log lines.
    pub fn describe(&self) -> String {
        self.remote_id().unwrap_or_else(|| self.remote_addr.to_string())
    }

    /// Queue an envelope for the writer. Returns false once the link is
    /// shut down; the envelope is then dropped.
    pub fn send(&self, envelope: PeerEnvelope) -> bool {
        let tx = self.tx.lock();
        match tx.as_ref() {
            Some(tx) => tx.send(envelope).is_ok(),
            None => {
                tracing::debug!(peer = %self.remote_addr, kind = %envelope.kind, "Link closed, dropping envelope");
                false
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flip the closed flag. Only the first caller gets true.
    pub(super) fn mark_closed(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    /// Drop the outbound queue and stop both tasks. Dropping the tasks
    /// releases the socket halves, which closes the connection.
    pub(super) fn shutdown(&self) {
        self.tx.lock().take();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    fn adopt_tasks(&self, handles: Vec<JoinHandle<()>>) {
        if self.is_closed() {
            for h in handles {
                h.abort();
            }
            return;
        }
        self.tasks.lock().extend(handles);
    }
}

impl PeerManager {
    /// Wrap a connected socket in a link, start its tasks and say HELLO.
    pub(super) fn attach(self: &Arc<Self>, stream: TcpStream, incoming: bool) -> Result<Arc<PeerLink>, std::io::Error> {
        let remote_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        self.aliases.register_address(local_addr.ip());
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(addr = %remote_addr, "set_nodelay failed: {e}");
        }

        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        let generation = self.next_generation();
        let link = Arc::new(PeerLink::new(generation, incoming, remote_addr, tx));
        self.track_link(&link);

        let writer = tokio::spawn(write_loop(Arc::clone(self), Arc::clone(&link), write_half, rx));
        let reader = tokio::spawn(read_loop(Arc::clone(self), Arc::clone(&link), read_half));
        link.adopt_tasks(vec![writer, reader]);

        tracing::info!(addr = %remote_addr, incoming, gen = generation, "Peer socket attached");
        self.send_hello(&link);
        Ok(link)
    }
}

async fn read_loop(manager: Arc<PeerManager>, link: Arc<PeerLink>, read_half: OwnedReadHalf) {
    let mut lines = BufReader::new(read_half).lines();
    let mut msg_count: u64 = 0;
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                msg_count += 1;
                manager.handle_line(&link, &line);
                if link.is_closed() {
                    break;
                }
            }
            Ok(None) => {
                tracing::info!(peer = %link.describe(), msg_count, "Peer read EOF");
                break;
            }
            Err(e) => {
                tracing::warn!(peer = %link.describe(), msg_count, "Peer read error: {e}");
                break;
            }
        }
    }
    manager.close_link(&link);
}

async fn write_loop(
    manager: Arc<PeerManager>,
    link: Arc<PeerLink>,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<PeerEnvelope>,
) {
    let addr = link.remote_addr();
    let mut msg_count: u64 = 0;
    let mut failed = false;
    while let Some(envelope) = rx.recv().await {
        let json = match envelope.to_line() {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(addr = %addr, kind = %envelope.kind, "Envelope serialize error: {e}");
                continue;
            }
        };
        msg_count += 1;
        if envelope.kind != MessageKind::Hello {
            tracing::debug!(peer = %link.describe(), msg_count, kind = %envelope.kind, "Peer sending: {}", redact::line_for_log(&json));
        }
        let line = format!("{json}\n");
        if let Err(e) = write_half.write_all(line.as_bytes()).await {
            tracing::warn!(addr = %addr, "Peer write error after {msg_count} messages: {e}");
            failed = true;
            break;
        }
        if let Err(e) = write_half.flush().await {
            tracing::warn!(addr = %addr, "Peer flush error after {msg_count} messages: {e}");
            failed = true;
            break;
        }
    }
    tracing::debug!(addr = %addr, "Peer write queue closed after {msg_count} messages");
    let _ = write_half.shutdown().await;
    if failed {
        manager.close_link(&link);
    }
}
