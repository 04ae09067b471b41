//! Anti-entropy gossip synchronization
//!
//! Keeps connected peers' event logs convergent. On connect, each side
//! sends its complete known-id set; the responder answers with both
//! halves of the symmetric difference; missing bodies are then requested
//! in bounded batches or pushed directly. Freshly learned events go onto
//! a single FIFO rebroadcast queue drained by one worker that fans
//! `new-event` out to every currently connected peer.
//!
//! Loop prevention is the per-process seen-id set rather than a hop
//! count: a rebroadcast reaching a peer that already processed the event
//! is discarded there, so propagation is bounded at one hop per edge.

use crate::net::{NetEvent, PeerId, Transport};
use crate::wire::{Message, WireError, EVENT_REQUEST_BATCH};
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};
use weft_core::{is_valid_event, Event, EventId, PeerRecord};
use weft_store::{Store, StoreError};

/// Window after which a pending sync exchange is abandoned. No automatic
/// retry; the next connect or a manual resync starts fresh.
pub const DEFAULT_SYNC_TIMEOUT: Duration = Duration::from_secs(30);

/// Sync errors
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
}

/// Gossip synchronizer state.
pub struct Gossip {
    store: Arc<Store>,
    transport: Arc<dyn Transport>,
    /// Ids this process has fully processed. Unbounded by design; a
    /// capacity-limited recency cache is the production-scale variant.
    seen: RwLock<HashSet<EventId>>,
    /// Peers we sent a sync-request to and have not heard back from.
    pending_sync: Mutex<HashMap<PeerId, Instant>>,
    sync_timeout: Duration,
    event_batch: usize,
    rebroadcast_tx: mpsc::UnboundedSender<Event>,
    rebroadcast_rx: Mutex<Option<mpsc::UnboundedReceiver<Event>>>,
    /// Every event that reached the store through this synchronizer,
    /// local or remote. Feed projections subscribe here.
    applied_tx: broadcast::Sender<Event>,
}

impl Gossip {
    pub fn new(
        store: Arc<Store>,
        transport: Arc<dyn Transport>,
        sync_timeout: Duration,
        event_batch: usize,
    ) -> Arc<Self> {
        let (rebroadcast_tx, rebroadcast_rx) = mpsc::unbounded_channel();
        let (applied_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            store,
            transport,
            seen: RwLock::new(HashSet::new()),
            pending_sync: Mutex::new(HashMap::new()),
            sync_timeout,
            event_batch: event_batch.max(1).min(EVENT_REQUEST_BATCH),
            rebroadcast_tx,
            rebroadcast_rx: Mutex::new(Some(rebroadcast_rx)),
            applied_tx,
        })
    }

    /// Subscribe to events applied to the store by this synchronizer.
    pub fn subscribe_applied(&self) -> broadcast::Receiver<Event> {
        self.applied_tx.subscribe()
    }

    /// Main loop: consumes transport events, drains the rebroadcast
    /// queue strictly FIFO, and sweeps timed-out sync exchanges.
    ///
    /// Returning drops the receivers, which deregisters all handlers. A
    /// message already being processed when shutdown fires may still
    /// complete after `run` returns to its spawner.
    pub async fn run(
        self: Arc<Self>,
        mut net_rx: mpsc::UnboundedReceiver<NetEvent>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        let mut rebroadcast_rx = self
            .rebroadcast_rx
            .lock()
            .take()
            .expect("gossip run loop started twice");
        let mut sweep = tokio::time::interval(Duration::from_millis(500).min(self.sync_timeout));

        loop {
            tokio::select! {
                event = net_rx.recv() => match event {
                    Some(event) => self.handle_net_event(event),
                    None => break,
                },
                queued = rebroadcast_rx.recv() => {
                    if let Some(event) = queued {
                        self.fan_out(&event);
                    }
                }
                _ = sweep.tick() => self.sweep_pending(),
                _ = shutdown_rx.recv() => {
                    debug!("gossip shutting down");
                    break;
                }
            }
        }
    }

    fn handle_net_event(&self, event: NetEvent) {
        match event {
            NetEvent::Connected { peer, addr } => {
                if let Err(e) = self.store.put_peer(&PeerRecord {
                    peer_id: peer.0,
                    last_seen: now_ms(),
                    addr,
                }) {
                    warn!(%peer, "failed to record peer: {e}");
                }
                self.start_sync(peer);
            }
            NetEvent::Disconnected(peer) => {
                self.pending_sync.lock().remove(&peer);
            }
            NetEvent::Message { from, bytes } => match Message::decode(&bytes) {
                Ok(message) => {
                    if let Err(e) = self.handle_message(from, message) {
                        warn!(peer = %from, "failed to handle message: {e}");
                    }
                }
                Err(e) => warn!(peer = %from, "undecodable message discarded: {e}"),
            },
        }
    }

    /// Begin an anti-entropy exchange with a peer: send our complete
    /// known-id set and wait (bounded) for the symmetric difference.
    pub fn start_sync(&self, peer: PeerId) {
        let event_ids = match self.store.list_all_ids() {
            Ok(ids) => ids,
            Err(e) => {
                warn!(%peer, "cannot enumerate ids for sync: {e}");
                return;
            }
        };
        self.pending_sync.lock().insert(peer, Instant::now());
        self.send(&peer, &Message::SyncRequest { event_ids });
    }

    fn handle_message(&self, from: PeerId, message: Message) -> Result<(), SyncError> {
        match message {
            Message::Hello { .. } => {
                // Handshake frames are consumed by the transport; one
                // arriving here is harmless.
                trace!(peer = %from, "stray hello ignored");
            }
            Message::SyncRequest { event_ids } => {
                let theirs: HashSet<EventId> = event_ids.into_iter().collect();
                let ours: HashSet<EventId> = self.store.list_all_ids()?.into_iter().collect();

                let ids_i_request_from_you: Vec<EventId> =
                    theirs.difference(&ours).copied().collect();
                let ids_you_are_missing: Vec<EventId> =
                    ours.difference(&theirs).copied().collect();

                trace!(
                    peer = %from,
                    want = ids_i_request_from_you.len(),
                    offer = ids_you_are_missing.len(),
                    "answering sync request"
                );
                self.send(
                    &from,
                    &Message::SyncResponse {
                        ids_i_request_from_you,
                        ids_you_are_missing,
                    },
                );
            }
            Message::SyncResponse {
                ids_i_request_from_you,
                ids_you_are_missing,
            } => {
                self.pending_sync.lock().remove(&from);

                // Pull what the responder holds and we lack, in bounded
                // batches.
                for chunk in ids_you_are_missing.chunks(self.event_batch) {
                    self.send(
                        &from,
                        &Message::EventRequest {
                            event_ids: chunk.to_vec(),
                        },
                    );
                }

                // Push what the responder asked for.
                let mut bodies = Vec::new();
                for id in &ids_i_request_from_you {
                    if let Some(event) = self.store.get(id)? {
                        bodies.push(event);
                    }
                }
                for chunk in bodies.chunks(self.event_batch) {
                    self.send(
                        &from,
                        &Message::EventResponse {
                            events: chunk.to_vec(),
                        },
                    );
                }
            }
            Message::EventRequest { event_ids } => {
                // Unknown ids are silently omitted.
                let mut events = Vec::new();
                for id in &event_ids {
                    if let Some(event) = self.store.get(id)? {
                        events.push(event);
                    }
                }
                self.send(&from, &Message::EventResponse { events });
            }
            Message::EventResponse { events } => {
                for event in events {
                    self.ingest(event)?;
                }
            }
            Message::NewEvent { event } => {
                self.ingest(event)?;
            }
        }
        Ok(())
    }

    /// Single processing path for any inbound event.
    fn ingest(&self, event: Event) -> Result<(), SyncError> {
        if self.seen.read().contains(&event.id) {
            trace!(id = %event.id, "already seen, discarding");
            return Ok(());
        }

        if !is_valid_event(&event) {
            // Deliberately not marked seen: a corrected resend of the
            // same id must still be accepted.
            warn!(id = %event.id, author = %event.author, "invalid event discarded");
            return Ok(());
        }

        if self.store.exists(&event.id)? {
            self.seen.write().insert(event.id);
            return Ok(());
        }

        self.store.put(&event)?;
        self.seen.write().insert(event.id);
        let _ = self.applied_tx.send(event.clone());
        let _ = self.rebroadcast_tx.send(event);
        Ok(())
    }

    /// Broadcast a locally created event: persist, mark seen, and fan
    /// out immediately via the same send path the rebroadcast worker
    /// uses.
    pub fn broadcast_local(&self, event: &Event) -> Result<(), SyncError> {
        self.store.put(event)?;
        self.seen.write().insert(event.id);
        let _ = self.applied_tx.send(event.clone());
        self.fan_out(event);
        Ok(())
    }

    /// Send `new-event` to every currently connected peer. Best-effort:
    /// one peer's failure never aborts the remaining sends. No
    /// originating-peer exclusion is needed; that peer already holds the
    /// event and discards the duplicate via its own seen set.
    fn fan_out(&self, event: &Event) {
        let message = Message::NewEvent {
            event: event.clone(),
        };
        for peer in self.transport.peers() {
            self.send(&peer, &message);
        }
    }

    fn send(&self, peer: &PeerId, message: &Message) {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("failed to encode message: {e}");
                return;
            }
        };
        if let Err(e) = self.transport.send(peer, bytes) {
            warn!(%peer, "send failed: {e}");
        }
    }

    /// Abandon sync exchanges that exceeded the timeout window.
    fn sweep_pending(&self) {
        let timeout = self.sync_timeout;
        self.pending_sync.lock().retain(|peer, started| {
            if started.elapsed() >= timeout {
                debug!(%peer, "sync timed out, abandoning");
                false
            } else {
                true
            }
        });
    }

    #[cfg(test)]
    fn seen_contains(&self, id: &EventId) -> bool {
        self.seen.read().contains(id)
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.pending_sync.lock().len()
    }
}

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
