//! Node composition
//!
//! Wires identity, store, follow graph, feed engine, and gossip together
//! behind the user-facing operations: post, follow, unfollow, profile
//! update. Every mutating operation signs a new event, persists it
//! locally, and hands it to the gossip synchronizer for broadcast; the
//! log is append-only, so corrections are always new events.

use crate::feed::FeedEngine;
use crate::graph::FollowGraph;
use crate::net::{NetEvent, Transport};
use crate::sync::{now_ms, Gossip, SyncError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::debug;
use weft_core::{
    create_follow, create_post, create_profile, create_unfollow, Author, Event, Identity,
};
use weft_store::{Store, StoreError};

/// Node errors
#[derive(Debug, Error)]
pub enum NodeError {
    /// Operation invoked before `start()`. Fatal to the caller.
    #[error("node not started")]
    NotStarted,
    /// `start()` after `stop()`. A node instance runs at most once.
    #[error("node already stopped")]
    Stopped,
    #[error("event error: {0}")]
    Event(#[from] weft_core::Error),
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),
}

/// A running Weft node.
pub struct Node {
    identity: Identity,
    store: Arc<Store>,
    graph: FollowGraph,
    feed: Arc<FeedEngine>,
    gossip: Arc<Gossip>,
    transport: Arc<dyn Transport>,
    shutdown_tx: broadcast::Sender<()>,
    net_rx: Mutex<Option<mpsc::UnboundedReceiver<NetEvent>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl Node {
    pub fn new(
        identity: Identity,
        store: Arc<Store>,
        transport: Arc<dyn Transport>,
        net_rx: mpsc::UnboundedReceiver<NetEvent>,
        sync_timeout: Duration,
        event_batch: usize,
    ) -> Self {
        let feed = Arc::new(FeedEngine::new(store.clone(), identity.author()));
        let gossip = Gossip::new(store.clone(), transport.clone(), sync_timeout, event_batch);
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            graph: FollowGraph::new(store.clone()),
            identity,
            store,
            feed,
            gossip,
            transport,
            shutdown_tx,
            net_rx: Mutex::new(Some(net_rx)),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Our author identity.
    pub fn author(&self) -> Author {
        self.identity.author()
    }

    /// The feed engine serving this node's projections.
    pub fn feed(&self) -> &Arc<FeedEngine> {
        &self.feed
    }

    /// Spawn the gossip run loop and the applied-event forwarder that
    /// folds synced events into the feed projections.
    ///
    /// Idempotent while running. A node instance runs at most once:
    /// calling this after `stop()` fails with [`NodeError::Stopped`].
    pub fn start(&self) -> Result<(), NodeError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let Some(net_rx) = self.net_rx.lock().take() else {
            self.started.store(false, Ordering::SeqCst);
            return Err(NodeError::Stopped);
        };
        let mut tasks = self.tasks.lock();

        tasks.push(tokio::spawn(
            self.gossip.clone().run(net_rx, self.shutdown_tx.subscribe()),
        ));

        let mut applied_rx = self.gossip.subscribe_applied();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let feed = self.feed.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    applied = applied_rx.recv() => match applied {
                        Ok(event) => {
                            if let Err(e) = feed.add_event(&event) {
                                debug!("feed update failed: {e}");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "feed forwarder lagged, refreshing");
                            let _ = feed.refresh();
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        }));
        Ok(())
    }

    fn ensure_started(&self) -> Result<(), NodeError> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(NodeError::NotStarted)
        }
    }

    fn publish(&self, event: Event) -> Result<Event, NodeError> {
        self.gossip.broadcast_local(&event)?;
        // Deterministic for the caller; the async forwarder's duplicate
        // delivery is absorbed by feed dedup.
        self.feed.add_event(&event)?;
        Ok(event)
    }

    /// Author and broadcast a post.
    pub fn post(&self, text: &str, topic: &str) -> Result<Event, NodeError> {
        self.ensure_started()?;
        let event = create_post(&self.identity, text, topic, now_ms())?;
        self.publish(event)
    }

    /// Follow `target`, advertising our encryption public key, and
    /// return the signed event after persisting and broadcasting it.
    pub fn follow(&self, target: Author) -> Result<Event, NodeError> {
        self.ensure_started()?;
        let event = create_follow(
            &self.identity,
            target,
            Some(self.identity.encryption_public_key()),
            now_ms(),
        )?;
        let event = self.publish(event)?;
        // The followed author's existing posts become home-feed eligible.
        self.feed.refresh()?;
        Ok(event)
    }

    /// Stop following `target`.
    pub fn unfollow(&self, target: Author) -> Result<Event, NodeError> {
        self.ensure_started()?;
        let event = create_unfollow(&self.identity, target, now_ms())?;
        let event = self.publish(event)?;
        self.feed.refresh()?;
        Ok(event)
    }

    /// Publish a profile update.
    pub fn set_profile(&self, name: &str, about: &str) -> Result<Event, NodeError> {
        self.ensure_started()?;
        let event = create_profile(&self.identity, name, about, now_ms())?;
        self.publish(event)
    }

    /// Are we currently following `target`?
    pub fn is_following(&self, target: &Author) -> Result<bool, NodeError> {
        self.ensure_started()?;
        Ok(self.graph.is_following(&self.author(), target)?)
    }

    /// Everyone we currently follow.
    pub fn following(&self) -> Result<Vec<Author>, NodeError> {
        self.ensure_started()?;
        Ok(self.graph.following(&self.author())?)
    }

    /// Everyone currently following us, as far as our log knows.
    pub fn followers(&self) -> Result<Vec<Author>, NodeError> {
        self.ensure_started()?;
        Ok(self.graph.followers(&self.author())?)
    }

    /// Re-run the anti-entropy exchange with a connected peer.
    pub fn resync(&self, peer: crate::net::PeerId) -> Result<(), NodeError> {
        self.ensure_started()?;
        self.gossip.start_sync(peer);
        Ok(())
    }

    /// Stop the node: signal all tasks, close every open connection,
    /// await the tasks, flush the store. Peers observe a disconnect.
    /// A message already in flight when the signal lands may finish
    /// processing after this returns.
    pub async fn stop(&self) -> Result<(), NodeError> {
        self.started.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());
        self.transport.close();
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.store.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{MemoryMesh, NetError, PeerId};
    use crate::sync::DEFAULT_SYNC_TIMEOUT;
    use std::time::Instant;
    use tempfile::tempdir;

    fn spawn(mesh: &MemoryMesh, seed: u8) -> (Node, PeerId, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let identity = Identity::from_seed(&[seed; 32]);
        let peer_id = PeerId(identity.author().0);
        let (transport, net_rx) = mesh.join(peer_id);
        let node = Node::new(
            identity,
            store,
            transport,
            net_rx,
            DEFAULT_SYNC_TIMEOUT,
            100,
        );
        (node, peer_id, dir)
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_operations_require_start() {
        let mesh = MemoryMesh::new();
        let (node, _, _dir) = spawn(&mesh, 1);

        assert!(matches!(
            node.post("too early", "general"),
            Err(NodeError::NotStarted)
        ));
        // Read operations are gated the same way
        assert!(matches!(
            node.is_following(&node.author()),
            Err(NodeError::NotStarted)
        ));
        assert!(matches!(node.following(), Err(NodeError::NotStarted)));
        assert!(matches!(node.followers(), Err(NodeError::NotStarted)));

        node.start().unwrap();
        assert!(node.post("hello", "general").is_ok());
        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_stop_is_an_error() {
        let mesh = MemoryMesh::new();
        let (node, _, _dir) = spawn(&mesh, 1);

        node.start().unwrap();
        node.start().unwrap(); // idempotent while running
        node.stop().await.unwrap();

        assert!(matches!(node.start(), Err(NodeError::Stopped)));
        assert!(matches!(
            node.post("late", "general"),
            Err(NodeError::NotStarted)
        ));
    }

    #[tokio::test]
    async fn test_stop_closes_connections() {
        let mesh = MemoryMesh::new();
        let (node, peer, _dir) = spawn(&mesh, 1);
        node.start().unwrap();

        let watcher = PeerId([9; 32]);
        let (watcher_node, mut watcher_rx) = mesh.join(watcher);
        mesh.connect(peer, watcher);
        // The node greets the watcher with a sync request once connected.
        wait_until(|| matches!(watcher_rx.try_recv(), Ok(NetEvent::Message { .. }))).await;

        node.stop().await.unwrap();

        assert!(node.transport.peers().is_empty());
        wait_until(|| {
            matches!(
                watcher_rx.try_recv(),
                Ok(NetEvent::Disconnected(from)) if from == peer
            )
        })
        .await;
        assert!(matches!(
            watcher_node.send(&peer, vec![1]),
            Err(NetError::NotConnected(_))
        ));
    }

    #[tokio::test]
    async fn test_follow_unfollow_round_trip() {
        let mesh = MemoryMesh::new();
        let (node, _, _dir) = spawn(&mesh, 1);
        let (other, _, _dir2) = spawn(&mesh, 2);
        node.start().unwrap();

        let event = node.follow(other.author()).unwrap();
        // Follow events advertise our encryption key
        match event.body {
            weft_core::EventBody::Follow { encryption_key, .. } => {
                assert!(encryption_key.is_some())
            }
            _ => panic!("expected follow body"),
        }
        assert!(node.is_following(&other.author()).unwrap());
        assert_eq!(node.following().unwrap(), vec![other.author()]);

        node.unfollow(other.author()).unwrap();
        assert!(!node.is_following(&other.author()).unwrap());

        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_hello_scenario_across_sync() {
        // Alice posts "hello" (topic tech); Bob follows Alice; after
        // sync, Bob's home feed contains exactly that one item.
        let mesh = MemoryMesh::new();
        let (alice, alice_peer, _da) = spawn(&mesh, 1);
        let (bob, bob_peer, _db) = spawn(&mesh, 2);
        alice.start().unwrap();
        bob.start().unwrap();

        let post = alice.post("hello", "tech").unwrap();
        bob.follow(alice.author()).unwrap();

        mesh.connect(alice_peer, bob_peer);
        wait_until(|| {
            bob.feed()
                .feed_items()
                .iter()
                .any(|item| item.id == post.id)
        })
        .await;

        let items = bob.feed().feed_items();
        let from_alice: Vec<_> = items
            .iter()
            .filter(|item| item.author == alice.author())
            .collect();
        assert_eq!(from_alice.len(), 1);
        assert_eq!(from_alice[0].text, "hello");
        assert_eq!(from_alice[0].timestamp, post.timestamp);

        alice.stop().await.unwrap();
        bob.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_topic_feed_scenario_without_follow() {
        // Bob does not follow Alice but reads the "general" topic feed.
        let mesh = MemoryMesh::new();
        let (alice, alice_peer, _da) = spawn(&mesh, 1);
        let (bob, bob_peer, _db) = spawn(&mesh, 2);
        alice.start().unwrap();
        bob.start().unwrap();

        let first = alice.post("first", "").unwrap();
        let second = alice.post("second", "").unwrap();

        mesh.connect(alice_peer, bob_peer);
        wait_until(|| {
            bob.feed().refresh_topic_feed("general").unwrap();
            bob.feed().feed_items().len() == 2
        })
        .await;

        let items = bob.feed().feed_items();
        // Newest first; same-millisecond posts fall back to id order
        if first.timestamp != second.timestamp {
            assert_eq!(items[0].text, "second");
            assert_eq!(items[1].text, "first");
        }
        assert!(items[0].timestamp >= items[1].timestamp);

        alice.stop().await.unwrap();
        bob.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_profile_projection_syncs() {
        let mesh = MemoryMesh::new();
        let (alice, alice_peer, _da) = spawn(&mesh, 1);
        let (bob, bob_peer, _db) = spawn(&mesh, 2);
        alice.start().unwrap();
        bob.start().unwrap();

        alice.set_profile("Alice", "event log enthusiast").unwrap();

        mesh.connect(alice_peer, bob_peer);
        wait_until(|| {
            bob.store
                .profile(&alice.author())
                .map(|p| p.is_some())
                .unwrap_or(false)
        })
        .await;

        alice.stop().await.unwrap();
        bob.stop().await.unwrap();
    }
}
