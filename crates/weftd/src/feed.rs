//! Derived feed projections
//!
//! Two projections over the event log:
//! - Home feed: posts authored by the owner plus posts authored by anyone
//!   the owner currently follows, descending by (timestamp, id).
//! - Topic feed: posts whose normalized topic equals the active filter,
//!   independent of follow state.
//!
//! Both are fully rebuildable caches with no independent source of truth.
//! Observers receive the complete current snapshot (never a diff) at
//! registration time and after every mutating operation.

use crate::graph::FollowGraph;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;
use weft_core::canonical::normalize_topic;
use weft_core::{Author, Event, EventBody, EventId};
use weft_store::{Store, StoreError};

/// One renderable feed entry, derived from a Post event.
#[derive(Clone, Debug, PartialEq)]
pub struct FeedItem {
    pub id: EventId,
    pub author: Author,
    pub text: String,
    pub topic: String,
    pub timestamp: u64,
}

impl FeedItem {
    /// Derive from an event; None for non-post events.
    pub fn from_event(event: &Event) -> Option<Self> {
        match &event.body {
            EventBody::Post { text, topic } => Some(Self {
                id: event.id,
                author: event.author,
                text: text.clone(),
                topic: topic.clone(),
                timestamp: event.timestamp,
            }),
            _ => None,
        }
    }
}

/// Handle returned by [`FeedEngine::subscribe`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observer callback. Receives the full current snapshot of the active
/// projection. An `Err` is logged and does not affect other observers.
pub type FeedCallback = Box<dyn Fn(&[FeedItem]) -> anyhow::Result<()> + Send + Sync>;

#[derive(Default)]
struct FeedState {
    home: Vec<FeedItem>,
    topic_feed: Vec<FeedItem>,
    /// Normalized topic filter; None serves the home feed.
    active_topic: Option<String>,
}

/// Feed engine deriving ordered views from the store and follow graph.
pub struct FeedEngine {
    store: Arc<Store>,
    graph: FollowGraph,
    owner: Author,
    state: RwLock<FeedState>,
    subscribers: RwLock<Vec<(SubscriptionId, FeedCallback)>>,
    next_subscription: AtomicU64,
}

impl FeedEngine {
    pub fn new(store: Arc<Store>, owner: Author) -> Self {
        Self {
            graph: FollowGraph::new(store.clone()),
            store,
            owner,
            state: RwLock::new(FeedState::default()),
            subscribers: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
        }
    }

    /// Snapshot of whichever projection is active (home by default,
    /// topic feed while a filter is set).
    pub fn feed_items(&self) -> Vec<FeedItem> {
        let state = self.state.read();
        if state.active_topic.is_some() {
            state.topic_feed.clone()
        } else {
            state.home.clone()
        }
    }

    /// Full recompute of the home feed: per-author query, union, sort.
    pub fn refresh(&self) -> Result<(), StoreError> {
        let mut authors = self.graph.following(&self.owner)?;
        authors.push(self.owner);

        let mut home = Vec::new();
        for author in authors {
            for event in self.store.list_by_author(&author, None)? {
                if let Some(item) = FeedItem::from_event(&event) {
                    home.push(item);
                }
            }
        }
        sort_descending(&mut home);

        self.state.write().home = home;
        self.notify();
        Ok(())
    }

    /// Full recompute of the topic projection and make it the served view.
    pub fn refresh_topic_feed(&self, topic: &str) -> Result<(), StoreError> {
        let topic = normalize_topic(topic);
        let mut items = Vec::new();
        for event in self.store.list_by_topic(&topic, None)? {
            if let Some(item) = FeedItem::from_event(&event) {
                items.push(item);
            }
        }

        {
            let mut state = self.state.write();
            state.topic_feed = items;
            state.active_topic = Some(topic);
        }
        self.notify();
        Ok(())
    }

    /// Toggle which projection [`feed_items`](Self::feed_items) serves.
    /// Setting a topic recomputes that topic's projection.
    pub fn set_topic_filter(&self, topic: Option<&str>) -> Result<(), StoreError> {
        match topic {
            Some(topic) => self.refresh_topic_feed(topic),
            None => {
                {
                    let mut state = self.state.write();
                    state.active_topic = None;
                    state.topic_feed.clear();
                }
                self.notify();
                Ok(())
            }
        }
    }

    /// Incrementally fold one event into the projections.
    ///
    /// Home feed: if the post qualifies (own or currently-followed author)
    /// and is not already present, insert at its sorted position. Topic
    /// feed: if the normalized topic matches the active filter, prepend
    /// newest-first without a full re-sort.
    pub fn add_event(&self, event: &Event) -> Result<(), StoreError> {
        let Some(item) = FeedItem::from_event(event) else {
            return Ok(());
        };

        let qualifies_home = item.author == self.owner
            || self.graph.is_following(&self.owner, &item.author)?;

        let mut changed = false;
        {
            let mut state = self.state.write();

            if qualifies_home && !state.home.iter().any(|i| i.id == item.id) {
                state.home.push(item.clone());
                sort_descending(&mut state.home);
                changed = true;
            }

            if state.active_topic.as_deref() == Some(item.topic.as_str())
                && !state.topic_feed.iter().any(|i| i.id == item.id)
            {
                state.topic_feed.insert(0, item);
                changed = true;
            }
        }

        if changed {
            self.notify();
        }
        Ok(())
    }

    /// Register an observer. The callback fires synchronously with the
    /// current snapshot before this returns, and again after every
    /// mutating operation.
    pub fn subscribe(&self, callback: FeedCallback) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        let snapshot = self.feed_items();
        if let Err(e) = callback(&snapshot) {
            warn!(subscription = id.0, "feed observer failed: {e:#}");
        }
        self.subscribers.write().push((id, callback));
        id
    }

    /// Remove an observer. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.write().retain(|(sub_id, _)| *sub_id != id);
    }

    /// Deliver the current snapshot to every observer. One observer's
    /// failure never prevents delivery to the rest.
    fn notify(&self) {
        let snapshot = self.feed_items();
        for (id, callback) in self.subscribers.read().iter() {
            if let Err(e) = callback(&snapshot) {
                warn!(subscription = id.0, "feed observer failed: {e:#}");
            }
        }
    }
}

/// Descending by timestamp, ties broken by id, matching store ordering.
fn sort_descending(items: &mut [FeedItem]) {
    items.sort_by(|a, b| (b.timestamp, b.id).cmp(&(a.timestamp, a.id)));
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::tempdir;
    use weft_core::{create_follow, create_post, create_profile, Identity};

    fn setup(owner: &Identity) -> (FeedEngine, Arc<Store>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let feed = FeedEngine::new(store.clone(), owner.author());
        (feed, store, dir)
    }

    fn alice() -> Identity {
        Identity::from_seed(&[1u8; 32])
    }

    fn bob() -> Identity {
        Identity::from_seed(&[2u8; 32])
    }

    #[test]
    fn test_home_feed_own_and_followed() {
        let b = bob();
        let (feed, store, _dir) = setup(&b);
        let a = alice();
        let carol = Identity::from_seed(&[3u8; 32]);

        store.put(&create_post(&a, "from alice", "general", 1000).unwrap()).unwrap();
        store.put(&create_post(&b, "from bob", "general", 2000).unwrap()).unwrap();
        store.put(&create_post(&carol, "from carol", "general", 3000).unwrap()).unwrap();
        store.put(&create_follow(&b, a.author(), None, 500).unwrap()).unwrap();

        feed.refresh().unwrap();
        let items = feed.feed_items();
        let texts: Vec<&str> = items.iter().map(|i| i.text.as_str()).collect();
        // Carol is not followed; newest first
        assert_eq!(texts, vec!["from bob", "from alice"]);
    }

    #[test]
    fn test_feed_ordering_non_increasing() {
        let a = alice();
        let (feed, store, _dir) = setup(&a);
        for ts in [3000u64, 1000, 5000, 2000] {
            store
                .put(&create_post(&a, &format!("p{ts}"), "general", ts).unwrap())
                .unwrap();
        }
        feed.refresh().unwrap();

        let items = feed.feed_items();
        assert!(items.windows(2).all(|w| w[0].timestamp >= w[1].timestamp));
    }

    #[test]
    fn test_add_event_sorted_insert_and_dedup() {
        let a = alice();
        let (feed, store, _dir) = setup(&a);
        store.put(&create_post(&a, "old", "general", 1000).unwrap()).unwrap();
        store.put(&create_post(&a, "newest", "general", 3000).unwrap()).unwrap();
        feed.refresh().unwrap();

        let mid = create_post(&a, "middle", "general", 2000).unwrap();
        store.put(&mid).unwrap();
        feed.add_event(&mid).unwrap();
        feed.add_event(&mid).unwrap();

        let texts: Vec<String> = feed.feed_items().iter().map(|i| i.text.clone()).collect();
        assert_eq!(texts, vec!["newest", "middle", "old"]);
    }

    #[test]
    fn test_add_event_ignores_unfollowed_and_non_posts() {
        let b = bob();
        let (feed, store, _dir) = setup(&b);
        let a = alice();

        let post = create_post(&a, "stranger", "general", 1000).unwrap();
        store.put(&post).unwrap();
        feed.add_event(&post).unwrap();
        assert!(feed.feed_items().is_empty());

        let profile = create_profile(&b, "Bob", "", 2000).unwrap();
        store.put(&profile).unwrap();
        feed.add_event(&profile).unwrap();
        assert!(feed.feed_items().is_empty());
    }

    #[test]
    fn test_topic_feed_prepend_independent_of_follow() {
        let b = bob();
        let (feed, store, _dir) = setup(&b);
        let a = alice();

        store.put(&create_post(&a, "first", "Tech", 1000).unwrap()).unwrap();
        feed.set_topic_filter(Some("tech")).unwrap();
        assert_eq!(feed.feed_items().len(), 1);

        let newer = create_post(&a, "second", "tech", 2000).unwrap();
        store.put(&newer).unwrap();
        feed.add_event(&newer).unwrap();

        let items = feed.feed_items();
        assert_eq!(items[0].text, "second");
        assert_eq!(items[1].text, "first");

        // Dropping the filter serves the home feed again
        feed.set_topic_filter(None).unwrap();
        assert!(feed.feed_items().is_empty());
    }

    #[test]
    fn test_topic_scenario_general_default() {
        // Alice posts "first" then "second" on the default topic; Bob does
        // not follow her but reads the "general" topic feed.
        let b = bob();
        let (feed, store, _dir) = setup(&b);
        let a = alice();

        store.put(&create_post(&a, "first", "", 1000).unwrap()).unwrap();
        store.put(&create_post(&a, "second", "", 2000).unwrap()).unwrap();

        feed.refresh_topic_feed("general").unwrap();
        let items = feed.feed_items();
        let texts: Vec<&str> = items.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(texts, vec!["second", "first"]);
    }

    #[test]
    fn test_subscribe_snapshot_and_notifications() {
        let a = alice();
        let (feed, store, _dir) = setup(&a);
        store.put(&create_post(&a, "existing", "general", 1000).unwrap()).unwrap();
        feed.refresh().unwrap();

        let seen: Arc<Mutex<Vec<usize>>> = Arc::new(Mutex::new(Vec::new()));
        let seen_cb = seen.clone();
        let sub = feed.subscribe(Box::new(move |items| {
            seen_cb.lock().push(items.len());
            Ok(())
        }));

        // Immediate snapshot at registration
        assert_eq!(*seen.lock(), vec![1]);

        let newer = create_post(&a, "new", "general", 2000).unwrap();
        store.put(&newer).unwrap();
        feed.add_event(&newer).unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);

        feed.unsubscribe(sub);
        feed.unsubscribe(sub); // idempotent
        feed.refresh().unwrap();
        assert_eq!(*seen.lock(), vec![1, 2]);
    }

    #[test]
    fn test_failing_observer_does_not_block_others() {
        let a = alice();
        let (feed, store, _dir) = setup(&a);

        feed.subscribe(Box::new(|_| anyhow::bail!("observer crashed")));
        let seen: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let seen_cb = seen.clone();
        feed.subscribe(Box::new(move |_| {
            *seen_cb.lock() += 1;
            Ok(())
        }));

        let post = create_post(&a, "x", "general", 1000).unwrap();
        store.put(&post).unwrap();
        feed.add_event(&post).unwrap();

        // Registration snapshot + one mutation
        assert_eq!(*seen.lock(), 2);
    }
}
