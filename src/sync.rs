//! # Sync Bridge
//!
//! Reconciles the in-memory shopping list with the shared family document.
//!
//! Local mutations apply optimistically and immediately; while a family is
//! active they are pushed remotely after a short quiet period, so a burst of
//! edits becomes one merge-write instead of many. A subscription task mirrors
//! every remote change back into local state. Writes carry a per-process
//! writer id in the document's `rev` field, so echoes of our own pushes are
//! not mirrored back over newer local state.
//!
//! Outside a family every mutation persists straight to the local cache and no
//! network traffic happens at all.
use std::sync::{
    Arc, Weak,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use serde::Serialize;
use tokio::{
    sync::{Mutex, mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    cache::{LocalCache, SettingsHandle},
    error::AppError,
    models::{FamilyDoc, Product, Rev, sort_products},
    store::{DocEvent, DocumentPatch, DocumentStore, Subscription},
};

/// Snapshot of everything a client renders: the list, the favorites and the
/// family membership, if any.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ListState {
    pub products: Vec<Product>,
    pub favorites: Vec<Product>,
    pub family: Option<FamilyInfo>,
}

#[derive(Clone, Debug, Serialize)]
pub struct FamilyInfo {
    pub code: String,
    pub name: String,
    pub members: u32,
}

pub(crate) struct Session {
    pub code: String,
    pub push_tx: mpsc::UnboundedSender<()>,
    pub dirty: Arc<AtomicBool>,
    pub seq: Arc<AtomicU64>,
    pub pusher: JoinHandle<()>,
    pub subscriber: JoinHandle<()>,
}

pub struct SyncBridge {
    tx: watch::Sender<ListState>,
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) cache: Arc<LocalCache>,
    pub(crate) settings: Arc<SettingsHandle>,
    pub(crate) writer: Uuid,
    debounce: Duration,
    pub(crate) session: Mutex<Option<Session>>,
    // Handle to ourselves for the session tasks.
    weak: Weak<Self>,
}

impl SyncBridge {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        cache: Arc<LocalCache>,
        settings: Arc<SettingsHandle>,
        debounce: Duration,
    ) -> Arc<Self> {
        let initial = ListState {
            products: cache.load_list(),
            favorites: cache.load_favorites(),
            family: None,
        };
        let (tx, _) = watch::channel(initial);

        Arc::new_cyclic(|weak| Self {
            tx,
            store,
            cache,
            settings,
            writer: Uuid::new_v4(),
            debounce,
            session: Mutex::new(None),
            weak: weak.clone(),
        })
    }

    pub fn watch(&self) -> watch::Receiver<ListState> {
        self.tx.subscribe()
    }

    pub fn snapshot(&self) -> ListState {
        self.tx.borrow().clone()
    }

    pub async fn add_product(&self, product: Product) {
        self.tx.send_modify(|s| {
            s.products.insert(0, product);
            sort_products(&mut s.products);
        });
        self.after_change().await;
    }

    pub async fn add_products(&self, products: Vec<Product>) {
        if products.is_empty() {
            return;
        }
        self.tx.send_modify(|s| {
            let mut merged = products;
            merged.append(&mut s.products);
            sort_products(&mut merged);
            s.products = merged;
        });
        self.after_change().await;
    }

    pub async fn toggle_bought(&self, id: Uuid) -> bool {
        let mut found = false;
        self.tx.send_modify(|s| {
            if let Some(p) = s.products.iter_mut().find(|p| p.id == id) {
                p.bought = !p.bought;
                found = true;
            }
            sort_products(&mut s.products);
        });
        if found {
            self.after_change().await;
        }
        found
    }

    pub async fn remove_product(&self, id: Uuid) -> bool {
        let mut found = false;
        self.tx.send_modify(|s| {
            let before = s.products.len();
            s.products.retain(|p| p.id != id);
            found = s.products.len() != before;
        });
        if found {
            self.after_change().await;
        }
        found
    }

    pub async fn clear(&self) {
        self.tx.send_modify(|s| s.products.clear());
        self.after_change().await;
    }

    /// Returns whether the product is a favorite after the toggle. Favorites
    /// are never stored as bought.
    pub async fn toggle_favorite(&self, product: Product) -> bool {
        let mut now_favorite = false;
        self.tx.send_modify(|s| {
            if let Some(pos) = s.favorites.iter().position(|f| f.id == product.id) {
                s.favorites.remove(pos);
            } else {
                let mut favorite = product;
                favorite.bought = false;
                s.favorites.push(favorite);
                now_favorite = true;
            }
        });
        self.after_change().await;
        now_favorite
    }

    async fn after_change(&self) {
        let session = self.session.lock().await;
        let snapshot = self.tx.borrow().clone();

        match session.as_ref() {
            Some(session) => {
                session.dirty.store(true, Ordering::SeqCst);
                let _ = session.push_tx.send(());
                // Favorites keep writing through locally for a seamless
                // transition when the family is left.
                self.cache.store_favorites(&snapshot.favorites);
            }
            None => {
                self.cache.store_list(&snapshot.products);
                self.cache.store_favorites(&snapshot.favorites);
            }
        }
    }

    pub(crate) async fn attach_session(&self, code: String, seq_start: u64) {
        let this = self.weak.upgrade().expect("bridge alive while attaching");
        let (push_tx, push_rx) = mpsc::unbounded_channel();
        let dirty = Arc::new(AtomicBool::new(false));
        let seq = Arc::new(AtomicU64::new(seq_start));

        // Subscribe before anything is spawned: an event published right
        // after attaching must not fall between the session being live and
        // the subscription existing. A deletion in that gap never repeats.
        let subscription = self.store.subscribe(&code).await;

        let pusher = tokio::spawn(this.clone().run_pusher(
            code.clone(),
            push_rx,
            dirty.clone(),
            seq.clone(),
        ));
        let subscriber = match subscription {
            Ok(sub) => tokio::spawn(this.run_subscriber(code.clone(), sub)),
            Err(e) => {
                warn!("Failed to subscribe to family {code}: {e}");
                tokio::spawn(std::future::ready(()))
            }
        };

        *self.session.lock().await = Some(Session {
            code,
            push_tx,
            dirty,
            seq,
            pusher,
            subscriber,
        });
    }

    async fn run_pusher(
        self: Arc<Self>,
        code: String,
        mut rx: mpsc::UnboundedReceiver<()>,
        dirty: Arc<AtomicBool>,
        seq: Arc<AtomicU64>,
    ) {
        while rx.recv().await.is_some() {
            // Coalesce: keep resetting the timer while edits stream in.
            loop {
                match tokio::time::timeout(self.debounce, rx.recv()).await {
                    Ok(Some(())) => continue,
                    Ok(None) | Err(_) => break,
                }
            }

            if let Err(e) = self.push(&code, &dirty, &seq).await {
                warn!("Debounced push for family {code} failed: {e}");
            }
        }
    }

    pub(crate) async fn push(
        &self,
        code: &str,
        dirty: &AtomicBool,
        seq: &AtomicU64,
    ) -> Result<(), AppError> {
        if !dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let snapshot = self.tx.borrow().clone();
        let rev = Rev {
            writer: self.writer,
            seq: seq.fetch_add(1, Ordering::SeqCst) + 1,
        };
        let patch = DocumentPatch {
            shopping_list: Some(snapshot.products),
            favorites: Some(snapshot.favorites),
            name: None,
            rev: Some(rev),
        };

        #[cfg(feature = "verbose")]
        info!("Pushing rev {} for family {code}", rev.seq);

        if !self.store.merge(code, patch).await? {
            debug!("Family {code} disappeared before the push");
        }
        Ok(())
    }

    async fn run_subscriber(self: Arc<Self>, code: String, mut sub: Subscription) {
        while let Some(event) = sub.recv().await {
            match event {
                DocEvent::Changed(doc) => self.mirror(doc),
                DocEvent::Deleted => {
                    info!("Family {code} was dissolved remotely");
                    self.handle_remote_delete(&code).await;
                    return;
                }
            }
        }
    }

    /// Replace local state with a remote document (join, create, resume).
    pub(crate) fn adopt(&self, code: &str, doc: &FamilyDoc) {
        self.tx.send_modify(|s| {
            let mut products = doc.shopping_list.clone();
            sort_products(&mut products);
            s.products = products;
            s.favorites = doc.favorites.clone();
            s.family = Some(FamilyInfo {
                code: code.to_string(),
                name: doc.name.clone(),
                members: doc.members,
            });
        });
    }

    pub(crate) fn clear_family(&self) {
        self.tx.send_modify(|s| s.family = None);
    }

    fn mirror(&self, doc: FamilyDoc) {
        let own_write = doc.rev.writer == self.writer;

        #[cfg(feature = "verbose")]
        info!("Mirroring rev {} (own write: {own_write})", doc.rev.seq);
        self.tx.send_modify(|s| {
            if let Some(family) = &mut s.family {
                family.members = doc.members;
                family.name = doc.name.clone();
            }
            // Echoes of our own pushes carry state we already have, and our
            // local copy may be newer; only the membership fields above can
            // have changed underneath them.
            if !own_write {
                let mut products = doc.shopping_list;
                sort_products(&mut products);
                s.products = products;
                s.favorites = doc.favorites;
            }
        });
    }

    /// Another member deleted the document out from under us. Fall back to
    /// local mode, keeping the current list.
    async fn handle_remote_delete(&self, code: &str) {
        let mut guard = self.session.lock().await;
        if !guard.as_ref().is_some_and(|s| s.code == code) {
            return;
        }
        let session = guard.take().expect("session checked above");
        drop(guard);
        session.pusher.abort();

        self.clear_family();
        let snapshot = self.tx.borrow().clone();
        self.cache.store_list(&snapshot.products);
        self.cache.store_favorites(&snapshot.favorites);
        self.settings.update(|s| {
            s.family_id = None;
            s.family_name = None;
        });
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::store::{LeaveOutcome, MemoryStore};

    fn bridge_with(store: Arc<MemoryStore>) -> (Arc<SyncBridge>, TempDir) {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(LocalCache::new(dir.path()));
        let settings = Arc::new(SettingsHandle::load(cache.clone()));
        let bridge = SyncBridge::new(store, cache, settings, Duration::from_millis(400));
        (bridge, dir)
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_edits_coalesce_into_one_write() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, _dir) = bridge_with(store.clone());

        let code = bridge.create_family("home").await.unwrap();

        for name in ["milk", "eggs", "bread"] {
            bridge.add_product(Product::new(name, String::new())).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(
            store.merge_calls.load(Ordering::Relaxed),
            1,
            "three edits within the debounce window must produce one write"
        );
        let doc = store.read(&code).await.unwrap().unwrap();
        assert_eq!(doc.shopping_list.len(), 3);
        assert_eq!(doc.rev.writer, bridge.writer);
    }

    #[tokio::test(start_paused = true)]
    async fn separate_bursts_produce_separate_writes() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, _dir) = bridge_with(store.clone());

        bridge.create_family("home").await.unwrap();

        bridge
            .add_product(Product::new("milk", String::new()))
            .await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        bridge
            .add_product(Product::new("eggs", String::new()))
            .await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        assert_eq!(store.merge_calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn members_converge_on_the_last_write() {
        let store = Arc::new(MemoryStore::default());
        let (alice, _dir_a) = bridge_with(store.clone());
        let (bob, _dir_b) = bridge_with(store.clone());

        let code = alice.create_family("home").await.unwrap();
        bob.join_family(&code).await.unwrap();

        alice
            .add_product(Product::new("milk", String::new()))
            .await;
        tokio::time::sleep(Duration::from_millis(600)).await;

        let bob_state = bob.snapshot();
        assert_eq!(bob_state.products.len(), 1);
        assert_eq!(bob_state.products[0].name, "milk");

        // The join travelled back to the creator via the subscription.
        let alice_state = alice.snapshot();
        assert_eq!(alice_state.family.as_ref().unwrap().members, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn leaving_flushes_the_pending_debounced_push() {
        let store = Arc::new(MemoryStore::default());
        let (alice, _dir_a) = bridge_with(store.clone());
        let (bob, _dir_b) = bridge_with(store.clone());

        let code = alice.create_family("home").await.unwrap();
        bob.join_family(&code).await.unwrap();

        alice
            .add_product(Product::new("milk", String::new()))
            .await;
        // Leave immediately, well before the debounce timer fires.
        let outcome = alice.leave_family().await.unwrap();

        assert_eq!(outcome, LeaveOutcome::Remaining(1));
        let doc = store.read(&code).await.unwrap().unwrap();
        assert_eq!(doc.shopping_list.len(), 1);
        assert!(alice.snapshot().family.is_none());
        // The list survives locally after leaving.
        assert_eq!(alice.cache.load_list().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn remote_dissolution_falls_back_to_local_mode() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, _dir) = bridge_with(store.clone());

        let code = bridge.create_family("home").await.unwrap();
        bridge
            .add_product(Product::new("milk", String::new()))
            .await;

        // The only other path that deletes: the last member elsewhere leaves.
        assert_eq!(store.leave(&code).await.unwrap(), LeaveOutcome::Deleted);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let state = bridge.snapshot();
        assert!(state.family.is_none());
        assert_eq!(state.products.len(), 1);
        assert!(bridge.settings.get().family_id.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dissolution_right_after_attach_is_delivered() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, _dir) = bridge_with(store.clone());

        let code = bridge.create_family("home").await.unwrap();
        // Dissolve before the background tasks have run even once; the
        // subscription must already exist by the time create returns.
        assert_eq!(store.leave(&code).await.unwrap(), LeaveOutcome::Deleted);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(bridge.snapshot().family.is_none());
        assert!(bridge.settings.get().family_id.is_none());
    }

    #[tokio::test]
    async fn local_mode_persists_every_mutation() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, _dir) = bridge_with(store.clone());

        bridge
            .add_product(Product::new("milk", String::new()))
            .await;
        let id = bridge.snapshot().products[0].id;
        bridge.toggle_bought(id).await;

        let cached = bridge.cache.load_list();
        assert_eq!(cached.len(), 1);
        assert!(cached[0].bought);
        assert_eq!(store.merge_calls.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn toggle_bought_moves_item_to_the_bottom() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, _dir) = bridge_with(store);

        bridge
            .add_product(Product::new("milk", String::new()))
            .await;
        bridge
            .add_product(Product::new("eggs", String::new()))
            .await;

        let milk_id = bridge
            .snapshot()
            .products
            .iter()
            .find(|p| p.name == "milk")
            .unwrap()
            .id;
        assert!(bridge.toggle_bought(milk_id).await);

        let names: Vec<String> = bridge
            .snapshot()
            .products
            .iter()
            .map(|p| p.name.clone())
            .collect();
        assert_eq!(names, vec!["eggs", "milk"]);

        assert!(!bridge.toggle_bought(Uuid::new_v4()).await);
    }

    #[tokio::test]
    async fn favorites_are_never_bought() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, _dir) = bridge_with(store);

        let mut product = Product::new("milk", String::new());
        product.bought = true;

        assert!(bridge.toggle_favorite(product.clone()).await);
        let favorites = bridge.snapshot().favorites;
        assert_eq!(favorites.len(), 1);
        assert!(!favorites[0].bought);

        assert!(!bridge.toggle_favorite(product).await);
        assert!(bridge.snapshot().favorites.is_empty());
    }
}
