//! # Family Lifecycle
//!
//! Create, join and leave a shared family list. Joining and leaving adjust the
//! member counter atomically in the store; leaving as the last member deletes
//! the shared document instead of decrementing.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    error::AppError,
    models::{FamilyDoc, Rev},
    store::{JoinOutcome, LeaveOutcome},
    sync::{FamilyInfo, SyncBridge},
};

/// Short join code: the first segment of a UUIDv4, enough for a family-sized
/// namespace while staying typeable from a phone.
pub fn short_code() -> String {
    let id = Uuid::new_v4().to_string();
    id.split('-').next().expect("uuid has segments").to_string()
}

pub fn join_url(base_url: &str, code: &str) -> String {
    format!("{}/join-family/{code}", base_url.trim_end_matches('/'))
}

impl SyncBridge {
    /// Create a new family seeded with the current local list and favorites.
    /// The creator is the first member. Returns the join code.
    pub async fn create_family(&self, name: &str) -> Result<String, AppError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(AppError::MalformedPayload);
        }
        if self.session.lock().await.is_some() {
            return Err(AppError::AlreadyInFamily);
        }

        let code = short_code();
        let snapshot = self.snapshot();
        let doc = FamilyDoc {
            id: code.clone(),
            name: name.to_string(),
            members: 1,
            shopping_list: snapshot.products,
            favorites: snapshot.favorites,
            rev: Rev {
                writer: self.writer,
                seq: 0,
            },
        };
        self.store.write(&code, &doc).await?;
        info!("Created family {code}");

        self.adopt(&code, &doc);
        self.settings.update(|s| {
            s.family_id = Some(code.clone());
            s.family_name = Some(doc.name.clone());
        });
        self.attach_session(code.clone(), 0).await;

        Ok(code)
    }

    /// Join an existing family by code. The remote document wins over the
    /// local cache; the local list stays cached for when the family is left.
    pub async fn join_family(&self, code: &str) -> Result<FamilyInfo, AppError> {
        let code = code.trim();
        if code.is_empty() {
            return Err(AppError::MalformedPayload);
        }
        if self.session.lock().await.is_some() {
            return Err(AppError::AlreadyInFamily);
        }

        match self.store.join(code).await? {
            JoinOutcome::NotFound => Err(AppError::FamilyNotFound),
            JoinOutcome::Joined(doc) => {
                info!("Joined family {code} as member {}", doc.members);

                self.adopt(code, &doc);
                self.settings.update(|s| {
                    s.family_id = Some(code.to_string());
                    s.family_name = Some(doc.name.clone());
                });
                self.attach_session(code.to_string(), doc.rev.seq).await;

                Ok(FamilyInfo {
                    code: code.to_string(),
                    name: doc.name,
                    members: doc.members,
                })
            }
        }
    }

    /// Leave the current family. Pending debounced edits are flushed first so
    /// the remaining members keep them. Leaving as the last member deletes the
    /// shared document; either way the list lives on in the local cache.
    pub async fn leave_family(&self) -> Result<LeaveOutcome, AppError> {
        let Some(session) = self.session.lock().await.take() else {
            return Err(AppError::NotInFamily);
        };
        session.subscriber.abort();
        session.pusher.abort();

        if let Err(e) = self.push(&session.code, &session.dirty, &session.seq).await {
            warn!("Final push before leaving family {} failed: {e}", session.code);
        }

        // The session is already gone; an unreachable store must not strand
        // the bridge claiming membership with no sync running.
        let outcome = match self.store.leave(&session.code).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(
                    "Leaving family {} failed at the store, detaching locally: {e}",
                    session.code
                );
                self.detach_to_local_mode();
                return Err(e);
            }
        };
        match outcome {
            LeaveOutcome::Deleted => info!("Left family {} as last member, deleted", session.code),
            LeaveOutcome::Remaining(n) => {
                info!("Left family {}, {n} members remain", session.code)
            }
            LeaveOutcome::NotFound => debug!("Family {} was already gone", session.code),
        }

        self.detach_to_local_mode();
        Ok(outcome)
    }

    /// Re-attach to the family recorded in settings, typically at startup.
    /// Membership is not incremented; this process already counts as a member.
    pub async fn resume(&self) {
        let Some(code) = self.settings.get().family_id else {
            return;
        };

        match self.store.read(&code).await {
            Ok(Some(doc)) => {
                info!("Re-attaching to family {code}");
                self.adopt(&code, &doc);
                self.settings
                    .update(|s| s.family_name = Some(doc.name.clone()));
                self.attach_session(code, doc.rev.seq).await;
            }
            Ok(None) => {
                warn!("Cached family {code} no longer exists");
                self.settings.update(|s| {
                    s.family_id = None;
                    s.family_name = None;
                });
            }
            Err(e) => warn!("Could not reach the store to resume family {code}: {e}"),
        }
    }

    fn detach_to_local_mode(&self) {
        self.clear_family();
        let snapshot = self.snapshot();
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
    use std::{sync::Arc, time::Duration};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use super::*;
    use crate::{
        cache::{LocalCache, SettingsHandle},
        models::Product,
        store::{DocumentPatch, DocumentStore, MemoryStore, Subscription},
    };

    fn bridge_with(store: Arc<MemoryStore>) -> (Arc<SyncBridge>, Arc<LocalCache>, TempDir) {
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(LocalCache::new(dir.path()));
        let settings = Arc::new(SettingsHandle::load(cache.clone()));
        let bridge = SyncBridge::new(store, cache.clone(), settings, Duration::from_millis(400));
        (bridge, cache, dir)
    }

    fn seeded_doc(code: &str) -> FamilyDoc {
        FamilyDoc {
            id: code.to_string(),
            name: "casa".to_string(),
            members: 1,
            shopping_list: vec![Product::new("queso", String::new())],
            favorites: Vec::new(),
            rev: Rev::default(),
        }
    }

    #[test]
    fn short_codes_are_one_uuid_segment() {
        let code = short_code();
        assert_eq!(code.len(), 8);
        assert!(code.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(short_code(), code);
    }

    #[test]
    fn join_urls_do_not_double_slash() {
        assert_eq!(
            join_url("http://localhost:4000/", "ab12cd34"),
            "http://localhost:4000/join-family/ab12cd34"
        );
        assert_eq!(
            join_url("https://grocer.example", "ab12cd34"),
            "https://grocer.example/join-family/ab12cd34"
        );
    }

    #[tokio::test]
    async fn create_seeds_the_document_with_the_local_list() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, cache, _dir) = bridge_with(store.clone());

        bridge
            .add_product(Product::new("milk", String::new()))
            .await;
        let code = bridge.create_family("home").await.unwrap();

        let doc = store.read(&code).await.unwrap().unwrap();
        assert_eq!(doc.members, 1);
        assert_eq!(doc.name, "home");
        assert_eq!(doc.shopping_list.len(), 1);

        let settings = cache.load_settings();
        assert_eq!(settings.family_id.as_deref(), Some(code.as_str()));
        assert_eq!(settings.family_name.as_deref(), Some("home"));

        let family = bridge.snapshot().family.unwrap();
        assert_eq!(family.members, 1);
    }

    #[tokio::test]
    async fn create_rejects_blank_names_and_double_membership() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, _cache, _dir) = bridge_with(store);

        assert!(matches!(
            bridge.create_family("   ").await,
            Err(AppError::MalformedPayload)
        ));

        bridge.create_family("home").await.unwrap();
        assert!(matches!(
            bridge.create_family("other").await,
            Err(AppError::AlreadyInFamily)
        ));
    }

    #[tokio::test]
    async fn join_adopts_the_remote_document() {
        let store = Arc::new(MemoryStore::default());
        store.write("ab12cd34", &seeded_doc("ab12cd34")).await.unwrap();

        let (bridge, _cache, _dir) = bridge_with(store);
        bridge
            .add_product(Product::new("local-only", String::new()))
            .await;

        let info = bridge.join_family("ab12cd34").await.unwrap();
        assert_eq!(info.members, 2);
        assert_eq!(info.name, "casa");

        // Remote wins over the local list.
        let state = bridge.snapshot();
        assert_eq!(state.products.len(), 1);
        assert_eq!(state.products[0].name, "queso");
    }

    #[tokio::test]
    async fn join_unknown_code_leaves_state_untouched() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, cache, _dir) = bridge_with(store);

        assert!(matches!(
            bridge.join_family("zzzzzzzz").await,
            Err(AppError::FamilyNotFound)
        ));
        assert!(bridge.snapshot().family.is_none());
        assert!(cache.load_settings().family_id.is_none());
    }

    #[tokio::test]
    async fn leave_without_family_is_an_error() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, _cache, _dir) = bridge_with(store);

        assert!(matches!(
            bridge.leave_family().await,
            Err(AppError::NotInFamily)
        ));
    }

    #[tokio::test]
    async fn last_member_leave_deletes_the_document() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, cache, _dir) = bridge_with(store.clone());

        let code = bridge.create_family("home").await.unwrap();
        let outcome = bridge.leave_family().await.unwrap();

        assert_eq!(outcome, LeaveOutcome::Deleted);
        assert!(store.read(&code).await.unwrap().is_none());
        assert!(cache.load_settings().family_id.is_none());
    }

    struct LeaveFailsStore {
        inner: MemoryStore,
    }

    #[async_trait]
    impl DocumentStore for LeaveFailsStore {
        async fn read(&self, code: &str) -> Result<Option<FamilyDoc>, AppError> {
            self.inner.read(code).await
        }
        async fn write(&self, code: &str, doc: &FamilyDoc) -> Result<(), AppError> {
            self.inner.write(code, doc).await
        }
        async fn merge(&self, code: &str, patch: DocumentPatch) -> Result<bool, AppError> {
            self.inner.merge(code, patch).await
        }
        async fn join(&self, code: &str) -> Result<JoinOutcome, AppError> {
            self.inner.join(code).await
        }
        async fn leave(&self, _code: &str) -> Result<LeaveOutcome, AppError> {
            Err(AppError::Store(std::io::Error::other("redis down").into()))
        }
        async fn subscribe(&self, code: &str) -> Result<Subscription, AppError> {
            self.inner.subscribe(code).await
        }
    }

    #[tokio::test]
    async fn leave_detaches_locally_when_the_store_errs() {
        let store = Arc::new(LeaveFailsStore {
            inner: MemoryStore::default(),
        });
        let dir = TempDir::new().unwrap();
        let cache = Arc::new(LocalCache::new(dir.path()));
        let settings = Arc::new(SettingsHandle::load(cache.clone()));
        let bridge = SyncBridge::new(store, cache, settings, Duration::from_millis(400));

        bridge.create_family("home").await.unwrap();
        assert!(matches!(
            bridge.leave_family().await,
            Err(AppError::Store(_))
        ));

        // Not stranded: state and settings are back in local mode, and a
        // retry reports the membership as already gone.
        assert!(bridge.snapshot().family.is_none());
        assert!(bridge.settings.get().family_id.is_none());
        assert!(matches!(
            bridge.leave_family().await,
            Err(AppError::NotInFamily)
        ));
    }

    #[tokio::test]
    async fn resume_reattaches_from_settings() {
        let store = Arc::new(MemoryStore::default());
        store.write("ab12cd34", &seeded_doc("ab12cd34")).await.unwrap();

        let (bridge, _cache, _dir) = bridge_with(store.clone());
        bridge.settings.update(|s| {
            s.family_id = Some("ab12cd34".to_string());
        });

        bridge.resume().await;

        let family = bridge.snapshot().family.unwrap();
        assert_eq!(family.code, "ab12cd34");
        assert_eq!(family.members, 1);
        assert_eq!(
            bridge.settings.get().family_name.as_deref(),
            Some("casa")
        );
    }

    #[tokio::test]
    async fn resume_clears_a_stale_family_id() {
        let store = Arc::new(MemoryStore::default());
        let (bridge, _cache, _dir) = bridge_with(store);
        bridge.settings.update(|s| {
            s.family_id = Some("gone".to_string());
            s.family_name = Some("old".to_string());
        });

        bridge.resume().await;

        assert!(bridge.snapshot().family.is_none());
        let settings = bridge.settings.get();
        assert!(settings.family_id.is_none());
        assert!(settings.family_name.is_none());
    }
}
