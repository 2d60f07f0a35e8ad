//! # Document Store
//!
//! The remote side of the sync: named family documents with read, write,
//! merge-write, atomic member counting and change subscriptions.
//!
//! ## Redis layout
//!
//! One hash per family under `family:{code}`:
//! - `id`, `name`, `members` as plain fields (`members` drives HINCRBY)
//! - `shopping_list`, `favorites`, `rev` as JSON blobs
//!
//! Join and leave run as Lua scripts so the existence check, the counter
//! bump and the last-member deletion happen in one atomic step. Every change
//! publishes on `family-events:{code}`; subscribers re-read the hash on each
//! ping, so the pub/sub payload never has to carry the document itself.
use std::{collections::HashMap, sync::atomic::AtomicU64, time::Duration};

use async_trait::async_trait;
use futures::StreamExt;
use redis::{
    AsyncCommands, Client, Script,
    aio::{ConnectionManager, ConnectionManagerConfig},
};
use tokio::{
    sync::{Mutex, broadcast, mpsc},
    task::JoinHandle,
};
use tracing::warn;

use crate::{
    error::AppError,
    models::{FamilyDoc, Product, Rev},
};

const CHANGED: &str = "changed";
const DELETED: &str = "deleted";

const JOIN_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
redis.call('HINCRBY', KEYS[1], 'members', 1)
redis.call('PUBLISH', ARGV[1], 'changed')
return 1
"#;

const LEAVE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return -1
end
local members = redis.call('HINCRBY', KEYS[1], 'members', -1)
if members <= 0 then
  redis.call('DEL', KEYS[1])
  redis.call('PUBLISH', ARGV[1], 'deleted')
  return 0
end
redis.call('PUBLISH', ARGV[1], 'changed')
return members
"#;

const MERGE_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
  return 0
end
for i = 2, #ARGV, 2 do
  redis.call('HSET', KEYS[1], ARGV[i], ARGV[i + 1])
end
redis.call('PUBLISH', ARGV[1], 'changed')
return 1
"#;

fn doc_key(code: &str) -> String {
    format!("family:{code}")
}

fn channel(code: &str) -> String {
    format!("family-events:{code}")
}

#[derive(Clone, Debug, PartialEq)]
pub enum JoinOutcome {
    Joined(FamilyDoc),
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The leaving member was the last one; the document is gone.
    Deleted,
    Remaining(u32),
    NotFound,
}

#[derive(Clone, Debug)]
pub enum DocEvent {
    Changed(FamilyDoc),
    Deleted,
}

/// Live change feed for one family document. Dropping it stops the feed.
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<DocEvent>,
    task: JoinHandle<()>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<DocEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Partial update of a family document. Absent fields are left untouched.
#[derive(Clone, Debug, Default)]
pub struct DocumentPatch {
    pub shopping_list: Option<Vec<Product>>,
    pub favorites: Option<Vec<Product>>,
    pub name: Option<String>,
    pub rev: Option<Rev>,
}

impl DocumentPatch {
    fn is_empty(&self) -> bool {
        self.shopping_list.is_none()
            && self.favorites.is_none()
            && self.name.is_none()
            && self.rev.is_none()
    }

    fn fields(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let mut fields = Vec::new();
        if let Some(list) = &self.shopping_list {
            fields.push(("shopping_list", serde_json::to_string(list)?));
        }
        if let Some(favorites) = &self.favorites {
            fields.push(("favorites", serde_json::to_string(favorites)?));
        }
        if let Some(name) = &self.name {
            fields.push(("name", name.clone()));
        }
        if let Some(rev) = &self.rev {
            fields.push(("rev", serde_json::to_string(rev)?));
        }
        Ok(fields)
    }

    fn apply(&self, doc: &mut FamilyDoc) {
        if let Some(list) = &self.shopping_list {
            doc.shopping_list = list.clone();
        }
        if let Some(favorites) = &self.favorites {
            doc.favorites = favorites.clone();
        }
        if let Some(name) = &self.name {
            doc.name = name.clone();
        }
        if let Some(rev) = &self.rev {
            doc.rev = *rev;
        }
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn read(&self, code: &str) -> Result<Option<FamilyDoc>, AppError>;

    /// Full overwrite, notifying subscribers.
    async fn write(&self, code: &str, doc: &FamilyDoc) -> Result<(), AppError>;

    /// Partial update; returns false when the document no longer exists.
    async fn merge(&self, code: &str, patch: DocumentPatch) -> Result<bool, AppError>;

    /// Atomically increment the member count of an existing family.
    async fn join(&self, code: &str) -> Result<JoinOutcome, AppError>;

    /// Atomically decrement the member count, deleting the document when the
    /// leaving member was the last one.
    async fn leave(&self, code: &str) -> Result<LeaveOutcome, AppError>;

    async fn subscribe(&self, code: &str) -> Result<Subscription, AppError>;
}

pub struct RedisStore {
    conn: ConnectionManager,
    client: Client,
    join_script: Script,
    leave_script: Script,
    merge_script: Script,
}

impl RedisStore {
    /// Startup-time connection; panics on a misconfigured Redis URL.
    pub async fn connect(redis_url: &str) -> Self {
        let config = ConnectionManagerConfig::new()
            .set_number_of_retries(1)
            .set_connection_timeout(Duration::from_millis(100));

        let client = Client::open(redis_url).unwrap();
        let conn = client
            .get_connection_manager_with_config(config)
            .await
            .unwrap();

        Self {
            conn,
            client,
            join_script: Script::new(JOIN_SCRIPT),
            leave_script: Script::new(LEAVE_SCRIPT),
            merge_script: Script::new(MERGE_SCRIPT),
        }
    }
}

async fn read_doc(conn: &mut ConnectionManager, code: &str) -> Result<Option<FamilyDoc>, AppError> {
    let map: HashMap<String, String> = conn.hgetall(doc_key(code)).await?;
    if map.is_empty() {
        return Ok(None);
    }

    Ok(Some(FamilyDoc {
        id: map.get("id").cloned().unwrap_or_else(|| code.to_string()),
        name: map.get("name").cloned().unwrap_or_default(),
        members: map.get("members").and_then(|m| m.parse().ok()).unwrap_or(1),
        shopping_list: map
            .get("shopping_list")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or_default(),
        favorites: map
            .get("favorites")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or_default(),
        rev: map
            .get("rev")
            .map(|raw| serde_json::from_str(raw))
            .transpose()?
            .unwrap_or_default(),
    }))
}

#[async_trait]
impl DocumentStore for RedisStore {
    async fn read(&self, code: &str) -> Result<Option<FamilyDoc>, AppError> {
        let mut conn = self.conn.clone();
        read_doc(&mut conn, code).await
    }

    async fn write(&self, code: &str, doc: &FamilyDoc) -> Result<(), AppError> {
        let mut conn = self.conn.clone();

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.cmd("HSET")
            .arg(doc_key(code))
            .arg("id")
            .arg(&doc.id)
            .arg("name")
            .arg(&doc.name)
            .arg("members")
            .arg(doc.members)
            .arg("shopping_list")
            .arg(serde_json::to_string(&doc.shopping_list)?)
            .arg("favorites")
            .arg(serde_json::to_string(&doc.favorites)?)
            .arg("rev")
            .arg(serde_json::to_string(&doc.rev)?)
            .ignore();
        pipe.cmd("PUBLISH").arg(channel(code)).arg(CHANGED).ignore();

        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }

    async fn merge(&self, code: &str, patch: DocumentPatch) -> Result<bool, AppError> {
        if patch.is_empty() {
            return Ok(true);
        }
        let fields = patch.fields()?;

        let mut conn = self.conn.clone();
        let mut invocation = self.merge_script.prepare_invoke();
        invocation.key(doc_key(code)).arg(channel(code));
        for (field, value) in fields {
            invocation.arg(field).arg(value);
        }

        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(applied == 1)
    }

    async fn join(&self, code: &str) -> Result<JoinOutcome, AppError> {
        let mut conn = self.conn.clone();

        let joined: i64 = self
            .join_script
            .key(doc_key(code))
            .arg(channel(code))
            .invoke_async(&mut conn)
            .await?;
        if joined == 0 {
            return Ok(JoinOutcome::NotFound);
        }

        match read_doc(&mut conn, code).await? {
            Some(doc) => Ok(JoinOutcome::Joined(doc)),
            // Deleted between the increment and the read.
            None => Ok(JoinOutcome::NotFound),
        }
    }

    async fn leave(&self, code: &str) -> Result<LeaveOutcome, AppError> {
        let mut conn = self.conn.clone();

        let remaining: i64 = self
            .leave_script
            .key(doc_key(code))
            .arg(channel(code))
            .invoke_async(&mut conn)
            .await?;

        Ok(match remaining {
            -1 => LeaveOutcome::NotFound,
            0 => LeaveOutcome::Deleted,
            n => LeaveOutcome::Remaining(n as u32),
        })
    }

    async fn subscribe(&self, code: &str) -> Result<Subscription, AppError> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel(code)).await?;

        let mut conn = self.conn.clone();
        let code = code.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            let mut messages = pubsub.on_message();
            while let Some(msg) = messages.next().await {
                let payload: String = msg.get_payload().unwrap_or_default();

                let event = if payload == DELETED {
                    DocEvent::Deleted
                } else {
                    match read_doc(&mut conn, &code).await {
                        Ok(Some(doc)) => DocEvent::Changed(doc),
                        Ok(None) => DocEvent::Deleted,
                        Err(e) => {
                            warn!("Failed to read family {code} after change: {e}");
                            continue;
                        }
                    }
                };

                if tx.send(event).is_err() {
                    break;
                }
            }
        });

        Ok(Subscription { rx, task })
    }
}

/// In-memory store used by the tests and by offline runs. Same semantics as
/// [`RedisStore`]; atomicity comes from the single mutex around the map.
pub struct MemoryStore {
    docs: Mutex<HashMap<String, FamilyDoc>>,
    events: broadcast::Sender<(String, DocEvent)>,
    pub merge_calls: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            docs: Mutex::new(HashMap::new()),
            events,
            merge_calls: AtomicU64::new(0),
        }
    }
}

impl MemoryStore {
    fn notify(&self, code: &str, event: DocEvent) {
        let _ = self.events.send((code.to_string(), event));
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn read(&self, code: &str) -> Result<Option<FamilyDoc>, AppError> {
        Ok(self.docs.lock().await.get(code).cloned())
    }

    async fn write(&self, code: &str, doc: &FamilyDoc) -> Result<(), AppError> {
        self.docs
            .lock()
            .await
            .insert(code.to_string(), doc.clone());
        self.notify(code, DocEvent::Changed(doc.clone()));
        Ok(())
    }

    async fn merge(&self, code: &str, patch: DocumentPatch) -> Result<bool, AppError> {
        if patch.is_empty() {
            return Ok(true);
        }
        self.merge_calls
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        let mut docs = self.docs.lock().await;
        let Some(doc) = docs.get_mut(code) else {
            return Ok(false);
        };

        patch.apply(doc);
        let doc = doc.clone();
        drop(docs);

        self.notify(code, DocEvent::Changed(doc));
        Ok(true)
    }

    async fn join(&self, code: &str) -> Result<JoinOutcome, AppError> {
        let mut docs = self.docs.lock().await;
        let Some(doc) = docs.get_mut(code) else {
            return Ok(JoinOutcome::NotFound);
        };

        doc.members += 1;
        let doc = doc.clone();
        drop(docs);

        self.notify(code, DocEvent::Changed(doc.clone()));
        Ok(JoinOutcome::Joined(doc))
    }

    async fn leave(&self, code: &str) -> Result<LeaveOutcome, AppError> {
        let mut docs = self.docs.lock().await;
        let Some(doc) = docs.get_mut(code) else {
            return Ok(LeaveOutcome::NotFound);
        };

        if doc.members <= 1 {
            docs.remove(code);
            drop(docs);
            self.notify(code, DocEvent::Deleted);
            return Ok(LeaveOutcome::Deleted);
        }

        doc.members -= 1;
        let doc = doc.clone();
        drop(docs);

        self.notify(code, DocEvent::Changed(doc.clone()));
        Ok(LeaveOutcome::Remaining(doc.members))
    }

    async fn subscribe(&self, code: &str) -> Result<Subscription, AppError> {
        let mut events = self.events.subscribe();
        let code = code.to_string();
        let (tx, rx) = mpsc::unbounded_channel();

        let task = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok((c, event)) if c == code => {
                        if tx.send(event).is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription { rx, task })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Product;

    fn doc(code: &str, members: u32) -> FamilyDoc {
        FamilyDoc {
            id: code.to_string(),
            name: "home".to_string(),
            members,
            shopping_list: vec![Product::new("milk", String::new())],
            favorites: Vec::new(),
            rev: Rev::default(),
        }
    }

    #[tokio::test]
    async fn join_increments_and_returns_doc() {
        let store = MemoryStore::default();
        store.write("ab12", &doc("ab12", 1)).await.unwrap();

        match store.join("ab12").await.unwrap() {
            JoinOutcome::Joined(doc) => assert_eq!(doc.members, 2),
            JoinOutcome::NotFound => panic!("expected join to succeed"),
        }
    }

    #[tokio::test]
    async fn join_missing_family_is_not_found() {
        let store = MemoryStore::default();
        assert_eq!(store.join("nope").await.unwrap(), JoinOutcome::NotFound);
        assert!(store.read("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn leave_decrements_until_last_member_deletes() {
        let store = MemoryStore::default();
        store.write("ab12", &doc("ab12", 2)).await.unwrap();

        assert_eq!(
            store.leave("ab12").await.unwrap(),
            LeaveOutcome::Remaining(1)
        );
        assert_eq!(store.leave("ab12").await.unwrap(), LeaveOutcome::Deleted);
        assert!(store.read("ab12").await.unwrap().is_none());
        assert_eq!(store.leave("ab12").await.unwrap(), LeaveOutcome::NotFound);
    }

    #[tokio::test]
    async fn merge_updates_only_named_fields() {
        let store = MemoryStore::default();
        store.write("ab12", &doc("ab12", 2)).await.unwrap();

        let applied = store
            .merge(
                "ab12",
                DocumentPatch {
                    shopping_list: Some(Vec::new()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(applied);

        let merged = store.read("ab12").await.unwrap().unwrap();
        assert!(merged.shopping_list.is_empty());
        assert_eq!(merged.members, 2);
        assert_eq!(merged.name, "home");
    }

    #[tokio::test]
    async fn merge_on_missing_family_reports_gone() {
        let store = MemoryStore::default();
        let applied = store
            .merge("nope", DocumentPatch::default())
            .await
            .unwrap();
        // An empty patch is vacuously applied; a real one is not.
        assert!(applied);

        let applied = store
            .merge(
                "nope",
                DocumentPatch {
                    name: Some("x".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!applied);
    }

    #[tokio::test]
    async fn subscribers_see_changes_and_deletion() {
        let store = MemoryStore::default();
        store.write("ab12", &doc("ab12", 1)).await.unwrap();

        let mut sub = store.subscribe("ab12").await.unwrap();
        store.join("ab12").await.unwrap();
        store.write("zz99", &doc("zz99", 1)).await.unwrap();
        store.leave("ab12").await.unwrap();
        store.leave("ab12").await.unwrap();

        match sub.recv().await.unwrap() {
            DocEvent::Changed(doc) => assert_eq!(doc.members, 2),
            DocEvent::Deleted => panic!("expected change event"),
        }
        // The zz99 write must not leak into this subscription.
        match sub.recv().await.unwrap() {
            DocEvent::Changed(doc) => assert_eq!(doc.members, 1),
            DocEvent::Deleted => panic!("expected change event"),
        }
        assert!(matches!(sub.recv().await.unwrap(), DocEvent::Deleted));
    }
}
