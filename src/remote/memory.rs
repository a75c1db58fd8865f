//! In-process implementations of the remote contracts.
//!
//! They back the demo binary and the test suite. Each one can be told to fail
//! its next call (`fail_next`) or to park it until released (`hold`), which is
//! how optimistic and rolled-back states are made observable.

use std::cmp::Ordering;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use chrono::DateTime;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, watch, Notify};
use tokio_stream::wrappers::WatchStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::SUBSCRIPTION_BUFFER;
use crate::core::helpers::{hash_password, new_id, verify_password};
use crate::remote::{
    Backend, Direction, Document, DocumentStore, FieldUpdate, IdentityProvider, ImageSource,
    ObjectStore, ProviderCredential, ProviderUser, Query, Snapshot, Subscription, UploadRequest,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Releases one parked call.
#[derive(Debug, Clone)]
pub struct Gate(Arc<Notify>);

impl Gate {
    pub fn release(&self) {
        self.0.notify_one();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    Create,
    Set,
    Get,
    Query,
    Update,
    Delete,
    Subscribe,
    BatchUpdate,
}

impl fmt::Display for StoreOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StoreOp::Create => "create",
            StoreOp::Set => "set",
            StoreOp::Get => "get",
            StoreOp::Query => "query",
            StoreOp::Update => "update",
            StoreOp::Delete => "delete",
            StoreOp::Subscribe => "subscribe",
            StoreOp::BatchUpdate => "batch update",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreCall {
    pub op: StoreOp,
    pub collection: String,
    pub id: Option<String>,
}

#[derive(Debug, Clone)]
enum StoreEvent {
    Changed(String),
    Broken { collection: String, message: String },
}

fn field<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Store ordering: timestamps chronologically, numbers numerically, strings lexically.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                let x = x.as_f64().unwrap_or_default();
                let y = y.as_f64().unwrap_or_default();
                x.partial_cmp(&y).unwrap_or(Ordering::Equal)
            }
            (Value::String(x), Value::String(y)) => {
                match (DateTime::parse_from_rfc3339(x), DateTime::parse_from_rfc3339(y)) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                }
            }
            (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
            _ => rank(a).cmp(&rank(b)),
        },
    }
}

struct DocumentsInner {
    collections: Mutex<HashMap<String, Vec<(String, Document)>>>,
    changes: broadcast::Sender<StoreEvent>,
    faults: Mutex<HashMap<StoreOp, VecDeque<String>>>,
    holds: Mutex<HashMap<StoreOp, VecDeque<Arc<Notify>>>>,
    calls: Mutex<Vec<StoreCall>>,
}

impl DocumentsInner {
    fn run_query(&self, query: &Query) -> Vec<Snapshot> {
        let collections = lock(&self.collections);
        let mut hits: Vec<Snapshot> = collections
            .get(&query.collection)
            .map(|docs| {
                docs.iter()
                    .filter(|(_, data)| {
                        query
                            .filters
                            .iter()
                            .all(|f| field(data, &f.field) == Some(&f.value))
                    })
                    .map(|(id, data)| Snapshot {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        drop(collections);

        if let Some(order) = &query.order_by {
            // stable sort: ties keep insertion order
            hits.sort_by(|a, b| {
                let ord = compare_values(field(&a.data, &order.field), field(&b.data, &order.field));
                match order.direction {
                    Direction::Ascending => ord,
                    Direction::Descending => ord.reverse(),
                }
            });
        }
        hits
    }

    fn changed(&self, collection: &str) {
        // no listeners is fine
        let _ = self.changes.send(StoreEvent::Changed(collection.to_string()));
    }
}

/// Document store kept in process memory, with push subscriptions.
#[derive(Clone)]
pub struct MemoryDocumentStore {
    inner: Arc<DocumentsInner>,
}

impl Default for MemoryDocumentStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(DocumentsInner {
                collections: Mutex::new(HashMap::new()),
                changes,
                faults: Mutex::new(HashMap::new()),
                holds: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Makes the next `op` call fail with `message`.
    pub fn fail_next(&self, op: StoreOp, message: &str) {
        lock(&self.inner.faults)
            .entry(op)
            .or_default()
            .push_back(message.to_string());
    }

    /// Parks the next `op` call until the returned gate is released.
    pub fn hold(&self, op: StoreOp) -> Gate {
        let notify = Arc::new(Notify::new());
        lock(&self.inner.holds)
            .entry(op)
            .or_default()
            .push_back(Arc::clone(&notify));
        Gate(notify)
    }

    /// Ends every open subscription on `collection` with a terminal error.
    pub fn break_subscriptions(&self, collection: &str, message: &str) {
        let _ = self.inner.changes.send(StoreEvent::Broken {
            collection: collection.to_string(),
            message: message.to_string(),
        });
    }

    /// Push subscriptions still being served.
    pub fn open_subscriptions(&self) -> usize {
        self.inner.changes.receiver_count()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        lock(&self.inner.calls).clone()
    }

    pub fn call_count(&self, op: StoreOp) -> usize {
        lock(&self.inner.calls).iter().filter(|c| c.op == op).count()
    }

    /// Raw contents of `collection` in insertion order.
    pub fn documents(&self, collection: &str) -> Vec<Snapshot> {
        lock(&self.inner.collections)
            .get(collection)
            .map(|docs| {
                docs.iter()
                    .map(|(id, data)| Snapshot {
                        id: id.clone(),
                        data: data.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn document(&self, collection: &str, id: &str) -> Option<Document> {
        lock(&self.inner.collections)
            .get(collection)
            .and_then(|docs| docs.iter().find(|(doc_id, _)| doc_id == id))
            .map(|(_, data)| data.clone())
    }

    /// Writes a document directly, bypassing faults, holds and the call log.
    pub fn put_raw(&self, collection: &str, id: &str, doc: Document) {
        self.write(collection, id, doc);
    }

    fn write(&self, collection: &str, id: &str, doc: Document) {
        {
            let mut collections = lock(&self.inner.collections);
            let docs = collections.entry(collection.to_string()).or_default();
            match docs.iter_mut().find(|(doc_id, _)| doc_id == id) {
                Some(slot) => slot.1 = doc,
                None => docs.push((id.to_string(), doc)),
            }
        }
        self.inner.changed(collection);
    }

    async fn enter(&self, op: StoreOp, collection: &str, id: Option<&str>) -> anyhow::Result<()> {
        lock(&self.inner.calls).push(StoreCall {
            op,
            collection: collection.to_string(),
            id: id.map(str::to_string),
        });

        let gate = lock(&self.inner.holds)
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        if let Some(gate) = gate {
            gate.notified().await;
        }

        let fault = lock(&self.inner.faults)
            .get_mut(&op)
            .and_then(VecDeque::pop_front);
        match fault {
            Some(message) => Err(anyhow!(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    fn allocate_id(&self, _collection: &str) -> String {
        new_id()
    }

    async fn create(&self, collection: &str, doc: Document) -> anyhow::Result<String> {
        self.enter(StoreOp::Create, collection, None).await?;
        let id = new_id();
        self.write(collection, &id, doc);
        debug!(collection, id = %id, "document created");
        Ok(id)
    }

    async fn set(&self, collection: &str, id: &str, doc: Document) -> anyhow::Result<()> {
        self.enter(StoreOp::Set, collection, Some(id)).await?;
        self.write(collection, id, doc);
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> anyhow::Result<Option<Document>> {
        self.enter(StoreOp::Get, collection, Some(id)).await?;
        Ok(self.document(collection, id))
    }

    async fn query(&self, query: &Query) -> anyhow::Result<Vec<Snapshot>> {
        self.enter(StoreOp::Query, &query.collection, None).await?;
        Ok(self.inner.run_query(query))
    }

    async fn update(&self, collection: &str, id: &str, fields: Document) -> anyhow::Result<()> {
        self.enter(StoreOp::Update, collection, Some(id)).await?;
        {
            let mut collections = lock(&self.inner.collections);
            let doc = collections
                .get_mut(collection)
                .and_then(|docs| docs.iter_mut().find(|(doc_id, _)| doc_id == id))
                .map(|(_, data)| data);
            let Some(doc) = doc else {
                bail!("No document to update: {}/{}", collection, id);
            };
            doc.extend(fields);
        }
        self.inner.changed(collection);
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> anyhow::Result<()> {
        self.enter(StoreOp::Delete, collection, Some(id)).await?;
        let removed = {
            let mut collections = lock(&self.inner.collections);
            match collections.get_mut(collection) {
                Some(docs) => {
                    let before = docs.len();
                    docs.retain(|(doc_id, _)| doc_id != id);
                    docs.len() != before
                }
                None => false,
            }
        };
        if removed {
            self.inner.changed(collection);
        }
        Ok(())
    }

    async fn subscribe(&self, query: Query) -> anyhow::Result<Subscription> {
        self.enter(StoreOp::Subscribe, &query.collection, None).await?;

        let token = CancellationToken::new();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        // listen before the first read so no change slips between the two
        let mut changes = self.inner.changes.subscribe();
        let initial = self.inner.run_query(&query);
        let inner = Arc::clone(&self.inner);
        let listener = token.clone();

        tokio::spawn(async move {
            if tx.send(Ok(initial)).await.is_err() {
                return;
            }
            loop {
                let event = tokio::select! {
                    _ = listener.cancelled() => break,
                    event = changes.recv() => event,
                };
                let item = match event {
                    Ok(StoreEvent::Changed(collection)) if collection == query.collection => {
                        Ok(inner.run_query(&query))
                    }
                    Ok(StoreEvent::Broken { collection, message })
                        if collection == query.collection =>
                    {
                        let _ = tx.send(Err(anyhow!(message))).await;
                        break;
                    }
                    Ok(_) => continue,
                    Err(RecvError::Lagged(_)) => Ok(inner.run_query(&query)),
                    Err(RecvError::Closed) => break,
                };
                tokio::select! {
                    _ = listener.cancelled() => break,
                    sent = tx.send(item) => {
                        if sent.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!(collection = %query.collection, "listener removed");
        });

        Ok(Subscription::new(rx, token))
    }

    async fn batch_update(&self, updates: Vec<FieldUpdate>) -> anyhow::Result<()> {
        let collection = updates
            .first()
            .map(|u| u.collection.clone())
            .unwrap_or_default();
        self.enter(StoreOp::BatchUpdate, &collection, None).await?;

        let mut touched: Vec<String> = Vec::new();
        {
            let mut collections = lock(&self.inner.collections);
            for update in &updates {
                let exists = collections
                    .get(&update.collection)
                    .is_some_and(|docs| docs.iter().any(|(id, _)| id == &update.id));
                if !exists {
                    bail!("No document to update: {}/{}", update.collection, update.id);
                }
            }
            for update in updates {
                if let Some((_, doc)) = collections
                    .get_mut(&update.collection)
                    .and_then(|docs| docs.iter_mut().find(|(id, _)| id == &update.id))
                {
                    doc.extend(update.fields);
                }
                if !touched.contains(&update.collection) {
                    touched.push(update.collection);
                }
            }
        }
        for collection in &touched {
            self.inner.changed(collection);
        }
        Ok(())
    }
}

/// Object store that keeps uploaded images in memory.
pub struct MemoryObjectStore {
    base_url: String,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    faults: Mutex<VecDeque<String>>,
    holds: Mutex<VecDeque<Arc<Notify>>>,
    started: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
}

impl Default for MemoryObjectStore {
    fn default() -> Self {
        Self::new("https://images.bloghub.local")
    }
}

impl MemoryObjectStore {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            objects: Mutex::new(HashMap::new()),
            faults: Mutex::new(VecDeque::new()),
            holds: Mutex::new(VecDeque::new()),
            started: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
        }
    }

    pub fn fail_next(&self, message: &str) {
        lock(&self.faults).push_back(message.to_string());
    }

    pub fn hold(&self) -> Gate {
        let notify = Arc::new(Notify::new());
        lock(&self.holds).push_back(Arc::clone(&notify));
        Gate(notify)
    }

    /// Request ids of every upload that reached the store.
    pub fn started(&self) -> Vec<String> {
        lock(&self.started).clone()
    }

    pub fn cancelled(&self) -> Vec<String> {
        lock(&self.cancelled).clone()
    }

    pub fn object(&self, url: &str) -> Option<Vec<u8>> {
        lock(&self.objects).get(url).cloned()
    }

    pub fn object_count(&self) -> usize {
        lock(&self.objects).len()
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn upload(&self, request: UploadRequest) -> anyhow::Result<String> {
        lock(&self.started).push(request.request_id.clone());

        let gate = lock(&self.holds).pop_front();
        if let Some(gate) = gate {
            gate.notified().await;
        }

        if lock(&self.cancelled).contains(&request.request_id) {
            bail!("Upload {} was cancelled", request.request_id);
        }
        let fault = lock(&self.faults).pop_front();
        if let Some(message) = fault {
            bail!(message);
        }

        let bytes = match request.image {
            ImageSource::Bytes(bytes) => bytes,
            ImageSource::Uri(uri) => uri.into_bytes(),
        };
        let url = format!("{}/{}/{}", self.base_url, request.preset, new_id());
        lock(&self.objects).insert(url.clone(), bytes);
        Ok(url)
    }

    async fn cancel(&self, request_id: &str) {
        debug!(request_id, "upload cancelled");
        lock(&self.cancelled).push(request_id.to_string());
    }
}

struct Account {
    uid: String,
    password_hash: String,
}

/// Identity provider with email/password accounts and pre-registered social
/// credentials.
pub struct MemoryIdentity {
    accounts: Mutex<HashMap<String, Account>>,
    providers: Mutex<HashMap<String, ProviderUser>>,
    current: watch::Sender<Option<String>>,
}

impl Default for MemoryIdentity {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryIdentity {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            accounts: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
            current,
        }
    }

    /// Makes `id_token` a valid social credential for `user`.
    pub fn register_provider_account(&self, id_token: &str, user: ProviderUser) {
        lock(&self.providers).insert(id_token.to_string(), user);
    }

    /// Switches the signed-in user without credentials.
    pub fn sign_in_as(&self, uid: &str) {
        self.current.send_replace(Some(uid.to_string()));
    }

    /// Auth-state streams that are still open.
    pub fn auth_listeners(&self) -> usize {
        self.current.receiver_count()
    }
}

#[async_trait]
impl IdentityProvider for MemoryIdentity {
    fn current_user(&self) -> Option<String> {
        self.current.borrow().clone()
    }

    fn auth_state(&self) -> BoxStream<'static, Option<String>> {
        WatchStream::new(self.current.subscribe()).boxed()
    }

    async fn sign_out(&self) {
        self.current.send_replace(None);
    }

    async fn sign_up_with_email(&self, email: &str, password: &str) -> anyhow::Result<String> {
        let email = email.trim().to_lowercase();
        if !email.contains('@') {
            bail!("The email address is badly formatted.");
        }
        if password.len() < 6 {
            bail!("The password must be at least 6 characters.");
        }
        if lock(&self.accounts).contains_key(&email) {
            bail!("The email address is already in use by another account.");
        }

        let password_hash = hash_password(password)?;
        let uid = new_id();
        lock(&self.accounts).insert(
            email,
            Account {
                uid: uid.clone(),
                password_hash,
            },
        );
        self.current.send_replace(Some(uid.clone()));
        Ok(uid)
    }

    async fn sign_in_with_email(&self, email: &str, password: &str) -> anyhow::Result<String> {
        let email = email.trim().to_lowercase();
        let found = lock(&self.accounts)
            .get(&email)
            .map(|a| (a.uid.clone(), a.password_hash.clone()));
        match found {
            Some((uid, hash)) if verify_password(password, &hash) => {
                self.current.send_replace(Some(uid.clone()));
                Ok(uid)
            }
            _ => bail!("The supplied auth credential is incorrect."),
        }
    }

    async fn sign_in_with_credential(
        &self,
        credential: &ProviderCredential,
    ) -> anyhow::Result<ProviderUser> {
        let user = lock(&self.providers).get(&credential.id_token).cloned();
        let Some(user) = user else {
            bail!("Invalid {} credential", credential.provider);
        };
        self.current.send_replace(Some(user.uid.clone()));
        Ok(user)
    }
}

/// The three in-memory services, kept as concrete types so callers can
/// inject faults while the engines see plain [`Backend`] handles.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    pub documents: Arc<MemoryDocumentStore>,
    pub objects: Arc<MemoryObjectStore>,
    pub identity: Arc<MemoryIdentity>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(&self) -> Backend {
        Backend::new(
            self.documents.clone(),
            self.objects.clone(),
            self.identity.clone(),
        )
    }
}
