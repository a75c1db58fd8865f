//! Contracts for the three managed services the engines sit on top of:
//! a document store, an object store for images, and an identity provider.
//!
//! Every call returns `anyhow::Result`; the services report opaque failures and
//! the engines turn them into [`SyncError`](crate::core::errors::SyncError)s.

pub mod memory;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

pub type Document = Map<String, Value>;

/// A stored document together with its store-assigned id.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub id: String,
    pub data: Document,
}

/// Equality filter on a (possibly dotted) field path such as `author.uid`.
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub field: String,
    pub value: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub collection: String,
    pub filters: Vec<Filter>,
    pub order_by: Option<OrderBy>,
}

impl Query {
    pub fn collection(name: &str) -> Self {
        Self {
            collection: name.to_string(),
            filters: Vec::new(),
            order_by: None,
        }
    }

    pub fn where_eq(mut self, field: &str, value: impl Into<Value>) -> Self {
        self.filters.push(Filter {
            field: field.to_string(),
            value: value.into(),
        });
        self
    }

    pub fn order_by_desc(mut self, field: &str) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            direction: Direction::Descending,
        });
        self
    }

    pub fn order_by_asc(mut self, field: &str) -> Self {
        self.order_by = Some(OrderBy {
            field: field.to_string(),
            direction: Direction::Ascending,
        });
        self
    }
}

/// One entry of a batched partial update.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub collection: String,
    pub id: String,
    pub fields: Document,
}

/// Standing query. Every change to the underlying result set pushes the full
/// set again; a store-side break arrives as a terminal `Err`.
///
/// Closing (or dropping) the subscription cancels the listener, after which
/// nothing more is delivered.
pub struct Subscription {
    events: mpsc::Receiver<anyhow::Result<Vec<Snapshot>>>,
    _listener: DropGuard,
}

impl Subscription {
    pub fn new(
        events: mpsc::Receiver<anyhow::Result<Vec<Snapshot>>>,
        listener: CancellationToken,
    ) -> Self {
        Self {
            events,
            _listener: listener.drop_guard(),
        }
    }

    pub fn close(mut self) {
        self.events.close();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").finish_non_exhaustive()
    }
}

impl Stream for Subscription {
    type Item = anyhow::Result<Vec<Snapshot>>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().events.poll_recv(cx)
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reserves a fresh document id without writing anything.
    fn allocate_id(&self, collection: &str) -> String;

    async fn create(&self, collection: &str, doc: Document) -> anyhow::Result<String>;

    async fn set(&self, collection: &str, id: &str, doc: Document) -> anyhow::Result<()>;

    async fn get(&self, collection: &str, id: &str) -> anyhow::Result<Option<Document>>;

    async fn query(&self, query: &Query) -> anyhow::Result<Vec<Snapshot>>;

    /// Merges `fields` into an existing document. Fails if it does not exist.
    async fn update(&self, collection: &str, id: &str, fields: Document) -> anyhow::Result<()>;

    /// Removes a document; removing a missing one succeeds.
    async fn delete(&self, collection: &str, id: &str) -> anyhow::Result<()>;

    async fn subscribe(&self, query: Query) -> anyhow::Result<Subscription>;

    /// Applies all updates or none.
    async fn batch_update(&self, updates: Vec<FieldUpdate>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Bytes(Vec<u8>),
    Uri(String),
}

impl ImageSource {
    pub fn is_empty(&self) -> bool {
        match self {
            ImageSource::Bytes(bytes) => bytes.is_empty(),
            ImageSource::Uri(uri) => uri.trim().is_empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub request_id: String,
    pub image: ImageSource,
    pub preset: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Uploads an image and returns its public secure URL.
    async fn upload(&self, request: UploadRequest) -> anyhow::Result<String>;

    /// Aborts the in-flight upload started with `request_id`.
    async fn cancel(&self, request_id: &str);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCredential {
    pub provider: String,
    pub id_token: String,
}

/// Account data a social identity provider hands back on sign-in.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ProviderUser {
    pub uid: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub photo_url: Option<String>,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn current_user(&self) -> Option<String>;

    /// Current sign-in state first, then every change. Dropping the stream
    /// removes the listener.
    fn auth_state(&self) -> BoxStream<'static, Option<String>>;

    async fn sign_out(&self);

    async fn sign_up_with_email(&self, email: &str, password: &str) -> anyhow::Result<String>;

    async fn sign_in_with_email(&self, email: &str, password: &str) -> anyhow::Result<String>;

    async fn sign_in_with_credential(
        &self,
        credential: &ProviderCredential,
    ) -> anyhow::Result<ProviderUser>;
}

/// Handles to the remote services, shared by every engine of a session.
#[derive(Clone)]
pub struct Backend {
    pub documents: Arc<dyn DocumentStore>,
    pub objects: Arc<dyn ObjectStore>,
    pub identity: Arc<dyn IdentityProvider>,
}

impl Backend {
    pub fn new(
        documents: Arc<dyn DocumentStore>,
        objects: Arc<dyn ObjectStore>,
        identity: Arc<dyn IdentityProvider>,
    ) -> Self {
        Self {
            documents,
            objects,
            identity,
        }
    }

    pub fn current_user(&self) -> Option<String> {
        self.identity.current_user()
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("current_user", &self.current_user())
            .finish()
    }
}
