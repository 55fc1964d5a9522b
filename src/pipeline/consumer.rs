//! Entity queues between scrapers and uploaders
//!
//! Two bounded queues, one for users and one for documents. Scrapers hold
//! a [`Consumer`] and block when a queue is full; uploaders share one
//! [`EntityReceivers`] and take whichever queue is ready.

use crate::schema::{Document, EntityKind, User};
use crate::Cancelled;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Default capacity of each entity queue
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// An entity on its way from a scraper to an uploader
#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    User(User),
    Document(Document),
}

impl Entity {
    pub fn kind(&self) -> EntityKind {
        match self {
            Entity::User(_) => EntityKind::User,
            Entity::Document(_) => EntityKind::Document,
        }
    }

    pub fn identity_key(&self) -> &str {
        match self {
            Entity::User(user) => user.identity_key(),
            Entity::Document(doc) => doc.identity_key(),
        }
    }
}

/// The scraper side of the entity queues
///
/// Cloned into every scraper task; the queues close once every clone has
/// been dropped.
#[derive(Debug, Clone)]
pub struct Consumer {
    users: mpsc::Sender<User>,
    documents: mpsc::Sender<Document>,
}

impl Consumer {
    /// Sends a user, waiting while the queue is full
    ///
    /// # Arguments
    ///
    /// * `cancel` - Shared cancellation token observed while blocked
    /// * `user` - The user to upload
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if `cancel` fires first or the uploaders are gone.
    pub async fn send_user(&self, cancel: &CancellationToken, user: User) -> Result<(), Cancelled> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Cancelled),
            sent = self.users.send(user) => sent.map_err(|_| Cancelled),
        }
    }

    /// Sends a document, waiting while the queue is full
    ///
    /// # Errors
    ///
    /// Returns [`Cancelled`] if `cancel` fires first or the uploaders are gone.
    pub async fn send_document(
        &self,
        cancel: &CancellationToken,
        document: Document,
    ) -> Result<(), Cancelled> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Cancelled),
            sent = self.documents.send(document) => sent.map_err(|_| Cancelled),
        }
    }
}

struct Receivers {
    users: mpsc::Receiver<User>,
    documents: mpsc::Receiver<Document>,
}

/// The uploader side of the entity queues, shared by every uploader
pub struct EntityReceivers {
    inner: Mutex<Receivers>,
}

impl EntityReceivers {
    /// Next entity from whichever queue is ready, or `None` once both queues
    /// are closed and empty
    ///
    /// When both queues have items the choice between them is random.
    pub async fn next(&self) -> Option<Entity> {
        let mut guard = self.inner.lock().await;
        let Receivers { users, documents } = &mut *guard;

        if users.capacity() == 0 || documents.capacity() == 0 {
            tracing::warn!("uploader overloaded!");
        }

        tokio::select! {
            Some(user) = users.recv() => Some(Entity::User(user)),
            Some(doc) = documents.recv() => Some(Entity::Document(doc)),
            else => None,
        }
    }
}

/// Creates the two bounded entity queues
///
/// # Arguments
///
/// * `capacity` - Capacity of each queue; zero is raised to one
///
/// # Returns
///
/// The scraper side and the uploader side of the queues
pub fn entity_queues(capacity: usize) -> (Consumer, EntityReceivers) {
    let capacity = capacity.max(1);
    let (users_tx, users_rx) = mpsc::channel(capacity);
    let (documents_tx, documents_rx) = mpsc::channel(capacity);
    let consumer = Consumer {
        users: users_tx,
        documents: documents_tx,
    };
    let receivers = EntityReceivers {
        inner: Mutex::new(Receivers {
            users: users_rx,
            documents: documents_rx,
        }),
    };
    (consumer, receivers)
}
