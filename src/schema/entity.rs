//! Graph entities
//!
//! Users and documents serialize directly to the store's JSON wire format:
//! empty fields are omitted, `likes` nests the other kind, and edge facets
//! travel as `likes|rating` keys.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A required field was missing on an entity; never retried
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("document has an empty url")]
    EmptyUrl,

    #[error("document {url} is missing a title")]
    MissingTitle { url: String },

    #[error("user has an empty username")]
    EmptyUsername,

    #[error("user {username} has no urls")]
    MissingUrls { username: String },

    #[error("user {username} is missing a display name")]
    MissingName { username: String },
}

/// The two node types of the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    User,
    Document,
}

impl EntityKind {
    /// The store predicate holding this kind's identity key
    pub fn key_predicate(&self) -> &'static str {
        match self {
            Self::User => "username",
            Self::Document => "url",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Document => "document",
        }
    }
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// A liked work: story, book, etc.
///
/// Identity key: the scraper-normalized `url`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub title: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub author: String,

    /// Unix seconds
    #[serde(default, skip_serializing_if = "is_zero")]
    pub created: u64,

    /// Unix seconds
    #[serde(default, skip_serializing_if = "is_zero")]
    pub updated: u64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub reviews: u64,

    #[serde(rename = "likecount", default, skip_serializing_if = "is_zero")]
    pub like_count: u64,

    #[serde(rename = "wordcount", default, skip_serializing_if = "is_zero")]
    pub word_count: u64,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub chapters: u64,

    #[serde(default, skip_serializing_if = "is_false")]
    pub complete: bool,

    #[serde(rename = "desc", default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub isbn: Option<u64>,

    /// Users who liked this document (the reverse of `User::likes`)
    #[serde(rename = "~likes", default, skip_serializing_if = "Vec::is_empty")]
    pub likes: Vec<User>,

    /// Facet on the `likes` edge pointing at this document
    #[serde(rename = "likes|rating", default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i64>,
}

impl Document {
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            ..Default::default()
        }
    }

    pub fn identity_key(&self) -> &str {
        &self.url
    }

    /// Checks the fields required before any remote call
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.is_empty() {
            return Err(ValidationError::EmptyUrl);
        }
        if self.title.is_empty() {
            return Err(ValidationError::MissingTitle {
                url: self.url.clone(),
            });
        }
        Ok(())
    }
}

/// A person on a source site who likes documents
///
/// Identity key: the slugified `username`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub likes: Vec<Document>,

    /// Facet on the `likes` edge when reached through `Document::likes`
    #[serde(rename = "~likes|rating", default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<i64>,
}

impl User {
    /// Builds a user from its display name, deriving the username slug
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            username: super::make_slug(&name),
            name,
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    pub fn identity_key(&self) -> &str {
        &self.username
    }

    /// Checks the fields required before any remote call
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.username.is_empty() {
            return Err(ValidationError::EmptyUsername);
        }
        if self.urls.is_empty() {
            return Err(ValidationError::MissingUrls {
                username: self.username.clone(),
            });
        }
        if self.name.is_empty() {
            return Err(ValidationError::MissingName {
                username: self.username.clone(),
            });
        }
        Ok(())
    }
}

/// An external link suggested for a document; derived, never persisted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    pub name: String,
    pub url: String,
}
