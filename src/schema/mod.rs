//! Entity model shared by scrapers, the uploader and the store
//!
//! The persisted graph is bipartite: `User -likes-> Document`. Both entity
//! types serialize to the store's JSON mutation format directly, so the
//! serde field names below are the store predicate names.

mod entity;
mod slug;

pub use entity::{Document, EntityKind, Link, User, ValidationError};
pub use slug::{make_slug, parse_count, remove_empty};
