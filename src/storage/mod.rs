//! PostgreSQL-backed lookups.
//!
//! The relay keeps no durable state of its own outside Redis; the only
//! relational data it reads is conversation ownership, consulted by the
//! submission gateway before a job is accepted.

pub mod ownership;

pub use ownership::{ConversationDirectory, DirectoryError, OwnershipCheck, StaticOwnership, Unrestricted};
