//! # courselore-core
//!
//! Core types, rules, and abstractions for Courselore's message pipeline.
//!
//! This crate provides the domain model shared by the store, the job worker
//! and the HTTP surface, the pure authorization/validation rules for message
//! mutations, the content-processor boundary, and the live-update dispatcher.

pub mod content;
pub mod defaults;
pub mod error;
pub mod events;
pub mod models;
pub mod policy;
pub mod traits;

// Re-export commonly used types at crate root
pub use content::{extract_mentions, BasicContentProcessor};
pub use error::{Error, Result};
pub use events::{
    ConnectionId, LiveScope, LiveSubscription, LiveUpdate, LiveUpdateDispatcher,
    LIVE_CONNECTION_HEADER,
};
pub use models::*;
pub use traits::*;
