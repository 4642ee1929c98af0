//! Metadata layer (spec §4.3): row types plus the rusqlite-backed store.

pub mod store;
pub mod types;

pub use store::MetadataStore;
pub use types::*;
