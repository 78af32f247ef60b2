//! Types library for the collection valuation engine
//!
//! Core type definitions shared by the engine and its persistence layer.
//!
//! # Modules
//! - `ids`: Derived identifiers (CollectionId, ItemIdentity, EventId, SnapshotId)
//! - `numeric`: Decimal price and integer quantity newtypes
//! - `events`: Topic payloads and the wire envelope
//! - `errors`: Input error taxonomy

pub mod ids;
pub mod numeric;
pub mod events;
pub mod errors;

// Library version constant
pub const LIB_VERSION: &str = "1.0.0";

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::ids::*;
    pub use crate::numeric::*;
    pub use crate::events::*;
    pub use crate::errors::*;
}
