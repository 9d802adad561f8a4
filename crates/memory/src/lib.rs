pub mod allocator;
pub mod codec;
pub mod error;
pub mod query;
pub mod sandbox;
pub mod schema;
pub mod store;

pub use error::{MemoryError, Result};
pub use query::VaultHit;
pub use schema::{EntryMetadata, LinkKind, MemoryType, ProvenanceLink, SessionProvenance};
pub use store::{
    AppendedEntry, Clock, GovernedStore, LabyrinthSnapshot, PromotionRequest, ThreadbornNote,
    VaultOutcome, VaultSealRequest, WrittenEntry, system_clock,
};
