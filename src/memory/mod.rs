//! The memory fabric: long-term temporal memory behind an abstract port,
//! fused with per-session short-term state (see [`crate::session`]).

mod fabric;
mod lexical;
mod types;

pub use fabric::{FabricStats, MemoryFabric, RetrievedContext, ScoredMemory};
pub use lexical::{LexicalMemoryPort, lexical_similarity, tokenize};
pub use types::{
    FeedbackEvent, InteractionRecord, MemoryEntry, MemoryPort, SearchFilters, relevance_key_for,
};
