pub mod coordinator;
pub mod metadata;
pub mod pipeline;

pub use coordinator::Indexer;
