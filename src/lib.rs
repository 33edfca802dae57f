pub mod api;
pub mod chain;
pub mod config;
pub mod db;
pub mod error;
pub mod identity;
pub mod indexer;
pub mod retry;
pub mod state;
pub mod types;
