pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod master;
pub mod node;
pub mod protocol;
pub mod store;

pub use client::{KattaClient, SearchResults};
pub use config::KattaConfig;
pub use engine::InvertedEngine;
pub use error::{KattaError, KattaResult};
pub use master::Master;
pub use node::Node;
pub use protocol::{Hit, Hits, Query};
pub use store::{MemoryStore, MetaStore, RemoteStore};
