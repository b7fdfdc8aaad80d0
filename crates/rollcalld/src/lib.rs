//! Session host for the rollcall pipeline: configuration, the encrypted
//! SQLite embedding store, and the session thread with its async handle.

pub mod config;
pub mod engine;
pub mod store;

pub use config::{Config, ConfigError};
pub use engine::{open_session, spawn_session, EngineError, SessionHandle, SessionStats};
pub use store::{EmbeddingStore, IdentityInfo, StoreError};
