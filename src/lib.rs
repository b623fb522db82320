// Re-export needed modules for testing
pub mod backend;
pub mod chat;
pub mod models;
pub mod validation;

// Re-export main types for convenience
pub use backend::{Backend, BackendError, SqliteBackend};
pub use chat::{ChatService, Subscription};
pub use models::*;
