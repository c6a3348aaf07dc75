//! uiproxy Common Library
//!
//! Shared types, collaborator interfaces and the SQLite-backed collaborator
//! lookups used by the proxy.

pub mod db;
pub mod error;
pub mod registry;
pub mod types;

// Re-export commonly used types
pub use db::Database;
pub use error::{AuthError, Error, Result};
pub use registry::{IdentityService, InstanceRegistry, PrincipalStore};
pub use types::*;

/// uiproxy version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
