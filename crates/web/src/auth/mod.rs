//! Authentication and authorization for proxied instance UIs.
//!
//! - `credentials`: where a token is looked for, in which order
//! - `jwt`: turning a token into a principal
//! - `gate`: turning a principal into an upstream port

pub mod credentials;
pub mod gate;
pub mod jwt;

pub use credentials::{Credential, CredentialContext, CredentialSource};
pub use gate::{AccessGate, GateError};
pub use jwt::JwtIdentityService;
