//! Interfaces to the collaborators that own identities and instances.
//!
//! The proxy never writes through these; account storage and the container
//! lifecycle manager are the sources of truth.

use async_trait::async_trait;

use crate::error::AuthError;
use crate::types::{InstanceDescriptor, Principal};
use crate::Result;

/// Turns a raw credential into an authenticated principal.
#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn verify(&self, credential: &str) -> std::result::Result<Principal, AuthError>;
}

/// Looks up identities by id.
#[async_trait]
pub trait PrincipalStore: Send + Sync {
    async fn principal(&self, id: &str) -> Result<Option<Principal>>;
}

/// Looks up instances on behalf of a requester.
#[async_trait]
pub trait InstanceRegistry: Send + Sync {
    /// Find an instance visible to `requester`.
    ///
    /// For non-elevated requesters only instances they own are visible; an
    /// instance owned by someone else must come back as `None`, exactly as
    /// if it did not exist.
    async fn find(
        &self,
        instance_id: &str,
        requester: &Principal,
    ) -> Result<Option<InstanceDescriptor>>;
}
