//! Access gate: credential -> principal -> upstream port.

use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

use uiproxy_common::{IdentityService, InstanceRegistry, Principal};

use crate::error::ProxyError;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("unauthenticated")]
    Unauthenticated,

    /// Absent or owned by someone else; callers cannot tell which.
    #[error("instance not found")]
    NotFound,

    #[error("instance is not running")]
    NotRunning,

    #[error("instance registry failed: {0}")]
    Registry(#[from] uiproxy_common::Error),
}

impl From<GateError> for ProxyError {
    fn from(e: GateError) -> Self {
        match e {
            GateError::Unauthenticated => ProxyError::Unauthenticated,
            GateError::NotFound => ProxyError::NotFound,
            GateError::NotRunning => ProxyError::NotRunning,
            GateError::Registry(e) => ProxyError::Internal(e.to_string()),
        }
    }
}

/// Resolves who is asking and where their instance listens.
#[derive(Clone)]
pub struct AccessGate {
    identity: Arc<dyn IdentityService>,
    registry: Arc<dyn InstanceRegistry>,
}

impl AccessGate {
    pub fn new(identity: Arc<dyn IdentityService>, registry: Arc<dyn InstanceRegistry>) -> Self {
        Self { identity, registry }
    }

    /// Resolve a raw credential to a principal.
    pub async fn authenticate(&self, credential: &str) -> Result<Principal, GateError> {
        if credential.is_empty() {
            return Err(GateError::Unauthenticated);
        }
        self.identity.verify(credential).await.map_err(|e| {
            debug!("credential rejected: {}", e);
            GateError::Unauthenticated
        })
    }

    /// Resolve the upstream port of `instance_id` for an authenticated principal.
    pub async fn resolve_port(&self, instance_id: &str, principal: &Principal) -> Result<u16, GateError> {
        let instance = self
            .registry
            .find(instance_id, principal)
            .await
            .map_err(|e| {
                error!(instance_id = %instance_id, "instance lookup failed: {}", e);
                GateError::Registry(e)
            })?
            // The registry filters by owner already; re-check so a lax
            // implementation cannot leak other users' instances.
            .filter(|instance| principal.can_access(&instance.owner_id))
            .ok_or(GateError::NotFound)?;

        instance.running_port().ok_or(GateError::NotRunning)
    }

    /// Full check: authenticate, then authorize against the instance.
    pub async fn authorize(&self, instance_id: &str, credential: &str) -> Result<u16, GateError> {
        let principal = self.authenticate(credential).await?;
        self.resolve_port(instance_id, &principal).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use uiproxy_common::{AuthError, InstanceDescriptor, InstanceStatus, Role};

    struct StaticIdentities(HashMap<&'static str, Principal>);

    #[async_trait]
    impl IdentityService for StaticIdentities {
        async fn verify(&self, credential: &str) -> Result<Principal, AuthError> {
            self.0
                .get(credential)
                .cloned()
                .ok_or_else(|| AuthError::Invalid("unknown token".into()))
        }
    }

    /// Ignores the requester entirely, like a registry that forgot the owner filter.
    struct UnfilteredRegistry(Vec<InstanceDescriptor>);

    #[async_trait]
    impl InstanceRegistry for UnfilteredRegistry {
        async fn find(
            &self,
            instance_id: &str,
            _requester: &Principal,
        ) -> uiproxy_common::Result<Option<InstanceDescriptor>> {
            Ok(self.0.iter().find(|i| i.id == instance_id).cloned())
        }
    }

    fn principal(id: &str, role: Role) -> Principal {
        Principal {
            id: id.into(),
            display_name: id.into(),
            role,
        }
    }

    fn gate() -> AccessGate {
        let identities = StaticIdentities(HashMap::from([
            ("tok-u1", principal("u1", Role::User)),
            ("tok-admin", principal("root", Role::Admin)),
        ]));
        let registry = UnfilteredRegistry(vec![
            InstanceDescriptor {
                id: "i1".into(),
                owner_id: "u1".into(),
                status: InstanceStatus::Running,
                port: Some(7000),
            },
            InstanceDescriptor {
                id: "i2".into(),
                owner_id: "u2".into(),
                status: InstanceStatus::Stopped,
                port: None,
            },
            InstanceDescriptor {
                id: "i4".into(),
                owner_id: "u1".into(),
                status: InstanceStatus::Stopping,
                port: Some(7200),
            },
        ]);
        AccessGate::new(Arc::new(identities), Arc::new(registry))
    }

    #[tokio::test]
    async fn test_owner_gets_port() {
        assert_eq!(gate().authorize("i1", "tok-u1").await.unwrap(), 7000);
    }

    #[tokio::test]
    async fn test_bad_or_empty_credential() {
        assert!(matches!(gate().authorize("i1", "").await, Err(GateError::Unauthenticated)));
        assert!(matches!(gate().authorize("i1", "forged").await, Err(GateError::Unauthenticated)));
    }

    #[tokio::test]
    async fn test_foreign_instance_is_indistinguishable_from_missing() {
        let gate = gate();
        // i2 is stopped, but ownership is checked first.
        assert!(matches!(gate.authorize("i2", "tok-u1").await, Err(GateError::NotFound)));
        assert!(matches!(gate.authorize("missing", "tok-u1").await, Err(GateError::NotFound)));
    }

    #[tokio::test]
    async fn test_not_running() {
        let gate = gate();
        assert!(matches!(gate.authorize("i4", "tok-u1").await, Err(GateError::NotRunning)));
        assert!(matches!(gate.authorize("i2", "tok-admin").await, Err(GateError::NotRunning)));
    }

    #[tokio::test]
    async fn test_admin_reaches_any_running_instance() {
        assert_eq!(gate().authorize("i1", "tok-admin").await.unwrap(), 7000);
    }
}
