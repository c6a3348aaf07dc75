//! JWT-backed identity service.
//!
//! Tokens are issued by the account backend with a shared HMAC secret and
//! carry the identity id in `sub`. A valid signature is not enough: the
//! identity must still exist in the account store.

use async_trait::async_trait;
use jsonwebtoken::{decode, errors::ErrorKind, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

use uiproxy_common::{AuthError, IdentityService, Principal, PrincipalStore};

#[derive(Debug, Clone, Deserialize)]
struct AccessClaims {
    sub: Option<String>,
}

/// Verifies bearer JWTs and resolves their subject to a principal
pub struct JwtIdentityService {
    key: DecodingKey,
    validation: Validation,
    principals: Arc<dyn PrincipalStore>,
}

impl JwtIdentityService {
    pub fn new(secret: &str, algorithm: Algorithm, principals: Arc<dyn PrincipalStore>) -> Self {
        let mut validation = Validation::new(algorithm);
        validation.set_required_spec_claims(&["exp"]);
        validation.validate_exp = true;

        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
            principals,
        }
    }
}

#[async_trait]
impl IdentityService for JwtIdentityService {
    async fn verify(&self, credential: &str) -> Result<Principal, AuthError> {
        let data = decode::<AccessClaims>(credential, &self.key, &self.validation).map_err(|e| {
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Invalid(e.to_string()),
            }
        })?;

        let subject = data
            .claims
            .sub
            .filter(|s| !s.is_empty())
            .ok_or(AuthError::MissingSubject)?;

        match self.principals.principal(&subject).await? {
            Some(principal) => {
                debug!(identity_id = %principal.id, role = %principal.role, "credential verified");
                Ok(principal)
            }
            None => Err(AuthError::UnknownIdentity(subject)),
        }
    }
}
