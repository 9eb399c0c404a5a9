//! Credential verification
//!
//! Every request presents an opaque API key in the `X-Api-Key` header. The
//! gate hashes it, resolves the record by hash, and checks active flag,
//! expiry, and role. The raw key is never stored or logged; the last-used
//! timestamp is advanced fire-and-forget.
//!
//! Authentication never degrades: a durable-store outage fails closed.

use lexflow_core::{
    CredentialHash, CredentialId, GateError, LexflowError, LexflowResult, PrincipalRole,
    RateLimitTier,
};
use lexflow_storage::DurableStore;
use std::sync::Arc;

/// The credential header shared by all endpoints.
pub const CREDENTIAL_HEADER: &str = "x-api-key";

/// A verified principal, injected into request extensions by the gate
/// middleware.
#[derive(Debug, Clone)]
pub struct Principal {
    pub credential_id: CredentialId,
    pub role: PrincipalRole,
    pub tier: RateLimitTier,
}

/// The verification half of the gate.
#[derive(Clone)]
pub struct CredentialVerifier {
    store: Arc<dyn DurableStore>,
}

impl CredentialVerifier {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self { store }
    }

    /// Verify a presented credential against the store.
    ///
    /// `required` is the minimum role for the route; the default gate
    /// requires `Guest` (any verified principal) and admin routes check
    /// again with `Admin`.
    pub async fn verify(
        &self,
        presented: Option<&str>,
        required: PrincipalRole,
    ) -> LexflowResult<Principal> {
        let presented = presented
            .filter(|s| !s.trim().is_empty())
            .ok_or(LexflowError::Gate(GateError::MissingCredential))?;

        let hash = CredentialHash::digest(presented);
        let record = self
            .store
            .credential_by_hash(&hash)
            .await?
            .ok_or(LexflowError::Gate(GateError::InvalidCredential))?;

        if !record.active {
            return Err(GateError::InactiveCredential.into());
        }

        let now = chrono::Utc::now();
        if record.is_expired(now) {
            return Err(GateError::ExpiredCredential.into());
        }

        if !record.role.satisfies(required) {
            return Err(GateError::ForbiddenRole {
                required,
                actual: record.role,
            }
            .into());
        }

        // Fire-and-forget: a failed write is a warning, never a rejection
        let store = self.store.clone();
        let credential_id = record.credential_id;
        tokio::spawn(async move {
            if let Err(e) = store.touch_credential(credential_id, now).await {
                tracing::warn!(%credential_id, error = %e, "last-used update failed");
            }
        });

        Ok(Principal {
            credential_id: record.credential_id,
            role: record.role,
            tier: record.tier,
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use lexflow_core::CredentialRecord;
    use lexflow_storage::MemoryStore;

    async fn verifier_with(record: CredentialRecord) -> CredentialVerifier {
        let store = Arc::new(MemoryStore::new());
        store.insert_credential(&record).await.unwrap();
        CredentialVerifier::new(store)
    }

    #[tokio::test]
    async fn test_valid_credential() {
        let record = CredentialRecord::new("lx_valid", PrincipalRole::User, RateLimitTier::Standard);
        let verifier = verifier_with(record.clone()).await;

        let principal = verifier
            .verify(Some("lx_valid"), PrincipalRole::Guest)
            .await
            .unwrap();
        assert_eq!(principal.credential_id, record.credential_id);
        assert_eq!(principal.tier, RateLimitTier::Standard);
    }

    #[tokio::test]
    async fn test_missing_credential() {
        let record = CredentialRecord::new("lx_key", PrincipalRole::User, RateLimitTier::Standard);
        let verifier = verifier_with(record).await;

        let err = verifier.verify(None, PrincipalRole::Guest).await.unwrap_err();
        assert!(matches!(
            err,
            LexflowError::Gate(GateError::MissingCredential)
        ));

        let err = verifier
            .verify(Some("   "), PrincipalRole::Guest)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LexflowError::Gate(GateError::MissingCredential)
        ));
    }

    #[tokio::test]
    async fn test_unknown_credential() {
        let record = CredentialRecord::new("lx_key", PrincipalRole::User, RateLimitTier::Standard);
        let verifier = verifier_with(record).await;

        let err = verifier
            .verify(Some("lx_other"), PrincipalRole::Guest)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LexflowError::Gate(GateError::InvalidCredential)
        ));
    }

    #[tokio::test]
    async fn test_inactive_credential() {
        let mut record =
            CredentialRecord::new("lx_key", PrincipalRole::User, RateLimitTier::Standard);
        record.active = false;
        let verifier = verifier_with(record).await;

        let err = verifier
            .verify(Some("lx_key"), PrincipalRole::Guest)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LexflowError::Gate(GateError::InactiveCredential)
        ));
    }

    #[tokio::test]
    async fn test_expired_credential() {
        let mut record =
            CredentialRecord::new("lx_key", PrincipalRole::User, RateLimitTier::Standard);
        record.expires_at = Some(chrono::Utc::now() - chrono::Duration::hours(1));
        let verifier = verifier_with(record).await;

        let err = verifier
            .verify(Some("lx_key"), PrincipalRole::Guest)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LexflowError::Gate(GateError::ExpiredCredential)
        ));
    }

    #[tokio::test]
    async fn test_forbidden_role() {
        let record = CredentialRecord::new("lx_key", PrincipalRole::User, RateLimitTier::Standard);
        let verifier = verifier_with(record).await;

        let err = verifier
            .verify(Some("lx_key"), PrincipalRole::Admin)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LexflowError::Gate(GateError::ForbiddenRole { .. })
        ));
    }

    #[tokio::test]
    async fn test_last_used_advances() {
        let store = Arc::new(MemoryStore::new());
        let record = CredentialRecord::new("lx_key", PrincipalRole::User, RateLimitTier::Standard);
        store.insert_credential(&record).await.unwrap();
        let verifier = CredentialVerifier::new(store.clone());

        verifier
            .verify(Some("lx_key"), PrincipalRole::Guest)
            .await
            .unwrap();
        // The touch is spawned; give it a tick to land
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let stored = store
            .credential_by_hash(&CredentialHash::digest("lx_key"))
            .await
            .unwrap()
            .unwrap();
        assert!(stored.last_used_at.is_some());
    }
}
