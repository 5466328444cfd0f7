//! What this federator has already signed, so it never signs two conflicting claims.

use async_trait::async_trait;

use crate::{errors::DbResult, types::SignedClaim};

/// Storage for signed claims, one commitment per resource and bridge.
#[async_trait]
pub trait SignedClaimsDb {
    /// Records every claim or none of them.
    ///
    /// Recording a claim again with the same commitment succeeds. A resource already signed for a
    /// different commitment fails with [`DbError::Conflict`](crate::DbError::Conflict) and leaves
    /// the store unchanged.
    async fn record_signed_claims(&self, bridge: &str, claims: &[SignedClaim]) -> DbResult<()>;

    /// The commitment signed for `resource`, if any.
    async fn signed_claim(&self, bridge: &str, resource: &str) -> DbResult<Option<String>>;
}
