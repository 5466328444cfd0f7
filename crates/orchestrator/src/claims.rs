//! Remembering what this federator signed before it signs.

use federator_db::{types::SignedClaim, Database, DbError};

use crate::errors::{BridgeError, BridgeResult};

/// Records `claims` for `bridge`, or fails with [`BridgeError::ConflictingClaim`] when any of
/// their resources was already signed for something else. Call it before signing.
pub async fn record_claims(
    db: &dyn Database,
    bridge: &str,
    claims: &[SignedClaim],
) -> BridgeResult<()> {
    db.record_signed_claims(bridge, claims)
        .await
        .map_err(|err| match err {
            DbError::Conflict(reason) => BridgeError::ConflictingClaim(reason),
            err => err.into(),
        })
}

#[cfg(test)]
mod tests {
    use federator_db::InMemoryDb;

    use super::*;

    #[tokio::test]
    async fn a_second_commitment_is_a_conflicting_claim() {
        let db = InMemoryDb::default();
        let claim = |commitment| [SignedClaim::new("rune-burn:0xaa:1", commitment)];

        record_claims(&db, "runes", &claim("txid-1")).await.unwrap();
        record_claims(&db, "runes", &claim("txid-1")).await.unwrap();
        let err = record_claims(&db, "runes", &claim("txid-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::ConflictingClaim(_)));
    }
}
