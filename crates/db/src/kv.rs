//! Namespaced string checkpoints.

use async_trait::async_trait;

use crate::errors::DbResult;

/// A string-valued key-value store for scan checkpoints.
#[async_trait]
pub trait KeyValueStore {
    /// The value at `key`, if set.
    async fn get_value(&self, key: &str) -> DbResult<Option<String>>;

    /// Sets `key` to `value`.
    async fn set_value(&self, key: &str, value: &str) -> DbResult<()>;

    /// Sets `key` to `value` only if it currently holds `expected`. Returns whether it was set.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
    ) -> DbResult<bool>;
}
