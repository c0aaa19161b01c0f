//! Cache stamps for query responses.

use settra_store::StateStore;
use sha2::{Digest, Sha256};

/// The ETag of the current state: a digest over the store's mutation stamp
/// and the context-feature order.
///
/// Any committed write bumps the stamp, so a matching `If-None-Match` proves
/// the client's copy is current.
pub fn state_etag(store: &StateStore) -> String {
    let mut hasher = Sha256::new();
    hasher.update(store.stamp().to_be_bytes());
    for feature in store.context_features() {
        hasher.update(feature.as_bytes());
        hasher.update([0u8]);
    }
    format!("\"{:x}\"", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn etag_is_stable_until_a_write_lands() {
        let mut store = StateStore::new();
        store.add_context_feature("user").expect("feature should add");
        let first = state_etag(&store);
        assert_eq!(first, state_etag(&store));

        store.add_context_feature("theme").expect("feature should add");
        assert_ne!(first, state_etag(&store));
    }

    #[test]
    fn etag_is_a_quoted_hex_digest() {
        let store = StateStore::new();
        let etag = state_etag(&store);
        assert!(etag.starts_with('"') && etag.ends_with('"'));
        assert_eq!(etag.len(), 66);
    }
}
