//! Option-combination digests.

use sha2::{Digest, Sha256};

/// SHA-256 over the sorted, distinct option-value ids, hex encoded.
///
/// An empty selection has no digest: it identifies the default variant.
pub fn options_digest(option_value_ids: &[i64]) -> Option<String> {
    let mut ids = option_value_ids.to_vec();
    ids.sort_unstable();
    ids.dedup();
    if ids.is_empty() {
        return None;
    }

    let canonical = ids
        .iter()
        .map(i64::to_string)
        .collect::<Vec<_>>()
        .join(",");

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Some(format!("{:x}", hasher.finalize()))
}
