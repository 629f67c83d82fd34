//! Cache key fingerprinting.
//!
//! Keys are 64-bit fingerprints produced by a fast non-cryptographic hash.
//! One key is built from up to several independent *sub-keys* (request path,
//! request body, selected header values, a caller-supplied contribution),
//! each itself a fingerprint over an ordered list of byte fragments.
//!
//! **NOTE**: Care must be taken to make sure that the hashed material is
//! stable, as it would otherwise lead to bad cache reuse.

use std::hash::Hasher;

use rustc_hash::FxHasher;

/// Fingerprints an ordered sequence of byte fragments.
///
/// The same sequence always produces the same value; fragment order within
/// the sequence matters. An empty sequence hashes to `0`.
pub fn hash_fragments<T: AsRef<[u8]>>(fragments: &[T]) -> u64 {
    let mut hasher = FxHasher::default();
    for fragment in fragments {
        hasher.write(fragment.as_ref());
    }
    hasher.finish()
}

/// Combines independent sub-key fingerprints into one cache key.
///
/// The sub-keys are hashed as a fixed-position tuple rather than summed, so
/// that two requests whose sub-keys merely trade places cannot collide.
/// Disabled features contribute a `0` sub-key at their position.
pub fn combine_keys(sub_keys: &[u64]) -> u64 {
    let mut hasher = FxHasher::default();
    for sub_key in sub_keys {
        hasher.write_u64(*sub_key);
    }
    hasher.finish()
}
