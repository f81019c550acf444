use xxhash_rust::xxh3::xxh3_64;

/// Prefix of every kernel set owned by knpd.
pub const SET_PREFIX: &str = "knpd-";

/// Fixed-width hash of a human-readable name.
///
/// This is the only transformation applied to names before they reach the kernel, so it must
/// stay stable across releases: a change would orphan every set and chain of a running node.
pub fn hash(name: &str) -> String {
    format!("{:010}", xxh3_64(name.as_bytes()) as u32)
}

/// Kernel name of the set with the given (prefixed) name.
pub fn set_name(name: &str) -> String {
    format!("{SET_PREFIX}{}", hash(name))
}
