use xxhash_rust::xxh3::xxh3_64;

/// Hash a string into a 16 character hex identifier.
pub fn hash_string(value: impl AsRef<[u8]>) -> String {
  format!("{:016x}", xxh3_64(value.as_ref()))
}

/// Short 8 character hash used when generated chunk names get too long
/// or when path info should be hidden from output names.
pub fn short_hash(value: impl AsRef<[u8]>) -> String {
  let mut hashed = hash_string(value);
  hashed.truncate(8);
  hashed
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn hash_string_is_stable() {
    assert_eq!(hash_string("vendors"), hash_string("vendors"));
    assert_ne!(hash_string("vendors"), hash_string("commons"));
  }

  #[test]
  fn short_hash_is_a_prefix() {
    let full = hash_string("pages/index");
    assert_eq!(short_hash("pages/index"), full[..8]);
  }
}
