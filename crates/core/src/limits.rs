//! Size and naming bounds enforced throughout the engine (§3, §6).

/// Maximum JSON document payload size: 16 MiB.
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Maximum wire protocol frame size: 16 MiB.
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Maximum collection name length in bytes.
pub const MAX_COLLECTION_NAME_LEN: usize = 64;

/// Collection name used when a write omits one, or passes an empty string.
pub const DEFAULT_COLLECTION: &str = "_default";

/// Default shard count for the MVCC index. Must remain a power of two.
pub const DEFAULT_SHARD_COUNT: usize = 256;

/// Default partition count for a newly created database.
pub const DEFAULT_PARTITION_COUNT: u16 = 1;

/// Normalize a collection name per §3: empty becomes `_default`; length is
/// bounds-checked against [`MAX_COLLECTION_NAME_LEN`].
pub fn normalize_collection_name(name: &str) -> crate::error::Result<String> {
    let name = if name.is_empty() { DEFAULT_COLLECTION } else { name };
    if name.len() > MAX_COLLECTION_NAME_LEN {
        return Err(crate::error::Error::InvalidPayload(format!(
            "collection name exceeds {MAX_COLLECTION_NAME_LEN} bytes"
        )));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_name_normalizes_to_default() {
        assert_eq!(normalize_collection_name("").unwrap(), DEFAULT_COLLECTION);
    }

    #[test]
    fn overlong_name_is_rejected() {
        let long = "x".repeat(MAX_COLLECTION_NAME_LEN + 1);
        assert!(normalize_collection_name(&long).is_err());
    }

    #[test]
    fn max_length_name_is_accepted() {
        let exact = "x".repeat(MAX_COLLECTION_NAME_LEN);
        assert_eq!(normalize_collection_name(&exact).unwrap(), exact);
    }
}
