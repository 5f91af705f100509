//! Typed identifiers
//!
//! Every table in the catalog is keyed by plain integers in the product's
//! database. Newtypes keep a chunk id from being passed where a volume id
//! is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            pub fn get(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }
    };
}

define_id!(
    /// Deduplication store (SIDB engine) id
    StoreId
);
define_id!(
    /// Partition of a store's signature index
    SubstoreId
);
define_id!(
    /// Chunk id, unique across the catalog
    ChunkId
);
define_id!(
    /// Volume a chunk is written into
    VolumeId
);
define_id!(
    /// Mount path of a disk library
    MountPathId
);
define_id!(
    /// Backup job id
    JobId
);
define_id!(
    /// Subclient (backup content definition) id
    SubclientId
);
define_id!(
    /// Verification (DV2) job id
    VerificationJobId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_display_and_serde() {
        let id = ChunkId(42);
        assert_eq!(id.to_string(), "42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "42");
        let parsed: ChunkId = serde_json::from_str("42").unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_id_as_map_key() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(StoreId(7), true);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"7":true}"#);
        let back: std::collections::BTreeMap<StoreId, bool> = serde_json::from_str(&json).unwrap();
        assert_eq!(back.get(&StoreId(7)), Some(&true));
    }
}
