// ============================================================================
// Transaction Change Tracking
// ============================================================================
//
// A transaction buffers its writes as `Change`s keyed by the full store key
// (column family prefix + encoded key). Later writes to the same key replace
// earlier ones, so at commit time each key carries exactly one change.
//
// ============================================================================

use serde::{Deserialize, Serialize};

/// The final effect of a transaction on one store key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Change {
    Put(Vec<u8>),
    Delete,
}

impl Change {
    /// The value visible through this change, `None` for deletes.
    pub fn value(&self) -> Option<&[u8]> {
        match self {
            Change::Put(value) => Some(value),
            Change::Delete => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Change::Delete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_visibility() {
        assert_eq!(Change::Put(vec![1, 2]).value(), Some(&[1u8, 2][..]));
        assert_eq!(Change::Delete.value(), None);
        assert!(Change::Delete.is_delete());
    }
}
