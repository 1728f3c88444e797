use std::fmt;

/// Logically separate keyspaces of the state store.
///
/// Every stored key is prefixed with the column family code (big endian), so
/// each family occupies one contiguous ordered range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ColumnFamily {
    Default,
    Key,
    LastProcessedPosition,
    Jobs,
    JobStates,
    JobDeadlines,
    JobActivatable,
    JobBackoff,
    Messages,
    MessageDeadlines,
    MessageIds,
    Routing,
    Checkpoint,
    Exporter,
}

impl ColumnFamily {
    pub const ALL: [ColumnFamily; 14] = [
        ColumnFamily::Default,
        ColumnFamily::Key,
        ColumnFamily::LastProcessedPosition,
        ColumnFamily::Jobs,
        ColumnFamily::JobStates,
        ColumnFamily::JobDeadlines,
        ColumnFamily::JobActivatable,
        ColumnFamily::JobBackoff,
        ColumnFamily::Messages,
        ColumnFamily::MessageDeadlines,
        ColumnFamily::MessageIds,
        ColumnFamily::Routing,
        ColumnFamily::Checkpoint,
        ColumnFamily::Exporter,
    ];

    pub fn code(&self) -> u16 {
        match self {
            ColumnFamily::Default => 0,
            ColumnFamily::Key => 1,
            ColumnFamily::LastProcessedPosition => 2,
            ColumnFamily::Jobs => 10,
            ColumnFamily::JobStates => 11,
            ColumnFamily::JobDeadlines => 12,
            ColumnFamily::JobActivatable => 13,
            ColumnFamily::JobBackoff => 14,
            ColumnFamily::Messages => 20,
            ColumnFamily::MessageDeadlines => 21,
            ColumnFamily::MessageIds => 22,
            ColumnFamily::Routing => 30,
            ColumnFamily::Checkpoint => 40,
            ColumnFamily::Exporter => 50,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        Self::ALL.iter().copied().find(|cf| cf.code() == code)
    }

    pub fn prefix(&self) -> [u8; 2] {
        self.code().to_be_bytes()
    }

    /// Full store key: family prefix followed by the encoded key.
    pub fn qualify(&self, key: &[u8]) -> Vec<u8> {
        let mut full = Vec::with_capacity(2 + key.len());
        full.extend_from_slice(&self.prefix());
        full.extend_from_slice(key);
        full
    }

    /// Splits a full store key into its family and the encoded key.
    pub fn split(full_key: &[u8]) -> Option<(ColumnFamily, &[u8])> {
        if full_key.len() < 2 {
            return None;
        }
        let code = u16::from_be_bytes([full_key[0], full_key[1]]);
        Self::from_code(code).map(|cf| (cf, &full_key[2..]))
    }
}

impl fmt::Display for ColumnFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ColumnFamily::Default => "DEFAULT",
            ColumnFamily::Key => "KEY",
            ColumnFamily::LastProcessedPosition => "LAST_PROCESSED_POSITION",
            ColumnFamily::Jobs => "JOBS",
            ColumnFamily::JobStates => "JOB_STATES",
            ColumnFamily::JobDeadlines => "JOB_DEADLINES",
            ColumnFamily::JobActivatable => "JOB_ACTIVATABLE",
            ColumnFamily::JobBackoff => "JOB_BACKOFF",
            ColumnFamily::Messages => "MESSAGES",
            ColumnFamily::MessageDeadlines => "MESSAGE_DEADLINES",
            ColumnFamily::MessageIds => "MESSAGE_IDS",
            ColumnFamily::Routing => "ROUTING",
            ColumnFamily::Checkpoint => "CHECKPOINT",
            ColumnFamily::Exporter => "EXPORTER",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_unique() {
        for cf in ColumnFamily::ALL {
            assert_eq!(ColumnFamily::from_code(cf.code()), Some(cf));
        }
    }

    #[test]
    fn test_split_qualified_key() {
        let full = ColumnFamily::Jobs.qualify(&[7, 8]);
        let (cf, key) = ColumnFamily::split(&full).unwrap();
        assert_eq!(cf, ColumnFamily::Jobs);
        assert_eq!(key, &[7, 8]);
        assert!(ColumnFamily::split(&[0]).is_none());
    }
}
