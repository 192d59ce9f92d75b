use std::fmt;

/// Machine-readable error codes for operators and log processors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    ConfigParseError,
    ConfigInvalid,
    ObjectNotFound,
    StoreUnavailable,
    InvalidObjectKey,
    DirectoryUnavailable,
    DirectoryUnauthorized,
    MalformedEventKey,
    MalformedFeedRecord,
    ArtifactMissing,
    SnapshotCorrupt,
    LocalWriteFailed,
    LockContention,
    SweepInProgress,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::ConfigParseError => "E1001",
            Self::ConfigInvalid => "E1002",
            Self::ObjectNotFound => "E2001",
            Self::StoreUnavailable => "E2002",
            Self::InvalidObjectKey => "E2003",
            Self::DirectoryUnavailable => "E2101",
            Self::DirectoryUnauthorized => "E2102",
            Self::MalformedEventKey => "E3001",
            Self::MalformedFeedRecord => "E3002",
            Self::ArtifactMissing => "E4001",
            Self::SnapshotCorrupt => "E4002",
            Self::LocalWriteFailed => "E5001",
            Self::LockContention => "E5002",
            Self::SweepInProgress => "E5003",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::ConfigParseError => "Config file parse error",
            Self::ConfigInvalid => "Invalid configuration value",
            Self::ObjectNotFound => "Object not found in blob store",
            Self::StoreUnavailable => "Blob store request failed",
            Self::InvalidObjectKey => "Object key escapes the bucket root",
            Self::DirectoryUnavailable => "Activity directory request failed",
            Self::DirectoryUnauthorized => "Activity directory rejected credentials",
            Self::MalformedEventKey => "Event key does not match the traces topic layout",
            Self::MalformedFeedRecord => "Event feed record could not be decoded",
            Self::ArtifactMissing => "Compaction artifact missing",
            Self::SnapshotCorrupt => "Registry snapshot could not be decoded",
            Self::LocalWriteFailed => "Local cache write failed",
            Self::LockContention => "Lock contention",
            Self::SweepInProgress => "Compaction sweep already running",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::ConfigParseError => Some("Fix syntax in the compactor config file and retry."),
            Self::ConfigInvalid => Some("Check the environment overrides and config file values."),
            Self::ObjectNotFound => None,
            Self::InvalidObjectKey => {
                Some("Check activity ids and owner names reported by the directory.")
            }
            Self::StoreUnavailable => Some("Check blob store connectivity; the next sweep retries."),
            Self::DirectoryUnavailable => {
                Some("Check activity directory connectivity; the next sweep retries.")
            }
            Self::DirectoryUnauthorized => {
                Some("Verify SIMVA_USER / SIMVA_PASSWORD for the activity directory.")
            }
            Self::MalformedEventKey => Some("Verify MINIO_TOPICS_DIR and MINIO_TRACES_TOPIC."),
            Self::MalformedFeedRecord => None,
            Self::ArtifactMissing => {
                Some("Run `trace-compactor check --recover` to rebuild the activity.")
            }
            Self::SnapshotCorrupt => {
                Some("Restore state.json from the remote mirror or remove it to start fresh.")
            }
            Self::LocalWriteFailed => Some("Check disk space and write permissions."),
            Self::LockContention => {
                Some("Another compactor holds the cache lock; stop it or use another root.")
            }
            Self::SweepInProgress => None,
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
