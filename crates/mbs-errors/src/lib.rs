//! Error taxonomy for the MongoDB backup engine and its retry classifier.
//!
//! The shape mirrors the engine's own phase structure: a closed top-level
//! [`MbsError`] with nested, per-component sub-enums (`DumpError`, `TargetError`,
//! `VolumeError`) reachable through `#[error(transparent)]`/`#[from]`. Retriability
//! is a property of the *variant*, checked exhaustively through [`Retriable`] rather
//! than by pattern-matching on a message string.

use std::fmt;

use thiserror::Error;

/// Whether an error is safe to retry without operator intervention.
///
/// A `match` is required of every implementor, so adding a new `MbsError` variant
/// without updating this trait is a compile error, not a silent misclassification.
pub trait Retriable {
    fn is_retriable(&self) -> bool;
}

/// Top-level error taxonomy. Variant names follow the original exception
/// hierarchy's class names, flattened to one enum (with component sub-enums
/// nested via `#[from]`) since Rust has no exception inheritance to lean on.
#[derive(Debug, Error)]
pub enum MbsError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("could not establish a database connection to '{uri}'")]
    Connection { uri: String },

    #[error("failed to authenticate to '{uri}'")]
    AuthenticationFailed { uri: String },

    #[error("replicaset error: {0}")]
    Replicaset(String),

    #[error("unable to determine primary for cluster '{uri}'")]
    PrimaryNotFound { uri: String },

    #[error("no eligible members in '{uri}' found to take backup from")]
    NoEligibleMembersFound { uri: String },

    #[error(transparent)]
    Dump(#[from] DumpError),

    #[error("failed to zip and compress the backup")]
    Archive,

    #[error(
        "data size of {} ({data_size} bytes) exceeds the maximum limit ({max_size} bytes)",
        database_name.as_deref().map(|n| format!("database '{n}'")).unwrap_or_else(|| "all databases".to_string())
    )]
    SourceDataSizeExceedsLimits {
        database_name: Option<String>,
        data_size: u64,
        max_size: u64,
    },

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error("strategy requires the source to be on localhost but the connector is remote")]
    BackupNotOnLocalhost,

    #[error(transparent)]
    Volume(#[from] VolumeError),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error(transparent)]
    Restore(#[from] RestoreError),

    #[error("failed to extract the source backup archive")]
    Extract,

    #[error("failed to create task workspace")]
    WorkspaceCreation,

    #[error("balancer became active during the snapshot critical section")]
    BalancerActive,
}

impl Retriable for MbsError {
    fn is_retriable(&self) -> bool {
        use MbsError::*;
        match self {
            Configuration(_) => false,
            Connection { .. } => true,
            AuthenticationFailed { .. } => false,
            Replicaset(_) => true,
            PrimaryNotFound { .. } => true,
            NoEligibleMembersFound { .. } => true,
            Dump(e) => e.is_retriable(),
            Archive => false,
            SourceDataSizeExceedsLimits { .. } => false,
            Target(e) => e.is_retriable(),
            BackupNotOnLocalhost => true,
            Volume(e) => e.is_retriable(),
            InvalidPlan(_) => false,
            Restore(_) => false,
            Extract => false,
            WorkspaceCreation => true,
            BalancerActive => true,
        }
    }
}

/// Dump-phase errors. All variants carry only a return code and the last dump
/// log line, never the invoked command or raw stderr, which could contain
/// credentials embedded in the dump URI.
#[derive(Debug, Error)]
pub enum DumpError {
    #[error(
        "failed to mongodump: exit status {return_code}, last log line: {last_log_line}"
    )]
    Generic {
        return_code: i32,
        last_log_line: String,
    },

    #[error(
        "failed to mongodump, possibly due to a collection name containing invalid \
         characters (e.g. '/'); rename or drop the offending collection(s)"
    )]
    BadCollectionName {
        return_code: i32,
        last_log_line: String,
    },

    #[error("failed to mongodump: invalid BSON object size (code 10334)")]
    InvalidBsonObjSize {
        return_code: i32,
        last_log_line: String,
    },

    #[error("failed to mongodump: capped cursor overrun (code 13338)")]
    CappedCursorOverrun {
        return_code: i32,
        last_log_line: String,
    },

    #[error("failed to mongodump because the database name is invalid (code 13280)")]
    InvalidDbName {
        return_code: i32,
        last_log_line: String,
    },

    #[error("failed to mongodump: bad type (code 10320)")]
    BadType {
        return_code: i32,
        last_log_line: String,
    },

    #[error("mongoctl could not connect to the source for dump")]
    MongoctlConnection {
        return_code: i32,
        last_log_line: String,
    },

    #[error("failed to mongodump: cursor did not exist on server")]
    CursorDoesNotExist {
        return_code: i32,
        last_log_line: String,
    },

    #[error("failed to mongodump: exhaust receive error (code 16465)")]
    ExhaustReceive {
        return_code: i32,
        last_log_line: String,
    },

    #[error("failed to mongodump: connectivity error")]
    DumpConnectivity {
        return_code: i32,
        last_log_line: String,
    },

    #[error("failed to mongodump: DBClientCursor failed")]
    DbClientCursorFail {
        return_code: i32,
        last_log_line: String,
    },
}

impl DumpError {
    pub fn return_code(&self) -> i32 {
        use DumpError::*;
        match self {
            Generic { return_code, .. }
            | BadCollectionName { return_code, .. }
            | InvalidBsonObjSize { return_code, .. }
            | CappedCursorOverrun { return_code, .. }
            | InvalidDbName { return_code, .. }
            | BadType { return_code, .. }
            | MongoctlConnection { return_code, .. }
            | CursorDoesNotExist { return_code, .. }
            | ExhaustReceive { return_code, .. }
            | DumpConnectivity { return_code, .. }
            | DbClientCursorFail { return_code, .. } => *return_code,
        }
    }

    pub fn last_log_line(&self) -> &str {
        use DumpError::*;
        match self {
            Generic { last_log_line, .. }
            | BadCollectionName { last_log_line, .. }
            | InvalidBsonObjSize { last_log_line, .. }
            | CappedCursorOverrun { last_log_line, .. }
            | InvalidDbName { last_log_line, .. }
            | BadType { last_log_line, .. }
            | MongoctlConnection { last_log_line, .. }
            | CursorDoesNotExist { last_log_line, .. }
            | ExhaustReceive { last_log_line, .. }
            | DumpConnectivity { last_log_line, .. }
            | DbClientCursorFail { last_log_line, .. } => last_log_line,
        }
    }
}

impl Retriable for DumpError {
    fn is_retriable(&self) -> bool {
        use DumpError::*;
        match self {
            Generic { .. } | BadCollectionName { .. } | InvalidDbName { .. } => false,
            InvalidBsonObjSize { .. }
            | CappedCursorOverrun { .. }
            | BadType { .. }
            | MongoctlConnection { .. }
            | CursorDoesNotExist { .. }
            | ExhaustReceive { .. }
            | DumpConnectivity { .. }
            | DbClientCursorFail { .. } => true,
        }
    }
}

/// Classifies a finished dump subprocess by return code and the last line of
/// its log file. Kept as a small ordered rule table so a new code or
/// substring is a one-line addition (see the module's doc comment).
pub fn classify_dump_error(return_code: i32, last_log_line: &str) -> DumpError {
    let rc = return_code;
    let line = last_log_line;
    if rc == 245 {
        DumpError::BadCollectionName {
            return_code: rc,
            last_log_line: line.to_string(),
        }
    } else if line.contains("10334") {
        DumpError::InvalidBsonObjSize {
            return_code: rc,
            last_log_line: line.to_string(),
        }
    } else if line.contains("13338") {
        DumpError::CappedCursorOverrun {
            return_code: rc,
            last_log_line: line.to_string(),
        }
    } else if line.contains("13280") {
        DumpError::InvalidDbName {
            return_code: rc,
            last_log_line: line.to_string(),
        }
    } else if line.contains("10320") {
        DumpError::BadType {
            return_code: rc,
            last_log_line: line.to_string(),
        }
    } else if line.contains("Cannot connect") {
        DumpError::MongoctlConnection {
            return_code: rc,
            last_log_line: line.to_string(),
        }
    } else if line.contains("cursor didn't exist on server") {
        DumpError::CursorDoesNotExist {
            return_code: rc,
            last_log_line: line.to_string(),
        }
    } else if line.contains("16465") {
        DumpError::ExhaustReceive {
            return_code: rc,
            last_log_line: line.to_string(),
        }
    } else if line.contains("SocketException")
        || line.contains("socket error")
        || line.contains("transport error")
    {
        DumpError::DumpConnectivity {
            return_code: rc,
            last_log_line: line.to_string(),
        }
    } else if line.contains("DBClientCursor") && line.contains("failed") {
        DumpError::DbClientCursorFail {
            return_code: rc,
            last_log_line: line.to_string(),
        }
    } else {
        DumpError::Generic {
            return_code: rc,
            last_log_line: line.to_string(),
        }
    }
}

/// Target (cloud object storage destination) errors.
#[derive(Debug, Error)]
pub enum TargetError {
    #[error(
        "cloud storage container '{container}' is inaccessible or unidentifiable, \
         potentially due to out-of-date target configuration"
    )]
    Inaccessible { container: String },

    #[error("could not connect to cloud storage container '{container}'")]
    Connection { container: String },

    #[error("cloud SDK call against '{container}' failed: {message} (status {status_code})")]
    CloudSdk {
        container: String,
        status_code: Option<u16>,
        message: String,
    },

    #[error("failed to upload the backup to cloud storage container '{container}'")]
    Upload {
        container: String,
        destination_path: String,
    },

    #[error(
        "upload destination '{destination_path}' already exists in container \
         '{container}' and overwrite was not requested"
    )]
    UploadedFileAlreadyExist {
        container: String,
        destination_path: String,
    },

    #[error(
        "upload verification failed: file '{destination_path}' does not exist in \
         container '{container}'"
    )]
    UploadedFileDoesNotExist {
        container: String,
        destination_path: String,
    },

    #[error(
        "upload verification failed: file '{destination_path}' size in container \
         '{container}' ({dest_size} bytes) does not match size on disk ({file_size} bytes)"
    )]
    UploadedFileSizeMismatch {
        container: String,
        destination_path: String,
        dest_size: u64,
        file_size: u64,
    },

    #[error("failed to delete file from cloud storage")]
    Delete,

    #[error("file not found in cloud storage container '{container}'")]
    FileNotFound { container: String },
}

impl TargetError {
    /// spec §4.1: "Cloud-SDK 503 responses and 'ConcurrentTagAccess'
    /// messages are also retriable." Kept as a constructor rather than a
    /// bare variant match so callers at the cloud-SDK boundary build the
    /// error the same way regardless of which of the two triggers applied.
    pub fn cloud_sdk(container: impl Into<String>, status_code: Option<u16>, message: impl Into<String>) -> Self {
        TargetError::CloudSdk {
            container: container.into(),
            status_code,
            message: message.into(),
        }
    }
}

impl Retriable for TargetError {
    fn is_retriable(&self) -> bool {
        use TargetError::*;
        match self {
            Inaccessible { .. } => false,
            Connection { .. } => true,
            CloudSdk { status_code, message, .. } => {
                *status_code == Some(503) || message.contains("ConcurrentTagAccess")
            }
            Upload { .. } => false,
            UploadedFileAlreadyExist { .. } => false,
            UploadedFileDoesNotExist { .. } => true,
            UploadedFileSizeMismatch { .. } => true,
            Delete => true,
            FileNotFound { .. } => false,
        }
    }
}

/// Block-storage / quiescence errors: lock, suspend/resume IO, balancer.
#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("block storage snapshot error: {0}")]
    Snapshot(String),

    #[error("fsynclock/fsyncunlock error: {0}")]
    MongoLock(String),

    #[error("suspend IO error: {0}")]
    SuspendIo(String),

    #[error("resume IO error: {0}")]
    ResumeIo(String),

    #[error("volume error: {0}")]
    Generic(String),
}

impl Retriable for VolumeError {
    fn is_retriable(&self) -> bool {
        use VolumeError::*;
        match self {
            Snapshot(_) => true,
            MongoLock(_) => true,
            SuspendIo(_) => true,
            ResumeIo(_) => true,
            Generic(_) => false,
        }
    }
}

/// Restore-phase error. Like [`DumpError`], deliberately drops the invoked
/// command and raw stderr to avoid leaking credentials embedded in the
/// destination URI.
#[derive(Debug, Error)]
#[error(
    "failed to mongorestore: exit status {return_code}, last log line: {last_log_line}"
)]
pub struct RestoreError {
    pub return_code: i32,
    pub last_log_line: String,
}

/// HTTP-facing error for the (out-of-scope) admin API boundary. Deliberately
/// not a variant of [`MbsError`]: per the engine's error-handling design this
/// type must never leak into core orchestration logic, only be constructed at
/// the API edge from a caught `MbsError`.
#[derive(Debug, Error)]
pub struct MbsApiError {
    pub message: String,
    pub status_code: u16,
}

impl fmt::Display for MbsApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (status {})", self.message, self.status_code)
    }
}

impl MbsApiError {
    pub fn new(message: impl Into<String>, status_code: Option<u16>) -> Self {
        Self {
            message: message.into(),
            status_code: status_code.unwrap_or(400),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_bad_collection_name_by_return_code() {
        let e = classify_dump_error(245, "some trailing line");
        assert!(matches!(e, DumpError::BadCollectionName { .. }));
        assert!(!e.is_retriable());
    }

    #[test]
    fn classifies_each_retriable_dump_pattern() {
        let cases = [
            ("error 10334 occurred", true),
            ("error 13338 occurred", true),
            ("error 13280 occurred", false),
            ("error 10320 occurred", true),
            ("Cannot connect to server", true),
            ("cursor didn't exist on server", true),
            ("error 16465 occurred", true),
            ("SocketException while dumping", true),
            ("a socket error was seen", true),
            ("a transport error occurred", true),
            ("DBClientCursor said it failed", true),
            ("totally unrecognized line", false),
        ];
        for (line, expected_retriable) in cases {
            let e = classify_dump_error(1, line);
            assert_eq!(
                e.is_retriable(),
                expected_retriable,
                "line={line:?} produced {e:?}"
            );
        }
    }

    #[test]
    fn precedence_matches_original_rule_order() {
        // "13280" would also not match any earlier rule, so this just
        // confirms the ordered-table semantics for a line matching two
        // substrings: the first matching rule in order wins.
        let e = classify_dump_error(1, "10334 and also mentions transport error");
        assert!(matches!(e, DumpError::InvalidBsonObjSize { .. }));
    }

    #[test]
    fn retriable_classification_matches_taxonomy() {
        assert!(MbsError::Connection { uri: "x".into() }.is_retriable());
        assert!(!MbsError::Configuration("x".into()).is_retriable());
        assert!(MbsError::Replicaset("x".into()).is_retriable());
        assert!(MbsError::NoEligibleMembersFound { uri: "x".into() }.is_retriable());
        assert!(MbsError::BackupNotOnLocalhost.is_retriable());
        assert!(MbsError::WorkspaceCreation.is_retriable());
        assert!(MbsError::BalancerActive.is_retriable());
        assert!(!MbsError::Extract.is_retriable());
        assert!(!MbsError::Archive.is_retriable());
        assert!(
            !MbsError::InvalidPlan("bad".into()).is_retriable()
        );
        assert!(
            !MbsError::Restore(RestoreError {
                return_code: 1,
                last_log_line: "x".into()
            })
            .is_retriable()
        );
    }

    #[test]
    fn volume_error_retriability() {
        assert!(VolumeError::MongoLock("x".into()).is_retriable());
        assert!(VolumeError::SuspendIo("x".into()).is_retriable());
        assert!(VolumeError::ResumeIo("x".into()).is_retriable());
        assert!(VolumeError::Snapshot("x".into()).is_retriable());
        assert!(!VolumeError::Generic("x".into()).is_retriable());
    }

    #[test]
    fn target_error_retriability() {
        assert!(TargetError::Connection {
            container: "c".into()
        }
        .is_retriable());
        assert!(TargetError::Delete.is_retriable());
        assert!(TargetError::UploadedFileDoesNotExist {
            container: "c".into(),
            destination_path: "p".into()
        }
        .is_retriable());
        assert!(TargetError::UploadedFileSizeMismatch {
            container: "c".into(),
            destination_path: "p".into(),
            dest_size: 1,
            file_size: 2
        }
        .is_retriable());
        assert!(!TargetError::Inaccessible {
            container: "c".into()
        }
        .is_retriable());
        assert!(!TargetError::FileNotFound {
            container: "c".into()
        }
        .is_retriable());
    }

    #[test]
    fn cloud_sdk_errors_retriable_on_503_or_concurrent_tag_access() {
        assert!(TargetError::cloud_sdk("c", Some(503), "service unavailable").is_retriable());
        assert!(TargetError::cloud_sdk("c", Some(400), "ConcurrentTagAccess: retry later").is_retriable());
        assert!(!TargetError::cloud_sdk("c", Some(400), "bad request").is_retriable());
    }
}
