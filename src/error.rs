use std::error::Error;
use std::fmt;
use std::io;
use std::path::PathBuf;
use walkdir::Error as WalkDirError;

use crate::record::RecordKey;

/// The outcome of a failed probe query.
///
/// `NotFound` is an expected answer that drives delete detection, the other
/// two are genuine failures and never cause a state transition.
#[derive(Debug)]
pub enum ProbeError {
    /// The entry does not currently exist on that side.
    NotFound,
    /// A failure that may go away on retry (network, timeout, cancellation).
    Transient(String),
    /// A failure that will not go away on its own (authentication, permissions).
    Fatal(String),
}

impl ProbeError {
    pub fn is_not_found(&self) -> bool {
        match *self {
            ProbeError::NotFound => true,
            _ => false,
        }
    }

    pub fn is_transient(&self) -> bool {
        match *self {
            ProbeError::Transient(_) => true,
            _ => false,
        }
    }
}

impl From<io::Error> for ProbeError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => ProbeError::NotFound,
            io::ErrorKind::PermissionDenied => ProbeError::Fatal(e.to_string()),
            _ => ProbeError::Transient(e.to_string()),
        }
    }
}

impl fmt::Display for ProbeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            ProbeError::NotFound => write!(f, "entry not found"),
            ProbeError::Transient(ref msg) => write!(f, "transient probe error: {}", msg),
            ProbeError::Fatal(ref msg) => write!(f, "fatal probe error: {}", msg),
        }
    }
}

impl Error for ProbeError {}

/// Failures of the durable store.
#[derive(Debug)]
pub enum StoreError {
    Io(io::Error),
    Serialization(bincode::Error),
    /// The archive file was written with an unsupported format version.
    InvalidVersion(u32),
    /// Another handle holds the archive lock.
    Locked(PathBuf),
}

impl From<io::Error> for StoreError {
    fn from(e: io::Error) -> Self {
        StoreError::Io(e)
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Serialization(e)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            StoreError::Io(ref e) => write!(f, "archive io error: {}", e),
            StoreError::Serialization(ref e) => write!(f, "archive serialization error: {}", e),
            StoreError::InvalidVersion(version) => {
                write!(f, "archive uses unsupported format version {}", version)
            }
            StoreError::Locked(ref path) => {
                write!(f, "archive at {:?} is locked by another handle", path)
            }
        }
    }
}

impl Error for StoreError {}

#[derive(Debug)]
pub enum SyncError {
    /// A binding that was required to exist (or to own the entry) is missing.
    BindingNotFound(PathBuf),
    DuplicateBinding(PathBuf),
    RecordNotFound(RecordKey),
    DuplicateRecord(RecordKey),
    InvalidPath(String),
    /// A remote refresh was requested for a record that has no remote reference yet.
    MissingRemoteReference(RecordKey),
    Probe(ProbeError),
    Store(StoreError),
    IoError(io::Error),
    WalkDirError(WalkDirError),
}

impl SyncError {
    /// True if retrying the same call later may succeed.
    pub fn is_transient(&self) -> bool {
        match *self {
            SyncError::Probe(ref e) => e.is_transient(),
            _ => false,
        }
    }
}

impl From<ProbeError> for SyncError {
    fn from(e: ProbeError) -> Self {
        SyncError::Probe(e)
    }
}

impl From<StoreError> for SyncError {
    fn from(e: StoreError) -> Self {
        SyncError::Store(e)
    }
}

impl From<io::Error> for SyncError {
    fn from(e: io::Error) -> Self {
        SyncError::IoError(e)
    }
}

impl From<WalkDirError> for SyncError {
    fn from(e: WalkDirError) -> Self {
        SyncError::WalkDirError(e)
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SyncError::BindingNotFound(ref path) => write!(f, "no binding for {:?}", path),
            SyncError::DuplicateBinding(ref path) => {
                write!(f, "a binding for {:?} already exists", path)
            }
            SyncError::RecordNotFound(ref key) => write!(f, "no state record for {}", key),
            SyncError::DuplicateRecord(ref key) => {
                write!(f, "a state record for {} already exists", key)
            }
            SyncError::InvalidPath(ref path) => write!(f, "invalid entry path {:?}", path),
            SyncError::MissingRemoteReference(ref key) => {
                write!(f, "state record {} has no remote reference", key)
            }
            SyncError::Probe(ref e) => write!(f, "probe error: {}", e),
            SyncError::Store(ref e) => write!(f, "store error: {}", e),
            SyncError::IoError(ref e) => write!(f, "io error: {}", e),
            SyncError::WalkDirError(ref e) => write!(f, "walk dir error: {:?}", e),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match *self {
            SyncError::Probe(ref e) => Some(e),
            SyncError::Store(ref e) => Some(e),
            SyncError::IoError(ref e) => Some(e),
            SyncError::WalkDirError(ref e) => Some(e),
            _ => None,
        }
    }
}
