use chrono::{DateTime, Utc};
use std::cmp;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::binding::{RemoteTarget, RootBinding};
use crate::compare_files::file_digest;
use crate::error::ProbeError;
use crate::util::filesystem_path;

/// Current metadata of an entry on one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub last_modification_time: DateTime<Utc>,
    /// Content fingerprint; folders have none.
    pub digest: Option<String>,
    pub folderish: bool,
}

/// Answers "what does this entry look like right now" for one side.
///
/// The identity is the entry path for local probes and the remote reference
/// for remote probes. An absent entry must be reported as
/// `ProbeError::NotFound`, anything else that goes wrong as `Transient` or
/// `Fatal`.
pub trait Probe: Send + Sync {
    fn get_info(&self, identity: &str) -> Result<Snapshot, ProbeError>;
}

impl<'a, P: Probe + ?Sized> Probe for &'a P {
    fn get_info(&self, identity: &str) -> Result<Snapshot, ProbeError> {
        (**self).get_info(identity)
    }
}

impl<P: Probe + ?Sized> Probe for Arc<P> {
    fn get_info(&self, identity: &str) -> Result<Snapshot, ProbeError> {
        (**self).get_info(identity)
    }
}

/// Builds remote probes (network clients) from binding data.
pub trait RemoteProbeFactory {
    type Probe: Probe + 'static;

    fn connect(&self, target: &RemoteTarget) -> Result<Self::Probe, ProbeError>;
}

/// Probes the local filesystem below a root.
#[derive(Debug, Clone)]
pub struct FsProbe {
    root: PathBuf,
}

impl FsProbe {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        FsProbe { root: root.into() }
    }

    pub fn for_root(root: &RootBinding) -> Self {
        FsProbe::new(root.local_root())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Probe for FsProbe {
    fn get_info(&self, path: &str) -> Result<Snapshot, ProbeError> {
        let location = filesystem_path(&self.root, path);
        let metadata = fs::metadata(&location)?;
        let folderish = metadata.is_dir();
        let digest = if folderish {
            None
        } else {
            Some(file_digest(&location)?)
        };
        Ok(Snapshot {
            last_modification_time: metadata.modified()?.into(),
            digest,
            folderish,
        })
    }
}

/// A shared flag that aborts probes waiting in a `TimeoutProbe`.
#[derive(Debug, Clone, Default)]
pub struct Cancellation(Arc<AtomicBool>);

impl Cancellation {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Runs a blocking probe on a worker thread and gives up after `timeout` or
/// on cancellation. Both outcomes are transient errors.
///
/// A probe that never returns keeps its worker thread; the caller is released
/// regardless.
pub struct TimeoutProbe<P> {
    inner: Arc<P>,
    timeout: Duration,
    cancellation: Cancellation,
}

impl<P: Probe + 'static> TimeoutProbe<P> {
    pub fn new(inner: P, timeout: Duration) -> Self {
        TimeoutProbe {
            inner: Arc::new(inner),
            timeout,
            cancellation: Cancellation::default(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn cancellation(&self) -> Cancellation {
        self.cancellation.clone()
    }
}

impl<P: Probe + 'static> Probe for TimeoutProbe<P> {
    fn get_info(&self, identity: &str) -> Result<Snapshot, ProbeError> {
        if self.cancellation.is_cancelled() {
            return Err(ProbeError::Transient(format!("probe for {} cancelled", identity)));
        }

        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let owned_identity = identity.to_owned();
        thread::Builder::new()
            .name("probe".to_owned())
            .spawn(move || {
                let _ = tx.send(inner.get_info(&owned_identity));
            })?;

        let deadline = Instant::now() + self.timeout;
        loop {
            if self.cancellation.is_cancelled() {
                info!("Probe for {} cancelled", identity);
                return Err(ProbeError::Transient(format!("probe for {} cancelled", identity)));
            }
            let now = Instant::now();
            if now >= deadline {
                warn!("Probe for {} timed out after {:?}", identity, self.timeout);
                return Err(ProbeError::Transient(format!(
                    "probe for {} timed out after {:?}",
                    identity, self.timeout
                )));
            }
            match rx.recv_timeout(cmp::min(POLL_INTERVAL, deadline - now)) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(ProbeError::Transient(format!(
                        "probe for {} exited without answering",
                        identity
                    )))
                }
            }
        }
    }
}
