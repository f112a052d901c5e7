use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::SyncError;
use crate::util::{absolute, parent_directory};

/// One remote server connection, keyed by the local folder that hosts its roots.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerBinding {
    local_folder: PathBuf,
    pub server_url: String,
    pub remote_user: String,
    pub remote_password: String,
}

impl ServerBinding {
    pub fn new<P: AsRef<Path>>(
        local_folder: P,
        server_url: &str,
        remote_user: &str,
        remote_password: &str,
    ) -> Result<Self, SyncError> {
        Ok(ServerBinding {
            local_folder: absolute(local_folder.as_ref())?,
            server_url: server_url.to_owned(),
            remote_user: remote_user.to_owned(),
            remote_password: remote_password.to_owned(),
        })
    }

    /// The primary key.
    pub fn local_folder(&self) -> &Path {
        &self.local_folder
    }
}

impl fmt::Debug for ServerBinding {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ServerBinding")
            .field("local_folder", &self.local_folder)
            .field("server_url", &self.server_url)
            .field("remote_user", &self.remote_user)
            .field("remote_password", &"<redacted>")
            .finish()
    }
}

/// One synchronized root: a local directory mapped to a remote location.
///
/// The owning server binding is always the direct parent directory of the
/// root; it is computed here and cannot be supplied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootBinding {
    local_root: PathBuf,
    pub remote_repo: String,
    pub remote_root: String,
    local_folder: PathBuf,
}

impl RootBinding {
    pub fn new<P: AsRef<Path>>(
        local_root: P,
        remote_repo: &str,
        remote_root: &str,
    ) -> Result<Self, SyncError> {
        let local_root = absolute(local_root.as_ref())?;
        let local_folder = parent_directory(&local_root);
        Ok(RootBinding {
            local_root,
            remote_repo: remote_repo.to_owned(),
            remote_root: remote_root.to_owned(),
            local_folder,
        })
    }

    /// The primary key.
    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    /// Key of the owning `ServerBinding`.
    pub fn local_folder(&self) -> &Path {
        &self.local_folder
    }
}

/// Everything a remote probe needs, joined from a root and its server.
#[derive(Clone, PartialEq, Eq)]
pub struct RemoteTarget {
    pub server_url: String,
    pub remote_user: String,
    pub remote_password: String,
    pub remote_repo: String,
    pub remote_root: String,
}

impl RemoteTarget {
    pub fn from_bindings(server: &ServerBinding, root: &RootBinding) -> Self {
        RemoteTarget {
            server_url: server.server_url.clone(),
            remote_user: server.remote_user.clone(),
            remote_password: server.remote_password.clone(),
            remote_repo: root.remote_repo.clone(),
            remote_root: root.remote_root.clone(),
        }
    }
}

impl fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("server_url", &self.server_url)
            .field("remote_user", &self.remote_user)
            .field("remote_repo", &self.remote_repo)
            .field("remote_root", &self.remote_root)
            .finish()
    }
}
