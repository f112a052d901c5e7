//! Server and root bindings, and the cascades that remove them.

use std::path::Path;
use std::sync::Arc;

use crate::archive::{Store, Transaction};
use crate::binding::{RemoteTarget, RootBinding, ServerBinding};
use crate::error::SyncError;
use crate::util::absolute;

pub struct BindingRegistry<S> {
    store: Arc<S>,
}

impl<S> Clone for BindingRegistry<S> {
    fn clone(&self) -> Self {
        BindingRegistry {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> BindingRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        BindingRegistry { store }
    }

    pub fn add_server_binding(&self, server: ServerBinding) -> Result<(), SyncError> {
        info!("Binding server {} at {:?}", server.server_url, server.local_folder());
        self.store.transaction(|tx| tx.insert_server(server))
    }

    /// Adds a root binding. Its owner is the root's parent directory, which
    /// must already be bound to a server.
    pub fn add_root_binding(&self, root: RootBinding) -> Result<(), SyncError> {
        info!(
            "Binding root {:?} to {}:{}",
            root.local_root(),
            root.remote_repo,
            root.remote_root
        );
        self.store.transaction(|tx| tx.insert_root(root))
    }

    /// Removes a server binding together with its roots and everything they own.
    pub fn remove_server_binding(&self, local_folder: &Path) -> Result<ServerBinding, SyncError> {
        let local_folder = absolute(local_folder)?;
        self.store.transaction(|tx| {
            let roots: Vec<_> = tx
                .tables()
                .roots_of(&local_folder)
                .into_iter()
                .map(|root| root.local_root().to_path_buf())
                .collect();
            for root in &roots {
                cascade_root(tx, root)?;
            }
            let server = tx.remove_server(&local_folder)?;
            info!("Removed server binding {:?} and {} roots", local_folder, roots.len());
            Ok(server)
        })
    }

    /// Removes a root binding together with its state records and events.
    pub fn remove_root_binding(&self, local_root: &Path) -> Result<RootBinding, SyncError> {
        let local_root = absolute(local_root)?;
        self.store.transaction(|tx| cascade_root(tx, &local_root))
    }

    pub fn server_binding(&self, local_folder: &Path) -> Result<Option<ServerBinding>, SyncError> {
        let local_folder = absolute(local_folder)?;
        Ok(self.store.read(|t| t.server(&local_folder).cloned()))
    }

    pub fn root_binding(&self, local_root: &Path) -> Result<Option<RootBinding>, SyncError> {
        let local_root = absolute(local_root)?;
        Ok(self.store.read(|t| t.root(&local_root).cloned()))
    }

    /// The roots owned by a server binding.
    pub fn root_bindings(&self, local_folder: &Path) -> Result<Vec<RootBinding>, SyncError> {
        let local_folder = absolute(local_folder)?;
        Ok(self.store.read(|t| {
            t.roots_of(&local_folder)
                .into_iter()
                .cloned()
                .collect()
        }))
    }

    /// Joins a root with its server: everything a remote probe needs.
    pub fn remote_target(&self, local_root: &Path) -> Result<RemoteTarget, SyncError> {
        let local_root = absolute(local_root)?;
        self.store.read(|t| {
            let root = t
                .root(&local_root)
                .ok_or_else(|| SyncError::BindingNotFound(local_root.clone()))?;
            let server = t
                .server(root.local_folder())
                .ok_or_else(|| SyncError::BindingNotFound(root.local_folder().to_path_buf()))?;
            Ok(RemoteTarget::from_bindings(server, root))
        })
    }
}

fn cascade_root(tx: &mut Transaction<'_>, local_root: &Path) -> Result<RootBinding, SyncError> {
    let keys: Vec<_> = tx
        .tables()
        .states_of(local_root)
        .into_iter()
        .map(|record| record.key().clone())
        .collect();
    for key in &keys {
        tx.remove_state(key)?;
    }
    let events = tx.remove_events_of(local_root);
    let root = tx.remove_root(local_root)?;
    debug!(
        "Removed root binding {:?} with {} state records and {} events",
        local_root,
        keys.len(),
        events
    );
    Ok(root)
}
