//! Bookkeeping for a file synchronizer that pairs local directory trees with
//! remote repositories: bindings, per-entry state records on both sides, change
//! detection against probes, and move correlation.

#[macro_use]
extern crate log;

pub mod archive;
pub mod binding;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod moves;
pub mod reconcile;
pub mod record;
pub mod registry;
pub mod state;
pub mod util;
mod compare_files;

pub use crate::archive::{Archive, Store};
pub use crate::config::{Config, FolderishPolicy, Ignore};
pub use crate::engine::{Engine, PassReport};
pub use crate::error::{ProbeError, StoreError, SyncError};
pub use crate::record::{RecordKey, StateRecord};
pub use crate::state::{MicroState, PairState, Side};
