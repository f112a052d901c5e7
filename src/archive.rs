//! The durable store behind the engine.
//!
//! All bindings, state records and file events live in one set of `Tables`.
//! Mutations only happen inside a `Transaction`, which keeps an undo log and
//! rolls every staged change back unless the transaction commits, so readers
//! never see half of a refresh or half of a cascade.
//!
//! `Archive` keeps the tables in memory and, when opened on a directory,
//! rewrites the archive file after every committed transaction:
//!
//! ```text
//! <directory>/
//! ├─ LOCK          # advisory lock, one handle per directory
//! └─ archive       # u32 format version (little endian) + bincode payload
//! ```

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use fs2::FileExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};

use crate::binding::{RootBinding, ServerBinding};
use crate::error::{StoreError, SyncError};
use crate::moves::Move;
use crate::record::{FileEvent, RecordKey, RemoteId, StateRecord};
use crate::state::{MicroState, PairState, Side};
use crate::util::FnvHashMap;

const ARCHIVE_VERSION: u32 = 1;
const ARCHIVE_FILE: &str = "archive";
const ARCHIVE_TEMP: &str = "archive.tmp";
const LOCK_FILE: &str = "LOCK";

/// A transactional home for the tables.
pub trait Store: Send + Sync {
    /// Runs `f` against the last committed state.
    fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&Tables) -> T;

    /// Runs `f` as one atomic unit of work: either everything it staged is
    /// committed (and persisted), or nothing is.
    fn transaction<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, SyncError>;
}

type ChildIndex = FnvHashMap<(PathBuf, String), BTreeSet<String>>;
type RemoteIndex = FnvHashMap<RemoteId, BTreeSet<RecordKey>>;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Tables {
    servers: BTreeMap<PathBuf, ServerBinding>,
    roots: BTreeMap<PathBuf, RootBinding>,
    states: BTreeMap<RecordKey, StateRecord>,
    events: Vec<FileEvent>,
    next_event_id: u64,

    // rebuilt on load
    #[serde(skip)]
    children: ChildIndex,
    #[serde(skip)]
    by_remote: RemoteIndex,
}

impl Tables {
    pub fn server(&self, local_folder: &Path) -> Option<&ServerBinding> {
        self.servers.get(local_folder)
    }

    pub fn servers(&self) -> Vec<&ServerBinding> {
        self.servers.values().collect()
    }

    pub fn root(&self, local_root: &Path) -> Option<&RootBinding> {
        self.roots.get(local_root)
    }

    /// Root bindings owned by the server binding `local_folder`.
    pub fn roots_of(&self, local_folder: &Path) -> Vec<&RootBinding> {
        self.roots
            .values()
            .filter(|root| root.local_folder() == local_folder)
            .collect()
    }

    pub fn state(&self, key: &RecordKey) -> Option<&StateRecord> {
        self.states.get(key)
    }

    /// Every state record of a root, ordered by path.
    pub fn states_of(&self, local_root: &Path) -> Vec<&StateRecord> {
        let start = RecordKey {
            local_root: local_root.to_path_buf(),
            path: String::new(),
        };
        self.states
            .range(start..)
            .take_while(|&(key, _)| key.local_root == local_root)
            .map(|(_, record)| record)
            .collect()
    }

    /// Direct children of `parent_path` inside a root.
    pub fn children(&self, local_root: &Path, parent_path: &str) -> Vec<&StateRecord> {
        let index_key = (local_root.to_path_buf(), parent_path.to_owned());
        match self.children.get(&index_key) {
            Some(paths) => paths
                .iter()
                .filter_map(|path| {
                    self.states.get(&RecordKey {
                        local_root: local_root.to_path_buf(),
                        path: path.clone(),
                    })
                })
                .collect(),
            None => Vec::new(),
        }
    }

    /// Records carrying the remote identity `id`, in any root.
    pub fn by_remote(&self, id: &RemoteId) -> Vec<&StateRecord> {
        match self.by_remote.get(id) {
            Some(keys) => keys.iter().filter_map(|key| self.states.get(key)).collect(),
            None => Vec::new(),
        }
    }

    /// Records of a root whose summary is `pair_state`. The two ends of a
    /// recorded move are left out; they are listed by `recorded_moves`.
    pub fn in_pair_state(&self, local_root: &Path, pair_state: PairState) -> Vec<&StateRecord> {
        self.states_of(local_root)
            .into_iter()
            .filter(|record| record.pair_state() == pair_state && !record.in_recorded_move())
            .collect()
    }

    /// Moves recorded in a root whose destination is still `created`.
    pub fn recorded_moves(&self, local_root: &Path) -> Vec<Move> {
        let mut moves = Vec::new();
        for record in self.states_of(local_root) {
            for &side in &[Side::Local, Side::Remote] {
                if record.state(side) != MicroState::Created {
                    continue;
                }
                if let Some(from) = record.moved_from(side) {
                    moves.push(Move {
                        side,
                        local_root: local_root.to_path_buf(),
                        from: from.to_owned(),
                        to: record.path().to_owned(),
                    });
                }
            }
        }
        moves
    }

    pub fn events(&self) -> &[FileEvent] {
        &self.events
    }

    fn put_state(&mut self, record: StateRecord) -> Option<StateRecord> {
        let previous = self.take_state(record.key());
        index_record(&mut self.children, &mut self.by_remote, &record);
        self.states.insert(record.key().clone(), record);
        previous
    }

    fn take_state(&mut self, key: &RecordKey) -> Option<StateRecord> {
        let previous = self.states.remove(key)?;
        unindex_record(&mut self.children, &mut self.by_remote, &previous);
        Some(previous)
    }

    fn rebuild_indexes(&mut self) {
        let Tables {
            states,
            children,
            by_remote,
            ..
        } = self;
        children.clear();
        by_remote.clear();
        for record in states.values() {
            index_record(children, by_remote, record);
        }
        debug!("Rebuilt indexes for {} state records", states.len());
    }
}

fn index_record(children: &mut ChildIndex, by_remote: &mut RemoteIndex, record: &StateRecord) {
    if let Some(parent) = record.parent_path() {
        children
            .entry((record.local_root().to_path_buf(), parent.to_owned()))
            .or_insert_with(BTreeSet::new)
            .insert(record.path().to_owned());
    }
    if let Some(id) = record.remote_id() {
        by_remote
            .entry(id)
            .or_insert_with(BTreeSet::new)
            .insert(record.key().clone());
    }
}

fn unindex_record(children: &mut ChildIndex, by_remote: &mut RemoteIndex, record: &StateRecord) {
    if let Some(parent) = record.parent_path() {
        let index_key = (record.local_root().to_path_buf(), parent.to_owned());
        let now_empty = match children.get_mut(&index_key) {
            Some(paths) => {
                paths.remove(record.path());
                paths.is_empty()
            }
            None => false,
        };
        if now_empty {
            children.remove(&index_key);
        }
    }
    if let Some(id) = record.remote_id() {
        let now_empty = match by_remote.get_mut(&id) {
            Some(keys) => {
                keys.remove(record.key());
                keys.is_empty()
            }
            None => false,
        };
        if now_empty {
            by_remote.remove(&id);
        }
    }
}

enum Undo {
    Server(PathBuf, Option<ServerBinding>),
    Root(PathBuf, Option<RootBinding>),
    State(RecordKey, Option<StateRecord>),
    AppendedEvent,
    EventLog(Vec<FileEvent>),
}

/// A unit of work against the tables. Reads through `tables()` see the
/// transaction's own writes. Dropping it without commit undoes everything.
///
/// The insert methods enforce ownership: a root needs its server binding, a
/// state record or event needs its root binding.
pub struct Transaction<'a> {
    tables: &'a mut Tables,
    undo: Vec<Undo>,
    committed: bool,
}

impl<'a> Transaction<'a> {
    fn new(tables: &'a mut Tables) -> Self {
        Transaction {
            tables,
            undo: Vec::new(),
            committed: false,
        }
    }

    pub fn tables(&self) -> &Tables {
        self.tables
    }

    pub fn is_dirty(&self) -> bool {
        !self.undo.is_empty()
    }

    pub fn insert_server(&mut self, server: ServerBinding) -> Result<(), SyncError> {
        let key = server.local_folder().to_path_buf();
        if self.tables.servers.contains_key(&key) {
            return Err(SyncError::DuplicateBinding(key));
        }
        self.tables.servers.insert(key.clone(), server);
        self.undo.push(Undo::Server(key, None));
        Ok(())
    }

    pub(crate) fn remove_server(&mut self, local_folder: &Path) -> Result<ServerBinding, SyncError> {
        let server = self
            .tables
            .servers
            .remove(local_folder)
            .ok_or_else(|| SyncError::BindingNotFound(local_folder.to_path_buf()))?;
        self.undo
            .push(Undo::Server(local_folder.to_path_buf(), Some(server.clone())));
        Ok(server)
    }

    pub fn insert_root(&mut self, root: RootBinding) -> Result<(), SyncError> {
        if !self.tables.servers.contains_key(root.local_folder()) {
            return Err(SyncError::BindingNotFound(root.local_folder().to_path_buf()));
        }
        let key = root.local_root().to_path_buf();
        if self.tables.roots.contains_key(&key) {
            return Err(SyncError::DuplicateBinding(key));
        }
        self.tables.roots.insert(key.clone(), root);
        self.undo.push(Undo::Root(key, None));
        Ok(())
    }

    pub(crate) fn remove_root(&mut self, local_root: &Path) -> Result<RootBinding, SyncError> {
        let root = self
            .tables
            .roots
            .remove(local_root)
            .ok_or_else(|| SyncError::BindingNotFound(local_root.to_path_buf()))?;
        self.undo
            .push(Undo::Root(local_root.to_path_buf(), Some(root.clone())));
        Ok(root)
    }

    pub fn insert_state(&mut self, record: StateRecord) -> Result<(), SyncError> {
        self.check_root(record.local_root())?;
        if self.tables.states.contains_key(record.key()) {
            return Err(SyncError::DuplicateRecord(record.key().clone()));
        }
        let key = record.key().clone();
        self.tables.put_state(record);
        self.undo.push(Undo::State(key, None));
        Ok(())
    }

    /// Replaces an existing record.
    pub fn update_state(&mut self, record: StateRecord) -> Result<(), SyncError> {
        if !self.tables.states.contains_key(record.key()) {
            return Err(SyncError::RecordNotFound(record.key().clone()));
        }
        let key = record.key().clone();
        let previous = self.tables.put_state(record);
        self.undo.push(Undo::State(key, previous));
        Ok(())
    }

    pub(crate) fn remove_state(&mut self, key: &RecordKey) -> Result<StateRecord, SyncError> {
        let previous = self
            .tables
            .take_state(key)
            .ok_or_else(|| SyncError::RecordNotFound(key.clone()))?;
        self.undo.push(Undo::State(key.clone(), Some(previous.clone())));
        Ok(previous)
    }

    /// Appends an event, assigning the next sequence number. A rolled back
    /// append gives its number back.
    pub fn append_event(&mut self, mut event: FileEvent) -> Result<u64, SyncError> {
        self.check_root(&event.local_root)?;
        self.tables.next_event_id += 1;
        event.id = self.tables.next_event_id;
        self.tables.events.push(event);
        self.undo.push(Undo::AppendedEvent);
        Ok(self.tables.next_event_id)
    }

    pub(crate) fn remove_events_of(&mut self, local_root: &Path) -> usize {
        let before = self.tables.events.len();
        if !self.tables.events.iter().any(|e| e.local_root == local_root) {
            return 0;
        }
        let log = self.tables.events.clone();
        self.tables.events.retain(|e| e.local_root != local_root);
        self.undo.push(Undo::EventLog(log));
        before - self.tables.events.len()
    }

    fn check_root(&self, local_root: &Path) -> Result<(), SyncError> {
        if self.tables.roots.contains_key(local_root) {
            Ok(())
        } else {
            Err(SyncError::BindingNotFound(local_root.to_path_buf()))
        }
    }

    fn commit(mut self) {
        self.committed = true;
    }

    fn rollback(&mut self) {
        if !self.undo.is_empty() {
            debug!("Rolling back {} staged changes", self.undo.len());
        }
        while let Some(undo) = self.undo.pop() {
            match undo {
                Undo::Server(key, Some(server)) => {
                    self.tables.servers.insert(key, server);
                }
                Undo::Server(key, None) => {
                    self.tables.servers.remove(&key);
                }
                Undo::Root(key, Some(root)) => {
                    self.tables.roots.insert(key, root);
                }
                Undo::Root(key, None) => {
                    self.tables.roots.remove(&key);
                }
                Undo::State(_, Some(record)) => {
                    self.tables.put_state(record);
                }
                Undo::State(key, None) => {
                    self.tables.take_state(&key);
                }
                Undo::AppendedEvent => {
                    self.tables.events.pop();
                    self.tables.next_event_id -= 1;
                }
                Undo::EventLog(log) => self.tables.events = log,
            }
        }
    }
}

impl<'a> Drop for Transaction<'a> {
    fn drop(&mut self) {
        if !self.committed {
            self.rollback();
        }
    }
}

/// The store implementation: in-memory tables, optionally mirrored to disk.
#[derive(Debug)]
pub struct Archive {
    directory: Option<PathBuf>,
    _lock_file: Option<File>,
    tables: RwLock<Tables>,
}

impl Archive {
    /// Opens the archive in `directory`, creating the directory and an empty
    /// archive if needed. Opening an existing archive only loads it.
    pub fn open<P: Into<PathBuf>>(directory: P) -> Result<Self, StoreError> {
        let directory = directory.into();
        if !directory.exists() {
            fs::create_dir_all(&directory)?;
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(directory.join(LOCK_FILE))?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked(directory));
        }

        let archive_file = directory.join(ARCHIVE_FILE);
        let mut tables = if archive_file.exists() {
            debug!("Reading archive file {:?}", archive_file);
            let mut reader = BufReader::new(File::open(&archive_file)?);
            read_tables(&mut reader)?
        } else {
            info!("Creating new archive in {:?}", directory);
            Tables::default()
        };
        tables.rebuild_indexes();

        Ok(Archive {
            directory: Some(directory),
            _lock_file: Some(lock_file),
            tables: RwLock::new(tables),
        })
    }

    /// An archive that is never written to disk.
    pub fn in_memory() -> Self {
        Archive {
            directory: None,
            _lock_file: None,
            tables: RwLock::new(Tables::default()),
        }
    }

    pub fn directory(&self) -> Option<&Path> {
        self.directory.as_ref().map(PathBuf::as_path)
    }

    // write-then-rename so a crash leaves either the old or the new archive
    fn persist(&self, tables: &Tables) -> Result<(), StoreError> {
        let directory = match self.directory {
            Some(ref directory) => directory,
            None => return Ok(()),
        };
        let temp_path = directory.join(ARCHIVE_TEMP);

        let mut writer = BufWriter::new(File::create(&temp_path)?);
        write_tables(&mut writer, tables)?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, directory.join(ARCHIVE_FILE))?;
        sync_directory(directory)?;
        trace!("Persisted archive in {:?}", directory);
        Ok(())
    }
}

impl Store for Archive {
    fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&Tables) -> T,
    {
        f(&self.tables.read())
    }

    fn transaction<T, F>(&self, f: F) -> Result<T, SyncError>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T, SyncError>,
    {
        let mut tables = self.tables.write();
        let mut tx = Transaction::new(&mut tables);
        let value = f(&mut tx)?;
        if tx.is_dirty() {
            self.persist(tx.tables())?;
        }
        tx.commit();
        Ok(value)
    }
}

#[cfg(unix)]
fn sync_directory(directory: &Path) -> io::Result<()> {
    File::open(directory)?.sync_all()
}

#[cfg(not(unix))]
fn sync_directory(_: &Path) -> io::Result<()> {
    Ok(())
}

/// reads the tables from a binary stream
fn read_tables<R: io::Read>(read: &mut R) -> Result<Tables, StoreError> {
    let version = read.read_u32::<LittleEndian>()?;
    if version != ARCHIVE_VERSION {
        return Err(StoreError::InvalidVersion(version));
    }
    Ok(bincode::deserialize_from(read)?)
}

// writes the tables to a binary stream
fn write_tables<W: io::Write>(out: &mut W, tables: &Tables) -> Result<(), StoreError> {
    out.write_u32::<LittleEndian>(ARCHIVE_VERSION)?;
    bincode::serialize_into(out, tables)?;
    Ok(())
}
