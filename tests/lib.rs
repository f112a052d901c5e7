use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use pairsync::binding::{RootBinding, ServerBinding};
use pairsync::detect::{Change, Observation, Probe, Snapshot};
use pairsync::{
    Archive, Config, Engine, Ignore, MicroState, PairState, ProbeError, RecordKey, Side,
    StateRecord, Store, SyncError,
};

fn set_up(config: Config) -> Engine<Archive> {
    let _ = env_logger::builder().is_test(true).try_init();
    Engine::new(Arc::new(Archive::in_memory()), config)
}

fn bind(engine: &Engine<Archive>, local_folder: &Path, local_root: &Path) {
    let registry = engine.registry();
    registry
        .add_server_binding(ServerBinding::new(local_folder, "http://localhost:8080/nuxeo", "bob", "pw").unwrap())
        .unwrap();
    registry
        .add_root_binding(RootBinding::new(local_root, "default", "/default-domain/workspaces/ws").unwrap())
        .unwrap();
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

/// Answers with queued snapshots, then `NotFound`.
struct Scripted(Mutex<VecDeque<Result<Snapshot, ProbeError>>>);

impl Scripted {
    fn new(answers: Vec<Result<Snapshot, ProbeError>>) -> Self {
        Scripted(Mutex::new(answers.into_iter().collect()))
    }
}

impl Probe for Scripted {
    fn get_info(&self, _: &str) -> Result<Snapshot, ProbeError> {
        self.0.lock().pop_front().unwrap_or(Err(ProbeError::NotFound))
    }
}

fn folder(secs: i64) -> Result<Snapshot, ProbeError> {
    Ok(Snapshot {
        last_modification_time: at(secs),
        digest: None,
        folderish: true,
    })
}

#[test]
fn test_root_binding_owner_and_first_refreshes() {
    let engine = set_up(Config::default());
    bind(&engine, Path::new("/home/u"), Path::new("/home/u/ws"));

    let root = engine.registry().root_binding(Path::new("/home/u/ws")).unwrap().unwrap();
    assert_eq!(root.local_folder(), Path::new("/home/u"));

    engine.create_record(StateRecord::new("/home/u/ws", "/").unwrap()).unwrap();
    let key = RecordKey::new("/home/u/ws", "/").unwrap();
    assert_eq!(engine.record(&key).unwrap().pair_state(), PairState::Unknown);

    let probe = Scripted::new(vec![folder(100), folder(200)]);
    engine.refresh_local(&key, &probe).unwrap();
    let record = engine.record(&key).unwrap();
    assert_eq!(record.last_local_updated, Some(at(100)));
    assert!(record.folderish);
    assert_eq!(record.local_state(), MicroState::Unknown);

    engine.refresh_local(&key, &probe).unwrap();
    let record = engine.record(&key).unwrap();
    assert_eq!(record.local_state(), MicroState::Modified);
    assert_eq!(record.pair_state(), PairState::Unknown);

    let record = engine
        .update_state(&key, None, Some(MicroState::Synchronized))
        .unwrap();
    assert_eq!(record.pair_state(), PairState::LocallyModified);
}

#[test]
fn test_modified_against_deleted_is_a_conflict() {
    let engine = set_up(Config::default());
    bind(&engine, Path::new("/home/u"), Path::new("/home/u/ws"));
    engine
        .create_record(
            StateRecord::new("/home/u/ws", "/a.txt")
                .unwrap()
                .with_states(MicroState::Modified, MicroState::Deleted),
        )
        .unwrap();
    let conflicted = engine
        .records_in_state(Path::new("/home/u/ws"), PairState::Conflicted)
        .unwrap();
    assert_eq!(conflicted.len(), 1);
    assert_eq!(conflicted[0].path(), "/a.txt");
}

#[test]
fn test_remote_refresh_moves_the_remote_state() {
    let engine = set_up(Config::default());
    bind(&engine, Path::new("/home/u"), Path::new("/home/u/ws"));
    engine
        .create_record(
            StateRecord::new("/home/u/ws", "/a.txt")
                .unwrap()
                .with_remote("default", "ref-a")
                .with_states(MicroState::Synchronized, MicroState::Synchronized),
        )
        .unwrap();
    let key = RecordKey::new("/home/u/ws", "/a.txt").unwrap();
    let file = |secs| {
        Ok(Snapshot {
            last_modification_time: at(secs),
            digest: Some(format!("r{}", secs)),
            folderish: false,
        })
    };
    let probe = Scripted::new(vec![file(100), file(200)]);

    engine.refresh_remote(&key, &probe).unwrap();
    engine.refresh_remote(&key, &probe).unwrap();
    let record = engine.record(&key).unwrap();
    assert_eq!(record.local_state(), MicroState::Synchronized);
    assert_eq!(record.remote_state(), MicroState::Modified);
    assert_eq!(record.pair_state(), PairState::RemotelyModified);

    // a modified side is not known to exist until it has been synchronized
    assert_eq!(engine.refresh_remote(&key, &Scripted::new(vec![])).unwrap().change, Change::Missing);
    engine.update_state(&key, None, Some(MicroState::Synchronized)).unwrap();

    let observation = engine.refresh_remote(&key, &probe).unwrap();
    assert_eq!(observation.change, Change::Deleted);
    assert_eq!(observation.digest.as_ref().map(String::as_str), Some("r200"));
    let record = engine.record(&key).unwrap();
    assert_eq!(record.remote_state(), MicroState::Deleted);
    assert_eq!(record.remote_digest, None);
}

#[test]
fn test_transient_failure_changes_nothing() {
    let engine = set_up(Config::default());
    bind(&engine, Path::new("/home/u"), Path::new("/home/u/ws"));
    engine
        .create_record(
            StateRecord::new("/home/u/ws", "/a.txt")
                .unwrap()
                .with_remote("default", "ref-a")
                .with_states(MicroState::Synchronized, MicroState::Synchronized),
        )
        .unwrap();
    let key = RecordKey::new("/home/u/ws", "/a.txt").unwrap();
    let before = engine.record(&key).unwrap();

    let probe = Scripted::new(vec![Err(ProbeError::Transient("connection reset".to_owned()))]);
    let err = engine.refresh_remote(&key, &probe).unwrap_err();
    assert!(err.is_transient());
    assert_eq!(engine.record(&key).unwrap(), before);
}

#[test]
fn test_removing_server_binding_leaves_no_orphans() {
    let engine = set_up(Config::default());
    bind(&engine, Path::new("/home/u"), Path::new("/home/u/ws"));
    for path in &["/", "/docs", "/docs/a.txt"] {
        engine.create_record(StateRecord::new("/home/u/ws", path).unwrap()).unwrap();
    }
    engine.record_event(Path::new("/home/u/ws"), "/docs/a.txt", None).unwrap();

    engine.registry().remove_server_binding(Path::new("/home/u")).unwrap();
    engine.store().read(|t| {
        assert!(t.server(Path::new("/home/u")).is_none());
        assert!(t.root(Path::new("/home/u/ws")).is_none());
        assert!(t.states_of(Path::new("/home/u/ws")).is_empty());
        assert!(t.children(Path::new("/home/u/ws"), "/docs").is_empty());
        assert!(t.events().is_empty());
    });
    match engine.create_record(StateRecord::new("/home/u/ws", "/").unwrap()) {
        Err(SyncError::BindingNotFound(_)) => {}
        other => panic!("unexpected {:?}", other),
    }
}

fn local_workspace() -> (tempfile::TempDir, PathBuf) {
    let home = tempfile::tempdir().unwrap();
    let ws = home.path().join("ws");
    fs::create_dir_all(ws.join("docs")).unwrap();
    fs::write(ws.join("docs").join("a.txt"), b"some content").unwrap();
    (home, ws)
}

#[test]
fn test_scan_records_new_entries() {
    let (home, ws) = local_workspace();
    fs::create_dir_all(ws.join(".git")).unwrap();
    fs::write(ws.join(".git").join("HEAD"), b"ref").unwrap();
    fs::write(ws.join("docs").join("a.txt.swp"), b"swap").unwrap();

    let ignore = Ignore {
        regexes: vec![Regex::new(r"\.swp$").unwrap()],
        paths: vec!["/.git".to_owned()],
    };
    let engine = set_up(Config::default().with_ignore(ignore));
    bind(&engine, home.path(), &ws);

    let report = engine.scan_local(&ws).unwrap();
    assert!(report.moves.is_empty());
    assert!(report.failures.is_empty());
    let mut created: Vec<&str> = report
        .observations
        .iter()
        .filter(|o| o.change == Change::Created)
        .map(|o| o.key.path.as_str())
        .collect();
    created.sort();
    assert_eq!(created, vec!["/", "/docs", "/docs/a.txt"]);

    let key = RecordKey::new(&ws, "/docs/a.txt").unwrap();
    let record = engine.record(&key).unwrap();
    assert_eq!(record.local_state(), MicroState::Created);
    assert_eq!(record.pair_state(), PairState::LocallyCreated);
    assert!(!record.folderish);
    assert!(record.local_digest.is_some());
    assert!(record.last_local_updated.is_some());

    // nothing new the second time round
    let report = engine.scan_local(&ws).unwrap();
    assert!(report.observations.iter().all(|o| o.change != Change::Created));
}

#[test]
fn test_scan_detects_rename_and_move() {
    let (home, ws) = local_workspace();
    let engine = set_up(Config::default());
    bind(&engine, home.path(), &ws);
    engine.scan_local(&ws).unwrap();

    fs::rename(ws.join("docs").join("a.txt"), ws.join("docs").join("b.txt")).unwrap();
    let report = engine.scan_local(&ws).unwrap();
    assert_eq!(report.moves.len(), 1);
    let mv = &report.moves[0];
    assert_eq!(mv.side, Side::Local);
    assert_eq!(mv.from, "/docs/a.txt");
    assert_eq!(mv.to, "/docs/b.txt");
    assert!(report
        .observations
        .iter()
        .all(|o| o.key.path != "/docs/a.txt" && o.key.path != "/docs/b.txt"));

    let old = engine.record(&RecordKey::new(&ws, "/docs/a.txt").unwrap()).unwrap();
    assert_eq!(old.local_state(), MicroState::Deleted);
    assert_eq!(old.moved_to(Side::Local), Some("/docs/b.txt"));
    let new = engine.record(&RecordKey::new(&ws, "/docs/b.txt").unwrap()).unwrap();
    assert_eq!(new.moved_from(Side::Local), Some("/docs/a.txt"));

    // the two ends are listed as a move, not as a deletion and a creation
    assert!(engine
        .records_in_state(&ws, old.pair_state())
        .unwrap()
        .iter()
        .all(|record| record.path() != "/docs/a.txt"));
    assert!(engine
        .records_in_state(&ws, PairState::LocallyCreated)
        .unwrap()
        .iter()
        .all(|record| record.path() != "/docs/b.txt"));
    assert_eq!(engine.recorded_moves(&ws).unwrap(), report.moves);

    fs::create_dir(ws.join("archive")).unwrap();
    fs::rename(ws.join("docs").join("b.txt"), ws.join("archive").join("b.txt")).unwrap();
    let report = engine.scan_local(&ws).unwrap();
    assert_eq!(report.moves.len(), 1);
    assert_eq!(report.moves[0].from, "/docs/b.txt");
    assert_eq!(report.moves[0].to, "/archive/b.txt");
    assert_eq!(engine.recorded_moves(&ws).unwrap(), report.moves);
}

#[test]
fn test_remote_rename_is_recorded_as_a_move() {
    let engine = set_up(Config::default());
    bind(&engine, Path::new("/home/u"), Path::new("/home/u/ws"));
    let mut old = StateRecord::new("/home/u/ws", "/old.txt")
        .unwrap()
        .with_remote("default", "ref-1")
        .with_folderish(false)
        .with_states(MicroState::Synchronized, MicroState::Synchronized);
    old.last_remote_updated = Some(at(100));
    engine.create_record(old).unwrap();

    let file = Ok(Snapshot {
        last_modification_time: at(100),
        digest: Some("r100".to_owned()),
        folderish: false,
    });
    let report = engine
        .observe_remote(Path::new("/home/u/ws"), "/new.txt", "default", "ref-1", &Scripted::new(vec![file]))
        .unwrap();
    assert_eq!(report.moves.len(), 1);
    assert_eq!(report.moves[0].side, Side::Remote);
    assert!(report.observations.iter().all(|o| o.change != Change::Created));

    let old = engine.record(&RecordKey::new("/home/u/ws", "/old.txt").unwrap()).unwrap();
    let new = engine.record(&RecordKey::new("/home/u/ws", "/new.txt").unwrap()).unwrap();
    assert_eq!(old.moved_to(Side::Remote), Some("/new.txt"));
    assert_eq!(new.moved_from(Side::Remote), Some("/old.txt"));
    assert!(engine
        .records_in_state(Path::new("/home/u/ws"), PairState::RemotelyCreated)
        .unwrap()
        .is_empty());
    assert_eq!(engine.recorded_moves(Path::new("/home/u/ws")).unwrap(), report.moves);
}

#[cfg(target_os = "linux")]
#[test]
fn test_scan_survives_undecodable_names() {
    use std::ffi::OsStr;
    use std::os::unix::ffi::OsStrExt;

    let (home, ws) = local_workspace();
    fs::write(ws.join(OsStr::from_bytes(b"caf\xe9.txt")), b"latin-1").unwrap();
    let engine = set_up(Config::default());
    bind(&engine, home.path(), &ws);

    let report = engine.scan_local(&ws).unwrap();
    assert!(engine.record(&RecordKey::new(&ws, "/docs/a.txt").unwrap()).is_some());
    assert_eq!(report.failures.len(), 1);
    let (key, err) = &report.failures[0];
    assert_eq!(key.local_root, RecordKey::new(&ws, "/").unwrap().local_root);
    match err {
        SyncError::InvalidPath(_) => {}
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(engine.store().read(|t| t.states_of(&ws).len()), 3);
}

#[test]
fn test_scan_of_many_entries_commits_once() {
    let home = tempfile::tempdir().unwrap();
    let ws = home.path().join("ws");
    fs::create_dir_all(&ws).unwrap();
    for i in 0..200 {
        fs::write(ws.join(format!("f{:03}.txt", i)), format!("content {}", i)).unwrap();
    }
    let archive_dir = Config::archive_directory(home.path());
    let engine = Engine::new(Arc::new(Archive::open(&archive_dir).unwrap()), Config::default());
    bind(&engine, home.path(), &ws);

    let report = engine.scan_local(&ws).unwrap();
    assert_eq!(report.observations.len(), 201);
    assert!(report.failures.is_empty());
    assert_eq!(engine.locks().held(), 0);

    let report = engine.scan_local(&ws).unwrap();
    assert!(report.observations.iter().all(|o| o.change == Change::Unchanged));
    drop(engine);

    let engine = Engine::new(Arc::new(Archive::open(&archive_dir).unwrap()), Config::default());
    assert_eq!(engine.store().read(|t| t.states_of(&ws).len()), 201);
}

#[test]
fn test_move_correlation_is_idempotent() {
    let engine = set_up(Config::default());
    bind(&engine, Path::new("/home/u"), Path::new("/home/u/ws"));
    engine
        .create_record(
            StateRecord::new("/home/u/ws", "/old.txt")
                .unwrap()
                .with_remote("default", "ref-1")
                .with_states(MicroState::Synchronized, MicroState::Deleted),
        )
        .unwrap();
    engine
        .create_record(
            StateRecord::new("/home/u/ws", "/new.txt")
                .unwrap()
                .with_remote("default", "ref-1")
                .with_states(MicroState::Unknown, MicroState::Created),
        )
        .unwrap();

    let observation = |path: &str, change| Observation {
        key: RecordKey::new("/home/u/ws", path).unwrap(),
        side: Side::Remote,
        change,
        digest: None,
        remote_id: engine.record(&RecordKey::new("/home/u/ws", path).unwrap()).unwrap().remote_id(),
        folderish: false,
    };
    let pass = vec![
        observation("/old.txt", Change::Deleted),
        observation("/new.txt", Change::Created),
    ];

    let first = engine.track_moves(pass.clone()).unwrap();
    assert_eq!(first.moves.len(), 1);
    assert!(first.observations.is_empty());
    let recorded = engine.record(&RecordKey::new("/home/u/ws", "/old.txt").unwrap()).unwrap();
    assert_eq!(recorded.moved_to(Side::Remote), Some("/new.txt"));

    let second = engine.track_moves(pass).unwrap();
    assert!(second.moves.is_empty());
    assert_eq!(
        engine.record(&RecordKey::new("/home/u/ws", "/old.txt").unwrap()).unwrap(),
        recorded
    );
}

#[test]
fn test_archive_keeps_state_across_restarts() {
    let (home, ws) = local_workspace();
    let archive_dir = Config::archive_directory(home.path());
    {
        let engine = Engine::new(Arc::new(Archive::open(&archive_dir).unwrap()), Config::default());
        bind(&engine, home.path(), &ws);
        engine.scan_local(&ws).unwrap();
    }

    let engine = Engine::new(Arc::new(Archive::open(&archive_dir).unwrap()), Config::default());
    let children = engine.children(&ws, "/docs").unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].path(), "/docs/a.txt");
    assert_eq!(children[0].local_state(), MicroState::Created);
    assert!(engine.registry().remote_target(&ws).is_ok());
}
