use super::*;
use crate::collaborators::{CollaboratorError, MediaServer, TransferActivity, TransferPipeline};
use crate::testing::{FakeDrive, memory_index};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Mutex;
use strm_core::{EntryKind, LifeCursor, ROOT_ID};
use tempfile::TempDir;

const FOO_PICKCODE: &str = "ABCDEFGHIJKLMNOPQ";

#[derive(Default)]
struct Recorder {
    refreshed: Mutex<Vec<PathBuf>>,
    enqueued: Mutex<Vec<String>>,
    tickets: Mutex<Vec<TransferTicket>>,
    busy: bool,
}

#[async_trait]
impl MediaServer for Recorder {
    async fn refresh(&self, paths: &[PathBuf]) -> Result<(), CollaboratorError> {
        self.refreshed.lock().unwrap().extend_from_slice(paths);
        Ok(())
    }

    async fn refresh_all(&self) -> Result<(), CollaboratorError> {
        Ok(())
    }
}

#[async_trait]
impl TransferPipeline for Recorder {
    async fn enqueue(
        &self,
        _entry: &RemoteEntry,
        remote_path: &str,
        ticket: TransferTicket,
    ) -> Result<(), CollaboratorError> {
        self.enqueued.lock().unwrap().push(remote_path.to_string());
        self.tickets.lock().unwrap().push(ticket);
        Ok(())
    }
}

impl TransferActivity for Recorder {
    fn is_busy(&self) -> bool {
        self.busy
    }
}

struct Fixture {
    _dir: TempDir,
    local_root: PathBuf,
    drive: Arc<FakeDrive>,
    index: Arc<PathIndex>,
    recorder: Arc<Recorder>,
    monitor: LifeEventMonitor,
}

async fn fixture_with(tweak: impl FnOnce(&mut SyncConfig), recorder: Recorder) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let local_root = dir.path().join("strm/Movies");
    let mut config = SyncConfig {
        mappings: vec![SyncRootMapping::new(&local_root, "/Movies")],
        work_dir: dir.path().join("work"),
        ..SyncConfig::default()
    };
    tweak(&mut config);
    let config = Arc::new(config);

    let drive = Arc::new(FakeDrive::new());
    drive.add_dir(1, ROOT_ID, "Movies");
    drive.add_dir(2, 1, "Foo (2020)");
    drive.add_file(3, 2, "Foo.mkv", 4096, FOO_PICKCODE);

    let index = memory_index().await;
    let cache = Arc::new(IdPathCache::new(1000, index.clone(), drive.clone()));
    let recorder = Arc::new(recorder);
    let collaborators = Collaborators {
        media_server: recorder.clone(),
        pipeline: recorder.clone(),
        activity: recorder.clone(),
        ..Collaborators::default()
    };
    let monitor = LifeEventMonitor::new(
        config,
        drive.clone(),
        index.clone(),
        cache,
        collaborators,
    );
    Fixture {
        _dir: dir,
        local_root,
        drive,
        index,
        recorder,
        monitor,
    }
}

async fn fixture() -> Fixture {
    fixture_with(|_| {}, Recorder::default()).await
}

fn row(id: RemoteId, parent_id: RemoteId, path: &str, kind: EntryKind) -> IndexRow {
    IndexRow {
        id,
        parent_id,
        name: path.rsplit('/').next().unwrap().to_string(),
        path: path.to_string(),
        kind,
        pickcode: (kind == EntryKind::File).then(|| FOO_PICKCODE.to_string()),
        sha1: None,
        size: Some(4096),
    }
}

/// Index and local tree as a previous sync would have left them.
async fn seed_synced(fx: &Fixture) -> PathBuf {
    fx.index
        .upsert_batch(&[
            row(1, ROOT_ID, "/Movies", EntryKind::Dir),
            row(2, 1, "/Movies/Foo (2020)", EntryKind::Dir),
            row(3, 2, "/Movies/Foo (2020)/Foo.mkv", EntryKind::File),
        ])
        .await
        .unwrap();
    write_file(&fx.local_root.join("Foo (2020)/Foo.strm"))
}

fn write_file(path: &Path) -> PathBuf {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, "http://127.0.0.1:9115/redirect?pickcode=ABCDEFGHIJKLMNOPQ").unwrap();
    path.to_path_buf()
}

#[tokio::test]
async fn upload_generates_placeholder_and_refreshes() {
    let fx = fixture().await;
    fx.drive.event_for(1, LifeEventKind::Upload, 3, 100);

    let report = fx.monitor.poll_once().await.unwrap();

    let target = fx.local_root.join("Foo (2020)/Foo.strm");
    assert_eq!(report.events, 1);
    assert_eq!(report.summary.generated, 1);
    assert_eq!(
        std::fs::read_to_string(&target).unwrap(),
        "http://127.0.0.1:9115/redirect?pickcode=ABCDEFGHIJKLMNOPQ"
    );
    assert_eq!(*fx.recorder.refreshed.lock().unwrap(), vec![target]);

    let row = fx.index.get_by_id(3).await.unwrap().unwrap();
    assert_eq!(row.path, "/Movies/Foo (2020)/Foo.mkv");
    assert_eq!(
        fx.index.load_cursor().await.unwrap(),
        LifeCursor { time: 100, id: 1 }
    );
}

#[tokio::test]
async fn committed_cursor_is_not_replayed() {
    let fx = fixture().await;
    fx.drive.event_for(1, LifeEventKind::Upload, 3, 100);
    fx.drive.event_for(2, LifeEventKind::Browse, 3, 101);

    let first = fx.monitor.poll_once().await.unwrap();
    assert_eq!(first.events, 2);
    assert_eq!(
        fx.index.load_cursor().await.unwrap(),
        LifeCursor { time: 101, id: 2 }
    );

    let second = fx.monitor.poll_once().await.unwrap();
    assert_eq!(second.events, 0);
    assert_eq!(second.summary, SyncSummary::default());
}

#[tokio::test]
async fn feed_failure_leaves_cursor_alone() {
    let fx = fixture().await;
    fx.index
        .store_cursor(LifeCursor { time: 50, id: 7 })
        .await
        .unwrap();
    fx.drive.event_for(8, LifeEventKind::Upload, 3, 60);
    fx.drive.fail_events(true);

    let err = fx.monitor.poll_once().await.unwrap_err();
    assert!(matches!(err, SyncError::Drive(_)));
    assert_eq!(
        fx.index.load_cursor().await.unwrap(),
        LifeCursor { time: 50, id: 7 }
    );
    assert!(!fx.local_root.join("Foo (2020)/Foo.strm").exists());
}

#[tokio::test]
async fn delete_removes_placeholder_and_empty_folder() {
    let fx = fixture().await;
    let placeholder = seed_synced(&fx).await;
    fx.drive.remove(3);
    fx.drive.event_for(1, LifeEventKind::Delete, 3, 100);

    let report = fx.monitor.poll_once().await.unwrap();

    assert_eq!(report.removed, 1);
    assert!(!placeholder.exists());
    assert!(!fx.local_root.join("Foo (2020)").exists());
    assert!(fx.local_root.exists());
    assert!(fx.index.get_by_id(3).await.unwrap().is_none());
    assert!(fx.index.get_by_id(2).await.unwrap().is_some());
}

#[tokio::test]
async fn folder_delete_removes_subtree() {
    let fx = fixture().await;
    seed_synced(&fx).await;
    write_file(&fx.local_root.join("Foo (2020)/extras/Trailer.strm"));
    fx.drive.remove(3);
    fx.drive.remove(2);
    fx.drive.event_for(1, LifeEventKind::Delete, 2, 100);

    fx.monitor.poll_once().await.unwrap();

    assert!(!fx.local_root.join("Foo (2020)").exists());
    assert!(fx.index.get_by_id(2).await.unwrap().is_none());
    assert!(fx.index.get_by_id(3).await.unwrap().is_none());
    assert!(fx.index.get_by_id(1).await.unwrap().is_some());
}

#[tokio::test]
async fn unindexed_delete_leaves_filesystem_alone() {
    let fx = fixture().await;
    let placeholder = write_file(&fx.local_root.join("Foo (2020)/Foo.strm"));
    fx.drive.remove(3);
    fx.drive.event_for(1, LifeEventKind::Delete, 3, 100);

    let report = fx.monitor.poll_once().await.unwrap();

    assert_eq!(report.removed, 0);
    assert!(placeholder.exists());
    assert_eq!(
        fx.index.load_cursor().await.unwrap(),
        LifeCursor { time: 100, id: 1 }
    );
}

#[tokio::test]
async fn mapping_root_is_never_deleted() {
    let fx = fixture().await;
    let placeholder = seed_synced(&fx).await;
    fx.drive.event_for(1, LifeEventKind::Delete, 1, 100);

    fx.monitor.poll_once().await.unwrap();

    assert!(placeholder.exists());
    assert!(fx.index.get_by_id(1).await.unwrap().is_none());
}

#[tokio::test]
async fn move_removes_old_placeholder() {
    let fx = fixture().await;
    fx.index
        .upsert_batch(&[
            row(6, 1, "/Movies/Old", EntryKind::Dir),
            row(3, 6, "/Movies/Old/Foo.mkv", EntryKind::File),
        ])
        .await
        .unwrap();
    let old = write_file(&fx.local_root.join("Old/Foo.strm"));
    fx.drive.event_for(1, LifeEventKind::Move, 3, 100);

    let report = fx.monitor.poll_once().await.unwrap();

    assert_eq!(report.removed, 1);
    assert!(!old.exists());
    assert!(!fx.local_root.join("Old").exists());
    assert!(fx.local_root.join("Foo (2020)/Foo.strm").exists());
    assert_eq!(
        fx.index.get_by_id(3).await.unwrap().unwrap().path,
        "/Movies/Foo (2020)/Foo.mkv"
    );
}

#[tokio::test]
async fn rename_keeps_the_index_row() {
    let fx = fixture().await;
    let old = seed_synced(&fx).await;
    fx.drive.rename(3, 2, "Foo.2020.mkv");
    fx.drive.event_for(1, LifeEventKind::Rename, 3, 100);

    let report = fx.monitor.poll_once().await.unwrap();

    assert_eq!(report.removed, 1);
    assert!(!old.exists());
    assert!(fx.local_root.join("Foo (2020)/Foo.2020.strm").exists());
    let row = fx.index.get_by_id(3).await.unwrap().unwrap();
    assert_eq!(row.path, "/Movies/Foo (2020)/Foo.2020.mkv");
    assert_eq!(row.name, "Foo.2020.mkv");
    assert_eq!(row.parent_id, 2);
    assert_eq!(row.pickcode.as_deref(), Some(FOO_PICKCODE));
}

#[tokio::test]
async fn uploaded_folder_is_generated_recursively() {
    let fx = fixture().await;
    fx.drive.add_dir(10, 1, "Bar (2021)");
    fx.drive.add_file(11, 10, "Bar.mp4", 2048, "BBBBBBBBBBBBBBBBB");
    fx.drive.add_dir(12, 10, "Extras");
    fx.drive.add_file(13, 12, "Making Of.mkv", 2048, "CCCCCCCCCCCCCCCCC");
    fx.drive.event_for(1, LifeEventKind::Copy, 10, 100);

    let report = fx.monitor.poll_once().await.unwrap();

    assert_eq!(report.summary.generated, 2);
    assert!(fx.local_root.join("Bar (2021)/Bar.strm").exists());
    assert!(fx.local_root.join("Bar (2021)/Extras/Making Of.strm").exists());
    assert_eq!(
        fx.index.get_by_id(12).await.unwrap().unwrap().path,
        "/Movies/Bar (2021)/Extras"
    );
}

#[tokio::test]
async fn transfer_root_items_are_handed_off() {
    let fx = fixture_with(
        |config| config.transfer_roots = vec!["/Inbox".into()],
        Recorder::default(),
    )
    .await;
    fx.drive.add_dir(20, ROOT_ID, "Inbox");
    fx.drive.add_dir(21, 20, "Batch");
    fx.drive.add_file(22, 21, "New.mkv", 4096, "DDDDDDDDDDDDDDDDD");
    fx.drive.add_file(23, 21, "readme.txt", 10, "EEEEEEEEEEEEEEEEE");
    fx.drive.event_for(1, LifeEventKind::ReceiveShare, 21, 100);

    let report = fx.monitor.poll_once().await.unwrap();

    assert_eq!(report.summary.generated, 0);
    assert_eq!(
        *fx.recorder.enqueued.lock().unwrap(),
        vec!["/Inbox/Batch/New.mkv".to_string()]
    );
    let tickets = fx.recorder.tickets.lock().unwrap();
    assert_eq!(tickets.iter().map(TransferTicket::id).collect::<Vec<_>>(), vec![22]);
}

async fn inbox_fixture() -> Fixture {
    let fx = fixture_with(
        |config| config.transfer_roots = vec!["/Inbox".into()],
        Recorder::default(),
    )
    .await;
    fx.drive.add_dir(20, ROOT_ID, "Inbox");
    fx.drive.add_file(22, 20, "New.mkv", 4096, "DDDDDDDDDDDDDDDDD");
    fx
}

#[tokio::test]
async fn handed_off_file_is_placed_by_its_ticket() {
    let fx = inbox_fixture().await;
    fx.drive.event_for(1, LifeEventKind::Upload, 22, 100);
    fx.monitor.poll_once().await.unwrap();
    let ticket = fx.recorder.tickets.lock().unwrap().pop().unwrap();

    // Moved while the pipeline still holds it: left alone.
    fx.drive.rename(22, 1, "New.mkv");
    fx.drive.event_for(2, LifeEventKind::Move, 22, 101);
    let report = fx.monitor.poll_once().await.unwrap();
    assert_eq!(report.summary.generated, 0);
    assert!(!fx.local_root.join("New.strm").exists());

    ticket.complete(RenameHint {
        name: "New (2022) - 1080p.mkv".into(),
        target_dir: "/Movies/New (2022)".into(),
        remote_dir: "/Inbox".into(),
    });
    fx.drive.event_for(3, LifeEventKind::Move, 22, 102);
    let report = fx.monitor.poll_once().await.unwrap();

    assert_eq!(report.summary.generated, 1);
    assert!(fx.local_root.join("New (2022)/New (2022) - 1080p.strm").exists());
    assert!(!fx.local_root.join("New.strm").exists());
    assert_eq!(
        fx.index.get_by_id(22).await.unwrap().unwrap().path,
        "/Movies/New (2022)/New (2022) - 1080p.mkv"
    );
}

#[tokio::test]
async fn abandoned_ticket_frees_the_file() {
    let fx = inbox_fixture().await;
    fx.drive.event_for(1, LifeEventKind::Upload, 22, 100);
    fx.monitor.poll_once().await.unwrap();
    fx.recorder.tickets.lock().unwrap().pop().unwrap().abandon();

    fx.drive.rename(22, 1, "New.mkv");
    fx.drive.event_for(2, LifeEventKind::Move, 22, 101);
    let report = fx.monitor.poll_once().await.unwrap();

    assert_eq!(report.summary.generated, 1);
    assert!(fx.local_root.join("New.strm").exists());
}

#[tokio::test]
async fn failing_event_does_not_block_the_feed() {
    let fx = fixture().await;
    fx.drive.add_dir(10, 1, "Bar (2021)");
    fx.drive.add_file(11, 10, "Bar.mp4", 2048, "BBBBBBBBBBBBBBBBB");
    fx.drive.fail_listing(true);
    fx.drive.event_for(1, LifeEventKind::Upload, 10, 100);
    fx.drive.event_for(2, LifeEventKind::Upload, 3, 101);

    let report = fx.monitor.poll_once().await.unwrap();

    assert_eq!(report.events, 2);
    assert_eq!(report.summary.failed, 1);
    assert_eq!(report.summary.reason_count(REASON_EVENT_FAILED), 1);
    assert_eq!(report.summary.generated, 1);
    assert!(fx.local_root.join("Foo (2020)/Foo.strm").exists());
    assert_eq!(
        fx.index.load_cursor().await.unwrap(),
        LifeCursor { time: 101, id: 2 }
    );
    assert_eq!(fx.monitor.poll_once().await.unwrap().events, 0);
}

#[tokio::test]
async fn disabled_toggle_indexes_without_generating() {
    let fx = fixture_with(
        |config| {
            config.monitor.toggles.generate.remove(&LifeEventKind::Upload);
        },
        Recorder::default(),
    )
    .await;
    fx.drive.event_for(1, LifeEventKind::Upload, 3, 100);

    let report = fx.monitor.poll_once().await.unwrap();

    assert_eq!(report.summary.generated, 0);
    assert!(!fx.local_root.join("Foo (2020)/Foo.strm").exists());
    assert!(fx.index.get_by_id(3).await.unwrap().is_some());
}

#[tokio::test]
async fn new_folder_is_written_through() {
    let fx = fixture().await;
    fx.drive.add_dir(30, 1, "Fresh");
    fx.drive.event_for(1, LifeEventKind::NewFolder, 30, 100);

    fx.monitor.poll_once().await.unwrap();

    let row = fx.index.get_by_id(30).await.unwrap().unwrap();
    assert_eq!(row.path, "/Movies/Fresh");
    assert!(row.is_dir());
}

#[tokio::test]
async fn busy_monitor_stops_on_cancel() {
    let fx = fixture_with(
        |_| {},
        Recorder {
            busy: true,
            ..Recorder::default()
        },
    )
    .await;
    let stop = CancellationToken::new();
    let canceller = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), fx.monitor.run(&stop))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fx.drive.calls("life_events"), 0);
}

#[tokio::test]
async fn feed_errors_do_not_end_the_loop() {
    let fx = fixture().await;
    fx.drive.fail_events(true);
    let stop = CancellationToken::new();
    let canceller = stop.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        canceller.cancel();
    });

    tokio::time::timeout(Duration::from_secs(5), fx.monitor.run(&stop))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fx.drive.calls("life_events"), 1);
}

#[test]
fn claims_are_exclusive() {
    let claims = ClaimTable::new(Duration::from_secs(60));
    assert!(claims.claim_for_monitor(1));
    assert!(!claims.claim_for_transfer(1));
    claims.release(1);
    assert!(claims.claim_for_transfer(1));
    assert!(!claims.claim_for_monitor(1));
}

#[test]
fn rename_hints_are_taken_once() {
    let ledger = RenameLedger::new(Duration::from_secs(60));
    let hint = RenameHint {
        name: "A.mkv".into(),
        target_dir: "/Movies".into(),
        remote_dir: "/Inbox".into(),
    };
    ledger.record(5, hint.clone());
    assert_eq!(ledger.take(5), Some(hint));
    assert_eq!(ledger.take(5), None);
}
