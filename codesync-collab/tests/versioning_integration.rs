//! Integration tests for version history over the wire.
//!
//! A real server with a RocksDB store in a temp directory, driven by
//! real clients.

use codesync_collab::client::{SyncClient, SyncEvent};
use codesync_collab::protocol::{ErrorKind, ServerMessage, WireFormat};
use codesync_collab::server::{ServerConfig, SyncServer};
use codesync_collab::storage::Version;
use codesync_core::{ChangeSummary, DiffTag, FileRecord, VersionFile};
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

async fn start_server(dir: &tempfile::TempDir) -> u16 {
    let server = SyncServer::new(ServerConfig {
        storage_path: Some(dir.path().join("db")),
        autosave_interval: None,
        ..ServerConfig::default()
    })
    .unwrap();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    port
}

async fn connect(port: u16) -> (SyncClient, mpsc::Receiver<SyncEvent>) {
    let mut client = SyncClient::new(format!("ws://127.0.0.1:{port}"));
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, SyncEvent::Connected);
    (client, events)
}

async fn next_event(events: &mut mpsc::Receiver<SyncEvent>) -> SyncEvent {
    timeout(Duration::from_secs(3), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

async fn next_message(events: &mut mpsc::Receiver<SyncEvent>) -> ServerMessage {
    match next_event(events).await {
        SyncEvent::Message(msg) => msg,
        other => panic!("Expected server message, got {other:?}"),
    }
}

fn vfiles(entries: &[(&str, &str)]) -> Vec<VersionFile> {
    entries.iter().map(|(n, c)| VersionFile::new(*n, *c)).collect()
}

async fn save(
    client: &SyncClient,
    events: &mut mpsc::Receiver<SyncEvent>,
    session_id: &str,
    files: Vec<VersionFile>,
    message: &str,
) -> Version {
    client
        .save_version(session_id, files, message, Some("alice"))
        .await
        .unwrap();
    match next_message(events).await {
        ServerMessage::VersionSaved { version } => version,
        other => panic!("Expected VersionSaved, got {other:?}"),
    }
}

#[tokio::test]
async fn test_save_with_no_files_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_server(&dir).await;
    let (client, mut events) = connect(port).await;

    client
        .save_version("s1", Vec::new(), "empty", None)
        .await
        .unwrap();
    match next_message(&mut events).await {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::Validation),
        other => panic!("Expected Error, got {other:?}"),
    }

    client.list_versions("s1").await.unwrap();
    match next_message(&mut events).await {
        ServerMessage::VersionList { versions, .. } => assert!(versions.is_empty()),
        other => panic!("Expected VersionList, got {other:?}"),
    }
}

#[tokio::test]
async fn test_save_with_nameless_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_server(&dir).await;
    let (client, mut events) = connect(port).await;

    client
        .save_version("s1", vfiles(&[("ok.js", "1"), ("", "2")]), "bad", None)
        .await
        .unwrap();
    match next_message(&mut events).await {
        ServerMessage::Error { kind, message } => {
            assert_eq!(kind, ErrorKind::Validation);
            assert!(message.contains("index 1"));
        }
        other => panic!("Expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_saved_version_is_listed_first() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_server(&dir).await;
    let (client, mut events) = connect(port).await;

    let first = save(&client, &mut events, "s1", vfiles(&[("a.js", "1")]), "first").await;
    let second = save(&client, &mut events, "s1", vfiles(&[("a.js", "2")]), "second").await;
    assert_eq!(second.saved_by.as_deref(), Some("alice"));

    client.list_versions("s1").await.unwrap();
    match next_message(&mut events).await {
        ServerMessage::VersionList {
            session_id,
            versions,
        } => {
            assert_eq!(session_id, "s1");
            let ids: Vec<Uuid> = versions.iter().map(|v| v.id).collect();
            assert_eq!(ids, vec![second.id, first.id]);
            assert_eq!(versions[0].message, "second");
        }
        other => panic!("Expected VersionList, got {other:?}"),
    }
}

#[tokio::test]
async fn test_diff_of_version_with_itself_is_empty() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_server(&dir).await;
    let (client, mut events) = connect(port).await;

    let v = save(
        &client,
        &mut events,
        "s1",
        vfiles(&[("a.js", "one\ntwo"), ("b.py", "x = 1")]),
        "",
    )
    .await;

    client.diff_versions(v.id, v.id).await.unwrap();
    match next_message(&mut events).await {
        ServerMessage::VersionDiff { diff } => {
            assert_eq!(diff.added_lines(), 0);
            assert_eq!(diff.removed_lines(), 0);
            assert_eq!(diff.files.len(), 2);
            assert_eq!(diff.summary, ChangeSummary::Updated);
        }
        other => panic!("Expected VersionDiff, got {other:?}"),
    }
}

#[tokio::test]
async fn test_diff_line_change_is_lines_removed() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_server(&dir).await;
    let (client, mut events) = connect(port).await;

    let a = save(&client, &mut events, "s1", vfiles(&[("x.js", "a\nb")]), "a").await;
    let b = save(
        &client,
        &mut events,
        "s1",
        vfiles(&[("x.js", "a\nc"), ("new.py", "p\nq")]),
        "b",
    )
    .await;

    client.diff_versions(a.id, b.id).await.unwrap();
    let diff = match next_message(&mut events).await {
        ServerMessage::VersionDiff { diff } => diff,
        other => panic!("Expected VersionDiff, got {other:?}"),
    };
    assert_eq!(diff.summary, ChangeSummary::LinesRemoved);
    assert_eq!(diff.summary.message(), "Removed lines");

    let new_file = diff.files.iter().find(|f| f.file_name == "new.py").unwrap();
    assert_eq!(new_file.added_lines(), 2);
    assert_eq!(new_file.removed_lines(), 0);

    let x = diff.files.iter().find(|f| f.file_name == "x.js").unwrap();
    let tagged: Vec<(DiffTag, Vec<String>)> = x
        .parts
        .iter()
        .map(|p| (p.tag, p.lines.clone()))
        .collect();
    assert_eq!(
        tagged,
        vec![
            (DiffTag::Unchanged, vec!["a".to_string()]),
            (DiffTag::Removed, vec!["b".to_string()]),
            (DiffTag::Added, vec!["c".to_string()]),
        ]
    );
}

#[tokio::test]
async fn test_diff_unknown_version_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_server(&dir).await;
    let (client, mut events) = connect(port).await;

    let v = save(&client, &mut events, "s1", vfiles(&[("a.js", "1")]), "").await;
    client.diff_versions(v.id, Uuid::new_v4()).await.unwrap();
    match next_message(&mut events).await {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
        other => panic!("Expected Error, got {other:?}"),
    }

    client.restore_version(Uuid::new_v4()).await.unwrap();
    match next_message(&mut events).await {
        ServerMessage::Error { kind, .. } => assert_eq!(kind, ErrorKind::NotFound),
        other => panic!("Expected Error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_restore_then_edit_matches_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_server(&dir).await;
    let (alice, mut alice_rx) = connect(port).await;
    let (bob, mut bob_rx) = connect(port).await;

    alice.attach("s1", Some("alice")).await.unwrap();
    assert!(matches!(
        next_message(&mut alice_rx).await,
        ServerMessage::Attached { .. }
    ));
    bob.attach("s1", Some("bob")).await.unwrap();
    assert!(matches!(
        next_message(&mut bob_rx).await,
        ServerMessage::Attached { .. }
    ));

    let snapshot = vfiles(&[("main.js", "console.log('v1')"), ("lib.py", "def f(): pass")]);
    let saved = save(&alice, &mut alice_rx, "s1", snapshot.clone(), "v1").await;

    // Live state moves on.
    alice
        .edit("s1", vec![FileRecord::inferred("main.js", "changed")])
        .await
        .unwrap();
    assert!(matches!(
        next_message(&mut bob_rx).await,
        ServerMessage::FilesReplaced { .. }
    ));

    // Restoring only returns the files; nobody else is told.
    alice.restore_version(saved.id).await.unwrap();
    let restored = match next_message(&mut alice_rx).await {
        ServerMessage::VersionRestored { version_id, files } => {
            assert_eq!(version_id, saved.id);
            files
        }
        other => panic!("Expected VersionRestored, got {other:?}"),
    };
    assert_eq!(restored, snapshot);

    // Pushing the restored files through an edit makes them live.
    let records: Vec<FileRecord> = restored
        .iter()
        .map(|f| FileRecord::inferred(f.name.clone(), f.content.clone()))
        .collect();
    alice.edit("s1", records).await.unwrap();

    match next_message(&mut bob_rx).await {
        ServerMessage::FilesReplaced { files, .. } => {
            let live: Vec<VersionFile> = files.iter().map(FileRecord::to_version_file).collect();
            let mut expected = snapshot.clone();
            expected.sort_by(|a, b| a.name.cmp(&b.name));
            assert_eq!(live, expected);
        }
        other => panic!("Expected FilesReplaced, got {other:?}"),
    }
}

#[tokio::test]
async fn test_json_save_and_list() {
    let dir = tempfile::tempdir().unwrap();
    let port = start_server(&dir).await;
    let mut client =
        SyncClient::new(format!("ws://127.0.0.1:{port}")).with_format(WireFormat::Json);
    let mut events = client.take_event_rx().unwrap();
    client.connect().await.unwrap();
    assert_eq!(next_event(&mut events).await, SyncEvent::Connected);

    let v = save(&client, &mut events, "web", vfiles(&[("index.html", "<p>")]), "page").await;
    client.list_versions("web").await.unwrap();
    match next_message(&mut events).await {
        ServerMessage::VersionList { versions, .. } => assert_eq!(versions[0].id, v.id),
        other => panic!("Expected VersionList, got {other:?}"),
    }
}
