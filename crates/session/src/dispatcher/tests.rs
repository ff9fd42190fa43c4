use std::time::Duration;

use serde_json::json;

use devcell_core::testing::{collaborator, owner};
use devcell_sync::PipelineConfig;
use devcell_sync::testing::{MemoryConnector, MemoryRemote, MemorySyncStore};

use super::*;
use crate::container::FsEventKind;
use crate::testing::{FakeProvider, RecordingDeployer};

struct Harness {
    dispatcher: SessionDispatcher,
    provider: Arc<FakeProvider>,
    remote: Arc<MemoryRemote>,
    deployer: Arc<RecordingDeployer>,
}

fn harness_with(config: DispatcherConfig) -> Harness {
    harness_with_pipeline(
        config,
        PipelineConfig {
            batch_delay: Duration::from_millis(10),
            ..PipelineConfig::default()
        },
    )
}

fn harness_with_pipeline(config: DispatcherConfig, pipeline: PipelineConfig) -> Harness {
    let provider = Arc::new(FakeProvider::new("/project"));
    let remote = Arc::new(MemoryRemote::new());
    remote.seed_repo("42", "acme/site", &[("README.md", "# site\n")]);
    let store = Arc::new(MemorySyncStore::new());
    let sync = Arc::new(SyncService::new(
        store,
        Arc::new(MemoryConnector::new(remote.clone())),
        pipeline,
    ));
    sync.set_user_token(&"owner".to_string(), "token").unwrap();
    let deployer = Arc::new(RecordingDeployer::new());
    let dispatcher = SessionDispatcher::new(
        config,
        provider.clone(),
        sync,
        Some(deployer.clone()),
    );
    Harness {
        dispatcher,
        provider,
        remote,
        deployer,
    }
}

fn harness() -> Harness {
    harness_with(DispatcherConfig::default())
}

type Inbox = mpsc::UnboundedReceiver<ServerMessage>;

async fn join(h: &Harness, conn: &Connection) -> Inbox {
    let (tx, rx) = mpsc::unbounded_channel();
    h.dispatcher.connect(conn, tx).await.unwrap();
    rx
}

async fn call(h: &Harness, conn: &Connection, event: &str, payload: Value) -> Ack {
    let frame = ClientFrame::parse(&json!({"id": 1, "event": event, "payload": payload}).to_string())
        .unwrap();
    match h.dispatcher.handle(conn, frame).await {
        ServerMessage::Ack { id, ack } => {
            assert_eq!(id, Some(1));
            ack
        }
        other => panic!("expected ack, got {other:?}"),
    }
}

fn drain(inbox: &mut Inbox) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Ok(message) = inbox.try_recv() {
        if let ServerMessage::Event(event) = message {
            events.push(event);
        }
    }
    events
}

async fn next_event(inbox: &mut Inbox) -> ServerEvent {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(2), inbox.recv())
            .await
            .expect("timed out waiting for event")
            .expect("inbox closed");
        if let ServerMessage::Event(event) = message {
            return event;
        }
    }
}

fn code(ack: &Ack) -> Option<&'static str> {
    ack.code
}

#[tokio::test]
async fn owner_presence_follows_owner_tabs() {
    let h = harness();
    let tab1 = owner("p1");
    let tab2 = owner("p1");
    let guest = collaborator("p1");

    let mut inbox1 = join(&h, &tab1).await;
    let _inbox2 = join(&h, &tab2).await;
    let mut guest_inbox = join(&h, &guest).await;
    assert_eq!(
        drain(&mut inbox1),
        vec![ServerEvent::OwnerPresence { connected: true }]
    );
    assert!(h.dispatcher.owner_is_connected("p1"));
    assert_eq!(h.dispatcher.connection_count("p1"), 3);
    assert_eq!(h.provider.connects(), 1);

    h.dispatcher.disconnect(&tab1);
    assert!(h.dispatcher.owner_is_connected("p1"));
    assert!(drain(&mut guest_inbox).is_empty());

    h.dispatcher.disconnect(&tab2);
    assert!(!h.dispatcher.owner_is_connected("p1"));
    assert_eq!(
        drain(&mut guest_inbox),
        vec![ServerEvent::OwnerPresence { connected: false }]
    );

    // A second disconnect of the same connection changes nothing.
    h.dispatcher.disconnect(&tab2);
    assert_eq!(h.dispatcher.connection_count("p1"), 1);
}

#[tokio::test]
async fn collaborators_need_a_present_owner_when_required() {
    let mut config = DispatcherConfig::default();
    config.session.require_owner_presence = true;
    let h = harness_with(config);

    let guest = collaborator("p1");
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = h.dispatcher.connect(&guest, tx).await.unwrap_err();
    assert!(matches!(err, SessionError::PermissionDenied(_)), "got {err}");
    assert!(!h.dispatcher.has_session("p1"));

    let _owner_inbox = join(&h, &owner("p1")).await;
    let _guest_inbox = join(&h, &guest).await;
    assert_eq!(h.dispatcher.connection_count("p1"), 2);
}

#[tokio::test]
async fn project_wide_writes_are_owner_only() {
    let h = harness();
    let guest = collaborator("p1");
    let _owner_inbox = join(&h, &owner("p1")).await;
    let _guest_inbox = join(&h, &guest).await;

    for (event, payload) in [
        ("createCommit", json!({"message": "mine now"})),
        ("linkRepo", json!({"repositoryId": "42"})),
        ("removeRepo", json!({})),
        ("deploy", json!({"name": "blog"})),
    ] {
        let ack = call(&h, &guest, event, payload).await;
        assert!(!ack.success, "{event} should be refused");
        assert_eq!(code(&ack), Some("permission_denied"), "{event}");
    }
    assert!(h.deployer.deploys().is_empty());

    let ack = call(&h, &guest, "saveFile", json!({"path": "notes.md", "content": "hi"})).await;
    assert!(ack.success, "{:?}", ack.error);
}

#[tokio::test]
async fn requests_without_a_session_are_unavailable() {
    let h = harness();
    let ack = call(&h, &owner("ghost"), "getFileTree", json!({})).await;
    assert_eq!(code(&ack), Some("unavailable"));
}

#[tokio::test]
async fn malformed_requests_keep_their_id() {
    let h = harness();
    let conn = owner("p1");
    let _inbox = join(&h, &conn).await;

    let reply = h
        .dispatcher
        .handle_text(&conn, r#"{"id": 77, "event": "formatDisk", "payload": {}}"#)
        .await;
    let ServerMessage::Ack { id, ack } = reply else {
        panic!("expected ack");
    };
    assert_eq!(id, Some(77));
    assert_eq!(code(&ack), Some("invalid_request"));

    let reply = h.dispatcher.handle_text(&conn, "{{{").await;
    let ServerMessage::Ack { id, ack } = reply else {
        panic!("expected ack");
    };
    assert_eq!(id, None);
    assert_eq!(code(&ack), Some("invalid_request"));
}

#[tokio::test]
async fn oversized_save_is_rejected_before_writing() {
    let mut config = DispatcherConfig::default();
    config.session.max_file_bytes = 8;
    let h = harness_with(config);
    let conn = owner("p1");
    let _inbox = join(&h, &conn).await;

    let ack = call(&h, &conn, "saveFile", json!({"path": "big.txt", "content": "0123456789"})).await;
    assert_eq!(code(&ack), Some("resource_limit"));
    let container = h.provider.container("p1");
    assert_eq!(container.write_count(), 0);
    assert!(container.file("/project/big.txt").is_none());
}

#[tokio::test]
async fn paths_outside_the_project_are_refused() {
    let h = harness();
    let conn = owner("p1");
    let _inbox = join(&h, &conn).await;

    let ack = call(&h, &conn, "getFile", json!({"path": "../etc/passwd"})).await;
    assert_eq!(code(&ack), Some("permission_denied"));
    let ack = call(&h, &conn, "saveFile", json!({"path": "/etc/hosts", "content": "x"})).await;
    assert_eq!(code(&ack), Some("permission_denied"));
    assert_eq!(h.provider.container("p1").write_count(), 0);
}

#[tokio::test]
async fn file_changes_reach_every_connection_and_the_change_set() {
    let h = harness();
    let me = owner("p1");
    let guest = collaborator("p1");
    let mut my_inbox = join(&h, &me).await;
    let mut guest_inbox = join(&h, &guest).await;
    drain(&mut my_inbox);

    let ack = call(&h, &guest, "createFile", json!({"path": "src/app.js"})).await;
    assert!(ack.success, "{:?}", ack.error);
    assert!(ack.data.contains_key("tree"));

    for inbox in [&mut my_inbox, &mut guest_inbox] {
        let events = drain(inbox);
        let trees: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                ServerEvent::FileTree { tree } => Some(tree),
                _ => None,
            })
            .collect();
        assert_eq!(trees.len(), 1);
        assert!(FileNode::find(trees[0], "/project/src/app.js").is_some());
    }

    let ack = call(&h, &me, "renameFile", json!({"path": "src/app.js", "newName": "main.js"})).await;
    assert_eq!(ack.data["path"], json!("/project/src/main.js"));

    let ack = call(&h, &me, "getChangedFiles", json!({})).await;
    assert_eq!(ack.data["changedFiles"]["created"], json!(["src/main.js"]));

    let ack = call(&h, &me, "deleteFolder", json!({"path": "src"})).await;
    assert!(ack.success, "{:?}", ack.error);
    let ack = call(&h, &me, "getChangedFiles", json!({})).await;
    assert_eq!(ack.data["changedFiles"]["created"], json!([]));
    assert_eq!(ack.data["changedFiles"]["deleted"], json!([]));
}

#[tokio::test]
async fn watcher_refreshes_are_broadcast() {
    let h = harness();
    let conn = owner("p1");
    let mut inbox = join(&h, &conn).await;
    drain(&mut inbox);

    let container = h.provider.container("p1");
    container.put_file("/project/made-by-shell.txt", "");
    container.emit("/project/made-by-shell.txt", FsEventKind::Created);

    match next_event(&mut inbox).await {
        ServerEvent::FileTree { tree } => {
            assert!(FileNode::find(&tree, "/project/made-by-shell.txt").is_some());
        }
        other => panic!("expected file tree, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn writes_are_serialized_per_project_only() {
    let h = harness();
    let a = owner("alpha");
    let b = owner("beta");
    let _ia = join(&h, &a).await;
    let _ib = join(&h, &b).await;
    for project in ["alpha", "beta"] {
        h.provider
            .container(project)
            .set_write_delay(Duration::from_millis(50));
    }

    let (r1, r2, r3) = tokio::join!(
        call(&h, &a, "saveFile", json!({"path": "one.txt", "content": "x"})),
        call(&h, &a, "saveFile", json!({"path": "two.txt", "content": "x"})),
        call(&h, &b, "saveFile", json!({"path": "three.txt", "content": "x"})),
    );
    assert!(r1.success && r2.success && r3.success);

    let alpha = h.provider.container("alpha").write_spans();
    assert_eq!(alpha.len(), 2);
    let (first, second) = if alpha[0].0 <= alpha[1].0 {
        (alpha[0], alpha[1])
    } else {
        (alpha[1], alpha[0])
    };
    assert!(first.1 <= second.0, "same-project writes overlapped");

    let beta = h.provider.container("beta").write_spans();
    assert!(beta[0].0 < first.1, "other projects should not wait");
}

#[tokio::test]
async fn preview_urls_go_to_everyone_and_output_to_the_opener() {
    let h = harness();
    let me = owner("p1");
    let guest = collaborator("p1");
    let mut my_inbox = join(&h, &me).await;
    let mut guest_inbox = join(&h, &guest).await;
    drain(&mut my_inbox);

    let ack = call(&h, &me, "createTerminal", json!({"id": "t1"})).await;
    assert!(ack.success, "{:?}", ack.error);
    assert_eq!(ack.data["terminal"]["id"], json!("t1"));

    let pty = h.provider.container("p1").terminals().remove(0);
    pty.print("  Local:   http://localhost:5173/\n");

    let expected = ServerEvent::PreviewUrl {
        terminal_id: "t1".into(),
        port: 5173,
        url: "https://5173-sandbox.test".into(),
    };
    assert_eq!(next_event(&mut guest_inbox).await, expected);
    assert_eq!(next_event(&mut my_inbox).await, expected);
    match next_event(&mut my_inbox).await {
        ServerEvent::TerminalResponse { terminal_id, data } => {
            assert_eq!(terminal_id, "t1");
            assert!(data.contains("5173"));
        }
        other => panic!("expected terminal output, got {other:?}"),
    }
    assert!(drain(&mut guest_inbox).is_empty());

    call(&h, &me, "terminalData", json!({"id": "t1", "data": "exit\n"})).await;
    assert_eq!(pty.input(), "exit\n");
    call(&h, &me, "closeTerminal", json!({"id": "t1"})).await;
    assert!(pty.killed());
}

#[tokio::test]
async fn terminal_cap_is_per_project() {
    let mut config = DispatcherConfig::default();
    config.session.max_terminals_per_project = 1;
    let h = harness_with(config);
    let conn = owner("p1");
    let _inbox = join(&h, &conn).await;

    assert!(call(&h, &conn, "createTerminal", json!({"id": "a"})).await.success);
    let ack = call(&h, &conn, "createTerminal", json!({"id": "b"})).await;
    assert_eq!(code(&ack), Some("resource_limit"));

    let other = owner("p2");
    let _other_inbox = join(&h, &other).await;
    assert!(call(&h, &other, "createTerminal", json!({"id": "b"})).await.success);
}

#[tokio::test]
async fn sync_flow_guards_against_divergence() {
    let h = harness();
    let conn = owner("p1");
    let _inbox = join(&h, &conn).await;
    h.provider
        .container("p1")
        .put_file("/project/index.html", "<h1>local</h1>");

    let ack = call(&h, &conn, "linkRepo", json!({"repositoryId": "42"})).await;
    assert_eq!(ack.data["repository"], json!("acme/site"));

    // Never synced: the first commit must be confirmed.
    let ack = call(&h, &conn, "createCommit", json!({"message": "first"})).await;
    assert_eq!(code(&ack), Some("conflict"));
    assert_eq!(ack.data["pullStatus"]["needsPull"], json!(true));

    call(&h, &conn, "saveFile", json!({"path": "index.html", "content": "<h1>v2</h1>"})).await;
    let ack = call(
        &h,
        &conn,
        "createCommit",
        json!({"message": "first", "resolved": true}),
    )
    .await;
    assert!(ack.success, "{:?}", ack.error);
    assert_eq!(ack.data["commit"]["fileCount"], json!(1));
    let head = h.remote.head("acme/site", "main").unwrap();
    assert_eq!(ack.data["commit"]["commitSha"], json!(head));

    let ack = call(&h, &conn, "getChangedFiles", json!({})).await;
    assert_eq!(ack.data["changedFiles"]["modified"], json!([]));

    let ack = call(&h, &conn, "checkIfPullNeeded", json!({})).await;
    assert_eq!(ack.data["needsPull"], json!(false));

    h.remote
        .push_external("acme/site", "main", "index.html", "<h1>theirs</h1>");
    let ack = call(&h, &conn, "checkIfPullNeeded", json!({})).await;
    assert_eq!(ack.data["needsPull"], json!(true));

    let ack = call(&h, &conn, "getLatestFiles", json!({})).await;
    assert!(ack.success, "{:?}", ack.error);
    assert_eq!(ack.data["changedFiles"]["modified"], json!(["index.html"]));

    let ack = call(&h, &conn, "createCommit", json!({"message": "again"})).await;
    assert_eq!(code(&ack), Some("conflict"));
}

#[tokio::test(start_paused = true)]
async fn large_commits_outlast_the_request_timeout() {
    let h = harness_with_pipeline(DispatcherConfig::default(), PipelineConfig::default());
    let conn = owner("p1");
    let _inbox = join(&h, &conn).await;
    let container = h.provider.container("p1");
    for i in 0..250 {
        container.put_file(&format!("/project/page{i:03}.html"), "<p>page</p>");
    }
    call(&h, &conn, "linkRepo", json!({"repositoryId": "42"})).await;
    let before = h.remote.commit_count();

    let started = tokio::time::Instant::now();
    let ack = call(
        &h,
        &conn,
        "createCommit",
        json!({"message": "import", "resolved": true}),
    )
    .await;
    assert!(started.elapsed() > DispatcherConfig::default().request_timeout);
    assert!(ack.success, "{:?}", ack.error);
    assert_eq!(ack.data["commit"]["fileCount"], json!(250));
    assert_eq!(h.remote.commit_count(), before + 1);

    let ack = call(&h, &conn, "getLatestFiles", json!({})).await;
    assert!(ack.success, "{:?}", ack.error);
    // The seeded README survives through the base tree.
    assert_eq!(ack.data["files"].as_array().map(Vec::len), Some(251));
}

#[tokio::test(start_paused = true)]
async fn slow_container_start_only_delays_its_own_project() {
    let h = harness();
    h.provider.set_connect_delay("slow", Duration::from_secs(10));

    let mut pending = Vec::new();
    for _ in 0..2 {
        let dispatcher = h.dispatcher.clone();
        let conn = owner("slow");
        pending.push(tokio::spawn(async move {
            let (tx, _rx) = mpsc::unbounded_channel();
            dispatcher.connect(&conn, tx).await
        }));
    }
    tokio::task::yield_now().await;
    assert!(!h.dispatcher.has_session("slow"));

    let fast = owner("fast");
    h.provider
        .container("fast")
        .put_file("/project/index.html", "<h1>fast</h1>");
    let ack = tokio::time::timeout(Duration::from_secs(1), async {
        join(&h, &fast).await;
        call(&h, &fast, "getFileTree", json!({})).await
    })
    .await
    .expect("blocked behind another project's container start");
    assert!(ack.success, "{:?}", ack.error);
    assert!(pending.iter().all(|task| !task.is_finished()));

    for task in pending {
        task.await.unwrap().unwrap();
    }
    assert!(h.dispatcher.has_session("slow"));
    assert_eq!(h.dispatcher.connection_count("slow"), 2);
    // One startup for each project; the second slow tab waited on the first.
    assert_eq!(h.provider.connects(), 2);
}

#[tokio::test]
async fn sync_without_a_link_is_not_found() {
    let h = harness();
    let conn = owner("p1");
    let _inbox = join(&h, &conn).await;
    let ack = call(&h, &conn, "checkIfPullNeeded", json!({})).await;
    assert_eq!(code(&ack), Some("not_found"));
}

#[tokio::test]
async fn deploy_ships_the_project_files() {
    let h = harness();
    let conn = owner("p1");
    let _inbox = join(&h, &conn).await;
    let container = h.provider.container("p1");
    container.put_file("/project/index.html", "<h1>hi</h1>");
    container.put_file("/project/node_modules/left-pad/index.js", "module.exports = 1");

    let ack = call(&h, &conn, "deploy", json!({"name": "blog"})).await;
    assert!(ack.success, "{:?}", ack.error);
    let deploys = h.deployer.deploys();
    assert_eq!(deploys.len(), 1);
    let paths: Vec<_> = deploys[0].1.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["index.html"]);

    let ack = call(&h, &conn, "appExists", json!({"name": "blog"})).await;
    assert_eq!(ack.data["exists"], json!(true));
}

#[tokio::test]
async fn download_names_the_archive_after_the_project() {
    let h = harness();
    let conn = owner("p1");
    let _inbox = join(&h, &conn).await;
    let ack = call(&h, &conn, "downloadArchive", json!({})).await;
    assert!(ack.success, "{:?}", ack.error);
    assert_eq!(ack.data["fileName"], json!("p1.tar.gz"));
    assert!(ack.data["archive"].as_str().is_some_and(|s| !s.is_empty()));
}

#[tokio::test(start_paused = true)]
async fn idle_sessions_are_torn_down_after_the_grace_period() {
    let h = harness();
    let grace = Duration::from_secs(DispatcherConfig::default().session.teardown_grace_secs);
    let conn = owner("p1");
    let _inbox = join(&h, &conn).await;
    call(&h, &conn, "createTerminal", json!({"id": "t1"})).await;
    let container = h.provider.container("p1");
    assert!(!container.watched_dirs().is_empty());

    h.dispatcher.disconnect(&conn);
    assert!(h.dispatcher.has_session("p1"));

    tokio::time::sleep(grace + Duration::from_secs(1)).await;
    assert!(!h.dispatcher.has_session("p1"));
    assert!(container.terminals()[0].killed());
    assert!(container.watched_dirs().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reconnecting_within_the_grace_period_keeps_the_session() {
    let h = harness();
    let grace = Duration::from_secs(DispatcherConfig::default().session.teardown_grace_secs);
    let conn = owner("p1");
    let _inbox = join(&h, &conn).await;
    h.dispatcher.disconnect(&conn);

    tokio::time::sleep(grace / 2).await;
    let again = owner("p1");
    let _inbox = join(&h, &again).await;

    tokio::time::sleep(grace * 2).await;
    assert!(h.dispatcher.has_session("p1"));
    assert_eq!(h.provider.connects(), 1);
}

#[tokio::test(start_paused = true)]
async fn timed_out_requests_still_finish() {
    let config = DispatcherConfig {
        request_timeout: Duration::from_millis(100),
        ..DispatcherConfig::default()
    };
    let h = harness_with(config);
    let conn = owner("p1");
    let _inbox = join(&h, &conn).await;
    let container = h.provider.container("p1");
    container.set_write_delay(Duration::from_millis(500));

    let ack = call(&h, &conn, "saveFile", json!({"path": "slow.txt", "content": "late"})).await;
    assert_eq!(code(&ack), Some("transient"));
    assert!(ack.error.unwrap().contains("saveFile"));

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(container.file("/project/slow.txt").as_deref(), Some("late"));
}

#[tokio::test]
async fn shutdown_disconnects_clients() {
    let h = harness();
    let conn = owner("p1");
    let mut inbox = join(&h, &conn).await;
    drain(&mut inbox);

    h.dispatcher.shutdown();
    assert!(!h.dispatcher.has_session("p1"));
    assert!(matches!(
        drain(&mut inbox).as_slice(),
        [ServerEvent::Disconnect { .. }]
    ));
}
