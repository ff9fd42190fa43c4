use std::time::Duration;

use tokio::sync::mpsc;

use devcell_runtime_config::ContainerSettings;
use devcell_session::{ContainerProvider, FileTreeMirror, FsEventKind, LocalContainerProvider};

fn settings(root: &std::path::Path) -> ContainerSettings {
    ContainerSettings {
        workspaces_root: root.to_string_lossy().into_owned(),
        ..ContainerSettings::default()
    }
}

#[tokio::test]
async fn files_round_trip_through_the_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let provider = LocalContainerProvider::new(settings(dir.path()));
    let container = provider.connect("p1").await.unwrap();
    assert_eq!(container.project_root(), "/project");
    assert!(dir.path().join("p1/project").is_dir());

    container
        .write_file("/project/src/main.rs", b"fn main() {}\n")
        .await
        .unwrap();
    container
        .write_file("/project/node_modules/x/index.js", b"")
        .await
        .unwrap();
    assert_eq!(
        std::fs::read_to_string(dir.path().join("p1/project/src/main.rs")).unwrap(),
        "fn main() {}\n"
    );

    let mirror = FileTreeMirror::new(container.clone(), &settings(dir.path()), 1024);
    let files = mirror.read_all_files().await.unwrap();
    let paths: Vec<_> = files.iter().map(|f| f.path.as_str()).collect();
    assert_eq!(paths, vec!["src/main.rs"]);

    let (to, _) = mirror
        .rename_file("/project/src/main.rs", "lib.rs")
        .await
        .unwrap();
    assert_eq!(to, "/project/src/lib.rs");
    assert!(!dir.path().join("p1/project/src/main.rs").exists());

    mirror.delete_folder("/project/src").await.unwrap();
    assert!(!dir.path().join("p1/project/src").exists());
}

#[tokio::test]
async fn workspace_escapes_are_refused() {
    let dir = tempfile::tempdir().unwrap();
    let provider = LocalContainerProvider::new(settings(dir.path()));
    assert!(provider.connect("../elsewhere").await.is_err());

    let container = provider.connect("p1").await.unwrap();
    let err = container.read_file("/project/../../secret").await.unwrap_err();
    assert_eq!(err.kind().code(), "permission_denied");
}

#[tokio::test]
async fn watcher_reports_new_files() {
    let dir = tempfile::tempdir().unwrap();
    let provider = LocalContainerProvider::new(settings(dir.path()));
    let container = provider.connect("p1").await.unwrap();

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _handle = container.watch_dir("/project", tx).await.unwrap();
    std::fs::write(dir.path().join("p1/project/new.txt"), "hi").unwrap();

    let event = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("watch channel closed");
            if event.kind == FsEventKind::Created {
                return event;
            }
        }
    })
    .await
    .expect("no create event");
    assert_eq!(event.path, "/project/new.txt");
}
