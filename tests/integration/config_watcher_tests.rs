use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;

use agent_tether::config_watcher::{ConfigChange, ConfigWatcher};

/// Replace the file in one rename so the watcher never sees it half-written.
fn replace(path: &Path, raw: &str) {
    let staged = path.with_extension("toml.tmp");
    std::fs::write(&staged, raw).expect("write staged config");
    std::fs::rename(&staged, path).expect("rename config");
}

async fn next_change(rx: &mut mpsc::UnboundedReceiver<ConfigChange>) -> ConfigChange {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("change within timeout")
        .expect("watcher alive")
}

#[tokio::test]
async fn edit_reports_changed_sections() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "ipc_name = \"a\"\n[backend]\nport = 8000\n").expect("write config");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let watcher = ConfigWatcher::new(&path, tx).expect("watcher");
    assert_eq!(watcher.path(), path);
    tokio::time::sleep(Duration::from_millis(100)).await;

    replace(&path, "ipc_name = \"a\"\n[backend]\nport = 8001\n");
    let change = next_change(&mut rx).await;
    assert_eq!(change, ConfigChange::of(["backend"]));
    assert!(change.affects_backend());
}

#[tokio::test]
async fn unrelated_files_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    std::fs::write(&path, "[backend]\nport = 8000\n").expect("write config");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watcher = ConfigWatcher::new(&path, tx).expect("watcher");
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::fs::write(dir.path().join("other.toml"), "[backend]\nport = 1\n").expect("write other");
    assert!(
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .is_err()
    );
}

#[tokio::test]
async fn touch_without_content_change_is_silent() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("config.toml");
    let raw = "[backend]\nport = 8000\n";
    std::fs::write(&path, raw).expect("write config");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _watcher = ConfigWatcher::new(&path, tx).expect("watcher");
    tokio::time::sleep(Duration::from_millis(100)).await;

    replace(&path, raw);
    assert!(
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .is_err()
    );
}
