use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use agent_tether::config_watcher::ConfigChange;
use agent_tether::controller::listener::spawn_config_listener;
use agent_tether::controller::{ConfigChangeController, Notice};
use agent_tether::supervisor::{ProcessState, ProcessSupervisor};

use super::test_helpers::{external_config, local_config, MockBackend, StaticProbe};

async fn next_notice(notices: &mut mpsc::UnboundedReceiver<Notice>) -> Notice {
    tokio::time::timeout(Duration::from_secs(5), notices.recv())
        .await
        .expect("notice within timeout")
        .expect("controller alive")
}

#[cfg(unix)]
#[tokio::test]
async fn burst_of_changes_collapses_into_one_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = super::test_helpers::write_script(dir.path(), "backend", "exec sleep 30");
    let supervisor = ProcessSupervisor::with_probe(
        Arc::new(local_config(dir.path(), Some(&script), 18_100)),
        Arc::new(StaticProbe(true)),
    );
    let (controller, mut notices, task) = ConfigChangeController::spawn(supervisor);

    let url = controller.start().await.expect("backend starts");
    assert_eq!(url, "http://127.0.0.1:18100");
    assert_eq!(
        next_notice(&mut notices).await,
        Notice::Progress("starting backend".into())
    );
    assert_eq!(
        next_notice(&mut notices).await,
        Notice::Info("backend ready at http://127.0.0.1:18100".into())
    );

    let mut transitions = controller.observer().subscribe();
    assert!(!controller.config_changed(Arc::new(local_config(dir.path(), Some(&script), 18_101))));
    assert!(controller.config_changed(Arc::new(local_config(dir.path(), Some(&script), 18_102))));

    assert_eq!(
        next_notice(&mut notices).await,
        Notice::Progress("restarting backend".into())
    );
    assert_eq!(
        next_notice(&mut notices).await,
        Notice::Info("backend restarted".into())
    );

    let mut seen = Vec::new();
    while let Ok(state) = transitions.try_recv() {
        seen.push(state);
    }
    assert_eq!(
        seen,
        vec![
            ProcessState::Stopping,
            ProcessState::Stopped,
            ProcessState::Starting,
            ProcessState::Healthy,
        ]
    );

    let status = controller.status();
    assert_eq!(status.state, ProcessState::Healthy);
    assert_eq!(status.url, "http://127.0.0.1:18102");
    assert!(!status.external);
    assert_eq!(*controller.url_receiver().borrow(), "http://127.0.0.1:18102");

    // No second cycle follows.
    assert!(
        tokio::time::timeout(Duration::from_millis(300), notices.recv())
            .await
            .is_err()
    );

    controller.shutdown().await;
    task.await.expect("controller task");
    assert_eq!(controller.observer().state(), ProcessState::Stopped);
}

#[cfg(unix)]
#[tokio::test]
async fn manual_restart_reuses_current_configuration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let script = super::test_helpers::write_script(dir.path(), "backend", "exec sleep 30");
    let supervisor = ProcessSupervisor::with_probe(
        Arc::new(local_config(dir.path(), Some(&script), 18_103)),
        Arc::new(StaticProbe(true)),
    );
    let (controller, mut notices, task) = ConfigChangeController::spawn(supervisor);
    controller.start().await.expect("backend starts");
    next_notice(&mut notices).await;
    next_notice(&mut notices).await;

    assert!(!controller.request_restart());
    next_notice(&mut notices).await;
    assert_eq!(
        next_notice(&mut notices).await,
        Notice::Info("backend restarted".into())
    );
    assert_eq!(controller.status().url, "http://127.0.0.1:18103");

    controller.shutdown().await;
    task.await.expect("controller task");
}

#[tokio::test]
async fn start_failure_carries_a_hint() {
    let dir = tempfile::tempdir().expect("tempdir");
    let supervisor = ProcessSupervisor::with_probe(
        Arc::new(local_config(dir.path(), None, 18_104)),
        Arc::new(StaticProbe(true)),
    );
    let (controller, mut notices, task) = ConfigChangeController::spawn(supervisor);

    let err = controller.start().await.expect_err("no executable");
    assert!(err.user_hint().is_some());

    next_notice(&mut notices).await;
    match next_notice(&mut notices).await {
        Notice::Error(msg) => {
            assert!(msg.starts_with("backend failed to start: executable not found"), "{msg}");
            assert!(msg.contains("\nhint: "), "{msg}");
        }
        other => panic!("expected error notice, got {other:?}"),
    }
    assert_eq!(controller.status().state, ProcessState::Stopped);

    controller.shutdown().await;
    task.await.expect("controller task");
}

#[cfg(unix)]
#[tokio::test]
async fn restart_picks_up_a_corrected_resource_dir() {
    let empty = tempfile::tempdir().expect("tempdir");
    let bundled = tempfile::tempdir().expect("tempdir");
    super::test_helpers::write_script(
        bundled.path(),
        agent_tether::supervisor::executable::platform_executable_name(),
        "exec sleep 30",
    );

    let supervisor = ProcessSupervisor::with_probe(
        Arc::new(local_config(empty.path(), None, 18_105)),
        Arc::new(StaticProbe(true)),
    );
    let (controller, mut notices, task) = ConfigChangeController::spawn(supervisor);

    controller.start().await.expect_err("nothing in the resource dir");
    next_notice(&mut notices).await;
    assert!(matches!(next_notice(&mut notices).await, Notice::Error(_)));

    controller.config_changed(Arc::new(local_config(bundled.path(), None, 18_105)));
    assert_eq!(
        next_notice(&mut notices).await,
        Notice::Progress("restarting backend".into())
    );
    assert_eq!(
        next_notice(&mut notices).await,
        Notice::Info("backend restarted".into())
    );
    assert_eq!(controller.status().state, ProcessState::Healthy);

    controller.shutdown().await;
    task.await.expect("controller task");
    assert_eq!(controller.observer().state(), ProcessState::Stopped);
}

#[tokio::test]
async fn external_backend_is_hot_reloaded() {
    let mock = MockBackend::start().await;
    let supervisor = ProcessSupervisor::with_probe(
        Arc::new(external_config(&mock.url, "m1")),
        Arc::new(StaticProbe(false)),
    );
    let (controller, mut notices, task) = ConfigChangeController::spawn(supervisor);

    assert_eq!(controller.start().await.expect("external start"), mock.url);
    assert!(matches!(next_notice(&mut notices).await, Notice::Info(_)));

    controller.config_changed(Arc::new(external_config(&mock.url, "m2")));
    assert_eq!(
        next_notice(&mut notices).await,
        Notice::Info("external backend reloaded (model m2)".into())
    );

    let reloads = mock.state.reload_configs();
    assert_eq!(reloads.len(), 1);
    assert_eq!(reloads[0]["LITELLM_MODEL"], "m2");
    assert!(reloads[0].get("LITELLM_API_KEY").is_none());

    let status = controller.status();
    assert!(status.external);
    assert_eq!(status.state, ProcessState::Stopped);

    controller.reload_agent().await.expect("agent reload");
    assert_eq!(*mock.state.reloads.lock().unwrap(), 1);

    controller.shutdown().await;
    task.await.expect("controller task");
}

#[tokio::test]
async fn unreachable_external_backend_warns() {
    let supervisor = ProcessSupervisor::with_probe(
        Arc::new(external_config("http://127.0.0.1:9", "m1")),
        Arc::new(StaticProbe(false)),
    );
    let (controller, mut notices, task) = ConfigChangeController::spawn(supervisor);
    controller.start().await.expect("external start");
    next_notice(&mut notices).await;

    controller.request_restart();
    match next_notice(&mut notices).await {
        Notice::Warning(msg) => assert!(msg.starts_with("config reload:"), "{msg}"),
        other => panic!("expected warning, got {other:?}"),
    }

    controller.shutdown().await;
    task.await.expect("controller task");
}

#[tokio::test]
async fn listener_filters_and_reloads_changes() {
    let mock = MockBackend::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("config.toml");
    let write_config = |model: &str| {
        std::fs::write(
            &config_path,
            format!(
                "[backend]\nuse_external_backend = true\nexternal_backend_url = \"{}\"\nmodel = \"{model}\"\n",
                mock.url
            ),
        )
        .expect("write config");
    };
    write_config("m1");

    let supervisor = ProcessSupervisor::with_probe(
        Arc::new(external_config(&mock.url, "m1")),
        Arc::new(StaticProbe(false)),
    );
    let (controller, mut notices, task) = ConfigChangeController::spawn(supervisor);
    controller.start().await.expect("external start");
    next_notice(&mut notices).await;

    let (change_tx, change_rx) = mpsc::unbounded_channel();
    let ct = CancellationToken::new();
    let listener = spawn_config_listener(
        config_path.clone(),
        None,
        change_rx,
        controller.clone(),
        ct.clone(),
    );

    // Outside the backend namespace: ignored.
    change_tx.send(ConfigChange::of(["ipc_name"])).expect("listener alive");

    write_config("m3");
    change_tx.send(ConfigChange::of(["backend"])).expect("listener alive");
    assert_eq!(
        next_notice(&mut notices).await,
        Notice::Info("external backend reloaded (model m3)".into())
    );
    assert_eq!(mock.state.reload_configs().len(), 1);

    std::fs::write(&config_path, "[backend\n").expect("write broken config");
    change_tx.send(ConfigChange::of(["backend"])).expect("listener alive");
    match next_notice(&mut notices).await {
        Notice::Warning(msg) => assert!(msg.starts_with("configuration change ignored"), "{msg}"),
        other => panic!("expected warning, got {other:?}"),
    }

    ct.cancel();
    listener.await.expect("listener task");
    controller.shutdown().await;
    task.await.expect("controller task");
}
