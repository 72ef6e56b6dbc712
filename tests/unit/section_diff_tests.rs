use agent_tether::config_watcher::{changed_sections, ConfigChange};

fn table(raw: &str) -> toml::Table {
    toml::from_str(raw).expect("valid toml")
}

#[test]
fn identical_tables_have_no_changes() {
    let a = table("ipc_name = \"x\"\n[backend]\nport = 1\n");
    assert!(changed_sections(&a, &a.clone()).is_empty());
}

#[test]
fn nested_change_reports_top_level_key() {
    let old = table("[backend]\nport = 1\n[backend.timeouts]\nhealth_seconds = 30\n");
    let new = table("[backend]\nport = 1\n[backend.timeouts]\nhealth_seconds = 10\n");

    let changed = changed_sections(&old, &new);
    assert_eq!(changed.into_iter().collect::<Vec<_>>(), vec!["backend".to_owned()]);
}

#[test]
fn added_and_removed_keys_are_reported() {
    let old = table("ipc_name = \"x\"\n[backend]\n");
    let new = table("workspace_dir = \"/w\"\n[backend]\n");

    let changed = changed_sections(&old, &new);
    assert!(changed.contains("ipc_name"));
    assert!(changed.contains("workspace_dir"));
    assert!(!changed.contains("backend"));
}

#[test]
fn backend_scope_includes_workspace_dir() {
    assert!(ConfigChange::of(["backend"]).affects_backend());
    assert!(ConfigChange::of(["workspace_dir"]).affects_backend());
    assert!(!ConfigChange::of(["ipc_name", "ui"]).affects_backend());
    assert!(!ConfigChange::default().affects_backend());
}
