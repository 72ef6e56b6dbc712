use agent_tether::supervisor::executable::{platform_executable_name, resolve};
use agent_tether::AppError;

#[test]
fn platform_name_matches_target() {
    let name = platform_executable_name();
    if cfg!(windows) {
        assert_eq!(name, "backend-win.exe");
    } else if cfg!(target_os = "macos") {
        assert_eq!(name, "backend-darwin");
    } else {
        assert_eq!(name, "backend-linux");
    }
}

#[test]
fn resolves_platform_binary_in_resource_dir() {
    let dir = tempfile::tempdir().expect("tempdir");
    let exe = dir.path().join(platform_executable_name());
    std::fs::write(&exe, b"").expect("write exe");

    assert_eq!(resolve(dir.path(), None).expect("found"), exe);
}

#[test]
fn explicit_override_wins() {
    let dir = tempfile::tempdir().expect("tempdir");
    let custom = dir.path().join("my-backend");
    std::fs::write(&custom, b"").expect("write exe");

    assert_eq!(resolve(dir.path(), Some(&custom)).expect("found"), custom);
}

#[test]
fn missing_binary_names_the_path_tried() {
    let dir = tempfile::tempdir().expect("tempdir");
    let err = resolve(dir.path(), None).expect_err("nothing there");

    match err {
        AppError::ExecutableNotFound(path) => {
            assert!(path.ends_with(platform_executable_name()));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn directory_is_not_an_executable() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir(dir.path().join(platform_executable_name())).expect("mkdir");

    assert!(matches!(
        resolve(dir.path(), None),
        Err(AppError::ExecutableNotFound(_))
    ));
}
