use partmig_metastore::app_paths::{AppPaths, DATA_DIR_ENV};
use serial_test::serial;

#[test]
#[serial]
fn test_env_override_redirects_root() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("override");
    unsafe {
        std::env::set_var(DATA_DIR_ENV, &root);
    }
    let paths = AppPaths::resolve().unwrap();
    unsafe {
        std::env::remove_var(DATA_DIR_ENV);
    }
    assert_eq!(paths.root(), root.as_path());
    assert_eq!(paths.db_path(), root.join("migration.db"));
    assert_eq!(paths.vault_key_path(), root.join("vault.key"));
    assert!(paths.log_dir().is_dir(), "log directory must be created");
}

#[test]
#[serial]
fn test_explicit_root_creates_tree() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("nested").join("data");
    let paths = AppPaths::at(root.clone()).unwrap();
    assert!(root.is_dir());
    assert!(paths.log_dir().is_dir());
}
