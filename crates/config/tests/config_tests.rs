#![forbid(unsafe_code)]

use rampart_config::ConfigManager;
use std::fs;
use std::io::Write;
use tempfile::tempdir;

#[test]
fn records_and_detects_hash_changes() {
    let dir = tempdir().unwrap();
    let mgr = ConfigManager::new(dir.path().to_path_buf()).unwrap();
    fs::write(&mgr.paths.pool_rules, b"table badhosts 0\n").unwrap();
    let snap1 = mgr.snapshot();
    assert!(!snap1.tampered);
    mgr.record_version().unwrap();

    // mutate the file behind the manager's back
    let mut f = fs::OpenOptions::new()
        .append(true)
        .open(&mgr.paths.pool_rules)
        .unwrap();
    writeln!(f, "node badhosts 0 10.0.0.0/24 ops 0").unwrap();

    let snap2 = mgr.snapshot();
    assert!(snap2.tampered);
}

#[test]
fn rollback_restores_previous_files() {
    let dir = tempdir().unwrap();
    let mgr = ConfigManager::new_with_backups(dir.path().to_path_buf(), 3).unwrap();
    fs::write(&mgr.paths.pool_rules, b"v1").unwrap();
    mgr.record_version().unwrap();

    fs::write(&mgr.paths.pool_rules, b"v2").unwrap();
    mgr.record_version().unwrap();
    let snap_before = mgr.snapshot();
    assert_eq!(snap_before.version, 2);

    let snap_after = mgr.rollback().unwrap();
    assert_eq!(snap_after.version, 1);
    let contents = fs::read_to_string(&mgr.paths.pool_rules).unwrap();
    assert_eq!(contents, "v1");
}

#[test]
fn both_rule_files_are_tracked() {
    let dir = tempdir().unwrap();
    let mgr = ConfigManager::new(dir.path().to_path_buf()).unwrap();
    fs::write(&mgr.paths.pool_rules, b"pools").unwrap();
    fs::write(&mgr.paths.filter_rules, b"filters").unwrap();
    mgr.record_version().unwrap();

    fs::write(&mgr.paths.filter_rules, b"filters changed").unwrap();
    assert!(mgr.snapshot().tampered);
}
