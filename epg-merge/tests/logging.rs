use serial_test::serial;
use std::env;
use std::fs;

/// Installs the global subscriber, so this binary holds exactly one test.
#[test]
#[serial]
fn log_file_is_truncated_and_written_without_ansi() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("logs").join("merge_epg.log");
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, "stale line from the previous run\n").unwrap();

    env::set_var("RUST_LOG", "info");
    epg_merge::logging::init(Some(&path), true).expect("first init succeeds");

    tracing::info!(source_index = 1, "[MERGE] written by the logging test");
    tracing::debug!("filtered out at info");

    let log = fs::read_to_string(&path).unwrap();
    assert!(!log.contains("stale line"));
    assert!(log.contains("[MERGE] written by the logging test"));
    assert!(log.contains("source_index=1"));
    assert!(!log.contains("filtered out"));
    assert!(!log.contains('\u{1b}'));

    assert!(
        epg_merge::logging::init(None, true).is_err(),
        "a second global subscriber must be rejected"
    );
}
