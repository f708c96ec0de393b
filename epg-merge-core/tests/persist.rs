use std::fs;

use epg_merge_core::document::{Document, Element};
use epg_merge_core::persist::{ensure_writable, save, SaveError};

fn sample() -> Document {
    let mut doc = Document::new("tv");
    doc.root = doc.root.with_child(
        Element::new("channel")
            .with_attribute("id", "news")
            .with_child(Element::new("display-name").with_text("News")),
    );
    doc
}

#[test]
fn save_creates_missing_parent_directories() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("www").join("nested").join("epg.xml");

    let saved = save(&sample(), &path).expect("save succeeds");

    assert_eq!(saved.path, path);
    let text = fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
    assert!(text.contains("<channel id=\"news\">"));
    assert_eq!(saved.bytes, text.len());
}

#[test]
fn save_replaces_existing_content() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("epg.xml");
    fs::write(&path, "stale").unwrap();

    save(&sample(), &path).unwrap();

    let reparsed = Document::parse(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(reparsed, sample());
}

#[test]
fn save_into_a_path_below_a_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let blocker = dir.path().join("blocker");
    fs::write(&blocker, "file").unwrap();

    let result = save(&sample(), &blocker.join("epg.xml"));

    assert!(matches!(result, Err(SaveError::CreateDir { .. })));
}

#[cfg(unix)]
mod permissions {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn mode(path: &std::path::Path) -> u32 {
        fs::metadata(path).unwrap().permissions().mode() & 0o777
    }

    #[test]
    fn read_only_output_file_is_made_writable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epg.xml");
        fs::write(&path, "old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o444)).unwrap();

        save(&sample(), &path).expect("save heals the file mode");

        assert_eq!(mode(&path), 0o644);
        assert!(fs::read_to_string(&path).unwrap().contains("news"));
    }

    #[test]
    fn ensure_writable_restores_the_owner_write_bit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("epg.xml");
        fs::write(&path, "old").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o444)).unwrap();

        ensure_writable(&path).expect("permissions are updated");

        assert_ne!(mode(&path) & 0o200, 0);
        assert_eq!(fs::read_to_string(&path).unwrap(), "old");
    }

    #[test]
    fn read_only_output_directory_is_made_writable() {
        let dir = tempfile::tempdir().unwrap();
        let www = dir.path().join("www");
        fs::create_dir(&www).unwrap();
        fs::set_permissions(&www, fs::Permissions::from_mode(0o555)).unwrap();

        save(&sample(), &www.join("epg.xml")).expect("save heals the directory mode");

        assert_eq!(mode(&www) & 0o700, 0o700);
        assert!(www.join("epg.xml").exists());
    }
}
