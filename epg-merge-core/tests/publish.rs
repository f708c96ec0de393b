use std::fs;
use std::path::Path;
use std::process::Command;

use epg_merge_core::contract::{PublishError, PublishOutcome, Publisher};
use epg_merge_core::publish::GitPublisher;

fn git(dir: &Path, args: &[&str]) -> bool {
    Command::new("git")
        .arg("-C")
        .arg(dir)
        .args(args)
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

/// A working copy on `main` with a local identity, plus a bare remote.
fn repo_with_remote(root: &Path) -> (std::path::PathBuf, std::path::PathBuf) {
    let remote = root.join("remote.git");
    let work = root.join("work");
    fs::create_dir_all(&remote).unwrap();
    fs::create_dir_all(&work).unwrap();
    assert!(git(&remote, &["init", "--bare", "-q"]));
    assert!(git(&work, &["init", "-q"]));
    assert!(git(&work, &["symbolic-ref", "HEAD", "refs/heads/main"]));
    assert!(git(&work, &["config", "user.email", "epg@example.com"]));
    assert!(git(&work, &["config", "user.name", "EPG Merge"]));
    assert!(git(&work, &["config", "commit.gpgsign", "false"]));
    assert!(git(
        &work,
        &["remote", "add", "origin", remote.to_str().unwrap()]
    ));
    (work, remote)
}

#[tokio::test]
async fn commits_and_pushes_then_reports_nothing_on_rerun() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let (work, remote) = repo_with_remote(root.path());
    let www = work.join("www");
    fs::create_dir(&www).unwrap();
    let guide = www.join("epg.xml");
    fs::write(&guide, "<tv/>\n").unwrap();

    let publisher = GitPublisher::new(&work).with_paths(vec!["www".into()]);

    let first = publisher
        .publish(&guide, "Feb 06, 2025 01:30:00 PM")
        .await
        .expect("first publish");
    assert_eq!(first, PublishOutcome::Published);

    let log = Command::new("git")
        .arg("-C")
        .arg(&remote)
        .args(["log", "-1", "--format=%s", "main"])
        .output()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&log.stdout).trim(),
        "Auto commit at Feb 06, 2025 01:30:00 PM"
    );

    let second = publisher.publish(&guide, "later").await.unwrap();
    assert_eq!(second, PublishOutcome::NothingToPublish);
}

#[tokio::test]
async fn failed_push_is_a_command_error() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let (work, _remote) = repo_with_remote(root.path());
    let guide = work.join("epg.xml");
    fs::write(&guide, "<tv/>\n").unwrap();

    let publisher = GitPublisher::new(&work).with_remote("nowhere", "main");

    match publisher.publish(&guide, "label").await {
        Err(PublishError::Command { command, .. }) => {
            assert_eq!(command, "git push --force-with-lease nowhere main")
        }
        other => panic!("expected push failure, got {other:?}"),
    }
}

#[tokio::test]
async fn rebases_onto_commits_pushed_from_another_clone() {
    if !git_available() {
        eprintln!("git not installed, skipping");
        return;
    }
    let root = tempfile::tempdir().unwrap();
    let (work, remote) = repo_with_remote(root.path());
    let www = work.join("www");
    fs::create_dir(&www).unwrap();
    let guide = www.join("epg.xml");
    fs::write(&guide, "<tv/>\n").unwrap();

    let publisher = GitPublisher::new(&work).with_paths(vec!["www".into()]);
    publisher.publish(&guide, "first").await.expect("first publish");

    let other = root.path().join("other");
    assert!(git(
        root.path(),
        &["clone", "-q", "-b", "main", remote.to_str().unwrap(), "other"]
    ));
    assert!(git(&other, &["config", "user.email", "other@example.com"]));
    assert!(git(&other, &["config", "user.name", "Other Clone"]));
    assert!(git(&other, &["config", "commit.gpgsign", "false"]));
    fs::write(other.join("README.md"), "guide mirror\n").unwrap();
    assert!(git(&other, &["add", "README.md"]));
    assert!(git(&other, &["commit", "-q", "-m", "Edit from elsewhere"]));
    assert!(git(&other, &["push", "-q", "origin", "main"]));

    fs::write(&guide, "<tv><channel id=\"a\"/></tv>\n").unwrap();
    let outcome = publisher
        .publish(&guide, "second")
        .await
        .expect("publish after the remote moved");
    assert_eq!(outcome, PublishOutcome::Published);

    let log = Command::new("git")
        .arg("-C")
        .arg(&remote)
        .args(["log", "--format=%s", "main"])
        .output()
        .unwrap();
    let subjects: Vec<String> = String::from_utf8_lossy(&log.stdout)
        .lines()
        .map(str::to_string)
        .collect();
    assert_eq!(
        subjects,
        vec![
            "Auto commit at second",
            "Edit from elsewhere",
            "Auto commit at first"
        ]
    );
    assert!(work.join("README.md").exists());
}
