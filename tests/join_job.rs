//! End-to-end tests for the key join job

mod helpers;

use std::fs;

use helpers::{listing, read_lines, test_config, write_lines};
use kvrecon::join::{IndexLayout, JoinPaths};
use kvrecon::pipeline::{run_join, run_join_pair};
use kvrecon::{Config, ReconError, Stage};

#[test]
fn test_join_example() {
    let dir = tempfile::tempdir().unwrap();
    let left = write_lines(&dir.path().join("left.txt"), &["1:AAA", "2:BBB"]);
    let right = write_lines(&dir.path().join("right.txt"), &["aaa:pass1", "ccc:pass2"]);
    let out = dir.path().join("out");

    let stats = run_join(&left, &right, &out, &test_config()).unwrap();

    assert_eq!(read_lines(&out.join("matched.txt")), vec!["1:AAA:pass1"]);
    assert_eq!(read_lines(&out.join("unmatched_left.txt")), vec!["2:BBB"]);
    assert_eq!(read_lines(&out.join("unmatched_right.txt")), vec!["CCC:pass2"]);
    assert_eq!(fs::read(out.join("errors.txt")).unwrap(), b"");

    assert_eq!(stats.stage, Stage::Done);
    assert_eq!(stats.processed, 2);
    assert_eq!(stats.matched, 1);
    assert_eq!(stats.unmatched_left, 1);
    assert_eq!(stats.unmatched_right, 1);
    assert_eq!(stats.index_entries, 2);
    assert!(stats.left_balanced());
}

#[test]
fn test_keys_fold_case_and_whitespace() {
    let dir = tempfile::tempdir().unwrap();
    let left = write_lines(
        &dir.path().join("left.txt"),
        &["10: DeadBeef ", "11:cafe", "12:CAFE"],
    );
    let right = write_lines(
        &dir.path().join("right.txt"),
        &["deadbeef:hunter2", "Cafe:old", "CAFE:new:with:colons"],
    );
    let out = dir.path().join("out");

    let stats = run_join(&left, &right, &out, &test_config()).unwrap();

    assert_eq!(
        read_lines(&out.join("matched.txt")),
        vec![
            "10:DEADBEEF:hunter2",
            "11:CAFE:new:with:colons",
            "12:CAFE:new:with:colons"
        ]
    );
    assert_eq!(stats.index_lines, 3);
    assert_eq!(stats.index_entries, 2);
    assert_eq!(read_lines(&out.join("unmatched_right.txt")), Vec::<String>::new());
}

#[test]
fn test_unmatched_right_in_first_seen_order() {
    let dir = tempfile::tempdir().unwrap();
    let left = write_lines(&dir.path().join("left.txt"), &["1:b"]);
    let right = write_lines(
        &dir.path().join("right.txt"),
        &["z:1", "b:2", "a:3", "m:4", "Z:5"],
    );
    let out = dir.path().join("out");

    run_join(&left, &right, &out, &test_config()).unwrap();

    assert_eq!(
        read_lines(&out.join("unmatched_right.txt")),
        vec!["Z:5", "A:3", "M:4"]
    );
}

#[test]
fn test_bad_lines_from_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let left = dir.path().join("left.txt");
    fs::write(&left, b"1:aaa\nno-colon\n3:\n4:\xff\n5:bbb\n").unwrap();
    let right = write_lines(&dir.path().join("right.txt"), &["aaa:x", "junk", ":nokey"]);
    let out = dir.path().join("out");

    let stats = run_join(&left, &right, &out, &test_config()).unwrap();

    assert_eq!(stats.processed, 5);
    assert_eq!(stats.errored, 3);
    assert_eq!(stats.index_errored, 2);
    assert!(stats.left_balanced());

    let errors = fs::read(out.join("errors.txt")).unwrap();
    let entries: Vec<&[u8]> = errors.split(|&b| b == b'\n').filter(|l| !l.is_empty()).collect();
    assert_eq!(entries.len(), 5);
    assert!(entries[0].starts_with(b"right:2\t"));
    assert!(entries[1].starts_with(b"right:3\t"));
    assert!(entries[2].starts_with(b"left:2\t"));
    assert!(entries[3].starts_with(b"left:3\t"));
    assert!(entries[4].starts_with(b"left:4\t"));
    assert!(entries[4].ends_with(b"4:\xff"));
}

#[test]
fn test_left_only_writes_no_right_file() {
    let dir = tempfile::tempdir().unwrap();
    let left = write_lines(&dir.path().join("left.txt"), &["1:a", "2:b"]);
    let right = write_lines(&dir.path().join("right.txt"), &["a:1", "c:3"]);
    let out = dir.path().join("out");
    let config = Config {
        reverse_sweep: false,
        ..test_config()
    };

    let stats = run_join(&left, &right, &out, &config).unwrap();

    assert_eq!(stats.unmatched_right, 0);
    assert_eq!(
        listing(&out),
        vec!["errors.txt", "matched.txt", "unmatched_left.txt"]
    );
}

#[test]
fn test_id_key_layout_on_right() {
    let dir = tempfile::tempdir().unwrap();
    let left = write_lines(&dir.path().join("left.txt"), &["1:aaa", "2:bbb"]);
    let right = write_lines(&dir.path().join("right.txt"), &["900:AAA"]);
    let out = dir.path().join("out");
    let config = Config {
        index_layout: IndexLayout::IdKey,
        ..test_config()
    };

    run_join(&left, &right, &out, &config).unwrap();

    assert_eq!(read_lines(&out.join("matched.txt")), vec!["1:AAA:900"]);
}

#[test]
fn test_index_over_budget_commits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let left = write_lines(&dir.path().join("left.txt"), &["1:a"]);
    let right = write_lines(&dir.path().join("right.txt"), &["a:1", "b:2", "c:3"]);
    let out = dir.path().join("out");
    let config = Config {
        index_budget: 8,
        ..test_config()
    };

    let aborted = run_join(&left, &right, &out, &config).unwrap_err();

    assert!(matches!(aborted.error, ReconError::Resource { budget: 8, .. }));
    assert_eq!(aborted.exit_code(), 2);
    assert_eq!(aborted.stats.stage, Stage::BuildingIndex);
    assert_eq!(aborted.stats.processed, 0);
    assert!(listing(&out).is_empty());
}

#[test]
fn test_missing_right_creates_no_outputs() {
    let dir = tempfile::tempdir().unwrap();
    let left = write_lines(&dir.path().join("left.txt"), &["1:a"]);
    let out = dir.path().join("out");

    let aborted = run_join(&left, &dir.path().join("absent.txt"), &out, &test_config()).unwrap_err();

    assert!(matches!(aborted.error, ReconError::Io { op: "open", .. }));
    assert!(!out.exists());
}

#[test]
fn test_rerun_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let left_lines: Vec<String> = (0..300).map(|i| format!("{}:k{}", i, (i * 7) % 101)).collect();
    let right_lines: Vec<String> = (0..150).map(|i| format!("K{}:v{}", (i * 3) % 211, i)).collect();
    let left_refs: Vec<&str> = left_lines.iter().map(String::as_str).collect();
    let right_refs: Vec<&str> = right_lines.iter().map(String::as_str).collect();
    let left = write_lines(&dir.path().join("left.txt"), &left_refs);
    let right = write_lines(&dir.path().join("right.txt"), &right_refs);

    let first = JoinPaths::in_dir(&dir.path().join("a"));
    let second = JoinPaths::in_dir(&dir.path().join("b"));
    run_join_pair(&left, &right, &first, &test_config()).unwrap();
    run_join_pair(&left, &right, &second, &test_config()).unwrap();

    for (a, b) in [
        (&first.matched, &second.matched),
        (&first.unmatched_left, &second.unmatched_left),
        (&first.unmatched_right, &second.unmatched_right),
        (&first.errors, &second.errors),
    ] {
        assert_eq!(fs::read(a).unwrap(), fs::read(b).unwrap());
    }
}
