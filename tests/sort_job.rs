//! End-to-end tests for the bucketed sort job

mod helpers;

use std::fs;

use helpers::{listing, read_lines, test_config, write_lines};
use kvrecon::pipeline::{run_sort, sort_error_path};
use kvrecon::sort_merge::Bucket;
use kvrecon::{Config, ReconError, Stage};

#[test]
fn test_sort_example() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_lines(&dir.path().join("in.txt"), &["5:zzz", "5:aaa", "1000:m"]);
    let output = dir.path().join("out.txt");

    let stats = run_sort(&input, &output, &test_config()).unwrap();

    assert_eq!(read_lines(&output), vec!["1000:m", "5:aaa", "5:zzz"]);
    assert_eq!(stats.stage, Stage::Done);
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.written, 3);
    assert_eq!(stats.errored, 0);
    assert_eq!(stats.buckets.get(Bucket::Gte5), 2);
    assert_eq!(stats.buckets.get(Bucket::Gte1000), 1);
    assert_eq!(fs::read(sort_error_path(&output)).unwrap(), b"");
    // Work files are gone; only the input and the two outputs remain.
    assert_eq!(
        listing(dir.path()),
        vec!["in.txt", "out.txt", "out.txt.errors"]
    );
}

#[test]
fn test_malformed_lines_go_to_errors() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("in.txt");
    fs::write(
        &input,
        b"notanumber:zzz\n3:b\n0:zero\nnocolon\n-4:neg\n\xff\xfe:bin\n3:a\n",
    )
    .unwrap();
    let output = dir.path().join("out.txt");

    let stats = run_sort(&input, &output, &test_config()).unwrap();

    assert_eq!(read_lines(&output), vec!["3:a", "3:b"]);
    assert_eq!(stats.processed, 7);
    assert_eq!(stats.errored, 5);
    assert_eq!(stats.written, 2);
    assert_eq!(stats.buckets.get(Bucket::Error), 5);
    assert_eq!(stats.buckets.total(), stats.processed);

    let errors = fs::read(sort_error_path(&output)).unwrap();
    let entries: Vec<&[u8]> = errors.split(|&b| b == b'\n').filter(|l| !l.is_empty()).collect();
    assert_eq!(entries.len(), 5);
    assert!(entries[0].starts_with(b"input:1\t"));
    assert!(entries[1].starts_with(b"input:3\t"));
    // Undecodable bytes survive untouched.
    assert!(entries[4].starts_with(b"input:6\t"));
    assert!(entries[4].ends_with(b"\xff\xfe:bin"));
}

#[test]
fn test_every_band_globally_ordered() {
    let dir = tempfile::tempdir().unwrap();
    let keys = [1, 2, 3, 4, 7, 12, 30, 77, 499, 500, 999, 1000, 5000, 2, 1, 50, 25, 10, 5];
    let lines: Vec<String> = keys
        .iter()
        .enumerate()
        .map(|(i, k)| format!("{}:s{:02}", k, (i * 7) % 19))
        .collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let input = write_lines(&dir.path().join("in.txt"), &refs);
    let output = dir.path().join("out.txt");

    let stats = run_sort(&input, &output, &test_config()).unwrap();

    let out = read_lines(&output);
    assert_eq!(out.len(), keys.len());
    assert_eq!(stats.written, keys.len() as u64);
    for band in Bucket::BANDS {
        assert!(stats.buckets.get(band) > 0, "{} is empty", band);
    }
    let parsed: Vec<(i64, String)> = out
        .iter()
        .map(|l| {
            let (k, s) = l.split_once(':').unwrap();
            (k.parse().unwrap(), s.to_string())
        })
        .collect();
    for pair in parsed.windows(2) {
        assert!(pair[0].0 > pair[1].0 || (pair[0].0 == pair[1].0 && pair[0].1 <= pair[1].1));
    }
}

#[test]
fn test_rerun_is_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let lines: Vec<String> = (0..200)
        .map(|i| format!("{}:v{}", (i * 37) % 1500 + 1, (i * 11) % 13))
        .collect();
    let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
    let input = write_lines(&dir.path().join("in.txt"), &refs);
    let first = dir.path().join("first.txt");
    let second = dir.path().join("second.txt");

    run_sort(&input, &first, &test_config()).unwrap();
    let single_thread = Config {
        threads: 1,
        ..test_config()
    };
    run_sort(&input, &second, &single_thread).unwrap();

    assert_eq!(fs::read(&first).unwrap(), fs::read(&second).unwrap());
}

#[test]
fn test_keys_beyond_i64_are_sorted_not_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_lines(
        &dir.path().join("in.txt"),
        &[
            "99999999999999999999:big",
            "1000:m",
            "5:a",
            "-99999999999999999999:neg",
            "100000000000000000000:bigger",
        ],
    );
    let output = dir.path().join("out.txt");

    let stats = run_sort(&input, &output, &test_config()).unwrap();

    assert_eq!(
        read_lines(&output),
        vec![
            "100000000000000000000:bigger",
            "99999999999999999999:big",
            "1000:m",
            "5:a"
        ]
    );
    assert_eq!(stats.errored, 1);
    assert_eq!(stats.buckets.get(Bucket::Gte1000), 3);
    let errors = fs::read_to_string(sort_error_path(&output)).unwrap();
    assert!(errors.starts_with("input:4\t"));
}

#[test]
fn test_declared_order_is_band_wise() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_lines(&dir.path().join("in.txt"), &["1:a", "2000:b", "2:c", "1500:d"]);
    let output = dir.path().join("out.txt");
    let mut order = Bucket::BANDS.to_vec();
    order.reverse();
    let config = Config {
        bucket_order: order,
        ..test_config()
    };

    run_sort(&input, &output, &config).unwrap();

    assert_eq!(read_lines(&output), vec!["1:a", "2:c", "2000:b", "1500:d"]);
}

#[test]
fn test_over_budget_commits_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_lines(&dir.path().join("in.txt"), &["7:aaaa", "8:bbbb", "9:cccc"]);
    let output = dir.path().join("out.txt");
    let config = Config {
        bucket_budget: 16,
        ..test_config()
    };

    let aborted = run_sort(&input, &output, &config).unwrap_err();

    assert!(matches!(aborted.error, ReconError::Resource { budget: 16, .. }));
    assert_eq!(aborted.exit_code(), 2);
    assert_eq!(aborted.stats.stage, Stage::Sorting);
    assert_eq!(aborted.stats.processed, 3);
    assert_eq!(listing(dir.path()), vec!["in.txt"]);
}

#[test]
fn test_missing_input_touches_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let output = dir.path().join("out.txt");

    let aborted = run_sort(&dir.path().join("absent.txt"), &output, &test_config()).unwrap_err();

    assert!(matches!(aborted.error, ReconError::Io { op: "open", .. }));
    assert_eq!(aborted.exit_code(), 2);
    assert!(listing(dir.path()).is_empty());
}

#[test]
fn test_bad_order_is_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_lines(&dir.path().join("in.txt"), &["1:a"]);
    let config = Config {
        bucket_order: vec![Bucket::Gte1000, Bucket::Eq1],
        ..test_config()
    };

    let aborted = run_sort(&input, &dir.path().join("out.txt"), &config).unwrap_err();

    assert_eq!(aborted.exit_code(), 1);
    assert_eq!(aborted.stats.stage, Stage::Idle);
    assert_eq!(listing(dir.path()), vec!["in.txt"]);
}

#[test]
fn test_empty_input() {
    let dir = tempfile::tempdir().unwrap();
    let input = write_lines(&dir.path().join("in.txt"), &[]);
    let output = dir.path().join("out.txt");

    let stats = run_sort(&input, &output, &test_config()).unwrap();

    assert_eq!(stats.processed, 0);
    assert_eq!(fs::read(&output).unwrap(), b"");
}
