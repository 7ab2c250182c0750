//! Shared fixtures for the job tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use kvrecon::Config;

/// Small buffers and budgets that still fit every fixture.
pub fn test_config() -> Config {
    Config {
        buffer_size: 64,
        threads: 2,
        progress_interval: 2,
        ..Config::default()
    }
}

pub fn write_lines(path: &Path, lines: &[&str]) -> PathBuf {
    let mut body = lines.join("\n");
    if !lines.is_empty() {
        body.push('\n');
    }
    fs::write(path, body).unwrap();
    path.to_path_buf()
}

pub fn read_lines(path: &Path) -> Vec<String> {
    fs::read_to_string(path)
        .unwrap()
        .lines()
        .map(str::to_string)
        .collect()
}

/// Names of everything in `dir`, sorted.
pub fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}
