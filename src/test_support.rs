//! Fixtures shared by the unit tests: source trees on disk and shell-script
//! stand-ins for the external sorter and merger.

use crate::presort::PresortSettings;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

pub const CALLS_LOG: &str = "calls.log";

pub fn write_table(root: &Path, source: &str, database: &str, table: &str, schema: &str, rows: &[&str]) {
    let dir = root.join(source).join(database);
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join(format!("{}.sql", table)), schema).unwrap();
    let mut csv = rows.join("\n");
    if !rows.is_empty() {
        csv.push('\n');
    }
    std::fs::write(dir.join(format!("{}.csv", table)), csv).unwrap();
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Sorts lexicographically and records `sort <keymode>` in `calls.log`.
pub fn fake_sorter(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "sortdata",
        &format!(
            "echo \"sort $3\" >> \"{}\"\nLC_ALL=C sort \"$1\" > \"$2\"",
            dir.join(CALLS_LOG).display()
        ),
    )
}

/// Merges the two sorted inputs, drops exact duplicate lines and prints a summary.
pub fn fake_merger(dir: &Path) -> PathBuf {
    write_script(
        dir,
        "merge",
        &format!(
            "echo \"merge $4\" >> \"{}\"\nLC_ALL=C sort -m -u \"$1\" \"$2\" > \"$3\"\necho \"merged $(wc -l < \"$3\") rows\"",
            dir.join(CALLS_LOG).display()
        ),
    )
}

pub fn failing_program(dir: &Path, name: &str) -> PathBuf {
    write_script(dir, name, "echo \"boom\" >&2\nexit 3")
}

pub fn calls(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join(CALLS_LOG))
        .map(|content| content.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

pub fn presort_settings(work_dir: &Path, tools_dir: &Path) -> PresortSettings {
    PresortSettings {
        data_root: work_dir.join("presort").join("data"),
        sorter: fake_sorter(tools_dir),
        merger: fake_merger(tools_dir),
        jobs: 2,
    }
}
