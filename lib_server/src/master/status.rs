//! Status and connection dump files.
//!
//! The master primes the file with a serialized manifest, opens it up for
//! worker appends (`0722`), and signals the pool; each worker appends its
//! own text rows. The `status`/`connections` CLI verbs re-trigger the dump
//! and read the settled file back.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Master half of a dump: one JSON document, first line of the file.
#[derive(Debug, Serialize, Deserialize)]
pub struct MasterManifest {
    pub pid: u32,
    pub status: String,
    pub event_driver: String,
    pub servers: Vec<ServerManifest>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerManifest {
    pub name: String,
    pub listen: String,
    pub count: usize,
    /// Slot index -> worker pid (0 = vacant).
    pub workers: Vec<i32>,
    /// Exit code -> occurrences since start.
    pub exit_info: BTreeMap<i32, u64>,
}

/// Truncates the file, writes the manifest line, and opens the mode up so
/// workers can append without racing the master's permissions.
pub fn prime(path: &Path, manifest: &MasterManifest) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    serde_json::to_writer(&mut file, manifest)?;
    file.write_all(b"\n")?;
    let mut permissions = file.metadata()?.permissions();
    permissions.set_mode(0o722);
    std::fs::set_permissions(path, permissions)?;
    Ok(())
}

/// One appended worker row.
pub fn append_row(path: &Path, row: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{row}")
}

pub fn read(path: &Path) -> std::io::Result<String> {
    let mut content = String::new();
    File::open(path)?.read_to_string(&mut content)?;
    Ok(content)
}

/// Splits a dump back into its manifest and worker rows.
pub fn parse(content: &str) -> Option<(MasterManifest, Vec<&str>)> {
    let mut lines = content.lines();
    let manifest = serde_json::from_str(lines.next()?).ok()?;
    Some((manifest, lines.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> MasterManifest {
        MasterManifest {
            pid: 4242,
            status: "RUNNING".to_string(),
            event_driver: "mio".to_string(),
            servers: vec![ServerManifest {
                name: "echo".to_string(),
                listen: "text://0.0.0.0:8484".to_string(),
                count: 2,
                workers: vec![4243, 0],
                exit_info: BTreeMap::from([(0, 3)]),
            }],
        }
    }

    #[test]
    fn prime_then_append_then_parse() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dump.status");
        prime(&path, &manifest()).unwrap();
        append_row(&path, "pid:4243 echo 1 0 0 0").unwrap();
        append_row(&path, "pid:4244 echo 0 5 0 0").unwrap();

        let content = read(&path).unwrap();
        let (parsed, rows) = parse(&content).unwrap();
        assert_eq!(parsed.pid, 4242);
        assert_eq!(parsed.servers[0].workers, vec![4243, 0]);
        assert_eq!(rows.len(), 2);
        assert!(rows[1].starts_with("pid:4244"));
    }

    #[test]
    fn workers_can_append_by_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("dump.status");
        prime(&path, &manifest()).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o722);
    }
}
