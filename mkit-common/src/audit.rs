//! Reading the tool's audit log.
//!
//! The tool appends one JSON event per command to
//! `<state dir>/logs/audit.json`. The file is read one line at a time.

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use memchr::memmem;
use serde::Deserialize;

use crate::config::HostEnv;
use crate::error::{HarnessError, HarnessResult};

/// One audited command.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AuditEntry {
    pub data: AuditData,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditData {
    pub command: String,
    #[serde(default)]
    pub args: String,
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
}

/// Location of the audit log for this host.
pub fn audit_path(host: &HostEnv) -> HarnessResult<PathBuf> {
    host.mini_path()
        .map(|dir| dir.join("logs").join("audit.json"))
        .ok_or_else(|| HarnessError::Config("cannot determine home directory".to_string()))
}

fn open(path: &Path) -> HarnessResult<BufReader<File>> {
    File::open(path).map(BufReader::new).map_err(|e| {
        HarnessError::Io(std::io::Error::new(
            e.kind(),
            format!("failed to open audit log {}: {e}", path.display()),
        ))
    })
}

/// Whether any line of the audit log contains `needle`.
///
/// A missing file is an error, not a negative match.
pub fn audit_contains(path: &Path, needle: &str) -> HarnessResult<bool> {
    let mut reader = open(path)?;
    let finder = memmem::Finder::new(needle.as_bytes());
    let mut line = Vec::new();
    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            return Ok(false);
        }
        if finder.find(&line).is_some() {
            return Ok(true);
        }
    }
}

/// Parsed entries, skipping lines that are not audit events.
pub fn read_entries(path: &Path) -> HarnessResult<Vec<AuditEntry>> {
    let reader = open(path)?;
    let mut entries = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditEntry>(&line) {
            Ok(entry) => entries.push(entry),
            Err(error) => {
                tracing::debug!(line = index + 1, %error, "skipping unparsable audit line");
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    const SAMPLE: &str = r#"{"data":{"args":"-p mini1","command":"start","endTime":"Wed, 03 Feb 2021 15:33:05 MST","profile":"mini1","startTime":"Wed, 03 Feb 2021 15:30:33 MST","user":"user1"},"datacontenttype":"application/json","id":"9b7593cb-fbec-49e5-a3ce-bdc2d0bfb208","source":"https://minikube.sigs.k8s.io/","specversion":"1.0","type":"io.k8s.sigs.minikube.audit"}
{"data":{"args":"--user user2","command":"logs","endTime":"Tue, 02 Feb 2021 16:46:20 MST","profile":"minikube","startTime":"Tue, 02 Feb 2021 16:46:00 MST","user":"user2"},"datacontenttype":"application/json","id":"fec03227-2484-48b6-880a-88fd010b5efd","source":"https://minikube.sigs.k8s.io/","specversion":"1.0","type":"io.k8s.sigs.minikube.audit"}
"#;

    fn sample_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_audit_contains() {
        let file = sample_file();
        assert!(audit_contains(file.path(), "mini1").unwrap());
        assert!(audit_contains(file.path(), "\"command\":\"logs\"").unwrap());
        assert!(!audit_contains(file.path(), "functional-2024").unwrap());
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = TempDir::new().unwrap();
        let err = audit_contains(&dir.path().join("audit.json"), "x").unwrap_err();
        assert!(matches!(err, HarnessError::Io(_)));
        assert!(err.to_string().contains("audit.json"));
    }

    #[test]
    fn test_read_entries_parses_events() {
        let mut file = sample_file();
        file.write_all(b"not json\n\n").unwrap();

        let entries = read_entries(file.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].data.command, "start");
        assert_eq!(entries[0].data.profile, "mini1");
        assert_eq!(entries[1].data.user, "user2");
        assert_eq!(entries[1].data.start_time, "Tue, 02 Feb 2021 16:46:00 MST");
    }

    #[test]
    fn test_audit_path_under_minikube_home() {
        let vars: HashMap<&str, &str> = [("MINIKUBE_HOME", "/srv/mk")].into_iter().collect();
        let host = HostEnv::from_lookup(|n| vars.get(n).map(|v| v.to_string()));
        assert_eq!(
            audit_path(&host).unwrap(),
            PathBuf::from("/srv/mk/.minikube/logs/audit.json")
        );
    }
}
