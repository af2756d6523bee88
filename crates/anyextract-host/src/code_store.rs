//! Versioned workflow artifacts on disk.
//!
//! Layout: `{root}/{task}/extract_v{N}.{json|wasm}`. Artifact paths stored in
//! the registry are relative to `root`, so a workflows directory can move.

use std::path::{Path, PathBuf};

use anyextract_core::ArtifactKind;
use sha2::{Digest, Sha256};
use similar::TextDiff;
use tracing::info;

use crate::error::ArtifactError;

const ARTIFACT_PREFIX: &str = "extract_v";

/// Turn free text into a directory-safe task name: word characters, CJK
/// and hyphens kept, whitespace runs become `_`, at most 60 characters,
/// lowercased when ASCII.
pub fn sanitize_task_name(description: &str) -> String {
    let kept: String = description
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '_' || *c == '-' || c.is_whitespace())
        .collect();
    let joined = kept.split_whitespace().collect::<Vec<_>>().join("_");
    let name: String = joined.chars().take(60).collect();
    if name.is_ascii() {
        name.to_lowercase()
    } else {
        name
    }
}

/// First eight hex characters of the SHA-256 of `bytes`.
pub fn commit_ref(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

#[derive(Debug, Clone)]
pub struct CodeStore {
    root: PathBuf,
}

impl CodeStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn relative_path(task: &str, version: i64, kind: ArtifactKind) -> String {
        format!("{task}/{ARTIFACT_PREFIX}{version}.{}", kind.extension())
    }

    /// Absolute location of a registry artifact path.
    pub fn resolve(&self, artifact_path: &str) -> PathBuf {
        self.root.join(artifact_path)
    }

    /// Write an artifact and return `(artifact_path, commit_ref)`.
    pub fn write(
        &self,
        task: &str,
        version: i64,
        kind: ArtifactKind,
        bytes: &[u8],
    ) -> Result<(String, String), ArtifactError> {
        let relative = Self::relative_path(task, version, kind);
        let path = self.resolve(&relative);
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| ArtifactError::io(dir.display().to_string(), e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| ArtifactError::io(path.display().to_string(), e))?;
        let commit = commit_ref(bytes);
        info!(task, version, path = %relative, commit = %commit, "wrote workflow artifact");
        Ok((relative, commit))
    }

    /// Read an artifact by its registry path.
    pub fn read_path(&self, artifact_path: &str) -> Result<Vec<u8>, ArtifactError> {
        let path = self.resolve(artifact_path);
        std::fs::read(&path).map_err(|e| ArtifactError::io(path.display().to_string(), e))
    }

    /// Read the artifact for `(task, version)`, whichever kind it is.
    pub fn read(&self, task: &str, version: i64) -> Result<(ArtifactKind, Vec<u8>), ArtifactError> {
        for kind in ArtifactKind::ALL {
            let relative = Self::relative_path(task, version, *kind);
            if self.resolve(&relative).exists() {
                return Ok((*kind, self.read_path(&relative)?));
            }
        }
        Err(ArtifactError::io(
            format!("{task}/{ARTIFACT_PREFIX}{version}"),
            std::io::Error::new(std::io::ErrorKind::NotFound, "no artifact for this version"),
        ))
    }

    /// Versions present on disk for a task, ascending.
    pub fn list_versions(&self, task: &str) -> Result<Vec<i64>, ArtifactError> {
        let dir = self.root.join(task);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(ArtifactError::io(dir.display().to_string(), e)),
        };
        let mut versions: Vec<i64> = entries
            .filter_map(Result::ok)
            .filter_map(|entry| {
                let path = entry.path();
                ArtifactKind::from_extension(path.extension()?.to_str()?)?;
                path.file_stem()?
                    .to_str()?
                    .strip_prefix(ARTIFACT_PREFIX)?
                    .parse()
                    .ok()
            })
            .collect();
        versions.sort_unstable();
        versions.dedup();
        Ok(versions)
    }

    /// Unified diff between two versions. Binary artifacts diff by commit ref.
    pub fn diff(&self, task: &str, from: i64, to: i64) -> Result<String, ArtifactError> {
        let (from_kind, old) = self.read(task, from)?;
        let (to_kind, new) = self.read(task, to)?;
        let from_name = format!("{ARTIFACT_PREFIX}{from}.{}", from_kind.extension());
        let to_name = format!("{ARTIFACT_PREFIX}{to}.{}", to_kind.extension());
        match (std::str::from_utf8(&old), std::str::from_utf8(&new)) {
            (Ok(old), Ok(new)) => Ok(TextDiff::from_lines(old, new)
                .unified_diff()
                .header(&from_name, &to_name)
                .to_string()),
            _ => Ok(format!(
                "binary artifacts differ: {from_name} ({}) -> {to_name} ({})\n",
                commit_ref(&old),
                commit_ref(&new)
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_names_are_directory_safe() {
        assert_eq!(sanitize_task_name("Broker Reports: Q3 2024!"), "broker_reports_q3_2024");
        assert_eq!(sanitize_task_name("券商 研报 提取"), "券商_研报_提取");
        assert_eq!(sanitize_task_name(&"x".repeat(80)).len(), 60);
    }

    #[test]
    fn commit_ref_is_eight_hex_chars() {
        let r = commit_ref(b"hello");
        assert_eq!(r, "2cf24dba");
    }

    #[test]
    fn write_read_and_list() {
        let dir = tempfile::tempdir().unwrap();
        let store = CodeStore::new(dir.path());
        let (path, commit) = store.write("reports", 1, ArtifactKind::Plan, b"{\"entry\":\"extract\"}").unwrap();
        assert_eq!(path, "reports/extract_v1.json");
        assert_eq!(commit.len(), 8);
        store.write("reports", 3, ArtifactKind::Component, b"\0asm").unwrap();

        let (kind, bytes) = store.read("reports", 1).unwrap();
        assert_eq!(kind, ArtifactKind::Plan);
        assert_eq!(bytes, b"{\"entry\":\"extract\"}");
        assert_eq!(store.read_path(&path).unwrap(), bytes);
        assert_eq!(store.list_versions("reports").unwrap(), vec![1, 3]);
        assert!(store.list_versions("missing").unwrap().is_empty());
        assert!(store.read("reports", 2).is_err());
    }

    #[test]
    fn diff_between_plan_versions() {
        let dir = tempfile::tempdir().unwrap();
        let store = CodeStore::new(dir.path());
        store.write("t", 1, ArtifactKind::Plan, b"a\nb\n").unwrap();
        store.write("t", 2, ArtifactKind::Plan, b"a\nc\n").unwrap();
        let diff = store.diff("t", 1, 2).unwrap();
        assert!(diff.contains("--- extract_v1.json"));
        assert!(diff.contains("-b"));
        assert!(diff.contains("+c"));
    }
}
