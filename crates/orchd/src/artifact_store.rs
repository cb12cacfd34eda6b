//! Project-scoped file tree abstraction (Section 4.2).
//!
//! All relative paths are slash-normalized before touching the filesystem;
//! escapes (`..`, absolute paths) are rejected before any I/O happens.

use orch_core::Id;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("path escapes project directory: {0}")]
    PathEscape(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

#[cfg(unix)]
const FILE_MODE: u32 = 0o600;
#[cfg(unix)]
const DIR_MODE: u32 = 0o750;

/// Validate and normalize a caller-supplied relative path. Rejects absolute
/// paths and any `..` component (Section 4.2, Section 8 "Path safety").
fn normalize_rel_path(rel_path: &str) -> Result<PathBuf> {
    let candidate = Path::new(rel_path);
    let mut normalized = PathBuf::new();

    for component in candidate.components() {
        match component {
            Component::Normal(part) => normalized.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(ArtifactError::PathEscape(rel_path.to_string()));
            }
        }
    }

    if normalized.as_os_str().is_empty() {
        return Err(ArtifactError::PathEscape(rel_path.to_string()));
    }

    Ok(normalized)
}

fn io_err(path: &Path, source: std::io::Error) -> ArtifactError {
    ArtifactError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Project-scoped filesystem store rooted at `data_dir/artifacts/{project_id}`.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("artifacts"),
        }
    }

    pub fn project_dir(&self, project_id: &Id) -> PathBuf {
        self.root.join(project_id.as_ref())
    }

    /// Path to the deletion audit marker for `project_name`, written once a
    /// project's artifact directory has been removed (Section 6 persisted
    /// layout: `_audit/<project>.deleted.txt`).
    pub fn audit_marker_path(&self, project_name: &str) -> PathBuf {
        self.root.join("_audit").join(format!("{project_name}.deleted.txt"))
    }

    pub fn ensure_project_dir(&self, project_id: &Id) -> Result<PathBuf> {
        let dir = self.project_dir(project_id);
        std::fs::create_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        set_dir_mode(&dir)?;
        Ok(dir)
    }

    pub fn remove_project(&self, project_id: &Id) -> Result<()> {
        let dir = self.project_dir(project_id);
        if dir.exists() {
            std::fs::remove_dir_all(&dir).map_err(|e| io_err(&dir, e))?;
        }
        Ok(())
    }

    /// Write `bytes` to `rel_path` under the project directory, creating parent
    /// directories as needed. Returns the absolute path written.
    pub fn write_file(&self, project_id: &Id, rel_path: &str, bytes: &[u8]) -> Result<PathBuf> {
        let normalized = normalize_rel_path(rel_path)?;
        let project_dir = self.ensure_project_dir(project_id)?;
        let abs_path = project_dir.join(&normalized);

        if let Some(parent) = abs_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| io_err(parent, e))?;
            set_dir_mode(parent)?;
        }
        std::fs::write(&abs_path, bytes).map_err(|e| io_err(&abs_path, e))?;
        set_file_mode(&abs_path)?;
        Ok(abs_path)
    }

    pub fn read_file(&self, project_id: &Id, rel_path: &str) -> Result<Vec<u8>> {
        let normalized = normalize_rel_path(rel_path)?;
        let abs_path = self.project_dir(project_id).join(&normalized);
        std::fs::read(&abs_path).map_err(|e| io_err(&abs_path, e))
    }

    /// List all files under the project directory in stable (sorted) order,
    /// as project-relative slash paths, excluding any `.git/` subtree.
    pub fn list_files(&self, project_id: &Id) -> Result<Vec<String>> {
        let project_dir = self.project_dir(project_id);
        if !project_dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        collect_files(&project_dir, &project_dir, &mut files)?;
        files.sort();
        Ok(files)
    }
}

fn collect_files(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
    let entries = std::fs::read_dir(dir).map_err(|e| io_err(dir, e))?;
    for entry in entries {
        let entry = entry.map_err(|e| io_err(dir, e))?;
        let path = entry.path();
        if path.file_name().and_then(|n| n.to_str()) == Some(".git") {
            continue;
        }
        if path.is_dir() {
            collect_files(root, &path, out)?;
        } else {
            let rel = path
                .strip_prefix(root)
                .unwrap_or(&path)
                .to_string_lossy()
                .replace('\\', "/");
            out.push(rel);
        }
    }
    Ok(())
}

#[cfg(unix)]
fn set_file_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(FILE_MODE))
        .map_err(|e| io_err(path, e))
}

#[cfg(unix)]
fn set_dir_mode(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(DIR_MODE))
        .map_err(|e| io_err(path, e))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn set_dir_mode(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_roundtrips() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let project_id = Id::new();

        store
            .write_file(&project_id, "registration/project.yaml", b"name: svc-a")
            .unwrap();
        let bytes = store.read_file(&project_id, "registration/project.yaml").unwrap();
        assert_eq!(bytes, b"name: svc-a");
    }

    #[test]
    fn rejects_parent_dir_escape() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let project_id = Id::new();

        assert!(matches!(
            store.write_file(&project_id, "..", b"x"),
            Err(ArtifactError::PathEscape(_))
        ));
        assert!(matches!(
            store.read_file(&project_id, "x/../../y"),
            Err(ArtifactError::PathEscape(_))
        ));
    }

    #[test]
    fn rejects_absolute_path() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let project_id = Id::new();

        assert!(matches!(
            store.write_file(&project_id, "/abs", b"x"),
            Err(ArtifactError::PathEscape(_))
        ));
    }

    #[test]
    fn list_files_is_sorted_and_excludes_git() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let project_id = Id::new();

        store.write_file(&project_id, "b.txt", b"b").unwrap();
        store.write_file(&project_id, "a.txt", b"a").unwrap();
        store
            .write_file(&project_id, ".git/HEAD", b"ref: refs/heads/main")
            .unwrap();

        let files = store.list_files(&project_id).unwrap();
        assert_eq!(files, vec!["a.txt".to_string(), "b.txt".to_string()]);
    }

    #[test]
    fn remove_project_deletes_tree() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let project_id = Id::new();
        store.write_file(&project_id, "a.txt", b"a").unwrap();

        store.remove_project(&project_id).unwrap();
        assert!(store.list_files(&project_id).unwrap().is_empty());
    }
}
