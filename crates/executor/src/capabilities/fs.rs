//! Filesystem access behind a narrow, mockable interface.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::CapabilityError;

/// Trait for filesystem operations the executor needs.
///
/// `append_line` and `remove_lines_starting_with` are provided in terms of
/// read and write so both implementations share the idempotent line-map
/// editing used for the postfix/dovecot user files.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Creates a directory and any missing parents; idempotent.
    async fn create_dir_all(&self, path: &Path) -> Result<(), CapabilityError>;

    /// Writes a file, replacing any existing contents.
    async fn write(&self, path: &Path, contents: &str) -> Result<(), CapabilityError>;

    /// Reads a file; returns `None` if it does not exist.
    async fn read_to_string(&self, path: &Path) -> Result<Option<String>, CapabilityError>;

    /// Removes a file; succeeds if it does not exist.
    async fn remove_file(&self, path: &Path) -> Result<(), CapabilityError>;

    /// Removes a directory tree; succeeds if it does not exist.
    async fn remove_dir_all(&self, path: &Path) -> Result<(), CapabilityError>;

    /// Appends a line unless the file already contains it.
    async fn append_line(&self, path: &Path, line: &str) -> Result<(), CapabilityError> {
        let current = self.read_to_string(path).await?.unwrap_or_default();
        if current.lines().any(|l| l == line) {
            return Ok(());
        }
        let mut updated = current;
        if !updated.is_empty() && !updated.ends_with('\n') {
            updated.push('\n');
        }
        updated.push_str(line);
        updated.push('\n');
        self.write(path, &updated).await
    }

    /// Removes every line starting with the given prefix.
    async fn remove_lines_starting_with(
        &self,
        path: &Path,
        prefix: &str,
    ) -> Result<(), CapabilityError> {
        let Some(current) = self.read_to_string(path).await? else {
            return Ok(());
        };
        let retained: Vec<&str> = current
            .lines()
            .filter(|l| !l.starts_with(prefix))
            .collect();
        let mut updated = retained.join("\n");
        if !updated.is_empty() {
            updated.push('\n');
        }
        self.write(path, &updated).await
    }
}

/// Filesystem backed by `tokio::fs`.
#[derive(Debug, Clone, Default)]
pub struct SystemFileSystem;

impl SystemFileSystem {
    /// Creates a new system filesystem.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl FileSystem for SystemFileSystem {
    async fn create_dir_all(&self, path: &Path) -> Result<(), CapabilityError> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn write(&self, path: &Path, contents: &str) -> Result<(), CapabilityError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn read_to_string(&self, path: &Path) -> Result<Option<String>, CapabilityError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_file(&self, path: &Path) -> Result<(), CapabilityError> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_dir_all(&self, path: &Path) -> Result<(), CapabilityError> {
        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[derive(Debug, Default)]
struct InMemoryFsState {
    files: HashMap<PathBuf, String>,
    dirs: HashSet<PathBuf>,
}

/// In-memory filesystem for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryFileSystem {
    state: Arc<RwLock<InMemoryFsState>>,
}

impl InMemoryFileSystem {
    /// Creates a new empty in-memory filesystem.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the contents of a file, if present.
    pub fn file(&self, path: &Path) -> Option<String> {
        self.state.read().unwrap().files.get(path).cloned()
    }

    /// Returns true if the directory was created.
    pub fn has_dir(&self, path: &Path) -> bool {
        self.state.read().unwrap().dirs.contains(path)
    }

    /// Returns the number of files present.
    pub fn file_count(&self) -> usize {
        self.state.read().unwrap().files.len()
    }
}

#[async_trait]
impl FileSystem for InMemoryFileSystem {
    async fn create_dir_all(&self, path: &Path) -> Result<(), CapabilityError> {
        self.state.write().unwrap().dirs.insert(path.to_path_buf());
        Ok(())
    }

    async fn write(&self, path: &Path, contents: &str) -> Result<(), CapabilityError> {
        self.state
            .write()
            .unwrap()
            .files
            .insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    async fn read_to_string(&self, path: &Path) -> Result<Option<String>, CapabilityError> {
        Ok(self.state.read().unwrap().files.get(path).cloned())
    }

    async fn remove_file(&self, path: &Path) -> Result<(), CapabilityError> {
        self.state.write().unwrap().files.remove(path);
        Ok(())
    }

    async fn remove_dir_all(&self, path: &Path) -> Result<(), CapabilityError> {
        let mut state = self.state.write().unwrap();
        state.dirs.retain(|d| !d.starts_with(path));
        state.files.retain(|f, _| !f.starts_with(path));
        Ok(())
    }
}
