//! Jailed filesystem view: every path a caller supplies is resolved relative
//! to a fixed root, never escapes it, and is never followed through a
//! symlink that might (symlink-aware resolution is an open question, see
//! DESIGN.md).

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Metadata returned by [`FileSystemView::stat`].
#[derive(Debug, Clone)]
pub struct FileStat {
    pub is_dir: bool,
    pub len: u64,
    /// Seconds since the Unix epoch, best-effort (`None` if the platform
    /// cannot report mtime).
    pub mtime: Option<u64>,
}

#[derive(Debug, Error)]
pub enum FsError {
    #[error("absolute path not allowed")]
    AbsolutePath,
    #[error("path escapes process root")]
    Escapes,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A filesystem view rooted at a fixed directory. All operations take a
/// path relative to that root.
pub struct FileSystemView {
    root: PathBuf,
}

impl FileSystemView {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a user-supplied relative path against the root.
    ///
    /// Rejects absolute paths outright, then lexically cleans `.`/`..`
    /// components (no filesystem access, so this does not follow symlinks)
    /// and requires the cleaned, joined path to still start with
    /// `root + separator`.
    fn resolve(&self, user_path: &str) -> Result<PathBuf, FsError> {
        let supplied = Path::new(user_path);
        if supplied.is_absolute() {
            return Err(FsError::AbsolutePath);
        }

        let mut cleaned = PathBuf::new();
        for component in supplied.components() {
            match component {
                Component::ParentDir => {
                    // Popping past an empty prefix means the path tries to
                    // climb above the root itself, not just back into it.
                    if !cleaned.pop() {
                        return Err(FsError::Escapes);
                    }
                }
                Component::CurDir => {}
                Component::Normal(part) => cleaned.push(part),
                Component::RootDir | Component::Prefix(_) => {
                    return Err(FsError::AbsolutePath);
                }
            }
        }

        let full = self.root.join(&cleaned);

        let mut root_with_sep = self.root.as_os_str().to_os_string();
        let sep = std::path::MAIN_SEPARATOR;
        if !root_with_sep.to_string_lossy().ends_with(sep) {
            root_with_sep.push(sep.to_string());
        }

        if !full.as_os_str().to_string_lossy().starts_with(&*root_with_sep.to_string_lossy()) {
            return Err(FsError::Escapes);
        }

        Ok(full)
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, FsError> {
        let full = self.resolve(path)?;
        Ok(tokio::fs::read(full).await?)
    }

    /// Creates parent directories (mode 0755) before writing the file (mode
    /// 0644), matching the Go original's `WriteFile`.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), FsError> {
        let full = self.resolve(path)?;
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent).await?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let perms = std::fs::Permissions::from_mode(0o755);
                let _ = tokio::fs::set_permissions(parent, perms).await;
            }
        }
        tokio::fs::write(&full, data).await?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let perms = std::fs::Permissions::from_mode(0o644);
            tokio::fs::set_permissions(&full, perms).await?;
        }
        Ok(())
    }

    pub async fn list_dir(&self, path: &str) -> Result<Vec<String>, FsError> {
        let full = self.resolve(path)?;
        let mut entries = tokio::fs::read_dir(full).await?;
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(names)
    }

    pub async fn stat(&self, path: &str) -> Result<FileStat, FsError> {
        let full = self.resolve(path)?;
        let meta = tokio::fs::metadata(full).await?;
        let mtime = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .map(|d| d.as_secs());
        Ok(FileStat {
            is_dir: meta.is_dir(),
            len: meta.len(),
            mtime,
        })
    }
}
