use std::path::{Component, Path, PathBuf};

use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

const MAX_READ_BYTES: u64 = 16 * 1024 * 1024;
const MAX_TAIL_BYTES: u64 = 1024 * 1024;
pub const MAX_TAIL_LINES: usize = 10_000;

#[derive(Debug, thiserror::Error)]
pub enum FileError {
    #[error("path escapes the server directory")]
    EscapesRoot,
    #[error("path not found")]
    NotFound,
    #[error("path is not a directory")]
    NotADirectory,
    #[error("path is not a file")]
    NotAFile,
    #[error("refusing to follow a symlink")]
    Symlink,
    #[error("path must name a file")]
    MissingName,
    #[error("file is larger than {MAX_READ_BYTES} bytes")]
    TooLarge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DirEntry {
    pub name: String,
    pub directory: bool,
    pub size: u64,
}

/// Lexical normalization against a virtual root: leading `/` is
/// root-relative, `..` may not climb above the root.
fn normalize_rel_path(rel: &str) -> Result<PathBuf, FileError> {
    let mut out = PathBuf::new();
    for c in Path::new(rel).components() {
        match c {
            Component::CurDir | Component::RootDir => {}
            Component::Normal(seg) => out.push(seg),
            Component::ParentDir => {
                if !out.pop() {
                    return Err(FileError::EscapesRoot);
                }
            }
            Component::Prefix(_) => return Err(FileError::EscapesRoot),
        }
    }
    Ok(out)
}

/// File access confined to one instance's public directory.
#[derive(Debug, Clone)]
pub struct FileTree {
    root: PathBuf,
}

impl FileTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn reject(&self, rel: &str, err: FileError) -> FileError {
        if matches!(err, FileError::EscapesRoot | FileError::Symlink) {
            tracing::warn!(root = %self.root.display(), path = rel, error = %err, "rejected file access outside server directory");
        }
        err
    }

    fn scoped(&self, rel: &str) -> Result<PathBuf, FileError> {
        normalize_rel_path(rel)
            .map(|p| self.root.join(p))
            .map_err(|e| self.reject(rel, e))
    }

    /// Resolves symlinks and checks the result is still under the root.
    async fn enforce_existing(&self, rel: &str, p: &Path) -> Result<PathBuf, FileError> {
        let root = tokio::fs::canonicalize(&self.root)
            .await
            .map_err(|_| FileError::NotFound)?;
        let canon = tokio::fs::canonicalize(p).await.map_err(|_| FileError::NotFound)?;
        if !canon.starts_with(&root) {
            return Err(self.reject(rel, FileError::EscapesRoot));
        }
        Ok(canon)
    }

    pub async fn list(&self, rel: &str) -> Result<Vec<DirEntry>, FileError> {
        let dir = self.scoped(rel)?;
        let dir = self.enforce_existing(rel, &dir).await?;
        if !tokio::fs::metadata(&dir).await?.is_dir() {
            return Err(FileError::NotADirectory);
        }

        let mut entries = Vec::new();
        let mut rd = tokio::fs::read_dir(&dir).await?;
        while let Some(de) = rd.next_entry().await? {
            let m = de.metadata().await?;
            entries.push(DirEntry {
                name: de.file_name().to_string_lossy().into_owned(),
                directory: m.is_dir(),
                size: if m.is_file() { m.len() } else { 0 },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub async fn read(&self, rel: &str) -> Result<Vec<u8>, FileError> {
        let path = self.scoped(rel)?;
        let path = self.enforce_existing(rel, &path).await?;
        let meta = tokio::fs::metadata(&path).await?;
        if !meta.is_file() {
            return Err(FileError::NotAFile);
        }
        if meta.len() > MAX_READ_BYTES {
            return Err(FileError::TooLarge);
        }
        Ok(tokio::fs::read(&path).await?)
    }

    /// Creates missing parent directories one level at a time, refusing
    /// to walk through symlinks, then replaces the file atomically.
    pub async fn write(&self, rel: &str, data: &[u8]) -> Result<(), FileError> {
        let rel_path = normalize_rel_path(rel).map_err(|e| self.reject(rel, e))?;
        let name = rel_path.file_name().ok_or(FileError::MissingName)?.to_owned();

        let mut dir = self.root.clone();
        if let Some(parent) = rel_path.parent() {
            for c in parent.components() {
                let Component::Normal(seg) = c else {
                    continue;
                };
                dir.push(seg);
                match tokio::fs::symlink_metadata(&dir).await {
                    Ok(m) if m.file_type().is_symlink() => return Err(self.reject(rel, FileError::Symlink)),
                    Ok(m) if !m.is_dir() => return Err(FileError::NotADirectory),
                    Ok(_) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                        tokio::fs::create_dir(&dir).await?;
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        let dir = self.enforce_existing(rel, &dir).await?;
        let path = dir.join(&name);

        if let Ok(m) = tokio::fs::symlink_metadata(&path).await {
            if m.file_type().is_symlink() {
                return Err(self.reject(rel, FileError::Symlink));
            }
            if m.is_dir() {
                return Err(FileError::NotAFile);
            }
        }

        let mut tmp_name = name.clone();
        tmp_name.push(".hearth-tmp");
        let tmp = dir.join(tmp_name);
        let mut f = tokio::fs::File::create(&tmp).await?;
        f.write_all(data).await?;
        f.flush().await?;
        drop(f);
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Removes a file, or a directory with everything below it. A symlink
    /// is removed itself, never its target.
    pub async fn delete(&self, rel: &str) -> Result<(), FileError> {
        let path = self.scoped(rel)?;
        if path == self.root {
            return Err(self.reject(rel, FileError::EscapesRoot));
        }
        let parent = path.parent().ok_or(FileError::MissingName)?;
        self.enforce_existing(rel, parent).await?;

        let meta = tokio::fs::symlink_metadata(&path)
            .await
            .map_err(|_| FileError::NotFound)?;
        if meta.is_dir() {
            tokio::fs::remove_dir_all(&path).await?;
        } else {
            tokio::fs::remove_file(&path).await?;
        }
        Ok(())
    }

    /// Last `lines` lines of a file, reading at most the final megabyte.
    pub async fn tail(&self, rel: &str, lines: usize) -> Result<String, FileError> {
        let path = self.scoped(rel)?;
        let path = self.enforce_existing(rel, &path).await?;
        let mut f = tokio::fs::File::open(&path).await?;
        let len = f.metadata().await?.len();
        let start = len.saturating_sub(MAX_TAIL_BYTES);
        f.seek(std::io::SeekFrom::Start(start)).await?;
        let mut buf = Vec::with_capacity((len - start) as usize);
        f.read_to_end(&mut buf).await?;

        let text = String::from_utf8_lossy(&buf);
        Ok(last_lines(&text, lines.min(MAX_TAIL_LINES)))
    }
}

fn last_lines(text: &str, n: usize) -> String {
    let all: Vec<&str> = text.lines().collect();
    let from = all.len().saturating_sub(n);
    let mut out = all[from..].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}
