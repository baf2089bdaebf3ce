//! Virtual filesystem capability.
//!
//! The shell core never touches a real filesystem. File access goes through
//! the [`Vfs`] trait: the four read operations the surrounding application
//! exposes, plus the write operations output redirection needs. Path
//! resolution (relative vs absolute) is the caller's responsibility, so the
//! helpers here are used by the pipeline engine before any `Vfs` call.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use thiserror::Error;

/// Filesystem access failures.
#[derive(Debug, Error)]
pub enum VfsError {
    /// The path does not exist.
    #[error("no such file or directory: {0}")]
    NotFound(String),
    /// The path exists but is not a directory.
    #[error("not a directory: {0}")]
    NotADirectory(String),
    /// Any other backend failure.
    #[error("filesystem error: {0}")]
    Io(String),
}

/// Capability-based filesystem interface.
#[async_trait]
pub trait Vfs: Send + Sync {
    /// Whether a file or directory exists at `path`.
    async fn exists(&self, path: &str) -> bool;
    /// Read the full contents of a file.
    async fn read_file(&self, path: &str) -> Result<Vec<u8>, VfsError>;
    /// List the entry names of a directory.
    async fn list_directory(&self, path: &str) -> Result<Vec<String>, VfsError>;
    /// Whether `path` is a directory.
    async fn is_directory(&self, path: &str) -> bool;
    /// Create or truncate a file with the given contents.
    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), VfsError>;
    /// Append to a file, creating it if missing.
    async fn append_file(&self, path: &str, data: &[u8]) -> Result<(), VfsError>;
}

/// Resolve a path relative to cwd if not absolute.
pub fn resolve_path(cwd: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else if cwd == "/" || cwd.is_empty() {
        format!("/{}", path)
    } else {
        format!("{}/{}", cwd, path)
    }
}

/// Normalize a path (resolve `.` and `..`).
pub fn normalize_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            _ => parts.push(part),
        }
    }
    if parts.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", parts.join("/"))
    }
}

/// In-memory [`Vfs`] implementation.
///
/// Used as the reference backend in tests; directories are created implicitly
/// for every file ancestor.
#[derive(Debug, Default)]
pub struct MemoryVfs {
    inner: Mutex<MemoryVfsInner>,
}

#[derive(Debug, Default)]
struct MemoryVfsInner {
    files: HashMap<String, Vec<u8>>,
    dirs: HashSet<String>,
}

impl MemoryVfs {
    /// Create an empty filesystem with just the root directory.
    pub fn new() -> Self {
        let vfs = Self::default();
        vfs.inner.lock().unwrap().dirs.insert("/".to_string());
        vfs
    }

    /// Insert a file, creating all parent directories.
    pub fn add_file(&self, path: &str, data: impl Into<Vec<u8>>) {
        let path = normalize_path(path);
        let mut inner = self.inner.lock().unwrap();
        Self::add_parents(&mut inner.dirs, &path);
        inner.files.insert(path, data.into());
    }

    /// Create a directory (and its ancestors).
    pub fn add_dir(&self, path: &str) {
        let path = normalize_path(path);
        let mut inner = self.inner.lock().unwrap();
        Self::add_parents(&mut inner.dirs, &path);
        inner.dirs.insert(path);
    }

    fn add_parents(dirs: &mut HashSet<String>, path: &str) {
        dirs.insert("/".to_string());
        let mut prefix = String::new();
        let mut components = path.trim_matches('/').split('/').peekable();
        while let Some(part) = components.next() {
            if components.peek().is_none() {
                break;
            }
            prefix.push('/');
            prefix.push_str(part);
            dirs.insert(prefix.clone());
        }
    }
}

#[async_trait]
impl Vfs for MemoryVfs {
    async fn exists(&self, path: &str) -> bool {
        let path = normalize_path(path);
        let inner = self.inner.lock().unwrap();
        inner.files.contains_key(&path) || inner.dirs.contains(&path)
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>, VfsError> {
        let path = normalize_path(path);
        let inner = self.inner.lock().unwrap();
        inner
            .files
            .get(&path)
            .cloned()
            .ok_or(VfsError::NotFound(path))
    }

    async fn list_directory(&self, path: &str) -> Result<Vec<String>, VfsError> {
        let path = normalize_path(path);
        let inner = self.inner.lock().unwrap();
        if !inner.dirs.contains(&path) {
            if inner.files.contains_key(&path) {
                return Err(VfsError::NotADirectory(path));
            }
            return Err(VfsError::NotFound(path));
        }

        let prefix = if path == "/" {
            "/".to_string()
        } else {
            format!("{}/", path)
        };
        let mut entries: Vec<String> = inner
            .files
            .keys()
            .chain(inner.dirs.iter())
            .filter_map(|p| {
                let rest = p.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    None
                } else {
                    Some(rest.to_string())
                }
            })
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    async fn is_directory(&self, path: &str) -> bool {
        let path = normalize_path(path);
        self.inner.lock().unwrap().dirs.contains(&path)
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<(), VfsError> {
        let path = normalize_path(path);
        let mut inner = self.inner.lock().unwrap();
        Self::add_parents(&mut inner.dirs, &path);
        inner.files.insert(path, data.to_vec());
        Ok(())
    }

    async fn append_file(&self, path: &str, data: &[u8]) -> Result<(), VfsError> {
        let path = normalize_path(path);
        let mut inner = self.inner.lock().unwrap();
        Self::add_parents(&mut inner.dirs, &path);
        inner.files.entry(path).or_default().extend_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        assert_eq!(resolve_path("/home", "file.txt"), "/home/file.txt");
        assert_eq!(resolve_path("/", "file.txt"), "/file.txt");
        assert_eq!(resolve_path("/home", "/etc/conf"), "/etc/conf");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/a/b/../c/./d"), "/a/c/d");
        assert_eq!(normalize_path("/.."), "/");
        assert_eq!(normalize_path("//a//b"), "/a/b");
    }

    #[tokio::test]
    async fn test_memory_vfs_files_and_dirs() {
        let vfs = MemoryVfs::new();
        vfs.add_file("/bin/tool.wasm", b"\0asm".to_vec());

        assert!(vfs.exists("/bin/tool.wasm").await);
        assert!(vfs.is_directory("/bin").await);
        assert!(!vfs.is_directory("/bin/tool.wasm").await);
        assert_eq!(vfs.read_file("/bin/tool.wasm").await.unwrap(), b"\0asm");
    }

    #[tokio::test]
    async fn test_memory_vfs_list_directory() {
        let vfs = MemoryVfs::new();
        vfs.add_file("/data/a.txt", b"a".to_vec());
        vfs.add_file("/data/b.txt", b"b".to_vec());
        vfs.add_dir("/data/sub");

        let entries = vfs.list_directory("/data").await.unwrap();
        assert_eq!(entries, vec!["a.txt", "b.txt", "sub"]);

        assert!(matches!(
            vfs.list_directory("/data/a.txt").await,
            Err(VfsError::NotADirectory(_))
        ));
        assert!(matches!(
            vfs.list_directory("/missing").await,
            Err(VfsError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_memory_vfs_write_and_append() {
        let vfs = MemoryVfs::new();
        vfs.write_file("/out.txt", b"one").await.unwrap();
        vfs.append_file("/out.txt", b" two").await.unwrap();
        assert_eq!(vfs.read_file("/out.txt").await.unwrap(), b"one two");

        // Append creates missing files.
        vfs.append_file("/log.txt", b"entry").await.unwrap();
        assert_eq!(vfs.read_file("/log.txt").await.unwrap(), b"entry");
    }
}
