//! File Storage
//!
//! The engine reads outgoing files and writes incoming ones through the
//! [`FileStorage`] collaborator. Sources and sinks are scoped to a single
//! file: a sink is either committed, which makes the file visible under
//! its final name, or discarded, which removes every partial byte.
//!
//! Two implementations ship with the crate:
//! - [`FsStorage`]: local filesystem, partial downloads kept in hidden
//!   `.part` files and renamed into place on commit
//! - [`MemoryStorage`]: in-memory map for tests

use crate::session::FileHandle;
use crate::{ProtocolError, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

/// Name used when an incoming name sanitises to nothing
const FALLBACK_FILE_NAME: &str = "received_file";

/// Name and size of a stored file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStat {
    pub name: String,
    pub size: u64,
}

/// Readable bytes of one outgoing file
#[async_trait]
pub trait ByteSource: Send + Debug {
    /// Read up to `max_bytes`; an empty buffer means end of file
    async fn read_chunk(&mut self, max_bytes: usize) -> Result<Vec<u8>>;
}

/// Writable destination of one incoming file
#[async_trait]
pub trait ByteSink: Send + Debug {
    /// Append bytes
    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()>;

    /// Persist the file and return the handle it is stored under
    async fn commit(self: Box<Self>) -> Result<FileHandle>;

    /// Remove everything written so far
    async fn discard(self: Box<Self>) -> Result<()>;
}

/// Resolves file handles to bytes
#[async_trait]
pub trait FileStorage: Send + Sync + Debug {
    /// Resolve a handle's name and size
    async fn stat(&self, handle: &FileHandle) -> Result<FileStat>;

    /// Open a handle for reading
    async fn open(&self, handle: &FileHandle) -> Result<Box<dyn ByteSource>>;

    /// Create an incoming file of the announced size
    async fn create(&self, name: &str, size: u64) -> Result<Box<dyn ByteSink>>;
}

/// Reduce an incoming file name to a single safe path component
///
/// Directory separators, control characters and dot-only names are
/// removed so a manifest cannot write outside the receive directory.
pub fn sanitize_file_name(name: &str) -> String {
    let last = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default();
    let cleaned: String = last.chars().filter(|c| !c.is_control()).collect();
    let cleaned = cleaned.trim();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        FALLBACK_FILE_NAME.to_string()
    } else {
        cleaned.to_string()
    }
}

/// Pick a name that does not collide with existing files
///
/// If `file_name` is taken, appends " (1)", " (2)", etc. before the
/// extension.
pub fn unique_file_name(file_name: &str, exists: impl Fn(&str) -> bool) -> String {
    if !exists(file_name) {
        return file_name.to_string();
    }

    let (name, ext) = match file_name.rfind('.') {
        Some(dot_pos) if dot_pos > 0 => file_name.split_at(dot_pos),
        _ => (file_name, ""),
    };

    for i in 1..1000 {
        let candidate = format!("{} ({}){}", name, i, ext);
        if !exists(&candidate) {
            return candidate;
        }
    }

    // Fallback: random suffix if we somehow hit 1000 conflicts
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}_{}{}", name, &suffix[..8], ext)
}

fn classify_write_error(error: std::io::Error, path: &Path) -> ProtocolError {
    let message = error.to_string().to_lowercase();
    if message.contains("no space") || message.contains("disk full") {
        ProtocolError::ResourceExhausted(format!("disk full while writing {}", path.display()))
    } else {
        ProtocolError::from_io_error(error, &format!("writing {}", path.display()))
    }
}

/// Filesystem-backed storage
///
/// Outgoing handles are paths; incoming files land in `receive_dir`.
#[derive(Debug, Clone)]
pub struct FsStorage {
    receive_dir: PathBuf,
}

impl FsStorage {
    pub fn new(receive_dir: impl Into<PathBuf>) -> Self {
        Self {
            receive_dir: receive_dir.into(),
        }
    }

    pub fn receive_dir(&self) -> &Path {
        &self.receive_dir
    }

    async fn ensure_receive_dir(&self) -> Result<()> {
        if fs::metadata(&self.receive_dir).await.is_ok() {
            return Ok(());
        }
        debug!("Creating receive directory: {}", self.receive_dir.display());
        fs::create_dir_all(&self.receive_dir).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                ProtocolError::PermissionDenied(format!(
                    "Cannot create directory {}: permission denied",
                    self.receive_dir.display()
                ))
            } else {
                ProtocolError::from_io_error(
                    e,
                    &format!("creating directory {}", self.receive_dir.display()),
                )
            }
        })
    }
}

#[async_trait]
impl FileStorage for FsStorage {
    async fn stat(&self, handle: &FileHandle) -> Result<FileStat> {
        let path = Path::new(handle.as_str());
        let metadata = fs::metadata(path)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, &format!("reading {}", path.display())))?;
        if !metadata.is_file() {
            return Err(ProtocolError::InvalidState(format!(
                "{} is not a regular file",
                path.display()
            )));
        }
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());

        Ok(FileStat {
            name,
            size: metadata.len(),
        })
    }

    async fn open(&self, handle: &FileHandle) -> Result<Box<dyn ByteSource>> {
        let path = PathBuf::from(handle.as_str());
        let file = fs::File::open(&path)
            .await
            .map_err(|e| ProtocolError::from_io_error(e, &format!("opening {}", path.display())))?;
        Ok(Box::new(FsSource { file, path }))
    }

    async fn create(&self, name: &str, size: u64) -> Result<Box<dyn ByteSink>> {
        self.ensure_receive_dir().await?;

        let name = sanitize_file_name(name);
        let tag = Uuid::new_v4().simple().to_string();
        let part_path = self.receive_dir.join(format!(".{}.{}.part", name, &tag[..8]));

        let file = fs::File::create(&part_path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => ProtocolError::PermissionDenied(format!(
                "Cannot create file {}: permission denied",
                part_path.display()
            )),
            _ => classify_write_error(e, &part_path),
        })?;
        debug!("Receiving {} ({} bytes) into {}", name, size, part_path.display());

        Ok(Box::new(FsSink {
            file: Some(file),
            part_path,
            receive_dir: self.receive_dir.clone(),
            name,
            expected: size,
            written: 0,
            finished: false,
        }))
    }
}

#[derive(Debug)]
struct FsSource {
    file: fs::File,
    path: PathBuf,
}

#[async_trait]
impl ByteSource for FsSource {
    async fn read_chunk(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; max_bytes];
        let mut filled = 0;
        while filled < max_bytes {
            let n = self.file.read(&mut buf[filled..]).await.map_err(|e| {
                ProtocolError::from_io_error(e, &format!("reading {}", self.path.display()))
            })?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }
}

#[derive(Debug)]
struct FsSink {
    file: Option<fs::File>,
    part_path: PathBuf,
    receive_dir: PathBuf,
    name: String,
    expected: u64,
    written: u64,
    finished: bool,
}

#[async_trait]
impl ByteSink for FsSink {
    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| ProtocolError::invalid_state("sink already closed"))?;
        file.write_all(bytes)
            .await
            .map_err(|e| classify_write_error(e, &self.part_path))?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<FileHandle> {
        if self.written != self.expected {
            return Err(ProtocolError::invalid_state(format!(
                "{}: wrote {} of {} bytes",
                self.name, self.written, self.expected
            )));
        }
        if let Some(mut file) = self.file.take() {
            file.flush()
                .await
                .map_err(|e| classify_write_error(e, &self.part_path))?;
            file.sync_all()
                .await
                .map_err(|e| classify_write_error(e, &self.part_path))?;
        }

        let receive_dir = self.receive_dir.clone();
        let final_name = unique_file_name(&self.name, |candidate| {
            receive_dir.join(candidate).exists()
        });
        let final_path = self.receive_dir.join(&final_name);

        fs::rename(&self.part_path, &final_path).await.map_err(|e| {
            ProtocolError::from_io_error(e, &format!("moving file to {}", final_path.display()))
        })?;
        self.finished = true;
        debug!("Saved {}", final_path.display());

        Ok(FileHandle::from(final_path))
    }

    async fn discard(mut self: Box<Self>) -> Result<()> {
        drop(self.file.take());
        self.finished = true;
        match fs::remove_file(&self.part_path).await {
            Ok(()) => {
                debug!("Cleaned up partial file: {}", self.part_path.display());
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ProtocolError::from_io_error(
                e,
                &format!("removing {}", self.part_path.display()),
            )),
        }
    }
}

impl Drop for FsSink {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // Dropped without commit or discard (task aborted)
        if let Err(e) = std::fs::remove_file(&self.part_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(
                    "Failed to clean up partial file {}: {}",
                    self.part_path.display(),
                    e
                );
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct MemoryFile {
    data: Vec<u8>,
    committed: bool,
}

/// In-memory storage keyed by file name
///
/// Handles are names. Incoming files are visible under their final name
/// as soon as they are created and disappear again if discarded.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: Arc<RwLock<HashMap<String, MemoryFile>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a complete file
    pub async fn insert(&self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.files.write().await.insert(
            name.into(),
            MemoryFile {
                data: data.into(),
                committed: true,
            },
        );
    }

    /// Contents of a file, committed or not
    pub async fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.files.read().await.get(name).map(|f| f.data.clone())
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.files.read().await.contains_key(name)
    }

    pub async fn is_committed(&self, name: &str) -> bool {
        self.files
            .read()
            .await
            .get(name)
            .map(|f| f.committed)
            .unwrap_or(false)
    }

    /// All stored names, sorted
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[async_trait]
impl FileStorage for MemoryStorage {
    async fn stat(&self, handle: &FileHandle) -> Result<FileStat> {
        let files = self.files.read().await;
        let file = files.get(handle.as_str()).ok_or_else(|| {
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {}", handle),
            ))
        })?;
        Ok(FileStat {
            name: handle.as_str().to_string(),
            size: file.data.len() as u64,
        })
    }

    async fn open(&self, handle: &FileHandle) -> Result<Box<dyn ByteSource>> {
        let data = self.get(handle.as_str()).await.ok_or_else(|| {
            ProtocolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {}", handle),
            ))
        })?;
        Ok(Box::new(MemorySource { data, position: 0 }))
    }

    async fn create(&self, name: &str, _size: u64) -> Result<Box<dyn ByteSink>> {
        let mut files = self.files.write().await;
        let name = unique_file_name(&sanitize_file_name(name), |candidate| {
            files.contains_key(candidate)
        });
        files.insert(name.clone(), MemoryFile::default());

        Ok(Box::new(MemorySink {
            files: self.files.clone(),
            name,
        }))
    }
}

#[derive(Debug)]
struct MemorySource {
    data: Vec<u8>,
    position: usize,
}

#[async_trait]
impl ByteSource for MemorySource {
    async fn read_chunk(&mut self, max_bytes: usize) -> Result<Vec<u8>> {
        let end = self.data.len().min(self.position + max_bytes);
        let chunk = self.data[self.position..end].to_vec();
        self.position = end;
        Ok(chunk)
    }
}

#[derive(Debug)]
struct MemorySink {
    files: Arc<RwLock<HashMap<String, MemoryFile>>>,
    name: String,
}

#[async_trait]
impl ByteSink for MemorySink {
    async fn write_chunk(&mut self, bytes: &[u8]) -> Result<()> {
        let mut files = self.files.write().await;
        let file = files
            .get_mut(&self.name)
            .ok_or_else(|| ProtocolError::invalid_state(format!("{} vanished", self.name)))?;
        file.data.extend_from_slice(bytes);
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<FileHandle> {
        let mut files = self.files.write().await;
        let file = files
            .get_mut(&self.name)
            .ok_or_else(|| ProtocolError::invalid_state(format!("{} vanished", self.name)))?;
        file.committed = true;
        Ok(FileHandle::new(self.name.clone()))
    }

    async fn discard(self: Box<Self>) -> Result<()> {
        self.files.write().await.remove(&self.name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("photo.jpg"), "photo.jpg");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\me\\doc.pdf"), "doc.pdf");
        assert_eq!(sanitize_file_name(".."), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name("dir/"), FALLBACK_FILE_NAME);
        assert_eq!(sanitize_file_name("bad\u{0}name.txt"), "badname.txt");
        assert_eq!(sanitize_file_name(".bashrc"), ".bashrc");
    }

    #[test]
    fn test_unique_file_name() {
        let taken = ["file.txt", "file (1).txt", "README"];
        let exists = |name: &str| taken.contains(&name);

        assert_eq!(unique_file_name("other.txt", exists), "other.txt");
        assert_eq!(unique_file_name("file.txt", exists), "file (2).txt");
        assert_eq!(unique_file_name("README", exists), "README (1)");
    }

    #[tokio::test]
    async fn test_fs_sink_commit_renames_into_place() {
        let temp = TempDir::new().unwrap();
        let storage = FsStorage::new(temp.path().join("incoming"));

        let mut sink = storage.create("notes.txt", 5).await.unwrap();
        sink.write_chunk(b"hello").await.unwrap();
        let handle = sink.commit().await.unwrap();

        let final_path = temp.path().join("incoming/notes.txt");
        assert_eq!(handle.as_str(), final_path.to_string_lossy());
        assert_eq!(std::fs::read(&final_path).unwrap(), b"hello");

        let leftovers: Vec<_> = std::fs::read_dir(temp.path().join("incoming"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(leftovers, vec!["notes.txt".to_string()]);
    }

    #[tokio::test]
    async fn test_fs_sink_conflicting_name() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("a.txt"), b"old").unwrap();
        let storage = FsStorage::new(temp.path());

        let mut sink = storage.create("a.txt", 3).await.unwrap();
        sink.write_chunk(b"new").await.unwrap();
        sink.commit().await.unwrap();

        assert_eq!(std::fs::read(temp.path().join("a.txt")).unwrap(), b"old");
        assert_eq!(std::fs::read(temp.path().join("a (1).txt")).unwrap(), b"new");
    }

    #[tokio::test]
    async fn test_fs_sink_discard_leaves_nothing() {
        let temp = TempDir::new().unwrap();
        let storage = FsStorage::new(temp.path());

        let mut sink = storage.create("a.txt", 1000).await.unwrap();
        sink.write_chunk(&[0u8; 400]).await.unwrap();
        sink.discard().await.unwrap();

        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fs_sink_dropped_cleans_up() {
        let temp = TempDir::new().unwrap();
        let storage = FsStorage::new(temp.path());

        let mut sink = storage.create("a.txt", 10).await.unwrap();
        sink.write_chunk(b"abc").await.unwrap();
        drop(sink);

        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fs_sink_short_commit_rejected() {
        let temp = TempDir::new().unwrap();
        let storage = FsStorage::new(temp.path());

        let mut sink = storage.create("a.txt", 10).await.unwrap();
        sink.write_chunk(b"abc").await.unwrap();
        assert!(matches!(
            sink.commit().await,
            Err(ProtocolError::InvalidState(_))
        ));
        assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_fs_stat_and_read() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("data.bin");
        std::fs::write(&path, vec![7u8; 150]).unwrap();
        let storage = FsStorage::new(temp.path());
        let handle = FileHandle::from(path);

        let stat = storage.stat(&handle).await.unwrap();
        assert_eq!(stat.name, "data.bin");
        assert_eq!(stat.size, 150);

        let mut source = storage.open(&handle).await.unwrap();
        assert_eq!(source.read_chunk(100).await.unwrap().len(), 100);
        assert_eq!(source.read_chunk(100).await.unwrap().len(), 50);
        assert!(source.read_chunk(100).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_memory_storage_partial_visibility() {
        let storage = MemoryStorage::new();

        let mut sink = storage.create("a.txt", 6).await.unwrap();
        sink.write_chunk(b"abc").await.unwrap();
        assert!(storage.contains("a.txt").await);
        assert!(!storage.is_committed("a.txt").await);

        sink.discard().await.unwrap();
        assert!(!storage.contains("a.txt").await);
    }

    #[tokio::test]
    async fn test_memory_storage_stat_missing() {
        let storage = MemoryStorage::new();
        assert!(storage.stat(&FileHandle::new("nope")).await.is_err());
    }
}
