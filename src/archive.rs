//! Attachment bundle download and unpacking.
//!
//! Each solicitation gets its own temporary working directory. The directory
//! is owned by the returned [`UnpackedArchive`] and removed when that value is
//! dropped, on every exit path, whether the caller finished, bailed out early,
//! or its task was aborted.
//!
//! | Upstream result | Retrieval |
//! |-----------------|-----------|
//! | zip bytes | `Unpacked` with one [`UnpackedFile`] per entry |
//! | zero bytes, 404, or not a zip | `Unpacked` with no files |
//! | retries exhausted | `Unavailable` (the caller flags the notice for retry) |

use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::error::UpstreamError;
use crate::retry::RetryPolicy;

/// Download of a notice's attachment bundle.
#[async_trait]
pub trait ArchiveSource: Send + Sync {
    async fn download(&self, notice_id: &str) -> Result<Vec<u8>, UpstreamError>;
}

/// One entry written to the working directory.
#[derive(Debug, Clone)]
pub struct UnpackedFile {
    /// Entry name inside the archive (relative, sanitised).
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
    /// Set when the entry could not be decompressed; `path` then holds no data.
    pub unpack_error: Option<String>,
}

/// Unpacked files plus the guard that owns their directory.
#[derive(Debug)]
pub struct UnpackedArchive {
    dir: Option<TempDir>,
    pub files: Vec<UnpackedFile>,
}

impl UnpackedArchive {
    pub fn empty() -> Self {
        Self {
            dir: None,
            files: Vec::new(),
        }
    }

    /// Working directory, if anything was unpacked.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.path())
    }
}

#[derive(Debug)]
pub enum Retrieval {
    Unpacked(UnpackedArchive),
    Unavailable { reason: String },
}

#[derive(Debug, thiserror::Error)]
pub enum UnpackError {
    #[error("malformed archive: {0}")]
    Malformed(String),
    #[error("working directory: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ArchiveRetriever {
    source: Arc<dyn ArchiveSource>,
    retry: RetryPolicy,
    work_dir: Option<PathBuf>,
    max_entry_bytes: u64,
}

impl ArchiveRetriever {
    pub fn new(
        source: Arc<dyn ArchiveSource>,
        retry: RetryPolicy,
        work_dir: Option<PathBuf>,
        max_entry_bytes: u64,
    ) -> Self {
        Self {
            source,
            retry,
            work_dir,
            max_entry_bytes,
        }
    }

    /// Download and unpack the bundle for `notice_id`.
    pub async fn retrieve(&self, notice_id: &str) -> Retrieval {
        let source = &self.source;
        let bytes = match self
            .retry
            .run("archive download", || source.download(notice_id))
            .await
        {
            Ok(b) => b,
            Err(UpstreamError::NotFound(_)) => {
                debug!(notice_id, "no attachment bundle");
                return Retrieval::Unpacked(UnpackedArchive::empty());
            }
            Err(e) => {
                warn!(notice_id, kind = %e.kind(), "archive download failed: {}", e);
                return Retrieval::Unavailable {
                    reason: e.to_string(),
                };
            }
        };

        if bytes.is_empty() {
            debug!(notice_id, "zero-byte attachment bundle");
            return Retrieval::Unpacked(UnpackedArchive::empty());
        }

        let work_dir = self.work_dir.clone();
        let max = self.max_entry_bytes;
        let unpacked =
            tokio::task::spawn_blocking(move || unpack(&bytes, work_dir.as_deref(), max)).await;

        match unpacked {
            Ok(Ok(archive)) => {
                debug!(
                    notice_id,
                    files = archive.files.len(),
                    dir = ?archive.path(),
                    "attachment bundle unpacked"
                );
                Retrieval::Unpacked(archive)
            }
            Ok(Err(UnpackError::Malformed(e))) => {
                warn!(notice_id, "attachment bundle is not a readable archive: {}", e);
                Retrieval::Unpacked(UnpackedArchive::empty())
            }
            Ok(Err(e)) => Retrieval::Unavailable {
                reason: e.to_string(),
            },
            Err(join) => Retrieval::Unavailable {
                reason: format!("unpack task failed: {}", join),
            },
        }
    }
}

/// Unpack zip `bytes` into a fresh temporary directory.
///
/// Entries whose names escape the archive root are skipped. An entry that
/// fails to decompress, or exceeds `max_entry_bytes`, is still listed with
/// its `unpack_error` set so it can be recorded.
pub fn unpack(
    bytes: &[u8],
    work_dir: Option<&Path>,
    max_entry_bytes: u64,
) -> Result<UnpackedArchive, UnpackError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| UnpackError::Malformed(e.to_string()))?;

    let mut builder = tempfile::Builder::new();
    builder.prefix("srt-");
    let dir = match work_dir {
        Some(parent) => {
            std::fs::create_dir_all(parent)?;
            builder.tempdir_in(parent)?
        }
        None => builder.tempdir()?,
    };

    let mut files = Vec::new();
    for i in 0..archive.len() {
        let mut entry = match archive.by_index(i) {
            Ok(e) => e,
            Err(e) => {
                warn!(index = i, "unreadable archive entry: {}", e);
                files.push(UnpackedFile {
                    name: format!("entry-{}", i),
                    path: dir.path().join(format!("entry-{}", i)),
                    size: 0,
                    unpack_error: Some(e.to_string()),
                });
                continue;
            }
        };

        if entry.is_dir() {
            continue;
        }

        let rel = match entry.enclosed_name() {
            Some(p) => p,
            None => {
                warn!(name = entry.name(), "skipping archive entry with unsafe path");
                continue;
            }
        };
        if rel.starts_with("__MACOSX") {
            continue;
        }

        let name = rel.to_string_lossy().replace('\\', "/");
        let path = dir.path().join(&rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = std::fs::File::create(&path)?;
        let copied = std::io::copy(&mut (&mut entry).take(max_entry_bytes + 1), &mut out);

        let (size, unpack_error) = match copied {
            Ok(n) if n > max_entry_bytes => {
                drop(out);
                std::fs::remove_file(&path)?;
                (
                    entry.size(),
                    Some(format!("entry exceeds size limit ({} bytes)", max_entry_bytes)),
                )
            }
            Ok(n) => (n, None),
            Err(e) => (entry.size(), Some(e.to_string())),
        };

        files.push(UnpackedFile {
            name,
            path,
            size,
            unpack_error,
        });
    }

    Ok(UnpackedArchive {
        dir: Some(dir),
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn zip_of(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(std::io::Cursor::new(&mut buf));
            for (name, data) in entries {
                zip.start_file(*name, zip::write::SimpleFileOptions::default())
                    .unwrap();
                zip.write_all(data).unwrap();
            }
            zip.finish().unwrap();
        }
        buf
    }

    struct FakeSource {
        result: fn() -> Result<Vec<u8>, UpstreamError>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ArchiveSource for FakeSource {
        async fn download(&self, _notice_id: &str) -> Result<Vec<u8>, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.result)()
        }
    }

    fn retriever(result: fn() -> Result<Vec<u8>, UpstreamError>) -> (ArchiveRetriever, Arc<FakeSource>) {
        let source = Arc::new(FakeSource {
            result,
            calls: AtomicUsize::new(0),
        });
        let r = ArchiveRetriever::new(
            source.clone(),
            RetryPolicy::new(2, std::time::Duration::from_millis(1)),
            None,
            1024 * 1024,
        );
        (r, source)
    }

    #[test]
    fn unpacks_entries_and_cleans_up_on_drop() {
        let bytes = zip_of(&[("a.txt", b"alpha"), ("sub/b.txt", b"beta")]);
        let archive = unpack(&bytes, None, 1024).unwrap();
        let dir = archive.path().unwrap().to_path_buf();
        assert_eq!(archive.files.len(), 2);
        assert_eq!(archive.files[1].name, "sub/b.txt");
        assert_eq!(std::fs::read(&archive.files[0].path).unwrap(), b"alpha");
        assert!(dir.exists());

        drop(archive);
        assert!(!dir.exists());
    }

    #[test]
    fn oversized_entries_are_listed_with_error() {
        let big = vec![b'x'; 64];
        let bytes = zip_of(&[("big.txt", &big), ("small.txt", b"ok")]);
        let archive = unpack(&bytes, None, 16).unwrap();
        assert!(archive.files[0].unpack_error.is_some());
        assert!(!archive.files[0].path.exists());
        assert!(archive.files[1].unpack_error.is_none());
    }

    #[test]
    fn garbage_is_malformed() {
        assert!(matches!(
            unpack(b"definitely not a zip", None, 1024),
            Err(UnpackError::Malformed(_))
        ));
    }

    #[test]
    fn unpacks_into_configured_work_dir() {
        let parent = tempfile::tempdir().unwrap();
        let bytes = zip_of(&[("a.txt", b"alpha")]);
        let archive = unpack(&bytes, Some(parent.path()), 1024).unwrap();
        assert!(archive.path().unwrap().starts_with(parent.path()));
    }

    #[tokio::test]
    async fn zero_byte_bundle_is_empty_not_error() {
        let (r, _) = retriever(|| Ok(Vec::new()));
        match r.retrieve("N1").await {
            Retrieval::Unpacked(a) => assert!(a.files.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_bundle_is_empty_not_error() {
        let (r, _) = retriever(|| Ok(b"PK garbage".to_vec()));
        match r.retrieve("N1").await {
            Retrieval::Unpacked(a) => assert!(a.files.is_empty()),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn not_found_means_no_documents() {
        let (r, source) = retriever(|| Err(UpstreamError::NotFound("none".into())));
        assert!(matches!(r.retrieve("N1").await, Retrieval::Unpacked(_)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_retries_are_unavailable() {
        let (r, source) = retriever(|| Err(UpstreamError::Transient("timeout".into())));
        assert!(matches!(r.retrieve("N1").await, Retrieval::Unavailable { .. }));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }
}
