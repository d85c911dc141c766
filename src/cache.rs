//! File-backed immutable content cache
//!
//! Entries are addressed by hierarchical [`CacheKey`]s which map to nested
//! paths below the cache root: key `[a, b, c]` lives at `<root>/a/b/c`.
//! Entries are written whole and then never modified in place, apart from
//! the append-then-finalize discipline of [`AppendHandle`], whose
//! intermediate files are not considered authoritative by any reader.
//!
//! The cache may be opened read-only, for deployments where it is
//! pre-populated and shipped alongside the program. Every mutation then
//! fails fast with [`Error::ReadOnly`].

use crate::{Error, Result};
use std::{
    fmt,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::{
    fs::{self, File},
    io::{AsyncRead, AsyncWriteExt, BufReader, BufWriter},
};

/// Suffix appended to the last key segment of compressed entries
pub const COMPRESSED_SUFFIX: &str = ".br";

/// Streamed reader over a cache entry
pub type CacheReader = BufReader<File>;

/// Identifier of a cache entry
///
/// An ordered, non-empty sequence of path segments. Segments are opaque
/// strings, but must be usable as a single path component: they may not be
/// empty, `.` or `..`, nor contain path separators or NUL bytes.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct CacheKey(Box<[Box<str>]>);
//
impl CacheKey {
    /// Build a key from its segments, validating each of them
    pub fn new<S: Into<Box<str>>>(segments: impl IntoIterator<Item = S>) -> Result<Self> {
        let segments = segments
            .into_iter()
            .map(Into::into)
            .collect::<Box<[Box<str>]>>();
        if segments.is_empty() {
            return Err(Error::InvalidKey("".into()));
        }
        for segment in segments.iter() {
            validate_segment(segment)?;
        }
        Ok(Self(segments))
    }

    /// Segments of this key
    pub fn segments(&self) -> &[Box<str>] {
        &self.0
    }

    /// Same key with a suffix appended to the last segment
    pub fn with_suffix(&self, suffix: &str) -> Self {
        debug_assert!(
            !suffix.contains(['/', '\\', '\0']),
            "key suffixes are program constants and should not contain separators"
        );
        let mut segments = self.0.to_vec();
        if let Some(last) = segments.last_mut() {
            *last = format!("{last}{suffix}").into();
        }
        Self(segments.into())
    }

    /// Key of the compressed variant of this entry
    pub fn compressed(&self) -> Self {
        self.with_suffix(COMPRESSED_SUFFIX)
    }

    /// Extend this key with one more segment
    pub fn child(&self, segment: impl Into<Box<str>>) -> Result<Self> {
        let segment = segment.into();
        validate_segment(&segment)?;
        let mut segments = self.0.to_vec();
        segments.push(segment);
        Ok(Self(segments.into()))
    }
}
//
impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

/// Check that a key segment can be used as a single path component
fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty()
        || segment == "."
        || segment == ".."
        || segment.contains(['/', '\\', '\0'])
    {
        Err(Error::InvalidKey(segment.into()))
    } else {
        Ok(())
    }
}

/// File-backed cache rooted at some directory
#[derive(Clone, Debug)]
pub struct Cache {
    /// Directory under which all entries live
    root: PathBuf,

    /// Truth that mutating operations must be refused
    read_only: bool,
}
//
impl Cache {
    /// Open a writable cache rooted at some directory
    ///
    /// The directory does not need to exist yet, it will be created on the
    /// first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: false,
        }
    }

    /// Open a cache which will refuse every mutation
    pub fn read_only(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            read_only: true,
        }
    }

    /// Truth that this cache refuses mutations
    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Location of an entry on disk
    pub fn path(&self, key: &CacheKey) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(key.segments().iter().map(|segment| &**segment));
        path
    }

    /// Truth that an entry exists
    pub async fn exists(&self, key: &CacheKey) -> Result<bool> {
        match fs::metadata(self.path(key)).await {
            Ok(metadata) => Ok(metadata.is_file()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Open an entry for streamed reading, if it exists
    ///
    /// A missing entry is not an error.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheReader>> {
        match File::open(self.path(key)).await {
            Ok(file) => {
                // Directories open fine on some platforms
                if !file.metadata().await?.is_file() {
                    log::debug!("cache miss: {key} is not a file");
                    return Ok(None);
                }
                log::debug!("cache hit: {key}");
                Ok(Some(BufReader::new(file)))
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::debug!("cache miss: {key}");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Write an entry from a byte stream, replacing any previous content
    ///
    /// The stream is first spooled to a hidden sibling file, which is then
    /// renamed over the entry, so readers never observe a partial write.
    /// Returns the number of bytes written.
    pub async fn set(&self, key: &CacheKey, mut value: impl AsyncRead + Unpin) -> Result<u64> {
        self.check_writable(key)?;
        let path = self.path(key);
        create_parent_dir(&path).await?;
        let partial = partial_path(&path);
        let written = async {
            let mut file = BufWriter::new(File::create(&partial).await?);
            let written = tokio::io::copy(&mut value, &mut file).await?;
            file.shutdown().await?;
            fs::rename(&partial, &path).await?;
            Ok::<_, std::io::Error>(written)
        }
        .await;
        match written {
            Ok(written) => {
                log::debug!("cached {written} bytes at {key}");
                Ok(written)
            }
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&partial).await {
                    log::debug!("could not remove partial write {}: {cleanup}", partial.display());
                }
                Err(e.into())
            }
        }
    }

    /// Open an entry for repeated appends
    ///
    /// The entry is created if needed and truncated otherwise: a handle
    /// always starts from an empty entry, and accumulates everything that is
    /// appended to it until it is [closed](AppendHandle::close).
    pub async fn open_for_append(&self, key: &CacheKey) -> Result<AppendHandle> {
        self.check_writable(key)?;
        let path = self.path(key);
        create_parent_dir(&path).await?;
        let file = File::create(&path).await?;
        log::debug!("opened {key} for appending");
        Ok(AppendHandle {
            key: key.clone(),
            writer: BufWriter::new(file),
            bytes_written: 0,
        })
    }

    /// Remove an entry, if it exists
    pub async fn delete(&self, key: &CacheKey) -> Result<()> {
        self.check_writable(key)?;
        match fs::remove_file(self.path(key)).await {
            Ok(()) => {
                log::debug!("deleted {key}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Fail fast if this cache is read-only
    fn check_writable(&self, key: &CacheKey) -> Result<()> {
        if self.read_only {
            Err(Error::ReadOnly {
                key: key.to_string().into(),
            })
        } else {
            Ok(())
        }
    }
}

/// Writable handle to a cache entry that is being accumulated
///
/// Must be explicitly [closed](Self::close) so that buffered data reaches
/// the disk. Dropping a handle without closing it may lose buffered data,
/// which is acceptable for intermediates that a later run rewrites anyway.
#[derive(Debug)]
pub struct AppendHandle {
    /// Entry being written
    key: CacheKey,

    /// Buffered writer to the entry's file
    writer: BufWriter<File>,

    /// Number of bytes appended so far
    bytes_written: u64,
}
//
impl AppendHandle {
    /// Entry being written
    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    /// Number of bytes appended so far
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Append some bytes to the entry
    pub async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes).await?;
        self.bytes_written += bytes.len() as u64;
        Ok(())
    }

    /// Flush everything to disk and release the file
    pub async fn close(mut self) -> Result<()> {
        self.writer.shutdown().await?;
        log::debug!("closed {} after writing {} bytes", self.key, self.bytes_written);
        Ok(())
    }
}

/// Create the directory that will hold a file
async fn create_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    Ok(())
}

/// Hidden sibling of a file, used to spool writes before renaming
fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.partial"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    fn key(segments: &[&str]) -> CacheKey {
        CacheKey::new(segments.iter().copied()).unwrap()
    }

    async fn read_entry(cache: &Cache, key: &CacheKey) -> Option<Vec<u8>> {
        let mut reader = cache.get(key).await.unwrap()?;
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes).await.unwrap();
        Some(bytes)
    }

    #[tokio::test]
    async fn missing_key_is_absent() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        let key = key(&["a", "b"]);
        assert!(cache.get(&key).await.unwrap().is_none());
        assert!(!cache.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn directories_are_not_entries() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        cache.set(&key(&["a", "b"]), &b"test"[..]).await.unwrap();
        let parent = key(&["a"]);
        assert!(!cache.exists(&parent).await.unwrap());
        assert!(cache.get(&parent).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_then_get_returns_same_bytes() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        let key = key(&["a", "b"]);
        let written = cache.set(&key, &b"test"[..]).await.unwrap();
        assert_eq!(written, 4);
        assert!(cache.exists(&key).await.unwrap());
        assert_eq!(read_entry(&cache, &key).await.unwrap(), b"test");
        assert!(dir.path().join("a").join("b").is_file());
    }

    #[tokio::test]
    async fn empty_content_round_trips() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        let key = key(&["empty"]);
        cache.set(&key, &b""[..]).await.unwrap();
        assert_eq!(read_entry(&cache, &key).await.unwrap(), b"");
    }

    #[tokio::test]
    async fn set_twice_replaces_content() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        let key = key(&["a", "b"]);
        cache.set(&key, &b"test"[..]).await.unwrap();
        cache.set(&key, &b"test2"[..]).await.unwrap();
        assert_eq!(read_entry(&cache, &key).await.unwrap(), b"test2");

        // No spooling leftovers
        let leftovers = std::fs::read_dir(dir.path().join("a"))
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().ends_with(".partial"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn read_only_cache_refuses_mutations() {
        let dir = TempDir::new().unwrap();
        let key = key(&["a", "b"]);
        Cache::new(dir.path()).set(&key, &b"test"[..]).await.unwrap();

        let cache = Cache::read_only(dir.path());
        assert!(cache.is_read_only());
        assert!(matches!(
            cache.set(&key, &b"other"[..]).await,
            Err(Error::ReadOnly { .. })
        ));
        assert!(matches!(
            cache.open_for_append(&key).await,
            Err(Error::ReadOnly { .. })
        ));
        assert!(matches!(cache.delete(&key).await, Err(Error::ReadOnly { .. })));

        // Reads still work, and nothing was modified
        assert_eq!(read_entry(&cache, &key).await.unwrap(), b"test");
    }

    #[tokio::test]
    async fn append_handle_accumulates_and_truncates_on_reopen() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        let key = key(&["shards", "example.com.nq"]);

        let mut handle = cache.open_for_append(&key).await.unwrap();
        handle.append(b"one\n").await.unwrap();
        handle.append(b"two\n").await.unwrap();
        assert_eq!(handle.bytes_written(), 8);
        handle.close().await.unwrap();
        assert_eq!(read_entry(&cache, &key).await.unwrap(), b"one\ntwo\n");

        let mut handle = cache.open_for_append(&key).await.unwrap();
        handle.append(b"three\n").await.unwrap();
        handle.close().await.unwrap();
        assert_eq!(read_entry(&cache, &key).await.unwrap(), b"three\n");
    }

    #[tokio::test]
    async fn delete_removes_entry_and_tolerates_absence() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::new(dir.path());
        let key = key(&["a"]);
        cache.set(&key, &b"x"[..]).await.unwrap();
        cache.delete(&key).await.unwrap();
        assert!(!cache.exists(&key).await.unwrap());
        cache.delete(&key).await.unwrap();
    }

    #[test]
    fn keys_reject_unsafe_segments() {
        assert!(CacheKey::new(Vec::<&str>::new()).is_err());
        for bad in ["", ".", "..", "a/b", "a\\b", "a\0b"] {
            assert!(
                matches!(CacheKey::new(["ok", bad]), Err(Error::InvalidKey(_))),
                "{bad:?} should be rejected"
            );
        }
        assert!(CacheKey::new(["..."]).is_ok());
    }

    #[test]
    fn suffix_applies_to_last_segment() {
        let key = key(&["http", "example.com", "index.html"]);
        assert_eq!(key.compressed().to_string(), "http/example.com/index.html.br");
        assert_eq!(key.child("x").unwrap().segments().len(), 4);
        assert_ne!(key, key.compressed());
    }
}
