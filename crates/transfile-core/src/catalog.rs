//! In-memory file catalog.
//!
//! The catalog is built once at server startup: every `<key>.<ext>` file
//! directly under the catalog root is read into an exactly-sized buffer,
//! registered for zero-copy delivery and indexed by key. After the build the
//! catalog is immutable and can be shared across request handlers without
//! locking.
//!
//! Records are held behind `Arc`. A response that attaches a record's buffer
//! holds a [`FileView`] (another `Arc`), so a buffer is only deregistered and
//! freed once the catalog and every in-flight response have let go of it.

use crate::DEFAULT_EXTENSION;
use crate::error::CatalogError;
use crate::registry::{MemoryRegistrar, Registration, RegistrationKey};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// One catalog entry: a file's bytes and their registration.
pub struct FileRecord {
    key: String,
    // Declared before `buffer` so the region is deregistered before it is freed
    registration: Registration,
    buffer: Box<[u8]>,
}

impl FileRecord {
    fn new(
        key: String,
        buffer: Box<[u8]>,
        registrar: &Arc<dyn MemoryRegistrar>,
    ) -> Result<Self, CatalogError> {
        let registration = Registration::new(registrar, &buffer).map_err(|source| {
            CatalogError::Registration {
                key: key.clone(),
                source,
            }
        })?;

        Ok(Self {
            key,
            registration,
            buffer,
        })
    }

    /// Record key
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// File contents
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// File size in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether the file is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Registration key of the buffer
    #[must_use]
    pub fn registration_key(&self) -> RegistrationKey {
        self.registration.key()
    }
}

impl fmt::Debug for FileRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileRecord")
            .field("key", &self.key)
            .field("len", &self.buffer.len())
            .field("registration", &self.registration)
            .finish()
    }
}

/// Shared, read-only view of a catalog record.
///
/// Cloning a view clones an `Arc`, never the bytes. The view keeps the
/// record (and its registration) alive even if the catalog is torn down
/// while a response is still being written.
#[derive(Clone)]
pub struct FileView {
    record: Arc<FileRecord>,
}

impl FileView {
    /// Key of the viewed record
    #[must_use]
    pub fn key(&self) -> &str {
        self.record.key()
    }

    /// Viewed bytes
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        self.record.bytes()
    }

    /// Length of the viewed bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.record.len()
    }

    /// Whether the view is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.record.is_empty()
    }

    /// Registration key the transport uses for a direct write
    #[must_use]
    pub fn registration_key(&self) -> RegistrationKey {
        self.record.registration_key()
    }

    /// Whether the bytes may be written in place instead of copied
    #[must_use]
    pub fn zero_copy(&self) -> bool {
        self.record.registration.zero_copy()
    }
}

impl AsRef<[u8]> for FileView {
    fn as_ref(&self) -> &[u8] {
        self.bytes()
    }
}

impl fmt::Debug for FileView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileView")
            .field("key", &self.key())
            .field("len", &self.len())
            .field("registration", &self.registration_key())
            .finish()
    }
}

/// Result of [`Catalog::teardown`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TeardownReport {
    /// Records deregistered and freed immediately
    pub released: usize,
    /// Records still referenced by an in-flight response; they are released
    /// when that response drops its view
    pub deferred: usize,
}

/// Sorted, immutable collection of registered file records.
#[derive(Debug)]
pub struct Catalog {
    records: Vec<Arc<FileRecord>>,
}

impl Catalog {
    /// Build a catalog from every `*.npcbuf` file directly under `dir`.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError` if the directory cannot be listed, a file
    /// cannot be read in full, a buffer cannot be registered, or two files
    /// map to the same key. Everything registered before the failure is
    /// released again.
    pub fn build(
        dir: impl AsRef<Path>,
        registrar: Arc<dyn MemoryRegistrar>,
    ) -> Result<Self, CatalogError> {
        Self::build_with_extension(dir, DEFAULT_EXTENSION, registrar)
    }

    /// Build a catalog from every `*.<extension>` file directly under `dir`.
    ///
    /// `extension` is given without the leading dot.
    ///
    /// # Errors
    ///
    /// See [`Catalog::build`].
    pub fn build_with_extension(
        dir: impl AsRef<Path>,
        extension: &str,
        registrar: Arc<dyn MemoryRegistrar>,
    ) -> Result<Self, CatalogError> {
        let dir = dir.as_ref();
        let directory_error = |source| CatalogError::Directory {
            path: dir.to_path_buf(),
            source,
        };

        let mut records = Vec::new();
        for entry in fs::read_dir(dir).map_err(directory_error)? {
            let path = entry.map_err(directory_error)?.path();

            let Some(key) = catalog_key(&path, extension) else {
                continue;
            };

            // Follows symlinks, like a regular-file check on the target
            let metadata = fs::metadata(&path).map_err(|source| CatalogError::Read {
                path: path.clone(),
                source,
            })?;
            if !metadata.is_file() {
                continue;
            }

            let buffer = read_exact_file(&path)?;
            debug!(key, size = buffer.len(), "loaded catalog file");
            records.push(FileRecord::new(key, buffer, &registrar)?);
        }

        let catalog = Self::assemble(records)?;
        info!(
            dir = %dir.display(),
            files = catalog.len(),
            bytes = catalog.total_bytes(),
            "catalog built"
        );
        Ok(catalog)
    }

    /// Build a catalog from in-memory `(key, bytes)` pairs.
    ///
    /// # Errors
    ///
    /// Returns `CatalogError::Registration` or `CatalogError::DuplicateKey`.
    pub fn from_parts<I, K, B>(
        parts: I,
        registrar: Arc<dyn MemoryRegistrar>,
    ) -> Result<Self, CatalogError>
    where
        I: IntoIterator<Item = (K, B)>,
        K: Into<String>,
        B: Into<Vec<u8>>,
    {
        let records = parts
            .into_iter()
            .map(|(key, bytes)| {
                FileRecord::new(key.into(), bytes.into().into_boxed_slice(), &registrar)
            })
            .collect::<Result<Vec<_>, _>>()?;

        Self::assemble(records)
    }

    fn assemble(mut records: Vec<FileRecord>) -> Result<Self, CatalogError> {
        // String ordering is byte-wise, which is what lookup relies on
        records.sort_unstable_by(|a, b| a.key.cmp(&b.key));

        if let Some(pair) = records.windows(2).find(|pair| pair[0].key == pair[1].key) {
            return Err(CatalogError::DuplicateKey(pair[0].key.clone()));
        }

        Ok(Self {
            records: records.into_iter().map(Arc::new).collect(),
        })
    }

    /// Index of the record whose key equals `key`.
    ///
    /// Lower-bound binary search followed by an exact-match check: a key
    /// that falls between two entries or past the end is not found.
    #[must_use]
    pub fn lookup(&self, key: &str) -> Option<usize> {
        let index = self
            .records
            .partition_point(|record| record.key.as_str() < key);

        self.records
            .get(index)
            .filter(|record| record.key == key)
            .map(|_| index)
    }

    /// Shared view of the record whose key equals `key`
    #[must_use]
    pub fn find(&self, key: &str) -> Option<FileView> {
        self.lookup(key).and_then(|index| self.get(index))
    }

    /// Shared view of the record at `index`
    #[must_use]
    pub fn get(&self, index: usize) -> Option<FileView> {
        self.records.get(index).map(|record| FileView {
            record: Arc::clone(record),
        })
    }

    /// Keys in ascending order
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.records.iter().map(|record| record.key())
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the catalog has no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Sum of all buffer sizes
    #[must_use]
    pub fn total_bytes(&self) -> u64 {
        self.records.iter().map(|record| record.len() as u64).sum()
    }

    /// Release every record held by the catalog.
    ///
    /// Must only be called once request serving has stopped. Records still
    /// referenced by an in-flight response are released when that response
    /// completes.
    pub fn teardown(self) -> TeardownReport {
        let mut report = TeardownReport::default();

        for record in self.records {
            match Arc::into_inner(record) {
                Some(record) => {
                    drop(record);
                    report.released += 1;
                }
                None => report.deferred += 1,
            }
        }

        if report.deferred > 0 {
            warn!(
                released = report.released,
                deferred = report.deferred,
                "catalog torn down with responses in flight"
            );
        } else {
            info!(released = report.released, "catalog torn down");
        }
        report
    }
}

/// Key for `path` if its extension is `extension`.
fn catalog_key(path: &Path, extension: &str) -> Option<String> {
    if path.extension()? != extension {
        return None;
    }

    match path.file_stem()?.to_str() {
        Some(stem) => Some(stem.to_owned()),
        None => {
            warn!(path = %path.display(), "skipping catalog file with non UTF-8 name");
            None
        }
    }
}

/// Read a whole file into a buffer sized to its reported length.
fn read_exact_file(path: &Path) -> Result<Box<[u8]>, CatalogError> {
    let read_error = |source| CatalogError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(read_error)?;
    let expected = file.metadata().map_err(read_error)?.len();
    let expected = usize::try_from(expected).map_err(|_| {
        read_error(io::Error::new(
            io::ErrorKind::InvalidData,
            "file does not fit in memory",
        ))
    })?;

    let mut buffer = vec![0u8; expected].into_boxed_slice();
    let mut filled = 0;
    while filled < expected {
        match file.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(read_error(err)),
        }
    }

    if filled != expected {
        return Err(CatalogError::ShortRead {
            path: PathBuf::from(path),
            expected,
            actual: filled,
        });
    }

    Ok(buffer)
}
