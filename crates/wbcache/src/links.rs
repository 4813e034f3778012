//! Durable writeback links: the on-disk record of pending writebacks.
//!
//! Every accepted writeback is recorded as a hard link next to the cached
//! object, so the bytes stay reachable even if the cache entry itself is
//! evicted, and pending work survives a restart. The link path encodes the
//! endpoint and reference and ends in a fixed suffix; scanning the cache
//! root at startup rebuilds the queue.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use crate::error::{WritebackError, WritebackResult};
use crate::location::{Endpoint, Location, Reference};

/// Suffix marking a writeback link.
pub const WRITEBACK_SUFFIX: &str = "_wbf";

/// Path schema for cached objects and their writeback links.
///
/// Objects live at `<root>/<endpoint>/<shard>/<reference>`, where `shard`
/// is the first two characters of the reference. The writeback link for an
/// object is the object path with [`WRITEBACK_SUFFIX`] appended.
#[derive(Debug, Clone)]
pub struct CacheLayout {
    root: PathBuf,
}

impl CacheLayout {
    /// A layout rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The cache root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard(reference: &Reference) -> &str {
        reference.as_str().get(..2).unwrap_or("00")
    }

    /// Cache file path for an object.
    pub fn object_path(&self, reference: &Reference, endpoint: &Endpoint) -> PathBuf {
        self.root
            .join(endpoint.to_string())
            .join(Self::shard(reference))
            .join(reference.as_str())
    }

    /// Writeback link path for an object.
    pub fn link_path(&self, reference: &Reference, endpoint: &Endpoint) -> PathBuf {
        let mut path = self.object_path(reference, endpoint).into_os_string();
        path.push(WRITEBACK_SUFFIX);
        PathBuf::from(path)
    }

    /// Write object bytes to the cache file, creating parent directories.
    ///
    /// This is the enclosing cache's write path; tests and recovery
    /// fixtures call it directly.
    pub fn write_object(
        &self,
        reference: &Reference,
        endpoint: &Endpoint,
        data: &[u8],
    ) -> io::Result<()> {
        let path = self.object_path(reference, endpoint);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, data)
    }

    /// Hard-link the cached object to its writeback link.
    ///
    /// Returns false if the link already exists: an identical writeback is
    /// pending and nothing more needs to happen.
    pub fn create_link(&self, reference: &Reference, endpoint: &Endpoint) -> WritebackResult<bool> {
        let object = self.object_path(reference, endpoint);
        let link = self.link_path(reference, endpoint);
        match fs::hard_link(object, link) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the writeback link. The cached object is untouched.
    pub fn remove_link(&self, reference: &Reference, endpoint: &Endpoint) -> io::Result<()> {
        fs::remove_file(self.link_path(reference, endpoint))
    }

    /// Read the object bytes through the link's backing file.
    pub fn read_back(&self, reference: &Reference, endpoint: &Endpoint) -> io::Result<Vec<u8>> {
        fs::read(self.link_path(reference, endpoint))
    }

    /// Parse a writeback link path back into the location it encodes.
    pub fn parse_link(&self, path: &Path) -> WritebackResult<Location> {
        let malformed = || WritebackError::MalformedLink {
            path: path.to_path_buf(),
        };
        let rel = path.strip_prefix(&self.root).map_err(|_| malformed())?;
        let components: Vec<&str> = rel
            .iter()
            .map(|c| c.to_str())
            .collect::<Option<_>>()
            .ok_or_else(malformed)?;
        let &[endpoint_str, _shard, file] = components.as_slice() else {
            return Err(malformed());
        };
        let reference = file.strip_suffix(WRITEBACK_SUFFIX).ok_or_else(malformed)?;
        if reference.is_empty() {
            return Err(malformed());
        }
        Ok(Location {
            reference: Reference::new(reference),
            endpoint: endpoint_str.parse()?,
        })
    }

    /// Scan the cache root for writeback links.
    ///
    /// Links that do not parse are logged and left in place for operator
    /// inspection. A root that does not exist yet scans as empty.
    pub fn scan(&self) -> WritebackResult<Vec<Location>> {
        let mut found = Vec::new();
        if !self.root.exists() {
            return Ok(found);
        }
        let mut dirs = vec![self.root.clone()];
        while let Some(dir) = dirs.pop() {
            for entry in fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if entry.file_type()?.is_dir() {
                    dirs.push(path);
                    continue;
                }
                let is_link = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.ends_with(WRITEBACK_SUFFIX));
                if !is_link {
                    continue;
                }
                match self.parse_link(&path) {
                    Ok(location) => found.push(location),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "skipping unparsable writeback link");
                    }
                }
            }
        }
        Ok(found)
    }
}
