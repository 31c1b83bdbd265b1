//! File-backed streams ring, one per worker, named `data<N>`.
//!
//! The owning worker creates its layout and is the ring's only reader; other
//! workers open the same file and write frames addressed to that worker.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use crate::buffer::AtomicBuffer;
use crate::error::{EngineError, Result};
use crate::ring::{ManyToOneRing, TRAILER_LENGTH};

/// Memory-mapped streams file wrapped in a [`ManyToOneRing`].
pub struct StreamsLayout {
    ring: Arc<ManyToOneRing>,
    path: PathBuf,
    // keeps the descriptor alive alongside the mapping
    _file: File,
    owns_file: bool,
}

impl StreamsLayout {
    /// Creates (or truncates) the streams file at `path` with `capacity` usable bytes.
    ///
    /// The file is created with permissions 0600 and removed again when the
    /// returned layout is dropped.
    pub fn create(path: &Path, capacity: usize) -> Result<Self> {
        if !capacity.is_power_of_two() {
            return Err(EngineError::InvalidCapacity { capacity });
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_permissions(std::fs::Permissions::from_mode(0o600))?;

        let len = capacity + TRAILER_LENGTH;
        file.set_len(len as u64)?;

        let ring = ManyToOneRing::new(AtomicBuffer::map_shared(&file, len)?)?;
        debug!(path = %path.display(), capacity, "created streams layout");

        Ok(Self {
            ring: Arc::new(ring),
            path: path.to_path_buf(),
            _file: file,
            owns_file: true,
        })
    }

    /// Attaches to an existing streams file; never creates it.
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len() as usize;
        if len <= TRAILER_LENGTH {
            return Err(EngineError::InvalidCapacity {
                capacity: len.saturating_sub(TRAILER_LENGTH),
            });
        }

        let ring = ManyToOneRing::new(AtomicBuffer::map_shared(&file, len)?)?;
        debug!(path = %path.display(), capacity = ring.capacity(), "opened streams layout");

        Ok(Self {
            ring: Arc::new(ring),
            path: path.to_path_buf(),
            _file: file,
            owns_file: false,
        })
    }

    /// The shared ring.
    pub fn ring(&self) -> &Arc<ManyToOneRing> {
        &self.ring
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Name used in diagnostics, the file name of the streams file.
    pub fn name(&self) -> String {
        self.path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    /// Whether dropping this layout removes the file.
    pub fn owns_file(&self) -> bool {
        self.owns_file
    }
}

impl Drop for StreamsLayout {
    fn drop(&mut self) {
        if self.owns_file {
            let _ = std::fs::remove_file(&self.path);
            debug!(path = %self.path.display(), "removed streams layout");
        }
    }
}

impl std::fmt::Debug for StreamsLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamsLayout")
            .field("path", &self.path)
            .field("owns_file", &self.owns_file)
            .field("ring", &self.ring)
            .finish()
    }
}
