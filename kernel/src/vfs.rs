//! Per-process file tables.
//!
//! The narrow file surface the process lifecycle needs: an fd-indexed
//! table of shared open-file handles. Fork copies the table but shares
//! the handles; exec keeps the table; process destruction drops it.
//! Actual I/O lives behind this boundary and is not modeled.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::MAX_FILES;

/// Device path for the console, where stdio lands.
pub const CONSOLE: &str = "con:";

/// First descriptor handed out by `open`; 0..=2 are stdio.
pub const FIRST_USER_FD: u32 = 3;

/// File-table errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VfsError {
    /// The table already holds `MAX_FILES` handles.
    TooManyFiles,
    /// Operation on a descriptor with no handle.
    BadFd,
}

/// A shared open-file handle. Tables duplicated at fork hold clones of
/// the same `Arc`, the refcount-bump the original did by hand.
#[derive(Debug)]
pub struct OpenFile {
    pub path: String,
    pub flags: u32,
}

/// Descriptor-indexed table of open files.
pub struct FileTable {
    files: BTreeMap<u32, Arc<OpenFile>>,
}

impl FileTable {
    /// An empty table with no descriptors at all.
    pub fn new() -> Self {
        Self {
            files: BTreeMap::new(),
        }
    }

    /// A table with stdin, stdout, and stderr seeded on the console.
    pub fn new_stdio() -> Self {
        let mut table = Self::new();
        for fd in 0..FIRST_USER_FD {
            table.files.insert(
                fd,
                Arc::new(OpenFile {
                    path: CONSOLE.to_string(),
                    flags: 0,
                }),
            );
        }
        table
    }

    /// Independent table sharing the underlying handles. Closing a
    /// descriptor in one table does not affect the other.
    pub fn copy(&self) -> Self {
        Self {
            files: self.files.clone(),
        }
    }

    /// Install a new handle at the lowest free descriptor.
    pub fn open(&mut self, path: &str, flags: u32) -> Result<u32, VfsError> {
        if self.files.len() >= MAX_FILES {
            return Err(VfsError::TooManyFiles);
        }
        let fd = (FIRST_USER_FD..).find(|fd| !self.files.contains_key(fd)).unwrap();
        self.files.insert(
            fd,
            Arc::new(OpenFile {
                path: path.to_string(),
                flags,
            }),
        );
        Ok(fd)
    }

    /// Drop a descriptor's handle.
    pub fn close(&mut self, fd: u32) -> Result<(), VfsError> {
        self.files.remove(&fd).map(|_| ()).ok_or(VfsError::BadFd)
    }

    pub fn get(&self, fd: u32) -> Option<&Arc<OpenFile>> {
        self.files.get(&fd)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

impl Default for FileTable {
    fn default() -> Self {
        Self::new()
    }
}
