//! A thin host-backed file layer. Program images and data files are
//! registered with the kernel up front; user programs see them through a
//! small read-only file API plus a handful of directory operations. File
//! descriptors 0 through 2 are wired to the console.

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::config::MAX_FILES;
use crate::error::{KernelError, KernelResult};

pub const SEEK_SET: u64 = 0;
pub const SEEK_CUR: u64 = 1;
pub const SEEK_END: u64 = 2;

/// The host-provided file tree. Regular files are immutable byte images
/// shared by reference; directories are tracked as a plain path set.
pub struct HostFs {
    files: BTreeMap<String, Arc<Vec<u8>>>,
    dirs: BTreeSet<String>,
}

impl HostFs {
    pub fn new() -> HostFs {
        let mut dirs = BTreeSet::new();
        dirs.insert(String::from("/"));
        HostFs { files: BTreeMap::new(), dirs }
    }

    /// Register a file, creating parent directories along the way.
    pub fn register(&mut self, path: &str, bytes: Vec<u8>) {
        let path = normalize("/", path);
        let mut prefix = String::from("/");
        for part in path.trim_start_matches('/').split('/') {
            let full = join(&prefix, part);
            if full != path {
                self.dirs.insert(full.clone());
            }
            prefix = full;
        }
        self.files.insert(path, Arc::new(bytes));
    }

    pub fn open(&self, path: &str) -> Option<Arc<Vec<u8>>> {
        self.files.get(path).cloned()
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.dirs.contains(path)
    }

    pub fn mkdir(&mut self, path: &str) -> KernelResult<()> {
        let parent = parent_of(path);
        if !self.dirs.contains(&parent) {
            return Err(KernelError::NoSuchFile);
        }
        self.dirs.insert(String::from(path));
        Ok(())
    }

    /// Give an existing file a second name.
    pub fn link(&mut self, from: &str, to: &str) -> KernelResult<()> {
        let data = self.files.get(from).cloned().ok_or(KernelError::NoSuchFile)?;
        self.files.insert(String::from(to), data);
        Ok(())
    }

    pub fn unlink(&mut self, path: &str) -> KernelResult<()> {
        self.files.remove(path).map(|_| ()).ok_or(KernelError::NoSuchFile)
    }

    /// Direct children of a directory, files and subdirectories alike.
    pub fn list(&self, dir: &str) -> KernelResult<Vec<String>> {
        if !self.dirs.contains(dir) {
            return Err(KernelError::NoSuchFile);
        }
        let mut names = BTreeSet::new();
        for path in self.files.keys().chain(self.dirs.iter()) {
            if path == dir {
                continue;
            }
            if let Some(rest) = strip_dir(path, dir) {
                if let Some(first) = rest.split('/').next() {
                    names.insert(String::from(first));
                }
            }
        }
        Ok(names.into_iter().collect())
    }
}

impl Default for HostFs {
    fn default() -> HostFs {
        HostFs::new()
    }
}

fn strip_dir<'a>(path: &'a str, dir: &str) -> Option<&'a str> {
    if dir == "/" {
        return Some(path.strip_prefix('/')?);
    }
    path.strip_prefix(dir)?.strip_prefix('/')
}

fn parent_of(path: &str) -> String {
    match path.rfind('/') {
        Some(0) | None => String::from("/"),
        Some(idx) => String::from(&path[..idx]),
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir == "/" {
        let mut s = String::from("/");
        s.push_str(name);
        s
    } else {
        let mut s = String::from(dir);
        s.push('/');
        s.push_str(name);
        s
    }
}

/// Resolve a possibly relative path against a working directory, folding
/// away `.` and `..` components.
pub fn normalize(cwd: &str, path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    let base = if path.starts_with('/') { "" } else { cwd };
    for part in base.split('/').chain(path.split('/')) {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return String::from("/");
    }
    let mut out = String::new();
    for part in parts {
        out.push('/');
        out.push_str(part);
    }
    out
}

/// One open descriptor. Host files share the image bytes and keep a
/// private cursor; directory handles snapshot the listing at open time.
#[derive(Clone)]
pub enum OpenFile {
    Console,
    Host { data: Arc<Vec<u8>>, offset: usize },
    Dir { entries: Arc<Vec<String>>, pos: usize },
}

/// The per-process descriptor table. Cloned wholesale on fork, so parent
/// and child share image bytes but not cursors.
#[derive(Clone)]
pub struct FileTable {
    files: Vec<Option<OpenFile>>,
}

impl FileTable {
    pub fn new() -> FileTable {
        let mut files = Vec::with_capacity(MAX_FILES);
        for _ in 0..3 {
            files.push(Some(OpenFile::Console));
        }
        FileTable { files }
    }

    fn slot(&mut self) -> KernelResult<usize> {
        if let Some(idx) = self.files.iter().position(|f| f.is_none()) {
            return Ok(idx);
        }
        if self.files.len() >= MAX_FILES {
            return Err(KernelError::TooManyFiles);
        }
        self.files.push(None);
        Ok(self.files.len() - 1)
    }

    pub fn open_host(&mut self, data: Arc<Vec<u8>>) -> KernelResult<u64> {
        let idx = self.slot()?;
        self.files[idx] = Some(OpenFile::Host { data, offset: 0 });
        Ok(idx as u64)
    }

    pub fn open_dir(&mut self, entries: Vec<String>) -> KernelResult<u64> {
        let idx = self.slot()?;
        self.files[idx] = Some(OpenFile::Dir { entries: Arc::new(entries), pos: 0 });
        Ok(idx as u64)
    }

    fn get_mut(&mut self, fd: u64) -> KernelResult<&mut OpenFile> {
        self.files
            .get_mut(fd as usize)
            .and_then(|f| f.as_mut())
            .ok_or(KernelError::BadFileDescriptor)
    }

    /// Read from the descriptor's cursor into a kernel buffer. Console
    /// descriptors have nothing to read in this machine.
    pub fn read(&mut self, fd: u64, buf: &mut [u8]) -> KernelResult<usize> {
        match self.get_mut(fd)? {
            OpenFile::Host { data, offset } => {
                let avail = data.len().saturating_sub(*offset);
                let n = avail.min(buf.len());
                buf[..n].copy_from_slice(&data[*offset..*offset + n]);
                *offset += n;
                Ok(n)
            }
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// One directory entry per call; `None` once the listing is done.
    pub fn read_dir(&mut self, fd: u64) -> KernelResult<Option<String>> {
        match self.get_mut(fd)? {
            OpenFile::Dir { entries, pos } => {
                let name = entries.get(*pos).cloned();
                if name.is_some() {
                    *pos += 1;
                }
                Ok(name)
            }
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    pub fn lseek(&mut self, fd: u64, offset: i64, whence: u64) -> KernelResult<u64> {
        match self.get_mut(fd)? {
            OpenFile::Host { data, offset: cursor } => {
                let base = match whence {
                    SEEK_SET => 0i64,
                    SEEK_CUR => *cursor as i64,
                    SEEK_END => data.len() as i64,
                    _ => return Err(KernelError::BadFileDescriptor),
                };
                let target = base + offset;
                if target < 0 {
                    return Err(KernelError::BadFileDescriptor);
                }
                *cursor = target as usize;
                Ok(target as u64)
            }
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    /// Size of the open file, for `stat`.
    pub fn size(&mut self, fd: u64) -> KernelResult<u64> {
        match self.get_mut(fd)? {
            OpenFile::Host { data, .. } => Ok(data.len() as u64),
            _ => Err(KernelError::BadFileDescriptor),
        }
    }

    pub fn is_console(&mut self, fd: u64) -> KernelResult<bool> {
        Ok(matches!(self.get_mut(fd)?, OpenFile::Console))
    }

    pub fn close(&mut self, fd: u64) -> KernelResult<()> {
        let fd = fd as usize;
        // the console descriptors stay put
        if fd < 3 {
            return Err(KernelError::BadFileDescriptor);
        }
        match self.files.get_mut(fd) {
            Some(slot @ Some(_)) => {
                *slot = None;
                Ok(())
            }
            _ => Err(KernelError::BadFileDescriptor),
        }
    }
}

impl Default for FileTable {
    fn default() -> FileTable {
        FileTable::new()
    }
}
