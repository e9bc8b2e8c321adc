//! Pluggable filesystem used by the static file server
//!
//! The HTTP engine only ever talks to [`Fs`], so embedded targets can back
//! it with a packed read-only image while hosted builds use [`StdFs`].

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::time::UNIX_EPOCH;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub size: u64,
    /// Modification time, seconds since the UNIX epoch
    pub mtime: u64,
    pub is_dir: bool,
}

pub trait FsFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn seek(&mut self, pos: u64) -> io::Result<()>;
}

pub trait Fs {
    fn stat(&self, path: &str) -> Option<FileStat>;
    fn open(&self, path: &str, write: bool) -> io::Result<Box<dyn FsFile>>;
    /// Invoke `cb` with the name of each directory entry
    fn list(&self, path: &str, cb: &mut dyn FnMut(&str));
}

/// The host filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct StdFs;

impl Fs for StdFs {
    fn stat(&self, path: &str) -> Option<FileStat> {
        let md = std::fs::metadata(path).ok()?;
        let mtime = md
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Some(FileStat {
            size: md.len(),
            mtime,
            is_dir: md.is_dir(),
        })
    }

    fn open(&self, path: &str, write: bool) -> io::Result<Box<dyn FsFile>> {
        let file = if write {
            File::options().write(true).create(true).truncate(true).open(path)?
        } else {
            File::open(path)?
        };
        Ok(Box::new(StdFile(file)))
    }

    fn list(&self, path: &str, cb: &mut dyn FnMut(&str)) {
        if let Ok(entries) = std::fs::read_dir(path) {
            for entry in entries.flatten() {
                if let Some(name) = entry.file_name().to_str() {
                    cb(name);
                }
            }
        }
    }
}

struct StdFile(File);

impl FsFile for StdFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.0.seek(SeekFrom::Start(pos)).map(|_| ())
    }
}
