use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
};

use nix::fcntl::{flock, FlockArg};

/// Append-mode file shared between processes, serialised with an advisory
/// lock around every write.
///
/// The status and connection dumps are assembled by the master and many
/// workers appending to one file; each row must land as a single unit.
pub struct LockedFile {
    path: PathBuf,
    file: File,
}

impl LockedFile {
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self { path, file })
    }

    /// Write `data` under LOCK_EX. The lock is dropped before returning.
    pub fn append(&mut self, data: &[u8]) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        flock(fd, FlockArg::LockExclusive).map_err(io::Error::from)?;
        let result = self.file.write_all(data).and_then(|()| self.file.flush());
        let _ = flock(fd, FlockArg::Unlock);
        result
    }

    /// Truncate the file to zero length, under the same lock.
    pub fn truncate(&mut self) -> io::Result<()> {
        let fd = self.file.as_raw_fd();
        flock(fd, FlockArg::LockExclusive).map_err(io::Error::from)?;
        let result = self.file.set_len(0);
        let _ = flock(fd, FlockArg::Unlock);
        result
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::LockedFile;

    #[test]
    fn append_then_truncate() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("status");

        let mut file = LockedFile::open(&path).expect("open");
        file.append(b"row one\n").expect("append");
        file.append(b"row two\n").expect("append");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "row one\nrow two\n");

        file.truncate().expect("truncate");
        assert_eq!(std::fs::read_to_string(&path).expect("read"), "");
    }

    #[test]
    fn two_handles_interleave_whole_lines() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("shared");

        let mut a = LockedFile::open(&path).expect("open a");
        let mut b = LockedFile::open(&path).expect("open b");
        a.append(b"a\n").expect("append a");
        b.append(b"b\n").expect("append b");
        a.append(b"a\n").expect("append a");

        assert_eq!(std::fs::read_to_string(&path).expect("read"), "a\nb\na\n");
    }
}
