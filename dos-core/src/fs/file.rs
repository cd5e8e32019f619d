//! Open file handles: host-backed (with optional copy-on-write) and
//! in-memory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use super::drive::{DosFile, OpenMode};
use crate::error::{DosError, DosResult};

/// A file on the host filesystem.
///
/// When opened with a copy-on-write target the handle reads the original
/// until the first write, then copies it to the target and continues
/// there at the same position.
pub struct HostFile {
    name: String,
    mode: OpenMode,
    file: File,
    copy_on_write: Option<PathBuf>,
}

impl HostFile {
    pub fn new(name: &str, file: File, mode: OpenMode) -> Self {
        Self {
            name: name.to_string(),
            mode,
            file,
            copy_on_write: None,
        }
    }

    /// Handle over a read-only original that moves to `target` on the
    /// first write.
    pub fn copy_on_write(name: &str, original: File, mode: OpenMode, target: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            mode,
            file: original,
            copy_on_write: Some(target),
        }
    }

    /// Whether writes still go to the original.
    pub fn is_pending_copy(&self) -> bool {
        self.copy_on_write.is_some()
    }

    fn promote(&mut self) -> DosResult<()> {
        let Some(target) = self.copy_on_write.take() else {
            return Ok(());
        };
        let pos = self.file.stream_position()?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut copy = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&target)
            .map_err(|e| DosError::from_host(e, &self.name))?;
        self.file.seek(SeekFrom::Start(0))?;
        io::copy(&mut self.file, &mut copy)?;
        copy.seek(SeekFrom::Start(pos))?;
        self.file = copy;
        debug!(file = %self.name, target = %target.display(), "copied file up for writing");
        Ok(())
    }
}

impl DosFile for HostFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> OpenMode {
        self.mode
    }

    fn read(&mut self, buf: &mut [u8]) -> DosResult<usize> {
        if !self.mode.can_read() {
            return Err(DosError::AccessDenied(self.name.clone()));
        }
        let mut total = 0;
        while total < buf.len() {
            match self.file.read(&mut buf[total..]) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn write(&mut self, data: &[u8]) -> DosResult<usize> {
        if !self.mode.can_write() {
            return Err(DosError::AccessDenied(self.name.clone()));
        }
        self.promote()?;
        if data.is_empty() {
            let pos = self.file.stream_position()?;
            self.file.set_len(pos)?;
            return Ok(0);
        }
        self.file.write_all(data)?;
        Ok(data.len())
    }

    fn seek(&mut self, pos: SeekFrom) -> DosResult<u64> {
        Ok(self.file.seek(pos)?)
    }

    fn size(&mut self) -> DosResult<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn flush(&mut self) -> DosResult<()> {
        Ok(self.file.flush()?)
    }
}

/// Read-only view of shared in-memory data.
pub struct VirtualFile {
    name: String,
    data: Arc<[u8]>,
    pos: u64,
}

impl VirtualFile {
    pub fn new(name: &str, data: Arc<[u8]>) -> Self {
        Self {
            name: name.to_string(),
            data,
            pos: 0,
        }
    }
}

impl DosFile for VirtualFile {
    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> OpenMode {
        OpenMode::Read
    }

    fn read(&mut self, buf: &mut [u8]) -> DosResult<usize> {
        let start = (self.pos as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn write(&mut self, _data: &[u8]) -> DosResult<usize> {
        Err(DosError::AccessDenied(self.name.clone()))
    }

    fn seek(&mut self, pos: SeekFrom) -> DosResult<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.pos.checked_add_signed(delta),
            SeekFrom::End(delta) => (self.data.len() as u64).checked_add_signed(delta),
        };
        match target {
            Some(target) => {
                self.pos = target;
                Ok(target)
            }
            None => Err(DosError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of file",
            ))),
        }
    }

    fn size(&mut self) -> DosResult<u64> {
        Ok(self.data.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_on_write_promotes_on_first_write() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("base.txt");
        let target = dir.path().join("upper").join("BASE.TXT");
        fs::write(&original, b"hello world").unwrap();

        let file = File::open(&original).unwrap();
        let mut handle = HostFile::copy_on_write("BASE.TXT", file, OpenMode::ReadWrite, target.clone());

        let mut buf = [0u8; 6];
        assert_eq!(handle.read(&mut buf).unwrap(), 6);
        assert!(handle.is_pending_copy());
        assert!(!target.exists());

        handle.write(b"DOS!!").unwrap();
        assert!(!handle.is_pending_copy());
        handle.flush().unwrap();

        assert_eq!(fs::read(&original).unwrap(), b"hello world");
        assert_eq!(fs::read(&target).unwrap(), b"hello DOS!!");
    }

    #[test]
    fn test_zero_length_write_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.txt");
        fs::write(&path, b"0123456789").unwrap();

        let file = OpenOptions::new().read(true).write(true).open(&path).unwrap();
        let mut handle = HostFile::new("T.TXT", file, OpenMode::ReadWrite);
        handle.seek(SeekFrom::Start(4)).unwrap();
        assert_eq!(handle.write(&[]).unwrap(), 0);
        assert_eq!(handle.size().unwrap(), 4);
    }

    #[test]
    fn test_mode_checks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("r.txt");
        fs::write(&path, b"data").unwrap();

        let mut handle = HostFile::new("R.TXT", File::open(&path).unwrap(), OpenMode::Read);
        assert!(matches!(handle.write(b"x"), Err(DosError::AccessDenied(_))));

        let mut handle = HostFile::new("R.TXT", File::open(&path).unwrap(), OpenMode::ReadNoModify);
        assert!(matches!(handle.write(b"x"), Err(DosError::AccessDenied(_))));
    }

    #[test]
    fn test_virtual_file_reads() {
        let data: Arc<[u8]> = Arc::from(&b"abcdef"[..]);
        let mut file = VirtualFile::new("A.TXT", data);

        let mut buf = [0u8; 4];
        assert_eq!(file.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(file.read(&mut buf).unwrap(), 2);
        assert_eq!(file.read(&mut buf).unwrap(), 0);

        file.seek(SeekFrom::Start(100)).unwrap();
        assert_eq!(file.read(&mut buf).unwrap(), 0);
        assert!(file.seek(SeekFrom::Current(-200)).is_err());
        assert!(matches!(file.write(b"x"), Err(DosError::AccessDenied(_))));
    }
}
