//! Platform-specific raw device I/O
//!
//! Provides direct access bypassing the OS page cache:
//! - Linux: O_DIRECT flag
//! - macOS: F_NOCACHE fcntl
//!
//! Direct mode is optional so the engine can run on filesystems (tmpfs) that
//! reject O_DIRECT. All I/O is positional; one handle is shared by every
//! device worker.

use cyprestore_common::{Error, Result};
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

#[cfg(target_os = "linux")]
use std::os::unix::fs::OpenOptionsExt;

/// Alignment requirement for direct I/O
pub const ALIGNMENT: usize = 4096;

/// Raw file or block device handle
#[derive(Debug)]
pub struct RawFile {
    file: File,
    path: String,
    size: u64,
    direct_io: bool,
}

impl RawFile {
    /// Open a device, or create a backing file of `size` bytes
    ///
    /// Existing regular files are kept and grown to `size` if shorter, so
    /// data written by a previous run survives a restart. For block devices
    /// `size` is ignored and the device size is used.
    pub fn create(path: impl AsRef<Path>, size: u64, direct_io: bool) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let is_block_device = Self::is_block_device(&path);

        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if !is_block_device {
            options.create(true).truncate(false);
        }
        Self::apply_direct(&mut options, direct_io);

        let file = options
            .open(&path)
            .map_err(|e| Error::Storage(format!("failed to create {path_str}: {e}")))?;
        Self::apply_nocache(&file, &path_str, direct_io)?;

        let actual_size = if is_block_device {
            Self::get_block_device_size(&file, &path_str)?
        } else {
            let current = file
                .metadata()
                .map_err(|e| Error::Storage(format!("failed to stat {path_str}: {e}")))?
                .len();
            if current < size {
                file.set_len(size).map_err(|e| {
                    Error::Storage(format!("failed to set size for {path_str}: {e}"))
                })?;
            }
            current.max(size)
        };

        Ok(Self {
            file,
            path: path_str,
            size: actual_size,
            direct_io,
        })
    }

    #[cfg(target_os = "linux")]
    fn apply_direct(options: &mut OpenOptions, direct_io: bool) {
        if direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
    }

    #[cfg(not(target_os = "linux"))]
    fn apply_direct(_options: &mut OpenOptions, _direct_io: bool) {}

    #[cfg(target_os = "macos")]
    #[allow(unsafe_code)]
    fn apply_nocache(file: &File, path: &str, direct_io: bool) -> Result<()> {
        use std::os::unix::io::AsRawFd;
        if !direct_io {
            return Ok(());
        }
        // SAFETY: fd is owned by `file` and valid for the call.
        if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_NOCACHE, 1) } == -1 {
            return Err(Error::Storage(format!(
                "failed to set F_NOCACHE on {path}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    #[cfg(not(target_os = "macos"))]
    #[allow(clippy::unnecessary_wraps)]
    fn apply_nocache(_file: &File, _path: &str, _direct_io: bool) -> Result<()> {
        Ok(())
    }

    fn is_block_device(path: impl AsRef<Path>) -> bool {
        use std::os::unix::fs::FileTypeExt;
        // A missing path will be created as a regular file.
        std::fs::metadata(path).is_ok_and(|m| m.file_type().is_block_device())
    }

    #[cfg(target_os = "linux")]
    #[allow(unsafe_code)]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::os::unix::io::AsRawFd;

        const BLKGETSIZE64: libc::c_ulong = 0x8008_1272;

        let mut size: u64 = 0;
        // SAFETY: BLKGETSIZE64 writes a single u64 into `size`.
        let ret = unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut size) };
        if ret == -1 {
            return Err(Error::Storage(format!(
                "failed to get block device size for {path}: {}",
                std::io::Error::last_os_error()
            )));
        }
        Ok(size)
    }

    #[cfg(not(target_os = "linux"))]
    fn get_block_device_size(file: &File, path: &str) -> Result<u64> {
        use std::io::{Seek, SeekFrom};
        let mut f = file;
        f.seek(SeekFrom::End(0))
            .map_err(|e| Error::Storage(format!("failed to get device size for {path}: {e}")))
    }

    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub const fn direct_io(&self) -> bool {
        self.direct_io
    }

    /// Fill `buf` from `offset`
    ///
    /// In direct mode offset, length and buffer address must be aligned to
    /// [`ALIGNMENT`].
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::Storage(format!("read failed on {} at {offset}: {e}", self.path)))
    }

    /// Write all of `buf` at `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_range(offset, buf.len())?;
        self.file
            .write_all_at(buf, offset)
            .map_err(|e| Error::Storage(format!("write failed on {} at {offset}: {e}", self.path)))
    }

    /// Sync data only
    pub fn sync_data(&self) -> Result<()> {
        self.file
            .sync_data()
            .map_err(|e| Error::Storage(format!("sync_data failed on {}: {e}", self.path)))
    }

    fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        if offset + len as u64 > self.size {
            return Err(Error::invalid_argument(format!(
                "range {offset}+{len} beyond end of {} ({} bytes)",
                self.path, self.size
            )));
        }
        if self.direct_io {
            if offset % ALIGNMENT as u64 != 0 {
                return Err(Error::invalid_argument(format!(
                    "offset {offset} is not aligned to {ALIGNMENT}"
                )));
            }
            if len % ALIGNMENT != 0 {
                return Err(Error::invalid_argument(format!(
                    "size {len} is not aligned to {ALIGNMENT}"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_write_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.img");

        {
            let file = RawFile::create(&path, 8192, false).unwrap();
            assert_eq!(file.size(), 8192);
            let mut buf = vec![0u8; 4096];
            buf[..17].copy_from_slice(b"test data pattern");
            file.write_at(4096, &buf).unwrap();
            file.sync_data().unwrap();
        }

        let file = RawFile::create(&path, 8192, false).unwrap();
        let mut buf = vec![0u8; 4096];
        file.read_at(4096, &mut buf).unwrap();
        assert!(buf.starts_with(b"test data pattern"));
    }

    #[test]
    fn test_create_preserves_existing_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.img");
        RawFile::create(&path, 8192, false)
            .unwrap()
            .write_at(0, &[9u8; 4096])
            .unwrap();

        let file = RawFile::create(&path, 16384, false).unwrap();
        assert_eq!(file.size(), 16384);
        let mut buf = vec![0u8; 4096];
        file.read_at(0, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 9));
    }

    #[test]
    fn test_rejects_out_of_range() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev.img");
        let file = RawFile::create(&path, 8192, false).unwrap();
        assert!(matches!(
            file.write_at(8192, &[0u8; 1]),
            Err(Error::InvalidArgument(_))
        ));
        let mut buf = [0u8; 4096];
        assert!(matches!(
            file.read_at(6144, &mut buf),
            Err(Error::InvalidArgument(_))
        ));
    }
}
