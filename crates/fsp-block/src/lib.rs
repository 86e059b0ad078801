#![forbid(unsafe_code)]
//! Block I/O layer.
//!
//! Provides the byte- and block-addressed device traits the observer reads
//! metadata through, file and in-memory backings, and the request
//! interposition layer (`request` module) that lets a hook inspect, veto
//! and complete every storage request.

pub mod request;

pub use request::{
    BlockRequest, InterposedDevice, PassThrough, RequestBlock, RequestCompletion, RequestHook,
    RequestId, RequestStatus, Submission, Verdict,
};

use fsp_error::{FspError, Result};
use fsp_types::BlockNumber;
use parking_lot::RwLock;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

/// Owned block buffer.
///
/// Invariant: length == device block size for the originating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Vec<u8>,
}

impl BlockBuf {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }
}

/// Byte-addressed device for fixed-offset I/O (pread/pwrite semantics).
pub trait ByteDevice: Send + Sync {
    fn len_bytes(&self) -> u64;

    /// Read exactly `buf.len()` bytes from `offset` into `buf`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Write all bytes in `buf` to `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()>;

    fn sync(&self) -> Result<()>;
}

fn checked_range(offset: u64, len: usize, device_len: u64, op: &str) -> Result<u64> {
    let end = offset
        .checked_add(
            u64::try_from(len)
                .map_err(|_| FspError::Format(format!("{op} length overflows u64")))?,
        )
        .ok_or_else(|| FspError::Format(format!("{op} range overflows u64")))?;
    if end > device_len {
        return Err(FspError::Format(format!(
            "{op} out of bounds: offset={offset} len={len} device_len={device_len}"
        )));
    }
    Ok(end)
}

/// File-backed byte device.
#[derive(Debug, Clone)]
pub struct FileByteDevice {
    file: Arc<File>,
    len: u64,
    writable: bool,
}

impl FileByteDevice {
    /// Open read-write if permitted, read-only otherwise.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            writable,
        })
    }
}

impl ByteDevice for FileByteDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.len, "read")?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(FspError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "device opened read-only",
            )));
        }
        checked_range(offset, buf.len(), self.len, "write")?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// In-memory byte device.
///
/// Cloning shares the underlying buffer, so a test can keep a handle to
/// inspect what an interposed device wrote.
#[derive(Debug, Clone, Default)]
pub struct MemByteDevice {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl MemByteDevice {
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self::from_vec(vec![0_u8; len])
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Copy of the current contents.
    #[must_use]
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl ByteDevice for MemByteDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.read().len()).unwrap_or(0)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let bytes = self.bytes.read();
        let device_len = u64::try_from(bytes.len()).unwrap_or(0);
        let end = checked_range(offset, buf.len(), device_len, "read")?;
        let (start, end) = (usize::try_from(offset), usize::try_from(end));
        let (Ok(start), Ok(end)) = (start, end) else {
            return Err(FspError::Format("offset overflow".to_owned()));
        };
        buf.copy_from_slice(&bytes[start..end]);
        drop(bytes);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<()> {
        let mut bytes = self.bytes.write();
        let device_len = u64::try_from(bytes.len()).unwrap_or(0);
        let end = checked_range(offset, buf.len(), device_len, "write")?;
        let (start, end) = (usize::try_from(offset), usize::try_from(end));
        let (Ok(start), Ok(end)) = (start, end) else {
            return Err(FspError::Format("offset overflow".to_owned()));
        };
        bytes[start..end].copy_from_slice(buf);
        drop(bytes);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block-addressed I/O interface.
pub trait BlockDevice: Send + Sync {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf>;

    /// Write a block by number. `data.len()` MUST equal `block_size()`.
    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()>;

    fn block_size(&self) -> u32;

    fn block_count(&self) -> u64;

    fn sync(&self) -> Result<()>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for Arc<T> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        (**self).read_block(block)
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        (**self).write_block(block, data)
    }

    fn block_size(&self) -> u32 {
        (**self).block_size()
    }

    fn block_count(&self) -> u64 {
        (**self).block_count()
    }

    fn sync(&self) -> Result<()> {
        (**self).sync()
    }
}

/// Adapts a `ByteDevice` to fixed-size blocks.
///
/// A trailing partial block is ignored rather than rejected; filesystem
/// images are not always a whole number of blocks long.
#[derive(Debug)]
pub struct ByteBlockDevice<D: ByteDevice> {
    inner: D,
    block_size: u32,
    block_count: u64,
}

impl<D: ByteDevice> ByteBlockDevice<D> {
    pub fn new(inner: D, block_size: u32) -> Result<Self> {
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(FspError::Format(format!(
                "invalid block_size={block_size} (must be power of two)"
            )));
        }
        let block_count = inner.len_bytes() / u64::from(block_size);
        Ok(Self {
            inner,
            block_size,
            block_count,
        })
    }

    #[must_use]
    pub fn inner(&self) -> &D {
        &self.inner
    }

    fn offset_of(&self, block: BlockNumber) -> Result<u64> {
        if block.0 >= self.block_count {
            return Err(FspError::Format(format!(
                "block out of range: block={} block_count={}",
                block.0, self.block_count
            )));
        }
        block
            .0
            .checked_mul(u64::from(self.block_size))
            .ok_or_else(|| FspError::Format("block offset overflow".to_owned()))
    }
}

impl<D: ByteDevice> BlockDevice for ByteBlockDevice<D> {
    fn read_block(&self, block: BlockNumber) -> Result<BlockBuf> {
        let offset = self.offset_of(block)?;
        let len = usize::try_from(self.block_size)
            .map_err(|_| FspError::Format("block_size does not fit usize".to_owned()))?;
        let mut buf = vec![0_u8; len];
        self.inner.read_exact_at(offset, &mut buf)?;
        Ok(BlockBuf::new(buf))
    }

    fn write_block(&self, block: BlockNumber, data: &[u8]) -> Result<()> {
        let expected = usize::try_from(self.block_size)
            .map_err(|_| FspError::Format("block_size does not fit usize".to_owned()))?;
        if data.len() != expected {
            return Err(FspError::Format(format!(
                "write_block data size mismatch: got={} expected={expected}",
                data.len()
            )));
        }
        let offset = self.offset_of(block)?;
        self.inner.write_all_at(offset, data)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }
}

/// Read `len` bytes at `offset`, used for superblock regions before the
/// block size is known.
pub fn read_region(dev: &dyn ByteDevice, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0_u8; len];
    dev.read_exact_at(offset, &mut buf)?;
    Ok(buf)
}
