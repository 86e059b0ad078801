#![forbid(unsafe_code)]
//! Synthetic images, journal block builders and workloads for exercising
//! the observer end to end.

pub mod blocks;
pub mod image;
pub mod script;
pub mod workload;

pub use image::{BLOCK_SIZE, SyntheticImage, ext3_image, ext3_inode_block, jfs_image, reiserfs_image};
pub use script::{BlockContent, ScriptedRequest, load_request_script, parse_request_script};
pub use workload::{Transaction, TransactionWorkload};

use fsp_block::{
    BlockRequest, ByteBlockDevice, ByteDevice, InterposedDevice, MemByteDevice, RequestCompletion,
};
use fsp_core::{Observer, ObserverConfig, RegistrySummary};
use fsp_error::Result;
use fsp_types::BlockSize;
use std::sync::Arc;

pub type ObservedDevice = InterposedDevice<ByteBlockDevice<MemByteDevice>, Observer>;

/// An in-memory image behind an observer hook.
///
/// Requests go through [`ObservedImage::run`]; the raw image stays
/// reachable for inspection and for the observer's own metadata reads.
#[derive(Debug)]
pub struct ObservedImage {
    mem: MemByteDevice,
    device: ObservedDevice,
}

impl ObservedImage {
    pub fn new(image: SyntheticImage, config: ObserverConfig) -> Result<Self> {
        Self::from_bytes(image.bytes, BlockSize::DEFAULT, config)
    }

    /// Observe an arbitrary image held in memory.
    pub fn from_bytes(bytes: Vec<u8>, block_size: BlockSize, config: ObserverConfig) -> Result<Self> {
        let mem = MemByteDevice::from_vec(bytes);
        let device = InterposedDevice::new(
            ByteBlockDevice::new(mem.clone(), block_size.get())?,
            Arc::new(Observer::new(config)),
        )?;
        Ok(Self { mem, device })
    }

    /// Build the default image for the configured variant.
    pub fn for_config(config: ObserverConfig) -> Result<Self> {
        Self::new(SyntheticImage::for_variant(config.filesystem), config)
    }

    #[must_use]
    pub fn observer(&self) -> &Arc<Observer> {
        self.device.hook()
    }

    #[must_use]
    pub fn device(&self) -> &ObservedDevice {
        &self.device
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.device.block_size()
    }

    /// Shares storage with the observed device.
    #[must_use]
    pub fn raw(&self) -> &MemByteDevice {
        &self.mem
    }

    /// Current contents of one block, read past the observer.
    #[must_use]
    pub fn raw_block(&self, block: u64) -> Vec<u8> {
        let bs = self.block_size().as_usize();
        let start = usize::try_from(block).unwrap_or(usize::MAX).saturating_mul(bs);
        self.mem
            .snapshot()
            .get(start..start.saturating_add(bs))
            .map(<[u8]>::to_vec)
            .unwrap_or_default()
    }

    pub fn start(&self) -> Result<RegistrySummary> {
        let raw: Arc<dyn ByteDevice> = Arc::new(self.mem.clone());
        self.observer().start(raw)
    }

    pub fn run(&self, requests: Vec<BlockRequest>) -> Vec<RequestCompletion> {
        self.device.submit_batch(requests)
    }

    pub fn run_one(&self, request: BlockRequest) -> RequestCompletion {
        self.device.execute(request)
    }

    /// A workload positioned at the start of the observed log.
    pub fn workload(&self) -> Result<TransactionWorkload> {
        let instance = self.observer().instance()?;
        Ok(TransactionWorkload::for_registry(instance.registry()))
    }
}
