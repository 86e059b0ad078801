//! Storage-request interposition.
//!
//! A [`BlockRequest`] covers a run of sectors in one direction. An
//! [`InterposedDevice`] hands every request to a [`RequestHook`] twice:
//! before it reaches the device (the hook may fail it outright) and after
//! the device finished (the hook may turn success into failure) and only
//! then notifies the caller's completion callback.

use crate::BlockDevice;
use fsp_error::{FspError, Result};
use fsp_types::{BlockNumber, BlockSize, Direction, SECTOR_SIZE, SectorNumber};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One storage request: a start sector, a direction and the payload.
///
/// For reads `data` is the destination buffer; its length sets how many
/// sectors are covered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockRequest {
    pub id: RequestId,
    pub sector: SectorNumber,
    pub direction: Direction,
    pub data: Vec<u8>,
}

/// A block-sized window into a request.
#[derive(Debug, Clone, Copy)]
pub struct RequestBlock<'a> {
    pub index: usize,
    pub sector: SectorNumber,
    pub bytes: &'a [u8],
}

impl BlockRequest {
    #[must_use]
    pub fn write(id: RequestId, sector: SectorNumber, data: Vec<u8>) -> Self {
        Self {
            id,
            sector,
            direction: Direction::Write,
            data,
        }
    }

    #[must_use]
    pub fn read(id: RequestId, sector: SectorNumber, len: usize) -> Self {
        Self {
            id,
            sector,
            direction: Direction::Read,
            data: vec![0_u8; len],
        }
    }

    #[must_use]
    pub fn sector_count(&self) -> u64 {
        u64::try_from(self.data.len())
            .unwrap_or(u64::MAX)
            .div_ceil(u64::from(SECTOR_SIZE))
    }

    /// Constituent blocks; a request shorter than one block still counts as one.
    #[must_use]
    pub fn block_count(&self, block_size: BlockSize) -> usize {
        self.data.len().div_ceil(block_size.as_usize()).max(1)
    }

    /// Split into block-sized windows; block `i` starts at
    /// `sector + i * sectors_per_block`.
    #[must_use]
    pub fn blocks(&self, block_size: BlockSize) -> Vec<RequestBlock<'_>> {
        let sector_at = |index: usize| {
            self.sector
                .nth_block(u64::try_from(index).unwrap_or(u64::MAX), block_size)
                .unwrap_or(SectorNumber(u64::MAX))
        };
        if self.data.is_empty() {
            return vec![RequestBlock {
                index: 0,
                sector: self.sector,
                bytes: &[],
            }];
        }
        self.data
            .chunks(block_size.as_usize())
            .enumerate()
            .map(|(index, bytes)| RequestBlock {
                index,
                sector: sector_at(index),
                bytes,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestStatus {
    Success,
    Failed(String),
}

impl RequestStatus {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// Decision taken before the request reaches the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Proceed,
    Fail(String),
}

#[derive(Debug)]
pub struct Submission<T> {
    pub ticket: T,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestCompletion {
    pub request: BlockRequest,
    pub status: RequestStatus,
}

impl RequestCompletion {
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Convert a failed completion into an error.
    pub fn into_result(self) -> Result<BlockRequest> {
        match self.status {
            RequestStatus::Success => Ok(self.request),
            RequestStatus::Failed(detail) => Err(FspError::RequestFailed {
                request: self.request.id.0,
                detail,
            }),
        }
    }
}

/// Observer of the submit/complete pair.
///
/// `on_complete` is called exactly once per `on_submit`, including when the
/// submit verdict failed the request before any I/O.
pub trait RequestHook: Send + Sync {
    /// State carried from submission to completion.
    type Ticket: Send;

    fn on_submit(&self, request: &BlockRequest) -> Submission<Self::Ticket>;

    /// Final say on the request's status before the caller is notified.
    fn on_complete(
        &self,
        ticket: Self::Ticket,
        request: &BlockRequest,
        status: RequestStatus,
    ) -> RequestStatus;
}

/// Hook that lets every request through untouched.
#[derive(Debug, Clone, Copy, Default)]
pub struct PassThrough;

impl RequestHook for PassThrough {
    type Ticket = ();

    fn on_submit(&self, _request: &BlockRequest) -> Submission<()> {
        Submission {
            ticket: (),
            verdict: Verdict::Proceed,
        }
    }

    fn on_complete(&self, (): (), _request: &BlockRequest, status: RequestStatus) -> RequestStatus {
        status
    }
}

/// A block device with a hook spliced into its request path.
pub struct InterposedDevice<D: BlockDevice, H: RequestHook> {
    device: D,
    hook: Arc<H>,
    block_size: BlockSize,
}

impl<D: BlockDevice, H: RequestHook> std::fmt::Debug for InterposedDevice<D, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterposedDevice")
            .field("block_size", &self.block_size)
            .field("block_count", &self.device.block_count())
            .finish_non_exhaustive()
    }
}

impl<D: BlockDevice, H: RequestHook> InterposedDevice<D, H> {
    pub fn new(device: D, hook: Arc<H>) -> Result<Self> {
        let block_size = BlockSize::new(device.block_size())
            .map_err(|e| FspError::InvalidGeometry(e.to_string()))?;
        Ok(Self {
            device,
            hook,
            block_size,
        })
    }

    #[must_use]
    pub fn hook(&self) -> &Arc<H> {
        &self.hook
    }

    #[must_use]
    pub fn device(&self) -> &D {
        &self.device
    }

    #[must_use]
    pub fn block_size(&self) -> BlockSize {
        self.block_size
    }

    /// Submit a request; `on_complete` runs once the hook has had its say.
    pub fn submit(&self, request: BlockRequest, on_complete: impl FnOnce(RequestCompletion)) {
        on_complete(self.execute(request));
    }

    /// Submit a request and return its completion.
    pub fn execute(&self, mut request: BlockRequest) -> RequestCompletion {
        let Submission { ticket, verdict } = self.hook.on_submit(&request);
        let device_status = match verdict {
            Verdict::Proceed => self.perform_io(&mut request),
            Verdict::Fail(reason) => RequestStatus::Failed(reason),
        };
        let status = self.hook.on_complete(ticket, &request, device_status);
        RequestCompletion { request, status }
    }

    /// Completions are returned in submission order.
    pub fn submit_batch(&self, requests: Vec<BlockRequest>) -> Vec<RequestCompletion> {
        requests.into_iter().map(|r| self.execute(r)).collect()
    }

    fn perform_io(&self, request: &mut BlockRequest) -> RequestStatus {
        let spb = self.block_size.sectors_per_block();
        let bs = self.block_size.as_usize();
        if request.sector.0 % spb != 0 || request.data.is_empty() || request.data.len() % bs != 0
        {
            return RequestStatus::Failed(format!(
                "request {} is not block aligned: sector={} len={}",
                request.id,
                request.sector,
                request.data.len()
            ));
        }

        let first = request.sector.to_block(self.block_size);
        let direction = request.direction;
        for (i, chunk) in request.data.chunks_mut(bs).enumerate() {
            let block = BlockNumber(first.0 + i as u64);
            let outcome = match direction {
                Direction::Write => self.device.write_block(block, chunk),
                Direction::Read => self
                    .device
                    .read_block(block)
                    .map(|buf| chunk.copy_from_slice(buf.as_slice())),
            };
            if let Err(err) = outcome {
                tracing::warn!(
                    target: "fsp::block",
                    request = request.id.0,
                    block = block.0,
                    error = %err,
                    "device I/O failed"
                );
                return RequestStatus::Failed(err.to_string());
            }
        }
        RequestStatus::Success
    }
}
