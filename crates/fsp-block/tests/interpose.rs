#![forbid(unsafe_code)]

use fsp_block::{
    BlockDevice, BlockRequest, ByteBlockDevice, InterposedDevice, MemByteDevice, PassThrough,
    RequestHook, RequestId, RequestStatus, Submission, Verdict,
};
use fsp_types::{BlockNumber, Direction, SectorNumber};
use parking_lot::Mutex;
use std::sync::Arc;

const BLOCK_SIZE: usize = 4096;

/// Fails writes that touch `veto_block` and records every callback.
#[derive(Debug, Default)]
struct VetoHook {
    veto_block: u64,
    veto_at_completion: bool,
    events: Mutex<Vec<String>>,
}

impl RequestHook for VetoHook {
    type Ticket = u64;

    fn on_submit(&self, request: &BlockRequest) -> Submission<u64> {
        self.events.lock().push(format!("submit {}", request.id));
        let touches = request.sector.0 / 8 == self.veto_block;
        let verdict = if touches && !self.veto_at_completion && request.direction == Direction::Write
        {
            Verdict::Fail("vetoed at submit".into())
        } else {
            Verdict::Proceed
        };
        Submission {
            ticket: request.id.0,
            verdict,
        }
    }

    fn on_complete(
        &self,
        ticket: u64,
        request: &BlockRequest,
        status: RequestStatus,
    ) -> RequestStatus {
        self.events.lock().push(format!("complete {ticket}"));
        if self.veto_at_completion && request.sector.0 / 8 == self.veto_block {
            return RequestStatus::Failed("vetoed at completion".into());
        }
        status
    }
}

fn device(blocks: usize) -> (MemByteDevice, ByteBlockDevice<MemByteDevice>) {
    let mem = MemByteDevice::new(BLOCK_SIZE * blocks);
    let dev = ByteBlockDevice::new(mem.clone(), 4096).expect("block device");
    (mem, dev)
}

#[test]
fn pass_through_writes_then_reads_back() {
    let (_, dev) = device(8);
    let interposed = InterposedDevice::new(dev, Arc::new(PassThrough)).expect("interpose");

    let write = BlockRequest::write(RequestId(1), SectorNumber(16), vec![0x5A; BLOCK_SIZE * 2]);
    assert!(interposed.execute(write).is_success());

    let read = interposed.execute(BlockRequest::read(RequestId(2), SectorNumber(24), BLOCK_SIZE));
    let request = read.into_result().expect("read ok");
    assert!(request.data.iter().all(|b| *b == 0x5A));
}

#[test]
fn submit_veto_skips_device_io() {
    let (mem, dev) = device(8);
    let hook = Arc::new(VetoHook {
        veto_block: 3,
        ..VetoHook::default()
    });
    let interposed = InterposedDevice::new(dev, Arc::clone(&hook)).expect("interpose");

    let mut seen = None;
    interposed.submit(
        BlockRequest::write(RequestId(7), SectorNumber(24), vec![0xFF; BLOCK_SIZE]),
        |completion| seen = Some(completion.status),
    );
    assert_eq!(
        seen,
        Some(RequestStatus::Failed("vetoed at submit".into()))
    );
    assert!(mem.snapshot()[3 * BLOCK_SIZE..4 * BLOCK_SIZE].iter().all(|b| *b == 0));
    assert_eq!(*hook.events.lock(), vec!["submit 7", "complete 7"]);
}

#[test]
fn completion_veto_reports_failure_after_io() {
    let (mem, dev) = device(8);
    let hook = Arc::new(VetoHook {
        veto_block: 2,
        veto_at_completion: true,
        ..VetoHook::default()
    });
    let interposed = InterposedDevice::new(dev, hook).expect("interpose");

    let completion = interposed.execute(BlockRequest::write(
        RequestId(3),
        SectorNumber(16),
        vec![0x11; BLOCK_SIZE],
    ));
    assert!(!completion.is_success());
    // The device saw the write; only the caller was told it failed.
    assert_eq!(mem.snapshot()[2 * BLOCK_SIZE], 0x11);
}

#[test]
fn unaligned_request_fails_without_touching_device() {
    let (_, dev) = device(4);
    let interposed = InterposedDevice::new(dev, Arc::new(PassThrough)).expect("interpose");
    let completion =
        interposed.execute(BlockRequest::write(RequestId(1), SectorNumber(3), vec![1; 512]));
    assert!(matches!(completion.status, RequestStatus::Failed(_)));
    assert!(
        interposed
            .device()
            .read_block(BlockNumber(0))
            .expect("read")
            .as_slice()
            .iter()
            .all(|b| *b == 0)
    );
}

#[test]
fn batch_preserves_order() {
    let (_, dev) = device(4);
    let interposed = InterposedDevice::new(dev, Arc::new(PassThrough)).expect("interpose");
    let completions = interposed.submit_batch(vec![
        BlockRequest::write(RequestId(1), SectorNumber(0), vec![1; BLOCK_SIZE]),
        BlockRequest::write(RequestId(2), SectorNumber(99), vec![1; BLOCK_SIZE]),
        BlockRequest::read(RequestId(3), SectorNumber(0), BLOCK_SIZE),
    ]);
    let ids: Vec<u64> = completions.iter().map(|c| c.request.id.0).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert!(completions[0].is_success());
    assert!(!completions[1].is_success());
    assert_eq!(completions[2].request.data[0], 1);
}
