use std::slice;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use serde_derive::{Deserialize, Serialize};

use crate::core::{reader_context, Chain, RingConfig, RingService, FLAG_MSG_FIRST, FLAG_MSG_LAST};
use crate::errors::RingError;

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct ReaderConfig {
    pub ring: RingConfig,
}

/// Consumer endpoint. Concurrent readers compete for messages; each
/// committed message is claimed by exactly one of them under the reader
/// cursor mutex.
pub struct MessageReader {
    service: Box<RingService>,
}

impl MessageReader {
    pub fn new(cfg: &ReaderConfig) -> Result<MessageReader, RingError> {
        let shmem = reader_context(&cfg.ring)?;
        let service = RingService::new(shmem, &cfg.ring)?;
        Ok(MessageReader { service })
    }

    pub fn service(&self) -> &RingService {
        &self.service
    }

    /// Waits for a committed message, copies it out and returns its
    /// blocks to the free pool.
    pub fn receive(&self) -> Result<Vec<u8>, RingError> {
        self.receive_inner(None)
    }

    /// Bounded-wait `receive`; `CapacityTimeout` when no message commits
    /// before the deadline.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<Vec<u8>, RingError> {
        self.receive_inner(Some(Instant::now() + timeout))
    }

    fn receive_inner(&self, deadline: Option<Instant>) -> Result<Vec<u8>, RingError> {
        self.service.ensure_open()?;
        let chain = self.claim(deadline)?;
        let payload = self.drain(&chain);
        self.release(&chain)?;
        Ok(payload)
    }

    /// Takes one `sem_signal` permit, claims the chain at the claim
    /// frontier and advances `read_end` past it. The cursors are exact
    /// counters, so the emptiness check holds even when committed
    /// messages cover the whole ring. The remaining permits of the chain
    /// are consumed afterwards; the commit sweep posted them before the
    /// chain became claimable, so those waits are momentary unless the
    /// committer died mid-post, in which case a deadline surfaces as
    /// `CapacityTimeout` with the chain left claimed (the segment lost a
    /// participant and should be abandoned).
    fn claim(&self, deadline: Option<Instant>) -> Result<Chain, RingError> {
        let dir = self.service.directory();
        loop {
            self.service.ensure_open()?;
            let got = match deadline {
                None => {
                    dir.sem_signal.wait()?;
                    true
                }
                Some(d) => dir.sem_signal.wait_deadline(d)?,
            };
            if !got {
                return Err(RingError::CapacityTimeout);
            }

            let guard = self.service.reader_lock()?;
            let head = dir.read_end.load(Ordering::Acquire);
            if head == dir.write_start.load(Ordering::Acquire) {
                // A sibling reader claimed the message our permit was
                // posted for; hand the permit back and go around.
                drop(guard);
                dir.sem_signal.post()?;
                thread::yield_now();
                continue;
            }
            let len = self.walk_chain(head)?;
            dir.read_end.store(head + len, Ordering::Release);
            drop(guard);

            for _ in 1..len {
                let got = match deadline {
                    None => {
                        dir.sem_signal.wait()?;
                        true
                    }
                    Some(d) => dir.sem_signal.wait_deadline(d)?,
                };
                if !got {
                    return Err(RingError::CapacityTimeout);
                }
            }
            return Ok(Chain { head, len });
        }
    }

    /// Validates the chain rooted at cursor `head` and returns its
    /// length. A signaled chain must be whole: every block committed,
    /// sizes within bounds, links contiguous, head and terminal markers
    /// in place.
    fn walk_chain(&self, head: u64) -> Result<u64, RingError> {
        let block_count = self.service.block_count();
        let mut len = 0u64;
        loop {
            let block = self.service.block(head + len);
            if block.done_write.load(Ordering::Acquire) != 1 {
                return Err(RingError::ProtocolViolation(format!(
                    "signaled slot {} lacks done_write",
                    self.service.slot_of(head + len)
                )));
            }
            if block.size.load(Ordering::Acquire) > self.service.block_size() {
                return Err(RingError::ProtocolViolation(format!(
                    "slot {} declares more payload than block_size",
                    self.service.slot_of(head + len)
                )));
            }
            len += 1;
            if len > block_count {
                return Err(RingError::CorruptChain(format!(
                    "chain at slot {} never terminates",
                    self.service.slot_of(head)
                )));
            }
            let flags = block.flags.load(Ordering::Acquire);
            if len == 1 && flags & FLAG_MSG_FIRST == 0 {
                return Err(RingError::CorruptChain(format!(
                    "slot {} at the claim frontier is not a chain head",
                    self.service.slot_of(head)
                )));
            }
            if flags & FLAG_MSG_LAST != 0 {
                return Ok(len);
            }
            let next = block.next.load(Ordering::Acquire);
            if next != self.service.slot_of(head + len) as i64 {
                return Err(RingError::CorruptChain(format!(
                    "slot {} links to slot {} out of reservation order",
                    self.service.slot_of(head + len - 1),
                    next
                )));
            }
        }
    }

    /// Copies the payload out in chain order. Sizes were validated at
    /// claim time.
    fn drain(&self, chain: &Chain) -> Vec<u8> {
        let mut payload =
            Vec::with_capacity((chain.len * self.service.block_size()) as usize);
        for i in 0..chain.len {
            let at = chain.head + i;
            let size = self.service.block(at).size.load(Ordering::Acquire) as usize;
            unsafe {
                payload.extend_from_slice(slice::from_raw_parts(self.service.data_ptr(at), size));
            }
        }
        payload
    }

    /// Marks the chain drained and sweeps `read_start` past every drained
    /// block, resetting each for reuse; one `sem_avail` post per block
    /// freed. Out-of-order release by sibling readers parks in `done_read`
    /// until the prefix catches up.
    fn release(&self, chain: &Chain) -> Result<(), RingError> {
        for i in 0..chain.len {
            self.service
                .block(chain.head + i)
                .done_read
                .store(1, Ordering::Release);
        }

        let dir = self.service.directory();
        let guard = self.service.reader_lock()?;
        let mut freed = 0u64;
        let mut frontier = dir.read_start.load(Ordering::Acquire);
        let claimed_end = dir.read_end.load(Ordering::Acquire);
        while frontier != claimed_end {
            let block = self.service.block(frontier);
            if block.done_read.load(Ordering::Acquire) != 1 {
                break;
            }
            block.reset();
            frontier += 1;
            dir.read_start.store(frontier, Ordering::Release);
            freed += 1;
        }
        drop(guard);

        for _ in 0..freed {
            dir.sem_avail.post()?;
        }
        Ok(())
    }
}
