use std::ptr;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use serde_derive::{Deserialize, Serialize};

use crate::core::{
    writer_context, Chain, RingConfig, RingService, FLAG_MSG_FIRST, FLAG_MSG_LAST, NIL,
};
use crate::errors::RingError;

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    pub ring: RingConfig,
}

/// Producer endpoint. Safe to run one per process against the same
/// segment; reservation and commit order among concurrent writers is
/// serialized by the in-segment writer cursor mutex.
pub struct MessageWriter {
    service: Box<RingService>,
}

/// Blocks a payload occupies; a zero-length message still takes one.
#[inline]
pub(crate) fn blocks_needed(payload_len: u64, block_size: u64) -> u64 {
    if payload_len == 0 {
        1
    } else {
        (payload_len + block_size - 1) / block_size
    }
}

impl MessageWriter {
    pub fn new(cfg: &WriterConfig) -> Result<MessageWriter, RingError> {
        let shmem = writer_context(&cfg.ring)?;
        let service = RingService::new(shmem, &cfg.ring)?;
        Ok(MessageWriter { service })
    }

    pub fn service(&self) -> &RingService {
        &self.service
    }

    /// Reserve, commit and signal one message. Blocks while the free pool
    /// is exhausted. Returns the slot of the chain's head block.
    pub fn send(&mut self, payload: &[u8]) -> Result<usize, RingError> {
        self.send_inner(payload, None)
    }

    /// Bounded-wait `send`; returns `CapacityTimeout` with no side effects
    /// when the free pool stays exhausted past the deadline.
    pub fn send_timeout(&mut self, payload: &[u8], timeout: Duration) -> Result<usize, RingError> {
        self.send_inner(payload, Some(Instant::now() + timeout))
    }

    fn send_inner(&mut self, payload: &[u8], deadline: Option<Instant>) -> Result<usize, RingError> {
        self.service.ensure_open()?;
        let needed = blocks_needed(payload.len() as u64, self.service.block_size());
        if needed > self.service.max_chain() {
            return Err(RingError::OversizedMessage {
                blocks: needed,
                limit: self.service.max_chain(),
            });
        }
        let chain = self.reserve(needed, deadline)?;
        self.commit(&chain, payload)?;
        Ok(self.service.slot_of(chain.head) as usize)
    }

    /// Draws `n_blocks` from the free pool and threads them into a chain
    /// at the reservation frontier. One `sem_avail` permit per block; on a
    /// deadline, and on the corrupt-free-pool exit, the permits already
    /// taken go back, so a failed reserve never leaks capacity.
    fn reserve(&self, n_blocks: u64, deadline: Option<Instant>) -> Result<Chain, RingError> {
        let dir = self.service.directory();

        let mut acquired = 0u64;
        while acquired < n_blocks {
            let got = match deadline {
                None => {
                    dir.sem_avail.wait()?;
                    true
                }
                Some(d) => dir.sem_avail.wait_deadline(d)?,
            };
            if !got {
                for _ in 0..acquired {
                    dir.sem_avail.post()?;
                }
                return Err(RingError::CapacityTimeout);
            }
            acquired += 1;
        }

        let guard = self.service.writer_lock()?;
        let head = dir.write_end.load(Ordering::Acquire);
        for i in 0..n_blocks {
            let at = head + i;
            let block = self.service.block(at);
            if block.done_write.load(Ordering::Acquire) != 0 {
                drop(guard);
                for _ in 0..acquired {
                    dir.sem_avail.post()?;
                }
                return Err(RingError::ProtocolViolation(format!(
                    "block {} re-entered the free pool while still committed",
                    self.service.slot_of(at)
                )));
            }
            let prev = if i == 0 {
                NIL
            } else {
                self.service.slot_of(at - 1) as i64
            };
            let next = if i + 1 == n_blocks {
                NIL
            } else {
                self.service.slot_of(at + 1) as i64
            };
            block.prev.store(prev, Ordering::Relaxed);
            block.next.store(next, Ordering::Relaxed);
        }
        dir.write_end.store(head + n_blocks, Ordering::Release);
        drop(guard);

        Ok(Chain {
            head,
            len: n_blocks,
        })
    }

    /// Copies the payload into the chain and publishes it: per block, data
    /// and `size` and `flags` first, then `done_write` with release
    /// ordering, in chain order. Finishes with the commit sweep and one
    /// `sem_signal` post per block that became reader-visible.
    fn commit(&self, chain: &Chain, payload: &[u8]) -> Result<(), RingError> {
        let block_size = self.service.block_size() as usize;
        let mut offset = 0usize;
        for i in 0..chain.len {
            let at = chain.head + i;
            let fragment = if i + 1 == chain.len {
                payload.len() - offset
            } else {
                block_size
            };
            unsafe {
                ptr::copy_nonoverlapping(
                    payload.as_ptr().add(offset),
                    self.service.data_ptr(at),
                    fragment,
                );
            }
            let block = self.service.block(at);
            block.size.store(fragment as u64, Ordering::Relaxed);
            let mut flags = 0u64;
            if i == 0 {
                flags |= FLAG_MSG_FIRST;
            }
            if i + 1 == chain.len {
                flags |= FLAG_MSG_LAST;
            }
            block.flags.store(flags, Ordering::Relaxed);
            block.done_write.store(1, Ordering::Release);
            offset += fragment;
        }

        let visible = self.sweep_committed()?;
        let dir = self.service.directory();
        for _ in 0..visible {
            dir.sem_signal.post()?;
        }
        Ok(())
    }

    /// Advances `write_start` past every fully committed message, in
    /// reservation order, and returns the number of blocks swept. Stops at
    /// the first chain with an uncommitted block: a partial chain is never
    /// signaled, and a later commit never becomes visible ahead of an
    /// earlier reservation. Whoever commits last sweeps for everyone, so
    /// no committed message is left unsignaled. The cursors being exact
    /// counters, the bound holds even when reservations cover the whole
    /// ring.
    fn sweep_committed(&self) -> Result<u64, RingError> {
        let dir = self.service.directory();
        let guard = self.service.writer_lock()?;
        let mut swept = 0u64;
        let mut frontier = dir.write_start.load(Ordering::Acquire);
        let reserved_end = dir.write_end.load(Ordering::Acquire);
        'sweep: while frontier != reserved_end {
            let mut len = 0u64;
            loop {
                let block = self.service.block(frontier + len);
                if block.done_write.load(Ordering::Acquire) != 1 {
                    break 'sweep;
                }
                len += 1;
                if len > self.service.block_count() {
                    return Err(RingError::CorruptChain(format!(
                        "chain at slot {} never terminates",
                        self.service.slot_of(frontier)
                    )));
                }
                let flags = block.flags.load(Ordering::Acquire);
                if len == 1 && flags & FLAG_MSG_FIRST == 0 {
                    return Err(RingError::CorruptChain(format!(
                        "slot {} committed without a chain head marker",
                        self.service.slot_of(frontier)
                    )));
                }
                if flags & FLAG_MSG_LAST != 0 {
                    break;
                }
                // reservation linked the chain contiguously
                let next = block.next.load(Ordering::Acquire);
                if next != self.service.slot_of(frontier + len) as i64 {
                    return Err(RingError::CorruptChain(format!(
                        "slot {} links to slot {} out of reservation order",
                        self.service.slot_of(frontier + len - 1),
                        next
                    )));
                }
            }
            frontier += len;
            dir.write_start.store(frontier, Ordering::Release);
            swept += len;
        }
        drop(guard);
        Ok(swept)
    }
}
