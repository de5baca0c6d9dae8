//! Consumer groups: independent cursors over one queue

use super::queue::Queue;
use crate::page::{MappedPage, PageFactory};
use crate::types::SEQ_NO_NEW_MESSAGE;
use crate::Result;
use parking_lot::{Condvar, Mutex};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Ack record layout: `ack+1:u64 | consumed+1:u64`
const GROUP_META_SIZE: usize = 16;
const ACK_OFFSET: usize = 0;
const CONSUMED_OFFSET: usize = 8;

/// Consumer group lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GroupStatus {
    Running,
    Paused,
    Closed,
}

struct GroupState {
    consumed_seq: i64,
    ack_seq: i64,
    status: GroupStatus,
}

/// One named consumer over a queue, with a persistent ack record
///
/// `consume` blocks until a new message is appended, the group is paused or
/// closed, or the queue is closed; the two sequences satisfy
/// `ack <= consumed <= appended` at all times.
pub struct ConsumerGroup {
    name: String,
    queue: Arc<Queue>,
    meta: Arc<MappedPage>,
    state: Mutex<GroupState>,
    signal: Condvar,
}

impl ConsumerGroup {
    /// Open or create the group under its directory, resuming both sequences
    pub(crate) fn new(dir: impl Into<PathBuf>, name: &str, queue: Arc<Queue>) -> Result<Self> {
        let meta = PageFactory::new(dir.into(), GROUP_META_SIZE)?.acquire(0)?;
        let mut ack_seq = meta.read_u64(ACK_OFFSET)? as i64 - 1;
        let mut consumed_seq = meta.read_u64(CONSUMED_OFFSET)? as i64 - 1;

        // a record ahead of the queue means the queue lost pages; reset
        let appended = queue.appended_seq();
        if consumed_seq > appended {
            warn!(
                group = name,
                consumed_seq, appended, "consumed sequence ahead of queue, resetting"
            );
            consumed_seq = appended;
            ack_seq = ack_seq.min(consumed_seq);
            meta.put_u64(ACK_OFFSET, (ack_seq + 1) as u64)?;
            meta.put_u64(CONSUMED_OFFSET, (consumed_seq + 1) as u64)?;
        }

        Ok(Self {
            name: name.to_string(),
            queue,
            meta,
            state: Mutex::new(GroupState {
                consumed_seq,
                ack_seq,
                status: GroupStatus::Running,
            }),
            signal: Condvar::new(),
        })
    }

    /// Group name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until the next sequence is available and claim it
    ///
    /// Returns [`SEQ_NO_NEW_MESSAGE`] when the group is paused or closed, or
    /// the queue is closed.
    pub fn consume(&self) -> i64 {
        let mut state = self.state.lock();
        loop {
            if state.status != GroupStatus::Running || self.queue.is_closed() {
                return SEQ_NO_NEW_MESSAGE;
            }
            if state.consumed_seq < self.queue.appended_seq() {
                state.consumed_seq += 1;
                let seq = state.consumed_seq;
                if let Err(e) = self.meta.put_u64(CONSUMED_OFFSET, (seq + 1) as u64) {
                    warn!(group = %self.name, seq, error = %e, "persist consumed sequence failure");
                }
                return seq;
            }
            self.signal.wait(&mut state);
        }
    }

    /// Acknowledge processing up to `seq`; idempotent and monotone
    ///
    /// Sequences at or below the current ack, or beyond the consumed
    /// sequence, are ignored.
    pub fn ack(&self, seq: i64) {
        let mut state = self.state.lock();
        if seq <= state.ack_seq || seq > state.consumed_seq {
            return;
        }
        state.ack_seq = seq;
        if let Err(e) = self
            .meta
            .put_u64(ACK_OFFSET, (seq + 1) as u64)
            .and_then(|_| self.meta.sync())
        {
            warn!(group = %self.name, seq, error = %e, "persist ack sequence failure");
        }
    }

    /// Move the consume cursor for replay, clamped to `[-1, appended]`
    pub fn set_consumed_seq(&self, seq: i64) {
        let mut state = self.state.lock();
        let seq = seq.clamp(-1, self.queue.appended_seq());
        state.consumed_seq = seq;
        state.ack_seq = state.ack_seq.min(seq);
        if let Err(e) = self.meta.put_u64(CONSUMED_OFFSET, (seq + 1) as u64) {
            warn!(group = %self.name, seq, error = %e, "persist consumed sequence failure");
        }
    }

    /// Last consumed sequence, `-1` before the first consume
    pub fn consumed_seq(&self) -> i64 {
        self.state.lock().consumed_seq
    }

    /// Last acknowledged sequence, `-1` before the first ack
    pub fn acknowledged_seq(&self) -> i64 {
        self.state.lock().ack_seq
    }

    /// Number of consumed-but-unacknowledged plus unconsumed messages
    pub fn pending(&self) -> i64 {
        self.queue.appended_seq() - self.state.lock().ack_seq
    }

    /// Whether everything appended has been acknowledged
    pub fn is_empty(&self) -> bool {
        self.state.lock().ack_seq == self.queue.appended_seq()
    }

    /// Stop handing out sequences until `resume`
    pub fn pause(&self) {
        let mut state = self.state.lock();
        if state.status == GroupStatus::Running {
            state.status = GroupStatus::Paused;
            self.signal.notify_all();
        }
    }

    /// Resume a paused group
    pub fn resume(&self) {
        let mut state = self.state.lock();
        if state.status == GroupStatus::Paused {
            state.status = GroupStatus::Running;
            self.signal.notify_all();
        }
    }

    /// Close the group, waking any blocked consumer
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.status = GroupStatus::Closed;
        self.signal.notify_all();
        if let Err(e) = self.meta.sync() {
            warn!(group = %self.name, error = %e, "sync group meta failure");
        }
    }

    /// Wake a blocked consumer to re-check queue state
    pub(crate) fn notify(&self) {
        self.signal.notify_all();
    }
}
