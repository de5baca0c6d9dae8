//! Append-only message log over mapped pages

use crate::page::{MappedPage, PageFactory};
use crate::{EmberError, Result};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

/// Messages tracked per index page
const MESSAGES_PER_INDEX_PAGE: i64 = 64 * 1024;

/// Index entry: `data_page:i64 | offset:u32 | length:u32`
const INDEX_ENTRY_SIZE: usize = 16;

const INDEX_PAGE_SIZE: usize = MESSAGES_PER_INDEX_PAGE as usize * INDEX_ENTRY_SIZE;

/// Meta page layout: appended count at 0, head count at 8
const META_PAGE_SIZE: usize = 64;
const META_APPENDED_OFFSET: usize = 0;
const META_HEAD_OFFSET: usize = 8;

/// Append-only queue addressed by a monotone sequence
///
/// Payloads live in data pages, one fixed-size index entry per message
/// resolves a sequence to its page and offset, and a small meta page records
/// the appended and head sequences. A torn tail (messages written but the
/// meta update lost) is repaired on open by scanning index entries forward.
pub struct Queue {
    data: PageFactory,
    index: PageFactory,
    meta: Arc<MappedPage>,
    appended: AtomicI64,
    head: AtomicI64,
    tail: Mutex<TailPosition>,
    closed: AtomicBool,
    page_size: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct TailPosition {
    page: i64,
    offset: u32,
}

impl Queue {
    /// Open the queue under `dir`, repairing a torn tail if needed
    pub fn new(dir: impl Into<PathBuf>, page_size: usize) -> Result<Self> {
        let dir = dir.into();
        let data = PageFactory::new(dir.join("data"), page_size)?;
        let index = PageFactory::new(dir.join("index"), INDEX_PAGE_SIZE)?;
        let meta = PageFactory::new(dir.join("meta"), META_PAGE_SIZE)?.acquire(0)?;

        let appended = meta.read_u64(META_APPENDED_OFFSET)? as i64 - 1;
        let head = meta.read_u64(META_HEAD_OFFSET)? as i64;

        let queue = Self {
            data,
            index,
            meta,
            appended: AtomicI64::new(appended),
            head: AtomicI64::new(head),
            tail: Mutex::new(TailPosition::default()),
            closed: AtomicBool::new(false),
            page_size,
        };
        queue.repair_tail()?;
        Ok(queue)
    }

    /// Append a payload and return its sequence
    pub fn put(&self, payload: &[u8]) -> Result<i64> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EmberError::QueueClosed);
        }
        if payload.is_empty() {
            return Err(EmberError::InvalidFormat("empty queue payload".into()));
        }
        if payload.len() > self.page_size {
            return Err(EmberError::InvalidFormat(format!(
                "payload of {} bytes exceeds page size {}",
                payload.len(),
                self.page_size
            )));
        }

        let mut tail = self.tail.lock();
        // messages never span pages
        if tail.offset as usize + payload.len() > self.page_size {
            tail.page += 1;
            tail.offset = 0;
        }
        let page = self.data.acquire(tail.page)?;
        page.write(tail.offset as usize, payload)?;

        let seq = self.appended.load(Ordering::Acquire) + 1;
        self.write_index_entry(seq, tail.page, tail.offset, payload.len() as u32)?;
        tail.offset += payload.len() as u32;

        self.appended.store(seq, Ordering::Release);
        self.meta.put_u64(META_APPENDED_OFFSET, (seq + 1) as u64)?;
        Ok(seq)
    }

    /// Read the payload of a sequence
    pub fn get(&self, seq: i64) -> Result<Vec<u8>> {
        if seq < self.head.load(Ordering::Acquire) || seq > self.appended.load(Ordering::Acquire) {
            return Err(EmberError::InvalidFormat(format!(
                "sequence {} out of queue range",
                seq
            )));
        }
        let (page, offset, length) = self.read_index_entry(seq)?;
        let page = self
            .data
            .get(page)
            .ok_or_else(|| EmberError::Corruption(format!("data page {} missing", page)))?;
        page.read(offset as usize, length as usize)
    }

    /// Last appended sequence, `-1` when empty
    pub fn appended_seq(&self) -> i64 {
        self.appended.load(Ordering::Acquire)
    }

    /// Smallest retained sequence
    pub fn head_seq(&self) -> i64 {
        self.head.load(Ordering::Acquire)
    }

    /// Total bytes of mapped pages
    pub fn size(&self) -> u64 {
        self.data.size() + self.index.size()
    }

    /// Drop pages wholly below `seq`, advancing the head
    pub fn truncate_before(&self, seq: i64) {
        if seq <= self.head.load(Ordering::Acquire) || seq > self.appended_seq() + 1 {
            return;
        }
        match self.read_index_entry(seq.min(self.appended_seq())) {
            Ok((data_page, _, _)) => {
                self.data.truncate_before(data_page);
                self.index.truncate_before(seq / MESSAGES_PER_INDEX_PAGE);
                self.head.store(seq, Ordering::Release);
                if let Err(e) = self.meta.put_u64(META_HEAD_OFFSET, seq as u64) {
                    warn!(seq, error = %e, "persist queue head failure");
                }
            }
            Err(e) => warn!(seq, error = %e, "resolve truncation point failure"),
        }
    }

    /// Whether the queue is closed
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Flush meta and close underlying factories; idempotent
    pub fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        if let Err(e) = self.meta.sync() {
            warn!(error = %e, "sync queue meta failure");
        }
        self.data.close();
        self.index.close();
    }

    fn index_page_of(seq: i64) -> (i64, usize) {
        (
            seq / MESSAGES_PER_INDEX_PAGE,
            (seq % MESSAGES_PER_INDEX_PAGE) as usize * INDEX_ENTRY_SIZE,
        )
    }

    fn write_index_entry(&self, seq: i64, data_page: i64, offset: u32, length: u32) -> Result<()> {
        let (page_idx, at) = Self::index_page_of(seq);
        let page = self.index.acquire(page_idx)?;
        page.put_u64(at, data_page as u64)?;
        page.put_u32(at + 8, offset)?;
        page.put_u32(at + 12, length)
    }

    fn read_index_entry(&self, seq: i64) -> Result<(i64, u32, u32)> {
        let (page_idx, at) = Self::index_page_of(seq);
        let page = self
            .index
            .get(page_idx)
            .ok_or_else(|| EmberError::Corruption(format!("index page {} missing", page_idx)))?;
        Ok((
            page.read_u64(at)? as i64,
            page.read_u32(at + 8)?,
            page.read_u32(at + 12)?,
        ))
    }

    /// Validate an index entry written after the recorded appended sequence
    fn entry_is_valid(&self, seq: i64) -> bool {
        let (page_idx, _) = Self::index_page_of(seq);
        if self.index.get(page_idx).is_none() {
            return false;
        }
        match self.read_index_entry(seq) {
            Ok((data_page, offset, length)) => {
                length > 0
                    && offset as usize + length as usize <= self.page_size
                    && self.data.get(data_page).is_some()
            }
            Err(_) => false,
        }
    }

    /// Scan forward from the recorded appended sequence over index entries
    /// that decode, adopting messages whose meta update was lost
    fn repair_tail(&self) -> Result<()> {
        let recorded = self.appended.load(Ordering::Acquire);
        let mut appended = recorded;
        while self.entry_is_valid(appended + 1) {
            appended += 1;
        }
        if appended > recorded {
            info!(recorded, repaired = appended, "repaired torn queue tail");
            self.appended.store(appended, Ordering::Release);
            self.meta.put_u64(META_APPENDED_OFFSET, (appended + 1) as u64)?;
        }

        // restore the write position after the last message
        let mut tail = self.tail.lock();
        *tail = if appended >= 0 {
            let (page, offset, length) = self.read_index_entry(appended)?;
            TailPosition {
                page,
                offset: offset + length,
            }
        } else {
            TailPosition::default()
        };
        Ok(())
    }
}

/// Queue directory layout helper shared with consumer groups
pub(crate) fn group_dir(dir: &Path) -> PathBuf {
    dir.join("groups")
}
