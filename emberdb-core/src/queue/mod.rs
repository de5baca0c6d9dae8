//! WAL queue with fan-out consumer groups
//!
//! One append-only queue feeds any number of named consumer groups, each with
//! its own persistent `(ack, consumed)` cursor. Pages wholly below the
//! minimum acknowledged sequence across groups are garbage collected.

mod consumer_group;
#[allow(clippy::module_inception)]
mod queue;

pub use consumer_group::ConsumerGroup;
pub use queue::Queue;

use crate::{EmberError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Queue plus its consumer groups
pub struct FanOutQueue {
    dir: PathBuf,
    queue: Arc<Queue>,
    groups: RwLock<HashMap<String, Arc<ConsumerGroup>>>,
}

impl FanOutQueue {
    /// Open the fan-out queue under `dir`, restoring existing consumer groups
    pub fn new(dir: impl Into<PathBuf>, page_size: usize) -> Result<Self> {
        let dir = dir.into();
        let queue = Arc::new(Queue::new(&dir, page_size)?);

        let fan_out = Self {
            dir,
            queue,
            groups: RwLock::new(HashMap::new()),
        };
        fan_out.load_groups()?;
        Ok(fan_out)
    }

    /// Append a payload, waking every consumer group
    pub fn put(&self, payload: &[u8]) -> Result<i64> {
        let seq = self.queue.put(payload)?;
        for group in self.groups.read().values() {
            group.notify();
        }
        Ok(seq)
    }

    /// The underlying queue
    pub fn queue(&self) -> &Arc<Queue> {
        &self.queue
    }

    /// Get or create a named consumer group
    pub fn get_or_create_consumer_group(&self, name: &str) -> Result<Arc<ConsumerGroup>> {
        if let Some(group) = self.groups.read().get(name) {
            return Ok(group.clone());
        }
        let mut groups = self.groups.write();
        if let Some(group) = groups.get(name) {
            return Ok(group.clone());
        }
        if self.queue.is_closed() {
            return Err(EmberError::QueueClosed);
        }
        let group = Arc::new(ConsumerGroup::new(
            self.group_dir(name),
            name,
            self.queue.clone(),
        )?);
        groups.insert(name.to_string(), group.clone());
        Ok(group)
    }

    /// Names of the known consumer groups
    pub fn consumer_group_names(&self) -> Vec<String> {
        self.groups.read().keys().cloned().collect()
    }

    /// Drop queue pages acknowledged by every consumer group
    ///
    /// Run on the `remove_task_interval` schedule. With no groups there is no
    /// acknowledgement floor, so nothing is dropped.
    pub fn gc(&self) {
        let min_ack = {
            let groups = self.groups.read();
            groups
                .values()
                .map(|group| group.acknowledged_seq())
                .min()
        };
        if let Some(min_ack) = min_ack {
            if min_ack >= 0 {
                self.queue.truncate_before(min_ack + 1);
            }
        }
    }

    /// Close the queue and every group, waking blocked consumers
    pub fn close(&self) {
        for group in self.groups.read().values() {
            group.close();
        }
        self.queue.close();
        info!(dir = %self.dir.display(), "fan-out queue closed");
    }

    fn group_dir(&self, name: &str) -> PathBuf {
        queue::group_dir(&self.dir).join(name)
    }

    fn load_groups(&self) -> Result<()> {
        let groups_dir = queue::group_dir(&self.dir);
        if !groups_dir.exists() {
            return Ok(());
        }
        for entry in fs::read_dir(&groups_dir)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                let name = entry.file_name().to_string_lossy().to_string();
                self.get_or_create_consumer_group(&name)?;
            }
        }
        Ok(())
    }
}

impl Drop for FanOutQueue {
    fn drop(&mut self) {
        self.close();
    }
}
