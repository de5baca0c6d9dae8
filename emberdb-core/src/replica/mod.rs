//! Local replication: WAL consumer feeding the family write path

mod rows;

pub use rows::{marshal_rows, BatchRows, MetricRow, RowField};

use crate::queue::{ConsumerGroup, FanOutQueue};
use crate::tsdb::DataFamily;
use crate::types::{Timestamp, SEQ_NO_NEW_MESSAGE};
use crate::Result;
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{info, warn};

/// Consumer group name of the local replicator
const LOCAL_GROUP: &str = "local";

/// Consumes one leader's WAL into the local family
///
/// Runs on its own thread, the single writer for its `(family, leader)`. On
/// start it rewinds the consume cursor to the acknowledged sequence and
/// replays; acknowledgement advances only after the family flushes.
pub struct LocalReplicator {
    handle: Option<JoinHandle<()>>,
}

impl LocalReplicator {
    /// Wire the ack callback and start the consume loop
    pub fn start(
        family: Arc<DataFamily>,
        leader: i32,
        queue: Arc<FanOutQueue>,
    ) -> Result<Self> {
        let group = queue.get_or_create_consumer_group(LOCAL_GROUP)?;

        // family flush completion acknowledges the WAL
        let ack_group = group.clone();
        family.ack_sequence(
            leader,
            Box::new(move |seq| {
                ack_group.ack(seq);
            }),
        );

        // resume after the last durable sequence and replay the gap
        let ack = group.acknowledged_seq();
        family.commit_sequence(leader, ack);
        group.set_consumed_seq(ack);
        family.retain();
        info!(
            shard = family.shard_id(),
            family_time = family.family_time(),
            leader,
            replay_from = ack + 1,
            "starting local replicator"
        );

        let handle = std::thread::Builder::new()
            .name(format!("replicator-{}-{}", family.family_time(), leader))
            .spawn(move || {
                run(&family, leader, &queue, &group);
                family.release();
            })?;
        Ok(Self {
            handle: Some(handle),
        })
    }

    /// Wait for the consume loop to exit (after its queue closes)
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run(family: &Arc<DataFamily>, leader: i32, queue: &FanOutQueue, group: &ConsumerGroup) {
    let mut batch = BatchRows::new();
    loop {
        let seq = group.consume();
        if seq == SEQ_NO_NEW_MESSAGE {
            break;
        }
        let payload = match queue.queue().get(seq) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(leader, seq, error = %e, "read wal payload failure, skipping");
                family.commit_sequence(leader, seq);
                continue;
            }
        };
        replica(family, leader, seq, &payload, &mut batch);
    }
}

/// Apply one WAL entry:
/// 1. contiguity check, 2. decompress/parse, 3. sort and write rows,
/// 4. the sequence is always committed so a bad entry cannot stall the group
fn replica(family: &Arc<DataFamily>, leader: i32, seq: i64, payload: &[u8], batch: &mut BatchRows) {
    if !family.validate_sequence(leader, seq) {
        return;
    }
    if let Err(e) = batch.unmarshal(payload) {
        warn!(leader, seq, error = %e, "undecodable wal entry ignored");
        family.commit_sequence(leader, seq);
        return;
    }
    if batch.is_empty() {
        family.commit_sequence(leader, seq);
        return;
    }
    batch.sort_by_timestamp();
    // write_rows commits the sequence on success
    if let Err(e) = family.write_rows(leader, seq, batch, now_millis()) {
        warn!(leader, seq, rows = batch.len(), error = %e, "write rows failure, entry dropped");
        family.commit_sequence(leader, seq);
    }
}

/// Wall clock in epoch milliseconds
pub(crate) fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as Timestamp)
        .unwrap_or(0)
}
