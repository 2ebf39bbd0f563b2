use std::collections::VecDeque;

use tokio::time::Instant;

use crate::base::{ConnId, Nonce, RecordId};

/// One acquire that could not be granted immediately.
///
/// Destroyed on grant, on timer expiry, or on client disconnect. Immutable
/// apart from its queue position.
#[derive(Debug, Clone)]
pub(crate) struct RequestRecord {
    pub(crate) record_id: RecordId,
    pub(crate) conn: ConnId,
    pub(crate) nonce: Nonce,
    pub(crate) deadline: Instant,
}

/// FIFO sequence of pending requests for one waiter class.
///
/// O(1) tail insert and head removal; removal by id or predicate scans.
/// Fairness is FIFO within the queue; there is no priority across queues.
#[derive(Debug, Default)]
pub(crate) struct WaiterQueue {
    records: VecDeque<RequestRecord>,
}

impl WaiterQueue {
    pub(crate) fn push(&mut self, record: RequestRecord) {
        self.records.push_back(record);
    }

    pub(crate) fn pop_front(&mut self) -> Option<RequestRecord> {
        self.records.pop_front()
    }

    pub(crate) fn front(&self) -> Option<&RequestRecord> {
        self.records.front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }

    /// Removes the record with this id, preserving the order of the rest.
    pub(crate) fn remove(&mut self, record_id: RecordId) -> Option<RequestRecord> {
        let idx = self.records.iter().position(|r| r.record_id == record_id)?;
        self.records.remove(idx)
    }

    /// Removes every record of this connection. Returns how many went.
    pub(crate) fn remove_conn(&mut self, conn: ConnId) -> usize {
        let before = self.records.len();
        self.records.retain(|r| r.conn != conn);
        before - self.records.len()
    }

    pub(crate) fn contains_conn(&self, conn: ConnId) -> bool {
        self.records.iter().any(|r| r.conn == conn)
    }

    #[cfg(test)]
    pub(crate) fn conns(&self) -> Vec<ConnId> {
        self.records.iter().map(|r| r.conn).collect()
    }
}
