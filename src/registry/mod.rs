//! # Lock Registry
//!
//! Maps lock ids to [`LockEntity`] state machines. Entities are created
//! lazily on first reference and removed eagerly the moment they are
//! abandoned (no holder, no waiter), so the map never carries tombstones.
//!
//! Registry and entity methods never perform I/O. They return an
//! [`Effects`] value listing the response frames to send and the deadline
//! timers to arm; the coordinator applies it. That keeps every invariant
//! checkable in plain synchronous tests.

use std::collections::BTreeMap;

use tokio::time::Instant;

use crate::{
    base::{ConnId, LockId, Mode, Nonce, RecordId},
    protocol::{Frame, Status},
};

mod entity;
mod queue;

use entity::LockEntity;

/// Allocator for [`RecordId`]s, monotonically increasing across the
/// registry's lifetime.
#[derive(Debug, Default)]
pub(crate) struct RecordIdGen(u64);

impl RecordIdGen {
    pub(crate) fn next(&mut self) -> RecordId {
        self.0 += 1;
        RecordId::new(self.0)
    }
}

/// What one registry operation wants done to the outside world.
#[derive(Debug, Default)]
pub(crate) struct Effects {
    /// Response frames, in emit order. Per-connection order is preserved
    /// by the coordinator; sends to dead connections are swallowed.
    pub(crate) outbound: Vec<(ConnId, Frame)>,
    /// Deadline timers to arm, one per freshly queued request.
    pub(crate) timers: Vec<(RecordId, Instant)>,
}

impl Effects {
    pub(crate) fn respond(&mut self, conn: ConnId, frame: Frame) {
        self.outbound.push((conn, frame));
    }

    pub(crate) fn arm_timer(&mut self, record_id: RecordId, deadline: Instant) {
        self.timers.push((record_id, deadline));
    }
}

/// Owner of all lock entities. One per server process; only ever touched
/// from the coordinator task.
#[derive(Debug)]
pub(crate) struct LockRegistry {
    entities: BTreeMap<LockId, LockEntity>,
    greedy_readers: bool,
    record_ids: RecordIdGen,
}

impl LockRegistry {
    pub(crate) fn new(greedy_readers: bool) -> Self {
        Self {
            entities: BTreeMap::new(),
            greedy_readers,
            record_ids: RecordIdGen::default(),
        }
    }

    fn entity_mut(&mut self, lock_id: &LockId) -> &mut LockEntity {
        let greedy = self.greedy_readers;
        self.entities
            .entry(lock_id.clone())
            .or_insert_with(|| LockEntity::new(lock_id.clone(), greedy))
    }

    /// Drops the entity again if the operation left it abandoned.
    fn cleanup(&mut self, lock_id: &LockId) {
        if let Some(entity) = self.entities.get(lock_id)
            && entity.is_abandoned()
        {
            trace!(%lock_id, "reaping abandoned entity");
            self.entities.remove(lock_id);
        }
    }

    pub(crate) fn acquire(
        &mut self,
        conn: ConnId,
        lock_id: &LockId,
        mode: Mode,
        nonce: &Nonce,
        deadline: Instant,
    ) -> Effects {
        let mut fx = Effects::default();
        // entry borrows the map alone, leaving the id allocator free
        let greedy = self.greedy_readers;
        let entity = self
            .entities
            .entry(lock_id.clone())
            .or_insert_with(|| LockEntity::new(lock_id.clone(), greedy));
        match mode {
            Mode::Read => entity.acquire_read(conn, nonce, deadline, &mut self.record_ids, &mut fx),
            Mode::Write => {
                entity.acquire_write(conn, nonce, deadline, &mut self.record_ids, &mut fx)
            }
        }
        fx
    }

    /// A release on an unknown id momentarily creates a fresh entity,
    /// which reports the miss and is reaped right after. Cheap, and it
    /// keeps the code uniform.
    pub(crate) fn release(&mut self, conn: ConnId, lock_id: &LockId, nonce: &Nonce) -> Effects {
        let mut fx = Effects::default();
        self.entity_mut(lock_id).release(conn, nonce, false, &mut fx);
        self.cleanup(lock_id);
        fx
    }

    /// Sweeps every entity for things this connection holds. Per-entity
    /// misses stay silent; when nothing at all was released and
    /// `report_if_empty` is set, one NOLOCKSTORELEASEALL goes out.
    pub(crate) fn release_all(
        &mut self,
        conn: ConnId,
        nonce: &Nonce,
        report_if_empty: bool,
    ) -> Effects {
        let mut fx = Effects::default();
        let mut any_released = false;
        for entity in self.entities.values_mut() {
            any_released |= entity.release(conn, nonce, true, &mut fx);
        }
        self.entities.retain(|_, entity| !entity.is_abandoned());
        if !any_released && report_if_empty {
            fx.respond(conn, Frame::new(Status::NoLocksToReleaseAll).with_nonce(nonce));
        }
        fx
    }

    /// Snapshot of every live entity. Entities are reaped eagerly, so
    /// everything listed here is held or waited on.
    pub(crate) fn show(&self, conn: ConnId, nonce: &Nonce) -> Effects {
        let mut fx = Effects::default();
        let locks = self.entities.values().map(LockEntity::summary).collect();
        fx.respond(
            conn,
            Frame::new(Status::Show).with_locks(locks).with_nonce(nonce),
        );
        fx
    }

    /// A deadline fired. The record id is looked up across entities; a
    /// record that was granted or swept in the meantime is found nowhere
    /// and the wakeup is a no-op.
    pub(crate) fn timer_fired(&mut self, record_id: RecordId) -> Effects {
        let mut fx = Effects::default();
        let mut hit = None;
        for (lock_id, entity) in self.entities.iter_mut() {
            if entity.timeout_expire(record_id, &mut fx) {
                hit = Some(lock_id.clone());
                break;
            }
        }
        if let Some(lock_id) = hit {
            self.cleanup(&lock_id);
        }
        fx
    }

    /// Connection closed: purge its holds and waits everywhere, promote
    /// whatever that frees up. The connection itself gets no messages.
    pub(crate) fn disconnect(&mut self, conn: ConnId) -> Effects {
        let mut fx = Effects::default();
        for entity in self.entities.values_mut() {
            entity.disconnect_cleanup(conn, &mut fx);
        }
        self.entities.retain(|_, entity| !entity.is_abandoned());
        fx
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        for (lock_id, entity) in &self.entities {
            entity.assert_invariants();
            assert!(
                !entity.is_abandoned(),
                "abandoned entity {} left in registry",
                lock_id
            );
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entities.len()
    }
}
