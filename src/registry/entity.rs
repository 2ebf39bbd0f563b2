use std::collections::HashMap;

use tokio::time::Instant;

use crate::{
    base::{ConnId, LockId, Mode, Nonce, RecordId},
    protocol::{Frame, LockSummary, Status},
    registry::{
        Effects, RecordIdGen,
        queue::{RequestRecord, WaiterQueue},
    },
};

/// # Lock Entity
///
/// Reader/writer state for one lock id: at most one writer, any number of
/// readers, and one FIFO waiter queue per side. The two sides are mutually
/// exclusive; a sole reader may upgrade to writer without releasing.
///
/// Alongside each holder the entity keeps the nonce its granting acquire
/// carried, so a later release can echo it.
///
/// All methods are synchronous. Responses and timer deadlines are pushed
/// into an [`Effects`] value; the caller performs the sends.
#[derive(Debug)]
pub(crate) struct LockEntity {
    lock_id: LockId,
    writer: Option<(ConnId, Nonce)>,
    readers: HashMap<ConnId, Nonce>,
    reader_queue: WaiterQueue,
    writer_queue: WaiterQueue,
    /// Admit new readers while a writer is queued. Fixed at creation.
    greedy: bool,
}

impl LockEntity {
    pub(crate) fn new(lock_id: LockId, greedy: bool) -> Self {
        Self {
            lock_id,
            writer: None,
            readers: HashMap::new(),
            reader_queue: WaiterQueue::default(),
            writer_queue: WaiterQueue::default(),
            greedy,
        }
    }

    fn is_write_locked(&self) -> bool {
        self.writer.is_some()
    }

    /// Non-greedy mode also refuses while a writer is queued, so that new
    /// readers cannot perpetually starve it.
    fn is_read_available(&self) -> bool {
        if self.greedy {
            !self.is_write_locked()
        } else {
            !self.is_write_locked() && self.writer_queue.is_empty()
        }
    }

    /// The second clause authorizes a lock upgrade when the requesting
    /// connection is the only reader.
    fn is_write_available(&self, conn: ConnId) -> bool {
        !self.is_write_locked()
            && (self.readers.is_empty()
                || (self.readers.len() == 1 && self.readers.contains_key(&conn)))
    }

    fn holds(&self, conn: ConnId) -> bool {
        self.readers.contains_key(&conn)
            || matches!(self.writer, Some((writer, _)) if writer == conn)
    }

    /// No holder and no waiter. Eligible for removal from the registry.
    pub(crate) fn is_abandoned(&self) -> bool {
        self.writer.is_none()
            && self.readers.is_empty()
            && self.reader_queue.is_empty()
            && self.writer_queue.is_empty()
    }

    pub(crate) fn summary(&self) -> LockSummary {
        LockSummary {
            lock_id: self.lock_id.clone(),
            writer: self.is_write_locked(),
            readers: self.readers.len(),
            pending_writers: self.writer_queue.len(),
            pending_readers: self.reader_queue.len(),
        }
    }

    fn grant_frame(&self, mode: Mode, nonce: &Nonce) -> Frame {
        Frame::new(Status::Locked)
            .with_lock(&self.lock_id)
            .with_mode(mode)
            .with_nonce(nonce)
    }

    fn pending_frame(&self, mode: Mode, nonce: &Nonce) -> Frame {
        Frame::new(Status::LockPending)
            .with_lock(&self.lock_id)
            .with_mode(mode)
            .with_nonce(nonce)
    }

    pub(crate) fn acquire_read(
        &mut self,
        conn: ConnId,
        nonce: &Nonce,
        deadline: Instant,
        ids: &mut RecordIdGen,
        fx: &mut Effects,
    ) {
        // idempotent for any current holder, reader or writer
        if self.holds(conn) {
            fx.respond(conn, self.grant_frame(Mode::Read, nonce));
            return;
        }
        // a repeat acquire while already queued does not queue twice
        if self.reader_queue.contains_conn(conn) {
            fx.respond(conn, self.pending_frame(Mode::Read, nonce));
            return;
        }
        if self.is_read_available() {
            trace!(lock_id = %self.lock_id, %conn, "read grant");
            self.readers.insert(conn, nonce.clone());
            fx.respond(conn, self.grant_frame(Mode::Read, nonce));
            return;
        }
        fx.respond(conn, self.pending_frame(Mode::Read, nonce));
        self.enqueue(Mode::Read, conn, nonce, deadline, ids, fx);
    }

    pub(crate) fn acquire_write(
        &mut self,
        conn: ConnId,
        nonce: &Nonce,
        deadline: Instant,
        ids: &mut RecordIdGen,
        fx: &mut Effects,
    ) {
        if matches!(self.writer, Some((writer, _)) if writer == conn) {
            fx.respond(conn, self.grant_frame(Mode::Write, nonce));
            return;
        }
        if self.writer_queue.contains_conn(conn) {
            fx.respond(conn, self.pending_frame(Mode::Write, nonce));
            return;
        }
        if self.is_write_available(conn) {
            // removing the sole reader here realizes the upgrade
            self.readers.remove(&conn);
            trace!(lock_id = %self.lock_id, %conn, "write grant");
            self.writer = Some((conn, nonce.clone()));
            fx.respond(conn, self.grant_frame(Mode::Write, nonce));
            return;
        }
        fx.respond(conn, self.pending_frame(Mode::Write, nonce));
        self.enqueue(Mode::Write, conn, nonce, deadline, ids, fx);
    }

    fn enqueue(
        &mut self,
        mode: Mode,
        conn: ConnId,
        nonce: &Nonce,
        deadline: Instant,
        ids: &mut RecordIdGen,
        fx: &mut Effects,
    ) {
        let record = RequestRecord {
            record_id: ids.next(),
            conn,
            nonce: nonce.clone(),
            deadline,
        };
        trace!(lock_id = %self.lock_id, %conn, record_id = %record.record_id, %mode, "queued");
        fx.arm_timer(record.record_id, deadline);
        match mode {
            Mode::Read => self.reader_queue.push(record),
            Mode::Write => self.writer_queue.push(record),
        }
    }

    /// Releases whichever side `conn` holds. Returns whether anything was
    /// released. With `suppress_miss` a non-holder gets no answer, which
    /// is what the bulk sweeps want.
    pub(crate) fn release(
        &mut self,
        conn: ConnId,
        release_nonce: &Nonce,
        suppress_miss: bool,
        fx: &mut Effects,
    ) -> bool {
        if matches!(self.writer, Some((writer, _)) if writer == conn) {
            let (_, acquire_nonce) = self.writer.take().expect("writer was just matched");
            trace!(lock_id = %self.lock_id, %conn, "write release");
            fx.respond(
                conn,
                Frame::new(Status::Released)
                    .with_lock(&self.lock_id)
                    .with_mode(Mode::Write)
                    .with_nonce(&acquire_nonce)
                    .with_nonce(release_nonce),
            );
            self.abdicate(fx);
            return true;
        }
        if let Some(acquire_nonce) = self.readers.remove(&conn) {
            trace!(lock_id = %self.lock_id, %conn, "read release");
            fx.respond(
                conn,
                Frame::new(Status::Released)
                    .with_lock(&self.lock_id)
                    .with_mode(Mode::Read)
                    .with_nonce(&acquire_nonce)
                    .with_nonce(release_nonce),
            );
            self.abdicate(fx);
            return true;
        }
        if !suppress_miss {
            fx.respond(
                conn,
                Frame::new(Status::NoLockToRelease)
                    .with_lock(&self.lock_id)
                    .with_nonce(release_nonce),
            );
        }
        false
    }

    /// Promotion loop run after any release, expiry or disconnect sweep.
    ///
    /// Readers drain first, for as long as reads stay available; then the
    /// head writer is granted if the write side is free. Granting a writer
    /// closes the write side again, so at most one writer goes per cycle.
    fn abdicate(&mut self, fx: &mut Effects) {
        while !self.reader_queue.is_empty() && self.is_read_available() {
            let record = self.reader_queue.pop_front().expect("queue is non-empty");
            if !self.holds(record.conn) {
                self.readers.insert(record.conn, record.nonce.clone());
            }
            trace!(lock_id = %self.lock_id, conn = %record.conn, "read grant by abdication");
            fx.respond(record.conn, self.grant_frame(Mode::Read, &record.nonce));
        }
        while let Some(head) = self.writer_queue.front() {
            if !self.is_write_available(head.conn) {
                break;
            }
            let record = self.writer_queue.pop_front().expect("queue is non-empty");
            // a queued upgrade leaves the reader side now
            self.readers.remove(&record.conn);
            trace!(lock_id = %self.lock_id, conn = %record.conn, "write grant by abdication");
            self.writer = Some((record.conn, record.nonce.clone()));
            fx.respond(record.conn, self.grant_frame(Mode::Write, &record.nonce));
        }
    }

    /// Deadline wakeup for a queued request. A record that was granted or
    /// swept away in the meantime is simply no longer here, making the
    /// stale wakeup a no-op. Returns whether the record was found.
    pub(crate) fn timeout_expire(&mut self, record_id: RecordId, fx: &mut Effects) -> bool {
        let (record, mode) = match self.reader_queue.remove(record_id) {
            Some(record) => (record, Mode::Read),
            None => match self.writer_queue.remove(record_id) {
                Some(record) => (record, Mode::Write),
                None => return false,
            },
        };
        debug!(lock_id = %self.lock_id, conn = %record.conn, %mode, "acquire timed out");
        fx.respond(
            record.conn,
            Frame::new(Status::AcquireTimeout)
                .with_lock(&self.lock_id)
                .with_mode(mode)
                .with_nonce(&record.nonce),
        );
        // an expired writer may have been the only thing blocking readers
        self.abdicate(fx);
        true
    }

    /// Removes every trace of a closed connection, then promotes. Nothing
    /// is sent to the connection itself; it is gone.
    pub(crate) fn disconnect_cleanup(&mut self, conn: ConnId, fx: &mut Effects) {
        let mut changed = false;
        if matches!(self.writer, Some((writer, _)) if writer == conn) {
            self.writer = None;
            changed = true;
        }
        changed |= self.readers.remove(&conn).is_some();
        changed |= self.reader_queue.remove_conn(conn) > 0;
        changed |= self.writer_queue.remove_conn(conn) > 0;
        if changed {
            trace!(lock_id = %self.lock_id, %conn, "swept after disconnect");
            self.abdicate(fx);
        }
    }

    #[cfg(test)]
    pub(crate) fn assert_invariants(&self) {
        assert!(
            self.writer.is_none() || self.readers.is_empty(),
            "writer and readers occupied at once on {}",
            self.lock_id
        );
        if let Some((writer, _)) = &self.writer {
            assert!(
                !self.readers.contains_key(writer),
                "writer {} also holds read on {}",
                writer,
                self.lock_id
            );
            assert!(
                !self.writer_queue.contains_conn(*writer),
                "writer {} also queued for write on {}",
                writer,
                self.lock_id
            );
        }
        for conn in self.readers.keys() {
            assert!(
                !self.reader_queue.contains_conn(*conn),
                "reader {} also queued for read on {}",
                conn,
                self.lock_id
            );
        }
        for queue in [&self.reader_queue, &self.writer_queue] {
            let mut conns = queue.conns();
            conns.sort_unstable();
            let len = conns.len();
            conns.dedup();
            assert_eq!(conns.len(), len, "duplicate queue entry on {}", self.lock_id);
        }
    }
}
