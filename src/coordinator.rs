//! # Coordinator
//!
//! The single serialization domain. One spawned task owns the
//! [`LockRegistry`] and everything below it; parsed commands, deadline
//! wakeups and disconnects all arrive as [`CoordinatorMessage`]s on one
//! channel and are handled strictly in order. Within a handler there is no
//! await, no lock and no I/O, which is what makes the registry invariants
//! hold between messages.
//!
//! Outbound frames go to per-connection writer channels. Sending is
//! best-effort: frames for a connection that died in the meantime are
//! dropped, and the following `Disconnected` message cleans its state.

use std::{collections::HashMap, time::Duration};

use tokio::{sync::mpsc, time::Instant};

use crate::{
    base::{ConnId, RecordId, WardenResult},
    config::WardenConfig,
    protocol::{Command, Frame, InvalidCommand, Status},
    registry::{Effects, LockRegistry},
    wisdom,
};

/// Every event that may touch lock state enters through one of these.
#[derive(Debug)]
pub enum CoordinatorMessage {
    /// A freshly accepted connection, with the channel its frames go to.
    Accepted {
        conn: ConnId,
        outbound: mpsc::UnboundedSender<Frame>,
    },
    /// One decoded inbound line from a connection.
    Command { conn: ConnId, command: Command },
    /// A queued request's deadline elapsed.
    TimerFired { record_id: RecordId },
    /// The connection's socket is gone.
    Disconnected { conn: ConnId },
}

/// Cloneable sender half handed to the listener and connection tasks.
#[derive(Debug, Clone)]
pub struct CoordinatorHandle {
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
}

impl CoordinatorHandle {
    pub fn send(&self, message: CoordinatorMessage) -> WardenResult<()> {
        self.tx.send(message)?;
        Ok(())
    }
}

pub struct Coordinator {
    config: WardenConfig,
    registry: LockRegistry,
    connections: HashMap<ConnId, mpsc::UnboundedSender<Frame>>,
    /// The transmitter of messages to this coordinator; cloned into every
    /// armed timer task.
    tx: mpsc::UnboundedSender<CoordinatorMessage>,
    /// The receiver of messages to this coordinator.
    rx: mpsc::UnboundedReceiver<CoordinatorMessage>,
}

impl Coordinator {
    pub(crate) fn new(config: WardenConfig) -> (Self, mpsc::UnboundedSender<CoordinatorMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = LockRegistry::new(config.greedy_readers);
        let coordinator = Self {
            config,
            registry,
            connections: HashMap::new(),
            tx: tx.clone(),
            rx,
        };
        (coordinator, tx)
    }

    /// Starts the coordinator task and returns the handle everything else
    /// uses to reach it.
    pub fn spawn(config: WardenConfig) -> CoordinatorHandle {
        let (coordinator, tx) = Self::new(config);
        let _coordinator_handle = tokio::task::spawn(coordinator.run());
        CoordinatorHandle { tx }
    }

    pub(crate) async fn run(mut self) {
        while self.process_next().await {}
        debug!("coordinator channel closed, shutting down");
    }

    pub(crate) async fn process_next(&mut self) -> bool {
        match self.rx.recv().await {
            Some(message) => {
                self.handle_message(message);
                true
            }
            None => false,
        }
    }

    pub(crate) fn handle_message(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::Accepted { conn, outbound } => {
                debug!(%conn, "connection registered");
                self.connections.insert(conn, outbound);
                let mut fx = Effects::default();
                fx.respond(conn, Frame::new(Status::ImustBlockYou));
                self.apply(fx);
            }
            CoordinatorMessage::Command { conn, command } => self.handle_command(conn, command),
            CoordinatorMessage::TimerFired { record_id } => {
                let fx = self.registry.timer_fired(record_id);
                self.apply(fx);
            }
            CoordinatorMessage::Disconnected { conn } => {
                debug!(%conn, "connection gone, sweeping its state");
                self.connections.remove(&conn);
                let fx = self.registry.disconnect(conn);
                self.apply(fx);
            }
        }
    }

    fn handle_command(&mut self, conn: ConnId, command: Command) {
        // QUIT and half-closed sockets can race lines already in flight;
        // state must only change on behalf of live connections
        if !self.connections.contains_key(&conn) {
            debug!(%conn, "dropping command from departed connection");
            return;
        }
        let quitting = matches!(command, Command::Quit { .. });
        let fx = match command {
            Command::Wisdom { nonce } => {
                let mut fx = Effects::default();
                fx.respond(
                    conn,
                    Frame::new(Status::Wisdom)
                        .with_wisdom(wisdom::dispense())
                        .with_nonce(&nonce),
                );
                fx
            }
            Command::Acquire {
                lock_id,
                mode,
                timeout_ms,
                nonce,
            } => {
                let timeout =
                    Duration::from_millis(timeout_ms.unwrap_or(self.config.default_timeout_ms));
                let deadline = Instant::now() + timeout;
                self.registry.acquire(conn, &lock_id, mode, &nonce, deadline)
            }
            Command::Release { lock_id, nonce } => self.registry.release(conn, &lock_id, &nonce),
            Command::ReleaseAll { nonce } => self.registry.release_all(conn, &nonce, true),
            Command::Show { nonce } => self.registry.show(conn, &nonce),
            Command::Quit { nonce } => {
                let mut fx = self.registry.release_all(conn, &nonce, false);
                fx.respond(conn, Frame::new(Status::GoInPieces).with_nonce(&nonce));
                fx
            }
            Command::Invalid { kind, nonce } => {
                let status = match kind {
                    InvalidCommand::Unknown => Status::CommandNotFound,
                    InvalidCommand::BadLockId => Status::CannotAcquireInvalidLockId,
                };
                let mut fx = Effects::default();
                fx.respond(conn, Frame::new(status).with_nonce(&nonce));
                fx
            }
        };
        self.apply(fx);
        if quitting {
            // dropping the sender lets the connection task flush what is
            // buffered and then close the socket
            self.connections.remove(&conn);
        }
    }

    /// Performs what the registry asked for: route frames, arm timers.
    fn apply(&mut self, fx: Effects) {
        for (conn, frame) in fx.outbound {
            if let Some(outbound) = self.connections.get(&conn) {
                // best-effort: frames for a dead connection just vanish
                let _ = outbound.send(frame);
            }
        }
        for (record_id, deadline) in fx.timers {
            let tx = self.tx.clone();
            let _timer_handle = tokio::task::spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let _ = tx.send(CoordinatorMessage::TimerFired { record_id });
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc::{UnboundedReceiver, error::TryRecvError};

    use crate::{protocol, tests::setup_tracing};

    use super::*;

    fn new_coordinator(greedy: bool) -> Coordinator {
        setup_tracing();
        let config = WardenConfig {
            greedy_readers: greedy,
            ..WardenConfig::for_testing()
        };
        let (coordinator, _tx) = Coordinator::new(config);
        coordinator
    }

    fn connect(coordinator: &mut Coordinator, id: u64) -> (ConnId, UnboundedReceiver<Frame>) {
        let conn = ConnId::new(id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        coordinator.handle_message(CoordinatorMessage::Accepted { conn, outbound: tx });
        let banner = rx.try_recv().expect("banner frame");
        assert_eq!(banner.status, Status::ImustBlockYou);
        (conn, rx)
    }

    fn send_line(coordinator: &mut Coordinator, conn: ConnId, line: &str) {
        coordinator.handle_message(CoordinatorMessage::Command {
            conn,
            command: protocol::parse_line(line),
        });
    }

    fn recv(rx: &mut UnboundedReceiver<Frame>) -> Frame {
        rx.try_recv().expect("expected a frame")
    }

    fn assert_idle(rx: &mut UnboundedReceiver<Frame>) {
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_contention_hands_over_on_release() {
        let mut coordinator = new_coordinator(false);
        let (c1, mut rx1) = connect(&mut coordinator, 1);
        let (c2, mut rx2) = connect(&mut coordinator, 2);

        send_line(&mut coordinator, c1, "{\"command\":\"ACQUIRE\",\"lockId\":\"X\"}");
        assert_eq!(recv(&mut rx1).status, Status::Locked);

        send_line(
            &mut coordinator,
            c2,
            "{\"command\":\"ACQUIRE\",\"lockId\":\"X\",\"timeout\":2000,\"nonce\":\"n-2\"}",
        );
        assert_eq!(recv(&mut rx2).status, Status::LockPending);

        send_line(&mut coordinator, c1, "RELEASE X");
        assert_eq!(recv(&mut rx1).status, Status::Released);
        let granted = recv(&mut rx2);
        assert_eq!(granted.status, Status::Locked);
        assert_eq!(granted.mode, Some(crate::base::Mode::Write));
        assert_eq!(granted.nonce, vec!["n-2".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_fanin_and_writer_timeout() {
        let mut coordinator = new_coordinator(false);
        let mut readers = Vec::new();
        for id in 1..=3 {
            let (conn, mut rx) = connect(&mut coordinator, id);
            send_line(
                &mut coordinator,
                conn,
                "{\"command\":\"ACQUIRE\",\"lockId\":\"X\",\"mode\":\"R\"}",
            );
            assert_eq!(recv(&mut rx).status, Status::Locked);
            readers.push(rx);
        }

        let (c4, mut rx4) = connect(&mut coordinator, 4);
        let started = Instant::now();
        send_line(
            &mut coordinator,
            c4,
            "{\"command\":\"ACQUIRE\",\"lockId\":\"X\",\"timeout\":500,\"nonce\":\"w\"}",
        );
        assert_eq!(recv(&mut rx4).status, Status::LockPending);

        // the armed deadline is the next thing that can happen
        assert!(coordinator.process_next().await);
        let expired = recv(&mut rx4);
        assert_eq!(expired.status, Status::AcquireTimeout);
        assert_eq!(expired.nonce, vec!["w".to_owned()]);
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_untimed_acquire_expires_after_the_default() {
        let mut coordinator = new_coordinator(false);
        let (c1, mut rx1) = connect(&mut coordinator, 1);
        let (c2, mut rx2) = connect(&mut coordinator, 2);

        send_line(&mut coordinator, c1, "lock X");
        assert_eq!(recv(&mut rx1).status, Status::Locked);
        send_line(&mut coordinator, c2, "lock X");
        assert_eq!(recv(&mut rx2).status, Status::LockPending);

        let started = Instant::now();
        assert!(coordinator.process_next().await);
        assert_eq!(recv(&mut rx2).status, Status::AcquireTimeout);
        // for_testing sets the default deadline to 200 ms
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_promotes_queued_writer() {
        let mut coordinator = new_coordinator(false);
        let (c1, mut rx1) = connect(&mut coordinator, 1);
        let (c2, mut rx2) = connect(&mut coordinator, 2);

        send_line(&mut coordinator, c1, "lock X");
        assert_eq!(recv(&mut rx1).status, Status::Locked);
        send_line(&mut coordinator, c2, "lock X");
        assert_eq!(recv(&mut rx2).status, Status::LockPending);

        coordinator.handle_message(CoordinatorMessage::Disconnected { conn: c1 });
        assert_eq!(recv(&mut rx2).status, Status::Locked);

        send_line(&mut coordinator, c2, "SHOW");
        let shown = recv(&mut rx2);
        let locks = shown.locks.as_ref().unwrap();
        assert_eq!(locks.len(), 1);
        assert!(locks[0].writer);
        assert_eq!(locks[0].readers, 0);
        assert_eq!(locks[0].pending_writers, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quit_releases_everything_and_closes() {
        let mut coordinator = new_coordinator(false);
        let (c1, mut rx1) = connect(&mut coordinator, 1);

        send_line(&mut coordinator, c1, "lock a");
        send_line(&mut coordinator, c1, "lock b");
        assert_eq!(recv(&mut rx1).status, Status::Locked);
        assert_eq!(recv(&mut rx1).status, Status::Locked);

        send_line(&mut coordinator, c1, "{\"command\":\"QUIT\",\"nonce\":\"bye\"}");
        assert_eq!(recv(&mut rx1).status, Status::Released);
        assert_eq!(recv(&mut rx1).status, Status::Released);
        let farewell = recv(&mut rx1);
        assert_eq!(farewell.status, Status::GoInPieces);
        assert_eq!(farewell.nonce, vec!["bye".to_owned()]);
        // the coordinator dropped its sender: channel drains to closed
        assert_eq!(rx1.try_recv().unwrap_err(), TryRecvError::Disconnected);

        // lines still in flight after QUIT must not resurrect state
        send_line(&mut coordinator, c1, "lock c");
        let (c2, mut rx2) = connect(&mut coordinator, 2);
        send_line(&mut coordinator, c2, "SHOW");
        let shown = recv(&mut rx2);
        assert_eq!(shown.locks.as_ref().unwrap().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quit_with_nothing_held_stays_quiet_about_it() {
        let mut coordinator = new_coordinator(false);
        let (c1, mut rx1) = connect(&mut coordinator, 1);
        send_line(&mut coordinator, c1, "QUIT");
        // no NOLOCKSTORELEASEALL, straight to the farewell
        assert_eq!(recv(&mut rx1).status, Status::GoInPieces);
        assert_eq!(rx1.try_recv().unwrap_err(), TryRecvError::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_protocol_errors_keep_the_connection_open() {
        let mut coordinator = new_coordinator(false);
        let (c1, mut rx1) = connect(&mut coordinator, 1);

        send_line(&mut coordinator, c1, "FROBNICATE");
        assert_eq!(recv(&mut rx1).status, Status::CommandNotFound);
        send_line(&mut coordinator, c1, "ACQUIRE");
        assert_eq!(recv(&mut rx1).status, Status::CannotAcquireInvalidLockId);
        send_line(&mut coordinator, c1, "RELEASE");
        assert_eq!(recv(&mut rx1).status, Status::CommandNotFound);

        // still alive and serving
        send_line(&mut coordinator, c1, "lock X");
        assert_eq!(recv(&mut rx1).status, Status::Locked);
        assert_idle(&mut rx1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wisdom_is_dispensed_with_nonce_echo() {
        let mut coordinator = new_coordinator(false);
        let (c1, mut rx1) = connect(&mut coordinator, 1);
        send_line(&mut coordinator, c1, "{\"command\":\"WISDOM\",\"nonce\":\"hm\"}");
        let frame = recv(&mut rx1);
        assert_eq!(frame.status, Status::Wisdom);
        assert!(frame.wisdom.is_some());
        assert_eq!(frame.nonce, vec!["hm".to_owned()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_granted_request_outlives_its_timer() {
        let mut coordinator = new_coordinator(false);
        let (c1, mut rx1) = connect(&mut coordinator, 1);
        let (c2, mut rx2) = connect(&mut coordinator, 2);

        send_line(&mut coordinator, c1, "lock X");
        assert_eq!(recv(&mut rx1).status, Status::Locked);
        send_line(
            &mut coordinator,
            c2,
            "{\"command\":\"ACQUIRE\",\"lockId\":\"X\",\"timeout\":1000}",
        );
        assert_eq!(recv(&mut rx2).status, Status::LockPending);

        // grant happens well before the deadline
        send_line(&mut coordinator, c1, "RELEASE X");
        assert_eq!(recv(&mut rx1).status, Status::Released);
        assert_eq!(recv(&mut rx2).status, Status::Locked);

        // the stale wakeup still arrives, and must change nothing
        assert!(coordinator.process_next().await);
        assert_idle(&mut rx2);
        send_line(&mut coordinator, c2, "SHOW");
        let shown = recv(&mut rx2);
        assert!(shown.locks.as_ref().unwrap()[0].writer);
    }
}
