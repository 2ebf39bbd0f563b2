//! # Server
//!
//! TCP front door: the accept loop and the per-connection tasks. Each
//! connection gets one task that owns both socket halves, forwarding
//! decoded lines to the coordinator and writing back the frames the
//! coordinator routes to it. When either side of the socket gives up, the
//! task reports a disconnect and the coordinator sweeps the connection's
//! lock state.

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::mpsc,
};

use crate::{
    base::{ConnId, WardenResult},
    config::WardenConfig,
    coordinator::{Coordinator, CoordinatorHandle, CoordinatorMessage},
    protocol::{self, Frame},
};

/// Binds the configured port and serves until the process dies.
pub async fn serve(config: WardenConfig) -> WardenResult<()> {
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    serve_on(listener, config).await
}

/// Accept loop over an already-bound listener.
pub async fn serve_on(listener: TcpListener, config: WardenConfig) -> WardenResult<()> {
    info!(addr = %listener.local_addr()?, "warden listening");
    let handle = Coordinator::spawn(config);
    let mut next_conn_id = 0u64;
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                next_conn_id += 1;
                let conn = ConnId::new(next_conn_id);
                debug!(%conn, %peer, "accepted connection");
                let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
                handle.send(CoordinatorMessage::Accepted {
                    conn,
                    outbound: outbound_tx,
                })?;
                let _connection_handle =
                    tokio::task::spawn(connection_task(stream, conn, outbound_rx, handle.clone()));
            }
            Err(err) => {
                // transient accept failures (EMFILE and friends) must not
                // take the listener down
                warn!("accept failed: {}", err);
            }
        }
    }
}

/// Owns one connection: reads lines, writes frames, reports the end.
async fn connection_task(
    stream: TcpStream,
    conn: ConnId,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    handle: CoordinatorHandle,
) {
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(frame) => match frame.encode() {
                    Ok(encoded) => {
                        // best-effort write: a dead peer ends the task and
                        // the disconnect sweep does the rest
                        if write_half.write_all(encoded.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => warn!(%conn, "failed to encode frame: {}", err),
                },
                // the coordinator said goodbye; everything queued before
                // the close has been written at this point
                None => {
                    let _ = write_half.shutdown().await;
                    break;
                }
            },
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let command = protocol::parse_line(&line);
                    if handle
                        .send(CoordinatorMessage::Command { conn, command })
                        .is_err()
                    {
                        break;
                    }
                }
                Ok(None) => break, // EOF
                Err(err) => {
                    debug!(%conn, "read failed: {}", err);
                    break;
                }
            },
        }
    }
    let _ = handle.send(CoordinatorMessage::Disconnected { conn });
}
