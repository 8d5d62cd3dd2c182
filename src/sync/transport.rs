//! Transport state machine and sync loop
//!
//! One internal worker owns the WebSocket connection for the lifetime of the
//! engine. The outer loop walks the connection states (connect, authenticate,
//! session, backoff); the session loop pumps the outbound queue one change at
//! a time, applies inbound changes, and keeps the heartbeat alive.
//!
//! The worker never holds the store lock across a network await: it snapshots
//! the head pending change, sends, waits for the ack, then re-acquires the
//! store to commit.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::Error;
use crate::events::{DocumentEventKind, EventDispatcher};
use crate::models::{ChangeKind, PendingChange, RemoteChange};
use crate::storage::{ApplyEffect, LocalStore};
use crate::sync::auth;
use crate::sync::backoff::Backoff;
use crate::sync::protocol::{ClientFrame, ServerFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// How long to wait for the session acknowledgement after sending hello
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection states of the transport machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not connected, not trying
    Disconnected,
    /// Transport handshake in progress
    Connecting,
    /// Waiting for the session acknowledgement
    Authenticating,
    /// Session established
    Connected,
    /// Waiting out the reconnect delay
    Backoff,
}

/// Shared, lock-free view of the current connection state
pub(crate) struct ConnectionStateCell(AtomicU8);

impl ConnectionStateCell {
    pub(crate) fn new() -> Self {
        Self(AtomicU8::new(ConnectionState::Disconnected as u8))
    }

    pub(crate) fn set(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn get(&self) -> ConnectionState {
        match self.0.load(Ordering::Relaxed) {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Authenticating,
            3 => ConnectionState::Connected,
            _ => ConnectionState::Backoff,
        }
    }
}

/// Commands sent to the sync worker
#[derive(Debug)]
pub(crate) enum WorkerCommand {
    Shutdown,
}

/// Everything the worker task needs, cloned out of the engine at startup
pub(crate) struct WorkerContext {
    pub store: Arc<LocalStore>,
    pub events: Arc<EventDispatcher>,
    pub config: EngineConfig,
    pub queue_wake: Arc<Notify>,
    pub connected: Arc<AtomicBool>,
    pub state: Arc<ConnectionStateCell>,
}

enum SessionEnd {
    Shutdown,
    Lost,
}

/// Worker entry point: reconnect loop with exponential backoff
pub(crate) async fn run(ctx: WorkerContext, mut command_rx: mpsc::Receiver<WorkerCommand>) {
    let mut backoff = Backoff::new(ctx.config.backoff_base, ctx.config.backoff_cap);

    loop {
        let attempt = backoff.attempts().saturating_add(1);
        ctx.state.set(ConnectionState::Connecting);
        debug!(attempt, url = %ctx.config.server_url, "connecting");

        let connect = tokio::select! {
            result = connect_async(ctx.config.server_url.as_str()) => Some(result),
            _ = command_rx.recv() => None,
        };
        let Some(connect) = connect else { break };

        match connect {
            Ok((ws, _response)) => {
                // Transport handshake done; the session acknowledgement is next.
                ctx.state.set(ConnectionState::Authenticating);
                ctx.events.emit_connection_attempted(attempt);

                match authenticate(&ctx, ws).await {
                    Ok(Some((ws, session))) => {
                        info!(session = %session, "connected to sync server");
                        ctx.state.set(ConnectionState::Connected);
                        ctx.events.emit_connection_succeeded();
                        backoff.reset();
                        ctx.connected.store(true, Ordering::Relaxed);

                        let end = session_loop(&ctx, ws, &mut command_rx).await;

                        ctx.connected.store(false, Ordering::Relaxed);
                        match end {
                            Ok(SessionEnd::Shutdown) => {
                                ctx.state.set(ConnectionState::Disconnected);
                                break;
                            }
                            Ok(SessionEnd::Lost) => {
                                ctx.events.emit_connection_lost();
                            }
                            Err(e) => {
                                warn!("connection dropped: {}", e);
                                ctx.events.emit_connection_lost();
                            }
                        }
                    }
                    // Authentication failure was already surfaced as an event.
                    Ok(None) => {}
                    Err(e) => {
                        debug!("handshake failed: {}", e);
                    }
                }
            }
            Err(e) => {
                debug!("connect failed: {}", e);
            }
        }

        ctx.state.set(ConnectionState::Backoff);
        let delay = backoff.next_delay();
        debug!(delay_ms = delay.as_millis() as u64, "waiting before reconnect");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = command_rx.recv() => break,
        }
    }

    ctx.state.set(ConnectionState::Disconnected);
    debug!("sync worker stopped");
}

/// Send the signed hello and wait for the session acknowledgement
///
/// Returns `Ok(None)` when the server rejected the credentials (surfaced as
/// a sync error event); transport-level failures return `Err`.
async fn authenticate(
    ctx: &WorkerContext,
    mut ws: WsStream,
) -> Result<Option<(WsStream, String)>, Error> {
    let hello = auth::hello_frame(&ctx.config);
    ws.send(Message::Text(hello.encode()))
        .await
        .map_err(|e| Error::Connection(e.to_string()))?;

    let deadline = tokio::time::Instant::now() + HANDSHAKE_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return Err(Error::Connection(
                "timed out waiting for session acknowledgement".to_string(),
            ));
        }

        tokio::select! {
            msg = ws.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match ServerFrame::decode(&text) {
                        Ok(ServerFrame::HelloOk { session }) => return Ok(Some((ws, session))),
                        Ok(ServerFrame::HelloErr { reason }) => {
                            warn!("authentication rejected: {}", reason);
                            ctx.events
                                .emit_sync_error(&format!("authentication failed: {}", reason));
                            return Ok(None);
                        }
                        // Anything else is premature; keep waiting.
                        Ok(_) => {}
                        Err(e) => {
                            ctx.events
                                .emit_sync_error(&format!("handshake frame parse failure: {}", e));
                            return Ok(None);
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(Error::Connection(
                            "server closed connection during handshake".to_string(),
                        ));
                    }
                    Some(Err(e)) => return Err(Error::Connection(e.to_string())),
                    _ => {}
                }
            }
            _ = tokio::time::sleep(remaining) => {
                return Err(Error::Connection(
                    "timed out waiting for session acknowledgement".to_string(),
                ));
            }
        }
    }
}

/// Run one connected session until shutdown, loss, or error
async fn session_loop(
    ctx: &WorkerContext,
    ws: WsStream,
    command_rx: &mut mpsc::Receiver<WorkerCommand>,
) -> Result<SessionEnd, Error> {
    let (mut write, mut read) = ws.split();

    let mut ping = tokio::time::interval(ctx.config.ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let mut last_frame = tokio::time::Instant::now();
    let mut in_flight: Option<PendingChange> = None;
    let mut draining = false;
    let mut synced_count: u64 = 0;

    // Tombstones acked before an earlier disconnect have now survived a
    // reconnect cycle.
    purge_tombstones(ctx);

    loop {
        // Pump the outbound queue, one change in flight at a time.
        if in_flight.is_none() {
            match ctx.store.head_pending() {
                Ok(Some(pending)) => {
                    if !draining {
                        ctx.events.emit_sync_started();
                        draining = true;
                        synced_count = 0;
                    }
                    debug!(
                        document_id = %pending.document_id,
                        kind = %pending.kind,
                        attempts = pending.attempts,
                        "pushing change"
                    );
                    let frame = ClientFrame::from_pending(&pending);
                    if let Err(e) = write.send(Message::Text(frame.encode())).await {
                        if let Err(db) = ctx
                            .store
                            .record_send_failure(pending.document_id, &e.to_string())
                        {
                            warn!("failed to record send failure: {}", db);
                        }
                        return Err(Error::Connection(e.to_string()));
                    }
                    in_flight = Some(pending);
                }
                Ok(None) => {
                    if draining {
                        draining = false;
                        ctx.events.emit_sync_completed(synced_count);
                        purge_tombstones(ctx);
                    }
                }
                Err(e) => {
                    warn!("failed to read outbound queue: {}", e);
                    ctx.events
                        .emit_sync_error(&format!("outbound queue read failed: {}", e));
                }
            }
        }

        tokio::select! {
            _ = command_rx.recv() => {
                let _ = write.close().await;
                return Ok(SessionEnd::Shutdown);
            }

            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_frame = tokio::time::Instant::now();
                        match ServerFrame::decode(&text) {
                            Ok(frame) => {
                                if !handle_frame(ctx, frame, &mut in_flight, &mut synced_count) {
                                    return Ok(SessionEnd::Lost);
                                }
                            }
                            Err(e) => {
                                ctx.events
                                    .emit_sync_error(&format!("protocol frame parse failure: {}", e));
                                return Ok(SessionEnd::Lost);
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_frame = tokio::time::Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Lost),
                    Some(Err(e)) => return Err(Error::Connection(e.to_string())),
                    _ => {}
                }
            }

            _ = ping.tick() => {
                if let Err(e) = write.send(Message::Text(ClientFrame::ping().encode())).await {
                    return Err(Error::Connection(e.to_string()));
                }
            }

            _ = tokio::time::sleep_until(last_frame + ctx.config.heartbeat_timeout) => {
                warn!("heartbeat timeout, dropping connection");
                return Ok(SessionEnd::Lost);
            }

            _ = ctx.queue_wake.notified() => {}
        }
    }
}

/// Handle one inbound frame; `false` means the session must be torn down
fn handle_frame(
    ctx: &WorkerContext,
    frame: ServerFrame,
    in_flight: &mut Option<PendingChange>,
    synced_count: &mut u64,
) -> bool {
    match frame {
        ServerFrame::Ack {
            id,
            server_revision,
        } => {
            match ctx.store.commit_ack(id, server_revision) {
                Ok(Some(kind)) => {
                    debug!(document_id = %id, server_revision, kind = %kind, "change acknowledged");
                    *synced_count += 1;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("failed to commit ack: {}", e);
                    ctx.events.emit_sync_error(&format!("ack commit failed: {}", e));
                }
            }
            if in_flight.as_ref().map(|p| p.document_id) == Some(id) {
                *in_flight = None;
            }
            true
        }

        ServerFrame::Change {
            op,
            id,
            body,
            server_revision,
            updated_at,
        } => {
            let change = RemoteChange {
                op,
                id,
                body,
                server_revision,
                updated_at,
            };
            match ctx.store.apply_remote(&change) {
                Ok(outcome) => {
                    if let Some(conflict) = outcome.conflict {
                        ctx.events
                            .emit_conflict(id, conflict.winning_body, conflict.losing_body);
                    }
                    match outcome.effect {
                        Some(ApplyEffect::Created(doc)) => {
                            ctx.events.emit_document(DocumentEventKind::Created, &doc);
                        }
                        Some(ApplyEffect::Updated(doc)) => {
                            ctx.events.emit_document(DocumentEventKind::Updated, &doc);
                        }
                        Some(ApplyEffect::Deleted(id)) => {
                            ctx.events.emit_document_deleted(id);
                        }
                        None => {}
                    }
                }
                Err(e) => {
                    warn!(document_id = %id, "failed to apply server change: {}", e);
                    ctx.events
                        .emit_sync_error(&format!("inbound apply failed: {}", e));
                }
            }
            true
        }

        ServerFrame::Error { message } => {
            warn!("server error: {}", message);
            ctx.events.emit_sync_error(&message);
            if let Some(pending) = in_flight.take() {
                if let Err(e) = ctx
                    .store
                    .record_send_failure(pending.document_id, &message)
                {
                    warn!("failed to record server rejection: {}", e);
                }
                if pending.kind == ChangeKind::Create {
                    // The server refused our chosen id; start over from
                    // revision zero on the next push.
                    if let Err(e) = ctx.store.reset_sync_revision(pending.document_id) {
                        warn!("failed to reset sync revision: {}", e);
                    }
                }
                // The entry stays at the head of the queue; the reconnect
                // cycle paces the retry.
                return false;
            }
            true
        }

        ServerFrame::Pong { .. } => true,

        // Only meaningful during the handshake.
        ServerFrame::HelloOk { .. } | ServerFrame::HelloErr { .. } => true,
    }
}

fn purge_tombstones(ctx: &WorkerContext) {
    if let Err(e) = ctx
        .store
        .purge_acked_tombstones(ctx.config.tombstone_retention)
    {
        warn!("tombstone purge failed: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_state_cell() {
        let cell = ConnectionStateCell::new();
        assert_eq!(cell.get(), ConnectionState::Disconnected);

        for state in [
            ConnectionState::Connecting,
            ConnectionState::Authenticating,
            ConnectionState::Connected,
            ConnectionState::Backoff,
            ConnectionState::Disconnected,
        ] {
            cell.set(state);
            assert_eq!(cell.get(), state);
        }
    }
}
