//! Per-client proxy session.
//!
//! After the dispatcher hands over a framed client connection, the session
//! intercepts the HELLO for authentication, opens the upstream, and then
//! shuttles messages until either side gives up. Two tasks cooperate while
//! a transaction is live: this loop reads the client and writes upstream;
//! a forwarding task reads the upstream and writes to the client. They
//! never write to the same connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use crate::backend::Backend;
use crate::error::ProxyError;
use crate::framing::{BoltConn, SharedSink};
use crate::message::{validate_mode, Message, MessageKind};
use crate::packstream;
use crate::version::Version;

/// How long a fresh client gets to send its HELLO.
const HELLO_TIMEOUT: Duration = Duration::from_secs(30);
/// Idle cap for both the client loop and the upstream forwarder.
const MAX_IDLE: Duration = Duration::from_secs(30 * 60);
/// How long to wait for a halted forwarder to acknowledge.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Transaction-boundary bookkeeping for the client message stream.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct TxState {
    /// The current message opens a transaction.
    starting: bool,
    /// Inside an explicit BEGIN .. COMMIT/ROLLBACK.
    in_manual: bool,
}

impl TxState {
    /// Updates the state for an inbound client message.
    ///
    /// BEGIN opens a manual transaction; RUN outside one opens an
    /// auto-commit transaction; COMMIT and ROLLBACK close whatever is open.
    fn update(&mut self, kind: MessageKind) {
        match kind {
            MessageKind::Begin => {
                self.starting = true;
                self.in_manual = true;
            }
            MessageKind::Run if !self.in_manual => self.starting = true,
            MessageKind::Commit | MessageKind::Rollback => {
                self.in_manual = false;
                self.starting = false;
            }
            _ => {}
        }
    }
}

/// Runs one client session to completion, closing the client connection on
/// every exit path so its reader task can wind down.
pub async fn run(
    mut client: BoltConn,
    client_version: Version,
    backend: Arc<Backend>,
) -> Result<(), ProxyError> {
    let result = drive(&mut client, client_version, backend).await;
    let _ = client.sink().close().await;
    tracing::debug!("session closed");
    result
}

async fn drive(
    client: &mut BoltConn,
    client_version: Version,
    backend: Arc<Backend>,
) -> Result<(), ProxyError> {
    // HELLO phase: the first message decides everything.
    let hello = match timeout(HELLO_TIMEOUT, client.next_message()).await {
        Ok(Some(msg)) => msg,
        Ok(None) => {
            tracing::debug!("client hung up before HELLO");
            return Ok(());
        }
        Err(_) => return Err(ProxyError::Timeout("client HELLO")),
    };
    log_message("C->P", &hello);
    if hello.kind != MessageKind::Hello {
        return Err(ProxyError::Malformed(format!(
            "expected HELLO, got {}",
            hello.kind
        )));
    }

    // Auth runs before anything is revealed to the client; a rejected
    // client gets a closed socket, not a FAILURE.
    backend.authenticate(&hello).await?;

    let upstream = backend.init_connection(&hello.data).await?;
    tracing::info!(
        version = %client_version,
        backend = %backend.address(),
        "authenticated client attached to backend"
    );

    let success = Message::hello_success();
    log_message("P->C", &success);
    client.write_message(&success).await?;

    let client_sink = client.sink();
    let (upstream_rx, upstream_sink) = upstream.split();

    let result = event_loop(client, client_sink, upstream_rx, upstream_sink.clone()).await;
    let _ = upstream_sink.close().await;
    result
}

/// The client-side event loop: reads client messages, tracks transaction
/// boundaries, and forwards to the upstream once a transaction is live.
async fn event_loop(
    client: &mut BoltConn,
    client_sink: SharedSink,
    upstream_rx: mpsc::Receiver<Message>,
    upstream_sink: SharedSink,
) -> Result<(), ProxyError> {
    let mut tx_state = TxState::default();
    // The upstream's read half sits here until the first transaction
    // spawns a forwarder; rotations recover it from the finished task.
    let mut upstream_rx = Some(upstream_rx);
    let mut forwarder: Option<JoinHandle<mpsc::Receiver<Message>>> = None;
    let mut halt_tx: Option<mpsc::Sender<bool>> = None;
    let mut ack_rx: Option<mpsc::Receiver<bool>> = None;

    loop {
        let msg = tokio::select! {
            m = client.next_message() => match m {
                Some(m) => m,
                None => {
                    tracing::debug!("potential client hangup");
                    signal_halt(&halt_tx);
                    return Ok(());
                }
            },
            _ = sleep(MAX_IDLE) => {
                tracing::warn!("client idle timeout");
                signal_halt(&halt_tx);
                return Err(ProxyError::Timeout("idle client"));
            }
        };
        log_message("C->P", &msg);

        tx_state.update(msg.kind);

        if tx_state.starting {
            validate_tx_start(&msg)?;
            let mode = validate_mode(&msg.data)?;
            tracing::debug!(kind = %msg.kind, %mode, "transaction starting");

            // Stop the previous forwarder and take the upstream reader back.
            if let Some(task) = forwarder.take() {
                signal_halt(&halt_tx);
                if let Some(ack) = ack_rx.as_mut() {
                    if timeout(ACK_TIMEOUT, ack.recv()).await.is_err() {
                        tracing::warn!("timeout waiting for forwarder ack");
                    }
                }
                let rx = task
                    .await
                    .map_err(|e| ProxyError::Session(format!("forwarder task failed: {e}")))?;
                upstream_rx = Some(rx);
            }

            // Fresh latches per forwarder; stale halt/ack values from the
            // previous transaction must not leak into the new one.
            let (h_tx, h_rx) = mpsc::channel(1);
            let (a_tx, a_rx) = mpsc::channel(1);
            let rx = upstream_rx
                .take()
                .ok_or_else(|| ProxyError::Session("upstream reader went missing".into()))?;
            forwarder = Some(tokio::spawn(forward_upstream(
                rx,
                client_sink.clone(),
                h_rx,
                a_tx,
            )));
            halt_tx = Some(h_tx);
            ack_rx = Some(a_rx);
            tx_state.starting = false;
        }

        if forwarder.is_some() {
            log_message("P->S", &msg);
            upstream_sink.write_message(&msg).await?;
        } else {
            // No transaction yet: answer the handful of messages that make
            // sense without an upstream.
            match msg.kind {
                MessageKind::Reset => {
                    let reply = Message::empty_success();
                    log_message("P->C", &reply);
                    client.write_message(&reply).await?;
                }
                MessageKind::Goodbye => return Ok(()),
                _ => {}
            }
        }
    }
}

/// Checks that a transaction-opening message parses: a BEGIN body is a map,
/// a RUN body is the query string followed by its parameter map.
fn validate_tx_start(msg: &Message) -> Result<(), ProxyError> {
    let body = &msg.data[4..];
    match msg.kind {
        MessageKind::Begin => {
            packstream::parse_map(body)?;
        }
        MessageKind::Run => {
            let (_, pos) = packstream::parse_string(body)?;
            packstream::parse_map(&body[pos..])?;
        }
        _ => {}
    }
    Ok(())
}

/// The server-side forwarding task.
///
/// Streams upstream messages to the client until a GOODBYE, a hangup, the
/// idle cap, or a halt request. Whatever the cause, the ack latch is filled
/// (non-blocking) and the upstream reader is handed back for a successor.
async fn forward_upstream(
    mut upstream_rx: mpsc::Receiver<Message>,
    client: SharedSink,
    mut halt: mpsc::Receiver<bool>,
    ack: mpsc::Sender<bool>,
) -> mpsc::Receiver<Message> {
    loop {
        tokio::select! {
            msg = upstream_rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = client.write_message(&msg).await {
                        tracing::warn!(error = %e, "write to client failed");
                        break;
                    }
                    log_message("C<-P", &msg);
                    if msg.kind == MessageKind::Goodbye {
                        break;
                    }
                }
                None => {
                    tracing::debug!("potential server hangup");
                    break;
                }
            },
            _ = halt.recv() => {
                tracing::debug!("forwarder asked to halt");
                break;
            }
            _ = sleep(MAX_IDLE) => {
                tracing::warn!("timeout reading server");
                break;
            }
        }
    }

    if ack.try_send(true).is_err() {
        tracing::debug!("ack latch already filled");
    }
    upstream_rx
}

/// Requests a halt without blocking; a forwarder that already stopped (or
/// was already asked) leaves the latch full, which is fine.
fn signal_halt(halt: &Option<mpsc::Sender<bool>>) {
    if let Some(halt) = halt {
        if halt.try_send(true).is_err() {
            tracing::debug!("forwarder already halting");
        }
    }
}

/// Debug-logs a message without leaking secrets: a HELLO shows only its
/// first four bytes, everything else is capped at 32 bytes.
fn log_message(who: &str, msg: &Message) {
    const MAX_BYTES: usize = 32;
    match msg.kind {
        MessageKind::Hello => {
            let head = &msg.data[..msg.data.len().min(4)];
            tracing::debug!(%who, kind = %msg.kind, data = ?head, "proxied message");
        }
        _ => {
            let end = msg.data.len().min(MAX_BYTES);
            tracing::debug!(
                %who,
                kind = %msg.kind,
                size = msg.data.len(),
                data = ?&msg.data[..end],
                "proxied message"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn begin_opens_manual_tx() {
        let mut state = TxState::default();
        state.update(MessageKind::Begin);
        assert!(state.starting);
        assert!(state.in_manual);
    }

    #[test]
    fn run_inside_manual_tx_does_not_restart() {
        let mut state = TxState::default();
        state.update(MessageKind::Begin);
        state.starting = false; // forwarder spawned
        state.update(MessageKind::Run);
        assert!(!state.starting);
        assert!(state.in_manual);
    }

    #[test]
    fn run_outside_tx_starts_auto_commit() {
        let mut state = TxState::default();
        state.update(MessageKind::Run);
        assert!(state.starting);
        assert!(!state.in_manual);
    }

    #[test]
    fn commit_and_rollback_clear_state() {
        for closer in [MessageKind::Commit, MessageKind::Rollback] {
            let mut state = TxState::default();
            state.update(MessageKind::Begin);
            state.update(closer);
            assert_eq!(state, TxState::default(), "{closer}");
        }
    }

    #[test]
    fn pull_leaves_state_alone() {
        let mut state = TxState::default();
        state.update(MessageKind::Run);
        state.starting = false;
        state.update(MessageKind::Pull);
        assert!(!state.starting);
    }

    fn msg(kind: MessageKind, data: &[u8]) -> Message {
        Message::new(kind, Bytes::copy_from_slice(data))
    }

    #[test]
    fn valid_begin_passes() {
        // BEGIN with an empty map.
        let begin = msg(MessageKind::Begin, &[0x00, 0x03, 0xB1, 0x11, 0xA0, 0x00, 0x00]);
        assert!(validate_tx_start(&begin).is_ok());
    }

    #[test]
    fn begin_without_map_fails() {
        let begin = msg(MessageKind::Begin, &[0x00, 0x03, 0xB1, 0x11, 0x01, 0x00, 0x00]);
        assert!(validate_tx_start(&begin).is_err());
    }

    #[test]
    fn valid_run_passes() {
        // RUN "q" {}; the third field is elided, only query + params are checked.
        let run = msg(
            MessageKind::Run,
            &[0x00, 0x05, 0xB1, 0x10, 0x81, b'q', 0xA0, 0x00, 0x00],
        );
        assert!(validate_tx_start(&run).is_ok());
    }

    #[test]
    fn run_without_query_fails() {
        let run = msg(MessageKind::Run, &[0x00, 0x03, 0xB1, 0x10, 0xA0, 0x00, 0x00]);
        assert!(validate_tx_start(&run).is_err());
    }

    #[tokio::test]
    async fn forwarder_acks_on_halt() {
        let (_up_tx, up_rx) = mpsc::channel::<Message>(4);
        let (local, _remote) = tokio::io::duplex(256);
        let client = BoltConn::direct(local);
        let (halt_tx, halt_rx) = mpsc::channel(1);
        let (ack_tx, mut ack_rx) = mpsc::channel(1);

        let task = tokio::spawn(forward_upstream(up_rx, client.sink(), halt_rx, ack_tx));
        halt_tx.try_send(true).unwrap();

        let acked = timeout(Duration::from_secs(5), ack_rx.recv())
            .await
            .expect("ack in time");
        assert_eq!(acked, Some(true));
        // The upstream reader comes back for the next forwarder.
        task.await.unwrap();
    }

    #[tokio::test]
    async fn forwarder_relays_until_goodbye() {
        use tokio::io::AsyncReadExt;

        let (up_tx, up_rx) = mpsc::channel::<Message>(4);
        let (local, mut remote) = tokio::io::duplex(1024);
        let client = BoltConn::direct(local);
        let (_halt_tx, halt_rx) = mpsc::channel(1);
        let (ack_tx, mut ack_rx) = mpsc::channel(1);

        let task = tokio::spawn(forward_upstream(up_rx, client.sink(), halt_rx, ack_tx));

        let record_bytes = [0x00, 0x04, 0xB1, 0x71, 0x91, 0x01, 0x00, 0x00];
        let goodbye_bytes = [0x00, 0x02, 0xB0, 0x02, 0x00, 0x00];
        up_tx
            .send(msg(MessageKind::Record, &record_bytes))
            .await
            .unwrap();
        up_tx
            .send(msg(MessageKind::Goodbye, &goodbye_bytes))
            .await
            .unwrap();

        let mut readback = [0u8; 14];
        remote.read_exact(&mut readback).await.unwrap();
        assert_eq!(&readback[..8], &record_bytes);
        assert_eq!(&readback[8..], &goodbye_bytes);

        // GOODBYE from the server ends the forwarder on its own.
        let acked = timeout(Duration::from_secs(5), ack_rx.recv())
            .await
            .expect("ack in time");
        assert_eq!(acked, Some(true));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn forwarder_stops_on_upstream_hangup() {
        let (up_tx, up_rx) = mpsc::channel::<Message>(4);
        let (local, _remote) = tokio::io::duplex(256);
        let client = BoltConn::direct(local);
        let (_halt_tx, halt_rx) = mpsc::channel(1);
        let (ack_tx, mut ack_rx) = mpsc::channel(1);

        let task = tokio::spawn(forward_upstream(up_rx, client.sink(), halt_rx, ack_tx));
        drop(up_tx);

        let acked = timeout(Duration::from_secs(5), ack_rx.recv())
            .await
            .expect("ack in time");
        assert_eq!(acked, Some(true));
        task.await.unwrap();
    }
}
