//! Invocation state machine for the queue-join protocol.
//!
//! An invocation runs one or more phases in sequence. Each phase opens its
//! own connection, answers the server's `send_hash` / `send_data` requests and
//! consumes pushes until `process_completed`.
//!
//! Within a phase two tasks cooperate: the receive loop runs on the caller's
//! task (decoding packets and running callbacks) and queues replies on a
//! bounded channel; a spawned send task drains that channel onto the socket in
//! FIFO order. When the receive loop ends it drops the sender, the send task
//! drains and exits, and the socket halves are rejoined and closed. A write
//! failure drops the receiver, which the receive loop observes.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{DecodeError, RelayError, RelayResult, TransportError};

use super::connection::{Connection, FrameReader, FrameWriter};
use super::decoder::decode;
use super::messages::{DataReply, HashReply, MessageKind, PacketOutput, ServerPacket};
use super::session::Session;

/// Replies a phase may have queued but not yet written
const OUTBOUND_QUEUE_DEPTH: usize = 16;

/// Which leg of an invocation a phase is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    /// Context priming before the real call
    Prepare,
    /// The call whose output the caller wants
    Generate,
}

impl PhaseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PhaseKind::Prepare => "prepare",
            PhaseKind::Generate => "generate",
        }
    }
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress within one phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connecting,
    Connected,
    AwaitingHash,
    AwaitingData,
    AwaitingCompletion,
}

/// Overall invocation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Idle,
    Active { phase: PhaseKind, stage: Stage },
    Done,
    Errored,
}

/// Phase-specific behaviour plugged into the shared packet handler
pub trait Phase {
    type Output;

    fn kind(&self) -> PhaseKind;

    /// Remote function index sent with every reply of this phase
    fn fn_index(&self) -> u32;

    /// The `data` array answering `send_data`
    fn payload(&self) -> RelayResult<serde_json::Value>;

    /// Handle a `process_generating` push, optionally producing a caller update
    fn on_generating(&mut self, _packet: &ServerPacket) -> RelayResult<Option<String>> {
        Ok(None)
    }

    /// Handle a successful `process_completed`
    fn on_completed(self, output: Option<&PacketOutput>) -> RelayResult<Self::Output>;
}

/// Drives one logical request against one queue host
pub struct Invocation<'a> {
    host: &'a str,
    session: &'a Session,
    state: InvocationState,
}

impl<'a> Invocation<'a> {
    pub fn new(host: &'a str, session: &'a Session) -> Self {
        Self {
            host,
            session,
            state: InvocationState::Idle,
        }
    }

    #[allow(dead_code)] // Useful for monitoring/debugging
    pub fn state(&self) -> InvocationState {
        self.state
    }

    /// Mark the invocation finished after its last phase
    pub fn finish(&mut self) {
        if self.state != InvocationState::Errored {
            self.state = InvocationState::Done;
        }
    }

    /// Run one phase to completion on a fresh connection
    pub async fn run_phase<P: Phase>(
        &mut self,
        phase: P,
        on_update: &mut dyn FnMut(&str),
    ) -> RelayResult<P::Output> {
        if matches!(self.state, InvocationState::Done | InvocationState::Errored) {
            warn!(state = ?self.state, "Phase started on a finished invocation");
        }

        let kind = phase.kind();
        info!(host = %self.host, phase = %kind, fn_index = phase.fn_index(), "Starting phase");
        self.enter(kind, Stage::Connecting);

        let mut conn = Connection::new(self.host);
        if let Err(e) = conn.connect().await {
            self.state = InvocationState::Errored;
            return Err(e.into());
        }
        self.enter(kind, Stage::Connected);

        let result = self.drive(&mut conn, phase, on_update).await;
        conn.close().await;

        match &result {
            Ok(_) => info!(phase = %kind, "Phase completed"),
            Err(e) => {
                warn!(phase = %kind, error = %e, "Phase aborted");
                self.state = InvocationState::Errored;
            }
        }
        result
    }

    async fn drive<P: Phase>(
        &mut self,
        conn: &mut Connection,
        phase: P,
        on_update: &mut dyn FnMut(&str),
    ) -> RelayResult<P::Output> {
        let (writer, mut reader) = conn.split()?;
        let (tx, rx) = mpsc::channel::<String>(OUTBOUND_QUEUE_DEPTH);
        let send_task = tokio::spawn(drain_outbound(writer, rx));

        let outcome = self.receive_loop(&mut reader, &tx, phase, on_update).await;

        // Let the send task flush what is queued and hand the write half back
        drop(tx);
        let (writer, sent) = send_task.await.map_err(TransportError::SendTask)?;
        conn.rejoin(writer, reader);

        settle(outcome, sent)
    }

    async fn receive_loop<P: Phase>(
        &mut self,
        reader: &mut FrameReader,
        tx: &mpsc::Sender<String>,
        mut phase: P,
        on_update: &mut dyn FnMut(&str),
    ) -> RelayResult<P::Output> {
        let kind = phase.kind();
        self.enter(kind, Stage::AwaitingHash);

        // TODO: bound each phase with a deadline once the upstream's worst-case
        // generation time is known; a server that never completes stalls here.
        loop {
            let frame = tokio::select! {
                frame = reader.receive() => frame?,
                _ = tx.closed() => return Err(TransportError::SenderGone.into()),
            };
            debug!(phase = %kind, frame = %String::from_utf8_lossy(&frame), "Received frame");

            let packet = decode(&frame)?;
            match packet.kind {
                MessageKind::SendHash => {
                    let reply = HashReply {
                        session_hash: &self.session.session_hash,
                        fn_index: phase.fn_index(),
                    };
                    queue_reply(tx, &reply).await?;
                    self.enter(kind, Stage::AwaitingData);
                }
                MessageKind::SendData => {
                    let reply = DataReply {
                        session_hash: &self.session.session_hash,
                        fn_index: phase.fn_index(),
                        data: phase.payload()?,
                        event_data: None,
                    };
                    queue_reply(tx, &reply).await?;
                    self.enter(kind, Stage::AwaitingCompletion);
                }
                MessageKind::Estimation | MessageKind::ProcessStarts => {}
                MessageKind::ProcessGenerating => {
                    if let Some(output) = &packet.output {
                        debug!(phase = %kind, is_generating = output.is_generating, "Generation update");
                    }
                    if let Some(update) = phase.on_generating(&packet)? {
                        on_update(&update);
                    }
                }
                MessageKind::ProcessCompleted => {
                    if packet.success == Some(false) {
                        return Err(RelayError::UpstreamGeneration {
                            phase: kind.as_str(),
                            detail: packet.output.and_then(|output| output.error),
                        });
                    }
                    if let Some(output) = &packet.output {
                        debug!(
                            phase = %kind,
                            duration = ?output.duration,
                            average_duration = ?output.average_duration,
                            "Generation finished"
                        );
                    }
                    return phase.on_completed(packet.output.as_ref());
                }
            }
        }
    }

    fn enter(&mut self, phase: PhaseKind, stage: Stage) {
        debug!(phase = %phase, stage = ?stage, "Invocation state change");
        self.state = InvocationState::Active { phase, stage };
    }
}

/// Merge the receive loop's outcome with the send task's result.
///
/// A failed write shows up on the receive side only as a closed queue, so the
/// write error replaces it.
fn settle<T>(outcome: RelayResult<T>, sent: Result<(), TransportError>) -> RelayResult<T> {
    match (outcome, sent) {
        (Err(RelayError::Transport(TransportError::SenderGone)), Err(e)) => Err(e.into()),
        (Err(e), _) => Err(e),
        (Ok(output), sent) => {
            sent?;
            Ok(output)
        }
    }
}

async fn queue_reply<T: Serialize>(tx: &mpsc::Sender<String>, reply: &T) -> RelayResult<()> {
    let text = serde_json::to_string(reply).map_err(DecodeError::Encode)?;
    tx.send(text)
        .await
        .map_err(|_| TransportError::SenderGone.into())
}

async fn drain_outbound(
    mut writer: FrameWriter,
    mut rx: mpsc::Receiver<String>,
) -> (FrameWriter, Result<(), TransportError>) {
    while let Some(text) = rx.recv().await {
        debug!(frame = %text, "Sending frame");
        if let Err(e) = writer.send(text).await {
            warn!(error = %e, "Queue write failed");
            // Dropping the receiver wakes the receive loop
            drop(rx);
            return (writer, Err(e));
        }
    }
    (writer, Ok(()))
}


#[cfg(test)]
mod tests {
    use super::test_support::{Step, handshake, push, serve};
    use super::*;

    struct EchoPhase {
        kind: PhaseKind,
    }

    impl Phase for EchoPhase {
        type Output = Vec<serde_json::Value>;

        fn kind(&self) -> PhaseKind {
            self.kind
        }

        fn fn_index(&self) -> u32 {
            7
        }

        fn payload(&self) -> RelayResult<serde_json::Value> {
            Ok(serde_json::json!(["payload", null]))
        }

        fn on_generating(&mut self, packet: &ServerPacket) -> RelayResult<Option<String>> {
            Ok(packet
                .output
                .as_ref()
                .and_then(|o| o.data.first())
                .and_then(|v| v.as_str())
                .map(str::to_string))
        }

        fn on_completed(self, output: Option<&PacketOutput>) -> RelayResult<Self::Output> {
            Ok(output.map(|o| o.data.clone()).unwrap_or_default())
        }
    }

    fn session() -> Session {
        Session {
            session_hash: "hash-1".to_string(),
        }
    }

    #[tokio::test]
    async fn test_phase_round_trip() {
        let mut script = handshake();
        script.push(push(serde_json::json!({"msg": "process_generating", "output": {"data": ["a"]}})));
        script.push(push(serde_json::json!({"msg": "process_generating", "output": {"data": ["ab"]}})));
        script.push(push(
            serde_json::json!({"msg": "process_completed", "output": {"data": ["abc"]}, "success": true}),
        ));
        let (host, server) = serve(vec![script]).await;

        let session = session();
        let mut invocation = Invocation::new(&host, &session);
        assert_eq!(invocation.state(), InvocationState::Idle);

        let mut updates = Vec::new();
        let output = invocation
            .run_phase(
                EchoPhase {
                    kind: PhaseKind::Generate,
                },
                &mut |u: &str| updates.push(u.to_string()),
            )
            .await
            .unwrap();
        invocation.finish();

        assert_eq!(output, vec![serde_json::json!("abc")]);
        assert_eq!(updates, vec!["a", "ab"]);
        assert_eq!(invocation.state(), InvocationState::Done);

        let received = server.await.unwrap();
        let frames = &received[0];
        assert_eq!(frames[0], r#"{"session_hash":"hash-1","fn_index":7}"#);
        assert_eq!(
            frames[1],
            r#"{"session_hash":"hash-1","fn_index":7,"data":["payload",null],"event_data":null}"#
        );
    }

    #[tokio::test]
    async fn test_upstream_failure() {
        let mut script = handshake();
        script.push(push(
            serde_json::json!({"msg": "process_completed", "output": {"error": "OOM"}, "success": false}),
        ));
        let (host, server) = serve(vec![script]).await;

        let session = session();
        let mut invocation = Invocation::new(&host, &session);
        let err = invocation
            .run_phase(
                EchoPhase {
                    kind: PhaseKind::Prepare,
                },
                &mut |_: &str| {},
            )
            .await
            .unwrap_err();

        match err {
            RelayError::UpstreamGeneration { phase, detail } => {
                assert_eq!(phase, "prepare");
                assert_eq!(detail.as_deref(), Some("OOM"));
            }
            other => panic!("Expected UpstreamGeneration, got {other:?}"),
        }
        assert_eq!(invocation.state(), InvocationState::Errored);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_packet_aborts() {
        let (host, server) = serve(vec![vec![Step::Push("{\"msg\":".to_string())]]).await;

        let session = session();
        let mut invocation = Invocation::new(&host, &session);
        let err = invocation
            .run_phase(
                EchoPhase {
                    kind: PhaseKind::Generate,
                },
                &mut |_: &str| {},
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Decode(DecodeError::Malformed(_))));
        assert_eq!(invocation.state(), InvocationState::Errored);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_hangup_mid_phase_is_transport_error() {
        let mut script = handshake();
        script.push(Step::Hangup);
        let (host, server) = serve(vec![script]).await;

        let session = session();
        let mut invocation = Invocation::new(&host, &session);
        let err = invocation
            .run_phase(
                EchoPhase {
                    kind: PhaseKind::Generate,
                },
                &mut |_: &str| {},
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Transport(_)));
        assert_eq!(invocation.state(), InvocationState::Errored);
        server.await.unwrap();
    }

    fn write_error() -> TransportError {
        TransportError::Write(tokio_tungstenite::tungstenite::Error::ConnectionClosed)
    }

    #[test]
    fn test_write_failure_replaces_closed_queue() {
        let outcome: RelayResult<()> = Err(TransportError::SenderGone.into());
        let err = settle(outcome, Err(write_error())).unwrap_err();
        assert!(matches!(err, RelayError::Transport(TransportError::Write(_))));
    }

    #[test]
    fn test_receive_error_wins_over_write_error() {
        let outcome: RelayResult<()> = Err(DecodeError::NoOutput.into());
        let err = settle(outcome, Err(write_error())).unwrap_err();
        assert!(matches!(err, RelayError::Decode(DecodeError::NoOutput)));
    }

    #[test]
    fn test_write_failure_after_completion_is_reported() {
        let err = settle(Ok(1), Err(write_error())).unwrap_err();
        assert!(matches!(err, RelayError::Transport(TransportError::Write(_))));
        assert_eq!(settle(Ok(1), Ok(())).unwrap(), 1);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        drop(listener);

        let session = session();
        let mut invocation = Invocation::new(&host, &session);
        let err = invocation
            .run_phase(
                EchoPhase {
                    kind: PhaseKind::Prepare,
                },
                &mut |_: &str| {},
            )
            .await
            .unwrap_err();

        assert!(matches!(err, RelayError::Connect(_)));
        assert_eq!(invocation.state(), InvocationState::Errored);
    }
}
