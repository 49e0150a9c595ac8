use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::app::error::ErrorCode;
use crate::app::service::bypass_engine::TerminalKind;
use crate::app::service::frame_codec::{extract_tlv, FrameCodec, FrameError};
use crate::app::service::policy_store::{PolicyPatch, PolicyStore};
use crate::app::service::relay_core::{self, RelayError, RelayOutcome};
use crate::app::utils::event_sink::{EventSink, RelayEvent};
use crate::models::relay::{ConfigBody, ErrorBody, RelayRequest, StatusBody};
use crate::models::wrapper::{MessageKind, Wrapper};

/// Per-connection tunables.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub idle_timeout: Duration,
    pub frame_budget: Duration,
    pub write_deadline: Duration,
    pub max_checksum_failures: u32,
    pub event_ring_capacity: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            frame_budget: Duration::from_millis(250),
            write_deadline: Duration::from_secs(5),
            max_checksum_failures: 5,
            event_ring_capacity: 64,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Opening,
    Established,
    Closed,
}

/// Per-connection scratch, exclusively owned by one handler and
/// released on disconnect.
struct SessionContext {
    session_id: Option<[u8; 16]>,
    peer_address: String,
    start_time: DateTime<Local>,
    events: VecDeque<(DateTime<Local>, String)>,
    event_capacity: usize,
    frames_processed: u64,
}

impl SessionContext {
    fn new(peer_address: String, event_capacity: usize) -> Self {
        Self {
            session_id: None,
            peer_address,
            start_time: Local::now(),
            events: VecDeque::with_capacity(event_capacity),
            event_capacity,
            frames_processed: 0,
        }
    }

    fn record(&mut self, detail: String) {
        if self.events.len() >= self.event_capacity {
            self.events.pop_front();
        }
        self.events.push_back((Local::now(), detail));
    }

    fn session_label(&self) -> String {
        self.session_id
            .map(hex::encode_upper)
            .unwrap_or_else(|| format!("peer:{}", self.peer_address))
    }
}

enum WriteStatus {
    Sent,
    Dropped,
    ConnectionDead,
}

/// Per-connection orchestrator: frame in, TLV out.
///
/// One instance is shared across connections; all mutable state lives
/// in the per-call `SessionContext`.
pub struct SessionPipeline {
    codec: FrameCodec,
    store: Arc<PolicyStore>,
    sink: Arc<EventSink>,
    settings: SessionSettings,
}

impl SessionPipeline {
    pub fn new(store: Arc<PolicyStore>, sink: Arc<EventSink>, settings: SessionSettings) -> Self {
        Self {
            codec: FrameCodec::default(),
            store,
            sink,
            settings,
        }
    }

    /// Drive one connection until close, idle timeout, repeated
    /// checksum failures or shutdown. Frames are handled strictly in
    /// arrival order; nothing is reordered within a session.
    pub async fn run<S>(&self, mut stream: S, peer: String, mut shutdown: watch::Receiver<bool>)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ctx = SessionContext::new(peer, self.settings.event_ring_capacity);
        let mut state = SessionState::Opening;
        let mut checksum_failures = 0u32;

        info!("session opened from {}", ctx.peer_address);

        while state != SessionState::Closed {
            let read = tokio::select! {
                _ = shutdown.changed() => {
                    let sid = ctx.session_id.unwrap_or_default();
                    let frame = Wrapper::new(
                        sid,
                        MessageKind::Error,
                        ErrorBody::new(ErrorCode::ShuttingDown.as_str(), "relay shutting down")
                            .to_bytes(),
                    );
                    let _ = self.send(&mut stream, &frame).await;
                    break;
                }
                read = timeout(self.settings.idle_timeout, self.codec.read_frame(&mut stream)) => read,
            };

            let frame = match read {
                Err(_) => {
                    info!("session {} idle timeout", ctx.session_label());
                    break;
                }
                Ok(Ok(None)) => {
                    debug!("session {} closed by peer", ctx.session_label());
                    break;
                }
                Ok(Ok(Some(frame))) => {
                    checksum_failures = 0;
                    frame
                }
                Ok(Err(FrameError::ChecksumMismatch)) => {
                    checksum_failures += 1;
                    warn!(
                        "session {} checksum mismatch ({}/{})",
                        ctx.session_label(),
                        checksum_failures,
                        self.settings.max_checksum_failures
                    );
                    ctx.record(format!("frame dropped: {}", ErrorCode::Checksum.as_str()));
                    if checksum_failures >= self.settings.max_checksum_failures {
                        warn!("session {} closing after repeated checksum failures", ctx.session_label());
                        break;
                    }
                    continue;
                }
                Ok(Err(FrameError::Io(e))) => {
                    warn!("session {} transport error: {}", ctx.session_label(), e);
                    break;
                }
                Ok(Err(frame_err)) => {
                    // Malformed wrapper: reject the frame, keep the session.
                    warn!("session {} bad frame: {}", ctx.session_label(), frame_err);
                    let sid = ctx.session_id.unwrap_or_default();
                    let reply = Wrapper::new(
                        sid,
                        MessageKind::Error,
                        ErrorBody::new(ErrorCode::Frame.as_str(), frame_err.to_string()).to_bytes(),
                    );
                    if matches!(self.send(&mut stream, &reply).await, WriteStatus::ConnectionDead) {
                        break;
                    }
                    continue;
                }
            };

            let next = self.handle_frame(&mut stream, &mut ctx, state, frame).await;
            state = next;
        }

        self.close(ctx);
    }

    async fn handle_frame<S>(
        &self,
        stream: &mut S,
        ctx: &mut SessionContext,
        state: SessionState,
        frame: Wrapper,
    ) -> SessionState
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match (state, frame.kind) {
            (SessionState::Opening, MessageKind::Init) => {
                ctx.session_id = Some(frame.session_id);
                ctx.record("session established".to_string());
                info!("session {} established", ctx.session_label());
                let reply = frame.reply(MessageKind::Status, self.status_body(ctx));
                match self.send(stream, &reply).await {
                    WriteStatus::ConnectionDead => SessionState::Closed,
                    _ => SessionState::Established,
                }
            }
            (SessionState::Opening, kind) => {
                warn!(
                    "session {} sent {} before INIT",
                    ctx.session_label(),
                    kind.name()
                );
                let reply = frame.reply(
                    MessageKind::Error,
                    ErrorBody::new(ErrorCode::Frame.as_str(), "session not established").to_bytes(),
                );
                match self.send(stream, &reply).await {
                    WriteStatus::ConnectionDead => SessionState::Closed,
                    _ => SessionState::Opening,
                }
            }
            (SessionState::Established, MessageKind::Init) => {
                // Repeated INIT is idempotent.
                let reply = frame.reply(MessageKind::Status, self.status_body(ctx));
                self.reply_or_close(stream, &reply).await
            }
            (SessionState::Established, MessageKind::Heartbeat) => {
                let reply = frame.reply(MessageKind::Heartbeat, frame.payload.clone());
                self.reply_or_close(stream, &reply).await
            }
            (SessionState::Established, MessageKind::Status) => {
                let reply = frame.reply(MessageKind::Status, self.status_body(ctx));
                self.reply_or_close(stream, &reply).await
            }
            (SessionState::Established, MessageKind::Relay) => {
                // Passthrough; the codec recomputes length and checksum.
                ctx.record("relay passthrough".to_string());
                let reply = frame.clone();
                self.reply_or_close(stream, &reply).await
            }
            (SessionState::Established, MessageKind::Config) => {
                let reply = self.apply_config(ctx, &frame).await;
                self.reply_or_close(stream, &reply).await
            }
            (SessionState::Established, MessageKind::NfcData | MessageKind::Emulation) => {
                let reply = self.process_nfc(ctx, &frame).await;
                self.reply_or_close(stream, &reply).await
            }
            (SessionState::Established, MessageKind::Error) => {
                warn!(
                    "session {} reported error: {}",
                    ctx.session_label(),
                    String::from_utf8_lossy(&frame.payload)
                );
                SessionState::Established
            }
            (SessionState::Closed, _) => SessionState::Closed,
        }
    }

    async fn reply_or_close<S>(&self, stream: &mut S, reply: &Wrapper) -> SessionState
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match self.send(stream, reply).await {
            WriteStatus::ConnectionDead => SessionState::Closed,
            _ => SessionState::Established,
        }
    }

    /// CONFIG frames may flip the relay toggles but never `block_all`
    /// or the signing key path.
    async fn apply_config(&self, ctx: &mut SessionContext, frame: &Wrapper) -> Wrapper {
        let body: ConfigBody = match serde_json::from_slice(&frame.payload) {
            Ok(body) => body,
            Err(e) => {
                return frame.reply(
                    MessageKind::Error,
                    ErrorBody::new(ErrorCode::Parse.as_str(), format!("bad CONFIG body: {e}"))
                        .to_bytes(),
                );
            }
        };

        if let Ok(raw) = serde_json::from_slice::<serde_json::Value>(&frame.payload) {
            for reserved in ["block_all", "private_key_path"] {
                if raw.get(reserved).is_some() {
                    warn!(
                        "session {} CONFIG tried to set reserved field {}",
                        ctx.session_label(),
                        reserved
                    );
                }
            }
        }

        let patch = PolicyPatch {
            mitm_enabled: body.mitm_enabled,
            bypass_pin: body.bypass_pin,
            cdcvm_enabled: body.cdcvm_enabled,
            enhanced_limits: body.enhanced_limits,
            ..Default::default()
        };
        match self.store.update(patch).await {
            Ok(()) => {
                ctx.record("config applied".to_string());
                frame.reply(MessageKind::Status, self.status_body(ctx))
            }
            Err(e) => {
                error!("session {} CONFIG failed: {}", ctx.session_label(), e);
                frame.reply(
                    MessageKind::Error,
                    ErrorBody::new(ErrorCode::Internal.as_str(), e.to_string()).to_bytes(),
                )
            }
        }
    }

    /// The MITM path: envelope → TLV → analyze → plan → apply → sign.
    async fn process_nfc(&self, ctx: &mut SessionContext, frame: &Wrapper) -> Wrapper {
        ctx.frames_processed += 1;

        let envelope: RelayRequest = match serde_json::from_slice(&frame.payload) {
            Ok(envelope) => envelope,
            Err(_) => {
                // Clients may push bare TLV bytes without the JSON
                // envelope; take the payload as-is.
                debug!(
                    "session {} NFC payload is not JSON, treating as raw TLV",
                    ctx.session_label()
                );
                RelayRequest {
                    raw_tlv_hex: Some(hex::encode_upper(&frame.payload)),
                    ..Default::default()
                }
            }
        };

        let tlv_bytes = match extract_tlv(&envelope) {
            Ok(bytes) => bytes,
            Err(e) => {
                ctx.record(format!("frame rejected: {e}"));
                return frame.reply(
                    MessageKind::Error,
                    ErrorBody::new(ErrorCode::Parse.as_str(), e.to_string()).to_bytes(),
                );
            }
        };

        let terminal = envelope
            .terminal_type
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(TerminalKind::Pos);

        let policy = self.store.read();
        let signer = self.store.signer();

        // CPU-bound transformation runs off the reactor under the
        // per-frame wall-clock budget.
        let compute = tokio::task::spawn_blocking(move || {
            relay_core::process_tlv(&tlv_bytes, terminal, &policy, &signer)
        });
        let outcome = match timeout(self.settings.frame_budget, compute).await {
            Err(_) => {
                warn!("session {} frame exceeded processing budget", ctx.session_label());
                ctx.record("frame dropped: budget exceeded".to_string());
                return frame.reply(
                    MessageKind::Error,
                    ErrorBody::new(ErrorCode::Timeout.as_str(), "frame processing budget exceeded")
                        .to_bytes(),
                );
            }
            Ok(Err(join_err)) => {
                error!("session {} worker failed: {}", ctx.session_label(), join_err);
                return frame.reply(
                    MessageKind::Error,
                    ErrorBody::new(ErrorCode::Internal.as_str(), "worker failure").to_bytes(),
                );
            }
            Ok(Ok(outcome)) => outcome,
        };

        match outcome {
            Ok(RelayOutcome::Blocked) => {
                ctx.record("frame blocked by policy".to_string());
                self.sink.push(RelayEvent::now(
                    ctx.session_label(),
                    "NFC_DATA blocked".to_string(),
                ));
                frame.reply(
                    MessageKind::Error,
                    ErrorBody::new(ErrorCode::Blocked.as_str(), "blocked by policy").to_bytes(),
                )
            }
            Ok(RelayOutcome::Processed(processed)) => {
                ctx.record(format!(
                    "{}: {} edits, strategy {}",
                    processed.card,
                    processed.response.mitm.applied_edits.len(),
                    processed.response.mitm.strategy.name
                ));
                if processed.high_risk {
                    self.sink.push(RelayEvent::now(
                        ctx.session_label(),
                        format!("high-risk frame: {}", processed.card),
                    ));
                }
                let body = serde_json::to_vec(&processed.response).unwrap_or_default();
                frame.reply(MessageKind::NfcData, body)
            }
            Err(RelayError::Parse(e)) => {
                ctx.record(format!("frame rejected: {e}"));
                frame.reply(
                    MessageKind::Error,
                    ErrorBody::new(ErrorCode::Parse.as_str(), e.to_string()).to_bytes(),
                )
            }
            Err(RelayError::Edit(e)) => {
                // A plan naming a protected tag is an internal invariant
                // violation, never a client error.
                error!("session {} invariant violation: {}", ctx.session_label(), e);
                frame.reply(
                    MessageKind::Error,
                    ErrorBody::new(ErrorCode::Internal.as_str(), e.to_string()).to_bytes(),
                )
            }
            Err(RelayError::Signer(e)) => {
                error!("session {} signing failed: {}", ctx.session_label(), e);
                ctx.record("frame dropped: signing failure".to_string());
                frame.reply(
                    MessageKind::Error,
                    ErrorBody::new(ErrorCode::Internal.as_str(), e.to_string()).to_bytes(),
                )
            }
        }
    }

    async fn send<S>(&self, stream: &mut S, frame: &Wrapper) -> WriteStatus
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match timeout(
            self.settings.write_deadline,
            self.codec.write_frame(stream, frame),
        )
        .await
        {
            Ok(Ok(())) => WriteStatus::Sent,
            Ok(Err(e)) => {
                warn!("outbound write failed: {}", e);
                WriteStatus::ConnectionDead
            }
            Err(_) => {
                // Slow peer: drop the frame rather than buffer without bound.
                warn!("outbound write missed deadline, dropping frame");
                WriteStatus::Dropped
            }
        }
    }

    fn status_body(&self, ctx: &SessionContext) -> Vec<u8> {
        serde_json::to_vec(&StatusBody {
            status: "ok",
            uptime_secs: (Local::now() - ctx.start_time).num_seconds(),
            frames_processed: ctx.frames_processed,
        })
        .unwrap_or_default()
    }

    fn close(&self, ctx: SessionContext) {
        info!(
            "session {} closed: {} NFC frames in {}s",
            ctx.session_label(),
            ctx.frames_processed,
            (Local::now() - ctx.start_time).num_seconds()
        );
        let label = ctx.session_label();
        for (at, detail) in ctx.events {
            self.sink.push(RelayEvent {
                at,
                session: label.clone(),
                detail,
            });
        }
    }
}
