//! Presence IPC client: connection state machine and request/response calls.
//!
//! The protocol is strictly request/response. Every call writes one frame and
//! consumes its reply before returning, so a client never has more than one
//! request in flight. The client is not thread-safe on its own; the session
//! controller serializes access behind its mutex.
//!
//! ## State Machine
//!
//! ```text
//! Unconnected → Connecting → Handshaking → Connected
//!                   ↑                          │ (I/O failure)
//!                   └────── Disconnected ←─────┘
//! close() from any state → Closed
//! ```

use presence_protocol::{
    classify_response, decode_header, encode_command, encode_frame, error_fields_from_body,
    ActivityPayload, DispatchProbe, Handshake, Opcode, PresenceActivity, ResponseStatus,
    SetActivityCommand, HEADER_LEN,
};
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

use crate::error::PresenceError;
use crate::transport::{Channel, Connector, IPC_SLOT_COUNT};

const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_PING_EVERY: u32 = 15;
// Unsolicited PINGs answered before giving up on the real reply.
const MAX_INTERLEAVED_PINGS: usize = 4;

/// Receives the human-readable text of every failure the client reports.
pub type ErrorCallback = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Handshaking,
    Connected,
    Disconnected,
    Closed,
}

pub struct PresenceClient {
    connector: Box<dyn Connector>,
    channel: Option<Box<dyn Channel>>,
    state: ConnectionState,
    slot: Option<u8>,
    write_timeout: Duration,
    read_timeout: Duration,
    ping_every: u32,
    ticks: u32,
    idle: bool,
    pid: u32,
    on_error: Option<ErrorCallback>,
}

impl PresenceClient {
    pub fn new(connector: Box<dyn Connector>) -> Self {
        Self {
            connector,
            channel: None,
            state: ConnectionState::Unconnected,
            slot: None,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            ping_every: DEFAULT_PING_EVERY,
            ticks: 0,
            idle: false,
            pid: std::process::id(),
            on_error: None,
        }
    }

    pub fn with_timeouts(mut self, write: Duration, read: Duration) -> Self {
        self.write_timeout = write;
        self.read_timeout = read;
        self
    }

    /// Number of [`update`](Self::update) ticks between DISPATCH round-trips.
    pub fn with_ping_every(mut self, ticks: u32) -> Self {
        self.ping_every = ticks.max(1);
        self
    }

    pub fn with_error_callback(mut self, callback: ErrorCallback) -> Self {
        self.on_error = Some(callback);
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.channel.is_some()
    }

    /// Slot number of the live connection.
    pub fn slot(&self) -> Option<u8> {
        self.slot
    }

    pub fn is_idle(&self) -> bool {
        self.idle
    }

    /// Probes every candidate slot in order and keeps the first one whose
    /// handshake is accepted. Returns the slot number.
    pub fn connect(&mut self, client_id: u64) -> Result<u8, PresenceError> {
        if self.is_connected() {
            if let Some(slot) = self.slot {
                return Ok(slot);
            }
        }

        for slot in 0..IPC_SLOT_COUNT {
            if let Ok(slot) = self.connect_slot(client_id, slot) {
                return Ok(slot);
            }
        }

        // An absent peer is the normal state until it starts; the caller
        // retries, so this is not reported through the callback.
        Err(PresenceError::PeerUnavailable)
    }

    /// Opens a single `slot` and handshakes on it, replacing any current
    /// channel. On failure the client is left `Unconnected`, so callers can
    /// drive the slot scan themselves and stop between slots.
    pub fn connect_slot(&mut self, client_id: u64, slot: u8) -> Result<u8, PresenceError> {
        self.drop_channel();
        self.state = ConnectionState::Connecting;

        let channel = match self.connector.open(slot) {
            Ok(channel) => channel,
            Err(err) => {
                tracing::trace!(slot, error = %err, "IPC slot unavailable");
                self.state = ConnectionState::Unconnected;
                return Err(err);
            }
        };

        self.channel = Some(channel);
        self.state = ConnectionState::Handshaking;
        match self.round_trip(Opcode::Handshake, &Handshake::new(client_id)) {
            Ok(()) => {
                self.state = ConnectionState::Connected;
                self.slot = Some(slot);
                self.ticks = 0;
                self.idle = false;
                tracing::info!(
                    slot,
                    channel = %self.connector.channel_name(slot),
                    "Connected to presence peer"
                );
                Ok(slot)
            }
            Err(err) => {
                let err = match err {
                    PresenceError::PeerReported { code, message }
                    | PresenceError::PeerClosedWith { code, message } => {
                        PresenceError::HandshakeRejected {
                            reason: format!("{}: {}", code, message),
                        }
                    }
                    other => other,
                };
                tracing::debug!(slot, error = %err, "Handshake failed");
                if matches!(err, PresenceError::HandshakeRejected { .. }) {
                    self.report(&err);
                }
                self.drop_channel();
                self.state = ConnectionState::Unconnected;
                Err(err)
            }
        }
    }

    pub fn set_presence(&mut self, activity: &PresenceActivity) -> Result<(), PresenceError> {
        let command = SetActivityCommand::new(
            self.pid,
            Some(ActivityPayload::from_activity(activity)),
            generate_nonce(),
        );
        self.request(&command)?;
        self.idle = false;
        Ok(())
    }

    /// Shows the reduced idle variant of `activity`.
    ///
    /// `None` only leaves idle mode; it writes nothing. The caller is expected
    /// to follow up with [`set_presence`](Self::set_presence).
    pub fn set_idle_status(
        &mut self,
        activity: Option<&PresenceActivity>,
    ) -> Result<(), PresenceError> {
        let activity = match activity {
            Some(activity) => activity,
            None => {
                self.idle = false;
                return Ok(());
            }
        };

        let command = SetActivityCommand::new(
            self.pid,
            Some(ActivityPayload::idle(activity)),
            generate_nonce(),
        );
        self.request(&command)?;
        self.idle = true;
        Ok(())
    }

    /// Heartbeat tick. Probes the channel every tick and does a full
    /// DISPATCH/READY round-trip every `ping_every` ticks.
    pub fn update(&mut self) -> Result<(), PresenceError> {
        if !self.is_connected() {
            return Err(PresenceError::NotConnected);
        }

        self.ticks += 1;
        if self.ticks < self.ping_every {
            let result = self.probe();
            return self.finish(result);
        }

        self.ticks = 0;
        self.request(&DispatchProbe::default())
    }

    /// Explicit liveness check: probe plus a DISPATCH/READY round-trip.
    pub fn check_connection(&mut self) -> Result<(), PresenceError> {
        if !self.is_connected() {
            return Err(self.fail(PresenceError::NotConnected));
        }
        let result = self.probe();
        self.finish(result)?;
        self.request(&DispatchProbe::default())
    }

    /// Clears the activity on a best-effort basis and releases the channel.
    /// Never fails; a stuck peer costs at most one write and one read timeout.
    pub fn close(&mut self) {
        if self.is_connected() {
            let command = SetActivityCommand::clear(self.pid, generate_nonce());
            if let Err(err) = self.round_trip(Opcode::Frame, &command) {
                tracing::debug!(error = %err, "Failed to clear activity during close");
            }
        }
        self.drop_channel();
        self.state = ConnectionState::Closed;
        self.idle = false;
    }

    fn request<T: Serialize>(&mut self, command: &T) -> Result<(), PresenceError> {
        if !self.is_connected() {
            return Err(self.fail(PresenceError::NotConnected));
        }
        // Encoding fails before any byte is written; the channel stays usable.
        let frame = match encode_command(Opcode::Frame, command) {
            Ok(frame) => frame,
            Err(err) => return Err(self.fail(err.into())),
        };
        let result = self.exchange(&frame);
        self.finish(result)
    }

    fn probe(&mut self) -> Result<(), PresenceError> {
        match self.channel.as_mut() {
            Some(channel) => channel.probe(),
            None => Err(PresenceError::NotConnected),
        }
    }

    fn round_trip<T: Serialize>(&mut self, opcode: Opcode, command: &T) -> Result<(), PresenceError> {
        let frame = encode_command(opcode, command)?;
        self.exchange(&frame)
    }

    /// Writes one encoded frame and consumes its reply. Does not touch
    /// connection state; callers decide what a failure means.
    fn exchange(&mut self, frame: &[u8]) -> Result<(), PresenceError> {
        let (write_timeout, read_timeout) = (self.write_timeout, self.read_timeout);
        let channel = self.channel.as_mut().ok_or(PresenceError::NotConnected)?;

        channel.probe()?;
        channel.write_timed(frame, write_timeout)?;

        for _ in 0..=MAX_INTERLEAVED_PINGS {
            let header = decode_header(&channel.read_timed(HEADER_LEN, read_timeout)?)?;
            let body = if header.payload_len() > 0 {
                channel.read_timed(header.payload_len(), read_timeout)?
            } else {
                Vec::new()
            };

            match header.opcode()? {
                Opcode::Ping => {
                    let pong = encode_frame(Opcode::Pong, &body)?;
                    channel.write_timed(&pong, write_timeout)?;
                    continue;
                }
                Opcode::Close => {
                    let (code, message) = error_fields_from_body(&body);
                    return Err(PresenceError::PeerClosedWith { code, message });
                }
                Opcode::Handshake | Opcode::Frame | Opcode::Pong => {
                    return match classify_response(&body) {
                        ResponseStatus::Accepted => Ok(()),
                        ResponseStatus::Rejected { code, message } => {
                            Err(PresenceError::PeerReported { code, message })
                        }
                    };
                }
            }
        }

        Err(PresenceError::ReadTimeout)
    }

    fn finish(&mut self, result: Result<(), PresenceError>) -> Result<(), PresenceError> {
        result.map_err(|err| {
            if err.drops_connection() {
                tracing::warn!(error = %err, "Presence channel dropped");
                self.drop_channel();
                self.state = ConnectionState::Disconnected;
            }
            self.fail(err)
        })
    }

    fn fail(&self, err: PresenceError) -> PresenceError {
        self.report(&err);
        err
    }

    fn report(&self, err: &PresenceError) {
        if let Some(callback) = &self.on_error {
            callback(&err.to_string());
        }
    }

    fn drop_channel(&mut self) {
        if let Some(mut channel) = self.channel.take() {
            channel.close();
        }
        self.slot = None;
    }
}

impl Drop for PresenceClient {
    fn drop(&mut self) {
        if self.state != ConnectionState::Closed {
            self.close();
        }
    }
}

/// Six-digit correlation token for the peer's request/reply pairing.
fn generate_nonce() -> String {
    rand::thread_rng().gen_range(100_000..=999_999).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPeer, Reply};
    use std::sync::Mutex;

    const CLIENT_ID: u64 = 123456789012345678;

    fn recording_callback() -> (ErrorCallback, Arc<Mutex<Vec<String>>>) {
        let messages = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&messages);
        let callback: ErrorCallback = Arc::new(move |message: &str| {
            sink.lock().unwrap().push(message.to_string());
        });
        (callback, messages)
    }

    #[test]
    fn connect_probes_slots_in_order_and_uses_first_live_one() {
        let peer = MockPeer::new().with_live_slots(&[3, 5]);
        let mut client = PresenceClient::new(peer.connector());

        assert_eq!(client.connect(CLIENT_ID).unwrap(), 3);
        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(peer.open_attempts(), vec![0, 1, 2, 3]);

        let handshake = peer.frames().remove(0);
        assert_eq!(handshake.opcode, Opcode::Handshake);
        assert_eq!(
            handshake.json(),
            serde_json::json!({"v": 1, "client_id": "123456789012345678"})
        );
    }

    #[test]
    fn connect_fails_when_no_slot_is_live() {
        let peer = MockPeer::new();
        let (callback, messages) = recording_callback();
        let mut client = PresenceClient::new(peer.connector()).with_error_callback(callback);

        assert!(matches!(
            client.connect(CLIENT_ID),
            Err(PresenceError::PeerUnavailable)
        ));
        assert_eq!(peer.open_attempts().len(), IPC_SLOT_COUNT as usize);
        assert_eq!(client.state(), ConnectionState::Unconnected);
        assert!(messages.lock().unwrap().is_empty());
    }

    #[test]
    fn rejected_handshake_moves_on_to_next_slot() {
        let peer = MockPeer::new()
            .with_live_slots(&[1, 2])
            .with_handshake_reply(1, Reply::close(4000, "Invalid Client ID"));
        let (callback, messages) = recording_callback();
        let mut client = PresenceClient::new(peer.connector()).with_error_callback(callback);

        assert_eq!(client.connect(CLIENT_ID).unwrap(), 2);
        let messages = messages.lock().unwrap();
        assert!(messages[0].contains("Handshake rejected"));
        assert!(messages[0].contains("Invalid Client ID"));
    }

    #[test]
    fn connect_slot_tries_exactly_one_slot() {
        let peer = MockPeer::new()
            .with_live_slots(&[4])
            .with_handshake_reply(4, Reply::Silent);
        let mut client = PresenceClient::new(peer.connector())
            .with_timeouts(Duration::from_millis(10), Duration::from_millis(20));

        assert!(matches!(
            client.connect_slot(CLIENT_ID, 2),
            Err(PresenceError::ChannelUnavailable { .. })
        ));
        assert!(matches!(
            client.connect_slot(CLIENT_ID, 4),
            Err(PresenceError::ReadTimeout)
        ));
        assert_eq!(client.state(), ConnectionState::Unconnected);
        assert_eq!(peer.open_attempts(), vec![2, 4]);
    }

    #[test]
    fn set_presence_frames_activity_as_set_activity_command() {
        let peer = MockPeer::new().with_live_slots(&[3]);
        let mut client = PresenceClient::new(peer.connector());
        client.connect(CLIENT_ID).unwrap();

        let activity = PresenceActivity {
            details: "Editing: main.cpp".to_string(),
            start_time: 1_700_000_000,
            ..Default::default()
        };
        client.set_presence(&activity).unwrap();

        let frame = peer.frames().pop().unwrap();
        assert_eq!(frame.opcode, Opcode::Frame);
        let text = frame.text();
        assert!(text.contains(r#""details":"Editing: main.cpp""#));
        assert!(text.contains(r#""timestamps":{"start":1700000000}"#));

        let nonce = frame.json()["nonce"].as_str().unwrap().to_string();
        assert_eq!(nonce.len(), 6);
        assert!(nonce.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn set_presence_while_disconnected_reports_not_connected() {
        let peer = MockPeer::new();
        let (callback, messages) = recording_callback();
        let mut client = PresenceClient::new(peer.connector()).with_error_callback(callback);

        let result = client.set_presence(&PresenceActivity::default());
        assert!(matches!(result, Err(PresenceError::NotConnected)));
        assert!(messages.lock().unwrap()[0].contains("Not connected"));
        assert!(peer.frames().is_empty());
    }

    #[test]
    fn peer_error_reply_is_reported_but_keeps_connection() {
        let peer = MockPeer::new().with_live_slots(&[0]);
        let (callback, messages) = recording_callback();
        let mut client = PresenceClient::new(peer.connector()).with_error_callback(callback);
        client.connect(CLIENT_ID).unwrap();

        peer.push_reply(Reply::json(
            r#"{"evt":"ERROR","code":4000,"message":"Invalid Client ID"}"#,
        ));
        let result = client.set_presence(&PresenceActivity::default());

        assert!(matches!(result, Err(PresenceError::PeerReported { .. })));
        let message = messages.lock().unwrap().pop().unwrap();
        assert!(message.contains("4000"));
        assert!(message.contains("Invalid Client ID"));
        assert!(client.is_connected());
    }

    #[test]
    fn oversized_reply_drops_connection() {
        let peer = MockPeer::new().with_live_slots(&[0]);
        let mut client = PresenceClient::new(peer.connector());
        client.connect(CLIENT_ID).unwrap();

        peer.push_reply(Reply::oversized());
        let result = client.set_presence(&PresenceActivity::default());

        assert!(matches!(result, Err(PresenceError::Protocol(_))));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(!client.is_connected());
    }

    #[test]
    fn oversized_request_fails_before_any_write() {
        let peer = MockPeer::new().with_live_slots(&[0]);
        let mut client = PresenceClient::new(peer.connector());
        client.connect(CLIENT_ID).unwrap();
        let frames_before = peer.frames().len();

        let huge = PresenceActivity {
            details: "d".repeat(100),
            ..Default::default()
        };
        // Payload text is clipped to 128 bytes per field, so build an
        // oversized command directly.
        let command = serde_json::json!({ "blob": "x".repeat(presence_protocol::MAX_MESSAGE_SIZE) });
        assert!(matches!(
            client.request(&command),
            Err(PresenceError::Protocol(_))
        ));
        assert_eq!(peer.frames().len(), frames_before);
        assert!(client.is_connected());
        client.set_presence(&huge).unwrap();
    }

    #[test]
    fn missing_reply_times_out_and_drops_connection() {
        let peer = MockPeer::new().with_live_slots(&[0]);
        let mut client = PresenceClient::new(peer.connector())
            .with_timeouts(Duration::from_millis(10), Duration::from_millis(50));
        client.connect(CLIENT_ID).unwrap();

        peer.push_reply(Reply::Silent);
        let result = client.set_presence(&PresenceActivity::default());

        assert!(matches!(result, Err(PresenceError::ReadTimeout)));
        assert!(!client.is_connected());
    }

    #[test]
    fn io_failure_marks_disconnected() {
        let peer = MockPeer::new().with_live_slots(&[0]);
        let mut client = PresenceClient::new(peer.connector());
        client.connect(CLIENT_ID).unwrap();

        peer.kill_connection();
        assert!(client.set_presence(&PresenceActivity::default()).is_err());
        assert_eq!(client.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn update_pings_only_every_n_ticks() {
        let peer = MockPeer::new().with_live_slots(&[0]);
        let mut client = PresenceClient::new(peer.connector()).with_ping_every(3);
        client.connect(CLIENT_ID).unwrap();
        let after_handshake = peer.frames().len();

        client.update().unwrap();
        client.update().unwrap();
        assert_eq!(peer.frames().len(), after_handshake);

        client.update().unwrap();
        let frames = peer.frames();
        assert_eq!(frames.len(), after_handshake + 1);
        assert_eq!(
            frames.last().unwrap().json(),
            serde_json::json!({"cmd": "DISPATCH", "evt": "READY"})
        );
    }

    #[test]
    fn update_detects_dead_channel() {
        let peer = MockPeer::new().with_live_slots(&[0]);
        let mut client = PresenceClient::new(peer.connector()).with_ping_every(100);
        client.connect(CLIENT_ID).unwrap();

        peer.kill_connection();
        assert!(client.update().is_err());
        assert!(!client.is_connected());
    }

    #[test]
    fn check_connection_round_trips() {
        let peer = MockPeer::new().with_live_slots(&[0]);
        let mut client = PresenceClient::new(peer.connector());
        client.connect(CLIENT_ID).unwrap();

        client.check_connection().unwrap();
        assert_eq!(
            peer.frames().last().unwrap().json()["cmd"],
            serde_json::json!("DISPATCH")
        );
    }

    #[test]
    fn idle_status_sends_reduced_payload_and_none_writes_nothing() {
        let peer = MockPeer::new().with_live_slots(&[0]);
        let mut client = PresenceClient::new(peer.connector());
        client.connect(CLIENT_ID).unwrap();

        let activity = PresenceActivity {
            details: "Idle".to_string(),
            state: "Size: 1 KB".to_string(),
            small_image: "editor".to_string(),
            large_image: "idle".to_string(),
            ..Default::default()
        };
        client.set_idle_status(Some(&activity)).unwrap();
        assert!(client.is_idle());
        let json = peer.frames().last().unwrap().json();
        let sent = &json["args"]["activity"];
        assert_eq!(sent["details"], "Idle");
        assert!(sent.get("state").is_none());
        assert!(sent["assets"].get("small_image").is_none());

        let count = peer.frames().len();
        client.set_idle_status(None).unwrap();
        assert!(!client.is_idle());
        assert_eq!(peer.frames().len(), count);
    }

    #[test]
    fn interleaved_ping_is_answered_with_pong() {
        let peer = MockPeer::new().with_live_slots(&[0]);
        let mut client = PresenceClient::new(peer.connector());
        client.connect(CLIENT_ID).unwrap();

        peer.push_reply(Reply::ping(b"{}"));
        client.set_presence(&PresenceActivity::default()).unwrap();

        let frames = peer.frames();
        assert_eq!(frames.last().unwrap().opcode, Opcode::Pong);
        assert!(client.is_connected());
    }

    #[test]
    fn close_clears_activity_and_swallows_errors() {
        let peer = MockPeer::new().with_live_slots(&[0]);
        let mut client = PresenceClient::new(peer.connector());
        client.connect(CLIENT_ID).unwrap();

        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
        let json = peer.frames().last().unwrap().json();
        assert_eq!(json["cmd"], "SET_ACTIVITY");
        assert!(json["args"]["activity"].is_null());

        let peer = MockPeer::new().with_live_slots(&[0]);
        let mut client = PresenceClient::new(peer.connector());
        client.connect(CLIENT_ID).unwrap();
        peer.kill_connection();
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
    }
}
