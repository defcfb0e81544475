//! In-memory peer used by unit tests.
//!
//! [`MockPeer`] hands out a [`Connector`] whose channels decode every written
//! frame, record it, and queue a scripted (or default "accepted") reply.

use presence_protocol::{decode_frame, encode_frame, Opcode, MAX_MESSAGE_SIZE};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::PresenceError;
use crate::transport::{slot_name, Channel, Connector};

#[derive(Debug, Clone)]
pub enum Reply {
    Json(String),
    Close { code: u32, message: String },
    /// A PING frame ahead of the default acknowledgement.
    Ping(Vec<u8>),
    Oversized,
    Silent,
}

impl Reply {
    pub fn json(body: &str) -> Self {
        Reply::Json(body.to_string())
    }

    pub fn close(code: u32, message: &str) -> Self {
        Reply::Close {
            code,
            message: message.to_string(),
        }
    }

    pub fn ping(payload: &[u8]) -> Self {
        Reply::Ping(payload.to_vec())
    }

    pub fn oversized() -> Self {
        Reply::Oversized
    }

    fn into_bytes(self) -> Vec<u8> {
        match self {
            Reply::Json(body) => frame(Opcode::Frame, body.as_bytes()),
            Reply::Close { code, message } => {
                let body = serde_json::json!({ "code": code, "message": message });
                frame(Opcode::Close, body.to_string().as_bytes())
            }
            Reply::Ping(payload) => {
                let mut bytes = frame(Opcode::Ping, &payload);
                bytes.extend(default_ack());
                bytes
            }
            Reply::Oversized => {
                let mut bytes = Vec::new();
                bytes.extend_from_slice(&Opcode::Frame.as_u32().to_ne_bytes());
                bytes.extend_from_slice(&((MAX_MESSAGE_SIZE + 1) as u32).to_ne_bytes());
                bytes
            }
            Reply::Silent => Vec::new(),
        }
    }
}

fn frame(opcode: Opcode, payload: &[u8]) -> Vec<u8> {
    encode_frame(opcode, payload).expect("test frame fits")
}

fn default_ack() -> Vec<u8> {
    frame(
        Opcode::Frame,
        br#"{"cmd":"DISPATCH","evt":"READY","data":{"v":1}}"#,
    )
}

#[derive(Debug, Clone)]
pub struct SentFrame {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub at: Instant,
}

impl SentFrame {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).expect("frame payload is JSON")
    }

    pub fn is_set_activity(&self) -> bool {
        self.opcode == Opcode::Frame && self.text().contains("SET_ACTIVITY")
    }
}

#[derive(Default)]
struct PeerState {
    available: bool,
    live_slots: HashSet<u8>,
    handshake_replies: HashMap<u8, Reply>,
    replies: VecDeque<Reply>,
    open_attempts: Vec<u8>,
    connect_attempts: Vec<Instant>,
    frames: Vec<SentFrame>,
    generation: u64,
    refused_scans: u32,
    refusing_scan: bool,
    latency: Duration,
    in_flight: bool,
    overlap_detected: bool,
}

#[derive(Clone)]
pub struct MockPeer {
    state: Arc<Mutex<PeerState>>,
}

impl MockPeer {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PeerState {
                available: true,
                ..Default::default()
            })),
        }
    }

    pub fn with_live_slots(self, slots: &[u8]) -> Self {
        self.lock().live_slots.extend(slots.iter().copied());
        self
    }

    pub fn with_handshake_reply(self, slot: u8, reply: Reply) -> Self {
        self.lock().handshake_replies.insert(slot, reply);
        self
    }

    /// Refuses every slot during the next `scans` slot scans.
    pub fn with_refused_scans(self, scans: u32) -> Self {
        self.lock().refused_scans = scans;
        self
    }

    /// Delay applied inside every write, widening the window in which
    /// overlapping requests would be observed.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.lock().latency = latency;
        self
    }

    pub fn connector(&self) -> Box<dyn Connector> {
        Box::new(MockConnector { peer: self.clone() })
    }

    pub fn push_reply(&self, reply: Reply) {
        self.lock().replies.push_back(reply);
    }

    /// Breaks every open channel. New connections are still accepted.
    pub fn kill_connection(&self) {
        self.lock().generation += 1;
    }

    /// While unavailable, every slot refuses connections.
    pub fn set_available(&self, available: bool) {
        let mut state = self.lock();
        state.available = available;
        if !available {
            state.generation += 1;
        }
    }

    pub fn open_attempts(&self) -> Vec<u8> {
        self.lock().open_attempts.clone()
    }

    /// One entry per full slot scan (each scan starts at slot 0).
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.lock().connect_attempts.clone()
    }

    pub fn frames(&self) -> Vec<SentFrame> {
        self.lock().frames.clone()
    }

    pub fn set_activity_frames(&self) -> Vec<SentFrame> {
        self.frames()
            .into_iter()
            .filter(SentFrame::is_set_activity)
            .collect()
    }

    pub fn handshake_count(&self) -> usize {
        self.frames()
            .iter()
            .filter(|frame| frame.opcode == Opcode::Handshake)
            .count()
    }

    pub fn overlap_detected(&self) -> bool {
        self.lock().overlap_detected
    }

    fn lock(&self) -> MutexGuard<'_, PeerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct MockConnector {
    peer: MockPeer,
}

impl Connector for MockConnector {
    fn channel_name(&self, slot: u8) -> String {
        format!("mock/{}", slot_name(slot))
    }

    fn open(&self, slot: u8) -> Result<Box<dyn Channel>, PresenceError> {
        let mut state = self.peer.lock();
        state.open_attempts.push(slot);
        if slot == 0 {
            state.connect_attempts.push(Instant::now());
            state.refusing_scan = state.refused_scans > 0;
            if state.refusing_scan {
                state.refused_scans -= 1;
            }
        }

        if !state.available || state.refusing_scan || !state.live_slots.contains(&slot) {
            return Err(PresenceError::ChannelUnavailable {
                name: self.channel_name(slot),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no listener"),
            });
        }

        Ok(Box::new(MockChannel {
            peer: self.peer.clone(),
            slot,
            generation: state.generation,
            inbox: VecDeque::new(),
            open: true,
        }))
    }
}

struct MockChannel {
    peer: MockPeer,
    slot: u8,
    generation: u64,
    inbox: VecDeque<u8>,
    open: bool,
}

impl MockChannel {
    fn alive(&self) -> Result<(), PresenceError> {
        if !self.open {
            return Err(PresenceError::NotConnected);
        }
        if self.peer.lock().generation != self.generation {
            return Err(PresenceError::PeerClosed);
        }
        Ok(())
    }
}

impl Channel for MockChannel {
    fn write_timed(&mut self, bytes: &[u8], _timeout: Duration) -> Result<(), PresenceError> {
        self.alive()?;
        let sent = decode_frame(bytes)?;
        let opcode = sent.opcode;

        // A PONG answers the peer inside an exchange that is already open.
        let latency = {
            let mut state = self.peer.lock();
            if opcode != Opcode::Pong {
                if state.in_flight {
                    state.overlap_detected = true;
                }
                state.in_flight = true;
            }
            state.latency
        };
        if !latency.is_zero() {
            thread::sleep(latency);
        }

        let mut state = self.peer.lock();
        state.frames.push(SentFrame {
            opcode,
            payload: sent.payload,
            at: Instant::now(),
        });

        let reply = match opcode {
            Opcode::Pong => return Ok(()),
            Opcode::Handshake => state.handshake_replies.get(&self.slot).cloned(),
            _ => state.replies.pop_front(),
        };
        let bytes = match reply {
            Some(reply) => reply.into_bytes(),
            None => default_ack(),
        };
        if bytes.is_empty() {
            state.in_flight = false;
        }
        self.inbox.extend(bytes);
        Ok(())
    }

    fn read_timed(&mut self, len: usize, timeout: Duration) -> Result<Vec<u8>, PresenceError> {
        if let Err(err) = self.alive() {
            self.peer.lock().in_flight = false;
            return Err(err);
        }
        if self.inbox.len() < len {
            // A silent peer costs the caller its full read timeout.
            self.peer.lock().in_flight = false;
            thread::sleep(timeout);
            return Err(PresenceError::ReadTimeout);
        }
        let bytes: Vec<u8> = self.inbox.drain(..len).collect();
        if self.inbox.is_empty() {
            self.peer.lock().in_flight = false;
        }
        Ok(bytes)
    }

    fn probe(&mut self) -> Result<(), PresenceError> {
        self.alive()
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.peer.lock().in_flight = false;
        }
    }
}
