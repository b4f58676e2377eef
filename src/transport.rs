//! Messages exchanged with the sampling server.
//!
//! Incoming binary payloads carry an 8 byte prefix: byte 0 is the message
//! type, bytes 4..8 the native-endian id of the stream the data belongs to.
//! Control messages arrive already decoded as [`ServerMessage`]s and
//! outgoing requests leave through a [`RequestSink`].

use serde::{Deserialize, Serialize};

pub const PAYLOAD_PREFIX_SIZE: usize = 8;

/// What an opened stream samples.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamConfig {
    Oa {
        hw_config_guid: String,
        period_exponent: u32,
        cpu_timestamps: bool,
        gpu_timestamps: bool,
    },
    Tracepoint {
        event_id: u64,
        cpu: u32,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    GetProcessInfo { pid: u32 },
    GetTracepointInfo { uuid: String, name: String },
    OpenStream { id: u32, config: StreamConfig },
    CloseStream { id: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerMessage {
    ProcessInfo {
        pid: u32,
        comm: String,
        cmd_line: String,
    },
    TracepointInfo {
        uuid: String,
        event_id: u64,
        format: String,
    },
    Log {
        level: u32,
        message: String,
    },
    Error(String),
}

/// Where outgoing requests go.
pub trait RequestSink {
    fn send(&mut self, request: Request);
}

/// Drops every request, for sessions fed from captures.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl RequestSink for NullSink {
    fn send(&mut self, _request: Request) {}
}

/// Keeps every request in order.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    pub requests: Vec<Request>,
}

impl RequestSink for RecordingSink {
    fn send(&mut self, request: Request) {
        self.requests.push(request);
    }
}

impl<F: FnMut(Request)> RequestSink for F {
    fn send(&mut self, request: Request) {
        self(request)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    PerfData,
    Control,
    OaData,
}

impl PayloadKind {
    pub fn from_type(msg_type: u8) -> Option<Self> {
        match msg_type {
            1 => Some(PayloadKind::PerfData),
            2 => Some(PayloadKind::Control),
            3 => Some(PayloadKind::OaData),
            _ => None,
        }
    }

    pub fn msg_type(self) -> u8 {
        match self {
            PayloadKind::PerfData => 1,
            PayloadKind::Control => 2,
            PayloadKind::OaData => 3,
        }
    }
}

/// Split a binary payload into its raw type byte, stream id and data.
pub fn split_payload(payload: &[u8]) -> Option<(u8, u32, &[u8])> {
    if payload.len() < PAYLOAD_PREFIX_SIZE {
        return None;
    }
    let stream_id = u32::from_ne_bytes([payload[4], payload[5], payload[6], payload[7]]);
    Some((payload[0], stream_id, &payload[PAYLOAD_PREFIX_SIZE..]))
}

/// Build a binary payload, the inverse of [`split_payload`].
pub fn encode_payload(kind: PayloadKind, stream_id: u32, data: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(PAYLOAD_PREFIX_SIZE + data.len());
    payload.extend([kind.msg_type(), 0, 0, 0]);
    payload.extend(stream_id.to_ne_bytes());
    payload.extend_from_slice(data);
    payload
}
