//! Kernel tracepoints used to attribute hardware contexts to processes.
//!
//! The server answers a tracepoint info request with the event id and the
//! kernel's format description. Once parsed, samples of the allow-listed
//! i915 tracepoints carry the pid that submitted work and the hardware id
//! the work ran on.

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use crate::process::{ProcessRegistry, UNKNOWN_COMM};
use crate::record::{RecordError, RecordHeader, HEADER_SIZE};
use crate::ringbuf::{RingBuffer, Timestamped};
use crate::transport::{Request, RequestSink, StreamConfig};

pub const MAX_FIELDS: usize = 20;

const CORRELATION_TRACEPOINTS: [&str; 3] = [
    "i915/i915_request_add",
    "i915/i915_request_submit",
    "i915/i915_context_create",
];
const PROCESS_FIELD: &str = "common_pid";
const HW_ID_FIELD: &str = "hw_id";

const HIDDEN_FIELDS: [&str; 3] = ["common_type", "common_flags", "common_preempt_count"];

static FIELD_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z_][A-Za-z0-9_]*)\s*(?:\[[^\]]*\]\s*)*$")
        .expect("Invalid field name regex pattern")
});

static KEY_VALUE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_ ]*?)\s*:\s*(.*?)\s*$")
        .expect("Invalid key/value regex pattern")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("line {line}: no field name in {decl:?}")]
    MissingName { line: usize, decl: String },
    #[error("line {line}: field {field} has no {key}")]
    MissingKey {
        line: usize,
        field: String,
        key: &'static str,
    },
    #[error("line {line}: bad {key} value {value:?}")]
    BadValue {
        line: usize,
        key: &'static str,
        value: String,
    },
    #[error("line {line}: unsupported field size {size}")]
    BadSize { line: usize, size: usize },
    #[error("line {line}: malformed attribute {segment:?}")]
    Malformed { line: usize, segment: String },
    #[error("more than {MAX_FIELDS} fields")]
    TooManyFields,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub offset: usize,
    pub size: usize,
    pub signed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldValue {
    Signed(i64),
    Unsigned(u64),
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Signed(v) => write!(f, "{}", v),
            FieldValue::Unsigned(v) => write!(f, "{}", v),
        }
    }
}

impl Field {
    /// Read the field out of a sample payload, `None` if it does not fit.
    pub fn read(&self, data: &[u8]) -> Option<FieldValue> {
        let bytes = data.get(self.offset..self.offset.checked_add(self.size)?)?;
        let mut raw = [0u8; 8];
        let value = match self.size {
            1 => bytes[0] as u64,
            2 => u16::from_ne_bytes([bytes[0], bytes[1]]) as u64,
            4 => u32::from_ne_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
            8 => {
                raw.copy_from_slice(bytes);
                u64::from_ne_bytes(raw)
            }
            _ => return None,
        };

        if !self.signed {
            return Some(FieldValue::Unsigned(value));
        }
        let shift = 64 - self.size as u32 * 8;
        Some(FieldValue::Signed(((value << shift) as i64) >> shift))
    }

    pub fn read_u32(&self, data: &[u8]) -> Option<u32> {
        match self.read(data)? {
            FieldValue::Signed(v) => Some(v as u32),
            FieldValue::Unsigned(v) => Some(v as u32),
        }
    }
}

fn parse_number(line: usize, key: &'static str, value: &str) -> Result<usize, FormatError> {
    value.parse().map_err(|_| FormatError::BadValue {
        line,
        key,
        value: value.to_string(),
    })
}

fn parse_field(line_no: usize, line: &str) -> Result<Field, FormatError> {
    let mut segments = line.split(';').map(str::trim).filter(|s| !s.is_empty());

    let decl = segments.next().unwrap_or_default();
    let decl = decl.strip_prefix("field:").unwrap_or(decl).trim();
    let name = FIELD_NAME_RE
        .captures(decl)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
        .ok_or_else(|| FormatError::MissingName {
            line: line_no,
            decl: decl.to_string(),
        })?;

    let (mut offset, mut size, mut signed) = (None, None, None);
    for segment in segments {
        let caps = KEY_VALUE_RE
            .captures(segment)
            .ok_or_else(|| FormatError::Malformed {
                line: line_no,
                segment: segment.to_string(),
            })?;
        let value = &caps[2];
        match &caps[1] {
            "offset" => offset = Some(parse_number(line_no, "offset", value)?),
            "size" => size = Some(parse_number(line_no, "size", value)?),
            "signed" => signed = Some(parse_number(line_no, "signed", value)? != 0),
            _ => {}
        }
    }

    let missing = |key| FormatError::MissingKey {
        line: line_no,
        field: name.clone(),
        key,
    };
    let offset = offset.ok_or_else(|| missing("offset"))?;
    let size = size.ok_or_else(|| missing("size"))?;
    let signed = signed.ok_or_else(|| missing("signed"))?;

    if !matches!(size, 1 | 2 | 4 | 8) {
        return Err(FormatError::BadSize {
            line: line_no,
            size,
        });
    }

    Ok(Field {
        name,
        offset,
        size,
        signed,
    })
}

/// Parse the field section of a kernel tracepoint format description.
pub fn parse_format(text: &str) -> Result<Vec<Field>, FormatError> {
    let mut fields = Vec::new();

    for (idx, line) in text.lines().enumerate() {
        let line_no = idx + 1;
        let line = line.trim();

        if line.is_empty()
            || line.starts_with('#')
            || line.starts_with("name:")
            || line.starts_with("ID:")
            || line.starts_with("format:")
        {
            continue;
        }
        if line.starts_with("print fmt:") {
            break;
        }

        if fields.len() == MAX_FIELDS {
            return Err(FormatError::TooManyFields);
        }
        fields.push(parse_field(line_no, line)?);
    }

    Ok(fields)
}

/// One raw sample of a tracepoint.
#[derive(Debug)]
pub struct TracepointSample {
    pub tracepoint: String,
    pub cpu: u32,
    pub time: u64,
    pub data: Vec<u8>,
}

impl Timestamped for TracepointSample {
    fn ts(&self) -> u64 {
        self.time
    }
}

/// Split a tracepoint stream block into `(time, data)` samples.
///
/// Each record is a header, a u64 timestamp, a u32 payload size and the
/// payload. Stops at the first malformed record.
pub fn sample_records(block: &[u8]) -> impl Iterator<Item = Result<(u64, &[u8]), RecordError>> {
    let mut offset = 0;
    let mut failed = false;
    std::iter::from_fn(move || {
        if failed || offset >= block.len() {
            return None;
        }
        let record = sample_record(block, offset);
        match &record {
            Ok((size, _, _)) => offset += size,
            Err(_) => failed = true,
        }
        Some(record.map(|(_, time, data)| (time, data)))
    })
}

fn sample_record(block: &[u8], offset: usize) -> Result<(usize, u64, &[u8]), RecordError> {
    const FIXED: usize = HEADER_SIZE + 8 + 4;
    let len = block.len();

    let mut header = RecordHeader::default();
    if plain::copy_from_bytes(&mut header, &block[offset..]).is_err() {
        return Err(RecordError::Overrun {
            offset,
            size: HEADER_SIZE,
            len,
        });
    }
    let size = header.size as usize;
    if size < HEADER_SIZE {
        return Err(RecordError::Undersized { offset, size });
    }
    if offset + size > len {
        return Err(RecordError::Overrun { offset, size, len });
    }
    if size < FIXED {
        return Err(RecordError::ShortSample {
            offset,
            size,
            expected: FIXED,
        });
    }

    let record = &block[offset..offset + size];
    let mut time = [0u8; 8];
    time.copy_from_slice(&record[HEADER_SIZE..HEADER_SIZE + 8]);
    let mut data_size = [0u8; 4];
    data_size.copy_from_slice(&record[HEADER_SIZE + 8..FIXED]);
    let data_size = u32::from_ne_bytes(data_size) as usize;
    let data = record
        .get(FIXED..FIXED + data_size)
        .ok_or(RecordError::ShortSample {
            offset,
            size,
            expected: FIXED + data_size,
        })?;

    Ok((size, u64::from_ne_bytes(time), data))
}

#[derive(Debug)]
pub struct Tracepoint {
    pub name: String,
    pub uuid: String,
    pub event_id: Option<u64>,
    pub format: Option<String>,
    pub fields: Vec<Field>,
    pub process_field: Option<usize>,
    pub hw_id_field: Option<usize>,
    /// Position in the tracepoint list.
    pub idx: usize,
    /// Open `(stream id, cpu)` pairs.
    pub streams: Vec<(u32, u32)>,
    samples: RingBuffer<Rc<TracepointSample>>,
}

impl Tracepoint {
    pub fn new(name: &str, uuid: String, idx: usize) -> Self {
        Tracepoint {
            name: name.to_string(),
            uuid,
            event_id: None,
            format: None,
            fields: Vec::new(),
            process_field: None,
            hw_id_field: None,
            idx,
            streams: Vec::new(),
            samples: RingBuffer::default(),
        }
    }

    /// Apply the server's description. A format that does not parse
    /// leaves the tracepoint without fields.
    pub fn update(&mut self, event_id: u64, format: &str) -> Result<(), FormatError> {
        self.event_id = Some(event_id);
        self.format = Some(format.to_string());
        self.process_field = None;
        self.hw_id_field = None;

        self.fields = match parse_format(format) {
            Ok(fields) => fields,
            Err(e) => {
                self.fields = Vec::new();
                return Err(e);
            }
        };

        if CORRELATION_TRACEPOINTS.contains(&self.name.as_str()) {
            self.process_field = self.fields.iter().position(|f| f.name == PROCESS_FIELD);
            self.hw_id_field = self.fields.iter().position(|f| f.name == HW_ID_FIELD);
        }
        Ok(())
    }

    /// Pid that emitted the sample, for correlating tracepoints.
    pub fn sample_pid(&self, data: &[u8]) -> Option<u32> {
        self.fields.get(self.process_field?)?.read_u32(data)
    }

    /// `(pid, hw_id)` carried by a sample of a correlating tracepoint.
    pub fn correlate(&self, data: &[u8]) -> Option<(u32, u32)> {
        let pid = self.sample_pid(data)?;
        let hw_id = self.fields.get(self.hw_id_field?)?.read_u32(data)?;
        Some((pid, hw_id))
    }

    /// Render a sample for display, one field per line.
    pub fn describe_sample(
        &self,
        sample: &TracepointSample,
        processes: &ProcessRegistry,
        include_name: bool,
    ) -> String {
        let mut out = String::new();
        if include_name {
            out.push_str(&self.name);
            out.push_str(": ");
        }
        out.push_str(&format!("cpu:{}", sample.cpu));

        for field in &self.fields {
            if HIDDEN_FIELDS.contains(&field.name.as_str()) {
                continue;
            }
            let Some(value) = field.read(&sample.data) else {
                continue;
            };
            if field.name == PROCESS_FIELD {
                let pid = field.read_u32(&sample.data).unwrap_or(0);
                let cmd = processes
                    .get(pid)
                    .map_or(UNKNOWN_COMM, |process| process.cmd.as_str());
                out.push_str(&format!("\npid = {}({})", pid, cmd));
            } else {
                out.push_str(&format!("\n{} = {}", field.name, value));
            }
        }
        out
    }

    /// Samples of this tracepoint still in the visible range, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = &Rc<TracepointSample>> {
        self.samples.iter()
    }
}

/// Every tracepoint of a session plus the time-ordered union of their
/// samples.
pub struct TracepointSet {
    tracepoints: Vec<Tracepoint>,
    streams: HashMap<u32, (usize, u32)>,
    samples: RingBuffer<Rc<TracepointSample>>,
    next_uuid: u64,
}

impl TracepointSet {
    pub fn new(visible_ns: u64) -> Self {
        TracepointSet {
            tracepoints: Vec::new(),
            streams: HashMap::new(),
            samples: RingBuffer::with_max_duration(visible_ns),
            next_uuid: 0,
        }
    }

    /// Register `name` and ask the server for its description. Adding a
    /// tracepoint twice returns the existing one.
    pub fn add(&mut self, name: &str, sink: &mut dyn RequestSink) -> &Tracepoint {
        if let Some(pos) = self.tracepoints.iter().position(|tp| tp.name == name) {
            return &self.tracepoints[pos];
        }

        let uuid = format!("tp-{:08x}", self.next_uuid);
        self.next_uuid += 1;
        sink.send(Request::GetTracepointInfo {
            uuid: uuid.clone(),
            name: name.to_string(),
        });

        let idx = self.tracepoints.len();
        self.tracepoints.push(Tracepoint::new(name, uuid, idx));
        &self.tracepoints[idx]
    }

    /// Close the tracepoint's streams, drop its samples and renumber the
    /// remaining tracepoints.
    pub fn remove(&mut self, name: &str, sink: &mut dyn RequestSink) -> bool {
        let Some(pos) = self.tracepoints.iter().position(|tp| tp.name == name) else {
            return false;
        };

        self.close_tracepoint_streams(pos, sink);
        let tp = self.tracepoints.remove(pos);
        self.samples.retain(|s| s.tracepoint != tp.uuid);

        for (idx, tp) in self.tracepoints.iter_mut().enumerate() {
            tp.idx = idx;
        }
        self.reindex_streams();
        true
    }

    fn reindex_streams(&mut self) {
        self.streams.clear();
        for (idx, tp) in self.tracepoints.iter().enumerate() {
            for &(stream_id, cpu) in &tp.streams {
                self.streams.insert(stream_id, (idx, cpu));
            }
        }
    }

    fn close_tracepoint_streams(&mut self, pos: usize, sink: &mut dyn RequestSink) {
        for (stream_id, _) in self.tracepoints[pos].streams.drain(..) {
            self.streams.remove(&stream_id);
            sink.send(Request::CloseStream { id: stream_id });
        }
    }

    /// Apply a tracepoint info answer to the tracepoint it was requested
    /// for.
    pub fn update_info(&mut self, uuid: &str, event_id: u64, format: &str) -> Option<&Tracepoint> {
        let tp = self.tracepoints.iter_mut().find(|tp| tp.uuid == uuid)?;
        if let Err(e) = tp.update(event_id, format) {
            tracing::warn!(tracepoint = %tp.name, "unusable tracepoint format: {}", e);
        }
        Some(tp)
    }

    /// Open one stream per CPU for every described tracepoint.
    pub fn open_streams(&mut self, n_cpus: u32, next_stream_id: &mut u32, sink: &mut dyn RequestSink) {
        for idx in 0..self.tracepoints.len() {
            self.open_tracepoint_streams(idx, n_cpus, next_stream_id, sink);
        }
    }

    /// (Re)open the per-CPU streams of one tracepoint.
    pub fn open_tracepoint_streams(
        &mut self,
        idx: usize,
        n_cpus: u32,
        next_stream_id: &mut u32,
        sink: &mut dyn RequestSink,
    ) {
        if idx >= self.tracepoints.len() {
            return;
        }
        self.close_tracepoint_streams(idx, sink);

        let tp = &mut self.tracepoints[idx];
        let Some(event_id) = tp.event_id else {
            tracing::debug!(tracepoint = %tp.name, "no event id yet, not opening");
            return;
        };
        for cpu in 0..n_cpus {
            let id = *next_stream_id;
            *next_stream_id += 1;
            sink.send(Request::OpenStream {
                id,
                config: StreamConfig::Tracepoint { event_id, cpu },
            });
            tp.streams.push((id, cpu));
            self.streams.insert(id, (idx, cpu));
        }
    }

    pub fn close_streams(&mut self, sink: &mut dyn RequestSink) {
        for pos in 0..self.tracepoints.len() {
            self.close_tracepoint_streams(pos, sink);
        }
    }

    /// Index of the tracepoint and CPU a stream id was opened for.
    pub fn stream(&self, stream_id: u32) -> Option<(usize, u32)> {
        self.streams.get(&stream_id).copied()
    }

    /// Store a sample in both time-ordered lists and drop samples that left
    /// the visible range.
    pub fn push_sample(&mut self, idx: usize, cpu: u32, time: u64, data: &[u8]) -> Option<Rc<TracepointSample>> {
        let tp = self.tracepoints.get_mut(idx)?;
        let sample = Rc::new(TracepointSample {
            tracepoint: tp.uuid.clone(),
            cpu,
            time,
            data: data.to_vec(),
        });
        tp.samples.insert(sample.clone());

        let evicted = self.samples.insert(sample.clone());
        self.forget(evicted);
        Some(sample)
    }

    fn forget(&mut self, evicted: Vec<Rc<TracepointSample>>) {
        for old in evicted {
            if let Some(tp) = self.tracepoints.iter_mut().find(|tp| tp.uuid == old.tracepoint) {
                tp.samples.remove_first(|s| Rc::ptr_eq(s, &old));
            }
        }
    }

    pub fn set_visible_window(&mut self, visible_ns: u64) {
        let evicted = self.samples.set_max_duration(visible_ns);
        self.forget(evicted);
    }

    pub fn clear_samples(&mut self) {
        self.samples.clear();
        for tp in &mut self.tracepoints {
            tp.samples.clear();
        }
    }

    /// Samples of every tracepoint, oldest first.
    pub fn samples(&self) -> impl Iterator<Item = &Rc<TracepointSample>> {
        self.samples.iter()
    }

    pub fn get(&self, idx: usize) -> Option<&Tracepoint> {
        self.tracepoints.get(idx)
    }

    pub fn by_name(&self, name: &str) -> Option<&Tracepoint> {
        self.tracepoints.iter().find(|tp| tp.name == name)
    }

    pub fn by_uuid(&self, uuid: &str) -> Option<&Tracepoint> {
        self.tracepoints.iter().find(|tp| tp.uuid == uuid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tracepoint> {
        self.tracepoints.iter()
    }

    pub fn len(&self) -> usize {
        self.tracepoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracepoints.is_empty()
    }
}
