//! Builders for OA and tracepoint stream data used by the integration tests.
#![allow(dead_code)]

use std::cell::RefCell;
use std::rc::Rc;

use gpuoa::metrics::{Counter, CounterDataType, CounterEquation, CounterUnits};
use gpuoa::record::{RecordHeader, RecordKind, HEADER_SIZE};
use gpuoa::{Config, MetricSet, OaFormat, Request, Session};

pub const OA_STREAM: u32 = 1;
pub const VISIBLE_NS: u64 = 1_000;
pub const PERIOD_NS: u64 = 100;

pub const REQUEST_ADD_FORMAT: &str = "name: i915_request_add
ID: 1234
format:
\tfield:unsigned short common_type;\toffset:0;\tsize:2;\tsigned:0;
\tfield:unsigned char common_flags;\toffset:2;\tsize:1;\tsigned:0;
\tfield:unsigned char common_preempt_count;\toffset:3;\tsize:1;\tsigned:0;
\tfield:int common_pid;\toffset:4;\tsize:4;\tsigned:1;

\tfield:u32 dev;\toffset:8;\tsize:4;\tsigned:0;
\tfield:u32 hw_id;\toffset:12;\tsize:4;\tsigned:0;

print fmt: \"dev=%u, hw_id=%u\", REC->dev, REC->hw_id
";

pub fn metric_set() -> MetricSet {
    MetricSet {
        name: "Render Metrics Basic".to_string(),
        symbol_name: "RenderBasic".to_string(),
        hw_config_guid: "b541bd57-0e0f-4154-b4c0-5858010a2bf7".to_string(),
        format: OaFormat::A32u40A4u32B8C8,
        counters: vec![
            Counter {
                name: "GPU Time Elapsed".to_string(),
                symbol_name: "GpuTime".to_string(),
                desc: String::new(),
                units: CounterUnits::Ns,
                data_type: CounterDataType::Uint64,
                equation: CounterEquation::GpuTime,
                max: None,
            },
            Counter {
                name: "GPU Core Clocks".to_string(),
                symbol_name: "GpuCoreClocks".to_string(),
                desc: String::new(),
                units: CounterUnits::Cycles,
                data_type: CounterDataType::Uint64,
                equation: CounterEquation::GpuCoreClocks,
                max: None,
            },
        ],
    }
}

/// One timestamp tick per nanosecond, 100ns aggregation, 1us history.
pub fn config() -> Config {
    let mut config = Config::default();
    config.devinfo.timestamp_frequency = 1_000_000_000;
    config.aggregation_period_ns = PERIOD_NS;
    config.visible_window_s = VISIBLE_NS as f64 / 1e9;
    config.tracepoints = Vec::new();
    config.metric_sets = vec![metric_set()];
    config.metric_set = Some("RenderBasic".to_string());
    config
}

/// A sampling session whose requests end up in the returned list.
pub fn session_with(config: &Config) -> (Session, Rc<RefCell<Vec<Request>>>) {
    let requests = Rc::new(RefCell::new(Vec::new()));
    let sent = requests.clone();
    let mut session = Session::new(
        config,
        Box::new(move |request: Request| sent.borrow_mut().push(request)),
    )
    .unwrap();
    session.start_sampling();
    assert_eq!(session.oa_stream_id(), Some(OA_STREAM));
    (session, requests)
}

pub fn session() -> Session {
    session_with(&config()).0
}

fn set_word(report: &mut [u8], word: usize, value: u32) {
    report[word * 4..word * 4 + 4].copy_from_slice(&value.to_ne_bytes());
}

/// A sample record with a gen9 report. The clock counter advances with the
/// timestamp.
pub fn oa_sample(timestamp: u32, ctx_id: Option<u32>) -> Vec<u8> {
    let mut report = vec![0u8; 256];
    set_word(&mut report, 0, if ctx_id.is_some() { 1 << 16 } else { 0 });
    set_word(&mut report, 1, timestamp);
    set_word(&mut report, 2, ctx_id.unwrap_or(u32::MAX));
    set_word(&mut report, 3, timestamp.wrapping_mul(2));

    let mut record = RecordHeader::new(RecordKind::Sample, (HEADER_SIZE + report.len()) as u16)
        .to_bytes()
        .to_vec();
    record.extend(report);
    record
}

pub fn oa_block(samples: &[(u32, Option<u32>)]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&(timestamp, ctx_id)| oa_sample(timestamp, ctx_id))
        .collect()
}

/// `n` samples `step` ticks apart starting at `start`, all on `ctx_id`.
pub fn run(start: u32, step: u32, n: u32, ctx_id: Option<u32>) -> Vec<(u32, Option<u32>)> {
    (0..n).map(|i| (start + i * step, ctx_id)).collect()
}

/// i915_request_add payload matching [`REQUEST_ADD_FORMAT`].
pub fn request_add(pid: u32, hw_id: u32) -> Vec<u8> {
    let mut data = vec![0u8; 16];
    data[4..8].copy_from_slice(&pid.to_ne_bytes());
    data[12..16].copy_from_slice(&hw_id.to_ne_bytes());
    data
}

pub fn tracepoint_sample(time: u64, data: &[u8]) -> Vec<u8> {
    let size = HEADER_SIZE + 8 + 4 + data.len();
    let mut record = RecordHeader::new(RecordKind::Sample, size as u16)
        .to_bytes()
        .to_vec();
    record.extend(time.to_ne_bytes());
    record.extend((data.len() as u32).to_ne_bytes());
    record.extend_from_slice(data);
    record
}
