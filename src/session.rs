//! The session ties the OA record stream, tracepoint streams and server
//! answers together.
//!
//! Every sample record is folded into up to three open windows: the global
//! graph window, the timeline window of the hardware context that was
//! running, and that context's own graph window. Graph windows close once
//! they span more than the aggregation period; timeline windows also close
//! when the running context changes. Closed windows move to a track history
//! bounded by the visible window.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{bail, Result};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::accumulator::OaAccumulator;
use crate::chunk::{ChunkArena, ChunkId};
use crate::config::Config;
use crate::context::{HwContext, HwContextRegistry};
use crate::metrics::{Counter, DevInfo, MetricSet};
use crate::oa::{report_ctx_id, report_reason, report_timestamp};
use crate::process::ProcessRegistry;
use crate::record::{complete_len, records, RecordConfig, RecordError, RecordKind};
use crate::tracepoint::{sample_records, Tracepoint, TracepointSet};
use crate::transport::{split_payload, PayloadKind, Request, RequestSink, ServerMessage, StreamConfig};
use crate::window::{AccumulatedWindow, ReportRef, Track, WindowId, WindowPool};

const MAX_MESSAGES: usize = 100;

/// Called after a graph window closes: once with `None` for the global
/// window, then once per hardware context.
pub type WindowCallback = Box<dyn FnMut(&Session, Option<&HwContext>)>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub oa_chunks: u64,
    pub samples: u64,
    pub spurious_reports: u64,
    pub lost_reports: u64,
    pub lost_buffers: u64,
    pub malformed_blocks: u64,
    pub unknown_records: u64,
    pub unknown_streams: u64,
    pub tracepoint_samples: u64,
    pub graph_windows: u64,
    pub timeline_windows: u64,
}

// The previous sample, carried over between blocks.
struct LastReport {
    report_ref: ReportRef,
    hw_id: Option<u32>,
    report: Vec<u8>,
}

/// One report pair of a replayed window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReplayedReport {
    pub timestamp: u32,
    pub reason: &'static str,
    pub deltas: Vec<u64>,
}

pub struct Session {
    devinfo: DevInfo,
    record_config: RecordConfig,
    metric_set: Option<Arc<MetricSet>>,
    aggregation_period_ns: u64,
    sampling_period_ns: u64,
    visible_ns: u64,
    n_cpus: u32,
    warn_report_loss: bool,

    arena: ChunkArena,
    pool: WindowPool,
    contexts: HwContextRegistry,
    processes: ProcessRegistry,
    tracepoints: TracepointSet,

    graphs: Track,
    current_graph: Option<WindowId>,
    timelines: Track,
    current_timeline: Option<WindowId>,
    last: Option<LastReport>,
    last_oa_timestamp: u64,
    // Trailing bytes of an OA block that ended mid-record.
    pending: Vec<u8>,

    oa_stream_id: Option<u32>,
    next_stream_id: u32,
    sampling: bool,

    sink: Box<dyn RequestSink>,
    on_window_closed: Option<WindowCallback>,
    stats: SessionStats,
    messages: VecDeque<(u32, String)>,
}

impl Session {
    pub fn new(config: &Config, sink: Box<dyn RequestSink>) -> Result<Self> {
        config.validate()?;

        let metric_set = config.selected_metric_set();
        let report_size = metric_set
            .as_ref()
            .map_or(crate::oa::OA_REPORT_SIZE, |set| set.report_size());
        let visible_ns = config.visible_window_ns();

        let mut session = Session {
            devinfo: config.devinfo.clone(),
            record_config: RecordConfig {
                gpu_timestamps: config.gpu_timestamps,
                cpu_timestamps: config.cpu_timestamps,
                report_size,
            },
            metric_set,
            aggregation_period_ns: config.aggregation_period_ns,
            sampling_period_ns: config.sampling_period_ns.min(config.aggregation_period_ns),
            visible_ns,
            n_cpus: config.n_cpus,
            warn_report_loss: config.warn_report_loss,
            arena: ChunkArena::new(),
            pool: WindowPool::new(),
            contexts: HwContextRegistry::new(),
            processes: ProcessRegistry::new(),
            tracepoints: TracepointSet::new(visible_ns),
            graphs: Track::new(),
            current_graph: None,
            timelines: Track::new(),
            current_timeline: None,
            last: None,
            last_oa_timestamp: visible_ns,
            pending: Vec::new(),
            oa_stream_id: None,
            // 0 is never a valid stream id.
            next_stream_id: 1,
            sampling: false,
            sink,
            on_window_closed: None,
            stats: SessionStats::default(),
            messages: VecDeque::new(),
        };

        for name in &config.tracepoints {
            session.add_tracepoint(name);
        }
        Ok(session)
    }

    pub fn set_on_window_closed(&mut self, callback: impl FnMut(&Session, Option<&HwContext>) + 'static) {
        self.on_window_closed = Some(Box::new(callback));
    }

    pub fn clear_on_window_closed(&mut self) {
        self.on_window_closed = None;
    }

    /// Drop every window, context and process and open the OA and
    /// tracepoint streams.
    pub fn start_sampling(&mut self) {
        if self.sampling {
            self.stop_sampling();
        }

        self.empty_samples();
        self.tracepoints.clear_samples();
        self.processes.clear();
        self.contexts.clear_process_map();

        if let Some(metric_set) = &self.metric_set {
            let id = self.next_stream_id;
            self.next_stream_id += 1;
            self.sink.send(Request::OpenStream {
                id,
                config: StreamConfig::Oa {
                    hw_config_guid: metric_set.hw_config_guid.clone(),
                    period_exponent: self.devinfo.time_to_oa_exponent(self.sampling_period_ns),
                    cpu_timestamps: self.record_config.cpu_timestamps,
                    gpu_timestamps: self.record_config.gpu_timestamps,
                },
            });
            self.oa_stream_id = Some(id);
            info!(stream = id, metric_set = %metric_set.symbol_name, "opened OA stream");
        } else {
            warn!("no metric set selected, not opening an OA stream");
        }

        self.tracepoints
            .open_streams(self.n_cpus, &mut self.next_stream_id, self.sink.as_mut());
        self.sampling = true;
    }

    /// Close every stream and drop open windows. Closed windows stay in
    /// their tracks.
    pub fn stop_sampling(&mut self) {
        if let Some(id) = self.oa_stream_id.take() {
            self.sink.send(Request::CloseStream { id });
        }
        self.tracepoints.close_streams(self.sink.as_mut());

        let open: Vec<WindowId> = self.contexts.iter_mut().filter_map(|c| c.current.take()).collect();
        for id in open {
            self.release_window(id);
        }
        if let Some(id) = self.current_graph.take() {
            self.release_window(id);
        }
        if let Some(id) = self.current_timeline.take() {
            self.release_window(id);
        }
        if let Some(last) = self.last.take() {
            self.arena.release(last.report_ref.chunk);
        }
        self.pending.clear();

        self.sampling = false;
        info!("sampling stopped");
    }

    fn empty_samples(&mut self) {
        for id in self.timelines.drain() {
            self.release_window(id);
        }
        if let Some(id) = self.current_timeline.take() {
            self.release_window(id);
        }
        self.contexts.clear(&mut self.pool, &mut self.arena);

        for id in self.graphs.drain() {
            self.release_window(id);
        }
        if let Some(id) = self.current_graph.take() {
            self.release_window(id);
        }

        if let Some(last) = self.last.take() {
            self.arena.release(last.report_ref.chunk);
        }
        self.pending.clear();
        self.last_oa_timestamp = self.visible_ns;

        debug_assert!(self.pool.is_empty());
        debug_assert_eq!(self.arena.live_chunks(), 0);
    }

    pub fn set_aggregation_period(&mut self, period_ns: u64) -> Result<()> {
        if period_ns == 0 {
            bail!("aggregation period must be positive");
        }
        self.aggregation_period_ns = period_ns;
        self.sampling_period_ns = self.sampling_period_ns.min(period_ns);
        Ok(())
    }

    pub fn set_sampling_period(&mut self, period_ns: u64) -> Result<()> {
        if period_ns == 0 {
            bail!("sampling period must be positive");
        }
        self.sampling_period_ns = period_ns.min(self.aggregation_period_ns);
        Ok(())
    }

    pub fn set_visible_window(&mut self, seconds: f64) -> Result<()> {
        if !(seconds > 0.0) {
            bail!("visible window must be positive, got {}", seconds);
        }
        self.visible_ns = (seconds * 1_000_000_000.0) as u64;
        self.tracepoints.set_visible_window(self.visible_ns);
        Ok(())
    }

    pub fn set_metric_set(&mut self, metric_set: Arc<MetricSet>) -> Result<()> {
        if self.sampling {
            bail!(
                "cannot switch to metric set {} while sampling",
                metric_set.symbol_name
            );
        }
        self.empty_samples();
        self.record_config.report_size = metric_set.report_size();
        self.metric_set = Some(metric_set);
        Ok(())
    }

    pub fn add_tracepoint(&mut self, name: &str) -> &Tracepoint {
        self.tracepoints.add(name, self.sink.as_mut())
    }

    pub fn remove_tracepoint(&mut self, name: &str) -> bool {
        self.tracepoints.remove(name, self.sink.as_mut())
    }

    /// Handle a payload from the transport. Control payloads carry a JSON
    /// encoded [`ServerMessage`].
    pub fn handle_data(&mut self, payload: &[u8]) {
        let Some((msg_type, stream_id, data)) = split_payload(payload) else {
            warn!(len = payload.len(), "payload shorter than its prefix");
            return;
        };

        match PayloadKind::from_type(msg_type) {
            Some(PayloadKind::PerfData) | Some(PayloadKind::OaData) => self.feed(stream_id, data),
            Some(PayloadKind::Control) => match serde_json::from_slice::<ServerMessage>(data) {
                Ok(message) => self.handle_message(message),
                Err(e) => warn!("undecodable control payload: {}", e),
            },
            None => warn!(msg_type, "unknown message type"),
        }
    }

    /// Feed one block of stream data.
    pub fn feed(&mut self, stream_id: u32, bytes: &[u8]) {
        if self.oa_stream_id == Some(stream_id) {
            self.feed_oa(bytes);
        } else if let Some((idx, cpu)) = self.tracepoints.stream(stream_id) {
            self.feed_tracepoint(idx, cpu, bytes);
        } else {
            debug!(stream_id, "data for unknown stream");
            self.stats.unknown_streams += 1;
        }
    }

    pub fn handle_message(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::ProcessInfo { pid, comm, cmd_line } => {
                if self.processes.update(pid, &comm, &cmd_line) {
                    debug!(pid, comm = %comm, "process info");
                    self.contexts.refresh_process(pid, &self.processes);
                }
            }
            ServerMessage::TracepointInfo {
                uuid,
                event_id,
                format,
            } => {
                let Some(idx) = self
                    .tracepoints
                    .update_info(&uuid, event_id, &format)
                    .map(|tp| tp.idx)
                else {
                    debug!(uuid = %uuid, "tracepoint info for unknown tracepoint");
                    return;
                };
                if self.sampling {
                    self.tracepoints.open_tracepoint_streams(
                        idx,
                        self.n_cpus,
                        &mut self.next_stream_id,
                        self.sink.as_mut(),
                    );
                }
            }
            ServerMessage::Log { level, message } => {
                info!(level, "server: {}", message);
                self.push_message(level, message);
            }
            ServerMessage::Error(message) => {
                warn!("server error: {}", message);
                self.push_message(0, message);
            }
        }
    }

    fn push_message(&mut self, level: u32, message: String) {
        if self.messages.len() == MAX_MESSAGES {
            self.messages.pop_front();
        }
        self.messages.push_back((level, message));
    }

    fn feed_tracepoint(&mut self, idx: usize, cpu: u32, bytes: &[u8]) {
        for record in sample_records(bytes) {
            let (time, data) = match record {
                Ok(record) => record,
                Err(e) => {
                    warn!("malformed tracepoint block: {}", e);
                    self.stats.malformed_blocks += 1;
                    break;
                }
            };

            self.stats.tracepoint_samples += 1;
            self.tracepoints.push_sample(idx, cpu, time, data);
            self.correlate(idx, data);
        }
    }

    fn correlate(&mut self, idx: usize, data: &[u8]) {
        let Some(tp) = self.tracepoints.get(idx) else {
            return;
        };
        let Some(pid) = tp.sample_pid(data) else {
            return;
        };
        let hw_id = tp.correlate(data).map(|(_, hw_id)| hw_id);

        if self.processes.get_or_request(pid, self.sink.as_mut()).is_none() {
            return;
        }
        if let Some(hw_id) = hw_id {
            if self.contexts.update_process(hw_id, pid, &self.processes) {
                debug!(hw_id, pid, "hw context attributed to process");
            }
        }
    }

    fn feed_oa(&mut self, bytes: &[u8]) {
        let Some(metric_set) = self.metric_set.clone() else {
            debug!("OA data without a metric set");
            return;
        };

        self.stats.oa_chunks += 1;

        let mut data = std::mem::take(&mut self.pending);
        data.extend_from_slice(bytes);
        self.pending = data.split_off(complete_len(&data));
        if data.is_empty() {
            return;
        }
        let chunk = self.arena.retain(&data);

        for record in records(&data) {
            let record = match record {
                Ok(record) => record,
                Err(e @ RecordError::UnknownType { .. }) => {
                    warn!("{}, dropping rest of block", e);
                    self.stats.unknown_records += 1;
                    break;
                }
                Err(e) => {
                    warn!("malformed OA block: {}", e);
                    self.stats.malformed_blocks += 1;
                    break;
                }
            };

            match record.kind {
                RecordKind::OaBufferLost => {
                    warn!("OA buffer error, all records lost");
                    self.stats.lost_buffers += 1;
                }
                RecordKind::OaReportLost => {
                    if self.warn_report_loss {
                        warn!("OA report lost");
                    } else {
                        debug!("OA report lost");
                    }
                    self.stats.lost_reports += 1;
                }
                RecordKind::Sample => {
                    let Some(report) = self.record_config.oa_report(record.bytes) else {
                        warn!(
                            "{}",
                            RecordError::ShortSample {
                                offset: record.offset,
                                size: record.bytes.len(),
                                expected: self.record_config.sample_size(),
                            }
                        );
                        self.stats.malformed_blocks += 1;
                        break;
                    };
                    let here = ReportRef {
                        chunk,
                        offset: record.offset,
                    };
                    self.accumulate_sample(&metric_set, here, record.bytes, report);
                }
            }
        }

        self.arena.release(chunk);
    }

    // Position of a sample on the session time axis.
    fn sample_timestamp(&self, record: &[u8], report: &[u8], last: Option<&LastReport>) -> u64 {
        if let Some(ts) = self.record_config.cpu_timestamp(record) {
            return ts;
        }

        let ts = report_timestamp(report);
        let prev = last.map_or(ts, |last| report_timestamp(&last.report));
        self.last_oa_timestamp + self.devinfo.timebase_scale_ns(ts.wrapping_sub(prev) as u64)
    }

    fn accumulate_sample(&mut self, metric_set: &Arc<MetricSet>, here: ReportRef, record: &[u8], report: &[u8]) {
        self.stats.samples += 1;
        if report_timestamp(report) == 0 {
            trace!("spurious report with timestamp of zero");
            self.stats.spurious_reports += 1;
            return;
        }

        let hw_id = report_ctx_id(&self.devinfo, report);
        let last = self.last.take();
        let timestamp = self.sample_timestamp(record, report, last.as_ref());

        if self.current_graph.is_none() {
            self.current_graph = Some(self.open_window(metric_set, here, timestamp, None));
            for ctx_hw_id in self.contexts.hw_ids() {
                let id = self.open_window(metric_set, here, timestamp, None);
                if let Some(context) = self.contexts.get_mut(ctx_hw_id) {
                    debug_assert!(context.current.is_none());
                    context.current = Some(id);
                }
            }
        }

        if let Some(last) = &last {
            if let (Some(last_hw_id), None) = (last.hw_id, self.current_timeline) {
                let id = self.open_timeline(metric_set, last.report_ref, last_hw_id);
                self.current_timeline = Some(id);
            }

            self.fold(&last.report, last.hw_id, report, hw_id, here, timestamp);
        }

        self.last_oa_timestamp = timestamp;
        let mut buffer = match last {
            Some(last) => {
                self.arena.release(last.report_ref.chunk);
                last.report
            }
            None => Vec::with_capacity(report.len()),
        };
        buffer.clear();
        buffer.extend_from_slice(report);
        self.last = Some(LastReport {
            report_ref: ReportRef {
                chunk: self.arena.clone_ref(here.chunk),
                offset: here.offset,
            },
            hw_id,
            report: buffer,
        });
    }

    // Fold the pair (prev, report) into every open window and close the
    // ones that are done.
    fn fold(
        &mut self,
        prev: &[u8],
        prev_hw_id: Option<u32>,
        report: &[u8],
        hw_id: Option<u32>,
        here: ReportRef,
        timestamp: u64,
    ) {
        let period = self.aggregation_period_ns;

        if let Some(timeline_id) = self.current_timeline {
            let mut running = None;
            let mut close = false;
            if let Some(window) = self.pool.get_mut(timeline_id) {
                running = window.context;
                if window.accumulator.accumulate(prev, report) {
                    close = prev_hw_id != hw_id || window.accumulator.elapsed() > period;
                }
            }
            if close {
                self.close_timeline(here, timestamp);
            }

            // The running context's graph only sees the reports it ran for.
            let graph_id = running.and_then(|id| self.contexts.get(id)).and_then(|c| c.current);
            if let Some(window) = graph_id.and_then(|id| self.pool.get_mut(id)) {
                window.accumulator.accumulate(prev, report);
            }
        }

        let Some(graph_id) = self.current_graph else {
            return;
        };
        let close = match self.pool.get_mut(graph_id) {
            Some(window) => {
                window.accumulator.accumulate(prev, report) && window.accumulator.elapsed() > period
            }
            None => false,
        };
        if close {
            self.close_graphs(here, timestamp);
        }
    }

    fn open_window(
        &mut self,
        metric_set: &Arc<MetricSet>,
        at: ReportRef,
        timestamp: u64,
        context: Option<u32>,
    ) -> WindowId {
        let chunk = self.arena.clone_ref(at.chunk);
        self.pool.alloc(AccumulatedWindow {
            accumulator: OaAccumulator::new(&self.devinfo, metric_set.clone()),
            context,
            start_report: ReportRef {
                chunk,
                offset: at.offset,
            },
            end_report: None,
            timestamp_start: timestamp,
            timestamp_end: timestamp,
        })
    }

    // Timeline windows start on the previous report, which sits at
    // `last_oa_timestamp` on the session axis.
    fn open_timeline(&mut self, metric_set: &Arc<MetricSet>, at: ReportRef, hw_id: u32) -> WindowId {
        if self.contexts.get_or_create(hw_id, &self.processes) {
            let start = self
                .current_graph
                .and_then(|id| self.pool.get(id))
                .map(|w| (w.start_report, w.timestamp_start));
            if let Some((start, start_ts)) = start {
                let id = self.open_window(metric_set, start, start_ts, None);
                if let Some(context) = self.contexts.get_mut(hw_id) {
                    context.current = Some(id);
                }
            }
        }
        self.open_window(metric_set, at, self.last_oa_timestamp, Some(hw_id))
    }

    fn end_window(&mut self, id: WindowId, end: ReportRef, timestamp: u64) -> u64 {
        let chunk = self.arena.clone_ref(end.chunk);
        let Some(window) = self.pool.get_mut(id) else {
            self.arena.release(chunk);
            return 0;
        };
        window.end_report = Some(ReportRef {
            chunk,
            offset: end.offset,
        });
        window.timestamp_end = timestamp.max(window.timestamp_start);
        window.duration()
    }

    fn close_timeline(&mut self, end: ReportRef, timestamp: u64) {
        let Some(id) = self.current_timeline.take() else {
            return;
        };
        let duration = self.end_window(id, end, timestamp);

        for old in self.timelines.evict_for(duration, self.visible_ns, &self.pool) {
            if let Some(window) = self.pool.get(old) {
                let spent = window.duration();
                if let Some(context) = window.context.and_then(|hw_id| self.contexts.get_mut(hw_id)) {
                    context.time_spent = context.time_spent.saturating_sub(spent);
                }
            }
            self.release_window(old);
        }
        self.timelines.push(id, &self.pool);

        let hw_id = self.pool.get(id).and_then(|w| w.context);
        if let Some(context) = hw_id.and_then(|hw_id| self.contexts.get_mut(hw_id)) {
            context.time_spent += duration;
        }
        self.stats.timeline_windows += 1;
    }

    fn close_graphs(&mut self, end: ReportRef, timestamp: u64) {
        let Some(id) = self.current_graph.take() else {
            return;
        };
        let duration = self.end_window(id, end, timestamp);
        for old in self.graphs.evict_for(duration, self.visible_ns, &self.pool) {
            self.release_window(old);
        }
        self.graphs.push(id, &self.pool);
        self.stats.graph_windows += 1;
        self.notify(None);

        for hw_id in self.contexts.hw_ids() {
            let Some(current) = self.contexts.get_mut(hw_id).and_then(|c| c.current.take()) else {
                continue;
            };
            let duration = self.end_window(current, end, timestamp);
            let usage_ns = self
                .pool
                .get(current)
                .map_or(0, |w| self.devinfo.timebase_scale_ns(w.accumulator.elapsed_ticks()));

            let Some(context) = self.contexts.get_mut(hw_id) else {
                continue;
            };
            context.usage = usage_ns as f64 / self.aggregation_period_ns as f64;
            let evicted = context.history.evict_for(duration, self.visible_ns, &self.pool);
            context.history.push(current, &self.pool);
            for old in evicted {
                self.release_window(old);
            }

            self.notify(Some(hw_id));
        }
    }

    fn release_window(&mut self, id: WindowId) {
        if let Some(hw_id) = self.pool.release(id, &mut self.arena) {
            self.release_context(hw_id);
        }
    }

    fn release_context(&mut self, hw_id: u32) {
        if !self.contexts.release(hw_id, &mut self.pool, &mut self.arena) {
            return;
        }
        let open = self
            .current_timeline
            .and_then(|id| self.pool.get(id))
            .and_then(|w| w.context);
        assert!(
            open != Some(hw_id),
            "hw context {} removed while its timeline window is open",
            hw_id
        );
    }

    fn notify(&mut self, hw_id: Option<u32>) {
        let Some(mut callback) = self.on_window_closed.take() else {
            return;
        };
        let session: &Session = self;
        match hw_id {
            Some(hw_id) => {
                if let Some(context) = session.contexts.get(hw_id) {
                    callback(session, Some(context));
                }
            }
            None => callback(session, None),
        }
        self.on_window_closed = Some(callback);
    }

    /// Value of `counter` over a window.
    pub fn read_counter_value(&self, window: &AccumulatedWindow, counter: &Counter) -> f64 {
        counter
            .read(&self.devinfo, window.accumulator.metric_set(), window.accumulator.deltas())
            .as_f64()
    }

    /// Largest value `counter` can take over `ns_time`.
    pub fn counter_max_value(&self, counter: &Counter, ns_time: u64) -> f64 {
        match &self.metric_set {
            Some(metric_set) => counter.max_value(&self.devinfo, metric_set, ns_time),
            None => 0.0,
        }
    }

    /// Sum of the per-context usage over the last aggregation period.
    pub fn busyness(&self) -> f64 {
        self.contexts.busyness()
    }

    fn window_gt_timestamp(&self, report_ref: ReportRef) -> Option<u32> {
        let record = self.arena.data(report_ref.chunk)?.get(report_ref.offset..)?;
        let report = self.record_config.oa_report(record)?;
        Some(report_timestamp(report))
    }

    /// Map a raw GPU timestamp onto the session time axis by interpolating
    /// inside the timeline window that covers it.
    pub fn convert_gt_timestamp(&self, gt_timestamp: u32) -> Option<u64> {
        for id in self.timelines.iter() {
            let window = self.pool.get(id)?;
            let start_gt = self.window_gt_timestamp(window.start_report)?;
            let end_gt = self.window_gt_timestamp(window.end_report?)?;

            if end_gt < gt_timestamp {
                continue;
            }
            if start_gt > gt_timestamp {
                return None;
            }
            if end_gt == start_gt {
                return Some(window.timestamp_start);
            }

            let delta = (gt_timestamp - start_gt) as u64 * window.duration() / (end_gt - start_gt) as u64;
            return Some(window.timestamp_start + delta);
        }
        None
    }

    /// Per report pair deltas of a window, replayed from the retained
    /// chunks. Reports in chunks that were already freed are skipped.
    pub fn replay_window(&self, id: WindowId) -> Vec<ReplayedReport> {
        let mut replayed = Vec::new();
        let Some(window) = self.pool.get(id) else {
            return replayed;
        };
        let Some(end) = window.end_report.or(self.last.as_ref().map(|l| l.report_ref)) else {
            return replayed;
        };

        let start = window.start_report;
        let mut chunks = vec![start.chunk];
        if start.chunk != end.chunk {
            chunks.extend(self.arena.chunks_after(start.chunk));
        }

        let mut prev: Option<&[u8]> = None;
        'chunks: for chunk in chunks {
            let Some(data) = self.arena.data(chunk) else {
                continue;
            };
            for record in records(data) {
                let Ok(record) = record else {
                    break;
                };
                if chunk == start.chunk && record.offset < start.offset {
                    continue;
                }
                if record.kind != RecordKind::Sample {
                    continue;
                }
                let Some(report) = self.record_config.oa_report(record.bytes) else {
                    break;
                };

                if let Some(prev) = prev {
                    let mut accumulator = OaAccumulator::new(&self.devinfo, window.accumulator.metric_set().clone());
                    accumulator.accumulate(prev, report);
                    replayed.push(ReplayedReport {
                        timestamp: report_timestamp(report),
                        reason: report_reason(&self.devinfo, report),
                        deltas: accumulator.deltas().to_vec(),
                    });
                }
                prev = Some(report);

                if chunk == end.chunk && record.offset >= end.offset {
                    break 'chunks;
                }
            }
            if chunk == end.chunk {
                break;
            }
        }
        replayed
    }

    pub fn window(&self, id: WindowId) -> Option<&AccumulatedWindow> {
        self.pool.get(id)
    }

    /// Closed global graph windows, oldest first.
    pub fn graphs(&self) -> impl Iterator<Item = &AccumulatedWindow> {
        self.graphs.iter().filter_map(|id| self.pool.get(id))
    }

    pub fn graph_ids(&self) -> impl Iterator<Item = WindowId> + '_ {
        self.graphs.iter()
    }

    /// Closed timeline windows, oldest first.
    pub fn timelines(&self) -> impl Iterator<Item = &AccumulatedWindow> {
        self.timelines.iter().filter_map(|id| self.pool.get(id))
    }

    /// Closed graph windows of a context, oldest first.
    pub fn context_graphs<'a>(&'a self, context: &'a HwContext) -> impl Iterator<Item = &'a AccumulatedWindow> {
        context.history.iter().filter_map(|id| self.pool.get(id))
    }

    /// The window that just closed, for use from the window callback.
    pub fn last_closed(&self, context: Option<&HwContext>) -> Option<&AccumulatedWindow> {
        let id = match context {
            Some(context) => context.history.last(),
            None => self.graphs.last(),
        };
        id.and_then(|id| self.pool.get(id))
    }

    pub fn current_graph(&self) -> Option<&AccumulatedWindow> {
        self.current_graph.and_then(|id| self.pool.get(id))
    }

    pub fn current_timeline(&self) -> Option<&AccumulatedWindow> {
        self.current_timeline.and_then(|id| self.pool.get(id))
    }

    pub fn contexts(&self) -> &HwContextRegistry {
        &self.contexts
    }

    pub fn context(&self, hw_id: u32) -> Option<&HwContext> {
        self.contexts.get(hw_id)
    }

    pub fn processes(&self) -> &ProcessRegistry {
        &self.processes
    }

    pub fn tracepoints(&self) -> &TracepointSet {
        &self.tracepoints
    }

    pub fn devinfo(&self) -> &DevInfo {
        &self.devinfo
    }

    pub fn metric_set(&self) -> Option<&Arc<MetricSet>> {
        self.metric_set.as_ref()
    }

    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Server log lines, oldest first.
    pub fn messages(&self) -> impl Iterator<Item = &(u32, String)> {
        self.messages.iter()
    }

    pub fn is_sampling(&self) -> bool {
        self.sampling
    }

    pub fn oa_stream_id(&self) -> Option<u32> {
        self.oa_stream_id
    }

    pub fn aggregation_period_ns(&self) -> u64 {
        self.aggregation_period_ns
    }

    pub fn sampling_period_ns(&self) -> u64 {
        self.sampling_period_ns
    }

    pub fn visible_window_ns(&self) -> u64 {
        self.visible_ns
    }

    pub fn last_oa_timestamp(&self) -> u64 {
        self.last_oa_timestamp
    }

    /// Chunks still referenced by a window or the carried-over report.
    pub fn live_chunks(&self) -> usize {
        self.arena.live_chunks()
    }

    /// Windows currently allocated, open or closed.
    pub fn live_windows(&self) -> usize {
        self.pool.len()
    }

    pub fn chunk_refcount(&self, chunk: ChunkId) -> Option<u32> {
        self.arena.refcount(chunk)
    }
}
