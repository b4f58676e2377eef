//! Folding pairs of OA reports into 64bit counter deltas.

use std::sync::Arc;

use crate::metrics::{DevInfo, MetricSet, OaFormat};
use crate::oa::{read_u32, report_timestamp, MAX_RAW_OA_COUNTERS};

// Byte offset of the high bytes of the 40bit A counters.
const A40_HIGH_BYTES: usize = 160;

/// Extends the wrapping 32bit GPU timestamp into a 64bit nanosecond clock.
#[derive(Debug, Clone, Default)]
pub struct U32Clock {
    start: u64,
    timestamp: u64,
    last_u32: u32,
    initialized: bool,
}

impl U32Clock {
    fn init(&mut self, frequency: u64, u32_start: u32) {
        self.start = scale_ns(frequency, u32_start as u64);
        self.timestamp = self.start;
        self.last_u32 = u32_start;
        self.initialized = true;
    }

    fn progress(&mut self, frequency: u64, u32_timestamp: u32) {
        let delta = u32_timestamp.wrapping_sub(self.last_u32) as u64;
        self.timestamp += scale_ns(frequency, delta);
        self.last_u32 = u32_timestamp;
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Current time in nanoseconds.
    pub fn time(&self) -> u64 {
        self.timestamp
    }
}

fn scale_ns(frequency: u64, ticks: u64) -> u64 {
    if frequency == 0 {
        return 0;
    }
    (ticks as u128 * 1_000_000_000 / frequency as u128) as u64
}

#[derive(Debug, Clone)]
pub struct OaAccumulator {
    metric_set: Arc<MetricSet>,
    timestamp_frequency: u64,
    deltas: [u64; MAX_RAW_OA_COUNTERS],
    first_timestamp: u64,
    last_timestamp: u64,
    clock: U32Clock,
}

impl OaAccumulator {
    pub fn new(devinfo: &DevInfo, metric_set: Arc<MetricSet>) -> Self {
        OaAccumulator {
            metric_set,
            timestamp_frequency: devinfo.timestamp_frequency,
            deltas: [0; MAX_RAW_OA_COUNTERS],
            first_timestamp: 0,
            last_timestamp: 0,
            clock: U32Clock::default(),
        }
    }

    pub fn metric_set(&self) -> &Arc<MetricSet> {
        &self.metric_set
    }

    pub fn deltas(&self) -> &[u64] {
        &self.deltas[..self.metric_set.format.n_deltas()]
    }

    pub fn first_timestamp(&self) -> u64 {
        self.first_timestamp
    }

    pub fn last_timestamp(&self) -> u64 {
        self.last_timestamp
    }

    /// Nanoseconds between the first and last folded reports.
    pub fn elapsed(&self) -> u64 {
        self.last_timestamp.saturating_sub(self.first_timestamp)
    }

    pub fn clock(&self) -> &U32Clock {
        &self.clock
    }

    /// Timestamp ticks covered by the folded pairs, excluding any gaps
    /// between them.
    pub fn elapsed_ticks(&self) -> u64 {
        self.deltas[0]
    }

    /// Reset deltas and timestamps. The clock keeps running so later folds
    /// stay on the same time axis.
    pub fn clear(&mut self) {
        self.deltas = [0; MAX_RAW_OA_COUNTERS];
        self.first_timestamp = 0;
        self.last_timestamp = 0;
    }

    /// Add the counter deltas between `report_a` and the later `report_b`.
    ///
    /// Returns false, leaving the accumulator untouched, if either report has
    /// a zero timestamp.
    pub fn accumulate(&mut self, report_a: &[u8], report_b: &[u8]) -> bool {
        let ts_a = report_timestamp(report_a);
        let ts_b = report_timestamp(report_b);
        if ts_a == 0 || ts_b == 0 {
            tracing::trace!("spurious report with timestamp of zero");
            return false;
        }

        if !self.clock.is_initialized() {
            self.clock.init(self.timestamp_frequency, ts_a);
        }

        let deltas = &mut self.deltas;
        match self.metric_set.format {
            OaFormat::A32u40A4u32B8C8 => {
                let mut idx = 0;
                for word in [1, 3] {
                    deltas[idx] += delta_u32(report_a, report_b, word);
                    idx += 1;
                }
                for i in 0..32 {
                    deltas[idx] += delta_u40(report_a, report_b, i);
                    idx += 1;
                }
                for word in 36..40 {
                    deltas[idx] += delta_u32(report_a, report_b, word);
                    idx += 1;
                }
                for word in 48..64 {
                    deltas[idx] += delta_u32(report_a, report_b, word);
                    idx += 1;
                }
            }
            OaFormat::A45B8C8 => {
                deltas[0] += delta_u32(report_a, report_b, 1);
                for i in 0..61 {
                    deltas[1 + i] += delta_u32(report_a, report_b, 3 + i);
                }
            }
        }

        self.clock.progress(self.timestamp_frequency, ts_a);
        if self.first_timestamp == 0 {
            self.first_timestamp = self.clock.time();
        }
        self.clock.progress(self.timestamp_frequency, ts_b);
        self.last_timestamp = self.clock.time();

        true
    }
}

fn delta_u32(report_a: &[u8], report_b: &[u8], word: usize) -> u64 {
    read_u32(report_b, word).wrapping_sub(read_u32(report_a, word)) as u64
}

fn read_u40(report: &[u8], a_index: usize) -> u64 {
    let high = report.get(A40_HIGH_BYTES + a_index).copied().unwrap_or(0) as u64;
    (high << 32) | read_u32(report, 4 + a_index) as u64
}

fn delta_u40(report_a: &[u8], report_b: &[u8], a_index: usize) -> u64 {
    const MASK: u64 = (1 << 40) - 1;
    read_u40(report_b, a_index).wrapping_sub(read_u40(report_a, a_index)) & MASK
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oa::OA_REPORT_SIZE;

    fn metric_set(format: OaFormat) -> Arc<MetricSet> {
        Arc::new(MetricSet {
            name: "Test".to_string(),
            symbol_name: "Test".to_string(),
            hw_config_guid: "guid".to_string(),
            format,
            counters: Vec::new(),
        })
    }

    fn set_word(report: &mut [u8], word: usize, value: u32) {
        report[word * 4..word * 4 + 4].copy_from_slice(&value.to_ne_bytes());
    }

    fn report(timestamp: u32) -> Vec<u8> {
        let mut report = vec![0u8; OA_REPORT_SIZE];
        set_word(&mut report, 1, timestamp);
        report
    }

    #[test]
    fn test_zero_timestamp_is_spurious() {
        let devinfo = DevInfo::default();
        let mut acc = OaAccumulator::new(&devinfo, metric_set(OaFormat::A32u40A4u32B8C8));
        let mut b = report(100);
        set_word(&mut b, 48, 5);

        assert!(!acc.accumulate(&report(0), &b));
        assert!(!acc.accumulate(&b, &report(0)));
        assert!(acc.deltas().iter().all(|&d| d == 0));
        assert!(!acc.clock().is_initialized());
        assert_eq!(acc.last_timestamp(), 0);
    }

    #[test]
    fn test_u32_wraparound() {
        let devinfo = DevInfo::default();
        let mut acc = OaAccumulator::new(&devinfo, metric_set(OaFormat::A32u40A4u32B8C8));
        let mut a = report(0xffff_fff0);
        let mut b = report(0x10);
        set_word(&mut a, 48, 0xffff_fffe);
        set_word(&mut b, 48, 3);

        assert!(acc.accumulate(&a, &b));
        assert_eq!(acc.deltas()[0], 0x20);
        assert_eq!(acc.deltas()[38], 5);
    }

    #[test]
    fn test_u40_wraparound() {
        let devinfo = DevInfo::default();
        let mut acc = OaAccumulator::new(&devinfo, metric_set(OaFormat::A32u40A4u32B8C8));
        let mut a = report(1);
        let mut b = report(2);
        // A0: 0xff_ffff_fffe -> 0x00_0000_0001
        set_word(&mut a, 4, 0xffff_fffe);
        a[A40_HIGH_BYTES] = 0xff;
        set_word(&mut b, 4, 1);
        // A3 crosses the 32bit boundary without wrapping 40 bits.
        set_word(&mut a, 7, 0xffff_ffff);
        set_word(&mut b, 7, 0);
        b[A40_HIGH_BYTES + 3] = 1;

        assert!(acc.accumulate(&a, &b));
        assert_eq!(acc.deltas()[2], 3);
        assert_eq!(acc.deltas()[5], 1);
    }

    #[test]
    fn test_a45_layout() {
        let devinfo = DevInfo::default();
        let mut acc = OaAccumulator::new(&devinfo, metric_set(OaFormat::A45B8C8));
        let a = report(10);
        let mut b = report(20);
        set_word(&mut b, 3, 7);
        set_word(&mut b, 63, 9);

        assert!(acc.accumulate(&a, &b));
        assert_eq!(acc.deltas().len(), 62);
        assert_eq!(acc.deltas()[0], 10);
        assert_eq!(acc.deltas()[1], 7);
        assert_eq!(acc.deltas()[61], 9);
    }

    #[test]
    fn test_clock_and_timestamps() {
        let devinfo = DevInfo::default();
        let mut acc = OaAccumulator::new(&devinfo, metric_set(OaFormat::A32u40A4u32B8C8));

        // 12 ticks is 1us at 12MHz.
        assert!(acc.accumulate(&report(12), &report(24)));
        assert_eq!(acc.clock().start(), 1_000);
        assert_eq!(acc.first_timestamp(), 1_000);
        assert_eq!(acc.last_timestamp(), 2_000);

        assert!(acc.accumulate(&report(24), &report(36)));
        assert_eq!(acc.first_timestamp(), 1_000);
        assert_eq!(acc.last_timestamp(), 3_000);
        assert_eq!(acc.elapsed(), 2_000);
        assert_eq!(acc.elapsed_ticks(), 24);
        assert_eq!(acc.deltas()[0], 24);

        acc.clear();
        assert_eq!(acc.deltas()[0], 0);
        assert!(acc.accumulate(&report(36), &report(48)));
        assert_eq!(acc.first_timestamp(), 3_000);
    }

    #[test]
    fn test_clock_monotonic_across_wrap() {
        let devinfo = DevInfo::default();
        let mut acc = OaAccumulator::new(&devinfo, metric_set(OaFormat::A32u40A4u32B8C8));

        // 12000 ticks is 1ms at 12MHz; the third step wraps past zero.
        let timestamps: Vec<u32> = (0..6)
            .map(|i| (u32::MAX - 30_000).wrapping_add(i * 12_000))
            .collect();
        assert!(timestamps[2] > timestamps[3]);
        assert!(timestamps.iter().all(|&ts| ts != 0));

        let mut first = None;
        let mut previous = 0;
        for (i, pair) in timestamps.windows(2).enumerate() {
            assert!(acc.accumulate(&report(pair[0]), &report(pair[1])));
            let first = *first.get_or_insert(acc.first_timestamp());
            assert_eq!(acc.first_timestamp(), first);
            assert!(acc.last_timestamp() > previous);
            assert_eq!(acc.last_timestamp() - first, 1_000_000 * (i as u64 + 1));
            previous = acc.last_timestamp();
        }
        assert_eq!(acc.deltas()[0], 12_000 * 5);
        assert_eq!(acc.elapsed(), 5_000_000);
    }
}
