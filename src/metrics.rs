//! Device description and the static OA metric catalog.
//!
//! The catalog is plain data: a [`MetricSet`] names the OA report layout the
//! hardware produces and lists [`Counter`]s whose values are computed from
//! an accumulator's raw deltas by matching on a [`CounterEquation`].

use serde::{Deserialize, Serialize};

use crate::accumulator::OaAccumulator;

const NSEC_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DevInfo {
    #[serde(default)]
    pub devname: String,
    #[serde(default)]
    pub prettyname: String,
    #[serde(default)]
    pub devid: u32,
    pub gen: u32,
    /// Frequency of the OA timestamp counter in Hz.
    pub timestamp_frequency: u64,
    #[serde(default)]
    pub gt_min_freq: u64,
    #[serde(default)]
    pub gt_max_freq: u64,
    #[serde(default)]
    pub n_eus: u64,
    #[serde(default)]
    pub eu_threads_count: u64,
}

impl Default for DevInfo {
    fn default() -> Self {
        DevInfo {
            devname: "sklgt2".to_string(),
            prettyname: "Skylake GT2".to_string(),
            devid: 0,
            gen: 9,
            timestamp_frequency: 12_000_000,
            gt_min_freq: 300_000_000,
            gt_max_freq: 1_150_000_000,
            n_eus: 24,
            eu_threads_count: 168,
        }
    }
}

impl DevInfo {
    /// Convert timestamp ticks into nanoseconds.
    pub fn timebase_scale_ns(&self, ticks: u64) -> u64 {
        if self.timestamp_frequency == 0 {
            return 0;
        }
        (ticks as u128 * NSEC_PER_SEC as u128 / self.timestamp_frequency as u128) as u64
    }

    /// Convert nanoseconds into timestamp ticks.
    pub fn time_scale_timebase(&self, ns: u64) -> u64 {
        (ns as u128 * self.timestamp_frequency as u128 / NSEC_PER_SEC as u128) as u64
    }

    /// Sampling period selected by an OA period exponent.
    pub fn oa_exponent_to_period_ns(&self, exponent: u32) -> u64 {
        self.timebase_scale_ns(2u64 << exponent.min(62))
    }

    /// Smallest OA exponent whose period is at least `period_ns`.
    pub fn time_to_oa_exponent(&self, period_ns: u64) -> u32 {
        let ticks = self.time_scale_timebase(period_ns);
        (0..31).find(|&e| (2u64 << e) >= ticks).unwrap_or(31)
    }
}

/// OA report layouts understood by the accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum OaFormat {
    /// Timestamp, clock, 32x 40bit A counters, 4x 32bit A, 8x B, 8x C.
    #[serde(rename = "A32u40_A4u32_B8_C8")]
    A32u40A4u32B8C8,
    /// Timestamp and 61 contiguous 32bit counters.
    #[serde(rename = "A45_B8_C8")]
    A45B8C8,
}

impl OaFormat {
    pub const fn report_size(self) -> usize {
        256
    }

    /// Number of delta slots the layout fills.
    pub const fn n_deltas(self) -> usize {
        match self {
            OaFormat::A32u40A4u32B8C8 => 2 + 32 + 4 + 16,
            OaFormat::A45B8C8 => 1 + 61,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterDataType {
    #[default]
    Uint64,
    Uint32,
    Double,
    Float,
    Bool32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterUnits {
    Bytes,
    Hz,
    Ns,
    Us,
    Pixels,
    Texels,
    Threads,
    Percent,
    Messages,
    Number,
    Cycles,
    Events,
    Utilization,
    EuSendsToL3CacheLines,
    EuAtomicRequestsToL3CacheLines,
    EuRequestsToL3CacheLines,
    EuBytesPerL3CacheLine,
}

fn default_scale() -> f64 {
    1.0
}

/// How a counter's value is derived from accumulated deltas.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CounterEquation {
    /// Raw accumulated delta of one slot.
    Delta { index: usize },
    /// Delta of one slot multiplied by a constant.
    Scaled { index: usize, scale: f64 },
    /// Elapsed GPU time in nanoseconds.
    GpuTime,
    /// Elapsed GPU core clocks.
    GpuCoreClocks,
    /// Average GPU core frequency in Hz over the window.
    AvgGpuCoreFrequency,
    /// Events per second of GPU time.
    PerSecond { index: usize },
    /// `scale * numerator / denominator`, zero when the denominator is.
    Ratio {
        numerator: usize,
        denominator: usize,
        #[serde(default = "default_scale")]
        scale: f64,
    },
    /// Share of GPU core clocks, in percent.
    PercentOfClocks { index: usize },
    Constant { value: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CounterValue {
    Uint(u64),
    Float(f64),
}

impl CounterValue {
    pub fn as_f64(self) -> f64 {
        match self {
            CounterValue::Uint(v) => v as f64,
            CounterValue::Float(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Counter {
    pub name: String,
    pub symbol_name: String,
    #[serde(default)]
    pub desc: String,
    pub units: CounterUnits,
    #[serde(default)]
    pub data_type: CounterDataType,
    pub equation: CounterEquation,
    #[serde(default)]
    pub max: Option<CounterEquation>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MetricSet {
    pub name: String,
    pub symbol_name: String,
    pub hw_config_guid: String,
    pub format: OaFormat,
    #[serde(default)]
    pub counters: Vec<Counter>,
}

impl MetricSet {
    pub fn report_size(&self) -> usize {
        self.format.report_size()
    }

    pub fn gpu_time_offset(&self) -> usize {
        0
    }

    pub fn gpu_clock_offset(&self) -> Option<usize> {
        match self.format {
            OaFormat::A32u40A4u32B8C8 => Some(1),
            OaFormat::A45B8C8 => None,
        }
    }

    pub fn a_offset(&self) -> usize {
        match self.format {
            OaFormat::A32u40A4u32B8C8 => 2,
            OaFormat::A45B8C8 => 1,
        }
    }

    pub fn b_offset(&self) -> usize {
        match self.format {
            OaFormat::A32u40A4u32B8C8 => 2 + 36,
            OaFormat::A45B8C8 => 1 + 45,
        }
    }

    pub fn c_offset(&self) -> usize {
        self.b_offset() + 8
    }

    pub fn counter(&self, symbol_name: &str) -> Option<&Counter> {
        self.counters.iter().find(|c| c.symbol_name == symbol_name)
    }
}

fn delta(deltas: &[u64], index: usize) -> u64 {
    deltas.get(index).copied().unwrap_or(0)
}

fn ratio(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        0.0
    } else {
        numerator / denominator
    }
}

impl CounterEquation {
    pub fn evaluate(&self, devinfo: &DevInfo, metric_set: &MetricSet, deltas: &[u64]) -> CounterValue {
        let gpu_time_ns =
            || devinfo.timebase_scale_ns(delta(deltas, metric_set.gpu_time_offset())) as f64;
        let clocks = || {
            metric_set
                .gpu_clock_offset()
                .map_or(0, |offset| delta(deltas, offset))
        };

        match *self {
            CounterEquation::Delta { index } => CounterValue::Uint(delta(deltas, index)),
            CounterEquation::Scaled { index, scale } => {
                CounterValue::Float(delta(deltas, index) as f64 * scale)
            }
            CounterEquation::GpuTime => CounterValue::Uint(
                devinfo.timebase_scale_ns(delta(deltas, metric_set.gpu_time_offset())),
            ),
            CounterEquation::GpuCoreClocks => CounterValue::Uint(clocks()),
            CounterEquation::AvgGpuCoreFrequency => {
                CounterValue::Float(ratio(clocks() as f64 * NSEC_PER_SEC as f64, gpu_time_ns()))
            }
            CounterEquation::PerSecond { index } => CounterValue::Float(ratio(
                delta(deltas, index) as f64 * NSEC_PER_SEC as f64,
                gpu_time_ns(),
            )),
            CounterEquation::Ratio {
                numerator,
                denominator,
                scale,
            } => CounterValue::Float(
                scale * ratio(delta(deltas, numerator) as f64, delta(deltas, denominator) as f64),
            ),
            CounterEquation::PercentOfClocks { index } => {
                CounterValue::Float(100.0 * ratio(delta(deltas, index) as f64, clocks() as f64))
            }
            CounterEquation::Constant { value } => CounterValue::Float(value),
        }
    }
}

impl Counter {
    /// Evaluate the counter and coerce the result to its declared data type.
    pub fn read(&self, devinfo: &DevInfo, metric_set: &MetricSet, deltas: &[u64]) -> CounterValue {
        coerce(
            self.data_type,
            self.equation.evaluate(devinfo, metric_set, deltas),
        )
    }

    /// Largest value the counter can reach over `ns_time`, or 0.0 when the
    /// catalog does not describe one.
    ///
    /// The maximum equation is evaluated on the deltas of two synthetic
    /// reports spanning `ns_time` of GPU time.
    pub fn max_value(&self, devinfo: &DevInfo, metric_set: &MetricSet, ns_time: u64) -> f64 {
        let Some(max) = &self.max else {
            return 0.0;
        };

        let ticks = devinfo.time_scale_timebase(ns_time) as u32;
        let size = metric_set.report_size();
        let mut report0 = vec![0u8; size];
        let mut report1 = vec![0u8; size];
        report0[4..8].copy_from_slice(&1u32.to_ne_bytes());
        report1[4..8].copy_from_slice(&1u32.wrapping_add(ticks).to_ne_bytes());
        report1[12..16].copy_from_slice(&ticks.to_ne_bytes());

        let mut accumulator = OaAccumulator::new(devinfo, metric_set.clone().into());
        accumulator.accumulate(&report0, &report1);

        coerce(
            self.data_type,
            max.evaluate(devinfo, metric_set, accumulator.deltas()),
        )
        .as_f64()
    }
}

fn coerce(data_type: CounterDataType, value: CounterValue) -> CounterValue {
    match (data_type, value) {
        (CounterDataType::Uint64, CounterValue::Float(v)) => CounterValue::Uint(v as u64),
        (CounterDataType::Uint32, v) => CounterValue::Uint(match v {
            CounterValue::Uint(v) => v & u32::MAX as u64,
            CounterValue::Float(v) => v as u32 as u64,
        }),
        (CounterDataType::Bool32, v) => CounterValue::Uint((v.as_f64() != 0.0) as u64),
        (CounterDataType::Double | CounterDataType::Float, v) => CounterValue::Float(v.as_f64()),
        (CounterDataType::Uint64, v) => v,
    }
}

/// Render a counter value with a unit-appropriate scale suffix.
pub fn pretty_print_value(units: CounterUnits, value: f64) -> String {
    const TIMES: [&str; 4] = ["ns", "us", "ms", "s"];
    const BYTES: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    const FREQS: [&str; 4] = ["Hz", "KHz", "MHz", "GHz"];
    const TEXELS: [&str; 4] = ["texels", "K texels", "M texels", "G texels"];
    const PIXELS: [&str; 4] = ["pixels", "K pixels", "M pixels", "G pixels"];
    const CYCLES: [&str; 4] = ["cycles", "K cycles", "M cycles", "G cycles"];
    const THREADS: [&str; 4] = ["threads", "K threads", "M threads", "G threads"];

    let scales = match units {
        CounterUnits::Bytes => Some(&BYTES),
        CounterUnits::Hz => Some(&FREQS),
        CounterUnits::Ns | CounterUnits::Us => Some(&TIMES),
        CounterUnits::Pixels => Some(&PIXELS),
        CounterUnits::Texels => Some(&TEXELS),
        CounterUnits::Threads => Some(&THREADS),
        CounterUnits::Cycles => Some(&CYCLES),
        _ => None,
    };

    let Some(scales) = scales else {
        return if units == CounterUnits::Percent {
            format!("{} %", format_g(value, 3))
        } else {
            format!("{:.2}", value)
        };
    };

    let base = if units == CounterUnits::Bytes { 1024.0 } else { 1000.0 };
    let mut value = if units == CounterUnits::Us {
        value * 1000.0
    } else {
        value
    };

    let mut i = 0;
    while value >= base && i < 3 {
        value /= base;
        i += 1;
    }
    format!("{} {}", format_g(value, 4), scales[i])
}

/// printf-style `%.<precision>g` formatting.
fn format_g(value: f64, precision: usize) -> String {
    if value == 0.0 || !value.is_finite() {
        return format!("{}", value);
    }

    let precision = precision.max(1);
    let sci = format!("{:.*e}", precision - 1, value);
    let (mantissa, exp) = sci.split_once('e').unwrap_or((sci.as_str(), "0"));
    let exp: i32 = exp.parse().unwrap_or(0);

    if exp < -4 || exp >= precision as i32 {
        let sign = if exp < 0 { '-' } else { '+' };
        format!("{}e{}{:02}", trim_fraction(mantissa), sign, exp.abs())
    } else {
        let decimals = (precision as i32 - 1 - exp) as usize;
        trim_fraction(&format!("{:.*}", decimals, value))
    }
}

fn trim_fraction(s: &str) -> String {
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric_set(format: OaFormat) -> MetricSet {
        MetricSet {
            name: "Render Basic".to_string(),
            symbol_name: "RenderBasic".to_string(),
            hw_config_guid: "b541bd57-0e0f-4154-b4c0-5858010a2bf7".to_string(),
            format,
            counters: Vec::new(),
        }
    }

    #[test]
    fn test_time_scaling() {
        let devinfo = DevInfo::default();
        assert_eq!(devinfo.timebase_scale_ns(12_000_000), 1_000_000_000);
        assert_eq!(devinfo.time_scale_timebase(1_000_000_000), 12_000_000);
    }

    #[test]
    fn test_oa_exponent_round_trip_covers_period() {
        let devinfo = DevInfo::default();
        let exponent = devinfo.time_to_oa_exponent(1_000_000);
        let period = devinfo.oa_exponent_to_period_ns(exponent);
        assert!(period >= 1_000_000 - 100);
        assert!(devinfo.oa_exponent_to_period_ns(exponent.saturating_sub(1)) < 1_000_000);
    }

    #[test]
    fn test_offsets_by_format() {
        let a = metric_set(OaFormat::A32u40A4u32B8C8);
        assert_eq!(a.a_offset(), 2);
        assert_eq!(a.b_offset(), 38);
        assert_eq!(a.c_offset(), 46);
        assert_eq!(a.gpu_clock_offset(), Some(1));

        let b = metric_set(OaFormat::A45B8C8);
        assert_eq!(b.a_offset(), 1);
        assert_eq!(b.c_offset(), 54);
        assert_eq!(b.gpu_clock_offset(), None);
    }

    #[test]
    fn test_equations() {
        let devinfo = DevInfo::default();
        let set = metric_set(OaFormat::A32u40A4u32B8C8);
        let mut deltas = [0u64; 62];
        deltas[0] = 12_000; // 1ms of GPU time
        deltas[1] = 1_000_000; // clocks
        deltas[2] = 250_000;

        let eval = |eq: CounterEquation| eq.evaluate(&devinfo, &set, &deltas).as_f64();
        assert_eq!(eval(CounterEquation::GpuTime), 1_000_000.0);
        assert_eq!(eval(CounterEquation::AvgGpuCoreFrequency), 1_000_000_000.0);
        assert_eq!(eval(CounterEquation::PercentOfClocks { index: 2 }), 25.0);
        assert_eq!(
            eval(CounterEquation::Ratio {
                numerator: 2,
                denominator: 3,
                scale: 1.0
            }),
            0.0
        );
    }

    #[test]
    fn test_counter_max_value() {
        let devinfo = DevInfo::default();
        let mut set = metric_set(OaFormat::A32u40A4u32B8C8);
        set.counters.push(Counter {
            name: "GPU Core Clocks".to_string(),
            symbol_name: "GpuCoreClocks".to_string(),
            desc: String::new(),
            units: CounterUnits::Cycles,
            data_type: CounterDataType::Uint64,
            equation: CounterEquation::GpuCoreClocks,
            max: Some(CounterEquation::GpuCoreClocks),
        });

        let counter = &set.counters[0];
        assert_eq!(counter.max_value(&devinfo, &set, 1_000_000_000), 12_000_000.0);
    }

    #[test]
    fn test_pretty_print_value() {
        assert_eq!(pretty_print_value(CounterUnits::Bytes, 2048.0), "2 KiB");
        assert_eq!(pretty_print_value(CounterUnits::Ns, 1500.0), "1.5 us");
        assert_eq!(pretty_print_value(CounterUnits::Us, 2.0), "2 ms");
        assert_eq!(pretty_print_value(CounterUnits::Hz, 1_150_000_000.0), "1.15 GHz");
        assert_eq!(pretty_print_value(CounterUnits::Percent, 45.678), "45.7 %");
        assert_eq!(pretty_print_value(CounterUnits::Number, 3.14159), "3.14");
    }

    #[test]
    fn test_format_g() {
        assert_eq!(format_g(123456.0, 4), "1.235e+05");
        assert_eq!(format_g(0.0001234, 3), "0.000123");
        assert_eq!(format_g(999.96, 4), "1000");
    }
}
