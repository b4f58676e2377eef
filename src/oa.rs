//! Accessors for the fixed fields of a raw OA report.

use bitfield::bitfield;

use crate::metrics::DevInfo;

pub const OA_REPORT_SIZE: usize = 256;

/// Number of delta slots an accumulator carries, enough for every layout.
pub const MAX_RAW_OA_COUNTERS: usize = 62;

const INVALID_CTX_ID: u32 = 0xffff_ffff;

bitfield! {
    /// Word 0 of an OA report: report id, reason and context-valid flags.
    pub struct ReportId(u32);
    impl Debug;
    pub gen9_ctx_valid, _: 16, 16;
    pub reason, _: 24, 19;
    pub gen8_ctx_valid, _: 25, 25;
}

/// Read the native-endian 32bit word at `word` in `report`, 0 past the end.
pub fn read_u32(report: &[u8], word: usize) -> u32 {
    let start = word * 4;
    report
        .get(start..start + 4)
        .map_or(0, |b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
}

pub fn report_id(report: &[u8]) -> ReportId {
    ReportId(read_u32(report, 0))
}

/// Raw 32bit GPU timestamp of the report.
pub fn report_timestamp(report: &[u8]) -> u32 {
    read_u32(report, 1)
}

/// Hardware context id the report was taken for, if the GPU marked it valid.
pub fn report_ctx_id(devinfo: &DevInfo, report: &[u8]) -> Option<u32> {
    let id = report_id(report);
    let valid = match devinfo.gen {
        0..=7 => return None,
        8 => id.gen8_ctx_valid() != 0,
        _ => id.gen9_ctx_valid() != 0,
    };
    if !valid {
        return None;
    }

    match read_u32(report, 2) {
        INVALID_CTX_ID => None,
        ctx_id => Some(ctx_id),
    }
}

/// Human readable reason the hardware wrote the report.
pub fn report_reason(devinfo: &DevInfo, report: &[u8]) -> &'static str {
    if devinfo.gen < 8 {
        return "timer";
    }

    let reason = report_id(report).reason();
    if reason & (1 << 0) != 0 {
        "timer"
    } else if reason & (1 << 1) != 0 {
        "internal trigger 1"
    } else if reason & (1 << 2) != 0 {
        "internal trigger 2"
    } else if reason & (1 << 3) != 0 {
        "context switch"
    } else if reason & (1 << 4) != 0 {
        "GO 1->0 transition (enter RC6)"
    } else if reason & (1 << 5) != 0 {
        "[un]slice clock ratio change"
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(word0: u32, ctx_id: u32) -> Vec<u8> {
        let mut report = vec![0u8; OA_REPORT_SIZE];
        report[0..4].copy_from_slice(&word0.to_ne_bytes());
        report[4..8].copy_from_slice(&1000u32.to_ne_bytes());
        report[8..12].copy_from_slice(&ctx_id.to_ne_bytes());
        report
    }

    #[test]
    fn test_ctx_id_by_generation() {
        let mut devinfo = DevInfo::default();

        devinfo.gen = 9;
        assert_eq!(report_ctx_id(&devinfo, &report(1 << 16, 42)), Some(42));
        assert_eq!(report_ctx_id(&devinfo, &report(1 << 25, 42)), None);
        assert_eq!(report_ctx_id(&devinfo, &report(1 << 16, INVALID_CTX_ID)), None);

        devinfo.gen = 8;
        assert_eq!(report_ctx_id(&devinfo, &report(1 << 25, 7)), Some(7));
        assert_eq!(report_ctx_id(&devinfo, &report(1 << 16, 7)), None);

        devinfo.gen = 7;
        assert_eq!(report_ctx_id(&devinfo, &report(u32::MAX, 7)), None);
    }

    #[test]
    fn test_reason() {
        let devinfo = DevInfo::default();
        assert_eq!(report_reason(&devinfo, &report(1 << 19, 0)), "timer");
        assert_eq!(report_reason(&devinfo, &report(1 << 22, 0)), "context switch");
        assert_eq!(report_reason(&devinfo, &report(0, 0)), "unknown");
    }

    #[test]
    fn test_read_past_end() {
        assert_eq!(read_u32(&[1, 0, 0, 0], 0), 1);
        assert_eq!(read_u32(&[1, 0, 0, 0], 1), 0);
        assert_eq!(report_timestamp(&report(0, 0)), 1000);
    }
}
