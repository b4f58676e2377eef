//! Processes that submitted GPU work, keyed by pid.

use std::collections::HashMap;

use crate::transport::{Request, RequestSink};

pub const UNKNOWN_COMM: &str = "<unknown>";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: u32,
    pub cmd: String,
    pub cmd_line: String,
}

impl Process {
    pub fn new(pid: u32) -> Self {
        Process {
            pid,
            cmd: UNKNOWN_COMM.to_string(),
            cmd_line: UNKNOWN_COMM.to_string(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.cmd != UNKNOWN_COMM
    }
}

/// Processes seen by the session, keyed by pid.
///
/// Unknown pids get a placeholder entry straight away and the identity is
/// requested from the server; the answer fills the placeholder in later.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    processes: HashMap<u32, Process>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look `pid` up, creating a placeholder and asking `sink` about it on
    /// first sight. Pid 0 is the idle task and never has a process.
    pub fn get_or_request(&mut self, pid: u32, sink: &mut dyn RequestSink) -> Option<&Process> {
        if pid == 0 {
            return None;
        }

        let process = self.processes.entry(pid).or_insert_with(|| {
            tracing::debug!(pid, "requesting process info");
            sink.send(Request::GetProcessInfo { pid });
            Process::new(pid)
        });
        Some(process)
    }

    pub fn get(&self, pid: u32) -> Option<&Process> {
        self.processes.get(&pid)
    }

    /// Apply a process-info answer. Returns false if the pid was never
    /// requested.
    pub fn update(&mut self, pid: u32, comm: &str, cmd_line: &str) -> bool {
        let Some(process) = self.processes.get_mut(&pid) else {
            tracing::debug!(pid, "process info for unknown pid");
            return false;
        };
        process.cmd = comm.to_string();
        process.cmd_line = cmd_line.to_string();
        true
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn clear(&mut self) {
        self.processes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::RecordingSink;

    #[test]
    fn test_placeholder_and_single_request() {
        let mut sink = RecordingSink::default();
        let mut registry = ProcessRegistry::new();

        let process = registry.get_or_request(42, &mut sink).unwrap();
        assert_eq!(process.cmd, UNKNOWN_COMM);
        assert!(!process.is_resolved());
        registry.get_or_request(42, &mut sink);

        assert_eq!(sink.requests, vec![Request::GetProcessInfo { pid: 42 }]);
    }

    #[test]
    fn test_pid_zero_has_no_process() {
        let mut sink = RecordingSink::default();
        let mut registry = ProcessRegistry::new();
        assert!(registry.get_or_request(0, &mut sink).is_none());
        assert!(sink.requests.is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_update() {
        let mut sink = RecordingSink::default();
        let mut registry = ProcessRegistry::new();
        registry.get_or_request(7, &mut sink);

        assert!(registry.update(7, "glxgears", "glxgears -fullscreen"));
        let process = registry.get(7).unwrap();
        assert_eq!(process.cmd, "glxgears");
        assert_eq!(process.cmd_line, "glxgears -fullscreen");
        assert!(!registry.update(8, "other", "other"));
    }
}
