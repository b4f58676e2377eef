//! Hardware contexts seen in the OA stream.
//!
//! A context lives as long as timeline windows reference it. Each one keeps
//! its own graph track, accumulated only over the reports during which it
//! was running, and the time it spent on the GPU inside the visible range.

use std::collections::HashMap;

use crate::chunk::ChunkArena;
use crate::process::{ProcessRegistry, UNKNOWN_COMM};
use crate::window::{Track, WindowId, WindowPool};

#[derive(Debug)]
pub struct HwContext {
    pub hw_id: u32,
    pub name: String,
    pub process: Option<u32>,
    /// Dense row index in creation order.
    pub timeline_row: u32,
    /// Timeline windows referencing this context.
    pub n_samples: u32,
    /// Summed duration of this context's timeline windows still in history.
    pub time_spent: u64,
    /// Share of the last aggregation period the context was running.
    pub usage: f64,
    pub current: Option<WindowId>,
    pub history: Track,
}

impl HwContext {
    fn new(hw_id: u32, timeline_row: u32) -> Self {
        HwContext {
            hw_id,
            name: format!("{} id={}", UNKNOWN_COMM, hw_id),
            process: None,
            timeline_row,
            n_samples: 1,
            time_spent: 0,
            usage: 0.0,
            current: None,
            history: Track::new(),
        }
    }

    fn refresh_name(&mut self, processes: &ProcessRegistry) {
        let cmd = self
            .process
            .and_then(|pid| processes.get(pid))
            .map_or(UNKNOWN_COMM, |process| process.cmd.as_str());
        self.name = format!("{} id={}", cmd, self.hw_id);
    }
}

#[derive(Debug, Default)]
pub struct HwContextRegistry {
    // Creation order, which is also timeline_row order.
    contexts: Vec<HwContext>,
    hw_id_to_pid: HashMap<u32, u32>,
}

impl HwContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a reference on `hw_id`, creating the context on first use.
    ///
    /// Returns whether the context was created; the caller opens its first
    /// graph window in that case.
    pub fn get_or_create(&mut self, hw_id: u32, processes: &ProcessRegistry) -> bool {
        let known_pid = self.hw_id_to_pid.get(&hw_id).copied();

        if let Some(context) = self.get_mut(hw_id) {
            context.n_samples += 1;
            if context.process.is_none() && known_pid.is_some() {
                context.process = known_pid;
                context.refresh_name(processes);
            }
            return false;
        }

        let mut context = HwContext::new(hw_id, self.contexts.len() as u32);
        if known_pid.is_some() {
            context.process = known_pid;
            context.refresh_name(processes);
        }
        tracing::debug!(hw_id, name = %context.name, "new hw context");
        self.contexts.push(context);
        true
    }

    /// Drop a reference on `hw_id`. On the last one the context is removed,
    /// its windows go back to the pool and rows are renumbered.
    ///
    /// Returns whether the context was removed.
    pub fn release(&mut self, hw_id: u32, pool: &mut WindowPool, arena: &mut ChunkArena) -> bool {
        let Some(pos) = self.contexts.iter().position(|c| c.hw_id == hw_id) else {
            return false;
        };

        let context = &mut self.contexts[pos];
        context.n_samples -= 1;
        if context.n_samples > 0 {
            return false;
        }

        let mut context = self.contexts.remove(pos);
        for id in context.history.drain() {
            pool.release(id, arena);
        }
        if let Some(id) = context.current.take() {
            pool.release(id, arena);
        }

        for (row, context) in self.contexts.iter_mut().enumerate() {
            context.timeline_row = row as u32;
        }
        tracing::debug!(hw_id, "hw context removed");
        true
    }

    /// Remember that `hw_id` belongs to `pid` and attach the process to the
    /// context if it exists. Returns true if the context changed.
    pub fn update_process(&mut self, hw_id: u32, pid: u32, processes: &ProcessRegistry) -> bool {
        self.hw_id_to_pid.insert(hw_id, pid);

        let Some(context) = self.get_mut(hw_id) else {
            return false;
        };
        if context.process == Some(pid) {
            return false;
        }
        context.process = Some(pid);
        context.refresh_name(processes);
        true
    }

    /// Recompute the names of contexts owned by `pid` after its identity
    /// changed.
    pub fn refresh_process(&mut self, pid: u32, processes: &ProcessRegistry) {
        for context in self
            .contexts
            .iter_mut()
            .filter(|c| c.process == Some(pid))
        {
            context.refresh_name(processes);
        }
    }

    pub fn get(&self, hw_id: u32) -> Option<&HwContext> {
        self.contexts.iter().find(|c| c.hw_id == hw_id)
    }

    pub fn get_mut(&mut self, hw_id: u32) -> Option<&mut HwContext> {
        self.contexts.iter_mut().find(|c| c.hw_id == hw_id)
    }

    /// Contexts in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &HwContext> {
        self.contexts.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut HwContext> {
        self.contexts.iter_mut()
    }

    pub fn hw_ids(&self) -> Vec<u32> {
        self.contexts.iter().map(|c| c.hw_id).collect()
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    /// Sum of every context's usage.
    pub fn busyness(&self) -> f64 {
        self.contexts.iter().map(|c| c.usage).sum()
    }

    /// Forget every context, returning their windows to the pool.
    pub fn clear(&mut self, pool: &mut WindowPool, arena: &mut ChunkArena) {
        for mut context in self.contexts.drain(..) {
            for id in context.history.drain() {
                pool.release(id, arena);
            }
            if let Some(id) = context.current.take() {
                pool.release(id, arena);
            }
        }
    }

    pub fn clear_process_map(&mut self) {
        self.hw_id_to_pid.clear();
    }
}
