//! Accumulated windows, the pool they are allocated from and the tracks
//! that keep closed windows for the visible time range.

use std::collections::VecDeque;

use crate::accumulator::OaAccumulator;
use crate::chunk::{ChunkArena, ChunkId};

/// Location of a sample record: the chunk holding it and its byte offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportRef {
    pub chunk: ChunkId,
    pub offset: usize,
}

/// Counter deltas over a span of consecutive reports.
#[derive(Debug, Clone)]
pub struct AccumulatedWindow {
    pub accumulator: OaAccumulator,
    /// Hardware context of timeline windows, `None` on graph tracks.
    pub context: Option<u32>,
    pub start_report: ReportRef,
    pub end_report: Option<ReportRef>,
    pub timestamp_start: u64,
    pub timestamp_end: u64,
}

impl AccumulatedWindow {
    pub fn is_closed(&self) -> bool {
        self.end_report.is_some()
    }

    pub fn duration(&self) -> u64 {
        self.timestamp_end.saturating_sub(self.timestamp_start)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowId(u32);

/// Slab of windows with index recycling.
#[derive(Default)]
pub struct WindowPool {
    slots: Vec<Option<AccumulatedWindow>>,
    free: Vec<u32>,
}

impl WindowPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, window: AccumulatedWindow) -> WindowId {
        match self.free.pop() {
            Some(index) => {
                self.slots[index as usize] = Some(window);
                WindowId(index)
            }
            None => {
                self.slots.push(Some(window));
                WindowId((self.slots.len() - 1) as u32)
            }
        }
    }

    pub fn get(&self, id: WindowId) -> Option<&AccumulatedWindow> {
        self.slots.get(id.0 as usize).and_then(Option::as_ref)
    }

    pub fn get_mut(&mut self, id: WindowId) -> Option<&mut AccumulatedWindow> {
        self.slots.get_mut(id.0 as usize).and_then(Option::as_mut)
    }

    /// Return a window to the pool, dropping its chunk references.
    ///
    /// The caller owns the context reference and gets it back.
    pub fn release(&mut self, id: WindowId, arena: &mut ChunkArena) -> Option<u32> {
        let window = self.slots.get_mut(id.0 as usize)?.take()?;
        self.free.push(id.0);

        arena.release(window.start_report.chunk);
        if let Some(end) = window.end_report {
            arena.release(end.chunk);
        }
        window.context
    }

    /// Number of windows currently allocated.
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Closed windows in close order with their summed duration.
#[derive(Debug, Default)]
pub struct Track {
    windows: VecDeque<WindowId>,
    total_duration: u64,
}

impl Track {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pop the oldest windows until one lasting `incoming` fits in `visible`.
    ///
    /// Popped windows are returned for the caller to release. A window
    /// longer than `visible` empties the track and is then kept on its own.
    pub fn evict_for(&mut self, incoming: u64, visible: u64, pool: &WindowPool) -> Vec<WindowId> {
        let mut evicted = Vec::new();
        while self.total_duration + incoming > visible {
            let Some(id) = self.windows.pop_front() else {
                break;
            };
            let duration = pool.get(id).map_or(0, AccumulatedWindow::duration);
            self.total_duration -= duration;
            evicted.push(id);
        }
        evicted
    }

    pub fn push(&mut self, id: WindowId, pool: &WindowPool) {
        self.total_duration += pool.get(id).map_or(0, AccumulatedWindow::duration);
        self.windows.push_back(id);
    }

    pub fn drain(&mut self) -> Vec<WindowId> {
        self.total_duration = 0;
        self.windows.drain(..).collect()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = WindowId> + '_ {
        self.windows.iter().copied()
    }

    pub fn last(&self) -> Option<WindowId> {
        self.windows.back().copied()
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    pub fn total_duration(&self) -> u64 {
        self.total_duration
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::metrics::{DevInfo, MetricSet, OaFormat};

    fn window(arena: &mut ChunkArena, start: u64, end: u64) -> AccumulatedWindow {
        let metric_set = Arc::new(MetricSet {
            name: "Test".to_string(),
            symbol_name: "Test".to_string(),
            hw_config_guid: "guid".to_string(),
            format: OaFormat::A32u40A4u32B8C8,
            counters: Vec::new(),
        });
        let chunk = arena.retain(&[0u8; 8]);
        let end_chunk = arena.clone_ref(chunk);
        AccumulatedWindow {
            accumulator: OaAccumulator::new(&DevInfo::default(), metric_set),
            context: Some(3),
            start_report: ReportRef { chunk, offset: 0 },
            end_report: Some(ReportRef {
                chunk: end_chunk,
                offset: 0,
            }),
            timestamp_start: start,
            timestamp_end: end,
        }
    }

    #[test]
    fn test_pool_recycles_slots_and_releases_chunks() {
        let mut arena = ChunkArena::new();
        let mut pool = WindowPool::new();

        let a = pool.alloc(window(&mut arena, 0, 10));
        assert_eq!(pool.len(), 1);
        assert_eq!(arena.live_chunks(), 1);

        assert_eq!(pool.release(a, &mut arena), Some(3));
        assert!(pool.is_empty());
        assert_eq!(arena.live_chunks(), 0);
        assert!(pool.get(a).is_none());
        assert_eq!(pool.release(a, &mut arena), None);

        let b = pool.alloc(window(&mut arena, 0, 10));
        assert_eq!(a, b);
    }

    #[test]
    fn test_eviction_keeps_total_within_visible() {
        let mut arena = ChunkArena::new();
        let mut pool = WindowPool::new();
        let mut track = Track::new();
        let visible = 100;

        for i in 0..20u64 {
            let id = pool.alloc(window(&mut arena, i * 30, i * 30 + 30));
            for evicted in track.evict_for(30, visible, &pool) {
                pool.release(evicted, &mut arena);
            }
            track.push(id, &pool);
            assert!(track.total_duration() <= visible);
        }

        // 3 windows of 30ns fit into 100ns, a fourth would not.
        assert_eq!(track.len(), 3);
        assert_eq!(track.total_duration(), 90);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_eviction_is_minimal_and_oversized_window_kept() {
        let mut arena = ChunkArena::new();
        let mut pool = WindowPool::new();
        let mut track = Track::new();

        for (start, end) in [(0, 10), (10, 20), (20, 30)] {
            let id = pool.alloc(window(&mut arena, start, end));
            track.push(id, &pool);
        }

        let big = pool.alloc(window(&mut arena, 30, 45));
        let evicted = track.evict_for(15, 40, &pool);
        assert_eq!(evicted.len(), 1);
        track.push(big, &pool);
        assert_eq!(track.total_duration(), 35);

        let huge = pool.alloc(window(&mut arena, 45, 1045));
        assert_eq!(track.evict_for(1000, 40, &pool).len(), 3);
        track.push(huge, &pool);
        assert_eq!(track.len(), 1);
        assert_eq!(track.total_duration(), 1000);
    }
}
