use std::collections::VecDeque;
use std::rc::Rc;

pub trait Timestamped {
    fn ts(&self) -> u64;
}

impl<T: Timestamped> Timestamped for Rc<T> {
    fn ts(&self) -> u64 {
        (**self).ts()
    }
}

/// Time-ordered buffer holding at most `max_duration` worth of items.
#[derive(Debug)]
pub struct RingBuffer<T> {
    buffer: VecDeque<T>,
    max_duration: u64,
}

impl<T> Default for RingBuffer<T> {
    fn default() -> Self {
        RingBuffer {
            buffer: VecDeque::new(),
            max_duration: u64::MAX,
        }
    }
}

impl<T: Timestamped> RingBuffer<T> {
    pub fn with_max_duration(max_duration: u64) -> Self {
        RingBuffer {
            buffer: VecDeque::new(),
            max_duration,
        }
    }

    /// Insert `item` in timestamp order and return whatever fell out of the
    /// window, oldest first.
    ///
    /// Items come from several per-CPU streams, so they are not guaranteed
    /// to arrive in order. Equal timestamps keep their arrival order.
    pub fn insert(&mut self, item: T) -> Vec<T> {
        let ts = item.ts();
        let pos = self
            .buffer
            .iter()
            .rposition(|other| other.ts() <= ts)
            .map_or(0, |pos| pos + 1);
        self.buffer.insert(pos, item);
        self.evict()
    }

    fn evict(&mut self) -> Vec<T> {
        let mut evicted = Vec::new();
        while let (Some(first), Some(last)) = (self.buffer.front(), self.buffer.back()) {
            if last.ts() - first.ts() <= self.max_duration {
                break;
            }
            if let Some(item) = self.buffer.pop_front() {
                evicted.push(item);
            }
        }
        evicted
    }

    /// Remove the first item matching `pred`.
    pub fn remove_first(&mut self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let pos = self.buffer.iter().position(pred)?;
        self.buffer.remove(pos)
    }

    pub fn retain(&mut self, pred: impl FnMut(&T) -> bool) {
        self.buffer.retain(pred);
    }

    pub fn set_max_duration(&mut self, max_duration: u64) -> Vec<T> {
        self.max_duration = max_duration;
        self.evict()
    }

    pub fn max_duration(&self) -> u64 {
        self.max_duration
    }

    pub fn front(&self) -> Option<&T> {
        self.buffer.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.buffer.back()
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> {
        self.buffer.iter()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct TestEvent {
        ts: u64,
        cpu: u32,
    }

    impl Timestamped for TestEvent {
        fn ts(&self) -> u64 {
            self.ts
        }
    }

    impl TestEvent {
        fn new(ts: u64, cpu: u32) -> Self {
            Self { ts, cpu }
        }
    }

    #[test]
    fn test_ringbuf() {
        let mut rb = RingBuffer::<TestEvent>::with_max_duration(500);

        let mut evicted = Vec::new();
        for i in 0..20 {
            evicted.extend(rb.insert(TestEvent::new(i * 100, 0)));
        }

        assert_eq!(evicted.len(), 14);
        assert_eq!(evicted[0].ts(), 0);
        let kept: Vec<_> = rb.iter().map(|e| e.ts()).collect();
        assert_eq!(kept, vec![1400, 1500, 1600, 1700, 1800, 1900]);
    }

    #[test]
    fn test_out_of_order_insert() {
        let mut rb = RingBuffer::<TestEvent>::default();
        rb.insert(TestEvent::new(10, 0));
        rb.insert(TestEvent::new(30, 0));
        rb.insert(TestEvent::new(20, 1));
        rb.insert(TestEvent::new(5, 1));
        rb.insert(TestEvent::new(20, 2));

        let order: Vec<_> = rb.iter().map(|e| (e.ts, e.cpu)).collect();
        assert_eq!(order, vec![(5, 1), (10, 0), (20, 1), (20, 2), (30, 0)]);
    }

    #[test]
    fn test_shrinking_window_and_remove() {
        let mut rb = RingBuffer::<Rc<TestEvent>>::default();
        let first = Rc::new(TestEvent::new(0, 0));
        rb.insert(first.clone());
        rb.insert(Rc::new(TestEvent::new(100, 0)));
        rb.insert(Rc::new(TestEvent::new(200, 0)));

        let removed = rb.remove_first(|e| Rc::ptr_eq(e, &first)).unwrap();
        assert!(Rc::ptr_eq(&removed, &first));

        let evicted = rb.set_max_duration(50);
        assert_eq!(evicted.len(), 1);
        assert_eq!(rb.front().unwrap().ts(), 200);
    }
}
