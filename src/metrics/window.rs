use std::collections::VecDeque;

use parking_lot::Mutex;

/// Default number of samples kept per key.
pub const DEFAULT_WINDOW_SIZE: usize = 1000;

/// Fixed-capacity FIFO buffer of the most recent samples for one key.
///
/// Each window carries its own lock, so writers on unrelated keys never
/// contend. Readers take a `snapshot()` instead of iterating in place.
#[derive(Debug)]
pub struct RollingWindow<T> {
    capacity: usize,
    samples: Mutex<VecDeque<T>>,
}

impl<T: Clone> RollingWindow<T> {
    /// A capacity of zero is bumped to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            samples: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Append a sample, evicting the oldest one once the window is full.
    pub fn push(&self, sample: T) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back(sample);
    }

    /// Independent copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<T> {
        self.samples.lock().iter().cloned().collect()
    }

    /// Drop every sample; the allocation is kept for reuse.
    pub fn clear(&self) {
        self.samples.lock().clear();
    }
}

#[cfg(test)]
impl<T> RollingWindow<T> {
    fn len(&self) -> usize {
        self.samples.lock().len()
    }

    fn is_empty(&self) -> bool {
        self.samples.lock().is_empty()
    }

    fn capacity(&self) -> usize {
        self.capacity
    }
}
