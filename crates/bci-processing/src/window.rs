//! Fixed-capacity ring buffer of filtered samples

use bci_core::CHANNELS;

/// Channel values indexed by position modulo capacity.
/// The window is complete each time its write cursor wraps.
#[derive(Debug, Clone)]
pub struct SampleWindow {
    slots: Vec<[f64; CHANNELS]>,
    cursor: usize,
    filled: usize,
}

impl SampleWindow {
    /// `capacity` must be positive; configuration validation guarantees it
    pub fn new(capacity: usize) -> Self {
        SampleWindow {
            slots: vec![[0.0; CHANNELS]; capacity.max(1)],
            cursor: 0,
            filled: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    /// Store one sample; returns true when this write completed the window
    pub fn push(&mut self, channels: &[f64; CHANNELS]) -> bool {
        self.slots[self.cursor] = *channels;
        self.cursor = (self.cursor + 1) % self.slots.len();
        self.filled = (self.filled + 1).min(self.slots.len());
        self.cursor == 0
    }

    /// Per-channel series, oldest sample first
    pub fn series(&self) -> [Vec<f64>; CHANNELS] {
        let start = if self.filled < self.slots.len() { 0 } else { self.cursor };
        std::array::from_fn(|ch| {
            (0..self.filled)
                .map(|i| self.slots[(start + i) % self.slots.len()][ch])
                .collect()
        })
    }

    pub fn reset(&mut self) {
        self.cursor = 0;
        self.filled = 0;
    }
}
