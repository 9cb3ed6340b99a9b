use crate::common::*;

/// Accumulates wall-clock durations between `tic` and `toc` calls.
#[derive(Debug, Clone, Default)]
pub struct Timer {
    total: Duration,
    calls: usize,
    start: Option<Instant>,
    diff: Duration,
}

impl Timer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tic(&mut self) {
        self.start = Some(Instant::now());
    }

    /// Stops the running measurement and returns its duration.
    ///
    /// Calling it without a preceding `tic` records nothing.
    pub fn toc(&mut self) -> Duration {
        if let Some(start) = self.start.take() {
            self.diff = start.elapsed();
            self.total += self.diff;
            self.calls += 1;
        }
        self.diff
    }

    /// The mean duration over all measurements.
    pub fn average_time(&self) -> Duration {
        if self.calls == 0 {
            Duration::ZERO
        } else {
            self.total / self.calls as u32
        }
    }
}
