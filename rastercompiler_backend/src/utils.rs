use std::time::Instant;

/// Wall-clock stopwatch for coarse profiling of the compile / acquire / reconstruct stages.
///
/// Every [`TickTimer::tick`] returns the milliseconds elapsed since the previous tick (or since
/// construction) and restarts the stopwatch.
pub struct TickTimer {
    last: Instant,
}

impl Default for TickTimer {
    fn default() -> Self {
        Self::new()
    }
}

impl TickTimer {
    pub fn new() -> Self {
        Self {
            last: Instant::now(),
        }
    }

    pub fn tick(&mut self) -> f64 {
        let now = Instant::now();
        let diff = now.duration_since(self.last).as_secs_f64() * 1e3;
        self.last = now;
        diff
    }

    /// Ticks and logs the elapsed time at debug level.
    pub fn tick_log(&mut self, msg: &str) -> f64 {
        let diff = self.tick();
        log::debug!("{}: {:.3} ms", msg, diff);
        diff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ticks_are_non_negative_and_restart() {
        let mut timer = TickTimer::new();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let first = timer.tick();
        assert!(first >= 5.0);
        let second = timer.tick_log("second");
        assert!(second >= 0.0);
        assert!(second < first);
    }
}
