use std::convert::TryInto;
use std::time::{Duration, Instant};

/// Accumulates the time spent on discrete work items.
#[derive(Clone, Copy, Debug, Default)]
pub struct WorkTimer {
    total_time: Duration,
    longest_item: Duration,
    items_completed: u32,
}

impl WorkTimer {
    pub fn start() -> Self {
        Self::default()
    }

    pub fn total_time(&self) -> Duration {
        self.total_time
    }

    pub fn longest_item(&self) -> Duration {
        self.longest_item
    }

    pub fn items_completed(&self) -> u32 {
        self.items_completed
    }

    pub fn complete_item(&mut self, d: Duration) {
        self.total_time += d;
        self.longest_item = self.longest_item.max(d);
        self.items_completed = self.items_completed.saturating_add(1);
    }

    /// Runs `f` and records how long it took.
    pub fn time_item<T>(&mut self, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.complete_item(start.elapsed());
        out
    }

    pub fn average_time_us(&self) -> u32 {
        let total_us: u32 = self.total_time.as_micros().try_into().unwrap_or(u32::MAX);

        total_us / self.items_completed.max(1)
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝
