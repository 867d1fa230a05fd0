use std::{
    collections::VecDeque,
    fmt::{self, Display},
    sync::atomic::{AtomicU64, Ordering},
    time::Instant,
};

use size::{Size, Style};

const BANDWIDTH_POLL_COUNT: usize = 3;

/// Byte counters bumped by the connection tasks.
#[derive(Debug, Default)]
pub struct TransferCounters {
    downloaded: AtomicU64,
    uploaded: AtomicU64,
}

impl TransferCounters {
    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }
}

struct BandwidthPoll {
    poll_time: Instant,
    uploaded_bytes: u64,   // total uploaded bytes up to this poll
    downloaded_bytes: u64, // total downloaded bytes up to this poll
}

/// Rates averaged over the last few polls of the transfer counters.
pub struct BandwidthTracker {
    bandwidth_polls: VecDeque<BandwidthPoll>,
}

impl BandwidthTracker {
    pub fn new() -> Self {
        BandwidthTracker {
            bandwidth_polls: VecDeque::new(),
        }
    }

    pub fn update(&mut self, now: Instant, counters: &TransferCounters) {
        self.bandwidth_polls.push_front(BandwidthPoll {
            poll_time: now,
            uploaded_bytes: counters.uploaded(),
            downloaded_bytes: counters.downloaded(),
        });
        if self.bandwidth_polls.len() > BANDWIDTH_POLL_COUNT {
            self.bandwidth_polls.pop_back();
        }
    }

    fn window(&self) -> Option<(&BandwidthPoll, &BandwidthPoll, f64)> {
        let front = self.bandwidth_polls.front()?;
        let back = self.bandwidth_polls.back()?;
        let elapsed_s = front
            .poll_time
            .saturating_duration_since(back.poll_time)
            .as_secs_f64();
        if elapsed_s == 0. {
            return None;
        }
        Some((front, back, elapsed_s))
    }

    pub fn avg_bandwidth_down(&self) -> f64 {
        self.window()
            .map(|(front, back, elapsed_s)| {
                (front.downloaded_bytes - back.downloaded_bytes) as f64 / elapsed_s
            })
            .unwrap_or(0.)
    }

    pub fn avg_bandwidth_up(&self) -> f64 {
        self.window()
            .map(|(front, back, elapsed_s)| {
                (front.uploaded_bytes - back.uploaded_bytes) as f64 / elapsed_s
            })
            .unwrap_or(0.)
    }

    fn totals(&self) -> (u64, u64) {
        self.bandwidth_polls
            .front()
            .map(|p| (p.downloaded_bytes, p.uploaded_bytes))
            .unwrap_or((0, 0))
    }
}

impl Display for BandwidthTracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (tot_down, tot_up) = self.totals();
        write!(
            f,
            "Down: {down_band}/s, Up: {up_band}/s (tot.: {tot_down}, {tot_up})",
            down_band = Size::from_bytes(self.avg_bandwidth_down())
                .format()
                .with_style(Style::Abbreviated),
            up_band = Size::from_bytes(self.avg_bandwidth_up())
                .format()
                .with_style(Style::Abbreviated),
            tot_down = Size::from_bytes(tot_down)
                .format()
                .with_style(Style::Abbreviated),
            tot_up = Size::from_bytes(tot_up)
                .format()
                .with_style(Style::Abbreviated),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use super::*;

    #[test]
    fn averages_over_last_polls() {
        let counters = TransferCounters::default();
        let mut tracker = BandwidthTracker::new();
        let start = Instant::now();
        assert_eq!(tracker.avg_bandwidth_down(), 0.);

        tracker.update(start, &counters);
        assert_eq!(tracker.avg_bandwidth_down(), 0.);

        counters.add_downloaded(1000);
        counters.add_uploaded(500);
        tracker.update(start + Duration::from_secs(1), &counters);
        assert_eq!(tracker.avg_bandwidth_down(), 1000.);
        assert_eq!(tracker.avg_bandwidth_up(), 500.);

        counters.add_downloaded(3000);
        tracker.update(start + Duration::from_secs(2), &counters);
        assert_eq!(tracker.avg_bandwidth_down(), 2000.);

        // the first poll falls out of the window
        tracker.update(start + Duration::from_secs(3), &counters);
        assert_eq!(tracker.avg_bandwidth_down(), 1500.);
        assert_eq!(tracker.avg_bandwidth_up(), 0.);
        assert_eq!(tracker.totals(), (4000, 500));
    }
}
