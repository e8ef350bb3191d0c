//! Download progress estimation: throughput, total size and ETA
//!
//! A [`DownloadTracker`] is created once per attempt. Fragmented downloads know how
//! many fragments to expect but not their sizes, so the total is extrapolated from
//! the fragments seen so far.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Trailing window for speed samples
pub const SPEED_WINDOW: Duration = Duration::from_secs(60);

/// Current transfer rate estimate
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Speed {
    /// No samples in the window
    Idle,
    /// Only one sample: the rate is at most this many bytes per second
    AtMost(f64),
    /// Bytes per second over the retained window
    Measured(f64),
}

impl Speed {
    /// Bytes per second; the upper bound for [`Speed::AtMost`]
    pub fn bytes_per_sec(&self) -> f64 {
        match *self {
            Speed::Idle => 0.0,
            Speed::AtMost(v) | Speed::Measured(v) => v,
        }
    }
}

impl std::fmt::Display for Speed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Speed::Idle => f.write_str("0 B/s"),
            Speed::AtMost(v) => write!(f, "<{}/s", human_readable_size(v)),
            Speed::Measured(v) => write!(f, "{}/s", human_readable_size(v)),
        }
    }
}

/// Sliding-window throughput estimate
#[derive(Debug)]
pub struct SpeedTracker {
    samples: VecDeque<(Instant, u64)>,
    window: Duration,
}

impl Default for SpeedTracker {
    fn default() -> Self {
        Self::new(SPEED_WINDOW)
    }
}

impl SpeedTracker {
    /// Tracker retaining samples for `window`
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    /// Record `bytes` received now
    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    /// Record `bytes` received at `at`
    pub fn record_at(&mut self, at: Instant, bytes: u64) {
        self.samples.push_back((at, bytes));
        self.evict(at);
    }

    /// Speed as of now
    pub fn speed(&mut self) -> Speed {
        self.speed_at(Instant::now())
    }

    /// Speed as of `now`
    ///
    /// The oldest retained sample only marks the start of the measured span; its
    /// bytes may have arrived before the window opened, so they are not counted.
    pub fn speed_at(&mut self, now: Instant) -> Speed {
        self.evict(now);
        match self.samples.len() {
            0 => Speed::Idle,
            1 => Speed::AtMost(self.samples[0].1 as f64 / self.window.as_secs_f64()),
            _ => {
                let (first_at, _) = self.samples[0];
                let (last_at, _) = self.samples[self.samples.len() - 1];
                let span = last_at.saturating_duration_since(first_at).as_secs_f64();
                let bytes: u64 = self.samples.iter().skip(1).map(|(_, b)| b).sum();
                if span <= 0.0 {
                    Speed::AtMost(bytes as f64 / self.window.as_secs_f64())
                } else {
                    Speed::Measured(bytes as f64 / span)
                }
            }
        }
    }

    fn evict(&mut self, now: Instant) {
        let Some(cutoff) = now.checked_sub(self.window) else {
            return;
        };
        while matches!(self.samples.front(), Some((at, _)) if *at < cutoff) {
            self.samples.pop_front();
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenFragment {
    /// Declared length (e.g. Content-Length), if the server sent one
    expected: Option<u64>,
    downloaded: u64,
}

/// Fragment-based total size estimate
#[derive(Debug)]
pub struct SizeTracker {
    fragment_count: usize,
    completed: Vec<u64>,
    open: Option<OpenFragment>,
}

impl SizeTracker {
    /// Tracker expecting `fragment_count` fragments
    pub fn new(fragment_count: usize) -> Self {
        Self {
            fragment_count,
            completed: Vec::new(),
            open: None,
        }
    }

    /// Open the next fragment; an unfinished one is closed at its current byte count
    pub fn begin_fragment(&mut self, expected: Option<u64>) {
        self.complete_fragment();
        self.open = Some(OpenFragment {
            expected,
            downloaded: 0,
        });
    }

    /// Add bytes to the open fragment
    pub fn record(&mut self, bytes: u64) {
        if let Some(open) = self.open.as_mut() {
            open.downloaded += bytes;
        }
    }

    /// Close the open fragment, recording the bytes actually received
    pub fn complete_fragment(&mut self) {
        if let Some(open) = self.open.take() {
            self.completed.push(open.downloaded);
        }
    }

    /// Expected number of fragments
    pub fn fragment_count(&self) -> usize {
        self.fragment_count
    }

    /// Extrapolated total size; `None` until at least one fragment size is known
    ///
    /// The open fragment contributes only when its declared length is known.
    pub fn total_size(&self) -> Option<f64> {
        let mut known: u64 = self.completed.iter().sum();
        let mut samples = self.completed.len();
        if let Some(OpenFragment {
            expected: Some(expected),
            ..
        }) = self.open
        {
            known += expected;
            samples += 1;
        }
        if samples == 0 {
            return None;
        }
        Some(self.fragment_count as f64 * known as f64 / samples as f64)
    }

    /// Completed fragments plus the bytes received on the open one
    pub fn total_downloaded(&self) -> u64 {
        let completed: u64 = self.completed.iter().sum();
        completed + self.open.map(|o| o.downloaded).unwrap_or(0)
    }

    /// `total_size - total_downloaded`
    pub fn remaining(&self) -> Option<f64> {
        self.total_size()
            .map(|total| (total - self.total_downloaded() as f64).max(0.0))
    }

    /// Whether the total is still provisional
    pub fn is_expected_size(&self) -> bool {
        let seen = self.completed.len() + usize::from(self.open.is_some());
        self.fragment_count > seen || self.open.is_some_and(|o| o.expected.is_none())
    }
}

impl std::fmt::Display for SizeTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let downloaded = self.total_downloaded();
        match self.total_size() {
            None => write!(f, "{} / unknown", human_readable_size(downloaded as f64)),
            Some(total) => {
                let percent = if total > 0.0 {
                    downloaded as f64 / total * 100.0
                } else {
                    100.0
                };
                write!(
                    f,
                    "{} / {} ({:.2}%)",
                    human_readable_size(downloaded as f64),
                    human_readable_size(total),
                    percent
                )?;
                if self.is_expected_size() {
                    f.write_str(" (expected)")?;
                }
                Ok(())
            }
        }
    }
}

/// Speed + size tracking for one attempt
#[derive(Debug)]
pub struct DownloadTracker {
    speed: SpeedTracker,
    size: SizeTracker,
}

impl DownloadTracker {
    /// Tracker for a download made of `fragment_count` fragments
    pub fn new(fragment_count: usize) -> Self {
        Self {
            speed: SpeedTracker::default(),
            size: SizeTracker::new(fragment_count),
        }
    }

    /// See [`SizeTracker::begin_fragment`]
    pub fn begin_fragment(&mut self, expected: Option<u64>) {
        self.size.begin_fragment(expected);
    }

    /// See [`SizeTracker::complete_fragment`]
    pub fn complete_fragment(&mut self) {
        self.size.complete_fragment();
    }

    /// Record received bytes for both speed and size
    pub fn record(&mut self, bytes: u64) {
        self.speed.record(bytes);
        self.size.record(bytes);
    }

    /// Current speed
    pub fn speed(&mut self) -> Speed {
        self.speed.speed()
    }

    /// Size estimate
    pub fn size(&self) -> &SizeTracker {
        &self.size
    }

    /// Estimated time left; `None` while the total is unknown or nothing is flowing
    pub fn eta(&mut self) -> Eta {
        let Some(remaining) = self.size.remaining() else {
            return Eta::Unknown;
        };
        let speed = self.speed.speed().bytes_per_sec();
        if speed <= 0.0 {
            return Eta::Infinite;
        }
        Eta::Remaining(Duration::from_secs_f64(remaining / speed))
    }

    /// `Speed: <speed> Downloaded: <size> ETA: <eta>`
    pub fn human_readable_status(&mut self) -> String {
        let speed = self.speed();
        let eta = self.eta();
        format!("Speed: {} Downloaded: {} ETA: {}", speed, self.size, eta)
    }
}

/// Estimated time to completion
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Eta {
    /// Total size not yet known
    Unknown,
    /// Speed is zero
    Infinite,
    /// Time left
    Remaining(Duration),
}

impl std::fmt::Display for Eta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Eta::Unknown => f.write_str("unknown"),
            Eta::Infinite => f.write_str("infinite"),
            Eta::Remaining(d) => f.write_str(&human_readable_duration(*d)),
        }
    }
}

/// Tracker shared between the fetch loop and status readers
#[derive(Clone, Debug)]
pub struct SharedTracker(Arc<Mutex<DownloadTracker>>);

impl SharedTracker {
    /// Shared tracker for `fragment_count` fragments
    pub fn new(fragment_count: usize) -> Self {
        Self(Arc::new(Mutex::new(DownloadTracker::new(fragment_count))))
    }

    /// Lock the tracker; a poisoned lock still yields the data
    pub fn lock(&self) -> MutexGuard<'_, DownloadTracker> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// See [`DownloadTracker::human_readable_status`]
    pub fn human_readable_status(&self) -> String {
        self.lock().human_readable_status()
    }
}

/// Format a byte count with binary magnitude suffixes and two decimals
pub fn human_readable_size(bytes: f64) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    if bytes < KB {
        format!("{:.2} B", bytes)
    } else if bytes < MB {
        format!("{:.2} KB", bytes / KB)
    } else if bytes < GB {
        format!("{:.2} MB", bytes / MB)
    } else {
        format!("{:.2} GB", bytes / GB)
    }
}

/// Format a duration as `HH:MM:SS` (hours are not wrapped into days)
pub fn human_readable_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
