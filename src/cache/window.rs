//! The materialized time range of the cache, and how it grows and shrinks

use chrono::{DateTime, Duration, Utc};

use crate::config::CacheSettings;
use crate::date_range::DateRange;

/// What range the cache table truly covers, and what range is being fetched to extend it.
///
/// Keeping the two apart lets overlapping requests from several consumers
/// coalesce into a single fetch from the resource store.
#[derive(Clone, Debug)]
pub struct CacheWindow {
    current: Option<DateRange>,
    requested: Option<DateRange>,
    settings: CacheSettings,
}

impl CacheWindow {
    pub fn new(settings: CacheSettings) -> Self {
        Self { current: None, requested: None, settings }
    }

    /// A window that already covers `current`, e.g. restored from the meta row
    pub fn with_current(settings: CacheSettings, current: Option<DateRange>) -> Self {
        Self { current: current.filter(|c| !c.is_empty()), requested: None, settings }
    }

    pub fn current_window(&self) -> Option<DateRange> {
        self.current
    }

    pub fn requested_window(&self) -> Option<DateRange> {
        self.requested
    }

    /// `[now - look_back, now + look_forward)`
    pub fn default_range(&self, now: DateTime<Utc>) -> DateRange {
        DateRange::around(now, self.settings.look_back, self.settings.look_forward)
    }

    /// Forget everything: nothing is covered, nothing is being fetched
    pub fn reset(&mut self) {
        self.current = None;
        self.requested = None;
    }

    pub fn is_within_window(&self, range: &DateRange) -> bool {
        match &self.current {
            None => false,
            Some(current) => current.covers(range),
        }
    }

    /// Merge `range` into the requested window.
    ///
    /// The sides of `range` that stick out of the current window are padded, so that
    /// a user scrolling a little further does not trigger a fetch each time.
    /// The result is kept within `max_size`, trimming padding on the side farther from `now`.
    pub fn add_to_requested_range(&mut self, range: &DateRange, now: DateTime<Utc>) {
        if range.is_empty() {
            return;
        }
        let range = &self.clip_request(range, now);

        let mut padded = *range;
        let (pad_back, pad_forward) = match &self.current {
            None => (true, true),
            Some(current) => (range.start < current.start, range.end > current.end),
        };
        if pad_back {
            padded.start = padded.start - self.settings.min_padding_back;
        }
        if pad_forward {
            padded.end = padded.end + self.settings.min_padding_forward;
        }
        let padded = self.clip_padding(range, padded, now);

        let merged = match &self.requested {
            None => padded,
            Some(requested) => {
                let hull = requested.hull(&padded);
                if hull.duration() > self.settings.max_size {
                    log::debug!("Dropping requested range {} in favour of {}", requested, padded);
                    padded
                } else {
                    hull
                }
            },
        };
        log::debug!("Requested window is now {}", merged);
        self.requested = Some(merged);
    }

    /// Merge `range` into the requested window as is, without padding
    pub fn add_unpadded_request(&mut self, range: &DateRange) {
        if range.is_empty() {
            return;
        }
        self.requested = Some(match &self.requested {
            Some(requested) if requested.hull(range).duration() <= self.settings.max_size => requested.hull(range),
            _ => *range,
        });
    }

    /// The part of `range` the window can hold: ranges longer than `max_size`
    /// lose their side farther from `now`
    pub fn clip_request(&self, range: &DateRange, now: DateTime<Utc>) -> DateRange {
        let max_size = self.settings.max_size;
        if range.duration() <= max_size {
            return *range;
        }
        let start_is_farther = (now - range.start).num_milliseconds().abs() > (range.end - now).num_milliseconds().abs();
        let clipped = if start_is_farther {
            DateRange::new(range.end - max_size, range.end)
        } else {
            DateRange::new(range.start, range.start + max_size)
        };
        log::debug!("{} does not fit in the window, keeping {}", range, clipped);
        clipped
    }

    fn clip_padding(&self, range: &DateRange, mut padded: DateRange, now: DateTime<Utc>) -> DateRange {
        let max_size = self.settings.max_size;
        if padded.duration() <= max_size {
            return padded;
        }
        let mut excess = padded.duration() - max_size;

        let start_is_farther = (now - padded.start).num_milliseconds().abs() > (padded.end - now).num_milliseconds().abs();
        for trim_start in [start_is_farther, !start_is_farther].iter() {
            if excess <= Duration::zero() {
                break;
            }
            if *trim_start {
                let cut = excess.min(range.start - padded.start);
                padded.start = padded.start + cut;
                excess = excess - cut;
            } else {
                let cut = excess.min(padded.end - range.end);
                padded.end = padded.end - cut;
                excess = excess - cut;
            }
        }
        padded
    }

    /// Record that the table now holds every occurrence in `range`.
    ///
    /// Returns the ranges that dropped out of the window: the whole previous window
    /// when `range` is disjoint from it, and whatever was evicted to honour `max_size`.
    pub fn expand_window(&mut self, range: &DateRange, now: DateTime<Utc>) -> Vec<DateRange> {
        let mut evicted = Vec::new();
        if range.is_empty() {
            return evicted;
        }

        let (expanded, forward) = match self.current {
            None => (*range, range.end > now),
            Some(current) if current.touches(range) => (current.hull(range), range.end > current.end),
            Some(current) => {
                log::info!("Window {} is disjoint from {}, replacing it", current, range);
                evicted.push(current);
                (*range, range.start > current.start)
            },
        };
        self.current = Some(expanded);

        self.requested = match self.requested {
            None => None,
            Some(requested) => requested.subtract(range),
        };

        if expanded.duration() > self.settings.max_size {
            evicted.extend(self.trim_to_max_size(expanded, range, forward, now));
        }

        if let Some(current) = &self.current {
            log::debug!("Window is now {}", current);
        }
        evicted
    }

    /// Bring an oversized window back to `max_size`.
    ///
    /// The side opposite the expansion goes first. What was just `fetched` is never evicted,
    /// and the range around `now` only when keeping both does not fit.
    fn trim_to_max_size(&mut self, expanded: DateRange, fetched: &DateRange, forward: bool, now: DateTime<Utc>) -> Vec<DateRange> {
        let max_size = self.settings.max_size;
        let around_now = self.default_range(now).intersection(&expanded);
        let zones = [around_now.map(|z| z.hull(fetched)), Some(*fetched), None];
        let mut kept = expanded;

        for zone in zones.iter() {
            for trim_start in [forward, !forward].iter() {
                let excess = kept.duration() - max_size;
                if excess <= Duration::zero() {
                    break;
                }
                if *trim_start {
                    let limit = zone.map_or(kept.end, |z| z.start);
                    let cut = excess.min(limit - kept.start).max(Duration::zero());
                    kept.start = kept.start + cut;
                } else {
                    let limit = zone.map_or(kept.start, |z| z.end);
                    let cut = excess.min(kept.end - limit).max(Duration::zero());
                    kept.end = kept.end - cut;
                }
            }
        }
        self.shrink_to(expanded, kept)
    }

    /// Shrink the window by removing `range` from one of its ends.
    ///
    /// Unless `override_minimum` is set, the part of the window within
    /// `[now - look_back, now + look_forward)` is kept regardless.
    /// A range strictly inside the window would split it, and is ignored.
    /// Returns the ranges that are no longer covered.
    pub fn reduce_window(&mut self, range: &DateRange, now: DateTime<Utc>, override_minimum: bool) -> Vec<DateRange> {
        let current = match self.current {
            None => return Vec::new(),
            Some(c) => c,
        };
        let cut = match current.intersection(range) {
            None => return Vec::new(),
            Some(cut) => cut,
        };
        if cut.start > current.start && cut.end < current.end {
            log::warn!("Not removing {} from the middle of window {}", cut, current);
            return Vec::new();
        }

        let mut kept = if cut.start <= current.start {
            DateRange::new(cut.end, current.end)
        } else {
            DateRange::new(current.start, cut.start)
        };
        if !override_minimum {
            if let Some(minimum) = self.default_range(now).intersection(&current) {
                kept = if kept.is_empty() { minimum } else { kept.hull(&minimum) };
            }
        }

        self.shrink_to(current, kept)
    }

    fn shrink_to(&mut self, current: DateRange, kept: DateRange) -> Vec<DateRange> {
        let mut evicted = Vec::new();
        if kept.is_empty() {
            evicted.push(current);
            self.current = None;
        } else {
            if kept.start > current.start {
                evicted.push(DateRange::new(current.start, kept.start));
            }
            if kept.end < current.end {
                evicted.push(DateRange::new(kept.end, current.end));
            }
            self.current = Some(kept);
        }

        for e in &evicted {
            log::debug!("Evicted {} from the window", e);
        }
        evicted
    }

    /// When a covered request gets close to an edge of the window,
    /// the range that would push that edge one increment further
    pub fn proactive_extension(&self, range: &DateRange) -> Option<DateRange> {
        let current = self.current?;
        if current.duration() + self.settings.increment > self.settings.max_size {
            return None;
        }
        if range.start - current.start < self.settings.min_padding_back {
            Some(DateRange::new(current.start - self.settings.increment, current.start))
        } else if current.end - range.end < self.settings.min_padding_forward {
            Some(DateRange::new(current.end, current.end + self.settings.increment))
        } else {
            None
        }
    }

    /// Whether a fetch for `range` is already planned
    pub fn is_requested(&self, range: &DateRange) -> bool {
        match &self.requested {
            None => false,
            Some(requested) => requested.covers(range),
        }
    }
}
