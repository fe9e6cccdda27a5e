//! Some utility functions

use crate::alarm::{AlarmRow, AlarmState};
use crate::cache::CacheRow;
use crate::meta::MetaState;

/// A debug utility that pretty-prints a meta row
pub fn print_meta(name: &str, state: Option<&MetaState>) {
    match state {
        None => println!("{}: no meta row", name),
        Some(state) => {
            let closed = if state.is_clean() { "clean" } else { "DIRTY" };
            match state.window() {
                Some(window) => println!("{}: {}, {} rows, window {}", name, closed, state.count, window),
                None => println!("{}: {}, {} rows", name, closed, state.count),
            }
        },
    }
}

/// A debug utility that pretty-prints cached occurrences
pub fn print_cache_rows(rows: &[CacheRow]) {
    for row in rows {
        let start = row.start().map_or_else(|| "-".to_string(), |s| s.to_rfc3339());
        let end = row.end().map_or_else(|| "-".to_string(), |e| e.to_rfc3339());
        let floating = if row.start_is_floating() || row.end_is_floating() { "~" } else { " " };
        let alarm = if row.has_alarm() { "⏰" } else { " " };
        println!("    {}{} {} → {}\t{}\t{} ({})",
            floating, alarm, start, end, row.summary(), row.resource_id(), row.recurrence_id());
    }
}

/// A debug utility that pretty-prints an alarm queue
pub fn print_alarm_queue(alarms: &[AlarmRow]) {
    for alarm in alarms {
        let state = match alarm.state() {
            AlarmState::Pending => " ",
            AlarmState::Snoozed => "z",
            AlarmState::Dismissed => "✓",
        };
        println!("    {} {}\t{}\t{} ({})",
            state, alarm.time_to_fire().to_rfc3339(), alarm.summary(), alarm.resource_id(), alarm.recurrence_id());
    }
}
