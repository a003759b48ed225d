//! Operator activity recovered from `Init` heap blocks.
//!
//! IOS keeps its command history and its message log in heap blocks
//! allocated under the name `Init`. Both survive as ASCII strings: history
//! records look like `CMD: 'show version' 10:23:33 UTC Mon Mar 1 2021`,
//! logged events like `*Mar  1 00:01:07.607: %SYS-5-CONFIG_I: ...`.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime};
use regex::bytes::Regex as BytesRegex;
use regex::Regex;

use relic_common::ascii_runs;

use crate::block::MemoryBlocks;

/// Minimum ASCII-run length considered a recovered string.
const MIN_STRING_LENGTH: usize = 5;

/// A recovered command-history record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryEntry {
    /// When the command was entered.
    pub time: NaiveDateTime,
    /// The command line.
    pub command: String,
}

/// A recovered logged event.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventEntry {
    /// When the event was logged (year assumed current).
    pub time: NaiveDateTime,
    /// Millisecond part of the timestamp, as logged.
    pub millis: String,
    /// The event message.
    pub message: String,
}

/// Collects the ASCII strings of all `Init` blocks containing `needle`.
pub fn init_block_strings(heap: &MemoryBlocks<'_>, needle: &[u8]) -> Vec<Vec<u8>> {
    let mut found = Vec::new();
    for block in heap.blocks_named("Init") {
        for run in ascii_runs(heap.block_data(block), MIN_STRING_LENGTH) {
            if relic_common::find(run.bytes, needle, 0).is_some() {
                found.push(run.bytes.to_vec());
            }
        }
    }
    found
}

fn month_number(name: &str) -> Option<u32> {
    Some(match name {
        "Jan" => 1,
        "Feb" => 2,
        "Mar" => 3,
        "Apr" => 4,
        "May" => 5,
        "Jun" => 6,
        "Jul" => 7,
        "Aug" => 8,
        "Sep" => 9,
        "Oct" => 10,
        "Nov" => 11,
        "Dec" => 12,
        _ => return None,
    })
}

/// Recovers the command history, oldest first.
pub fn command_history(heap: &MemoryBlocks<'_>) -> Vec<HistoryEntry> {
    let record = BytesRegex::new(r"'(.+)' (.+)").expect("static regex");
    // 10:23:33 UTC Mon Mar  1 2021
    let timestamp = Regex::new(
        r"(\d{2}):(\d{2}):(\d{2})\s([A-Z]+)\s([A-Za-z]+)\s([A-Za-z]{3})\s([\s\d]+)\s(\d{4})",
    )
    .expect("static regex");

    let mut history = Vec::new();
    for line in init_block_strings(heap, b"CMD: ") {
        let captures = match record.captures(&line) {
            Some(captures) => captures,
            None => continue,
        };
        let command = String::from_utf8_lossy(&captures[1]).into_owned();
        let stamp = String::from_utf8_lossy(&captures[2]).into_owned();
        let time = match timestamp.captures(&stamp) {
            Some(fields) => {
                let parse = |index: usize| fields[index].trim().parse::<u32>().ok();
                let date = (|| {
                    NaiveDate::from_ymd_opt(
                        fields[8].parse().ok()?,
                        month_number(&fields[6])?,
                        parse(7)?,
                    )?
                    .and_hms_opt(parse(1)?, parse(2)?, parse(3)?)
                })();
                match date {
                    Some(time) => time,
                    None => continue,
                }
            }
            None => continue,
        };
        history.push(HistoryEntry { time, command });
    }
    history.sort_by(|a, b| a.time.cmp(&b.time));
    history
}

/// Recovers the logged events, oldest first.
///
/// Event timestamps carry no year; the current year is assumed.
pub fn logged_events(heap: &MemoryBlocks<'_>) -> Vec<EventEntry> {
    // *Mar  1 00:01:07.607
    let timestamp = Regex::new(r"([A-Za-z]{3})\s([\s\d]{2})\s(\d{2}):(\d{2}):(\d{2})\.(\d{3})")
        .expect("static regex");
    let year = Local::now().year();

    let mut events = Vec::new();
    for line in init_block_strings(heap, b": %") {
        let text = String::from_utf8_lossy(&line).into_owned();
        let window = match text.get(1..20) {
            Some(window) => window,
            None => continue,
        };
        let fields = match timestamp.captures(window) {
            Some(fields) => fields,
            None => continue,
        };
        let time = (|| {
            NaiveDate::from_ymd_opt(
                year,
                month_number(&fields[1])?,
                fields[2].trim().parse().ok()?,
            )?
            .and_hms_opt(
                fields[3].parse().ok()?,
                fields[4].parse().ok()?,
                fields[5].parse().ok()?,
            )
        })();
        let time = match time {
            Some(time) => time,
            None => continue,
        };
        let message = text.get(22..).unwrap_or_default().to_owned();
        events.push(EventEntry {
            time,
            millis: fields[6].to_owned(),
            message,
        });
    }
    events.sort_by(|a, b| a.time.cmp(&b.time));
    events
}
