//! Parsing of kill-feed CSVs and server logs into [`RawRecord`]s.
//!
//! Parsing is a pure function over bytes: no I/O, and a malformed line never
//! fails the file. Bad lines are logged, collected in
//! [`ParseOutput::errors`] and skipped.
//!
//! # Formats
//!
//! The format is chosen from the file name ([`LogFormat::detect`]):
//!
//! - `*.csv`: kill feed, `;`-separated.
//!   ```text
//!   2024.01.01-00.00.00;Alice;A;Bob;B;AK47;150
//!   2024.01.01-00.00.00;Alice;A;Bob;B;AK47;150;PS5;XSX
//!   ```
//!   Seven fields on older servers, nine once platform columns were added.
//! - anything else: the server log (`Deadside.log`), lines framed as
//!   `[timestamp][frame]Category: message`.
//!
//! # Incremental reads
//!
//! [`parse_chunk`] parses a slice that starts at a line boundary. Unless the
//! chunk is marked final, a trailing line without `\n` is left unconsumed so
//! the caller's byte offset never lands in the middle of a line that the game
//! is still writing.

use std::sync::LazyLock;

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use regex::Regex;
use tracing::{debug, warn};

use crate::error::Error;
use crate::record::{
    ConnectionAction, ConnectionEvent, EventTime, KillEvent, Player, RawRecord, RecordEvent,
    SourcePosition, SuicideCause, SuicideEvent, WorldEvent, WorldEventKind,
};

/// Field count of the oldest kill-feed layout.
pub const CSV_MIN_FIELDS: usize = 7;

/// Field count of the kill-feed layout with platform columns.
pub const CSV_PLATFORM_FIELDS: usize = 9;

/// Timestamp layouts tried in order. The first is what the game writes.
const TIMESTAMP_FORMATS: &[&str] = &[
    "%Y.%m.%d-%H.%M.%S",
    "%Y.%m.%d-%H.%M.%S:%3f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
];

static LOG_FRAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[(?P<ts>[^\]]*)\]\[\s*(?P<frame>\d+)\](?P<category>[A-Za-z0-9_]+):\s?(?P<message>.*)$")
        .expect("static regex")
});

static MISSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Mission (?P<name>\S+) switched to (?P<state>\w+)").expect("static regex")
});

static WORLD_EVENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\[?(?P<kind>airdrop|helicrash|trader|convoy)\]?(?P<rest>(?:[\s:].*)?)$")
        .expect("static regex")
});

static SWITCHED_TO: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)switched to (?P<state>\w+)").expect("static regex"));

static REGISTRATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Player \|(?P<id>\S+?) successfully (?P<action>registered|unregistered)")
        .expect("static regex")
});

static JOIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Join succeeded: (?P<name>.+)$").expect("static regex"));

/// File layouts the parser understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    KillFeedCsv,
    ServerLog,
}

impl LogFormat {
    pub fn detect(file_name: &str) -> Self {
        if file_name.to_ascii_lowercase().ends_with(".csv") {
            Self::KillFeedCsv
        } else {
            Self::ServerLog
        }
    }
}

/// Everything the parser needs to know about a chunk besides its bytes.
#[derive(Debug, Clone)]
pub struct ChunkContext<'a> {
    pub server_id: &'a str,
    pub file_name: &'a str,
    /// Lines of the file already consumed before this chunk.
    pub lines_before: u64,
    /// The chunk ends at a settled end of file, so an unterminated last line
    /// is complete.
    pub final_chunk: bool,
    /// Wall-clock used for records whose timestamp can't be parsed.
    pub ingested_at: DateTime<Utc>,
}

/// Result of parsing one chunk.
#[derive(Debug, Default)]
pub struct ParseOutput {
    /// Records in line order.
    pub records: Vec<RawRecord>,
    /// Bytes consumed, always ending on a line boundary.
    pub consumed: usize,
    /// Lines consumed.
    pub lines: u64,
    /// Malformed lines, skipped.
    pub errors: Vec<Error>,
    /// Blank or unframed lines that carry no record.
    pub ignored: usize,
    /// Records kept with a wall-clock fallback timestamp.
    pub flagged: usize,
}

/// Parse a complete file body.
pub fn parse(server_id: &str, file_name: &str, bytes: &[u8]) -> ParseOutput {
    let ctx = ChunkContext {
        server_id,
        file_name,
        lines_before: 0,
        final_chunk: true,
        ingested_at: Utc::now(),
    };
    parse_chunk(&ctx, bytes)
}

/// Parse a chunk that starts on a line boundary.
pub fn parse_chunk(ctx: &ChunkContext<'_>, bytes: &[u8]) -> ParseOutput {
    let format = LogFormat::detect(ctx.file_name);
    let mut out = ParseOutput::default();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let rest = &bytes[pos..];
        let (line_bytes, next) = match rest.iter().position(|&b| b == b'\n') {
            Some(end) => (&rest[..end], pos + end + 1),
            None if ctx.final_chunk => (rest, bytes.len()),
            // Partial line still being written.
            None => break,
        };
        pos = next;
        out.lines += 1;
        let line_no = ctx.lines_before + out.lines;

        let decoded = String::from_utf8_lossy(line_bytes);
        let mut text = decoded.trim_end_matches('\r');
        if line_no == 1 {
            text = text.trim_start_matches('\u{feff}');
        }
        if text.trim().is_empty() {
            out.ignored += 1;
            continue;
        }

        let parsed = match format {
            LogFormat::KillFeedCsv => parse_csv_line(ctx, line_no, text).map(Some),
            LogFormat::ServerLog => parse_log_line(ctx, line_no, text),
        };

        match parsed {
            Ok(Some(record)) => {
                if record.time.flagged {
                    debug!(
                        "{}:{}: unparsable timestamp {:?}, using ingestion time",
                        ctx.file_name, line_no, record.time.raw
                    );
                    out.flagged += 1;
                }
                out.records.push(record);
            }
            Ok(None) => out.ignored += 1,
            Err(e) => {
                warn!("{} ({}): skipping {}", ctx.file_name, ctx.server_id, e);
                out.errors.push(e);
            }
        }
    }

    out.consumed = pos;
    out
}

/// Parse a timestamp in any of the accepted layouts.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    for format in TIMESTAMP_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse a distance column. Missing, unparsable or negative values become 0.
pub fn parse_distance(raw: &str) -> f64 {
    raw.trim()
        .parse::<f64>()
        .ok()
        .filter(|d| d.is_finite() && *d >= 0.0)
        .unwrap_or(0.0)
}

fn event_time(ctx: &ChunkContext<'_>, raw: &str) -> EventTime {
    match parse_timestamp(raw) {
        Some(at) => EventTime::parsed(at, raw.trim()),
        None => EventTime::fallback(ctx.ingested_at, raw.trim()),
    }
}

fn record(ctx: &ChunkContext<'_>, line: u64, time: EventTime, event: RecordEvent) -> RawRecord {
    RawRecord {
        server_id: ctx.server_id.to_string(),
        time,
        source: SourcePosition {
            file: ctx.file_name.to_string(),
            line,
        },
        event,
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    (!value.is_empty()).then(|| value.to_string())
}

fn parse_csv_line(ctx: &ChunkContext<'_>, line: u64, text: &str) -> Result<RawRecord, Error> {
    let fields: Vec<&str> = text.split(';').map(str::trim).collect();
    if fields.len() < CSV_MIN_FIELDS {
        return Err(Error::FieldCount {
            line,
            expected: CSV_MIN_FIELDS,
            found: fields.len(),
        });
    }

    let time = event_time(ctx, fields[0]);
    let mut killer = Player::new(fields[2], fields[1]);
    let mut victim = Player::new(fields[4], fields[3]);
    if fields.len() >= CSV_PLATFORM_FIELDS {
        killer.platform = non_empty(fields[7]);
        victim.platform = non_empty(fields[8]);
    }
    let weapon = fields[5].to_string();
    let distance = parse_distance(fields[6]);

    let event = if killer.has_id() && killer.id == victim.id {
        RecordEvent::Suicide(SuicideEvent {
            player: victim,
            cause: SuicideCause::from_weapon(&weapon),
            weapon,
        })
    } else {
        RecordEvent::Kill(KillEvent {
            killer,
            victim,
            weapon,
            distance,
        })
    };

    Ok(record(ctx, line, time, event))
}

fn parse_log_line(
    ctx: &ChunkContext<'_>,
    line: u64,
    text: &str,
) -> Result<Option<RawRecord>, Error> {
    let Some(caps) = LOG_FRAME.captures(text) else {
        if text.starts_with('[') && text.contains("][") {
            return Err(Error::MalformedLogLine {
                line,
                reason: "frame without category".to_string(),
            });
        }
        // Header and continuation lines.
        return Ok(None);
    };

    let time = event_time(ctx, &caps["ts"]);
    let category = &caps["category"];
    let message = caps["message"].trim();

    let event = match category {
        "LogSFPS" => world_event(message),
        "LogOnline" => REGISTRATION.captures(message).map(|c| {
            let action = if &c["action"] == "registered" {
                ConnectionAction::Registered
            } else {
                ConnectionAction::Unregistered
            };
            RecordEvent::Connection(ConnectionEvent {
                player: Player::new(&c["id"], ""),
                action,
            })
        }),
        "LogNet" => JOIN.captures(message).map(|c| {
            RecordEvent::Connection(ConnectionEvent {
                player: Player::new("", c["name"].trim()),
                action: ConnectionAction::Joined,
            })
        }),
        _ => None,
    };

    let event = event.unwrap_or_else(|| RecordEvent::Unrecognized {
        category: category.to_string(),
        message: message.to_string(),
    });

    Ok(Some(record(ctx, line, time, event)))
}

fn world_event(message: &str) -> Option<RecordEvent> {
    if let Some(c) = MISSION.captures(message) {
        return Some(RecordEvent::World(WorldEvent {
            kind: WorldEventKind::Mission,
            name: c["name"].to_string(),
            state: c["state"].to_string(),
        }));
    }

    let c = WORLD_EVENT.captures(message)?;
    let kind = WorldEventKind::from_log_keyword(&c["kind"])?;
    let state = SWITCHED_TO
        .captures(&c["rest"])
        .map(|s| s["state"].to_string())
        .unwrap_or_default();
    Some(RecordEvent::World(WorldEvent {
        kind,
        name: kind.as_str().to_string(),
        state,
    }))
}
