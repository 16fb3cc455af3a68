//! Event fingerprints.
//!
//! A log file can be read more than once: after a restart that rewinds to a
//! file boundary, after an operator lookback run, or because a rotation left
//! the same line at the tail of one file and the head of the next. The
//! fingerprint identifies the logical event independently of which file and
//! line produced it.
//!
//! # Composition
//!
//! | kind           | primary        | secondary     |
//! |----------------|----------------|---------------|
//! | kill           | killer id      | victim id     |
//! | suicide kinds  | player id      | player id     |
//! | connection     | player id/name | action        |
//! | world event    | event name     | state         |
//! | unrecognized   | log category   | message       |
//!
//! plus the server id, the kind and the timestamp at source resolution. When
//! the timestamp could not be parsed the raw text is used instead of the
//! wall-clock fallback, so re-reads of a flagged line still collapse.

use std::fmt;

use crate::record::{RawRecord, RecordEvent, RecordKind};

/// Timestamp component of a fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FingerprintTime {
    /// Parsed timestamp, Unix milliseconds.
    Millis(i64),
    /// Unparsable timestamp, verbatim.
    Raw(String),
}

/// Identity of a logical event for deduplication.
///
/// Equality is structural over server, kind, both actor components and time.
/// Source file and line are deliberately absent.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EventFingerprint {
    server_id: String,
    kind: RecordKind,
    primary: String,
    secondary: String,
    time: FingerprintTime,
}

impl EventFingerprint {
    /// Derive the fingerprint of a record.
    pub fn of(record: &RawRecord) -> Self {
        let (primary, secondary) = match &record.event {
            RecordEvent::Kill(k) => (k.killer.id.clone(), k.victim.id.clone()),
            RecordEvent::Suicide(s) => (s.player.id.clone(), s.player.id.clone()),
            RecordEvent::Connection(c) => {
                let who = if c.player.has_id() {
                    c.player.id.clone()
                } else {
                    c.player.name.clone()
                };
                (who, c.action.as_str().to_string())
            }
            RecordEvent::World(w) => (w.name.clone(), w.state.clone()),
            RecordEvent::Unrecognized { category, message } => {
                (category.clone(), message.clone())
            }
        };

        let time = if record.time.flagged {
            FingerprintTime::Raw(record.time.raw.clone())
        } else {
            FingerprintTime::Millis(record.time.at.timestamp_millis())
        };

        Self {
            server_id: record.server_id.clone(),
            kind: record.kind(),
            primary,
            secondary,
            time,
        }
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn kind(&self) -> RecordKind {
        self.kind
    }

    pub fn time(&self) -> &FingerprintTime {
        &self.time
    }

    /// Stable string form, used as a unique key in durable storage.
    ///
    /// Components are separated by `:`; backslashes and colons inside a
    /// component are escaped so distinct fingerprints never share a key.
    pub fn key(&self) -> String {
        let time = match &self.time {
            FingerprintTime::Millis(ms) => ms.to_string(),
            FingerprintTime::Raw(raw) => format!("raw={}", escape(raw)),
        };
        format!(
            "{}:{}:{}:{}:{}",
            self.kind.as_str(),
            escape(&self.server_id),
            escape(&self.primary),
            escape(&self.secondary),
            time
        )
    }
}

impl fmt::Display for EventFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

fn escape(component: &str) -> String {
    component.replace('\\', "\\\\").replace(':', "\\:")
}
