//! Typed records produced by the parser.
//!
//! Every line the parser accepts becomes a [`RawRecord`]: the event itself as
//! one of a closed set of variants, plus where and when it happened. Records
//! are ephemeral; they live for one ingestion pass.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::fingerprint::EventFingerprint;

/// Weapon token the game writes when a player kills themselves from the menu
/// (relocation / respawn request).
pub const MENU_SUICIDE_TOKEN: &str = "suicide_by_relocation";

/// Weapon token the game writes for fall damage deaths.
pub const FALL_DEATH_TOKEN: &str = "falling";

/// A player as seen in a log line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Player {
    /// Stable platform identifier. Empty when the source omitted it.
    pub id: String,
    /// Display name at the time of the event.
    pub name: String,
    /// Platform column (newer kill-feed layout only).
    pub platform: Option<String>,
}

impl Player {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            platform: None,
        }
    }

    /// Whether the identifier required for stat accounting is present.
    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }
}

/// How a self-inflicted death happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuicideCause {
    /// Suicide through the respawn/relocation menu.
    Menu,
    /// Fall damage.
    Fall,
    /// Any other self-kill.
    Other,
}

impl SuicideCause {
    /// Classify a weapon/cause token. Matching is case-insensitive.
    pub fn from_weapon(weapon: &str) -> Self {
        let weapon = weapon.trim();
        if weapon.eq_ignore_ascii_case(MENU_SUICIDE_TOKEN) {
            Self::Menu
        } else if weapon.eq_ignore_ascii_case(FALL_DEATH_TOKEN) {
            Self::Fall
        } else {
            Self::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Menu => "menu",
            Self::Fall => "fall",
            Self::Other => "other",
        }
    }
}

/// Connection lifecycle step reported by the server log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionAction {
    Registered,
    Unregistered,
    Joined,
}

impl ConnectionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Registered => "registered",
            Self::Unregistered => "unregistered",
            Self::Joined => "joined",
        }
    }
}

/// World events announced in the server log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorldEventKind {
    Mission,
    Airdrop,
    Helicrash,
    Trader,
    Convoy,
}

impl WorldEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mission => "mission",
            Self::Airdrop => "airdrop",
            Self::Helicrash => "helicrash",
            Self::Trader => "trader",
            Self::Convoy => "convoy",
        }
    }

    /// Parse the event keyword used in `LogSFPS` lines.
    pub fn from_log_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_lowercase().as_str() {
            "mission" => Some(Self::Mission),
            "airdrop" => Some(Self::Airdrop),
            "helicrash" => Some(Self::Helicrash),
            "trader" => Some(Self::Trader),
            "convoy" => Some(Self::Convoy),
            _ => None,
        }
    }
}

/// Player-versus-player kill.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KillEvent {
    pub killer: Player,
    pub victim: Player,
    pub weapon: String,
    /// Distance in meters; 0 when the source had none.
    pub distance: f64,
}

/// Self-inflicted death.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuicideEvent {
    pub player: Player,
    pub cause: SuicideCause,
    /// The raw weapon/cause token.
    pub weapon: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionEvent {
    pub player: Player,
    pub action: ConnectionAction,
}

/// Mission or world event state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorldEvent {
    pub kind: WorldEventKind,
    /// Mission name, or the event keyword for unnamed world events.
    pub name: String,
    /// New state as written by the server (e.g. `ACTIVE`), possibly empty.
    pub state: String,
}

/// The closed set of things a line can describe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RecordEvent {
    Kill(KillEvent),
    Suicide(SuicideEvent),
    Connection(ConnectionEvent),
    World(WorldEvent),
    /// Framed log line we don't model. Forwarded only to non-stat handlers.
    Unrecognized { category: String, message: String },
}

/// Flat kind discriminator, used for fingerprints, metrics and storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Kill,
    Suicide,
    FallDeath,
    MenuSuicide,
    Connection,
    WorldEvent,
    Unrecognized,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Kill => "kill",
            Self::Suicide => "suicide",
            Self::FallDeath => "fall_death",
            Self::MenuSuicide => "menu_suicide",
            Self::Connection => "connection",
            Self::WorldEvent => "world_event",
            Self::Unrecognized => "unrecognized",
        }
    }
}

/// Where a record came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourcePosition {
    /// File name (not the full remote path).
    pub file: String,
    /// 1-based line number.
    pub line: u64,
}

/// When a record happened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventTime {
    /// Parsed timestamp, or the ingestion wall-clock when `flagged`.
    pub at: DateTime<Utc>,
    /// Timestamp text exactly as it appeared in the source.
    pub raw: String,
    /// Set when `raw` could not be parsed and `at` is a fallback.
    pub flagged: bool,
}

impl EventTime {
    pub fn parsed(at: DateTime<Utc>, raw: impl Into<String>) -> Self {
        Self {
            at,
            raw: raw.into(),
            flagged: false,
        }
    }

    pub fn fallback(now: DateTime<Utc>, raw: impl Into<String>) -> Self {
        Self {
            at: now,
            raw: raw.into(),
            flagged: true,
        }
    }
}

/// One parsed line.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RawRecord {
    pub server_id: String,
    pub time: EventTime,
    pub source: SourcePosition,
    pub event: RecordEvent,
}

impl RawRecord {
    pub fn kind(&self) -> RecordKind {
        match &self.event {
            RecordEvent::Kill(_) => RecordKind::Kill,
            RecordEvent::Suicide(s) => match s.cause {
                SuicideCause::Menu => RecordKind::MenuSuicide,
                SuicideCause::Fall => RecordKind::FallDeath,
                SuicideCause::Other => RecordKind::Suicide,
            },
            RecordEvent::Connection(_) => RecordKind::Connection,
            RecordEvent::World(_) => RecordKind::WorldEvent,
            RecordEvent::Unrecognized { .. } => RecordKind::Unrecognized,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.time.at
    }

    /// Kills and suicides: the records that mutate player statistics.
    pub fn is_combat(&self) -> bool {
        matches!(
            self.event,
            RecordEvent::Kill(_) | RecordEvent::Suicide(_)
        )
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self.event, RecordEvent::Unrecognized { .. })
    }

    /// Identity of the real-world occurrence this record describes.
    pub fn fingerprint(&self) -> EventFingerprint {
        EventFingerprint::of(self)
    }
}
