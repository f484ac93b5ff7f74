//! Core domain model for courtsync: locally owned league records and the
//! write policies the sync engine applies to them.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "courtsync-core";

/// Store-issued record identifier. Monotonically increasing, so a lower id
/// always means an older record.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct RecordId(pub u64);

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Who created a record. Sync-created records are attributed to the dedicated
/// synthetic actor, never to the operator who happened to trigger the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Author {
    Sync,
    Operator,
}

impl Default for Author {
    fn default() -> Self {
        Author::Operator
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    Team,
    Event,
    Player,
    Venue,
    Roster,
    Table,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Team => "team",
            EntityKind::Event => "event",
            EntityKind::Player => "player",
            EntityKind::Venue => "venue",
            EntityKind::Roster => "roster",
            EntityKind::Table => "table",
        };
        f.write_str(name)
    }
}

/// A club team. `permanent_id` is the upstream primary key; operator-created
/// teams carry `None` until adopted by a sync run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Team {
    pub permanent_id: Option<u64>,
    pub season_team_id: Option<u64>,
    pub club_id: Option<u64>,
    pub name: String,
    pub short_name: String,
    pub abbreviation: String,
    pub age_group: String,
    pub gender: String,
    pub is_own: bool,
    /// Asset-store path of the cached club logo.
    pub logo: Option<String>,
    pub author: Author,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventStatus {
    Scheduled,
    Published,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    Win,
    Loss,
    Draw,
}

impl Outcome {
    pub fn from_scores(own: i64, other: i64) -> Self {
        match own.cmp(&other) {
            std::cmp::Ordering::Greater => Outcome::Win,
            std::cmp::Ordering::Less => Outcome::Loss,
            std::cmp::Ordering::Equal => Outcome::Draw,
        }
    }
}

/// One side's result: the outcome plus the configured result slots
/// (e.g. "t" and "pts"), each holding a string value so empty means unset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SideResult {
    pub outcome: Option<Outcome>,
    pub slots: BTreeMap<String, String>,
}

impl SideResult {
    /// True when any slot holds an actual value. "0" does not count, so a
    /// sync-seeded zero never blocks a later result write.
    pub fn has_values(&self) -> bool {
        self.slots.values().any(|v| !value_is_empty(v))
    }
}

/// Tracks whether the expensive per-match boxscore detail has been ingested.
/// `NoData` marks matches whose boxscore carries no player statistics; they
/// are re-checked on later runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IngestFlag {
    #[default]
    Pending,
    Ingested,
    NoData,
}

/// Per-player mapped statistic values, keyed by performance slot.
pub type StatLine = BTreeMap<String, String>;

/// A scheduled or played match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub match_id: Option<u64>,
    pub home: RecordId,
    pub away: RecordId,
    pub title: String,
    pub kickoff: DateTime<Utc>,
    pub status: EventStatus,
    pub league_id: Option<u64>,
    pub match_day: Option<u32>,
    pub match_no: Option<String>,
    pub cancelled: bool,
    pub forfeit: bool,
    pub result_confirmed: bool,
    /// Per-side results keyed by team record id.
    pub results: BTreeMap<RecordId, SideResult>,
    /// Per-team per-player performance lines keyed by team, then player.
    pub performance: BTreeMap<RecordId, BTreeMap<RecordId, StatLine>>,
    pub venue: Option<RecordId>,
    pub main_result: String,
    pub boxscore: IngestFlag,
    pub author: Author,
}

impl Event {
    pub fn references_team(&self, team: RecordId) -> bool {
        self.home == team || self.away == team
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Player {
    pub person_id: Option<u64>,
    pub player_id: Option<u64>,
    pub name: String,
    pub jersey_number: String,
    pub current_team: Option<RecordId>,
    pub teams: BTreeSet<RecordId>,
    pub author: Author,
}

/// A playing venue. Address and coordinates live in the store's attribute bag
/// under this record's id, not on the struct.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Venue {
    pub field_id: u64,
    pub name: String,
    pub author: Author,
}

/// A squad list for one own team in one season.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roster {
    pub team: RecordId,
    pub season_slug: String,
    pub title: String,
    pub players: BTreeSet<RecordId>,
    pub author: Author,
}

/// A standings container for one table-bearing league.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRecord {
    pub league_id: u64,
    pub title: String,
    pub teams: BTreeSet<RecordId>,
    pub main_result: String,
    pub author: Author,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GroupKind {
    League,
    Season,
}

/// A league or season classification term.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupRef {
    pub kind: GroupKind,
    pub slug: String,
}

impl GroupRef {
    pub fn league(league_id: u64) -> Self {
        Self {
            kind: GroupKind::League,
            slug: format!("lg-{league_id}"),
        }
    }

    pub fn season(label: &str) -> Self {
        Self {
            kind: GroupKind::Season,
            slug: slugify(label),
        }
    }
}

pub fn slugify(input: &str) -> String {
    let slug = input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '-' })
        .collect::<String>();
    slug.split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Emptiness test shared by all protect-once writes: empty string and "0"
/// count as unset so sync-seeded placeholders stay overwritable.
pub fn value_is_empty(value: &str) -> bool {
    value.is_empty() || value == "0"
}

/// Protect-once write: on update, only fill `current` when it is still empty;
/// on create, always write. Empty candidates are never written. Returns
/// whether the field changed.
pub fn fill_protected(current: &mut String, candidate: &str, is_update: bool) -> bool {
    if value_is_empty(candidate) {
        return false;
    }
    if is_update && !value_is_empty(current) {
        return false;
    }
    if current == candidate {
        return false;
    }
    *current = candidate.to_string();
    true
}

/// Protect-once write for optional fields.
pub fn fill_protected_opt<T: Clone + PartialEq>(
    current: &mut Option<T>,
    candidate: Option<&T>,
    is_update: bool,
) -> bool {
    let Some(candidate) = candidate else {
        return false;
    };
    if is_update && current.is_some() {
        return false;
    }
    if current.as_ref() == Some(candidate) {
        return false;
    }
    *current = Some(candidate.clone());
    true
}

/// Per-run counters, returned at run completion and kept as the last-run
/// summary. Mirrors the engine's statistics block field for field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunStats {
    pub teams_created: u64,
    pub teams_updated: u64,
    pub teams_deduped: u64,
    pub events_created: u64,
    pub events_updated: u64,
    pub events_deleted: u64,
    pub events_skipped: u64,
    pub venues_created: u64,
    pub venues_updated: u64,
    pub players_created: u64,
    pub players_updated: u64,
    pub players_skipped: u64,
    pub tables_created: u64,
    pub tables_updated: u64,
    pub logos_fetched: u64,
    pub leagues_found: u64,
    pub league_matches_synced: u64,
    pub api_calls: u64,
    pub errors: u64,
}

impl RunStats {
    pub fn merge(&mut self, other: &RunStats) {
        self.teams_created += other.teams_created;
        self.teams_updated += other.teams_updated;
        self.teams_deduped += other.teams_deduped;
        self.events_created += other.events_created;
        self.events_updated += other.events_updated;
        self.events_deleted += other.events_deleted;
        self.events_skipped += other.events_skipped;
        self.venues_created += other.venues_created;
        self.venues_updated += other.venues_updated;
        self.players_created += other.players_created;
        self.players_updated += other.players_updated;
        self.players_skipped += other.players_skipped;
        self.tables_created += other.tables_created;
        self.tables_updated += other.tables_updated;
        self.logos_fetched += other.logos_fetched;
        self.leagues_found += other.leagues_found;
        self.league_matches_synced += other.league_matches_synced;
        self.api_calls += other.api_calls;
        self.errors += other.errors;
    }
}
