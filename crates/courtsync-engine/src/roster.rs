//! Boxscore ingestion: players, per-match stat lines, and season squad lists.
//!
//! Upstream stat field names are mapped to local performance slots in two
//! tiers: the operator-configured mapping wins, then the built-in alias
//! table. Unmapped fields are dropped. Numeric zeros are real values and are
//! written; explicit nulls are not.

use std::collections::BTreeMap;

use courtsync_core::{
    fill_protected, value_is_empty, Author, IngestFlag, Player, RecordId, Roster, RunStats,
    StatLine,
};
use courtsync_source::{BoxscorePayload, PlayerStatLine, StatValue};
use courtsync_storage::{MemoryStore, StoreError};
use tracing::debug;

/// Built-in scalar aliases: upstream field → performance slot.
const STAT_ALIASES: &[(&str, &str)] = &[
    ("points", "pts"),
    ("totalPoints", "pts"),
    ("rebounds", "reb"),
    ("totalRebounds", "reb"),
    ("offensiveRebounds", "oreb"),
    ("defensiveRebounds", "dreb"),
    ("assists", "ast"),
    ("steals", "stl"),
    ("blocks", "blk"),
    ("turnovers", "to"),
    ("fouls", "pf"),
    ("personalFouls", "pf"),
    ("minutes", "min"),
    ("playingTime", "min"),
];

/// Built-in aliases for made/attempted pairs: upstream field → (made slot,
/// attempted slot).
const SPLIT_ALIASES: &[(&str, (&str, &str))] = &[
    ("fieldGoals", ("fgm", "fga")),
    ("twoPointShots", ("fg2m", "fg2a")),
    ("threePointShots", ("fg3m", "fg3a")),
    ("freeThrows", ("ftm", "fta")),
];

/// Performance slots the engine registers at startup.
pub const BUILTIN_STAT_SLOTS: &[&str] = &[
    "pts", "reb", "oreb", "dreb", "ast", "stl", "blk", "to", "pf", "min", "fgm", "fga", "fg2m",
    "fg2a", "fg3m", "fg3a", "ftm", "fta",
];

/// Operator-configured mapping, checked before the alias tables.
pub type StatMapping = BTreeMap<String, String>;

fn resolve_scalar_slot(store: &MemoryStore, mapping: &StatMapping, key: &str) -> Option<String> {
    if let Some(slot) = mapping.get(key) {
        return store.stat_slot_exists(slot).then(|| slot.clone());
    }
    if let Some((_, slot)) = STAT_ALIASES.iter().find(|(alias, _)| *alias == key) {
        return store.stat_slot_exists(slot).then(|| (*slot).to_string());
    }
    store.stat_slot_exists(key).then(|| key.to_string())
}

fn resolve_split_slots(store: &MemoryStore, key: &str) -> Option<(String, String)> {
    let (_, (made, attempted)) = SPLIT_ALIASES.iter().find(|(alias, _)| *alias == key)?;
    (store.stat_slot_exists(made) && store.stat_slot_exists(attempted))
        .then(|| ((*made).to_string(), (*attempted).to_string()))
}

/// Protect-once write into a stat line: an already-written real value stays.
fn set_line_value(line: &mut StatLine, slot: String, value: String) -> bool {
    match line.get(&slot) {
        Some(existing) if !value_is_empty(existing) => false,
        _ => {
            let changed = line.get(&slot) != Some(&value);
            line.insert(slot, value);
            changed
        }
    }
}

fn map_stat_line(
    store: &MemoryStore,
    mapping: &StatMapping,
    raw: &PlayerStatLine,
    line: &mut StatLine,
) -> bool {
    let mut changed = false;
    for (key, value) in &raw.values {
        match value {
            StatValue::Scalar(v) => {
                if let Some(slot) = resolve_scalar_slot(store, mapping, key) {
                    changed |= set_line_value(line, slot, v.to_string());
                }
            }
            StatValue::Split { made, attempted } => {
                if let Some((made_slot, attempted_slot)) = resolve_split_slots(store, key) {
                    if let Some(made) = made {
                        changed |= set_line_value(line, made_slot, made.to_string());
                    }
                    if let Some(attempted) = attempted {
                        changed |= set_line_value(line, attempted_slot, attempted.to_string());
                    }
                }
            }
            StatValue::Null => {}
            StatValue::Other(raw_value) => {
                debug!(key, %raw_value, "unrecognized stat value shape");
            }
        }
    }
    changed
}

/// Resolve a boxscore player line to a local player record. Anonymized lines
/// resolve to nothing.
fn resolve_player(
    store: &MemoryStore,
    raw: &PlayerStatLine,
    team: RecordId,
    stats: &mut RunStats,
) -> Result<Option<RecordId>, StoreError> {
    let Some(player_ref) = raw.player.as_ref() else {
        return Ok(None);
    };
    if player_ref.is_anonymized() {
        stats.players_skipped += 1;
        return Ok(None);
    }
    let name = player_ref.full_name();
    if name.is_empty() {
        stats.players_skipped += 1;
        return Ok(None);
    }

    let existing = player_ref
        .person_id()
        .and_then(|person_id| store.find_player_by_person_id(person_id))
        .or_else(|| {
            store
                .players()
                .into_iter()
                .find(|(_, p)| p.person_id.is_none() && p.name == name)
                .map(|(id, _)| id)
        });

    let id = match existing {
        Some(id) => {
            let mut player = store.player(id).ok_or(StoreError::NotFound {
                kind: courtsync_core::EntityKind::Player,
                id,
            })?;
            let mut changed = player.teams.insert(team);
            if player.current_team != Some(team) {
                player.current_team = Some(team);
                changed = true;
            }
            if player.person_id.is_none() && player_ref.person_id().is_some() {
                player.person_id = player_ref.person_id();
                changed = true;
            }
            if player.player_id.is_none() && player_ref.player_id.is_some() {
                player.player_id = player_ref.player_id;
                changed = true;
            }
            if let Some(jersey) = raw.jersey_number.as_deref() {
                changed |= fill_protected(&mut player.jersey_number, jersey, true);
            }
            if changed {
                store.update_player(id, player)?;
                stats.players_updated += 1;
            }
            id
        }
        None => {
            let id = store.insert_player(Player {
                person_id: player_ref.person_id(),
                player_id: player_ref.player_id,
                name,
                jersey_number: raw.jersey_number.clone().unwrap_or_default(),
                current_team: Some(team),
                teams: [team].into_iter().collect(),
                author: Author::Sync,
            });
            stats.players_created += 1;
            id
        }
    };
    Ok(Some(id))
}

pub enum IngestOutcome {
    /// Stats written and the event flagged so later runs skip the fetch.
    Ingested,
    /// Boxscore carried no player statistics; flagged for re-check.
    NoData,
    /// Event already flagged as ingested.
    AlreadyIngested,
}

/// Write one match's boxscore into the event's performance block and collect
/// the own team's players into the season roster.
#[allow(clippy::too_many_arguments)]
pub fn ingest_boxscore(
    store: &MemoryStore,
    event_id: RecordId,
    payload: &BoxscorePayload,
    mapping: &StatMapping,
    own_team: RecordId,
    season_slug: &str,
    own_only: bool,
    stats: &mut RunStats,
) -> Result<IngestOutcome, StoreError> {
    let mut event = store.event(event_id).ok_or(StoreError::NotFound {
        kind: courtsync_core::EntityKind::Event,
        id: event_id,
    })?;
    if event.boxscore == IngestFlag::Ingested {
        return Ok(IngestOutcome::AlreadyIngested);
    }

    let Some(boxscore) = payload.match_boxscore.as_ref() else {
        event.boxscore = IngestFlag::NoData;
        store.update_event(event_id, event)?;
        return Ok(IngestOutcome::NoData);
    };
    if boxscore.home_player_stats.is_empty() && boxscore.guest_player_stats.is_empty() {
        event.boxscore = IngestFlag::NoData;
        store.update_event(event_id, event)?;
        return Ok(IngestOutcome::NoData);
    }

    let sides = [
        (event.home, &boxscore.home_player_stats),
        (event.away, &boxscore.guest_player_stats),
    ];
    let mut own_players = Vec::new();
    for (team, lines) in sides {
        if own_only && team != own_team {
            continue;
        }
        for raw in lines {
            let Some(player_id) = resolve_player(store, raw, team, stats)? else {
                continue;
            };
            let line = event
                .performance
                .entry(team)
                .or_default()
                .entry(player_id)
                .or_default();
            map_stat_line(store, mapping, raw, line);
            if team == own_team {
                own_players.push(player_id);
            }
        }
    }

    event.boxscore = IngestFlag::Ingested;
    store.update_event(event_id, event)?;

    if !own_players.is_empty() {
        update_roster(store, own_team, season_slug, &own_players)?;
    }
    Ok(IngestOutcome::Ingested)
}

fn update_roster(
    store: &MemoryStore,
    team: RecordId,
    season_slug: &str,
    players: &[RecordId],
) -> Result<(), StoreError> {
    match store.find_roster(team, season_slug) {
        Some(roster_id) => {
            let mut roster = store.roster(roster_id).ok_or(StoreError::NotFound {
                kind: courtsync_core::EntityKind::Roster,
                id: roster_id,
            })?;
            let before = roster.players.len();
            roster.players.extend(players.iter().copied());
            if roster.players.len() != before {
                store.update_roster(roster_id, roster)?;
            }
        }
        None => {
            let team_name = store.team(team).map(|t| t.name).unwrap_or_default();
            store.insert_roster(Roster {
                team,
                season_slug: season_slug.to_string(),
                title: format!("{team_name} {season_slug}"),
                players: players.iter().copied().collect(),
                author: Author::Sync,
            });
        }
    }
    Ok(())
}
