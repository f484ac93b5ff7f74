//! Team and event resolution: mapping upstream match records onto local
//! records without clobbering operator edits.
//!
//! The write policy throughout is protect-once: a field is filled when local
//! data has none, and left alone on every later run. Only schedule facts the
//! upstream owns outright (kickoff, cancellation flags) are overwritten.

use chrono::{DateTime, Utc};
use courtsync_core::{
    fill_protected, fill_protected_opt, value_is_empty, Author, Event, EventStatus, GroupRef,
    Outcome, RecordId, RunStats, SideResult, Team,
};
use courtsync_source::{LeagueData, MatchRecord, TeamRef};
use courtsync_storage::{MemoryStore, StoreError};
use tracing::debug;

/// Bye rounds and withdrawn opponents arrive as placeholder team names; they
/// never become local records.
pub fn is_placeholder(name: &str) -> bool {
    let name = name.trim();
    name.is_empty() || name == "?" || name.eq_ignore_ascii_case("freilos")
}

pub fn normalize_name(name: &str) -> String {
    name.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn names_match(a: &str, b: &str) -> bool {
    normalize_name(a).to_lowercase() == normalize_name(b).to_lowercase()
}

/// Containment in either direction, so "TV Ost" still matches an upstream
/// "TV Ost 1" carrying a squad suffix.
fn names_overlap(a: &str, b: &str) -> bool {
    let a = normalize_name(a).to_lowercase();
    let b = normalize_name(b).to_lowercase();
    !a.is_empty() && !b.is_empty() && (a.contains(&b) || b.contains(&a))
}

/// Display name with the age-group qualifier, e.g. "TV Ost (U14 männlich)".
/// Senior teams keep their plain name.
pub fn display_name(raw: &str, age_group: &str, gender: &str) -> String {
    let base = normalize_name(raw);
    let age_group = age_group.trim();
    if age_group.is_empty() || age_group.eq_ignore_ascii_case("senioren") {
        return base;
    }
    let qualifier = [age_group, gender.trim()]
        .iter()
        .filter(|part| !part.is_empty())
        .cloned()
        .collect::<Vec<_>>()
        .join(" ");
    format!("{base} ({qualifier})")
}

/// Resolve an upstream team reference to a local record, creating or adopting
/// as needed. Returns `None` for placeholder sides.
pub fn resolve_team(
    store: &MemoryStore,
    team_ref: &TeamRef,
    league: Option<&LeagueData>,
    own_club_id: u64,
    stats: &mut RunStats,
) -> Result<Option<RecordId>, StoreError> {
    if is_placeholder(team_ref.name()) {
        return Ok(None);
    }

    let age_group = league.and_then(|l| l.age_group.as_deref()).unwrap_or("");
    let gender = league.and_then(|l| l.gender.as_deref()).unwrap_or("");
    let name = display_name(team_ref.name(), age_group, gender);

    if let Some(permanent_id) = team_ref.team_permanent_id {
        if let Some(id) = store.find_team_by_permanent_id(permanent_id) {
            let mut team = store.team(id).ok_or(StoreError::NotFound {
                kind: courtsync_core::EntityKind::Team,
                id,
            })?;
            if apply_team_fields(&mut team, team_ref, &name, own_club_id, true) {
                store.update_team(id, team)?;
            }
            stats.teams_updated += 1;
            return Ok(Some(id));
        }

        // Adoption: an operator-created team with an overlapping name is
        // claimed by the upstream key exactly once.
        let adoptable = store.teams().into_iter().find(|(_, t)| {
            t.permanent_id.is_none()
                && (names_overlap(&t.name, team_ref.name())
                    || names_overlap(&t.name, &name)
                    || names_overlap(&t.short_name, team_ref.name()))
        });
        if let Some((id, mut team)) = adoptable {
            team.permanent_id = Some(permanent_id);
            // The one moment the upstream naming wins over the local one.
            team.name = name.clone();
            apply_team_fields(&mut team, team_ref, &name, own_club_id, true);
            debug!(team = %team.name, permanent_id, "adopted operator team");
            store.update_team(id, team)?;
            stats.teams_updated += 1;
            return Ok(Some(id));
        }

        let mut team = Team {
            permanent_id: Some(permanent_id),
            name: name.clone(),
            author: Author::Sync,
            ..Team::default()
        };
        apply_team_fields(&mut team, team_ref, &name, own_club_id, false);
        let id = store.insert_team(team);
        stats.teams_created += 1;
        return Ok(Some(id));
    }

    // No upstream key; fall back to a name match so repeated runs do not
    // multiply keyless teams.
    if let Some((id, _)) = store
        .teams()
        .into_iter()
        .find(|(_, t)| names_match(&t.name, &name))
    {
        return Ok(Some(id));
    }
    let id = store.insert_team(Team {
        name,
        club_id: team_ref.club_id,
        is_own: team_ref.club_id == Some(own_club_id),
        author: Author::Sync,
        ..Team::default()
    });
    stats.teams_created += 1;
    Ok(Some(id))
}

fn apply_team_fields(
    team: &mut Team,
    team_ref: &TeamRef,
    name: &str,
    own_club_id: u64,
    is_update: bool,
) -> bool {
    let mut changed = false;
    changed |= fill_protected(&mut team.name, name, is_update);
    if let Some(short) = team_ref.team_name_small.as_deref() {
        changed |= fill_protected(&mut team.short_name, short, is_update);
        changed |= fill_protected(&mut team.abbreviation, short, is_update);
    }
    // Unsuffixed upstream name as the short name, first three letters as the
    // abbreviation, both only while still unset.
    changed |= fill_protected(
        &mut team.short_name,
        &normalize_name(team_ref.name()),
        is_update,
    );
    let abbr: String = team_ref
        .name()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .take(3)
        .collect::<String>()
        .to_uppercase();
    changed |= fill_protected(&mut team.abbreviation, &abbr, is_update);
    changed |= fill_protected_opt(&mut team.club_id, team_ref.club_id.as_ref(), is_update);
    changed |= fill_protected_opt(
        &mut team.season_team_id,
        team_ref.season_team_id.as_ref(),
        is_update,
    );
    if team_ref.club_id == Some(own_club_id) && !team.is_own {
        team.is_own = true;
        changed = true;
    }
    changed
}

/// Tags a team with its league and season terms. League memberships
/// accumulate across leagues; the season term is replaced.
pub fn tag_team(store: &MemoryStore, id: RecordId, league: Option<&LeagueData>, season: &GroupRef) {
    if let Some(league_id) = league.and_then(|l| l.league_id) {
        store.tag(id, GroupRef::league(league_id), true);
    }
    store.tag(id, season.clone(), false);
}

/// Create or update the event for one upstream match. Returns `None` when the
/// match cannot be represented (no match id or no parseable kickoff).
#[allow(clippy::too_many_arguments)]
pub fn upsert_event(
    store: &MemoryStore,
    record: &MatchRecord,
    home: RecordId,
    away: RecordId,
    league: Option<&LeagueData>,
    season: &GroupRef,
    result_slot: &str,
    now: DateTime<Utc>,
    stats: &mut RunStats,
) -> Result<Option<RecordId>, StoreError> {
    let Some(match_id) = record.match_id else {
        stats.events_skipped += 1;
        return Ok(None);
    };
    let Some(kickoff) = record.kickoff() else {
        stats.events_skipped += 1;
        return Ok(None);
    };
    // Two sides collapsing onto one record would self-reference the event.
    if home == away {
        stats.events_skipped += 1;
        return Ok(None);
    }

    let home_name = store.team(home).map(|t| t.name).unwrap_or_default();
    let away_name = store.team(away).map(|t| t.name).unwrap_or_default();
    let title = format!("{home_name} vs {away_name}");
    let league_id = league.and_then(|l| l.league_id);
    let cancelled = record.cancelled.unwrap_or(false);
    let played = record.scores().is_some() || kickoff <= now;

    // Adoption fallback: an operator-created event without an upstream key
    // covering the same pairing within a day of the kickoff is claimed.
    let existing = match store.find_event_by_match_id(match_id) {
        Some(id) => Some((id, false)),
        None => store
            .events()
            .into_iter()
            .find(|(_, e)| {
                e.match_id.is_none()
                    && ((e.home == home && e.away == away)
                        || (e.home == away && e.away == home))
                    && (e.kickoff - kickoff).num_hours().abs() <= 24
            })
            .map(|(id, _)| (id, true)),
    };

    let id = match existing {
        Some((id, adopted)) => {
            let mut event = store.event(id).ok_or(StoreError::NotFound {
                kind: courtsync_core::EntityKind::Event,
                id,
            })?;
            let mut changed = false;
            if adopted {
                debug!(%id, match_id, "adopted operator event");
                event.match_id = Some(match_id);
                changed = true;
            }

            // Schedule facts are upstream-owned and follow every change.
            if event.kickoff != kickoff {
                event.kickoff = kickoff;
                changed = true;
            }
            if event.cancelled != cancelled {
                event.cancelled = cancelled;
                changed = true;
            }
            if let Some(forfeit) = record.forfeit {
                if event.forfeit != forfeit {
                    event.forfeit = forfeit;
                    changed = true;
                }
            }
            if let Some(confirmed) = record.result_confirmed {
                if event.result_confirmed != confirmed {
                    event.result_confirmed = confirmed;
                    changed = true;
                }
            }
            changed |= fill_protected(&mut event.title, &title, true);
            changed |= fill_protected_opt(&mut event.league_id, league_id.as_ref(), true);
            changed |= fill_protected_opt(&mut event.match_day, record.match_day.as_ref(), true);
            changed |= fill_protected_opt(&mut event.match_no, record.match_no.as_ref(), true);

            // Status only ever moves forward: scheduled becomes published once
            // the match is played, and cancellation wins outright.
            if cancelled && event.status != EventStatus::Cancelled {
                event.status = EventStatus::Cancelled;
                changed = true;
            } else if !cancelled && event.status == EventStatus::Scheduled && played {
                event.status = EventStatus::Published;
                changed = true;
            }

            if let Some((home_score, away_score)) = record.scores() {
                changed |= write_result(&mut event, home, away, home_score, away_score, result_slot);
            }

            if changed {
                store.update_event(id, event)?;
            }
            stats.events_updated += 1;
            id
        }
        None => {
            let status = if cancelled {
                EventStatus::Cancelled
            } else if played {
                EventStatus::Published
            } else {
                EventStatus::Scheduled
            };
            let mut event = Event {
                match_id: Some(match_id),
                home,
                away,
                title,
                kickoff,
                status,
                league_id,
                match_day: record.match_day,
                match_no: record.match_no.clone(),
                cancelled,
                forfeit: record.forfeit.unwrap_or(false),
                result_confirmed: record.result_confirmed.unwrap_or(false),
                results: Default::default(),
                performance: Default::default(),
                venue: None,
                main_result: String::new(),
                boxscore: Default::default(),
                author: Author::Sync,
            };
            if let Some((home_score, away_score)) = record.scores() {
                write_result(&mut event, home, away, home_score, away_score, result_slot);
            }
            let id = store.insert_event(event);
            stats.events_created += 1;
            id
        }
    };

    if let Some(league_id) = league_id {
        store.tag(id, GroupRef::league(league_id), false);
    }
    store.tag(id, season.clone(), true);
    Ok(Some(id))
}

/// Writes the score into both sides' result slots, but only when no slot
/// holds a real value yet. An operator-entered result is never replaced.
pub fn write_result(
    event: &mut Event,
    home: RecordId,
    away: RecordId,
    home_score: i64,
    away_score: i64,
    result_slot: &str,
) -> bool {
    let already_set = !value_is_empty(&event.main_result)
        || event.results.values().any(SideResult::has_values);
    if already_set {
        return false;
    }

    let mut home_side = SideResult {
        outcome: Some(Outcome::from_scores(home_score, away_score)),
        ..SideResult::default()
    };
    home_side
        .slots
        .insert(result_slot.to_string(), home_score.to_string());
    let mut away_side = SideResult {
        outcome: Some(Outcome::from_scores(away_score, home_score)),
        ..SideResult::default()
    };
    away_side
        .slots
        .insert(result_slot.to_string(), away_score.to_string());

    event.results.insert(home, home_side);
    event.results.insert(away, away_side);
    event.main_result = format!("{home_score}:{away_score}");
    true
}
