//! Duplicate-team convergence and orphaned-event cleanup.
//!
//! Duplicates share an upstream permanent id. The oldest record (lowest store
//! id) survives; every reference in events, players, rosters and tables is
//! repointed to it before the younger duplicates are deleted, so no run can
//! leave a dangling reference behind.

use std::collections::{BTreeMap, BTreeSet};

use courtsync_core::{fill_protected, fill_protected_opt, Author, GroupKind, RecordId, RunStats};
use courtsync_storage::{MemoryStore, StoreError};
use tracing::{debug, warn};

/// Collapse teams that share a permanent id down to their oldest record.
/// Each duplicate group is handled independently; a failure in one group is
/// logged and counted, and the remaining groups still converge.
pub fn dedup_teams(store: &MemoryStore, stats: &mut RunStats) {
    let mut by_permanent_id: BTreeMap<u64, Vec<RecordId>> = BTreeMap::new();
    for (id, team) in store.teams() {
        if let Some(permanent_id) = team.permanent_id {
            by_permanent_id.entry(permanent_id).or_default().push(id);
        }
    }

    for (permanent_id, mut ids) in by_permanent_id {
        if ids.len() < 2 {
            continue;
        }
        ids.sort();
        let keeper = ids[0];
        for loser in &ids[1..] {
            match merge_team(store, keeper, *loser) {
                Ok(()) => {
                    debug!(permanent_id, %keeper, %loser, "merged duplicate team");
                    stats.teams_deduped += 1;
                }
                Err(err) => {
                    warn!(permanent_id, %loser, %err, "duplicate merge failed");
                    stats.errors += 1;
                }
            }
        }
    }
}

/// Repoint every reference from `loser` to `keeper`, fold the loser's fields
/// into the keeper's empty slots, then delete the loser.
fn merge_team(store: &MemoryStore, keeper: RecordId, loser: RecordId) -> Result<(), StoreError> {
    for (event_id, mut event) in store.events() {
        let mut changed = false;
        if event.home == loser {
            event.home = keeper;
            changed = true;
        }
        if event.away == loser {
            event.away = keeper;
            changed = true;
        }
        if let Some(side) = event.results.remove(&loser) {
            event.results.entry(keeper).or_insert(side);
            changed = true;
        }
        if let Some(lines) = event.performance.remove(&loser) {
            let keeper_lines = event.performance.entry(keeper).or_default();
            for (player, line) in lines {
                keeper_lines.entry(player).or_insert(line);
            }
            changed = true;
        }
        if changed {
            store.update_event(event_id, event)?;
        }
    }

    for (player_id, mut player) in store.players() {
        let mut changed = false;
        if player.current_team == Some(loser) {
            player.current_team = Some(keeper);
            changed = true;
        }
        if player.teams.remove(&loser) {
            player.teams.insert(keeper);
            changed = true;
        }
        if changed {
            store.update_player(player_id, player)?;
        }
    }

    let keeper_rosters: BTreeMap<String, RecordId> = store
        .rosters()
        .into_iter()
        .filter(|(_, r)| r.team == keeper)
        .map(|(id, r)| (r.season_slug, id))
        .collect();
    for (roster_id, mut roster) in store.rosters() {
        if roster.team != loser {
            continue;
        }
        // An existing keeper roster for the same season absorbs the players.
        if let Some(target_id) = keeper_rosters.get(&roster.season_slug) {
            let mut target = store.roster(*target_id).ok_or(StoreError::NotFound {
                kind: courtsync_core::EntityKind::Roster,
                id: *target_id,
            })?;
            target.players.append(&mut roster.players);
            store.update_roster(*target_id, target)?;
            store.delete_roster(roster_id)?;
        } else {
            roster.team = keeper;
            store.update_roster(roster_id, roster)?;
        }
    }

    for (table_id, mut table) in store.tables() {
        if table.teams.remove(&loser) {
            table.teams.insert(keeper);
            store.update_table(table_id, table)?;
        }
    }

    for kind in [GroupKind::League, GroupKind::Season] {
        for group in store.groups_of(loser, kind) {
            store.tag(keeper, group, true);
        }
    }

    let loser_team = store.team(loser).ok_or(StoreError::NotFound {
        kind: courtsync_core::EntityKind::Team,
        id: loser,
    })?;
    let mut keeper_team = store.team(keeper).ok_or(StoreError::NotFound {
        kind: courtsync_core::EntityKind::Team,
        id: keeper,
    })?;
    let mut changed = false;
    changed |= fill_protected(&mut keeper_team.short_name, &loser_team.short_name, true);
    changed |= fill_protected(&mut keeper_team.abbreviation, &loser_team.abbreviation, true);
    changed |= fill_protected(&mut keeper_team.age_group, &loser_team.age_group, true);
    changed |= fill_protected(&mut keeper_team.gender, &loser_team.gender, true);
    changed |= fill_protected_opt(&mut keeper_team.club_id, loser_team.club_id.as_ref(), true);
    changed |= fill_protected_opt(
        &mut keeper_team.season_team_id,
        loser_team.season_team_id.as_ref(),
        true,
    );
    changed |= fill_protected_opt(&mut keeper_team.logo, loser_team.logo.as_ref(), true);
    if loser_team.is_own && !keeper_team.is_own {
        keeper_team.is_own = true;
        changed = true;
    }
    if changed {
        store.update_team(keeper, keeper_team)?;
    }

    store.delete_team(loser)
}

/// Delete sync-created events for `team` whose upstream match no longer
/// exists. Operator-created events and events without an upstream key are
/// out of scope.
pub fn reconcile_orphans(
    store: &MemoryStore,
    team: RecordId,
    upstream_match_ids: &BTreeSet<u64>,
    stats: &mut RunStats,
) {
    // An empty answer is indistinguishable from an upstream hiccup; never
    // reconcile against it.
    if upstream_match_ids.is_empty() {
        warn!(%team, "upstream returned no matches; skipping orphan cleanup");
        return;
    }
    for (event_id, event) in store.events() {
        if !event.references_team(team) || event.author != Author::Sync {
            continue;
        }
        let Some(match_id) = event.match_id else {
            continue;
        };
        if upstream_match_ids.contains(&match_id) {
            continue;
        }
        match store.delete_event(event_id) {
            Ok(()) => {
                debug!(%event_id, match_id, "deleted orphaned event");
                stats.events_deleted += 1;
            }
            Err(err) => {
                warn!(%event_id, %err, "orphan delete failed");
                stats.errors += 1;
            }
        }
    }
}
