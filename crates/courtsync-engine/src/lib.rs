//! Sync orchestration: the run state machine that pulls upstream league data
//! into the local record store.
//!
//! A run moves through fixed phases: duplicate cleanup, club-wide match
//! loading, per-team sync (matches, boxscores, venues, logos, orphan
//! cleanup), and league-wide reconciliation for table-bearing leagues. Every
//! upstream call is followed by the client's throttle pause.

pub mod dedup;
pub mod progress;
pub mod resolver;
pub mod roster;
pub mod venue;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Utc;
use courtsync_core::{GroupRef, IngestFlag, RecordId, RunStats};
use courtsync_source::{Geocoder, LeagueData, MatchRecord, SourceClient};
use courtsync_storage::{AssetStore, MemoryStore};
use serde::Deserialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::warn;
use uuid::Uuid;

pub use progress::{
    BeginError, LogEntry, Phase, ProgressBoard, ProgressView, RunHistory, RunRecord, RunStatus,
    RunTrigger, SyncLog,
};
pub use roster::{StatMapping, BUILTIN_STAT_SLOTS};

pub const CRATE_NAME: &str = "courtsync-engine";

/// The synced club and season, loaded from the workspace profile file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClubProfile {
    pub own_club_id: u64,
    pub season: String,
    #[serde(default = "default_range_days")]
    pub range_days: u32,
    /// Result custom-field slots; the score lands in the first entry.
    #[serde(default = "default_result_slots")]
    pub result_slots: Vec<String>,
    #[serde(default)]
    pub stat_mapping: StatMapping,
    /// Explicit root-team registration by upstream permanent id. Empty means
    /// every own team discovered from the club's matches.
    #[serde(default)]
    pub team_ids: Vec<u64>,
    /// Master switch for the per-match boxscore detail fetch.
    #[serde(default = "default_true")]
    pub ingest_boxscores: bool,
    /// Restrict stat ingestion to the own side of each match.
    #[serde(default)]
    pub boxscore_own_teams_only: bool,
    #[serde(default = "default_logo_ttl_days")]
    pub logo_ttl_days: i64,
}

fn default_range_days() -> u32 {
    365
}

fn default_result_slots() -> Vec<String> {
    vec!["t".to_string()]
}

fn default_true() -> bool {
    true
}

fn default_logo_ttl_days() -> i64 {
    venue::LOGO_TTL_DAYS
}

impl ClubProfile {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn main_result_slot(&self) -> &str {
        self.result_slots.first().map(String::as_str).unwrap_or("t")
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub profile: ClubProfile,
    pub assets_dir: PathBuf,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub stale_lock_secs: u64,
    pub progress_ttl_secs: u64,
    pub poll_staleness_secs: u64,
}

impl SyncConfig {
    pub fn from_env(profile: ClubProfile) -> Self {
        Self {
            profile,
            assets_dir: std::env::var("COURTSYNC_ASSETS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./assets")),
            scheduler_enabled: std::env::var("COURTSYNC_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("COURTSYNC_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 6 * * *".to_string()),
            stale_lock_secs: env_u64("COURTSYNC_STALE_LOCK_SECS", 300),
            progress_ttl_secs: env_u64("COURTSYNC_PROGRESS_TTL_SECS", 600),
            poll_staleness_secs: env_u64("COURTSYNC_POLL_STALENESS_SECS", 120),
        }
    }
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<MemoryStore>,
    client: Arc<dyn SourceClient>,
    geocoder: Arc<dyn Geocoder>,
    assets: AssetStore,
    pub progress: Arc<ProgressBoard>,
    pub log: Arc<SyncLog>,
    pub history: Arc<RunHistory>,
    last_stats: Mutex<Option<RunStats>>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        store: Arc<MemoryStore>,
        client: Arc<dyn SourceClient>,
        geocoder: Arc<dyn Geocoder>,
    ) -> Self {
        for slot in BUILTIN_STAT_SLOTS {
            store.register_stat_slot(slot);
        }
        for slot in &config.profile.result_slots {
            store.register_stat_slot(slot);
        }
        let assets = AssetStore::new(config.assets_dir.clone());
        let progress = Arc::new(ProgressBoard::new(
            config.stale_lock_secs,
            config.progress_ttl_secs,
            config.poll_staleness_secs,
        ));
        Self {
            config,
            store,
            client,
            geocoder,
            assets,
            progress,
            log: Arc::new(SyncLog::default()),
            history: Arc::new(RunHistory::default()),
            last_stats: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Counters of the most recently finished run.
    pub fn last_stats(&self) -> Option<RunStats> {
        *self.last_stats.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run a full sync in the foreground.
    pub async fn run_once(&self, trigger: RunTrigger) -> Result<RunStats> {
        let run_id = self.progress.try_begin(Utc::now())?;
        self.execute(run_id, trigger).await
    }

    /// Claim the run slot and execute the sync on a detached task. Returns
    /// immediately with the run id, or the active-run error.
    pub fn spawn_run(self: &Arc<Self>, trigger: RunTrigger) -> Result<Uuid, BeginError> {
        let run_id = self.progress.try_begin(Utc::now())?;
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(err) = engine.execute(run_id, trigger).await {
                warn!(%run_id, %err, "detached sync run failed");
            }
        });
        Ok(run_id)
    }

    async fn execute(&self, run_id: Uuid, trigger: RunTrigger) -> Result<RunStats> {
        let started_at = Utc::now();
        self.log.info(format!("sync run {run_id} started"));
        let mut stats = RunStats::default();
        let outcome = self.run_phases(&mut stats).await;

        let finished_at = Utc::now();
        self.progress.finish(finished_at);
        *self.last_stats.lock().unwrap_or_else(|e| e.into_inner()) = Some(stats);
        let (status, error) = match &outcome {
            Ok(()) => {
                self.log.info(format!(
                    "sync run {run_id} finished: {} teams created, {} events created, {} api calls",
                    stats.teams_created, stats.events_created, stats.api_calls
                ));
                ("completed".to_string(), None)
            }
            Err(err) => {
                self.log.error(format!("sync run {run_id} failed: {err:#}"));
                ("failed".to_string(), Some(format!("{err:#}")))
            }
        };
        self.history.push(RunRecord {
            run_id,
            trigger,
            started_at,
            finished_at,
            status,
            stats,
            error,
        });
        outcome.map(|()| stats)
    }

    async fn run_phases(&self, stats: &mut RunStats) -> Result<()> {
        let profile = &self.config.profile;
        let season = GroupRef::season(&profile.season);
        self.store.define_group(season.clone(), &profile.season);

        self.progress
            .update(Utc::now(), Phase::Dedup, 0, 0, "merging duplicate teams");
        dedup::dedup_teams(&self.store, stats);

        self.progress.update(
            Utc::now(),
            Phase::TeamsLoading,
            0,
            0,
            "loading club matches",
        );
        let club = self
            .client
            .club_matches(profile.own_club_id, profile.range_days)
            .await
            .context("fetching club matches")?;
        stats.api_calls += 1;
        self.client.throttle().await;

        let mut leagues: BTreeMap<u64, LeagueData> = BTreeMap::new();
        for record in &club.matches {
            // One bad record must not end the run.
            if let Err(err) = self.ingest_match(record, None, &season, &mut leagues, stats) {
                self.log.error(format!(
                    "ingesting club match {:?} failed: {err:#}",
                    record.match_id
                ));
                stats.errors += 1;
            }
        }
        stats.leagues_found = leagues.len() as u64;

        let own_teams: Vec<(RecordId, u64)> = self
            .store
            .teams()
            .into_iter()
            .filter(|(_, t)| t.is_own)
            .filter_map(|(id, t)| t.permanent_id.map(|pid| (id, pid)))
            .filter(|(_, pid)| profile.team_ids.is_empty() || profile.team_ids.contains(pid))
            .collect();

        let total = own_teams.len() as u64;
        for (index, (team_id, permanent_id)) in own_teams.iter().enumerate() {
            let team_name = self
                .store
                .team(*team_id)
                .map(|t| t.name)
                .unwrap_or_default();
            self.progress.update(
                Utc::now(),
                Phase::TeamsSyncing,
                index as u64 + 1,
                total,
                team_name.clone(),
            );
            if let Err(err) = self
                .sync_team(*team_id, *permanent_id, &season, &mut leagues, stats)
                .await
            {
                // One broken team must not end the run.
                self.log
                    .error(format!("syncing {team_name} failed: {err:#}"));
                stats.errors += 1;
            }
        }

        self.progress.update(
            Utc::now(),
            Phase::LeagueWideReconcile,
            0,
            0,
            "reconciling leagues",
        );
        for (league_id, league) in &leagues {
            let league_id = *league_id;
            if let Err(err) = self
                .sync_league(league_id, league, &season, stats)
                .await
            {
                self.log
                    .error(format!("reconciling league {league_id} failed: {err:#}"));
                stats.errors += 1;
            }
        }

        Ok(())
    }

    /// Resolve both sides and upsert the event for one upstream match record.
    /// Returns the event id unless the match is a bye or unrepresentable.
    fn ingest_match(
        &self,
        record: &MatchRecord,
        fallback_league: Option<&LeagueData>,
        season: &GroupRef,
        leagues: &mut BTreeMap<u64, LeagueData>,
        stats: &mut RunStats,
    ) -> Result<Option<RecordId>> {
        let profile = &self.config.profile;
        let league = record.league_data.as_ref().or(fallback_league);
        if let Some(league) = league {
            if let Some(league_id) = league.league_id {
                let name = league.league_name.clone().unwrap_or_default();
                if !name.is_empty() {
                    self.store.define_group(GroupRef::league(league_id), &name);
                }
                leagues.entry(league_id).or_insert_with(|| league.clone());
            }
        }

        let sides = [record.home_team.as_ref(), record.guest_team.as_ref()];
        let mut resolved = Vec::with_capacity(2);
        for side in sides {
            let Some(team_ref) = side else {
                stats.events_skipped += 1;
                return Ok(None);
            };
            let team = resolver::resolve_team(
                &self.store,
                team_ref,
                league,
                profile.own_club_id,
                stats,
            )?;
            let Some(team) = team else {
                // Bye or placeholder side; nothing to record.
                stats.events_skipped += 1;
                return Ok(None);
            };
            resolver::tag_team(&self.store, team, league, season);
            resolved.push(team);
        }

        resolver::upsert_event(
            &self.store,
            record,
            resolved[0],
            resolved[1],
            league,
            season,
            profile.main_result_slot(),
            Utc::now(),
            stats,
        )
        .map_err(Into::into)
    }

    async fn sync_team(
        &self,
        team_id: RecordId,
        permanent_id: u64,
        season: &GroupRef,
        leagues: &mut BTreeMap<u64, LeagueData>,
        stats: &mut RunStats,
    ) -> Result<()> {
        let profile = &self.config.profile;
        let payload = self
            .client
            .team_matches(permanent_id)
            .await
            .with_context(|| format!("fetching matches for team {permanent_id}"))?;
        stats.api_calls += 1;
        self.client.throttle().await;

        let mut upstream_match_ids = BTreeSet::new();
        let match_total = payload.matches.len() as u64;
        for (index, record) in payload.matches.iter().enumerate() {
            if let Some(match_id) = record.match_id {
                upstream_match_ids.insert(match_id);
            }
            self.progress
                .update_matches(Utc::now(), index as u64 + 1, match_total);
            // One bad record must not end the team sync.
            if let Err(err) = self
                .sync_team_match(record, team_id, season, leagues, stats)
                .await
            {
                self.log.error(format!(
                    "syncing match {:?} failed: {err:#}",
                    record.match_id
                ));
                stats.errors += 1;
            }
        }

        venue::sync_logo(
            &self.store,
            self.client.as_ref(),
            &self.assets,
            team_id,
            Utc::now(),
            profile.logo_ttl_days,
            stats,
        )
        .await;

        dedup::reconcile_orphans(&self.store, team_id, &upstream_match_ids, stats);
        Ok(())
    }

    /// One match of an own team: upsert the event, ingest the boxscore for
    /// played matches, and backfill the venue where it is still missing.
    async fn sync_team_match(
        &self,
        record: &MatchRecord,
        team_id: RecordId,
        season: &GroupRef,
        leagues: &mut BTreeMap<u64, LeagueData>,
        stats: &mut RunStats,
    ) -> Result<()> {
        let profile = &self.config.profile;
        let Some(event_id) = self.ingest_match(record, None, season, leagues, stats)? else {
            return Ok(());
        };

        let event = self
            .store
            .event(event_id)
            .context("event vanished mid-run")?;
        let finished = record.scores().is_some();

        // Boxscore only for played matches that are not flagged done.
        let mut boxscore_venue = None;
        if profile.ingest_boxscores && finished && event.boxscore != IngestFlag::Ingested {
            let boxscore = self
                .client
                .boxscore(record.match_id.unwrap_or_default())
                .await
                .with_context(|| format!("fetching boxscore {:?}", record.match_id))?;
            stats.api_calls += 1;
            self.client.throttle().await;

            roster::ingest_boxscore(
                &self.store,
                event_id,
                &boxscore,
                &profile.stat_mapping,
                team_id,
                &season.slug,
                profile.boxscore_own_teams_only,
                stats,
            )?;
            boxscore_venue = boxscore
                .match_info
                .as_ref()
                .and_then(|info| info.field.as_ref())
                .map(|field| courtsync_source::MatchInfoPayload {
                    field: Some(field.clone()),
                    ..courtsync_source::MatchInfoPayload::default()
                })
                .and_then(|payload| payload.venue());
        }

        // Venue details only exist upstream once the match was played, so
        // upcoming matches keep their empty slot until then.
        if finished && event.venue.is_none() {
            let venue_source = match boxscore_venue {
                Some(venue) => Some(venue),
                None => {
                    let info = self
                        .client
                        .match_info(record.match_id.unwrap_or_default())
                        .await
                        .with_context(|| format!("fetching match info {:?}", record.match_id))?;
                    stats.api_calls += 1;
                    self.client.throttle().await;
                    info.venue()
                }
            };
            if let Some(venue_source) = venue_source {
                let venue_id = venue::sync_venue(
                    &self.store,
                    self.geocoder.as_ref(),
                    &venue_source,
                    stats,
                )
                .await;
                self.client.throttle().await;
                let mut event = self
                    .store
                    .event(event_id)
                    .context("event vanished mid-run")?;
                event.venue = Some(venue_id);
                self.store.update_event(event_id, event)?;
                stats.events_updated += 1;
            }
        }
        Ok(())
    }

    /// League-wide pass: pull the full schedule so opponent-vs-opponent
    /// matches exist locally, and keep the standings container current.
    async fn sync_league(
        &self,
        league_id: u64,
        league: &LeagueData,
        season: &GroupRef,
        stats: &mut RunStats,
    ) -> Result<()> {
        let schedule = self
            .client
            .league_schedule(league_id)
            .await
            .with_context(|| format!("fetching schedule for league {league_id}"))?;
        stats.api_calls += 1;
        self.client.throttle().await;

        let fallback = schedule.league_data.as_ref().unwrap_or(league);
        let mut leagues = BTreeMap::new();
        for record in &schedule.matches {
            match self.ingest_match(record, Some(fallback), season, &mut leagues, stats) {
                Ok(Some(_)) => stats.league_matches_synced += 1,
                Ok(None) => {}
                Err(err) => {
                    self.log.error(format!(
                        "ingesting league match {:?} failed: {err:#}",
                        record.match_id
                    ));
                    stats.errors += 1;
                }
            }
        }

        // Knockout competitions carry no standings.
        if league.table_exists == Some(false) {
            return Ok(());
        }

        let league_group = GroupRef::league(league_id);
        let member_teams: BTreeSet<RecordId> = self
            .store
            .teams()
            .into_iter()
            .filter(|(id, _)| {
                self.store
                    .groups_of(*id, courtsync_core::GroupKind::League)
                    .contains(&league_group)
            })
            .map(|(id, _)| id)
            .collect();
        let title = league
            .league_name
            .clone()
            .unwrap_or_else(|| format!("League {league_id}"));

        match self.store.find_table_by_league_id(league_id) {
            Some(table_id) => {
                let mut table = self
                    .store
                    .table(table_id)
                    .context("table vanished mid-run")?;
                let mut changed = false;
                if table.teams != member_teams {
                    table.teams = member_teams;
                    changed = true;
                }
                if table.title.is_empty() && !title.is_empty() {
                    table.title = title;
                    changed = true;
                }
                if changed {
                    self.store.update_table(table_id, table)?;
                    stats.tables_updated += 1;
                }
            }
            None => {
                let table_id = self.store.insert_table(courtsync_core::TableRecord {
                    league_id,
                    title,
                    teams: member_teams,
                    main_result: String::new(),
                    author: courtsync_core::Author::Sync,
                });
                self.store.tag(table_id, league_group, false);
                self.store.tag(table_id, season.clone(), true);
                stats.tables_created += 1;
            }
        }
        Ok(())
    }

    /// Discovery: list the leagues the club currently plays in, without
    /// writing anything beyond team/event resolution.
    pub async fn discover(&self) -> Result<Vec<LeagueData>> {
        let profile = &self.config.profile;
        let club = self
            .client
            .club_matches(profile.own_club_id, profile.range_days)
            .await
            .context("fetching club matches")?;
        self.client.throttle().await;

        let mut leagues: BTreeMap<u64, LeagueData> = BTreeMap::new();
        for record in &club.matches {
            if let Some(league) = &record.league_data {
                if let Some(league_id) = league.league_id {
                    leagues.entry(league_id).or_insert_with(|| league.clone());
                }
            }
        }
        Ok(leagues.into_values().collect())
    }

    /// Cron-driven background runs, when enabled.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let scheduler = JobScheduler::new().await.context("creating scheduler")?;
        let engine = Arc::clone(self);
        let cron = self.config.sync_cron.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let engine = Arc::clone(&engine);
            Box::pin(async move {
                match engine.spawn_run(RunTrigger::Scheduled) {
                    Ok(run_id) => engine.log.info(format!("scheduled run {run_id} started")),
                    Err(err) => engine.log.warn(format!("scheduled run skipped: {err}")),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        scheduler.add(job).await.context("adding scheduler job")?;
        Ok(Some(scheduler))
    }
}
