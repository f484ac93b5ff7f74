//! End-to-end sync runs against canned upstream payloads.

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use courtsync_core::{EventStatus, IngestFlag, Outcome, RunStats};
use courtsync_engine::{ClubProfile, RunTrigger, StatMapping, SyncConfig, SyncEngine};
use courtsync_source::{
    synthetic_field_id, BoxscorePayload, ClubMatchesPayload, Coordinates, FieldRecord,
    FixtureGeocoder, FixtureSourceClient, LeagueData, LeagueSchedulePayload, MatchBoxscore,
    MatchInfoDetail, MatchInfoPayload, MatchRecord, PersonRef, PlayerRef, PlayerStatLine,
    StatValue, TeamMatchesPayload, TeamRef,
};
use courtsync_storage::MemoryStore;

const OWN_CLUB: u64 = 1234;
const OWN_TEAM_PID: u64 = 100;
const OPPONENT_PID: u64 = 200;
const THIRD_PID: u64 = 300;
const LEAGUE_ID: u64 = 4711;
const PLAYED_MATCH: u64 = 1000;
const UPCOMING_MATCH: u64 = 1001;
const LEAGUE_ONLY_MATCH: u64 = 1002;

fn league_data() -> LeagueData {
    LeagueData {
        league_id: Some(LEAGUE_ID),
        league_name: Some("Bezirksliga Süd".to_string()),
        season_name: Some("2025/2026".to_string()),
        age_group: Some("Senioren".to_string()),
        gender: Some("männlich".to_string()),
        table_exists: Some(true),
    }
}

fn team_ref(pid: u64, club_id: u64, name: &str) -> TeamRef {
    TeamRef {
        team_permanent_id: Some(pid),
        season_team_id: Some(pid + 50_000),
        club_id: Some(club_id),
        team_name: Some(name.to_string()),
        team_name_small: None,
    }
}

fn own_side() -> TeamRef {
    team_ref(OWN_TEAM_PID, OWN_CLUB, "TV Ost")
}

fn opponent_side() -> TeamRef {
    team_ref(OPPONENT_PID, 5678, "SG West")
}

fn match_record(
    match_id: u64,
    home: TeamRef,
    guest: TeamRef,
    date: &str,
    result: Option<&str>,
) -> MatchRecord {
    MatchRecord {
        match_id: Some(match_id),
        home_team: Some(home),
        guest_team: Some(guest),
        kickoff_date: Some(date.to_string()),
        kickoff_time: Some("19:30".to_string()),
        result: result.map(str::to_string),
        cancelled: Some(false),
        forfeit: Some(false),
        result_confirmed: result.map(|_| true),
        match_day: Some(1),
        match_no: Some(format!("M{match_id}")),
        league_data: Some(league_data()),
    }
}

fn own_matches() -> Vec<MatchRecord> {
    vec![
        match_record(
            PLAYED_MATCH,
            own_side(),
            opponent_side(),
            "2026-03-14",
            Some("78:65"),
        ),
        match_record(UPCOMING_MATCH, opponent_side(), own_side(), "2027-03-14", None),
    ]
}

fn boxscore_payload() -> BoxscorePayload {
    let mut values = BTreeMap::new();
    values.insert("points".to_string(), StatValue::Scalar(14));
    values.insert(
        "fieldGoals".to_string(),
        StatValue::Split {
            made: Some(5),
            attempted: Some(11),
        },
    );
    let line = PlayerStatLine {
        player: Some(PlayerRef {
            player_id: Some(7501),
            anonymized: None,
            person: Some(PersonRef {
                id: Some(501),
                first_name: Some("Mia".to_string()),
                last_name: Some("Kurz".to_string()),
                anonymized: None,
            }),
        }),
        jersey_number: Some("12".to_string()),
        values,
    };
    BoxscorePayload {
        statistic_type: Some(1),
        home_team: Some(own_side()),
        guest_team: Some(opponent_side()),
        match_boxscore: Some(MatchBoxscore {
            home_player_stats: vec![line],
            guest_player_stats: vec![],
        }),
        match_info: Some(MatchInfoDetail {
            field: Some(FieldRecord {
                id: Some(818),
                name: Some("Sporthalle Nord".to_string()),
                street: Some("Hallenweg 2".to_string()),
                postal_code: Some("48429".to_string()),
                city: Some("Rheine".to_string()),
            }),
        }),
    }
}

fn seed_client(client: &FixtureSourceClient, own_matches: Vec<MatchRecord>, schedule: Vec<MatchRecord>) {
    client.put_club_matches(
        OWN_CLUB,
        ClubMatchesPayload {
            club: None,
            matches: own_matches.clone(),
        },
    );
    client.put_team_matches(
        OWN_TEAM_PID,
        TeamMatchesPayload {
            team: None,
            matches: own_matches,
        },
    );
    client.put_league_schedule(
        LEAGUE_ID,
        LeagueSchedulePayload {
            league_data: Some(league_data()),
            matches: schedule,
        },
    );
    client.put_boxscore(PLAYED_MATCH, boxscore_payload());
    client.put_logo(OWN_TEAM_PID, b"png-bytes".to_vec());
}

fn full_schedule() -> Vec<MatchRecord> {
    let mut schedule = own_matches();
    schedule.push(match_record(
        LEAGUE_ONLY_MATCH,
        opponent_side(),
        team_ref(THIRD_PID, 9012, "BC Süd"),
        "2026-04-18",
        Some("61:59"),
    ));
    schedule
}

struct Harness {
    engine: Arc<SyncEngine>,
    client: Arc<FixtureSourceClient>,
    geocoder: Arc<FixtureGeocoder>,
    _assets_dir: tempfile::TempDir,
}

fn harness() -> Harness {
    harness_with(|_| {})
}

fn harness_with(tweak: impl FnOnce(&mut ClubProfile)) -> Harness {
    let client = Arc::new(FixtureSourceClient::new());
    seed_client(&client, own_matches(), full_schedule());
    let geocoder = Arc::new(FixtureGeocoder::new(vec![Some(Coordinates {
        latitude: "52.28".to_string(),
        longitude: "7.44".to_string(),
    })]));
    let assets_dir = tempfile::tempdir().expect("tempdir");
    let mut profile = ClubProfile {
        own_club_id: OWN_CLUB,
        season: "2025/2026".to_string(),
        range_days: 365,
        result_slots: vec!["t".to_string()],
        stat_mapping: StatMapping::new(),
        team_ids: Vec::new(),
        ingest_boxscores: true,
        boxscore_own_teams_only: false,
        logo_ttl_days: 180,
    };
    tweak(&mut profile);
    let config = SyncConfig {
        profile,
        assets_dir: assets_dir.path().to_path_buf(),
        scheduler_enabled: false,
        sync_cron: "0 0 6 * * *".to_string(),
        stale_lock_secs: 300,
        progress_ttl_secs: 600,
        poll_staleness_secs: 120,
    };
    let engine = Arc::new(SyncEngine::new(
        config,
        Arc::new(MemoryStore::new()),
        client.clone(),
        geocoder.clone(),
    ));
    Harness {
        engine,
        client,
        geocoder,
        _assets_dir: assets_dir,
    }
}

async fn run(harness: &Harness) -> RunStats {
    harness
        .engine
        .run_once(RunTrigger::Manual)
        .await
        .expect("sync run")
}

#[tokio::test]
async fn first_run_builds_the_full_picture() {
    let h = harness();
    let stats = run(&h).await;
    let store = h.engine.store();

    assert_eq!(stats.teams_created, 3);
    assert_eq!(stats.events_created, 3);
    assert_eq!(stats.players_created, 1);
    assert_eq!(stats.venues_created, 1);
    assert_eq!(stats.tables_created, 1);
    assert_eq!(stats.logos_fetched, 1);
    assert_eq!(stats.leagues_found, 1);
    assert_eq!(stats.league_matches_synced, 3);
    assert_eq!(stats.errors, 0);

    // Played match: result, outcome, boxscore flag and structured venue.
    let event_id = store.find_event_by_match_id(PLAYED_MATCH).expect("event");
    let event = store.event(event_id).expect("event");
    assert_eq!(event.main_result, "78:65");
    assert_eq!(event.status, EventStatus::Published);
    assert_eq!(event.boxscore, IngestFlag::Ingested);
    assert_eq!(event.results[&event.home].outcome, Some(Outcome::Win));
    assert_eq!(event.results[&event.away].outcome, Some(Outcome::Loss));

    let venue_id = event.venue.expect("venue");
    let venue = store.venue(venue_id).expect("venue");
    assert_eq!(venue.field_id, 818);
    assert_eq!(store.attr_str(venue_id, "geo.lat").as_deref(), Some("52.28"));

    let player_id = store.find_player_by_person_id(501).expect("player");
    let line = &event.performance[&event.home][&player_id];
    assert_eq!(line["pts"], "14");
    assert_eq!(line["fgm"], "5");
    assert_eq!(line["fga"], "11");

    // Upcoming match: scheduled, and no venue until it has been played.
    let upcoming_id = store.find_event_by_match_id(UPCOMING_MATCH).expect("event");
    let upcoming = store.event(upcoming_id).expect("event");
    assert_eq!(upcoming.status, EventStatus::Scheduled);
    assert!(upcoming.venue.is_none());

    // Roster and logo landed on the own team.
    let own_team_id = store.find_team_by_permanent_id(OWN_TEAM_PID).expect("team");
    let own_team = store.team(own_team_id).expect("team");
    assert!(own_team.is_own);
    assert!(own_team.logo.is_some());
    let roster_id = store.find_roster(own_team_id, "2025-2026").expect("roster");
    assert!(store.roster(roster_id).expect("roster").players.contains(&player_id));

    // League-only match exists even though the own team plays in neither side.
    assert!(store.find_event_by_match_id(LEAGUE_ONLY_MATCH).is_some());
    let table_id = store.find_table_by_league_id(LEAGUE_ID).expect("table");
    assert_eq!(store.table(table_id).expect("table").teams.len(), 3);
}

#[tokio::test]
async fn second_run_is_idempotent_and_skips_ingested_detail() {
    let h = harness();
    run(&h).await;
    let rerun = run(&h).await;
    let store = h.engine.store();

    assert_eq!(rerun.teams_created, 0);
    // Every pass over an existing record counts: two sides for each of the
    // 2 club + 2 team + 3 league match records.
    assert_eq!(rerun.teams_updated, 14);
    assert_eq!(rerun.events_created, 0);
    assert_eq!(rerun.events_updated, 7);
    assert_eq!(rerun.events_deleted, 0);
    assert_eq!(rerun.players_created, 0);
    assert_eq!(rerun.venues_created, 0);
    assert_eq!(rerun.tables_created, 0);
    assert_eq!(rerun.tables_updated, 0);
    assert_eq!(rerun.logos_fetched, 0);
    assert_eq!(rerun.errors, 0);

    assert_eq!(store.teams().len(), 3);
    assert_eq!(store.events().len(), 3);
    assert_eq!(store.players().len(), 1);

    // Flagged boxscore, assigned venues and the fresh logo cache mean no
    // second detail fetches; the boxscore already carried the venue, so the
    // separate info endpoint was never needed at all.
    assert_eq!(h.client.calls.boxscore.load(Ordering::Relaxed), 1);
    assert_eq!(h.client.calls.match_info.load(Ordering::Relaxed), 0);
    assert_eq!(h.client.calls.team_logo.load(Ordering::Relaxed), 1);
    assert_eq!(h.geocoder.calls.load(Ordering::Relaxed), 1);

    // The cheap list endpoints run every time.
    assert_eq!(h.client.calls.club_matches.load(Ordering::Relaxed), 2);
    assert_eq!(h.client.calls.team_matches.load(Ordering::Relaxed), 2);
    assert_eq!(h.client.calls.league_schedule.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn boxscore_ingestion_can_be_switched_off() {
    let h = harness_with(|profile| profile.ingest_boxscores = false);
    // Without the boxscore detail the played match needs its own info payload
    // for the venue; here the upstream only knows a free-text location.
    h.client.put_match_info(
        PLAYED_MATCH,
        MatchInfoPayload {
            match_info: None,
            field: None,
            location: Some("Grundschule Am Park".to_string()),
        },
    );
    let stats = run(&h).await;
    let store = h.engine.store();

    assert_eq!(h.client.calls.boxscore.load(Ordering::Relaxed), 0);
    // Only the played match gets the info fetch.
    assert_eq!(h.client.calls.match_info.load(Ordering::Relaxed), 1);
    assert_eq!(stats.players_created, 0);
    assert_eq!(stats.errors, 0);
    assert!(store.players().is_empty());

    let event_id = store.find_event_by_match_id(PLAYED_MATCH).expect("event");
    let event = store.event(event_id).expect("event");
    let venue = store.venue(event.venue.expect("venue")).expect("venue");
    assert_eq!(venue.field_id, synthetic_field_id("Grundschule Am Park"));
    // The flag stays open, so turning the switch back on picks the match up.
    assert_eq!(event.boxscore, IngestFlag::Pending);
}

#[tokio::test]
async fn broken_match_detail_does_not_abort_the_run() {
    let h = harness();
    // A third played match whose detail endpoints answer with errors.
    let mut matches = own_matches();
    matches.push(match_record(
        1003,
        own_side(),
        opponent_side(),
        "2026-03-21",
        Some("70:60"),
    ));
    h.client.put_team_matches(
        OWN_TEAM_PID,
        TeamMatchesPayload {
            team: None,
            matches,
        },
    );

    let stats = run(&h).await;
    let store = h.engine.store();

    // The failed boxscore fetch is logged and counted, nothing more.
    assert_eq!(stats.errors, 1);
    assert_eq!(store.events().len(), 4);

    let event_id = store.find_event_by_match_id(1003).expect("event");
    let event = store.event(event_id).expect("event");
    assert_eq!(event.main_result, "70:60");
    assert_eq!(event.boxscore, IngestFlag::Pending);

    // The healthy sibling match was still fully processed.
    let played = store
        .event(store.find_event_by_match_id(PLAYED_MATCH).expect("event"))
        .expect("event");
    assert_eq!(played.boxscore, IngestFlag::Ingested);
    assert!(played.venue.is_some());
}

#[tokio::test]
async fn vanished_upstream_match_deletes_only_the_synced_event() {
    let h = harness();
    run(&h).await;
    let store = h.engine.store();
    assert!(store.find_event_by_match_id(UPCOMING_MATCH).is_some());

    // Upstream drops the upcoming match everywhere.
    let remaining = vec![match_record(
        PLAYED_MATCH,
        own_side(),
        opponent_side(),
        "2026-03-14",
        Some("78:65"),
    )];
    let mut schedule = remaining.clone();
    schedule.push(match_record(
        LEAGUE_ONLY_MATCH,
        opponent_side(),
        team_ref(THIRD_PID, 9012, "BC Süd"),
        "2026-04-18",
        Some("61:59"),
    ));
    seed_client(&h.client, remaining, schedule);

    let stats = run(&h).await;
    assert_eq!(stats.events_deleted, 1);
    assert!(store.find_event_by_match_id(UPCOMING_MATCH).is_none());
    assert!(store.find_event_by_match_id(PLAYED_MATCH).is_some());
    assert!(store.find_event_by_match_id(LEAGUE_ONLY_MATCH).is_some());
}

#[tokio::test]
async fn operator_result_survives_upstream_correction() {
    let h = harness();
    run(&h).await;
    let store = h.engine.store();

    let event_id = store.find_event_by_match_id(PLAYED_MATCH).expect("event");
    let mut event = store.event(event_id).expect("event");
    event.main_result = "80:70".to_string();
    for side in event.results.values_mut() {
        side.slots.insert("t".to_string(), "80".to_string());
    }
    store.update_event(event_id, event).expect("operator edit");

    run(&h).await;
    assert_eq!(
        store.event(event_id).expect("event").main_result,
        "80:70"
    );
}

#[tokio::test]
async fn duplicate_teams_converge_on_the_next_run() {
    let h = harness();
    run(&h).await;
    let store = h.engine.store();
    let original = store.find_team_by_permanent_id(OWN_TEAM_PID).expect("team");

    // A stray duplicate appears (e.g. imported by hand).
    store.insert_team(courtsync_core::Team {
        permanent_id: Some(OWN_TEAM_PID),
        name: "TV Ost (Duplikat)".to_string(),
        ..courtsync_core::Team::default()
    });

    let stats = run(&h).await;
    assert_eq!(stats.teams_deduped, 1);
    assert_eq!(store.teams().len(), 3);
    assert_eq!(store.find_team_by_permanent_id(OWN_TEAM_PID), Some(original));
}

#[tokio::test]
async fn concurrent_run_is_rejected_until_unlocked() {
    let h = harness();
    let claimed = h.engine.progress.try_begin(chrono::Utc::now());
    assert!(claimed.is_ok());

    let err = h.engine.run_once(RunTrigger::Manual).await;
    assert!(err.is_err());

    h.engine.progress.force_clear();
    assert!(h.engine.run_once(RunTrigger::Manual).await.is_ok());
}

#[tokio::test]
async fn run_history_records_completed_runs() {
    let h = harness();
    run(&h).await;
    run(&h).await;

    let history = h.engine.history.recent();
    assert_eq!(history.len(), 2);
    assert!(history.iter().all(|r| r.status == "completed"));
    assert_eq!(history[0].stats.events_created, 0);
    assert_eq!(history[1].stats.events_created, 3);
    assert!(h.engine.last_stats().is_some());
    assert!(!h.engine.log.is_empty());
}
