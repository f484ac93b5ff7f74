//! Source client for the upstream league REST API.
//!
//! All wire shapes are decoded here so the sync engine only ever sees
//! normalized types: the success envelope is unwrapped, the two venue
//! response shapes collapse into one [`VenueSource`], and heterogeneous
//! statistic fields become [`StatValue`] variants. Every fetch is fallible
//! and callers must follow each network call with [`SourceClient::throttle`].

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tracing::{debug, warn};

pub const CRATE_NAME: &str = "courtsync-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding payload: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("upstream error: {0}")]
    Api(String),
    #[error("no fixture for {0}")]
    MissingFixture(String),
}

/// Upstream success envelope: `status` "0" means success, anything else is an
/// application error carried inside an otherwise 200 response.
#[derive(Debug, Clone, Deserialize)]
struct Envelope<T> {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    message: Option<String>,
    data: Option<T>,
}

fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T, SourceError> {
    match envelope.status.as_deref() {
        Some("0") => envelope
            .data
            .ok_or_else(|| SourceError::Api("success envelope without data".to_string())),
        _ => Err(SourceError::Api(
            envelope
                .message
                .unwrap_or_else(|| "unknown upstream error".to_string()),
        )),
    }
}

// ── wire model ──

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LeagueData {
    #[serde(default)]
    pub league_id: Option<u64>,
    #[serde(default)]
    pub league_name: Option<String>,
    #[serde(default)]
    pub season_name: Option<String>,
    #[serde(default)]
    pub age_group: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    /// `Some(false)` marks a knockout competition without a standings view.
    /// `None` means unknown and is treated as table-bearing.
    #[serde(default)]
    pub table_exists: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TeamRef {
    #[serde(default)]
    pub team_permanent_id: Option<u64>,
    #[serde(default)]
    pub season_team_id: Option<u64>,
    #[serde(default)]
    pub club_id: Option<u64>,
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub team_name_small: Option<String>,
}

impl TeamRef {
    pub fn name(&self) -> &str {
        self.team_name.as_deref().unwrap_or("?")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MatchRecord {
    #[serde(default)]
    pub match_id: Option<u64>,
    #[serde(default)]
    pub home_team: Option<TeamRef>,
    #[serde(default)]
    pub guest_team: Option<TeamRef>,
    #[serde(default)]
    pub kickoff_date: Option<String>,
    #[serde(default)]
    pub kickoff_time: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    #[serde(default)]
    pub cancelled: Option<bool>,
    #[serde(default)]
    pub forfeit: Option<bool>,
    #[serde(default)]
    pub result_confirmed: Option<bool>,
    #[serde(default)]
    pub match_day: Option<u32>,
    #[serde(default)]
    pub match_no: Option<String>,
    #[serde(default)]
    pub league_data: Option<LeagueData>,
}

impl MatchRecord {
    /// Combined kickoff timestamp; time defaults to midnight when absent.
    pub fn kickoff(&self) -> Option<DateTime<Utc>> {
        let date = NaiveDate::parse_from_str(self.kickoff_date.as_deref()?, "%Y-%m-%d").ok()?;
        let time = self
            .kickoff_time
            .as_deref()
            .and_then(|t| NaiveTime::parse_from_str(t, "%H:%M").ok())
            .unwrap_or_else(|| NaiveTime::from_hms_opt(0, 0, 0).unwrap_or_default());
        Some(Utc.from_utc_datetime(&date.and_time(time)))
    }

    /// Parses a "78:65" result string into (home, guest) scores.
    pub fn scores(&self) -> Option<(i64, i64)> {
        let raw = self.result.as_deref()?;
        let (home, guest) = raw.split_once(':')?;
        Some((home.trim().parse().ok()?, guest.trim().parse().ok()?))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClubInfo {
    #[serde(default)]
    pub club_id: Option<u64>,
    #[serde(default)]
    pub club_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ClubMatchesPayload {
    #[serde(default)]
    pub club: Option<ClubInfo>,
    #[serde(default)]
    pub matches: Vec<MatchRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TeamMeta {
    #[serde(default)]
    pub team_name: Option<String>,
    #[serde(default)]
    pub age_group: Option<String>,
    #[serde(default)]
    pub gender: Option<String>,
    #[serde(default)]
    pub team_number: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct TeamMatchesPayload {
    #[serde(default)]
    pub team: Option<TeamMeta>,
    #[serde(default)]
    pub matches: Vec<MatchRecord>,
}

/// League-wide fixture list. League data arrives once at the top level and is
/// injected per match by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LeagueSchedulePayload {
    #[serde(default)]
    pub league_data: Option<LeagueData>,
    #[serde(default)]
    pub matches: Vec<MatchRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct FieldRecord {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub street: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MatchInfoDetail {
    #[serde(default)]
    pub field: Option<FieldRecord>,
}

/// The match-info endpoint answers in two shapes: leagues with managed venues
/// return a structured `field` record (nested under `matchInfo` or flat),
/// while entry-level leagues return only a free-text `location` label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MatchInfoPayload {
    #[serde(default)]
    pub match_info: Option<MatchInfoDetail>,
    #[serde(default)]
    pub field: Option<FieldRecord>,
    #[serde(default)]
    pub location: Option<String>,
}

impl MatchInfoPayload {
    pub fn venue(&self) -> Option<VenueSource> {
        let structured = self
            .match_info
            .as_ref()
            .and_then(|d| d.field.as_ref())
            .or(self.field.as_ref());
        if let Some(field) = structured {
            if let Some(id) = field.id {
                return Some(VenueSource::Structured {
                    field_id: id,
                    name: field
                        .name
                        .clone()
                        .unwrap_or_else(|| format!("Field {id}")),
                    street: field.street.clone().unwrap_or_default(),
                    postal_code: field.postal_code.clone().unwrap_or_default(),
                    city: field.city.clone().unwrap_or_default(),
                });
            }
        }
        let label = self.location.as_deref()?.trim();
        if label.is_empty() {
            return None;
        }
        Some(VenueSource::LabelOnly {
            field_id: synthetic_field_id(label),
            label: label.to_string(),
        })
    }
}

/// Normalized venue identity handed to the engine regardless of which wire
/// shape the upstream used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VenueSource {
    Structured {
        field_id: u64,
        name: String,
        street: String,
        postal_code: String,
        city: String,
    },
    LabelOnly {
        field_id: u64,
        label: String,
    },
}

impl VenueSource {
    pub fn field_id(&self) -> u64 {
        match self {
            VenueSource::Structured { field_id, .. } | VenueSource::LabelOnly { field_id, .. } => {
                *field_id
            }
        }
    }

    pub fn name(&self) -> &str {
        match self {
            VenueSource::Structured { name, .. } => name,
            VenueSource::LabelOnly { label, .. } => label,
        }
    }

    /// Single-line display address; empty for label-only venues.
    pub fn address(&self) -> String {
        match self {
            VenueSource::Structured {
                street,
                postal_code,
                city,
                ..
            } => {
                let locality = format!("{postal_code} {city}").trim().to_string();
                [street.as_str(), locality.as_str()]
                    .iter()
                    .filter(|part| !part.is_empty())
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            }
            VenueSource::LabelOnly { .. } => String::new(),
        }
    }

    pub fn geocode_query(&self) -> Option<GeocodeQuery> {
        match self {
            VenueSource::Structured {
                street,
                postal_code,
                city,
                ..
            } => {
                let query = GeocodeQuery {
                    street: non_empty(street),
                    postal_code: non_empty(postal_code),
                    city: non_empty(city),
                };
                (!query.is_empty()).then_some(query)
            }
            VenueSource::LabelOnly { .. } => None,
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

/// Deterministic key for venues that only exist as a free-text label, so
/// repeated syncs recognize the same venue. First eight bytes of the label's
/// SHA-256, big-endian.
pub fn synthetic_field_id(label: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(label.trim().to_lowercase().as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(bytes)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PersonRef {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
    #[serde(default)]
    pub anonymized: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRef {
    #[serde(default)]
    pub player_id: Option<u64>,
    #[serde(default)]
    pub anonymized: Option<bool>,
    #[serde(default)]
    pub person: Option<PersonRef>,
}

impl PlayerRef {
    pub fn full_name(&self) -> String {
        let person = self.person.as_ref();
        let first = person.and_then(|p| p.first_name.as_deref()).unwrap_or("");
        let last = person.and_then(|p| p.last_name.as_deref()).unwrap_or("");
        format!("{first} {last}").trim().to_string()
    }

    pub fn person_id(&self) -> Option<u64> {
        self.person.as_ref().and_then(|p| p.id)
    }

    /// Identity-suppressed entries are never materialized locally.
    pub fn is_anonymized(&self) -> bool {
        self.anonymized.unwrap_or(false)
            || self
                .person
                .as_ref()
                .and_then(|p| p.anonymized)
                .unwrap_or(false)
    }
}

/// One statistic field as it arrives on the wire: a plain number, a
/// made/attempted pair, an explicit null, or something unexpected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatValue {
    Split {
        #[serde(default)]
        made: Option<i64>,
        #[serde(default)]
        attempted: Option<i64>,
    },
    Scalar(i64),
    Null,
    Other(serde_json::Value),
}

impl StatValue {
    pub fn scalar(&self) -> Option<i64> {
        match self {
            StatValue::Scalar(value) => Some(*value),
            _ => None,
        }
    }

    pub fn split(&self) -> Option<(Option<i64>, Option<i64>)> {
        match self {
            StatValue::Split { made, attempted } => Some((*made, *attempted)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlayerStatLine {
    #[serde(default)]
    pub player: Option<PlayerRef>,
    #[serde(default, rename = "no")]
    pub jersey_number: Option<String>,
    /// Remaining fields are statistic values keyed by upstream field name.
    #[serde(flatten)]
    pub values: BTreeMap<String, StatValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct MatchBoxscore {
    #[serde(default)]
    pub home_player_stats: Vec<PlayerStatLine>,
    #[serde(default)]
    pub guest_player_stats: Vec<PlayerStatLine>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct BoxscorePayload {
    #[serde(default)]
    pub statistic_type: Option<u32>,
    #[serde(default)]
    pub home_team: Option<TeamRef>,
    #[serde(default)]
    pub guest_team: Option<TeamRef>,
    /// Absent for entry-level leagues that never record player statistics.
    #[serde(default)]
    pub match_boxscore: Option<MatchBoxscore>,
    #[serde(default)]
    pub match_info: Option<MatchInfoDetail>,
}

// ── client contract ──

#[async_trait]
pub trait SourceClient: Send + Sync {
    async fn club_matches(
        &self,
        club_id: u64,
        range_days: u32,
    ) -> Result<ClubMatchesPayload, SourceError>;

    async fn team_matches(&self, permanent_id: u64) -> Result<TeamMatchesPayload, SourceError>;

    async fn league_schedule(&self, league_id: u64) -> Result<LeagueSchedulePayload, SourceError>;

    async fn match_info(&self, match_id: u64) -> Result<MatchInfoPayload, SourceError>;

    async fn boxscore(&self, match_id: u64) -> Result<BoxscorePayload, SourceError>;

    async fn team_logo(&self, permanent_id: u64) -> Result<Vec<u8>, SourceError>;

    /// Rate-limit pause; must be called after every fetch.
    async fn throttle(&self);
}

/// Minimum-interval limiter for the upstream's informal one-request-per-second
/// limit.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    last: AsyncMutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: AsyncMutex::new(None),
        }
    }

    pub async fn pause(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.interval {
                tokio::time::sleep(self.interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct SourceConfig {
    pub base_url: String,
    pub media_base_url: String,
    pub user_agent: String,
    pub timeout: Duration,
    pub throttle_interval: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://www.basketball-bund.net/rest".to_string(),
            media_base_url: "https://www.basketball-bund.net/media".to_string(),
            user_agent: "courtsync/0.1".to_string(),
            timeout: Duration::from_secs(30),
            throttle_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
pub struct HttpSourceClient {
    client: reqwest::Client,
    config: SourceConfig,
    limiter: RateLimiter,
}

impl HttpSourceClient {
    pub fn new(config: SourceConfig) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        let limiter = RateLimiter::new(config.throttle_interval);
        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, SourceError> {
        let url = format!("{}{}", self.config.base_url, path);
        debug!(%url, "source fetch");

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), %url, "source fetch failed");
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        let body = response.bytes().await?;
        let envelope: Envelope<T> = serde_json::from_slice(&body)?;
        unwrap_envelope(envelope)
    }
}

#[async_trait]
impl SourceClient for HttpSourceClient {
    async fn club_matches(
        &self,
        club_id: u64,
        range_days: u32,
    ) -> Result<ClubMatchesPayload, SourceError> {
        self.get_json(&format!(
            "/club/id/{club_id}/actualmatches?justHome=false&rangeDays={range_days}"
        ))
        .await
    }

    async fn team_matches(&self, permanent_id: u64) -> Result<TeamMatchesPayload, SourceError> {
        self.get_json(&format!("/team/id/{permanent_id}/matches"))
            .await
    }

    async fn league_schedule(&self, league_id: u64) -> Result<LeagueSchedulePayload, SourceError> {
        self.get_json(&format!("/competition/schedule/id/{league_id}"))
            .await
    }

    async fn match_info(&self, match_id: u64) -> Result<MatchInfoPayload, SourceError> {
        self.get_json(&format!("/match/id/{match_id}/matchInfo"))
            .await
    }

    async fn boxscore(&self, match_id: u64) -> Result<BoxscorePayload, SourceError> {
        self.get_json(&format!("/match/id/{match_id}/boxscore"))
            .await
    }

    async fn team_logo(&self, permanent_id: u64) -> Result<Vec<u8>, SourceError> {
        let url = format!("{}/team/{permanent_id}/logo", self.config.media_base_url);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url,
            });
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn throttle(&self) {
        self.limiter.pause().await;
    }
}

// ── geocoding ──

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GeocodeQuery {
    pub street: Option<String>,
    pub postal_code: Option<String>,
    pub city: Option<String>,
}

impl GeocodeQuery {
    pub fn is_empty(&self) -> bool {
        self.street.is_none() && self.postal_code.is_none() && self.city.is_none()
    }

    /// Coarser fallback query when a street-level lookup comes back empty.
    pub fn without_street(&self) -> Self {
        Self {
            street: None,
            postal_code: self.postal_code.clone(),
            city: self.city.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinates {
    pub latitude: String,
    pub longitude: String,
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn lookup(&self, query: &GeocodeQuery) -> Result<Option<Coordinates>, SourceError>;

    /// Pause between consecutive lookups. No-op by default.
    async fn throttle(&self) {}
}

#[derive(Debug, Clone, Deserialize)]
struct NominatimHit {
    lat: String,
    lon: String,
}

/// Nominatim (OpenStreetMap) structured-query geocoder. Free and keyless;
/// its usage policy allows at most one request per second, enforced by the
/// built-in limiter.
#[derive(Debug)]
pub struct NominatimGeocoder {
    client: reqwest::Client,
    endpoint: String,
    country_codes: String,
    limiter: RateLimiter,
}

impl NominatimGeocoder {
    pub fn new(
        endpoint: impl Into<String>,
        country_codes: impl Into<String>,
        user_agent: &str,
    ) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(user_agent.to_string())
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            country_codes: country_codes.into(),
            limiter: RateLimiter::new(Duration::from_secs(1)),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn lookup(&self, query: &GeocodeQuery) -> Result<Option<Coordinates>, SourceError> {
        let mut params: Vec<(&str, String)> = vec![
            ("format", "json".to_string()),
            ("countrycodes", self.country_codes.clone()),
            ("limit", "1".to_string()),
        ];
        if let Some(street) = &query.street {
            params.push(("street", street.clone()));
        }
        if let Some(postal_code) = &query.postal_code {
            params.push(("postalcode", postal_code.clone()));
        }
        if let Some(city) = &query.city {
            params.push(("city", city.clone()));
        }

        let response = self.client.get(&self.endpoint).query(&params).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(SourceError::HttpStatus {
                status: status.as_u16(),
                url: self.endpoint.clone(),
            });
        }
        let hits: Vec<NominatimHit> = response.json().await?;
        Ok(hits.into_iter().next().map(|hit| Coordinates {
            latitude: hit.lat,
            longitude: hit.lon,
        }))
    }

    async fn throttle(&self) {
        self.limiter.pause().await;
    }
}

// ── fixture clients for tests and offline runs ──

#[derive(Debug, Default)]
pub struct FixtureCallCounts {
    pub club_matches: AtomicU64,
    pub team_matches: AtomicU64,
    pub league_schedule: AtomicU64,
    pub match_info: AtomicU64,
    pub boxscore: AtomicU64,
    pub team_logo: AtomicU64,
}

impl FixtureCallCounts {
    pub fn total(&self) -> u64 {
        self.club_matches.load(Ordering::Relaxed)
            + self.team_matches.load(Ordering::Relaxed)
            + self.league_schedule.load(Ordering::Relaxed)
            + self.match_info.load(Ordering::Relaxed)
            + self.boxscore.load(Ordering::Relaxed)
            + self.team_logo.load(Ordering::Relaxed)
    }
}

/// Canned-payload source client. Counts every fetch so tests can assert how
/// many network calls a sync pass would have issued.
#[derive(Debug, Default)]
pub struct FixtureSourceClient {
    club_matches: Mutex<HashMap<u64, ClubMatchesPayload>>,
    team_matches: Mutex<HashMap<u64, TeamMatchesPayload>>,
    league_schedules: Mutex<HashMap<u64, LeagueSchedulePayload>>,
    match_infos: Mutex<HashMap<u64, MatchInfoPayload>>,
    boxscores: Mutex<HashMap<u64, BoxscorePayload>>,
    logos: Mutex<HashMap<u64, Vec<u8>>>,
    pub calls: FixtureCallCounts,
}

impl FixtureSourceClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn guard<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put_club_matches(&self, club_id: u64, payload: ClubMatchesPayload) {
        Self::guard(&self.club_matches).insert(club_id, payload);
    }

    pub fn put_team_matches(&self, permanent_id: u64, payload: TeamMatchesPayload) {
        Self::guard(&self.team_matches).insert(permanent_id, payload);
    }

    pub fn put_league_schedule(&self, league_id: u64, payload: LeagueSchedulePayload) {
        Self::guard(&self.league_schedules).insert(league_id, payload);
    }

    pub fn put_match_info(&self, match_id: u64, payload: MatchInfoPayload) {
        Self::guard(&self.match_infos).insert(match_id, payload);
    }

    pub fn put_boxscore(&self, match_id: u64, payload: BoxscorePayload) {
        Self::guard(&self.boxscores).insert(match_id, payload);
    }

    pub fn put_logo(&self, permanent_id: u64, bytes: Vec<u8>) {
        Self::guard(&self.logos).insert(permanent_id, bytes);
    }
}

#[async_trait]
impl SourceClient for FixtureSourceClient {
    async fn club_matches(
        &self,
        club_id: u64,
        _range_days: u32,
    ) -> Result<ClubMatchesPayload, SourceError> {
        self.calls.club_matches.fetch_add(1, Ordering::Relaxed);
        Self::guard(&self.club_matches)
            .get(&club_id)
            .cloned()
            .ok_or_else(|| SourceError::MissingFixture(format!("club {club_id}")))
    }

    async fn team_matches(&self, permanent_id: u64) -> Result<TeamMatchesPayload, SourceError> {
        self.calls.team_matches.fetch_add(1, Ordering::Relaxed);
        Self::guard(&self.team_matches)
            .get(&permanent_id)
            .cloned()
            .ok_or_else(|| SourceError::MissingFixture(format!("team {permanent_id}")))
    }

    async fn league_schedule(&self, league_id: u64) -> Result<LeagueSchedulePayload, SourceError> {
        self.calls.league_schedule.fetch_add(1, Ordering::Relaxed);
        Self::guard(&self.league_schedules)
            .get(&league_id)
            .cloned()
            .ok_or_else(|| SourceError::MissingFixture(format!("league {league_id}")))
    }

    async fn match_info(&self, match_id: u64) -> Result<MatchInfoPayload, SourceError> {
        self.calls.match_info.fetch_add(1, Ordering::Relaxed);
        Self::guard(&self.match_infos)
            .get(&match_id)
            .cloned()
            .ok_or_else(|| SourceError::MissingFixture(format!("match info {match_id}")))
    }

    async fn boxscore(&self, match_id: u64) -> Result<BoxscorePayload, SourceError> {
        self.calls.boxscore.fetch_add(1, Ordering::Relaxed);
        Self::guard(&self.boxscores)
            .get(&match_id)
            .cloned()
            .ok_or_else(|| SourceError::MissingFixture(format!("boxscore {match_id}")))
    }

    async fn team_logo(&self, permanent_id: u64) -> Result<Vec<u8>, SourceError> {
        self.calls.team_logo.fetch_add(1, Ordering::Relaxed);
        Self::guard(&self.logos)
            .get(&permanent_id)
            .cloned()
            .ok_or_else(|| SourceError::MissingFixture(format!("logo {permanent_id}")))
    }

    async fn throttle(&self) {}
}

/// Scripted geocoder: answers queries from a queue, recording each call and
/// each throttle pause.
#[derive(Debug, Default)]
pub struct FixtureGeocoder {
    responses: Mutex<VecDeque<Option<Coordinates>>>,
    pub calls: AtomicU64,
    pub pauses: AtomicU64,
}

impl FixtureGeocoder {
    pub fn new(responses: Vec<Option<Coordinates>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: AtomicU64::new(0),
            pauses: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Geocoder for FixtureGeocoder {
    async fn lookup(&self, _query: &GeocodeQuery) -> Result<Option<Coordinates>, SourceError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let mut responses = self.responses.lock().unwrap_or_else(|e| e.into_inner());
        Ok(responses.pop_front().flatten())
    }

    async fn throttle(&self) {
        self.pauses.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_status_zero_is_success() {
        let body = r#"{"status":"0","data":{"matches":[]}}"#;
        let envelope: Envelope<TeamMatchesPayload> =
            serde_json::from_str(body).expect("decode envelope");
        let payload = unwrap_envelope(envelope).expect("success");
        assert!(payload.matches.is_empty());
    }

    #[test]
    fn envelope_error_carries_message() {
        let body = r#"{"status":"1","message":"team unknown"}"#;
        let envelope: Envelope<TeamMatchesPayload> =
            serde_json::from_str(body).expect("decode envelope");
        let err = unwrap_envelope(envelope).expect_err("failure");
        assert!(matches!(err, SourceError::Api(msg) if msg == "team unknown"));
    }

    #[test]
    fn structured_match_info_wins_over_label() {
        let payload: MatchInfoPayload = serde_json::from_str(
            r#"{"matchInfo":{"field":{"id":818,"name":"Sporthalle Nord","street":"Hallenweg 2","postalCode":"48429","city":"Rheine"}},"location":"ignored"}"#,
        )
        .expect("decode");
        let venue = payload.venue().expect("venue");
        assert_eq!(venue.field_id(), 818);
        assert_eq!(venue.address(), "Hallenweg 2, 48429 Rheine");
    }

    #[test]
    fn label_only_match_info_gets_synthetic_key() {
        let payload: MatchInfoPayload =
            serde_json::from_str(r#"{"location":"Grundschule Am Park"}"#).expect("decode");
        let venue = payload.venue().expect("venue");
        assert_eq!(venue.field_id(), synthetic_field_id("Grundschule Am Park"));
        assert_eq!(venue.name(), "Grundschule Am Park");
        assert!(venue.address().is_empty());
        assert!(venue.geocode_query().is_none());
    }

    #[test]
    fn synthetic_key_is_stable_across_case_and_whitespace() {
        assert_eq!(
            synthetic_field_id(" Grundschule Am Park "),
            synthetic_field_id("grundschule am park")
        );
    }

    #[test]
    fn stat_values_decode_scalars_splits_and_nulls() {
        let line: PlayerStatLine = serde_json::from_str(
            r#"{"player":{"playerId":7,"person":{"id":501,"firstName":"Mia","lastName":"Kurz"}},"no":"12","points":0,"fieldGoals":{"made":4,"attempted":9},"minutes":null}"#,
        )
        .expect("decode");
        assert_eq!(line.values.get("points").and_then(StatValue::scalar), Some(0));
        assert_eq!(
            line.values.get("fieldGoals").and_then(StatValue::split),
            Some((Some(4), Some(9)))
        );
        assert_eq!(line.values.get("minutes"), Some(&StatValue::Null));
        assert_eq!(line.player.as_ref().map(|p| p.full_name()).as_deref(), Some("Mia Kurz"));
    }

    #[test]
    fn kickoff_combines_date_and_time() {
        let record = MatchRecord {
            kickoff_date: Some("2026-03-14".to_string()),
            kickoff_time: Some("19:30".to_string()),
            ..MatchRecord::default()
        };
        let kickoff = record.kickoff().expect("kickoff");
        assert_eq!(kickoff.to_rfc3339(), "2026-03-14T19:30:00+00:00");
    }

    #[test]
    fn scores_parse_result_string() {
        let record = MatchRecord {
            result: Some("78:65".to_string()),
            ..MatchRecord::default()
        };
        assert_eq!(record.scores(), Some((78, 65)));
        let bad = MatchRecord {
            result: Some("annulled".to_string()),
            ..MatchRecord::default()
        };
        assert_eq!(bad.scores(), None);
    }

    #[tokio::test]
    async fn fixture_client_counts_calls() {
        let client = FixtureSourceClient::new();
        client.put_team_matches(100, TeamMatchesPayload::default());
        client.team_matches(100).await.expect("payload");
        assert!(client.team_matches(999).await.is_err());
        assert_eq!(client.calls.team_matches.load(Ordering::Relaxed), 2);
        assert_eq!(client.calls.total(), 2);
    }
}
