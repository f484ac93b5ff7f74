//! Venue records, geocoding, and the club-logo asset cache.
//!
//! A venue's address and coordinates live in the store's attribute bag.
//! Geocoding runs at most once per venue: a successful lookup writes the
//! coordinates, a failed one writes a marker so later runs do not retry the
//! same dead address. The street-level query falls back to postal code and
//! city when the precise lookup finds nothing.

use chrono::{DateTime, Duration, Utc};
use courtsync_core::{Author, RecordId, RunStats, Venue};
use courtsync_source::{Geocoder, SourceClient, VenueSource};
use courtsync_storage::{AssetStore, MemoryStore};
use tracing::{debug, warn};

pub const ATTR_STREET: &str = "address.street";
pub const ATTR_POSTAL_CODE: &str = "address.postal_code";
pub const ATTR_CITY: &str = "address.city";
pub const ATTR_LABEL: &str = "address.label";
pub const ATTR_LATITUDE: &str = "geo.lat";
pub const ATTR_LONGITUDE: &str = "geo.lon";
pub const ATTR_GEOCODE_FAILED: &str = "geo.failed";
pub const ATTR_LOGO_FETCHED_AT: &str = "logo.fetched_at";

/// Refetch horizon for cached club logos.
pub const LOGO_TTL_DAYS: i64 = 180;

fn put_attr_once(store: &MemoryStore, id: RecordId, key: &str, value: &str) {
    if value.is_empty() {
        return;
    }
    let existing = store.attr_str(id, key);
    if existing.as_deref().map(|v| !v.is_empty()).unwrap_or(false) {
        return;
    }
    store.put_attr(id, key, value.as_bytes().to_vec());
}

/// Upsert the venue for a normalized upstream source and geocode it when its
/// coordinates are still unknown.
pub async fn sync_venue(
    store: &MemoryStore,
    geocoder: &dyn Geocoder,
    source: &VenueSource,
    stats: &mut RunStats,
) -> RecordId {
    let id = match store.find_venue_by_field_id(source.field_id()) {
        Some(id) => id,
        None => {
            let id = store.insert_venue(Venue {
                field_id: source.field_id(),
                name: source.name().to_string(),
                author: Author::Sync,
            });
            stats.venues_created += 1;
            id
        }
    };

    match source {
        VenueSource::Structured {
            street,
            postal_code,
            city,
            ..
        } => {
            put_attr_once(store, id, ATTR_STREET, street);
            put_attr_once(store, id, ATTR_POSTAL_CODE, postal_code);
            put_attr_once(store, id, ATTR_CITY, city);
        }
        VenueSource::LabelOnly { label, .. } => {
            put_attr_once(store, id, ATTR_LABEL, label);
        }
    }

    let has_coords = store.attr_str(id, ATTR_LATITUDE).is_some();
    let failed_before = store.attr_str(id, ATTR_GEOCODE_FAILED).is_some();
    if has_coords || failed_before {
        return id;
    }
    let Some(query) = source.geocode_query() else {
        return id;
    };

    let first = geocoder.lookup(&query).await;
    geocoder.throttle().await;
    let coords = match first {
        Ok(Some(coords)) => Some(coords),
        Ok(None) if query.street.is_some() => {
            // Street-level miss; retry with just postal code and city.
            let fallback = query.without_street();
            if fallback.is_empty() {
                None
            } else {
                let second = geocoder.lookup(&fallback).await;
                geocoder.throttle().await;
                match second {
                    Ok(coords) => coords,
                    Err(err) => {
                        warn!(venue = source.name(), %err, "geocode fallback failed");
                        stats.errors += 1;
                        return id;
                    }
                }
            }
        }
        Ok(None) => None,
        Err(err) => {
            warn!(venue = source.name(), %err, "geocode lookup failed");
            stats.errors += 1;
            return id;
        }
    };

    match coords {
        Some(coords) => {
            store.put_attr(id, ATTR_LATITUDE, coords.latitude.into_bytes());
            store.put_attr(id, ATTR_LONGITUDE, coords.longitude.into_bytes());
            stats.venues_updated += 1;
        }
        None => {
            debug!(venue = source.name(), "address did not geocode; not retrying");
            store.put_attr(id, ATTR_GEOCODE_FAILED, b"1".to_vec());
        }
    }
    id
}

/// Fetch and cache the club logo for a team, at most once per TTL window.
pub async fn sync_logo(
    store: &MemoryStore,
    client: &dyn SourceClient,
    assets: &AssetStore,
    team_id: RecordId,
    now: DateTime<Utc>,
    ttl_days: i64,
    stats: &mut RunStats,
) {
    let Some(mut team) = store.team(team_id) else {
        return;
    };
    let Some(permanent_id) = team.permanent_id else {
        return;
    };

    if let Some(fetched_at) = store
        .attr_str(team_id, ATTR_LOGO_FETCHED_AT)
        .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
    {
        if now - fetched_at.with_timezone(&Utc) < Duration::days(ttl_days) {
            return;
        }
    }

    let fetched = client.team_logo(permanent_id).await;
    stats.api_calls += 1;
    client.throttle().await;
    let bytes = match fetched {
        Ok(bytes) => bytes,
        Err(err) => {
            debug!(team = %team.name, %err, "logo fetch failed");
            stats.errors += 1;
            // Remember the attempt so a missing logo is not refetched every run.
            store.put_attr(
                team_id,
                ATTR_LOGO_FETCHED_AT,
                now.to_rfc3339().into_bytes(),
            );
            return;
        }
    };

    let scope = format!("club-{}", team.club_id.unwrap_or(permanent_id));
    match assets.store_bytes(&scope, "png", &bytes).await {
        Ok(stored) => {
            let path = stored.relative_path.display().to_string();
            if team.logo.as_deref() != Some(path.as_str()) {
                team.logo = Some(path);
                if let Err(err) = store.update_team(team_id, team) {
                    warn!(%err, "storing logo path failed");
                    stats.errors += 1;
                    return;
                }
            }
            store.put_attr(
                team_id,
                ATTR_LOGO_FETCHED_AT,
                now.to_rfc3339().into_bytes(),
            );
            stats.logos_fetched += 1;
        }
        Err(err) => {
            warn!(%err, "writing logo asset failed");
            stats.errors += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courtsync_core::Team;
    use courtsync_source::{
        synthetic_field_id, Coordinates, FixtureGeocoder, FixtureSourceClient,
    };
    use std::sync::atomic::Ordering;
    use tempfile::tempdir;

    fn structured() -> VenueSource {
        VenueSource::Structured {
            field_id: 818,
            name: "Sporthalle Nord".to_string(),
            street: "Hallenweg 2".to_string(),
            postal_code: "48429".to_string(),
            city: "Rheine".to_string(),
        }
    }

    fn coords(lat: &str, lon: &str) -> Coordinates {
        Coordinates {
            latitude: lat.to_string(),
            longitude: lon.to_string(),
        }
    }

    #[tokio::test]
    async fn venue_is_created_and_geocoded_once() {
        let store = MemoryStore::new();
        let mut stats = RunStats::default();
        let geocoder = FixtureGeocoder::new(vec![Some(coords("52.28", "7.44"))]);

        let id = sync_venue(&store, &geocoder, &structured(), &mut stats).await;
        assert_eq!(stats.venues_created, 1);
        assert_eq!(store.attr_str(id, ATTR_LATITUDE).as_deref(), Some("52.28"));
        assert_eq!(store.attr_str(id, ATTR_STREET).as_deref(), Some("Hallenweg 2"));

        // Second sync finds the venue, and never geocodes again.
        let again = sync_venue(&store, &geocoder, &structured(), &mut stats).await;
        assert_eq!(again, id);
        assert_eq!(geocoder.calls.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn street_miss_falls_back_to_city() {
        let store = MemoryStore::new();
        let mut stats = RunStats::default();
        let geocoder = FixtureGeocoder::new(vec![None, Some(coords("52.28", "7.44"))]);

        let id = sync_venue(&store, &geocoder, &structured(), &mut stats).await;
        assert_eq!(geocoder.calls.load(Ordering::Relaxed), 2);
        // Back-to-back lookups are separated by the geocoder's pause.
        assert_eq!(geocoder.pauses.load(Ordering::Relaxed), 2);
        assert!(store.attr_str(id, ATTR_LATITUDE).is_some());
    }

    #[tokio::test]
    async fn failed_geocode_is_not_retried() {
        let store = MemoryStore::new();
        let mut stats = RunStats::default();
        let geocoder = FixtureGeocoder::new(vec![None, None]);

        let id = sync_venue(&store, &geocoder, &structured(), &mut stats).await;
        assert!(store.attr_str(id, ATTR_GEOCODE_FAILED).is_some());
        assert_eq!(geocoder.calls.load(Ordering::Relaxed), 2);

        sync_venue(&store, &geocoder, &structured(), &mut stats).await;
        assert_eq!(geocoder.calls.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn label_only_venue_never_geocodes() {
        let store = MemoryStore::new();
        let mut stats = RunStats::default();
        let geocoder = FixtureGeocoder::new(vec![Some(coords("0", "0"))]);
        let source = VenueSource::LabelOnly {
            field_id: synthetic_field_id("Grundschule Am Park"),
            label: "Grundschule Am Park".to_string(),
        };

        let id = sync_venue(&store, &geocoder, &source, &mut stats).await;
        assert_eq!(geocoder.calls.load(Ordering::Relaxed), 0);
        assert_eq!(
            store.attr_str(id, ATTR_LABEL).as_deref(),
            Some("Grundschule Am Park")
        );
        assert_eq!(store.venue(id).expect("venue").name, "Grundschule Am Park");
    }

    #[tokio::test]
    async fn logo_is_cached_for_the_ttl_window() {
        let store = MemoryStore::new();
        let mut stats = RunStats::default();
        let dir = tempdir().expect("tempdir");
        let assets = AssetStore::new(dir.path());
        let client = FixtureSourceClient::new();
        client.put_logo(99, b"png-bytes".to_vec());

        let team_id = store.insert_team(Team {
            permanent_id: Some(99),
            club_id: Some(1234),
            name: "TV Ost".to_string(),
            is_own: true,
            ..Team::default()
        });

        let now = Utc::now();
        sync_logo(&store, &client, &assets, team_id, now, LOGO_TTL_DAYS, &mut stats).await;
        assert_eq!(stats.logos_fetched, 1);
        assert!(store.team(team_id).expect("team").logo.is_some());

        // A fresh cache entry suppresses the refetch.
        sync_logo(&store, &client, &assets, team_id, now, LOGO_TTL_DAYS, &mut stats).await;
        assert_eq!(client.calls.team_logo.load(Ordering::Relaxed), 1);

        // The TTL expiring reopens the fetch.
        let later = now + Duration::days(LOGO_TTL_DAYS + 1);
        sync_logo(&store, &client, &assets, team_id, later, LOGO_TTL_DAYS, &mut stats).await;
        assert_eq!(client.calls.team_logo.load(Ordering::Relaxed), 2);
    }

    #[tokio::test]
    async fn missing_logo_counts_the_attempt() {
        let store = MemoryStore::new();
        let mut stats = RunStats::default();
        let dir = tempdir().expect("tempdir");
        let assets = AssetStore::new(dir.path());
        // No logo seeded for this club.
        let client = FixtureSourceClient::new();

        let team_id = store.insert_team(Team {
            permanent_id: Some(99),
            name: "TV Ost".to_string(),
            is_own: true,
            ..Team::default()
        });

        sync_logo(&store, &client, &assets, team_id, Utc::now(), LOGO_TTL_DAYS, &mut stats).await;

        assert_eq!(stats.api_calls, 1);
        assert_eq!(stats.errors, 1);
        assert_eq!(stats.logos_fetched, 0);
        // The attempt is remembered so the dead logo is not refetched.
        assert!(store.attr_str(team_id, ATTR_LOGO_FETCHED_AT).is_some());
        sync_logo(&store, &client, &assets, team_id, Utc::now(), LOGO_TTL_DAYS, &mut stats).await;
        assert_eq!(client.calls.team_logo.load(Ordering::Relaxed), 1);
    }
}
