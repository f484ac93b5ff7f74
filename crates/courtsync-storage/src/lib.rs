//! Record store and asset storage for courtsync.
//!
//! The record store keeps the locally owned league records (teams, events,
//! players, venues, rosters, tables) with per-call atomicity and no cross-call
//! transactions, plus the league/season grouping terms and a key→blob
//! attribute bag. The asset store keeps fetched binaries (club logos)
//! immutably under hash-addressed paths.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use anyhow::Context;
use courtsync_core::{
    EntityKind, Event, GroupKind, GroupRef, Player, RecordId, Roster, TableRecord, Team, Venue,
};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const CRATE_NAME: &str = "courtsync-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: RecordId },
}

#[derive(Debug, Default)]
struct Records {
    next_id: u64,
    teams: BTreeMap<RecordId, Team>,
    events: BTreeMap<RecordId, Event>,
    players: BTreeMap<RecordId, Player>,
    venues: BTreeMap<RecordId, Venue>,
    rosters: BTreeMap<RecordId, Roster>,
    tables: BTreeMap<RecordId, TableRecord>,
    /// Classification terms: group → display name.
    group_names: BTreeMap<GroupRef, String>,
    /// Group memberships per record.
    memberships: BTreeMap<RecordId, BTreeSet<GroupRef>>,
    /// Ad hoc metadata: (record, key) → blob.
    attrs: BTreeMap<(RecordId, String), Vec<u8>>,
    /// Registered performance slot slugs (stat columns).
    stat_slots: BTreeSet<String>,
}

/// In-process record store. Individual calls are atomic; callers must not
/// assume isolation across calls.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<Records>,
}

macro_rules! record_ops {
    ($kind:expr, $map:ident, $ty:ty, $insert:ident, $get:ident, $list:ident, $update:ident, $delete:ident) => {
        pub fn $insert(&self, record: $ty) -> RecordId {
            let mut inner = self.write();
            inner.next_id += 1;
            let id = RecordId(inner.next_id);
            inner.$map.insert(id, record);
            id
        }

        pub fn $get(&self, id: RecordId) -> Option<$ty> {
            self.read().$map.get(&id).cloned()
        }

        pub fn $list(&self) -> Vec<(RecordId, $ty)> {
            self.read()
                .$map
                .iter()
                .map(|(id, r)| (*id, r.clone()))
                .collect()
        }

        pub fn $update(&self, id: RecordId, record: $ty) -> Result<(), StoreError> {
            let mut inner = self.write();
            match inner.$map.get_mut(&id) {
                Some(slot) => {
                    *slot = record;
                    Ok(())
                }
                None => Err(StoreError::NotFound { kind: $kind, id }),
            }
        }

        pub fn $delete(&self, id: RecordId) -> Result<(), StoreError> {
            let mut inner = self.write();
            if inner.$map.remove(&id).is_none() {
                return Err(StoreError::NotFound { kind: $kind, id });
            }
            inner.memberships.remove(&id);
            inner.attrs.retain(|(record, _), _| *record != id);
            Ok(())
        }
    };
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Records> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Records> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    record_ops!(
        EntityKind::Team,
        teams,
        Team,
        insert_team,
        team,
        teams,
        update_team,
        delete_team
    );
    record_ops!(
        EntityKind::Event,
        events,
        Event,
        insert_event,
        event,
        events,
        update_event,
        delete_event
    );
    record_ops!(
        EntityKind::Player,
        players,
        Player,
        insert_player,
        player,
        players,
        update_player,
        delete_player
    );
    record_ops!(
        EntityKind::Venue,
        venues,
        Venue,
        insert_venue,
        venue,
        venues,
        update_venue,
        delete_venue
    );
    record_ops!(
        EntityKind::Roster,
        rosters,
        Roster,
        insert_roster,
        roster,
        rosters,
        update_roster,
        delete_roster
    );
    record_ops!(
        EntityKind::Table,
        tables,
        TableRecord,
        insert_table,
        table,
        tables,
        update_table,
        delete_table
    );

    // ── external-key lookups (lowest record id wins) ──

    pub fn find_team_by_permanent_id(&self, permanent_id: u64) -> Option<RecordId> {
        self.read()
            .teams
            .iter()
            .find(|(_, t)| t.permanent_id == Some(permanent_id))
            .map(|(id, _)| *id)
    }

    pub fn find_event_by_match_id(&self, match_id: u64) -> Option<RecordId> {
        self.read()
            .events
            .iter()
            .find(|(_, e)| e.match_id == Some(match_id))
            .map(|(id, _)| *id)
    }

    pub fn find_player_by_person_id(&self, person_id: u64) -> Option<RecordId> {
        self.read()
            .players
            .iter()
            .find(|(_, p)| p.person_id == Some(person_id))
            .map(|(id, _)| *id)
    }

    pub fn find_venue_by_field_id(&self, field_id: u64) -> Option<RecordId> {
        self.read()
            .venues
            .iter()
            .find(|(_, v)| v.field_id == field_id)
            .map(|(id, _)| *id)
    }

    pub fn find_table_by_league_id(&self, league_id: u64) -> Option<RecordId> {
        self.read()
            .tables
            .iter()
            .find(|(_, t)| t.league_id == league_id)
            .map(|(id, _)| *id)
    }

    pub fn find_roster(&self, team: RecordId, season_slug: &str) -> Option<RecordId> {
        self.read()
            .rosters
            .iter()
            .find(|(_, r)| r.team == team && r.season_slug == season_slug)
            .map(|(id, _)| *id)
    }

    // ── grouping ──

    /// Register or rename a classification term. The upstream name wins for
    /// term display names; they carry no operator content.
    pub fn define_group(&self, group: GroupRef, name: &str) {
        self.write().group_names.insert(group, name.to_string());
    }

    pub fn group_name(&self, group: &GroupRef) -> Option<String> {
        self.read().group_names.get(group).cloned()
    }

    /// Tag a record with a group. `append` keeps existing memberships of the
    /// same kind; otherwise they are replaced.
    pub fn tag(&self, id: RecordId, group: GroupRef, append: bool) {
        let mut inner = self.write();
        let set = inner.memberships.entry(id).or_default();
        if !append {
            set.retain(|g| g.kind != group.kind);
        }
        set.insert(group);
    }

    pub fn groups_of(&self, id: RecordId, kind: GroupKind) -> Vec<GroupRef> {
        self.read()
            .memberships
            .get(&id)
            .map(|set| set.iter().filter(|g| g.kind == kind).cloned().collect())
            .unwrap_or_default()
    }

    // ── attribute bag ──

    pub fn put_attr(&self, id: RecordId, key: &str, value: Vec<u8>) {
        self.write().attrs.insert((id, key.to_string()), value);
    }

    pub fn attr(&self, id: RecordId, key: &str) -> Option<Vec<u8>> {
        self.read().attrs.get(&(id, key.to_string())).cloned()
    }

    pub fn attr_str(&self, id: RecordId, key: &str) -> Option<String> {
        self.attr(id, key)
            .and_then(|bytes| String::from_utf8(bytes).ok())
    }

    // ── performance slot registry ──

    pub fn register_stat_slot(&self, slug: &str) {
        self.write().stat_slots.insert(slug.to_string());
    }

    pub fn stat_slot_exists(&self, slug: &str) -> bool {
        self.read().stat_slots.contains(slug)
    }

    pub fn stat_slots(&self) -> BTreeSet<String> {
        self.read().stat_slots.clone()
    }
}

#[derive(Debug, Clone)]
pub struct StoredAsset {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable on-disk storage for fetched binaries, hash-addressed per scope
/// so refetching identical bytes is a no-op.
#[derive(Debug, Clone)]
pub struct AssetStore {
    root: PathBuf,
}

impl AssetStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn asset_relative_path(&self, scope: &str, content_hash: &str, extension: &str) -> PathBuf {
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(scope).join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes immutably via a temp file and atomic rename.
    pub async fn store_bytes(
        &self,
        scope: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredAsset> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.asset_relative_path(scope, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating asset directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking asset path {}", absolute_path.display()))?
        {
            return Ok(StoredAsset {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp asset file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp asset file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp asset file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredAsset {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredAsset {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp asset {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}
