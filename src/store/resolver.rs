//! Coordinate resolution.
//!
//! [`EntityResolver`] turns human-readable names into row ids. Lookups go
//! through an [`IdCache`] owned by the store instance; there is no
//! process-wide cache, so two stores in one process never see each other's
//! entries. Entities are never deleted or renamed, so a cached id never goes
//! stale.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use super::models::{FovCoord, ResolvedFov};
use crate::error::{StoreError, StoreResult};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum CacheKey {
    BioRep(String),
    Condition(String),
    Timepoint(String),
    Channel(String),
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: HashMap<CacheKey, i64>,
    order: VecDeque<CacheKey>,
}

/// Bounded name-to-id cache, evicting the oldest entry when full.
#[derive(Debug)]
pub struct IdCache {
    capacity: usize,
    inner: Mutex<CacheInner>,
}

impl IdCache {
    /// Create a cache holding at most `capacity` entries.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(CacheInner::default()),
        }
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// True if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn get(&self, key: &CacheKey) -> Option<i64> {
        self.inner.lock().entries.get(key).copied()
    }

    fn insert(&self, key: CacheKey, id: i64) {
        let mut inner = self.inner.lock();
        if inner.entries.insert(key.clone(), id).is_none() {
            inner.order.push_back(key);
        }
        while inner.entries.len() > self.capacity {
            match inner.order.pop_front() {
                Some(oldest) => {
                    inner.entries.remove(&oldest);
                }
                None => break,
            }
        }
    }
}

/// Resolves names to ids against one connection.
pub struct EntityResolver<'a> {
    connection: &'a Connection,
    cache: &'a IdCache,
}

impl<'a> EntityResolver<'a> {
    /// Resolver over a connection and the store's cache.
    pub fn new(connection: &'a Connection, cache: &'a IdCache) -> Self {
        Self { connection, cache }
    }

    /// Resolve a bio-rep, auto-selecting when the name is omitted.
    ///
    /// With the name omitted: no bio-reps is [`StoreError::BioRepNotFound`],
    /// exactly one resolves silently, several is
    /// [`StoreError::AmbiguousSelection`] listing the sorted candidates.
    pub fn bio_rep(&self, name: Option<&str>) -> StoreResult<(i64, String)> {
        if let Some(name) = name {
            let id = self
                .lookup(CacheKey::BioRep(name.to_string()), "SELECT id FROM bio_reps WHERE name = ?1")?
                .ok_or_else(|| StoreError::BioRepNotFound(Some(name.to_string())))?;
            return Ok((id, name.to_string()));
        }

        let mut statement = self
            .connection
            .prepare_cached("SELECT id, name FROM bio_reps ORDER BY name")?;
        let candidates = statement
            .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        match candidates.as_slice() {
            [] => Err(StoreError::BioRepNotFound(None)),
            [only] => {
                debug!(bio_rep = %only.1, "Auto-resolved bio-rep");
                Ok(only.clone())
            }
            _ => Err(StoreError::AmbiguousSelection {
                entity: "bio-rep",
                candidates: candidates.into_iter().map(|(_, name)| name).collect(),
            }),
        }
    }

    /// Resolve a condition by exact name.
    pub fn condition(&self, name: &str) -> StoreResult<i64> {
        self.lookup(
            CacheKey::Condition(name.to_string()),
            "SELECT id FROM conditions WHERE name = ?1",
        )?
        .ok_or_else(|| StoreError::ConditionNotFound(name.to_string()))
    }

    /// Resolve a timepoint by exact name.
    pub fn timepoint(&self, name: &str) -> StoreResult<i64> {
        self.lookup(
            CacheKey::Timepoint(name.to_string()),
            "SELECT id FROM timepoints WHERE name = ?1",
        )?
        .ok_or_else(|| StoreError::TimepointNotFound(name.to_string()))
    }

    /// Resolve an optional timepoint.
    pub fn optional_timepoint(&self, name: Option<&str>) -> StoreResult<Option<i64>> {
        name.map(|name| self.timepoint(name)).transpose()
    }

    /// Resolve a channel by exact name.
    pub fn channel(&self, name: &str) -> StoreResult<i64> {
        self.lookup(
            CacheKey::Channel(name.to_string()),
            "SELECT id FROM channels WHERE name = ?1",
        )?
        .ok_or_else(|| StoreError::ChannelNotFound(name.to_string()))
    }

    /// Resolve a full FOV coordinate.
    ///
    /// The FOV name is looked up only within the resolved
    /// (bio-rep, condition, timepoint) triple.
    pub fn fov(&self, coord: &FovCoord) -> StoreResult<ResolvedFov> {
        let (bio_rep_id, bio_rep) = self.bio_rep(coord.bio_rep.as_deref())?;
        let condition_id = self.condition(&coord.condition)?;
        let timepoint_id = self.optional_timepoint(coord.timepoint.as_deref())?;

        let row = self
            .connection
            .prepare_cached(
                "SELECT id, width, height, pixel_size_um FROM fovs
                 WHERE name = ?1 AND bio_rep_id = ?2 AND condition_id = ?3
                   AND timepoint_id IS ?4",
            )?
            .query_row(
                params![coord.fov, bio_rep_id, condition_id, timepoint_id],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, Option<f64>>(3)?,
                    ))
                },
            )
            .optional()?;

        let (fov_id, width, height, pixel_size_um) = row.ok_or_else(|| {
            StoreError::FovNotFound(
                FovCoord {
                    bio_rep: Some(bio_rep.clone()),
                    ..coord.clone()
                }
                .to_string(),
            )
        })?;

        Ok(ResolvedFov {
            fov_id,
            fov: coord.fov.clone(),
            bio_rep_id,
            bio_rep,
            condition_id,
            condition: coord.condition.clone(),
            timepoint_id,
            timepoint: coord.timepoint.clone(),
            width: width.and_then(|w| u64::try_from(w).ok()),
            height: height.and_then(|h| u64::try_from(h).ok()),
            pixel_size_um,
        })
    }

    /// Record a freshly created entity so the next lookup skips the query.
    pub(crate) fn remember_bio_rep(&self, name: &str, id: i64) {
        self.cache.insert(CacheKey::BioRep(name.to_string()), id);
    }

    pub(crate) fn remember_condition(&self, name: &str, id: i64) {
        self.cache.insert(CacheKey::Condition(name.to_string()), id);
    }

    pub(crate) fn remember_timepoint(&self, name: &str, id: i64) {
        self.cache.insert(CacheKey::Timepoint(name.to_string()), id);
    }

    pub(crate) fn remember_channel(&self, name: &str, id: i64) {
        self.cache.insert(CacheKey::Channel(name.to_string()), id);
    }

    fn lookup(&self, key: CacheKey, sql: &str) -> StoreResult<Option<i64>> {
        if let Some(id) = self.cache.get(&key) {
            debug!(?key, id, "Resolver cache hit");
            return Ok(Some(id));
        }
        let name = match &key {
            CacheKey::BioRep(name)
            | CacheKey::Condition(name)
            | CacheKey::Timepoint(name)
            | CacheKey::Channel(name) => name.as_str(),
        };
        let id: Option<i64> = self
            .connection
            .prepare_cached(sql)?
            .query_row(params![name], |row| row.get(0))
            .optional()?;
        if let Some(id) = id {
            self.cache.insert(key, id);
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        let connection = Connection::open_in_memory().unwrap();
        connection
            .execute_batch(
                "CREATE TABLE bio_reps (id INTEGER PRIMARY KEY, name TEXT UNIQUE);
                 CREATE TABLE conditions (id INTEGER PRIMARY KEY, name TEXT UNIQUE);
                 CREATE TABLE timepoints (id INTEGER PRIMARY KEY, name TEXT UNIQUE);
                 CREATE TABLE channels (id INTEGER PRIMARY KEY, name TEXT UNIQUE);
                 CREATE TABLE fovs (id INTEGER PRIMARY KEY, name TEXT, bio_rep_id INTEGER,
                     condition_id INTEGER, timepoint_id INTEGER, width INTEGER,
                     height INTEGER, pixel_size_um REAL);",
            )
            .unwrap();
        connection
    }

    #[test]
    fn omitted_bio_rep_follows_candidate_count() {
        let connection = connection();
        let cache = IdCache::new(8);
        let resolver = EntityResolver::new(&connection, &cache);

        assert!(matches!(
            resolver.bio_rep(None),
            Err(StoreError::BioRepNotFound(None))
        ));

        connection
            .execute("INSERT INTO bio_reps (name) VALUES ('N2')", [])
            .unwrap();
        assert_eq!(resolver.bio_rep(None).unwrap().1, "N2");

        connection
            .execute("INSERT INTO bio_reps (name) VALUES ('N1')", [])
            .unwrap();
        match resolver.bio_rep(None) {
            Err(StoreError::AmbiguousSelection { entity, candidates }) => {
                assert_eq!(entity, "bio-rep");
                assert_eq!(candidates, vec!["N1", "N2"]);
            }
            other => panic!("expected ambiguity, got {other:?}"),
        }
    }

    #[test]
    fn fov_lookup_is_scoped_by_condition_and_timepoint() {
        let connection = connection();
        connection
            .execute_batch(
                "INSERT INTO bio_reps (id, name) VALUES (1, 'N1');
                 INSERT INTO conditions (id, name) VALUES (1, 'control'), (2, 'treated');
                 INSERT INTO timepoints (id, name) VALUES (1, 't0');
                 INSERT INTO fovs (id, name, bio_rep_id, condition_id, timepoint_id)
                     VALUES (10, 'FOV_1', 1, 1, NULL), (11, 'FOV_1', 1, 2, NULL),
                            (12, 'FOV_1', 1, 1, 1);",
            )
            .unwrap();
        let cache = IdCache::new(8);
        let resolver = EntityResolver::new(&connection, &cache);

        let control = resolver.fov(&FovCoord::new("control", "FOV_1")).unwrap();
        let treated = resolver.fov(&FovCoord::new("treated", "FOV_1")).unwrap();
        let timed = resolver
            .fov(&FovCoord::new("control", "FOV_1").timepoint("t0"))
            .unwrap();
        assert_eq!(
            (control.fov_id, treated.fov_id, timed.fov_id),
            (10, 11, 12)
        );

        assert!(matches!(
            resolver.fov(&FovCoord::new("control", "FOV_2")),
            Err(StoreError::FovNotFound(_))
        ));
        assert!(matches!(
            resolver.fov(&FovCoord::new("missing", "FOV_1")),
            Err(StoreError::ConditionNotFound(_))
        ));
    }

    #[test]
    fn cache_is_bounded() {
        let cache = IdCache::new(2);
        cache.insert(CacheKey::Channel("a".to_string()), 1);
        cache.insert(CacheKey::Channel("b".to_string()), 2);
        cache.insert(CacheKey::Channel("c".to_string()), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&CacheKey::Channel("a".to_string())), None);
        assert_eq!(cache.get(&CacheKey::Channel("c".to_string())), Some(3));
    }

    #[test]
    fn separate_caches_are_independent() {
        let first = connection();
        let second = connection();
        first
            .execute("INSERT INTO channels (id, name) VALUES (7, 'DAPI')", [])
            .unwrap();
        let first_cache = IdCache::new(8);
        let second_cache = IdCache::new(8);

        assert_eq!(
            EntityResolver::new(&first, &first_cache).channel("DAPI").unwrap(),
            7
        );
        assert!(matches!(
            EntityResolver::new(&second, &second_cache).channel("DAPI"),
            Err(StoreError::ChannelNotFound(_))
        ));
    }
}
