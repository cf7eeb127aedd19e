use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension};
use tracing::trace;

use crate::db::open_cache_database;
use crate::errors::{AppError, AppResult};
use crate::ingestion::NormalizedAddress;
use crate::providers::{Coordinate, ProviderKind};

/// Address -> coordinate store with expiry. Implementations must tolerate
/// concurrent use from every resolver worker; an `Err` means the backend
/// itself is unavailable.
#[async_trait]
pub trait GeocodeCache: Send + Sync {
    async fn get(&self, key: &NormalizedAddress) -> AppResult<Option<Coordinate>>;

    async fn set(
        &self,
        key: &NormalizedAddress,
        coordinate: &Coordinate,
        ttl: Duration,
    ) -> AppResult<()>;
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: NormalizedAddress,
    pub coordinate: Coordinate,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

fn expiry_from(now: DateTime<Utc>, ttl: Duration) -> AppResult<DateTime<Utc>> {
    let ttl = chrono::Duration::from_std(ttl)
        .map_err(|_| AppError::Config(format!("cache ttl out of range: {ttl:?}")))?;
    now.checked_add_signed(ttl)
        .ok_or_else(|| AppError::Config("cache ttl overflows the calendar".into()))
}

pub struct SqliteGeocodeCache {
    db: Arc<Mutex<Connection>>,
}

impl SqliteGeocodeCache {
    pub fn new(db: Arc<Mutex<Connection>>) -> Self {
        Self { db }
    }

    pub fn open<P: AsRef<Path>>(data_dir: P, database_file: &str) -> AppResult<Self> {
        let bootstrap = open_cache_database(data_dir, database_file)?;
        Ok(Self::new(Arc::new(Mutex::new(bootstrap.context.connection))))
    }

    fn lookup(&self, key: &NormalizedAddress) -> AppResult<Option<Coordinate>> {
        let now = Utc::now().timestamp_millis();
        let conn = self.db.lock();
        let row = conn
            .query_row(
                "SELECT lat, lon, provider, resolved_at
                FROM geocode_cache
                WHERE address_key = ?1 AND expires_at > ?2",
                (key.as_str(), now),
                |row| {
                    Ok((
                        row.get::<_, f64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((lat, lon, provider, resolved_at)) = row else {
            return Ok(None);
        };
        let provider = ProviderKind::parse(&provider)
            .ok_or_else(|| AppError::Parse(format!("unknown cached provider '{provider}'")))?;
        let resolved_at = DateTime::parse_from_rfc3339(&resolved_at)
            .map_err(|err| AppError::Parse(format!("invalid cached timestamp: {err}")))?
            .with_timezone(&Utc);
        Ok(Some(Coordinate {
            lat,
            lon,
            provider,
            resolved_at,
        }))
    }
}

#[async_trait]
impl GeocodeCache for SqliteGeocodeCache {
    async fn get(&self, key: &NormalizedAddress) -> AppResult<Option<Coordinate>> {
        let hit = self.lookup(key)?;
        trace!(target: "geocode_cache", %key, hit = hit.is_some(), "cache lookup");
        Ok(hit)
    }

    async fn set(
        &self,
        key: &NormalizedAddress,
        coordinate: &Coordinate,
        ttl: Duration,
    ) -> AppResult<()> {
        let expires_at = expiry_from(Utc::now(), ttl)?;
        let conn = self.db.lock();
        conn.execute(
            "INSERT INTO geocode_cache (address_key, lat, lon, provider, resolved_at, expires_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(address_key) DO UPDATE SET
                lat = excluded.lat,
                lon = excluded.lon,
                provider = excluded.provider,
                resolved_at = excluded.resolved_at,
                expires_at = excluded.expires_at",
            (
                key.as_str(),
                coordinate.lat,
                coordinate.lon,
                coordinate.provider.as_str(),
                coordinate.resolved_at.to_rfc3339(),
                expires_at.timestamp_millis(),
            ),
        )?;
        Ok(())
    }
}

/// In-process cache for tests and runs that should not touch disk.
#[derive(Default)]
pub struct MemoryGeocodeCache {
    entries: Mutex<HashMap<NormalizedAddress, CacheEntry>>,
}

impl MemoryGeocodeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        let now = Utc::now();
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.is_live(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl GeocodeCache for MemoryGeocodeCache {
    async fn get(&self, key: &NormalizedAddress) -> AppResult<Option<Coordinate>> {
        let now = Utc::now();
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.coordinate.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &NormalizedAddress,
        coordinate: &Coordinate,
        ttl: Duration,
    ) -> AppResult<()> {
        let entry = CacheEntry {
            key: key.clone(),
            coordinate: coordinate.clone(),
            expires_at: expiry_from(Utc::now(), ttl)?,
        };
        self.entries.lock().insert(entry.key.clone(), entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn key() -> NormalizedAddress {
        NormalizedAddress::from_raw("1 main st, springfield, il 62701")
    }

    fn coordinate(lat: f64, provider: ProviderKind) -> Coordinate {
        Coordinate::new(lat, -89.65, provider).unwrap()
    }

    #[tokio::test]
    async fn sqlite_cache_round_trips_and_overwrites() {
        let dir = tempdir().unwrap();
        let cache = SqliteGeocodeCache::open(dir.path(), "cache.db").unwrap();
        assert!(cache.get(&key()).await.unwrap().is_none());

        cache
            .set(&key(), &coordinate(39.78, ProviderKind::OpenFallback), DAY)
            .await
            .unwrap();
        cache
            .set(&key(), &coordinate(39.79, ProviderKind::PrimaryCommercial), DAY)
            .await
            .unwrap();

        let hit = cache.get(&key()).await.unwrap().unwrap();
        assert_eq!(hit.lat, 39.79);
        assert_eq!(hit.provider, ProviderKind::PrimaryCommercial);

        let rows: i64 = cache
            .db
            .lock()
            .query_row("SELECT COUNT(*) FROM geocode_cache", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn sqlite_cache_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let cache = SqliteGeocodeCache::open(dir.path(), "cache.db").unwrap();
            cache
                .set(&key(), &coordinate(39.78, ProviderKind::OpenFallback), DAY)
                .await
                .unwrap();
        }
        let cache = SqliteGeocodeCache::open(dir.path(), "cache.db").unwrap();
        assert_eq!(cache.get(&key()).await.unwrap().unwrap().lat, 39.78);
    }

    #[tokio::test]
    async fn expired_entries_are_misses() {
        let dir = tempdir().unwrap();
        let sqlite = SqliteGeocodeCache::open(dir.path(), "cache.db").unwrap();
        let memory = MemoryGeocodeCache::new();
        let caches: [&dyn GeocodeCache; 2] = [&sqlite, &memory];

        for cache in caches {
            cache
                .set(&key(), &coordinate(39.78, ProviderKind::OpenFallback), Duration::ZERO)
                .await
                .unwrap();
            assert!(cache.get(&key()).await.unwrap().is_none());
        }
        assert!(memory.is_empty());
    }

    #[tokio::test]
    async fn memory_cache_overwrites_entries() {
        let cache = MemoryGeocodeCache::new();
        cache
            .set(&key(), &coordinate(1.0, ProviderKind::OpenFallback), DAY)
            .await
            .unwrap();
        cache
            .set(&key(), &coordinate(2.0, ProviderKind::SecondaryFallback), DAY)
            .await
            .unwrap();
        assert_eq!(cache.len(), 1);
        let hit = cache.get(&key()).await.unwrap().unwrap();
        assert_eq!(hit.lat, 2.0);
        assert_eq!(hit.provider, ProviderKind::SecondaryFallback);
    }
}
