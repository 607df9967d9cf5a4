//! TTL-bounded response cache over per-key JSON files.
//!
//! One file per entry keeps the store trivially shareable between the
//! cache-warming sink and re-entrant tool invocations in the same
//! process. Cross-process safety is not claimed; the cache belongs to a
//! single serve runtime.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use super::keys::cache_key;

/// Default TTL for cached wake state.
const WAKE_TTL_SECS: u64 = 60;

/// One cached snapshot with its storage time and TTL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub data: serde_json::Value,
    pub stored_at: DateTime<Utc>,
    pub ttl_seconds: u64,
}

impl CacheEntry {
    /// Seconds since this entry was stored (clamped at zero).
    pub fn age_seconds(&self) -> u64 {
        (Utc::now() - self.stored_at).num_seconds().max(0) as u64
    }

    /// Whether the entry has outlived its TTL.
    pub fn is_stale(&self) -> bool {
        self.age_seconds() > self.ttl_seconds
    }
}

/// Aggregate cache statistics for `cache status`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub enabled: bool,
    pub total_entries: usize,
    pub fresh: usize,
    pub stale: usize,
    pub disk_bytes: u64,
    pub default_ttl: u64,
}

/// Disk-backed, per-vin keyed store of recent read results.
///
/// All accessors return a miss when the cache is disabled — callers never
/// need to branch on the enabled flag themselves.
#[derive(Debug, Clone)]
pub struct ResponseCache {
    dir: Option<PathBuf>,
    default_ttl: u64,
    enabled: bool,
}

/// Keep file names to a safe alphabet regardless of what the vin holds.
fn sanitize(key: &str) -> String {
    key.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

impl ResponseCache {
    /// Open (create) the cache directory.
    pub fn open<P: AsRef<Path>>(cache_dir: P, default_ttl: u64, enabled: bool) -> Result<Self> {
        if !enabled {
            return Ok(Self::disabled());
        }
        let dir = cache_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache directory {}", dir.display()))?;
        Ok(Self {
            dir: Some(dir),
            default_ttl,
            enabled: true,
        })
    }

    /// A disabled cache that never stores and never hits.
    pub fn disabled() -> Self {
        Self {
            dir: None,
            default_ttl: 0,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        self.dir.as_ref().map(|dir| dir.join(format!("{}.json", sanitize(key))))
    }

    fn read_entry(&self, key: &str) -> Option<CacheEntry> {
        let path = self.entry_path(key)?;
        let raw = std::fs::read_to_string(&path).ok()?;
        let entry: CacheEntry = serde_json::from_str(&raw).ok()?;
        if entry.is_stale() {
            // Evict lazily so status() counts settle over time.
            let _ = std::fs::remove_file(&path);
            return None;
        }
        Some(entry)
    }

    fn write_entry(&self, key: &str, entry: &CacheEntry) -> Result<()> {
        let Some(path) = self.entry_path(key) else {
            return Ok(());
        };
        let raw = serde_json::to_string(entry).context("failed to serialize cache entry")?;
        std::fs::write(&path, raw)
            .with_context(|| format!("failed to write cache entry {}", path.display()))?;
        Ok(())
    }

    /// Fetch the fresh snapshot entry for `vin`, or `None` on miss/stale.
    pub fn get(&self, vin: &str) -> Option<CacheEntry> {
        self.get_with_endpoints(vin, None)
    }

    /// Fetch an entry keyed by `(vin, endpoint set)`.
    pub fn get_with_endpoints(&self, vin: &str, endpoints: Option<&[String]>) -> Option<CacheEntry> {
        self.read_entry(&cache_key(vin, endpoints))
    }

    /// Store a snapshot for `vin` with an optional TTL override.
    pub fn put(&self, vin: &str, data: serde_json::Value, ttl: Option<u64>) -> Result<()> {
        self.put_with_endpoints(vin, None, data, ttl)
    }

    /// Store an entry keyed by `(vin, endpoint set)`.
    pub fn put_with_endpoints(
        &self,
        vin: &str,
        endpoints: Option<&[String]>,
        data: serde_json::Value,
        ttl: Option<u64>,
    ) -> Result<()> {
        let entry = CacheEntry {
            data,
            stored_at: Utc::now(),
            ttl_seconds: ttl.unwrap_or(self.default_ttl),
        };
        self.write_entry(&cache_key(vin, endpoints), &entry)
    }

    fn list_files(&self) -> Vec<PathBuf> {
        let Some(dir) = &self.dir else {
            return Vec::new();
        };
        let Ok(entries) = std::fs::read_dir(dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .collect()
    }

    /// Remove all entries for `vin`, or every entry when `vin` is `None`.
    pub fn clear(&self, vin: Option<&str>) -> Result<usize> {
        let mut removed = 0;
        for path in self.list_files() {
            let name = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let doomed = match vin {
                Some(v) => {
                    let v = sanitize(v);
                    name.starts_with(&format!("{v}_")) || name == format!("wake_{v}")
                }
                None => true,
            };
            if doomed {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Cached wake state for `vin` (false on miss/stale).
    pub fn get_wake_state(&self, vin: &str) -> bool {
        self.read_entry(&format!("wake_{vin}"))
            .map(|entry| entry.data.as_str() == Some("online"))
            .unwrap_or(false)
    }

    /// Record the wake state for `vin` with an optional TTL override.
    pub fn put_wake_state(&self, vin: &str, online: bool, ttl: Option<u64>) -> Result<()> {
        let entry = CacheEntry {
            data: serde_json::Value::String(if online { "online" } else { "asleep" }.to_string()),
            stored_at: Utc::now(),
            ttl_seconds: ttl.unwrap_or(WAKE_TTL_SECS),
        };
        self.write_entry(&format!("wake_{vin}"), &entry)
    }

    /// Aggregate statistics over every stored entry.
    pub fn status(&self) -> CacheStatus {
        if !self.enabled {
            return CacheStatus {
                enabled: false,
                total_entries: 0,
                fresh: 0,
                stale: 0,
                disk_bytes: 0,
                default_ttl: self.default_ttl,
            };
        }

        let mut total = 0;
        let mut fresh = 0;
        let mut stale = 0;
        let mut disk_bytes = 0;
        for path in self.list_files() {
            total += 1;
            disk_bytes += std::fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let parsed = std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok());
            match parsed {
                Some(entry) if entry.is_stale() => stale += 1,
                Some(_) => fresh += 1,
                None => stale += 1,
            }
        }

        CacheStatus {
            enabled: true,
            total_entries: total,
            fresh,
            stale,
            disk_bytes,
            default_ttl: self.default_ttl,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_cache(ttl: u64) -> (tempfile::TempDir, ResponseCache) {
        let dir = tempfile::tempdir().unwrap();
        let cache = ResponseCache::open(dir.path(), ttl, true).unwrap();
        (dir, cache)
    }

    #[test]
    fn test_put_get_roundtrip() {
        let (_dir, cache) = open_cache(120);
        cache
            .put("V1", json!({"charge_state": {"battery_level": 80}}), None)
            .unwrap();

        let entry = cache.get("V1").unwrap();
        assert_eq!(entry.data["charge_state"]["battery_level"], 80);
        assert!(entry.age_seconds() <= entry.ttl_seconds);
    }

    #[test]
    fn test_two_instances_share_the_directory() {
        let dir = tempfile::tempdir().unwrap();
        let writer = ResponseCache::open(dir.path(), 120, true).unwrap();
        let reader = ResponseCache::open(dir.path(), 120, true).unwrap();

        writer.put("V1", json!({"x": 1}), None).unwrap();
        assert_eq!(reader.get("V1").unwrap().data["x"], 1);
    }

    #[test]
    fn test_stale_entry_is_a_miss() {
        let (_dir, cache) = open_cache(0);
        cache.put("V1", json!({"x": 1}), Some(0)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));
        assert!(cache.get("V1").is_none());
    }

    #[test]
    fn test_disabled_cache_always_misses() {
        let cache = ResponseCache::disabled();
        cache.put("V1", json!({"x": 1}), None).unwrap();
        assert!(cache.get("V1").is_none());
        assert!(!cache.get_wake_state("V1"));
        assert!(!cache.status().enabled);
    }

    #[test]
    fn test_wake_state_roundtrip() {
        let (_dir, cache) = open_cache(120);
        assert!(!cache.get_wake_state("V1"));
        cache.put_wake_state("V1", true, Some(60)).unwrap();
        assert!(cache.get_wake_state("V1"));
        cache.put_wake_state("V1", false, Some(60)).unwrap();
        assert!(!cache.get_wake_state("V1"));
    }

    #[test]
    fn test_clear_single_vin() {
        let (_dir, cache) = open_cache(120);
        cache.put("V1", json!({"a": 1}), None).unwrap();
        cache.put("V2", json!({"b": 2}), None).unwrap();
        cache.put_wake_state("V1", true, None).unwrap();

        let removed = cache.clear(Some("V1")).unwrap();
        assert_eq!(removed, 2);
        assert!(cache.get("V1").is_none());
        assert!(cache.get("V2").is_some());
    }

    #[test]
    fn test_status_counts() {
        let (_dir, cache) = open_cache(120);
        cache.put("V1", json!({"a": 1}), None).unwrap();
        cache.put("V2", json!({"b": 2}), Some(0)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1100));

        let status = cache.status();
        assert!(status.enabled);
        assert_eq!(status.total_entries, 2);
        assert_eq!(status.fresh, 1);
        assert_eq!(status.stale, 1);
        assert!(status.disk_bytes > 0);
    }

    #[test]
    fn test_unusual_vin_characters_are_sanitized() {
        let (_dir, cache) = open_cache(120);
        cache.put("weird/vin..name", json!({"ok": true}), None).unwrap();
        assert_eq!(cache.get("weird/vin..name").unwrap().data["ok"], true);
    }
}
