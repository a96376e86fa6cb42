// =============================================================================
// Distributed Lock — single-instance and per-symbol exclusivity
// =============================================================================
//
// Two backends behind one enum:
//
//   File  — advisory create-new lock files with an owner/timestamp payload;
//           a lock older than `stale_lock_sec` is taken over.
//   Redis — SET NX EX with refresh-while-held and release-only-if-owner.
//
// Backend errors fail OPEN: a broken lock service must not be able to
// self-DoS the trading engine. Instance identity is `host_pid`, released on
// graceful shutdown and reclaimed via staleness after a crash.
// =============================================================================

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::util::{canon_symbol, now_ts, safe_parse_f64};

/// `host_pid`, unique per running instance.
pub fn instance_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
    format!("{host}_{}", std::process::id())
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub enabled: bool,
    pub backend: String,
    pub path: PathBuf,
    pub redis_url: String,
    pub timeout_sec: f64,
    pub stale_lock_sec: f64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: "file".to_string(),
            path: PathBuf::from(".penumbra_locks"),
            redis_url: String::new(),
            timeout_sec: 60.0,
            stale_lock_sec: 120.0,
        }
    }
}

// =============================================================================
// File backend
// =============================================================================

pub struct FileLockManager {
    dir: PathBuf,
    instance_id: String,
    stale_lock_sec: f64,
    held: Mutex<HashSet<PathBuf>>,
}

impl FileLockManager {
    pub fn new(dir: impl Into<PathBuf>, stale_lock_sec: f64) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create lock dir {}", dir.display()))?;
        Ok(Self {
            dir,
            instance_id: instance_id(),
            stale_lock_sec,
            held: Mutex::new(HashSet::new()),
        })
    }

    fn instance_path(&self) -> PathBuf {
        self.dir.join("instance.lock")
    }

    fn symbol_path(&self, symbol: &str) -> PathBuf {
        self.dir.join(format!("symbol_{}.lock", canon_symbol(symbol)))
    }

    /// Create-new acquisition with stale takeover. Returns false when another
    /// live instance holds the lock.
    fn acquire(&self, path: &Path) -> bool {
        if self.held.lock().contains(path) {
            return true;
        }

        match self.try_create(path) {
            Ok(true) => {
                self.held.lock().insert(path.to_path_buf());
                true
            }
            Ok(false) => {
                if self.is_stale(path) {
                    warn!(
                        component = "lock",
                        path = %path.display(),
                        "removing stale lock"
                    );
                    let _ = std::fs::remove_file(path);
                    if let Ok(true) = self.try_create(path) {
                        self.held.lock().insert(path.to_path_buf());
                        return true;
                    }
                }
                false
            }
            Err(e) => {
                // Fail open: a broken filesystem must not halt trading.
                warn!(component = "lock", error = %e, "lock backend error, failing open");
                true
            }
        }
    }

    fn try_create(&self, path: &Path) -> Result<bool> {
        use std::io::Write;
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut f) => {
                write!(f, "{}\n{}", self.instance_id, now_ts())
                    .context("failed to write lock payload")?;
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e).context("lock file creation failed"),
        }
    }

    fn is_stale(&self, path: &Path) -> bool {
        let Ok(content) = std::fs::read_to_string(path) else {
            return true;
        };
        let Some(ts_line) = content.lines().nth(1) else {
            return true;
        };
        let ts = safe_parse_f64(ts_line, 0.0);
        ts <= 0.0 || now_ts() - ts > self.stale_lock_sec
    }

    fn release(&self, path: &Path) {
        if self.held.lock().remove(path) {
            let _ = std::fs::remove_file(path);
        }
    }

    pub fn acquire_instance_lock(&self) -> bool {
        let ok = self.acquire(&self.instance_path());
        if ok {
            info!(component = "lock", id = %self.instance_id, "instance lock acquired");
        }
        ok
    }

    pub fn acquire_symbol_lock(&self, symbol: &str) -> bool {
        self.acquire(&self.symbol_path(symbol))
    }

    pub fn release_symbol_lock(&self, symbol: &str) {
        self.release(&self.symbol_path(symbol));
    }

    pub fn release_all(&self) {
        let paths: Vec<PathBuf> = self.held.lock().iter().cloned().collect();
        for path in paths {
            self.release(&path);
        }
        info!(component = "lock", "all file locks released");
    }
}

// =============================================================================
// Redis backend
// =============================================================================

pub struct RedisLockManager {
    client: redis::Client,
    instance_id: String,
    ttl_sec: u64,
    held: Mutex<HashSet<String>>,
}

impl RedisLockManager {
    pub fn new(redis_url: &str, ttl_sec: f64) -> Result<Self> {
        let client = redis::Client::open(redis_url)
            .with_context(|| format!("invalid redis url {redis_url}"))?;
        Ok(Self {
            client,
            instance_id: instance_id(),
            ttl_sec: ttl_sec.max(1.0) as u64,
            held: Mutex::new(HashSet::new()),
        })
    }

    fn instance_key() -> String {
        "penumbra:lock:instance".to_string()
    }

    fn symbol_key(symbol: &str) -> String {
        format!("penumbra:lock:symbol:{}", canon_symbol(symbol))
    }

    /// SET NX EX; refreshes the TTL when this instance already owns the key.
    /// Backend errors fail open.
    async fn acquire(&self, key: &str) -> bool {
        let mut conn = match self.client.get_multiplexed_tokio_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!(component = "lock", error = %e, "redis unavailable, failing open");
                return true;
            }
        };

        let set: Result<Option<String>, redis::RedisError> = redis::cmd("SET")
            .arg(key)
            .arg(&self.instance_id)
            .arg("NX")
            .arg("EX")
            .arg(self.ttl_sec)
            .query_async(&mut conn)
            .await;

        match set {
            Ok(Some(_)) => {
                self.held.lock().insert(key.to_string());
                true
            }
            Ok(None) => {
                // Taken. If by us, refresh the TTL and keep it.
                let owner: Result<Option<String>, redis::RedisError> =
                    redis::cmd("GET").arg(key).query_async(&mut conn).await;
                match owner {
                    Ok(Some(id)) if id == self.instance_id => {
                        let _: Result<i64, redis::RedisError> = redis::cmd("EXPIRE")
                            .arg(key)
                            .arg(self.ttl_sec)
                            .query_async(&mut conn)
                            .await;
                        self.held.lock().insert(key.to_string());
                        true
                    }
                    Ok(_) => false,
                    Err(e) => {
                        warn!(component = "lock", error = %e, "redis owner check failed, failing open");
                        true
                    }
                }
            }
            Err(e) => {
                warn!(component = "lock", error = %e, "redis SET failed, failing open");
                true
            }
        }
    }

    /// Delete only when this instance owns the key.
    async fn release(&self, key: &str) {
        self.held.lock().remove(key);
        let Ok(mut conn) = self.client.get_multiplexed_tokio_connection().await else {
            return;
        };
        let owner: Result<Option<String>, redis::RedisError> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await;
        if let Ok(Some(id)) = owner {
            if id == self.instance_id {
                let _: Result<i64, redis::RedisError> =
                    redis::cmd("DEL").arg(key).query_async(&mut conn).await;
            }
        }
    }

    pub async fn acquire_instance_lock(&self) -> bool {
        self.acquire(&Self::instance_key()).await
    }

    pub async fn acquire_symbol_lock(&self, symbol: &str) -> bool {
        self.acquire(&Self::symbol_key(symbol)).await
    }

    pub async fn release_symbol_lock(&self, symbol: &str) {
        self.release(&Self::symbol_key(symbol)).await;
    }

    pub async fn release_all(&self) {
        let keys: Vec<String> = self.held.lock().iter().cloned().collect();
        for key in keys {
            self.release(&key).await;
        }
        info!(component = "lock", "all redis locks released");
    }
}

// =============================================================================
// Unified manager
// =============================================================================

pub enum LockManager {
    Disabled,
    File(FileLockManager),
    Redis(RedisLockManager),
}

impl LockManager {
    /// Build from config. A misconfigured backend degrades to `Disabled`
    /// with a warning rather than blocking startup.
    pub fn from_config(config: &LockConfig) -> Self {
        if !config.enabled {
            return Self::Disabled;
        }
        match config.backend.as_str() {
            "redis" => match RedisLockManager::new(&config.redis_url, config.timeout_sec) {
                Ok(mgr) => Self::Redis(mgr),
                Err(e) => {
                    warn!(component = "lock", error = %e, "redis lock init failed, locks disabled");
                    Self::Disabled
                }
            },
            _ => match FileLockManager::new(&config.path, config.stale_lock_sec) {
                Ok(mgr) => Self::File(mgr),
                Err(e) => {
                    warn!(component = "lock", error = %e, "file lock init failed, locks disabled");
                    Self::Disabled
                }
            },
        }
    }

    pub async fn acquire_instance_lock(&self) -> bool {
        match self {
            Self::Disabled => true,
            Self::File(mgr) => mgr.acquire_instance_lock(),
            Self::Redis(mgr) => mgr.acquire_instance_lock().await,
        }
    }

    pub async fn acquire_symbol_lock(&self, symbol: &str) -> bool {
        match self {
            Self::Disabled => true,
            Self::File(mgr) => mgr.acquire_symbol_lock(symbol),
            Self::Redis(mgr) => mgr.acquire_symbol_lock(symbol).await,
        }
    }

    pub async fn release_symbol_lock(&self, symbol: &str) {
        match self {
            Self::Disabled => {}
            Self::File(mgr) => mgr.release_symbol_lock(symbol),
            Self::Redis(mgr) => mgr.release_symbol_lock(symbol).await,
        }
    }

    pub async fn release_all(&self) {
        match self {
            Self::Disabled => {}
            Self::File(mgr) => mgr.release_all(),
            Self::Redis(mgr) => mgr.release_all().await,
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instance_id_includes_pid() {
        let id = instance_id();
        assert!(id.contains(&std::process::id().to_string()));
    }

    #[test]
    fn file_lock_excludes_second_holder() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileLockManager::new(dir.path(), 120.0).unwrap();
        let b = FileLockManager::new(dir.path(), 120.0).unwrap();

        assert!(a.acquire_instance_lock());
        // Re-acquisition by the same holder is a no-op success.
        assert!(a.acquire_instance_lock());
        // A second manager cannot take a fresh lock.
        assert!(!b.acquire_instance_lock());

        a.release_all();
        assert!(b.acquire_instance_lock());
    }

    #[test]
    fn stale_lock_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.lock");
        // A dead instance left a lock from long ago.
        std::fs::write(&path, format!("ghost_999\n{}", now_ts() - 600.0)).unwrap();

        let mgr = FileLockManager::new(dir.path(), 120.0).unwrap();
        assert!(mgr.acquire_instance_lock());
    }

    #[test]
    fn fresh_foreign_lock_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.lock");
        std::fs::write(&path, format!("other_123\n{}", now_ts())).unwrap();

        let mgr = FileLockManager::new(dir.path(), 120.0).unwrap();
        assert!(!mgr.acquire_instance_lock());
    }

    #[test]
    fn malformed_lock_file_counts_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("instance.lock");
        std::fs::write(&path, "garbage").unwrap();

        let mgr = FileLockManager::new(dir.path(), 120.0).unwrap();
        assert!(mgr.acquire_instance_lock());
    }

    #[test]
    fn symbol_locks_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let a = FileLockManager::new(dir.path(), 120.0).unwrap();
        let b = FileLockManager::new(dir.path(), 120.0).unwrap();

        assert!(a.acquire_symbol_lock("BTC/USDT:USDT"));
        // Canonicalized to the same key.
        assert!(!b.acquire_symbol_lock("BTCUSDT"));
        assert!(b.acquire_symbol_lock("ETHUSDT"));

        a.release_symbol_lock("BTCUSDT");
        assert!(b.acquire_symbol_lock("BTCUSDT"));
    }

    #[tokio::test]
    async fn disabled_manager_always_grants() {
        let mgr = LockManager::Disabled;
        assert!(mgr.acquire_instance_lock().await);
        assert!(mgr.acquire_symbol_lock("BTCUSDT").await);
        mgr.release_all().await;
    }

    #[test]
    fn redis_key_layout() {
        assert_eq!(RedisLockManager::instance_key(), "penumbra:lock:instance");
        assert_eq!(
            RedisLockManager::symbol_key("BTC/USDT:USDT"),
            "penumbra:lock:symbol:BTCUSDT"
        );
    }
}
