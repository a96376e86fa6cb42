// =============================================================================
// Brain Persistence — checksummed, versioned, crash-safe snapshots
// =============================================================================
//
// On-disk format (outer msgpack map):
//   { checksum:    sha256 hex of the compressed blob,
//     payload_sha: sha256 hex of the raw payload bytes,
//     blob:        lz4-frame( msgpack( payload ) ) }
// Inner payload:
//   { v: version token, timestamp, meta { core_version_seen, schema_version },
//     state: BrainState }
//
// Save protocol: write tmp + fsync, rotate .bak1..3, main -> .bak1,
// tmp -> main, fsync dir. Any failure rolls .bak1 back to main, deletes tmp,
// flips the disk-failed flag, and keeps the packed payload in memory so the
// next save (or load) can still see it.
//
// Load walks main then .bak1..3; each candidate is checksum-verified and
// version-checked. A successful load from a backup re-saves main so the
// newest file is healthy again.
// =============================================================================

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info, warn};

use crate::brain::state::BrainState;
use crate::util::now_ts;

pub const PERSISTENCE_VERSION: &str = "penumbra-brain-v3";

/// Version tokens this build will load. Opaque strings; anything else is
/// skipped as unreadable.
const ACCEPTED_VERSIONS: &[&str] = &[
    "penumbra-brain-v1",
    "penumbra-brain-v2",
    PERSISTENCE_VERSION,
];

pub const MAX_BACKUPS: usize = 3;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    payload_sha: String,
    #[serde(with = "serde_bytes")]
    blob: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize, Default)]
#[serde(default)]
struct PayloadMeta {
    core_version_seen: String,
    schema_version: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Payload {
    v: String,
    timestamp: f64,
    meta: PayloadMeta,
    state: BrainState,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

struct FallbackState {
    disk_failed: bool,
    /// Packed payload bytes retained when the disk is refusing writes.
    memory_payload: Option<Vec<u8>>,
}

/// Handle to the brain snapshot file and its backup chain.
pub struct BrainStore {
    path: PathBuf,
    io_lock: tokio::sync::Mutex<()>,
    fallback: parking_lot::Mutex<FallbackState>,
}

impl BrainStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            io_lock: tokio::sync::Mutex::new(()),
            fallback: parking_lot::Mutex::new(FallbackState {
                disk_failed: false,
                memory_payload: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn backup_path(&self, n: usize) -> PathBuf {
        let mut s = self.path.as_os_str().to_os_string();
        s.push(format!(".bak{n}"));
        PathBuf::from(s)
    }

    /// Whether the last save hit a disk failure.
    pub fn disk_failed(&self) -> bool {
        self.fallback.lock().disk_failed
    }

    // ── Save ────────────────────────────────────────────────────────────

    /// Persist a snapshot. When the disk previously failed and `force` is
    /// false, the payload is only refreshed in memory.
    pub async fn save(&self, state: &BrainState, force: bool) -> Result<()> {
        let _io = self.io_lock.lock().await;
        self.save_locked(state, force)
    }

    fn save_locked(&self, state: &BrainState, force: bool) -> Result<()> {
        let payload_bytes = pack_payload(state)?;

        {
            let mut fb = self.fallback.lock();
            if fb.disk_failed && !force {
                fb.memory_payload = Some(payload_bytes);
                info!(component = "brain", "disk previously failed, snapshot kept in memory");
                return Ok(());
            }
        }

        let envelope = pack_envelope(&payload_bytes)?;

        match atomic_write(&self.path, &envelope, MAX_BACKUPS) {
            Ok(()) => {
                let mut fb = self.fallback.lock();
                fb.disk_failed = false;
                fb.memory_payload = None;
                info!(
                    component = "brain",
                    size_kb = envelope.len() / 1024,
                    path = %self.path.display(),
                    "brain saved"
                );
                Ok(())
            }
            Err(e) => {
                let mut fb = self.fallback.lock();
                fb.disk_failed = true;
                fb.memory_payload = Some(payload_bytes);
                error!(component = "brain", error = %e, "brain save failed, falling back to memory");
                Err(e)
            }
        }
    }

    // ── Load ────────────────────────────────────────────────────────────

    /// Load the freshest readable snapshot: memory fallback first, then main,
    /// then `.bak1..3`. Returns `None` when no snapshot exists anywhere.
    pub async fn load(&self, runtime_version: &str) -> Result<Option<BrainState>> {
        let _io = self.io_lock.lock().await;

        // Memory fallback takes precedence: it is strictly newer than disk.
        let mem = self.fallback.lock().memory_payload.take();
        if let Some(bytes) = mem {
            match unpack_payload(&bytes, runtime_version) {
                Ok(state) => {
                    info!(component = "brain", "state restored from memory fallback");
                    return Ok(Some(state));
                }
                Err(e) => {
                    warn!(component = "brain", error = %e, "memory fallback unreadable, trying disk");
                }
            }
        }

        for i in 0..=MAX_BACKUPS {
            let path = if i == 0 {
                self.path.clone()
            } else {
                self.backup_path(i)
            };
            if !path.exists() {
                continue;
            }

            let state = match read_snapshot(&path, runtime_version) {
                Ok(state) => state,
                Err(e) => {
                    warn!(
                        component = "brain",
                        path = %path.display(),
                        error = %e,
                        "snapshot candidate unreadable, skipping"
                    );
                    continue;
                }
            };

            info!(
                component = "brain",
                path = %path.display(),
                positions = state.positions.len(),
                "brain restored"
            );

            // Heal forward: a backup restore re-writes main.
            if i != 0 {
                if let Err(e) = self.save_locked(&state, true) {
                    warn!(component = "brain", error = %e, "heal-forward save failed");
                }
            }

            self.fallback.lock().disk_failed = false;
            return Ok(Some(state));
        }

        info!(component = "brain", "no snapshot found, starting fresh");
        Ok(None)
    }
}

// ---------------------------------------------------------------------------
// Codec
// ---------------------------------------------------------------------------

fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn pack_payload(state: &BrainState) -> Result<Vec<u8>> {
    // Serialize a repaired copy so disk content is always canonical.
    let mut snapshot = state.clone();
    snapshot.validate();
    snapshot.recompute_derived();

    let payload = Payload {
        v: PERSISTENCE_VERSION.to_string(),
        timestamp: now_ts(),
        meta: PayloadMeta {
            core_version_seen: snapshot.version.clone(),
            schema_version: snapshot.schema_version,
        },
        state: snapshot,
    };
    rmp_serde::to_vec_named(&payload).context("failed to pack brain payload")
}

fn pack_envelope(payload_bytes: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = lz4_flex::frame::FrameEncoder::new(Vec::new());
    encoder
        .write_all(payload_bytes)
        .context("lz4 compression failed")?;
    let compressed = encoder.finish().context("lz4 finish failed")?;

    let envelope = Envelope {
        checksum: sha256_hex(&compressed),
        payload_sha: sha256_hex(payload_bytes),
        blob: compressed,
    };
    rmp_serde::to_vec_named(&envelope).context("failed to pack envelope")
}

fn unpack_envelope(raw: &[u8]) -> Result<Vec<u8>> {
    let envelope: Envelope =
        rmp_serde::from_slice(raw).context("envelope is not valid msgpack")?;

    if sha256_hex(&envelope.blob) != envelope.checksum {
        bail!("envelope checksum mismatch");
    }

    let mut decoder = lz4_flex::frame::FrameDecoder::new(envelope.blob.as_slice());
    let mut payload_bytes = Vec::new();
    std::io::Read::read_to_end(&mut decoder, &mut payload_bytes)
        .context("lz4 decompression failed")?;

    if !envelope.payload_sha.is_empty() && sha256_hex(&payload_bytes) != envelope.payload_sha {
        // Checksum over the compressed blob is authoritative; this is telemetry.
        warn!(component = "brain", "payload sha mismatch (continuing)");
    }

    Ok(payload_bytes)
}

fn unpack_payload(payload_bytes: &[u8], runtime_version: &str) -> Result<BrainState> {
    let payload: Payload =
        rmp_serde::from_slice(payload_bytes).context("payload is not valid msgpack")?;

    if !ACCEPTED_VERSIONS.contains(&payload.v.as_str()) {
        bail!("unsupported persistence version {:?}", payload.v);
    }

    Ok(BrainState::from_loaded(payload.state, runtime_version))
}

fn read_snapshot(path: &Path, runtime_version: &str) -> Result<BrainState> {
    let raw = fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    let payload_bytes = unpack_envelope(&raw)?;
    unpack_payload(&payload_bytes, runtime_version)
}

// ---------------------------------------------------------------------------
// Atomic write with backup rotation
// ---------------------------------------------------------------------------

fn fsync_best_effort(path: &Path) {
    if let Ok(f) = fs::File::open(path) {
        let _ = f.sync_all();
    }
}

fn rotate_backups(path: &Path, max_backups: usize) {
    let bak = |n: usize| {
        let mut s = path.as_os_str().to_os_string();
        s.push(format!(".bak{n}"));
        PathBuf::from(s)
    };

    let oldest = bak(max_backups);
    if oldest.exists() {
        let _ = fs::remove_file(&oldest);
    }
    for i in (1..max_backups).rev() {
        let src = bak(i);
        if src.exists() {
            let _ = fs::rename(&src, bak(i + 1));
        }
    }
}

/// Write `data` to `path` with rollback: tmp + fsync, rotate backups,
/// main -> .bak1, tmp -> main, fsync dir. On failure .bak1 is restored to
/// main and the tmp file removed before the error propagates.
fn atomic_write(path: &Path, data: &[u8], max_backups: usize) -> Result<()> {
    if let Some(dir) = path.parent() {
        if !dir.as_os_str().is_empty() {
            fs::create_dir_all(dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
    }

    let tmp = {
        let mut s = path.as_os_str().to_os_string();
        s.push(".tmp");
        PathBuf::from(s)
    };
    let bak1 = {
        let mut s = path.as_os_str().to_os_string();
        s.push(".bak1");
        PathBuf::from(s)
    };

    {
        let mut f = fs::File::create(&tmp)
            .with_context(|| format!("failed to create {}", tmp.display()))?;
        f.write_all(data)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        f.sync_all().context("fsync of tmp snapshot failed")?;
    }

    rotate_backups(path, max_backups);

    let main_existed = path.exists();
    if main_existed {
        let _ = fs::rename(path, &bak1);
    }

    if let Err(e) = fs::rename(&tmp, path) {
        // Rollback: restore the previous main, drop the tmp.
        if bak1.exists() {
            let _ = fs::rename(&bak1, path);
        }
        let _ = fs::remove_file(&tmp);
        return Err(e).with_context(|| format!("failed to move snapshot into {}", path.display()));
    }

    if let Some(dir) = path.parent() {
        fsync_best_effort(dir);
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::brain::state::{Position, Side};

    fn sample_state() -> BrainState {
        let mut st = BrainState::new();
        st.apply_fill("BTC/USDT:USDT", Side::Long, 0.5, 42_000.0, 150.0, 20, 0.81, 1_000.0);
        st.blacklist_symbol("DOGEUSDT", 3_600.0, "3 consecutive losses", 1_000.0);
        st.total_trades = 7;
        st.total_wins = 4;
        st.record_equity(250.0, 1_000.0);
        st.note_exit_order("exit-1");
        st.validate();
        st.recompute_derived();
        st
    }

    #[tokio::test]
    async fn roundtrip_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = BrainStore::new(dir.path().join("brain.lz4"));

        let st = sample_state();
        store.save(&st, false).await.unwrap();

        let loaded = store.load("test-core").await.unwrap().expect("snapshot exists");
        assert_eq!(loaded.total_trades, 7);
        assert_eq!(loaded.total_wins, 4);
        assert!(loaded.positions.contains_key("BTCUSDT"));
        assert!(loaded.blacklist.contains_key("DOGEUSDT"));
        assert!(loaded.known_exit_order_ids.contains("exit-1"));
        assert!((loaded.current_equity - 250.0).abs() < f64::EPSILON);
        // Runtime version is preserved, not the disk's.
        assert_eq!(loaded.version, "test-core");
    }

    #[tokio::test]
    async fn saving_canonical_state_is_a_fixed_point() {
        let dir = tempfile::tempdir().unwrap();
        let store = BrainStore::new(dir.path().join("brain.lz4"));

        let st = sample_state();
        store.save(&st, false).await.unwrap();
        let first = store.load("v").await.unwrap().unwrap();

        store.save(&first, false).await.unwrap();
        let second = store.load("v").await.unwrap().unwrap();

        assert_eq!(first.positions.len(), second.positions.len());
        assert_eq!(first.total_trades, second.total_trades);
        assert_eq!(
            first.positions["BTCUSDT"].entry_price,
            second.positions["BTCUSDT"].entry_price
        );
    }

    #[tokio::test]
    async fn backup_rotation_keeps_chain_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("brain.lz4");
        let store = BrainStore::new(&main);

        let st = sample_state();
        for _ in 0..6 {
            store.save(&st, false).await.unwrap();
        }

        assert!(main.exists());
        assert!(store.backup_path(1).exists());
        assert!(store.backup_path(2).exists());
        assert!(store.backup_path(3).exists());
        assert!(!store.backup_path(4).exists());
    }

    #[tokio::test]
    async fn corrupt_main_falls_back_to_backup_and_heals() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("brain.lz4");
        let store = BrainStore::new(&main);

        let st = sample_state();
        store.save(&st, false).await.unwrap();
        store.save(&st, false).await.unwrap(); // main + bak1 both valid

        fs::write(&main, b"garbage garbage garbage").unwrap();

        let loaded = store.load("v").await.unwrap().expect("bak1 recovers");
        assert_eq!(loaded.total_trades, 7);

        // Heal-forward rewrote main; it must now load standalone.
        let healed = read_snapshot(&main, "v").unwrap();
        assert_eq!(healed.total_trades, 7);
    }

    #[tokio::test]
    async fn crash_between_rotate_and_rename_is_recoverable() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("brain.lz4");
        let store = BrainStore::new(&main);

        let st = sample_state();
        store.save(&st, false).await.unwrap();

        // Simulate a crash mid-save: backups rotated and main already moved
        // to .bak1, but tmp never made it to main.
        fs::rename(&main, store.backup_path(1)).unwrap();
        fs::write(main.with_extension("lz4.tmp"), b"half-written").unwrap();

        let loaded = store
            .load("v")
            .await
            .unwrap()
            .expect("pre-crash snapshot recoverable");
        assert_eq!(loaded.total_trades, 7);
        assert!(loaded.positions.contains_key("BTCUSDT"));
        assert!(loaded.blacklist.contains_key("DOGEUSDT"));
    }

    #[tokio::test]
    async fn unsupported_version_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let main = dir.path().join("brain.lz4");
        let store = BrainStore::new(&main);

        // Hand-pack an envelope carrying an alien version token.
        let payload = Payload {
            v: "someone-elses-format-v9".to_string(),
            timestamp: 0.0,
            meta: PayloadMeta::default(),
            state: sample_state(),
        };
        let payload_bytes = rmp_serde::to_vec_named(&payload).unwrap();
        let envelope = pack_envelope(&payload_bytes).unwrap();
        fs::write(&main, envelope).unwrap();

        assert!(store.load("v").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn missing_file_loads_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = BrainStore::new(dir.path().join("brain.lz4"));
        assert!(store.load("v").await.unwrap().is_none());
    }

    #[test]
    fn checksum_mismatch_rejected() {
        let payload_bytes = pack_payload(&sample_state()).unwrap();
        let mut envelope_bytes = pack_envelope(&payload_bytes).unwrap();
        // Flip a byte somewhere in the blob region.
        let n = envelope_bytes.len();
        envelope_bytes[n - 10] ^= 0xFF;
        assert!(unpack_envelope(&envelope_bytes).is_err());
    }
}
