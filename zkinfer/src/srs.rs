//! Structured reference strings: powers of a secret point over M31.
//!
//! A string of degree `k` holds `τ^0 .. τ^(2^k - 1)` and serves every circuit
//! whose required degree is at most `k`. Strings live in a process-wide
//! cache that is created on first use and never torn down; on disk they are
//! stored as `srs_dir/kzg{k}.srs` in a small binary format.
//!
//! File format:
//!
//! ```text
//! MAGIC "ZSRS" (4) | version (4) | degree (4) | seed (8) | count (8) | powers (4 * count)
//! ```
//!
//! A file is only trusted when its header degree matches the degree in its
//! name and its length matches the header.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};

use blake2::{Blake2s256, Digest};
use num_traits::{One, Zero};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, info_span, warn};

use crate::fields::m31::M31;
use crate::hash::{ContentHash, ContentHasher};

/// Binary format version. Bump on layout changes.
const SRS_VERSION: u32 = 1;
/// Magic bytes: "ZSRS".
const MAGIC: [u8; 4] = *b"ZSRS";
/// Powers computed per parallel task.
const CHUNK: usize = 1 << 12;
/// Bytes before the first power.
const HEADER_LEN: u64 = 28;
/// Largest degree a file may declare.
pub const MAX_SRS_DEGREE: u32 = 30;

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Where strings come from and how large they may get.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SrsConfig {
    pub dir: PathBuf,
    /// Seed the secret point is derived from.
    pub seed: u64,
    pub max_degree: u32,
    /// Derive and persist missing strings instead of failing.
    pub allow_generation: bool,
}

impl Default for SrsConfig {
    fn default() -> Self {
        Self {
            dir: std::env::temp_dir().join("zkinfer-srs"),
            seed: 0x5eed,
            max_degree: 24,
            allow_generation: true,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SrsError {
    #[error("no parameters of degree {degree}: {reason}")]
    UnavailableParameters { degree: u32, reason: String },
    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
    #[error("corrupt parameter file {path}: {reason}")]
    Corrupt { path: String, reason: String },
}

/// Powers of the secret point `τ`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceString {
    degree: u32,
    seed: u64,
    digest: ContentHash,
    powers: Vec<M31>,
}

impl fmt::Debug for ReferenceString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReferenceString")
            .field("degree", &self.degree)
            .field("seed", &self.seed)
            .field("digest", &self.digest)
            .finish()
    }
}

/// The secret point for `seed`. Never 0 or 1.
fn derive_tau(seed: u64) -> M31 {
    let mut hasher = Blake2s256::new();
    hasher.update(b"zkinfer/srs/tau");
    hasher.update(seed.to_le_bytes());
    let out = hasher.finalize();
    let raw = u32::from_le_bytes([out[0], out[1], out[2], out[3]]);
    let tau = M31::reduce(raw as u64);
    if tau.is_zero() || tau.is_one() {
        M31::from(2u32)
    } else {
        tau
    }
}

fn digest_of(degree: u32, seed: u64, powers: &[M31]) -> ContentHash {
    let bytes: Vec<u8> = powers.iter().flat_map(|p| p.to_le_bytes()).collect();
    ContentHasher::new("zkinfer/srs/v1")
        .u64(degree as u64)
        .u64(seed)
        .bytes(&bytes)
        .finish()
}

impl ReferenceString {
    /// Deterministically derive the string of `degree` for `seed`.
    pub fn generate(seed: u64, degree: u32) -> Self {
        let tau = derive_tau(seed);
        let mut powers = vec![M31::zero(); 1usize << degree];
        powers
            .par_chunks_mut(CHUNK)
            .enumerate()
            .for_each(|(c, chunk)| {
                let mut acc = tau.pow((c * CHUNK) as u64);
                for p in chunk.iter_mut() {
                    *p = acc;
                    acc *= tau;
                }
            });
        let digest = digest_of(degree, seed, &powers);
        Self {
            degree,
            seed,
            digest,
            powers,
        }
    }

    pub fn degree(&self) -> u32 {
        self.degree
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn size(&self) -> usize {
        self.powers.len()
    }

    pub fn powers(&self) -> &[M31] {
        &self.powers
    }

    pub fn digest(&self) -> ContentHash {
        self.digest
    }

    /// Commit to `values` split into columns of `size()`: `Σ col[i]·τ^i` per column.
    pub fn commit_columns(&self, values: &[M31]) -> Vec<M31> {
        values
            .chunks(self.size().max(1))
            .map(|col| col.iter().zip(&self.powers).map(|(v, p)| *v * *p).sum())
            .collect()
    }

    /// Write atomically: temp file in the same directory, then rename.
    pub fn save(&self, path: &Path) -> Result<(), SrsError> {
        let io_err = |source| SrsError::Io {
            path: path.display().to_string(),
            source,
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let tmp = path.with_extension(format!(
            "tmp.{}.{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        if let Err(source) = self
            .write_file(&tmp)
            .and_then(|()| std::fs::rename(&tmp, path))
        {
            let _ = std::fs::remove_file(&tmp);
            return Err(io_err(source));
        }
        Ok(())
    }

    fn write_file(&self, path: &Path) -> io::Result<()> {
        let file = std::fs::File::create(path)?;
        let mut w = BufWriter::with_capacity(1 << 20, file);
        self.write_to(&mut w)?;
        w.flush()
    }

    fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
        w.write_all(&MAGIC)?;
        w.write_all(&SRS_VERSION.to_le_bytes())?;
        w.write_all(&self.degree.to_le_bytes())?;
        w.write_all(&self.seed.to_le_bytes())?;
        w.write_all(&(self.powers.len() as u64).to_le_bytes())?;
        for p in &self.powers {
            w.write_all(&p.to_le_bytes())?;
        }
        Ok(())
    }

    /// Read the string stored at `path`, which must hold exactly `degree`.
    pub fn load(path: &Path, degree: u32) -> Result<Self, SrsError> {
        let corrupt = |reason: String| SrsError::Corrupt {
            path: path.display().to_string(),
            reason,
        };
        let io_err = |source: io::Error| {
            if source.kind() == io::ErrorKind::UnexpectedEof {
                SrsError::Corrupt {
                    path: path.display().to_string(),
                    reason: "truncated".to_string(),
                }
            } else {
                SrsError::Io {
                    path: path.display().to_string(),
                    source,
                }
            }
        };

        let file = std::fs::File::open(path).map_err(io_err)?;
        let file_len = file.metadata().map_err(io_err)?.len();
        let mut r = BufReader::with_capacity(1 << 20, file);

        let mut magic = [0u8; 4];
        r.read_exact(&mut magic).map_err(io_err)?;
        if magic != MAGIC {
            return Err(corrupt("not a reference string file".to_string()));
        }
        let version = read_u32(&mut r).map_err(io_err)?;
        if version != SRS_VERSION {
            return Err(corrupt(format!(
                "unsupported version {version}, expected {SRS_VERSION}"
            )));
        }
        let header_degree = read_u32(&mut r).map_err(io_err)?;
        let seed = read_u64(&mut r).map_err(io_err)?;
        let count = read_u64(&mut r).map_err(io_err)?;
        if header_degree > MAX_SRS_DEGREE {
            return Err(corrupt(format!(
                "degree {header_degree} exceeds {MAX_SRS_DEGREE}"
            )));
        }
        if header_degree != degree {
            return Err(corrupt(format!(
                "holds degree {header_degree}, expected {degree}"
            )));
        }
        if count != 1u64 << degree {
            return Err(corrupt(format!("{count} powers for degree {degree}")));
        }
        let expected_len = HEADER_LEN + 4 * count;
        if file_len != expected_len {
            return Err(corrupt(format!(
                "{file_len} bytes, expected {expected_len}"
            )));
        }

        let mut powers = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let v = read_u32(&mut r).map_err(io_err)?;
            let p = M31::from_canonical(v)
                .ok_or_else(|| corrupt(format!("non-canonical element {v}")))?;
            powers.push(p);
        }
        if powers[0] != M31::one() || (powers.len() > 1 && powers[1] != derive_tau(seed)) {
            return Err(corrupt(format!("powers do not match seed {seed}")));
        }

        let digest = digest_of(degree, seed, &powers);
        Ok(Self {
            degree,
            seed,
            digest,
            powers,
        })
    }
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Path of the string of `degree` under `dir`.
pub fn srs_path(dir: &Path, degree: u32) -> PathBuf {
    dir.join(format!("kzg{degree}.srs"))
}

type SlotKey = (u64, u32);

/// In-memory store of reference strings keyed by `(seed, degree)`.
///
/// Append-only. Readers never block each other; acquirers of the same
/// degree class serialize on a per-class slot so each class is produced once.
#[derive(Default)]
pub struct SrsCache {
    strings: RwLock<BTreeMap<SlotKey, Arc<ReferenceString>>>,
    slots: Mutex<HashMap<SlotKey, Arc<Mutex<()>>>>,
    generated: AtomicUsize,
    loaded: AtomicUsize,
}

impl SrsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Smallest cached string for `seed` with degree in `[min_degree, max_degree]`.
    pub fn get(&self, seed: u64, min_degree: u32, max_degree: u32) -> Option<Arc<ReferenceString>> {
        if min_degree > max_degree {
            return None;
        }
        let strings = self.strings.read().unwrap_or_else(PoisonError::into_inner);
        strings
            .range((seed, min_degree)..=(seed, max_degree))
            .next()
            .map(|(_, srs)| Arc::clone(srs))
    }

    pub fn insert(&self, srs: Arc<ReferenceString>) {
        let mut strings = self.strings.write().unwrap_or_else(PoisonError::into_inner);
        strings.entry((srs.seed(), srs.degree())).or_insert(srs);
    }

    pub fn len(&self) -> usize {
        self.strings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Strings derived from scratch by this cache.
    pub fn generated_count(&self) -> usize {
        self.generated.load(Ordering::SeqCst)
    }

    /// Strings read from disk by this cache.
    pub fn loaded_count(&self) -> usize {
        self.loaded.load(Ordering::SeqCst)
    }

    fn slot(&self, key: SlotKey) -> Arc<Mutex<()>> {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(slots.entry(key).or_default())
    }
}

static GLOBAL_SRS_CACHE: OnceLock<Arc<SrsCache>> = OnceLock::new();

/// The process-wide cache, created on first use.
pub fn global_srs_cache() -> Arc<SrsCache> {
    Arc::clone(GLOBAL_SRS_CACHE.get_or_init(|| Arc::new(SrsCache::new())))
}

/// Hands out reference strings for a config, backed by a shared cache.
#[derive(Clone)]
pub struct SrsManager {
    config: SrsConfig,
    cache: Arc<SrsCache>,
}

impl SrsManager {
    /// Manager over the process-wide cache.
    pub fn new(config: SrsConfig) -> Self {
        Self::with_cache(config, global_srs_cache())
    }

    pub fn with_cache(config: SrsConfig, cache: Arc<SrsCache>) -> Self {
        Self { config, cache }
    }

    pub fn config(&self) -> &SrsConfig {
        &self.config
    }

    pub fn cache(&self) -> &Arc<SrsCache> {
        &self.cache
    }

    /// A string of degree at least `min_degree`.
    pub fn acquire(&self, min_degree: u32) -> Result<Arc<ReferenceString>, SrsError> {
        let _span = info_span!("srs", min_degree).entered();
        let SrsConfig {
            dir,
            seed,
            max_degree,
            allow_generation,
        } = &self.config;

        if min_degree > *max_degree {
            return Err(SrsError::UnavailableParameters {
                degree: min_degree,
                reason: format!("exceeds configured max degree {max_degree}"),
            });
        }
        if let Some(srs) = self.cache.get(*seed, min_degree, *max_degree) {
            debug!(degree = srs.degree(), "cache hit");
            return Ok(srs);
        }

        let slot = self.cache.slot((*seed, min_degree));
        let _guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
        // Another acquirer may have produced it while we waited.
        if let Some(srs) = self.cache.get(*seed, min_degree, *max_degree) {
            return Ok(srs);
        }

        for degree in min_degree..=*max_degree {
            let path = srs_path(dir, degree);
            if !path.exists() {
                continue;
            }
            let srs = match ReferenceString::load(&path, degree) {
                Ok(srs) => srs,
                Err(err @ SrsError::Corrupt { .. }) if *allow_generation => {
                    warn!(degree, error = %err, "ignoring unreadable reference string");
                    continue;
                }
                Err(err) => return Err(err),
            };
            if srs.seed() != *seed {
                return Err(SrsError::Corrupt {
                    path: path.display().to_string(),
                    reason: format!("seed {} does not match configured {seed}", srs.seed()),
                });
            }
            info!(degree, path = %path.display(), "loaded reference string");
            let srs = Arc::new(srs);
            self.cache.loaded.fetch_add(1, Ordering::SeqCst);
            self.cache.insert(Arc::clone(&srs));
            return Ok(srs);
        }

        if !allow_generation {
            return Err(SrsError::UnavailableParameters {
                degree: min_degree,
                reason: format!("no file in {} and generation disabled", dir.display()),
            });
        }

        let t_start = std::time::Instant::now();
        let srs = ReferenceString::generate(*seed, min_degree);
        let path = srs_path(dir, min_degree);
        srs.save(&path)?;
        info!(
            degree = min_degree,
            path = %path.display(),
            elapsed_ms = t_start.elapsed().as_millis() as u64,
            "generated reference string"
        );
        let srs = Arc::new(srs);
        self.cache.generated.fetch_add(1, Ordering::SeqCst);
        self.cache.insert(Arc::clone(&srs));
        Ok(srs)
    }
}
