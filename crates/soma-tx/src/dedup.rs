//! Dual-layer deduplication: exact content hashes plus MinHash/LSH
//! near-duplicate retrieval.
//!
//! Exact detection keys on the first 16 bytes of `sha256(normalized_text)`.
//! Near-duplicate detection shingles the text into character n-grams,
//! computes a 128-permutation MinHash signature, and retrieves candidates
//! through a banded LSH index (16 bands x 8 rows, which retrieves Jaccard
//! >= 0.85 pairs with probability ~0.99). Candidates are verified with the
//! true Jaccard over stored shingle-hash sets before a record is rejected.
//!
//! The engine is single-reader/single-writer and must only be called from
//! the orchestration thread. State may be snapshotted per source to a single
//! file and reloaded on the next run; an unreadable snapshot is a warning,
//! not an error, and the engine starts empty.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use soma_core::QualityConfig;

pub const NUM_PERMUTATIONS: usize = 128;
pub const LSH_BANDS: usize = 16;
pub const LSH_ROWS: usize = 8;

/// Mersenne prime 2^61 - 1, the modulus of the permutation family.
const MERSENNE_61: u64 = (1 << 61) - 1;

/// Seed of the permutation family. Fixed so that signatures persisted in a
/// snapshot stay comparable across runs and builds.
const PERMUTATION_SEED: u64 = 0x534f_4d41_5f4c_5348;

/// Texts shorter than this bypass dedup entirely; the filter chain is
/// expected to reject them anyway.
const DEDUP_MIN_CHARS: usize = 3;

/// Decision for one candidate text.
#[derive(Debug, Clone, PartialEq)]
pub enum DedupVerdict {
    Unique,
    ExactDuplicate,
    NearDuplicate { similarity: f64 },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocEntry {
    signature: Vec<u64>,
    shingles: Vec<u64>,
}

/// On-disk snapshot shape. Parameters are stored so a snapshot computed
/// under different settings is detected and discarded.
#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    shingle_size: usize,
    similarity_threshold: f64,
    num_permutations: usize,
    hashes: Vec<String>,
    docs: Vec<DocEntry>,
}

pub struct DedupEngine {
    shingle_size: usize,
    similarity_threshold: f64,
    perms: Vec<(u64, u64)>,
    seen_hashes: HashSet<[u8; 16]>,
    docs: Vec<DocEntry>,
    /// (band index, band hash) -> doc indexes.
    bands: HashMap<(usize, u64), Vec<usize>>,
    snapshot_path: Option<PathBuf>,
}

impl DedupEngine {
    pub fn new(quality: &QualityConfig) -> Self {
        Self {
            shingle_size: quality.shingle_size,
            similarity_threshold: quality.similarity_threshold,
            perms: permutations(NUM_PERMUTATIONS),
            seen_hashes: HashSet::new(),
            docs: Vec::new(),
            bands: HashMap::new(),
            snapshot_path: None,
        }
    }

    /// Engine bound to a per-source snapshot file; loads any prior state.
    pub fn with_snapshot(quality: &QualityConfig, path: &Path) -> Self {
        let mut engine = Self::new(quality);
        engine.snapshot_path = Some(path.to_path_buf());
        match std::fs::read(path) {
            Ok(bytes) => match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) => engine.restore(snapshot),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "corrupt dedup snapshot, starting empty");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable dedup snapshot, starting empty");
            }
        }
        engine
    }

    fn restore(&mut self, snapshot: Snapshot) {
        if snapshot.shingle_size != self.shingle_size
            || snapshot.num_permutations != NUM_PERMUTATIONS
        {
            warn!(
                snapshot_shingle = snapshot.shingle_size,
                configured_shingle = self.shingle_size,
                "dedup snapshot parameters do not match configuration, starting empty"
            );
            return;
        }
        for hash_hex in &snapshot.hashes {
            if let Ok(bytes) = hex::decode(hash_hex) {
                if bytes.len() == 16 {
                    let mut key = [0u8; 16];
                    key.copy_from_slice(&bytes);
                    self.seen_hashes.insert(key);
                }
            }
        }
        for doc in snapshot.docs {
            self.index_doc(doc);
        }
        debug!(
            hashes = self.seen_hashes.len(),
            docs = self.docs.len(),
            "dedup snapshot loaded"
        );
    }

    pub fn exact_len(&self) -> usize {
        self.seen_hashes.len()
    }

    pub fn index_len(&self) -> usize {
        self.docs.len()
    }

    /// Check one cleaned text against both layers and index it when unique.
    /// Near-duplicate and exact-duplicate texts are not indexed.
    pub fn check_and_insert(&mut self, text: &str) -> DedupVerdict {
        if text.chars().count() < DEDUP_MIN_CHARS {
            return DedupVerdict::Unique;
        }

        let content = content_hash(text);
        if self.seen_hashes.contains(&content) {
            return DedupVerdict::ExactDuplicate;
        }

        let shingles = shingle_set(text, self.shingle_size);
        if shingles.is_empty() {
            self.seen_hashes.insert(content);
            return DedupVerdict::Unique;
        }

        let signature = self.signature(&shingles);
        if let Some(similarity) = self.best_candidate_similarity(&signature, &shingles) {
            if similarity >= self.similarity_threshold {
                return DedupVerdict::NearDuplicate { similarity };
            }
        }

        self.seen_hashes.insert(content);
        self.index_doc(DocEntry {
            signature,
            shingles: shingles.into_iter().collect(),
        });
        DedupVerdict::Unique
    }

    /// Highest true Jaccard among LSH candidates, if any band collides.
    fn best_candidate_similarity(
        &self,
        signature: &[u64],
        shingles: &BTreeSet<u64>,
    ) -> Option<f64> {
        let mut candidates: BTreeSet<usize> = BTreeSet::new();
        for band in 0..LSH_BANDS {
            let key = (band, band_hash(signature, band));
            if let Some(indexes) = self.bands.get(&key) {
                candidates.extend(indexes.iter().copied());
            }
        }
        candidates
            .into_iter()
            .map(|idx| {
                let other: BTreeSet<u64> = self.docs[idx].shingles.iter().copied().collect();
                jaccard(shingles, &other)
            })
            .fold(None, |best, sim| match best {
                Some(b) if b >= sim => Some(b),
                _ => Some(sim),
            })
    }

    fn index_doc(&mut self, doc: DocEntry) {
        let idx = self.docs.len();
        for band in 0..LSH_BANDS {
            let key = (band, band_hash(&doc.signature, band));
            self.bands.entry(key).or_default().push(idx);
        }
        self.docs.push(doc);
    }

    fn signature(&self, shingles: &BTreeSet<u64>) -> Vec<u64> {
        self.perms
            .iter()
            .map(|(a, b)| {
                shingles
                    .iter()
                    .map(|&s| permute(s, *a, *b))
                    .min()
                    .unwrap_or(u64::MAX)
            })
            .collect()
    }

    /// Persist the engine state atomically (write-to-temp then rename).
    /// No-op when the engine was built without a snapshot path.
    pub fn save(&self) -> Result<()> {
        let Some(path) = &self.snapshot_path else {
            return Ok(());
        };
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dedup dir {}", parent.display()))?;

        let snapshot = Snapshot {
            version: 1,
            shingle_size: self.shingle_size,
            similarity_threshold: self.similarity_threshold,
            num_permutations: NUM_PERMUTATIONS,
            hashes: self.seen_hashes.iter().map(hex::encode).collect(),
            docs: self.docs.clone(),
        };

        let mut tmp = tempfile::Builder::new()
            .prefix(".tmp-")
            .tempfile_in(parent)
            .context("create dedup snapshot temp file")?;
        tmp.write_all(&serde_json::to_vec(&snapshot)?)?;
        tmp.flush()?;
        tmp.persist(path)
            .map_err(|e| anyhow::anyhow!("persist dedup snapshot: {e}"))?;
        debug!(path = %path.display(), docs = self.docs.len(), "dedup snapshot saved");
        Ok(())
    }
}

/// First 16 bytes of sha256 over the text.
pub fn content_hash(text: &str) -> [u8; 16] {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    let mut key = [0u8; 16];
    key.copy_from_slice(&digest[..16]);
    key
}

/// Hash set of character n-gram shingles. Returns the empty set when the
/// text is shorter than one shingle.
pub fn shingle_set(text: &str, size: usize) -> BTreeSet<u64> {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() < size || size == 0 {
        return BTreeSet::new();
    }
    let mut set = BTreeSet::new();
    for window in chars.windows(size) {
        let shingle: String = window.iter().collect();
        set.insert(fnv1a64(shingle.as_bytes()));
    }
    set
}

/// Jaccard similarity of two shingle-hash sets.
pub fn jaccard(a: &BTreeSet<u64>, b: &BTreeSet<u64>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

fn permute(value: u64, a: u64, b: u64) -> u64 {
    let product = (a as u128 * (value % MERSENNE_61) as u128 + b as u128) % MERSENNE_61 as u128;
    product as u64
}

fn band_hash(signature: &[u64], band: usize) -> u64 {
    let start = band * LSH_ROWS;
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for value in &signature[start..start + LSH_ROWS] {
        for byte in value.to_le_bytes() {
            h ^= byte as u64;
            h = h.wrapping_mul(0x0000_0100_0000_01b3);
        }
    }
    h
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for &byte in bytes {
        h ^= byte as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h
}

/// Deterministic permutation constants from a splitmix64 stream.
fn permutations(count: usize) -> Vec<(u64, u64)> {
    let mut state = PERMUTATION_SEED;
    let mut next = move || {
        state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
        let mut z = state;
        z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
        z ^ (z >> 31)
    };
    (0..count)
        .map(|_| {
            // `a` must be non-zero mod p for the family to be universal
            let a = (next() % (MERSENNE_61 - 1)) + 1;
            let b = next() % MERSENNE_61;
            (a, b)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quality() -> QualityConfig {
        QualityConfig::default()
    }

    #[test]
    fn exact_duplicate_is_detected() {
        let mut engine = DedupEngine::new(&quality());
        let text = "Soomaaliya waa waddan ku yaal Geeska Afrika.";
        assert_eq!(engine.check_and_insert(text), DedupVerdict::Unique);
        assert_eq!(engine.check_and_insert(text), DedupVerdict::ExactDuplicate);
        assert_eq!(engine.exact_len(), 1);
    }

    #[test]
    fn ultra_short_text_bypasses_dedup() {
        let mut engine = DedupEngine::new(&quality());
        assert_eq!(engine.check_and_insert("ab"), DedupVerdict::Unique);
        assert_eq!(engine.check_and_insert("ab"), DedupVerdict::Unique);
        assert_eq!(engine.exact_len(), 0);
    }

    #[test]
    fn near_duplicate_decision_matches_direct_jaccard() {
        let a = "Muqdisho waa caasimadda Soomaaliya.";
        let b = "Muqdisho waa caasimadda dalka Soomaaliya.";
        let q = quality();
        let direct = jaccard(&shingle_set(a, q.shingle_size), &shingle_set(b, q.shingle_size));

        let mut engine = DedupEngine::new(&q);
        assert_eq!(engine.check_and_insert(a), DedupVerdict::Unique);
        let verdict = engine.check_and_insert(b);
        if direct >= q.similarity_threshold {
            match verdict {
                DedupVerdict::NearDuplicate { similarity } => {
                    assert!((similarity - direct).abs() < 1e-9)
                }
                other => panic!("expected near duplicate, got {other:?}"),
            }
        } else {
            assert_eq!(verdict, DedupVerdict::Unique);
        }
    }

    #[test]
    fn near_duplicate_detection_is_symmetric() {
        // identical texts modulo a small tail; Jaccard is far above threshold
        let a = "Wasiirka arrimaha dibadda ayaa maanta la kulmay ergada Qaramada Midoobay si ay ugala hadlaan xaaladda.";
        let b = "Wasiirka arrimaha dibadda ayaa maanta la kulmay ergada Qaramada Midoobay si ay ugala hadlaan xaaladda!";
        let q = quality();
        let direct = jaccard(&shingle_set(a, q.shingle_size), &shingle_set(b, q.shingle_size));
        assert!(direct >= q.similarity_threshold, "fixture drifted: {direct}");

        let mut ab = DedupEngine::new(&q);
        ab.check_and_insert(a);
        assert!(matches!(
            ab.check_and_insert(b),
            DedupVerdict::NearDuplicate { .. }
        ));

        let mut ba = DedupEngine::new(&q);
        ba.check_and_insert(b);
        assert!(matches!(
            ba.check_and_insert(a),
            DedupVerdict::NearDuplicate { .. }
        ));
    }

    #[test]
    fn unrelated_texts_are_both_kept() {
        let mut engine = DedupEngine::new(&quality());
        assert_eq!(
            engine.check_and_insert("Ciyaaraha Olombikada ayaa ka furmay magaalada Paris."),
            DedupVerdict::Unique
        );
        assert_eq!(
            engine.check_and_insert("Baraha bulshada ayaa laga wadaagay muuqaallo roob mahiigaan ah."),
            DedupVerdict::Unique
        );
        assert_eq!(engine.index_len(), 2);
    }

    #[test]
    fn snapshot_round_trip_preserves_decisions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wikipedia-somali.snapshot");
        let q = quality();
        let text = "Soomaaliya waa waddan ku yaal Geeska Afrika, xeebtiisuna waa tan ugu dheer Afrika.";

        {
            let mut engine = DedupEngine::with_snapshot(&q, &path);
            assert_eq!(engine.check_and_insert(text), DedupVerdict::Unique);
            engine.save().unwrap();
        }

        let mut reloaded = DedupEngine::with_snapshot(&q, &path);
        assert_eq!(reloaded.exact_len(), 1);
        assert_eq!(reloaded.index_len(), 1);
        assert_eq!(reloaded.check_and_insert(text), DedupVerdict::ExactDuplicate);
    }

    #[test]
    fn corrupt_snapshot_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bbc-somali.snapshot");
        std::fs::write(&path, b"not json at all").unwrap();
        let engine = DedupEngine::with_snapshot(&quality(), &path);
        assert_eq!(engine.exact_len(), 0);
        assert_eq!(engine.index_len(), 0);
    }

    #[test]
    fn mismatched_snapshot_parameters_are_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tiktok.snapshot");
        let mut other = QualityConfig::default();
        other.shingle_size = 7;
        {
            let mut engine = DedupEngine::with_snapshot(&other, &path);
            engine.check_and_insert("Qoraal dheer oo lagu tijaabinayo kala duwanaanta cabbirka shingle-ka.");
            engine.save().unwrap();
        }
        let engine = DedupEngine::with_snapshot(&quality(), &path);
        assert_eq!(engine.index_len(), 0);
    }

    #[test]
    fn signatures_are_stable_across_engines() {
        let q = quality();
        let engine_a = DedupEngine::new(&q);
        let engine_b = DedupEngine::new(&q);
        let shingles = shingle_set("Muqdisho waa caasimadda Soomaaliya.", q.shingle_size);
        assert_eq!(engine_a.signature(&shingles), engine_b.signature(&shingles));
    }

    #[test]
    fn jaccard_basics() {
        let a: BTreeSet<u64> = [1, 2, 3, 4].into_iter().collect();
        let b: BTreeSet<u64> = [3, 4, 5, 6].into_iter().collect();
        assert!((jaccard(&a, &b) - 2.0 / 6.0).abs() < 1e-12);
        assert_eq!(jaccard(&a, &a), 1.0);
        assert_eq!(jaccard(&BTreeSet::new(), &BTreeSet::new()), 1.0);
    }
}
