//! The IP indexer (C6): rewrites every mirror directory's `full_ips.txt`
//! into an `indexed_ips.txt` of random u64 indices, maintaining a
//! process-wide bijection between observed IPs and indices, persisted
//! encrypted via [`s3le_crypto`].
//!
//! Indexing is single-threaded by design (§4.6): the encrypted map is not
//! safe to update concurrently, and batching writes every ~100k files
//! bounds how much would be lost on a crash mid-run.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Error};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use s3le_config::Cache;
use s3le_mirror::walk::{self, MirrorEntry};
use s3le_types::ExtractionError;

const INDEX_TO_IP_FILE: &str = "index_to_ip.yaml";

/// How many mirror directories are re-indexed between persisting the
/// encrypted map, bounding data loss on a crash mid-run.
const BATCH_SIZE: usize = 100_000;

/// Bounded retry budget for drawing a fresh, unused u64 index before
/// treating collisions as a PRNG or cache-corruption bug (§4.6).
const COLLISION_RETRY_BUDGET: u32 = 1000;

/// Summary counters returned by [`run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IndexingSummary {
    pub directories_indexed: usize,
    pub new_ips_indexed: usize,
}

/// Run the IP indexer over every mirror directory under `cache`,
/// seeding index assignment from `seed` for deterministic tests (§8 P4
/// relies on a real deployment never reusing a seed across runs that
/// matter, since the map itself is what's persisted).
pub fn run(cache: &Cache, seed: u64) -> Result<IndexingSummary, Error> {
    Cache::ensure_dir(&cache.ips_dir())?;
    let index_to_ip_path = cache.ips_dir().join(INDEX_TO_IP_FILE);

    let mut index_to_ip: BTreeMap<u64, String> = s3le_crypto::load_encrypted(&index_to_ip_path)?;
    let mut ip_to_index: HashMap<String, u64> =
        index_to_ip.iter().map(|(index, ip)| (ip.clone(), *index)).collect();
    let mut used_indices: HashSet<u64> = index_to_ip.keys().copied().collect();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut summary = IndexingSummary::default();
    let mut since_last_save = 0usize;

    for entry in walk::entries(&cache.extraction_dir())? {
        if !entry.needs_indexing()? {
            continue;
        }

        index_one_directory(&entry, &mut index_to_ip, &mut ip_to_index, &mut used_indices, &mut rng, &mut summary)?;

        since_last_save += 1;
        if since_last_save >= BATCH_SIZE {
            s3le_crypto::save_encrypted(&index_to_ip_path, &index_to_ip)?;
            since_last_save = 0;
        }
    }

    s3le_crypto::save_encrypted(&index_to_ip_path, &index_to_ip)?;
    Ok(summary)
}

fn index_one_directory(
    entry: &MirrorEntry,
    index_to_ip: &mut BTreeMap<u64, String>,
    ip_to_index: &mut HashMap<String, u64>,
    used_indices: &mut HashSet<u64>,
    rng: &mut StdRng,
    summary: &mut IndexingSummary,
) -> Result<(), Error> {
    let full_ips = read_lines(&entry.full_ips_path())?;

    let mut indexed_ips = BufWriter::new(
        File::create(entry.indexed_ips_path())
            .with_context(|| format!("failed to create {:?}", entry.indexed_ips_path()))?,
    );

    for ip in &full_ips {
        let index = match ip_to_index.get(ip) {
            Some(index) => *index,
            None => {
                let index = draw_unused_index(used_indices, rng, ip)?;
                used_indices.insert(index);
                ip_to_index.insert(ip.clone(), index);
                index_to_ip.insert(index, ip.clone());
                summary.new_ips_indexed += 1;
                index
            }
        };
        writeln!(indexed_ips, "{index}")?;
    }
    indexed_ips.flush()?;

    summary.directories_indexed += 1;
    Ok(())
}

fn draw_unused_index(used_indices: &HashSet<u64>, rng: &mut StdRng, ip: &str) -> Result<u64, Error> {
    for _ in 0..COLLISION_RETRY_BUDGET {
        let candidate: u64 = rng.gen();
        if !used_indices.contains(&candidate) {
            return Ok(candidate);
        }
    }
    Err(ExtractionError::IndexCollisionExhausted {
        subject: ip.to_string(),
        attempts: COLLISION_RETRY_BUDGET,
    }
    .into())
}

fn read_lines(path: &Path) -> Result<Vec<String>, Error> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    BufReader::new(file)
        .lines()
        .collect::<Result<Vec<String>, std::io::Error>>()
        .with_context(|| format!("failed to read {:?}", path))
}
