//! Concurrent fetch/modify/flush workload over a file-backed buffer pool.
//!
//! Every page carries its own page number at bytes 0..8 and a counter at
//! bytes 8..16. Workers bump counters and verify stamps; afterwards the file is
//! reopened through a fresh pool and checked against the recorded increments.

use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use storage::{BufferPoolError, BufferPoolManager, DiskManager, FileId, PageHandle, PageId};

const STAMP: usize = 0;
const COUNTER: usize = 8;

#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    pub pool_size: usize,
    pub pages: usize,
    pub workers: usize,
    pub ops: usize,
    pub seed: u64,
}

#[derive(Debug, Default)]
pub struct Report {
    pub pages: usize,
    pub fetches: u64,
    pub increments: u64,
    pub flushes: u64,
    pub retries: u64,
    pub elapsed: Duration,
}

#[derive(Default)]
struct WorkerStats {
    fetches: u64,
    flushes: u64,
    retries: u64,
    increments: Vec<u64>,
}

fn read_u64(handle: &PageHandle, offset: usize) -> Result<u64> {
    let page = handle.read();
    let bytes = page
        .read_bytes(offset, 8)
        .ok_or_else(|| anyhow!("offset {offset} out of page"))?;
    Ok(u64::from_le_bytes(bytes.try_into()?))
}

fn fetch_retrying(bpm: &BufferPoolManager, page_id: PageId, retries: &mut u64) -> Result<PageHandle> {
    loop {
        if let Some(handle) = bpm.fetch_page(page_id)? {
            return Ok(handle);
        }
        *retries += 1;
        thread::yield_now();
    }
}

fn create_pages(bpm: &BufferPoolManager, file_id: FileId, count: usize) -> Result<Vec<PageId>> {
    let mut pages = Vec::with_capacity(count);
    for _ in 0..count {
        let mut handle = bpm
            .new_page(file_id)?
            .context("no frame available for a new page")?;
        let page_id = handle.page_id();
        handle.write().write_bytes(STAMP, &page_id.page_no.to_le_bytes());
        handle.mark_dirty();
        pages.push(page_id);
    }
    Ok(pages)
}

fn run_worker(
    bpm: &BufferPoolManager,
    pages: &[PageId],
    ops: usize,
    seed: u64,
) -> Result<WorkerStats> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut stats = WorkerStats {
        increments: vec![0; pages.len()],
        ..WorkerStats::default()
    };

    for _ in 0..ops {
        let idx = rng.gen_range(0..pages.len());
        let page_id = pages[idx];
        match rng.gen_range(0..10) {
            0 => match bpm.flush_page(page_id) {
                Ok(_) => stats.flushes += 1,
                // another worker is writing the page
                Err(BufferPoolError::PageLatched(_)) => stats.retries += 1,
                Err(err) => return Err(err.into()),
            },
            1..=3 => {
                let mut handle = fetch_retrying(bpm, page_id, &mut stats.retries)?;
                {
                    let mut page = handle.write();
                    let bytes = page
                        .read_bytes(COUNTER, 8)
                        .context("counter out of page")?;
                    let value = u64::from_le_bytes(bytes.try_into()?);
                    page.write_bytes(COUNTER, &(value + 1).to_le_bytes());
                }
                handle.mark_dirty();
                stats.increments[idx] += 1;
                stats.fetches += 1;
            }
            _ => {
                let handle = fetch_retrying(bpm, page_id, &mut stats.retries)?;
                let stamp = read_u64(&handle, STAMP)?;
                if stamp != page_id.page_no {
                    bail!("page {page_id} carries stamp {stamp}");
                }
                stats.fetches += 1;
            }
        }
    }
    Ok(stats)
}

fn verify(path: &Path, config: &WorkloadConfig, pages: &[PageId], expected: &[u64]) -> Result<()> {
    let mut disk_manager = DiskManager::new();
    let file_id = disk_manager
        .open_file(path)
        .with_context(|| format!("reopen {}", path.display()))?;
    let bpm = BufferPoolManager::new(disk_manager, config.pool_size);
    let mut retries = 0;

    for (page, &want) in pages.iter().zip(expected) {
        let page_id = PageId::new(file_id, page.page_no);
        let handle = fetch_retrying(&bpm, page_id, &mut retries)?;
        let stamp = read_u64(&handle, STAMP)?;
        let counter = read_u64(&handle, COUNTER)?;
        if stamp != page.page_no || counter != want {
            bail!(
                "page {page_id}: stamp {stamp}, counter {counter}, expected counter {want}"
            );
        }
    }
    debug!("verified {} pages after reopen", pages.len());
    Ok(())
}

/// Runs the workload against the data file at `path`.
pub fn run(path: &Path, config: &WorkloadConfig) -> Result<Report> {
    if config.pages == 0 || config.workers == 0 {
        bail!("pages and workers must be positive");
    }
    let start = Instant::now();

    let mut disk_manager = DiskManager::new();
    let file_id = disk_manager
        .open_file(path)
        .with_context(|| format!("open {}", path.display()))?;
    let bpm = BufferPoolManager::new(disk_manager, config.pool_size);

    let pages = create_pages(&bpm, file_id, config.pages)?;
    info!(
        "created {} pages, running {} workers x {} ops on {} frames",
        pages.len(),
        config.workers,
        config.ops,
        config.pool_size
    );

    let results: Vec<Result<WorkerStats>> = thread::scope(|scope| {
        let handles: Vec<_> = (0..config.workers)
            .map(|worker| {
                let bpm = bpm.clone();
                let pages = &pages;
                let seed = config.seed.wrapping_add(worker as u64);
                scope.spawn(move || run_worker(&bpm, pages, config.ops, seed))
            })
            .collect();
        handles
            .into_iter()
            .map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|_| Err(anyhow!("worker panicked")))
            })
            .collect()
    });

    let mut report = Report {
        pages: pages.len(),
        ..Report::default()
    };
    let mut expected = vec![0u64; pages.len()];
    for result in results {
        let stats = result?;
        report.fetches += stats.fetches;
        report.flushes += stats.flushes;
        report.retries += stats.retries;
        for (total, n) in expected.iter_mut().zip(stats.increments) {
            *total += n;
        }
    }
    report.increments = expected.iter().sum();

    bpm.flush_all_pages(file_id)?;
    drop(bpm);

    verify(path, config, &pages, &expected)?;
    report.elapsed = start.elapsed();
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(pool_size: usize, pages: usize, workers: usize) -> WorkloadConfig {
        WorkloadConfig {
            pool_size,
            pages,
            workers,
            ops: 400,
            seed: 7,
        }
    }

    #[test]
    fn test_workload_verifies_after_reopen() {
        let dir = TempDir::new().unwrap();
        let report = run(&dir.path().join("bench.db"), &config(8, 32, 4)).unwrap();
        assert_eq!(report.pages, 32);
        assert!(report.fetches > 0);
        assert!(report.increments <= report.fetches);
    }

    #[test]
    fn test_rejects_empty_workload() {
        let dir = TempDir::new().unwrap();
        assert!(run(&dir.path().join("bench.db"), &config(8, 0, 4)).is_err());
        assert!(run(&dir.path().join("bench.db"), &config(8, 4, 0)).is_err());
    }

    #[test]
    fn test_zero_frames_cannot_create_pages() {
        let dir = TempDir::new().unwrap();
        assert!(run(&dir.path().join("bench.db"), &config(0, 4, 1)).is_err());
    }
}
