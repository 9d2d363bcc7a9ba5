mod common;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use common::{FILE, allocate_unpinned, mem_pool};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use storage::{BufferPoolError, BufferPoolManager, PageHandle, PageId};

fn fetch_retrying(bpm: &BufferPoolManager, page_id: PageId) -> PageHandle {
    loop {
        if let Some(handle) = bpm.fetch_page(page_id).unwrap() {
            return handle;
        }
        thread::yield_now();
    }
}

fn read_counter(handle: &PageHandle) -> u64 {
    let page = handle.read();
    u64::from_le_bytes(page.read_bytes(0, 8).unwrap().try_into().unwrap())
}

#[test]
fn concurrent_increments_are_not_lost() {
    const PAGES: usize = 16;
    const WORKERS: u64 = 8;
    const OPS: usize = 500;

    let (_disk, bpm) = mem_pool(4);
    let pages = Arc::new(allocate_unpinned(&bpm, FILE, PAGES));
    let expected: Arc<Vec<AtomicU64>> = Arc::new((0..PAGES).map(|_| AtomicU64::new(0)).collect());

    let workers: Vec<_> = (0..WORKERS)
        .map(|seed| {
            let bpm = bpm.clone();
            let pages = Arc::clone(&pages);
            let expected = Arc::clone(&expected);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(seed);
                for _ in 0..OPS {
                    let idx = rng.gen_range(0..PAGES);
                    let mut handle = fetch_retrying(&bpm, pages[idx]);
                    {
                        let mut page = handle.write();
                        let value = u64::from_le_bytes(
                            page.read_bytes(0, 8).unwrap().try_into().unwrap(),
                        );
                        page.write_bytes(0, &(value + 1).to_le_bytes());
                    }
                    handle.mark_dirty();
                    expected[idx].fetch_add(1, Ordering::Relaxed);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for (idx, &page_id) in pages.iter().enumerate() {
        let handle = fetch_retrying(&bpm, page_id);
        assert_eq!(read_counter(&handle), expected[idx].load(Ordering::Relaxed));
    }
    assert_eq!(bpm.evictable_count() + bpm.free_frame_count(), bpm.pool_size());
}

#[test]
fn pins_never_leak_under_contention() {
    let (_disk, bpm) = mem_pool(3);
    let pages = Arc::new(allocate_unpinned(&bpm, FILE, 10));

    let workers: Vec<_> = (0..6)
        .map(|seed| {
            let bpm = bpm.clone();
            let pages = Arc::clone(&pages);
            thread::spawn(move || {
                let mut rng = StdRng::seed_from_u64(100 + seed);
                for _ in 0..300 {
                    let page_id = pages[rng.gen_range(0..pages.len())];
                    match rng.gen_range(0..4) {
                        0 => {
                            let _ = bpm.flush_page(page_id).unwrap();
                        }
                        1 => {
                            if let Some(handle) = bpm.new_page(FILE).unwrap() {
                                let new_id = handle.page_id();
                                drop(handle);
                                let _ = bpm.delete_page(new_id).unwrap();
                            }
                        }
                        _ => {
                            if let Some(handle) = bpm.fetch_page(page_id).unwrap() {
                                assert_eq!(handle.page_id(), page_id);
                            }
                        }
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    for &page_id in pages.iter() {
        if let Some(pins) = bpm.pin_count(page_id) {
            assert_eq!(pins, 0, "page {page_id} still pinned");
        }
    }
    assert_eq!(bpm.evictable_count() + bpm.free_frame_count(), bpm.pool_size());
}

#[test]
fn flush_does_not_block_on_write_guard_holders() {
    let (_disk, bpm) = mem_pool(4);
    let pages = allocate_unpinned(&bpm, FILE, 2);
    let (x, y) = (pages[0], pages[1]);
    let stop = Arc::new(AtomicBool::new(false));
    let (done_tx, done_rx) = mpsc::channel();

    let writer = {
        let bpm = bpm.clone();
        let done_tx = done_tx.clone();
        thread::spawn(move || {
            for i in 0..500u64 {
                let mut handle = fetch_retrying(&bpm, x);
                {
                    let mut page = handle.write();
                    page.write_bytes(0, &i.to_le_bytes());
                    // calls back into the pool with the latch held
                    drop(fetch_retrying(&bpm, y));
                }
                handle.mark_dirty();
            }
            let _ = done_tx.send("writer");
        })
    };
    let flusher = {
        let bpm = bpm.clone();
        let stop = Arc::clone(&stop);
        thread::spawn(move || {
            while !stop.load(Ordering::Relaxed) {
                for res in [bpm.flush_page(x).map(|_| ()), bpm.flush_all_pages(FILE)] {
                    match res {
                        Ok(()) | Err(BufferPoolError::PageLatched(_)) => {}
                        Err(err) => panic!("unexpected flush error: {err}"),
                    }
                }
            }
            let _ = done_tx.send("flusher");
        })
    };

    assert_eq!(
        done_rx.recv_timeout(Duration::from_secs(10)),
        Ok("writer"),
        "writer stalled against the flusher"
    );
    stop.store(true, Ordering::Relaxed);
    assert_eq!(done_rx.recv_timeout(Duration::from_secs(10)), Ok("flusher"));
    writer.join().unwrap();
    flusher.join().unwrap();

    bpm.flush_all_pages(FILE).unwrap();
    assert_eq!(bpm.is_dirty(x), Some(false));
    let handle = fetch_retrying(&bpm, x);
    assert_eq!(read_counter(&handle), 499);
}
