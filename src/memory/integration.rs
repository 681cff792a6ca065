#[cfg(all(test, not(loom)))]
mod tests {
    use crate::memory::allocator::PoolAllocator;
    use crate::memory::config::PoolAllocatorConfig;
    use crate::memory::stats;
    use crate::sync::atomic::{AtomicUsize, Ordering};
    use crate::sync::{Arc, Mutex, thread};
    use rand::prelude::*;
    use std::collections::BTreeMap;
    use std::ptr::NonNull;

    fn small_allocator() -> PoolAllocator {
        PoolAllocator::with_config(PoolAllocatorConfig {
            pool_reserved_size: 32 * 1024 * 1024,
            max_idle_age: 500,
            trim_check_frequency: 32,
            ..PoolAllocatorConfig::default()
        })
        .unwrap()
    }

    /// Test-only record of every live range, shared by all threads.
    #[derive(Default)]
    struct Shadow {
        live: Mutex<BTreeMap<usize, usize>>,
    }

    impl Shadow {
        fn insert(&self, ptr: NonNull<u8>, len: usize) {
            let start = ptr.as_ptr().addr();
            let mut live = self.live.lock().unwrap();
            if let Some((&prev, &prev_len)) = live.range(..=start).next_back() {
                assert!(
                    prev + prev_len <= start,
                    "[{start:#x}, +{len}) overlaps live [{prev:#x}, +{prev_len})"
                );
            }
            if let Some((&next, &next_len)) = live.range(start..).next() {
                assert!(
                    start + len <= next,
                    "[{start:#x}, +{len}) overlaps live [{next:#x}, +{next_len})"
                );
            }
            live.insert(start, len);
        }

        fn remove(&self, ptr: NonNull<u8>) {
            let removed = self.live.lock().unwrap().remove(&ptr.as_ptr().addr());
            assert!(removed.is_some(), "{ptr:p} was not live");
        }
    }

    fn random_size(rng: &mut StdRng) -> usize {
        match rng.gen_range(0..100) {
            0..=59 => rng.gen_range(1..=256),
            60..=94 => rng.gen_range(257..=16 * 1024),
            _ => rng.gen_range(16 * 1024 + 1..=200 * 1024),
        }
    }

    #[test]
    fn test_threads_never_get_overlapping_blocks() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = Arc::new(small_allocator());
        let shadow = Arc::new(Shadow::default());
        let num_threads = 8u64;
        let barrier = Arc::new(crate::sync::barrier::Barrier::new(num_threads as usize));

        let handles: Vec<_> = (0..num_threads)
            .map(|t| {
                let alloc = alloc.clone();
                let shadow = shadow.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    let mut rng = StdRng::seed_from_u64(0xB1A5 + t);
                    let mut mine: Vec<(NonNull<u8>, usize, u8)> = Vec::new();
                    barrier.wait();

                    for _ in 0..3000 {
                        if mine.is_empty() || rng.gen_bool(0.55) {
                            let size = random_size(&mut rng);
                            let ptr = alloc.allocate(size).unwrap();
                            shadow.insert(ptr, size);
                            let fill: u8 = rng.r#gen();
                            // Safety: Test code.
                            unsafe { ptr.as_ptr().write_bytes(fill, size) };
                            mine.push((ptr, size, fill));
                        } else {
                            let (ptr, size, fill) = mine.swap_remove(rng.gen_range(0..mine.len()));
                            // Safety: Test code.
                            unsafe {
                                let bytes = std::slice::from_raw_parts(ptr.as_ptr(), size);
                                assert!(bytes.iter().all(|&b| b == fill), "block {ptr:p} was clobbered");
                            }
                            shadow.remove(ptr);
                            // Safety: Test code.
                            unsafe { alloc.free(Some(ptr)) };
                        }
                    }

                    for (ptr, _, _) in mine {
                        shadow.remove(ptr);
                        // Safety: Test code.
                        unsafe { alloc.free(Some(ptr)) };
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }

        assert!(shadow.live.lock().unwrap().is_empty());
        let stats = alloc.stats();
        assert_eq!(stats.large_allocations, 0);
        assert_eq!(stats.pools.iter().map(|p| p.live_blocks).sum::<usize>(), 0);
        alloc.check_pools();
    }

    #[test]
    fn test_concurrent_growth_of_one_class() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = Arc::new(small_allocator());
        let num_threads = 8;
        let per_thread = 1000;
        let barrier = Arc::new(crate::sync::barrier::Barrier::new(num_threads));
        let total = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..num_threads)
            .map(|_| {
                let alloc = alloc.clone();
                let barrier = barrier.clone();
                let total = total.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let ptrs: Vec<_> = (0..per_thread).map(|_| alloc.allocate(512).unwrap()).collect();
                    total.fetch_add(ptrs.len(), Ordering::Relaxed);
                    ptrs.into_iter().map(|p| p.as_ptr().addr()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut addrs: Vec<usize> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        addrs.sort_unstable();
        addrs.dedup();
        assert_eq!(addrs.len(), total.load(Ordering::Relaxed));

        // 128 blocks of 512 B per 64 KiB chunk; racing growers must not leave
        // extra chunks behind.
        let pool = alloc.stats().pools[6];
        assert_eq!(pool.live_blocks, num_threads * per_thread);
        assert_eq!(pool.chunks(), (num_threads * per_thread).div_ceil(pool.blocks_per_chunk));
        alloc.check_pools();
    }

    #[test]
    fn test_idle_chunks_released_to_os() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let baseline = stats::snapshot();
        let alloc = PoolAllocator::with_config(PoolAllocatorConfig {
            pool_reserved_size: 32 * 1024 * 1024,
            max_idle_age: 5000,
            trim_check_frequency: 32,
            ..PoolAllocatorConfig::default()
        })
        .unwrap();

        let ptrs: Vec<_> = (0..4096).map(|_| alloc.allocate(256).unwrap()).collect();
        let grown = stats::snapshot();
        let chunks = alloc.stats().pools[5].chunks();
        assert_eq!(chunks, 4096 * 256 / alloc.chunk_size());
        assert_eq!(grown.pool_committed, baseline.pool_committed + chunks * alloc.chunk_size());

        // Free everything; the chunks become idle but stay committed for now.
        for p in ptrs {
            // Safety: Test code.
            unsafe { alloc.free(Some(p)) };
        }
        assert_eq!(alloc.stats().pools[5].free_chunks, chunks);
        assert_eq!(stats::snapshot().pool_committed, grown.pool_committed);
        let keeper = alloc.allocate(256).unwrap();

        // Churn one block until the idle chunks age past the threshold.
        for _ in 0..3000 {
            let p = alloc.allocate(256).unwrap();
            // Safety: Test code.
            unsafe { alloc.free(Some(p)) };
        }
        assert_eq!(alloc.stats().pools[5].chunks(), 1);
        assert_eq!(
            stats::snapshot().pool_committed,
            baseline.pool_committed + alloc.chunk_size()
        );

        // Safety: Test code.
        unsafe { alloc.free(Some(keeper)) };
        drop(alloc);
        assert_eq!(stats::snapshot(), baseline);
    }

    /// Anonymous resident memory of this process, from `/proc/self/status`.
    #[cfg(target_os = "linux")]
    fn rss_anon_kib() -> usize {
        let status = std::fs::read_to_string("/proc/self/status").unwrap();
        status
            .lines()
            .find_map(|line| line.strip_prefix("RssAnon:"))
            .and_then(|rest| rest.trim().trim_end_matches("kB").trim().parse().ok())
            .unwrap()
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_idle_trim_shrinks_resident_set() {
        let _guard = crate::memory::TEST_MUTEX.write().unwrap();
        let alloc = PoolAllocator::with_config(PoolAllocatorConfig {
            pool_reserved_size: 64 * 1024 * 1024,
            max_idle_age: 100,
            trim_check_frequency: 16,
            ..PoolAllocatorConfig::default()
        })
        .unwrap();

        // 32 MiB of 8 KiB blocks, every page touched.
        let ptrs: Vec<_> = (0..4096)
            .map(|_| {
                let p = alloc.allocate(8 * 1024).unwrap();
                // Safety: Test code.
                unsafe { p.as_ptr().write_bytes(0xE1, 8 * 1024) };
                p
            })
            .collect();
        let grown = rss_anon_kib();

        for p in ptrs {
            // Safety: Test code.
            unsafe { alloc.free(Some(p)) };
        }
        for _ in 0..300 {
            let p = alloc.allocate(8 * 1024).unwrap();
            // Safety: Test code.
            unsafe { alloc.free(Some(p)) };
        }
        assert!(alloc.stats().pools[10].chunks() <= 1);

        let trimmed = rss_anon_kib();
        assert!(
            trimmed + 24 * 1024 < grown,
            "resident set did not shrink: {grown} KiB -> {trimmed} KiB"
        );
    }

    #[test]
    fn test_mixed_sizes_reallocate_chain() {
        let _guard = crate::memory::TEST_MUTEX.read().unwrap();
        let alloc = small_allocator();
        let mut rng = StdRng::seed_from_u64(7);
        // Safety: Test code.
        unsafe {
            let mut ptr = alloc.allocate(1).unwrap();
            ptr.as_ptr().write(0x5A);
            let mut valid = 1;
            for _ in 0..200 {
                let new_size = random_size(&mut rng);
                ptr = alloc.reallocate(Some(ptr), new_size).unwrap().unwrap();
                let kept = valid.min(new_size);
                let bytes = std::slice::from_raw_parts(ptr.as_ptr(), kept);
                assert!(bytes.iter().all(|&b| b == 0x5A));
                ptr.as_ptr().write_bytes(0x5A, new_size);
                valid = new_size;
            }
            alloc.free(Some(ptr));
        }
        let stats = alloc.stats();
        assert_eq!(stats.large_allocations, 0);
        assert_eq!(stats.pools.iter().map(|p| p.live_blocks).sum::<usize>(), 0);
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn block_size_covers_request(sizes in proptest::collection::vec(0_usize..40_000, 1..40)) {
                let _guard = crate::memory::TEST_MUTEX.read().unwrap();
                let alloc = small_allocator();
                let mut live = Vec::new();
                for &size in &sizes {
                    let ptr = alloc.allocate(size).unwrap();
                    // Safety: Test code.
                    let bs = unsafe { alloc.block_size(ptr) };
                    prop_assert!(bs >= size.max(1));
                    if size <= alloc.max_pooled_size() {
                        prop_assert!(alloc.size_classes().contains(&bs));
                    }
                    live.push(ptr);
                }
                for ptr in live {
                    // Safety: Test code.
                    unsafe { alloc.free(Some(ptr)) };
                }
                prop_assert_eq!(alloc.stats().large_allocations, 0);
            }

            #[test]
            fn reallocate_preserves_prefix(
                old_size in 1_usize..20_000,
                new_size in 1_usize..20_000,
                seed in any::<u8>(),
            ) {
                let _guard = crate::memory::TEST_MUTEX.read().unwrap();
                let alloc = small_allocator();
                // Safety: Test code.
                unsafe {
                    let ptr = alloc.allocate(old_size).unwrap();
                    for i in 0..old_size {
                        #[allow(clippy::cast_possible_truncation)]
                        ptr.as_ptr().add(i).write(seed.wrapping_add(i as u8));
                    }
                    let moved = alloc.reallocate(Some(ptr), new_size).unwrap().unwrap();
                    prop_assert!(alloc.block_size(moved) >= new_size);
                    for i in 0..old_size.min(new_size) {
                        #[allow(clippy::cast_possible_truncation)]
                        let expected = seed.wrapping_add(i as u8);
                        prop_assert_eq!(moved.as_ptr().add(i).read(), expected);
                    }
                    alloc.free(Some(moved));
                }
            }
        }
    }
}
