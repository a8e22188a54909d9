mod common;

use common::*;
use kernel_map::MemoryRange;
use kernel_pma::consts::{PAGE_SIZE_64K, PMA_REGION_SIZE};
use kernel_pma::{
    AllocFlags, AllocationOptions, FrameState, InitFlags, Pma, PmaError, QueryConfig,
    RegionDescriptor,
};
use std::sync::{Arc, Mutex};

fn bad(r: Result<(), PmaError>) -> bool {
    matches!(r, Err(PmaError::InvalidArgument(_)))
}

fn plain() -> Pma {
    Pma::new(InitFlags::new(), MockPageSource::new())
}

#[test]
fn region_registration_is_validated() {
    let pma = plain();
    assert!(bad(pma.register_region(0, RegionDescriptor::new(MB, 3 * MB - 1))));
    assert!(bad(pma.register_region(0, RegionDescriptor::new(0, 3 * MB - 1))));
    assert!(bad(pma.register_region(0, RegionDescriptor::new(4 * MB, 2 * MB))));
    assert!(bad(pma.register_region(1, RegionDescriptor::new(0, 2 * MB - 1))));

    pma.register_region(0, RegionDescriptor::new(0, 4 * MB - 1))
        .unwrap();
    assert!(bad(pma.register_region(1, RegionDescriptor::new(2 * MB, 6 * MB - 1))));
    pma.register_region(1, RegionDescriptor::new(4 * MB, 6 * MB - 1))
        .unwrap();

    let regions = pma.region_info();
    assert_eq!(regions.len(), 2);
    assert_eq!(regions[1].base, 4 * MB);
    assert_eq!(pma.total_memory(), 6 * MB);
    assert_eq!(pma.free_memory(), 6 * MB);
    assert_eq!(pma.stats().num_2mb_pages, 3);
}

#[test]
fn region_table_is_bounded() {
    let pma = plain();
    for id in 0..PMA_REGION_SIZE {
        let base = id as u64 * 2 * MB;
        pma.register_region(id, RegionDescriptor::new(base, base + 2 * MB - 1))
            .unwrap();
    }
    let base = PMA_REGION_SIZE as u64 * 2 * MB;
    assert!(matches!(
        pma.register_region(
            PMA_REGION_SIZE,
            RegionDescriptor::new(base, base + 2 * MB - 1)
        ),
        Err(PmaError::InvalidArgument(_))
    ));
}

#[test]
fn query_configs_honours_the_mask() {
    let source = MockPageSource::new();
    let pma = numa_pma(&source, InitFlags::new().with_scrub_on_free(true));
    let all = QueryConfig::from_bits(u32::MAX);

    let q = pma.query_configs(all);
    assert!(q.scrub_enabled() && q.numa_enabled() && q.numa_onlined());
    assert!(!q.scrub_valid());

    pma.register_mem_scrub(MockScrubber::new(true));
    assert!(pma.query_configs(all).scrub_valid());

    let masked = pma.query_configs(QueryConfig::new().with_numa_onlined(true));
    assert_eq!(masked, QueryConfig::new().with_numa_onlined(true));

    pma.numa_offlined();
    assert!(!pma.query_configs(all).numa_onlined());
}

#[test]
fn onlined_memory_queries_ask_the_os() {
    let source = MockPageSource::new();
    let pma = numa_pma(&source, InitFlags::new());
    source.state.lock().unwrap().usage = (7 * MB, 9 * MB);
    assert_eq!(pma.free_memory(), 7 * MB);
    assert_eq!(pma.total_memory(), 9 * MB);

    pma.numa_offlined();
    assert_eq!(pma.free_memory(), REGION_SIZE);
    assert_eq!(pma.total_memory(), REGION_SIZE);
    assert_eq!(pma.total_unprotected_memory(), REGION_SIZE);
    assert_eq!(pma.total_protected_memory(), 0);
}

#[test]
fn numa_calls_need_a_numa_allocator() {
    let pma = plain();
    assert!(matches!(
        pma.numa_onlined(0, 0, MB),
        Err(PmaError::InvalidState(_))
    ));
    assert!(!pma.is_numa_onlined());

    let source = MockPageSource::new();
    let numa = Pma::new(InitFlags::new().with_numa(true), source);
    assert!(matches!(
        numa.numa_onlined(0, u64::MAX, 2),
        Err(PmaError::InvalidArgument(_))
    ));
}

#[test]
fn stats_callback_sees_every_change() {
    let source = MockPageSource::new();
    let pma = numa_pma(&source, InitFlags::new());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    pma.register_update_stats_cb(Box::new(move |free| sink.lock().unwrap().push(free)));
    assert_eq!(*seen.lock().unwrap(), vec![REGION_FRAMES]);

    let a = pma
        .allocate_pages(3, PAGE_SIZE_64K, &AllocationOptions::default())
        .unwrap();
    assert_eq!(seen.lock().unwrap().last(), Some(&(REGION_FRAMES - 3)));

    pma.unregister_update_stats_cb();
    pma.free_pages(&a.pages, a.unit_size).unwrap();
    assert_eq!(seen.lock().unwrap().len(), 2);
}

#[test]
fn block_lists_coalesce_frames() {
    let source = MockPageSource::new();
    let pma = numa_pma(&source, InitFlags::new());
    let pinned = AllocFlags::new().with_pinned(true).with_persistent(true);
    pma.allocate_pages(2, PAGE_SIZE_64K, &AllocationOptions::new(pinned))
        .unwrap();
    pma.allocate_pages(1, PAGE_SIZE_64K, &AllocationOptions::default())
        .unwrap();

    assert_eq!(
        pma.allocated_blocks(),
        vec![MemoryRange::new(0, 3 * PAGE_SIZE_64K)]
    );
    assert_eq!(
        pma.persistent_blocks(),
        vec![MemoryRange::new(0, 2 * PAGE_SIZE_64K)]
    );
}

#[test]
fn largest_free_skips_tracked_frames() {
    let source = MockPageSource::new();
    let pma = numa_pma(&source, InitFlags::new());
    assert_eq!(pma.largest_free(), Some(MemoryRange::new(0, REGION_SIZE)));

    let a = pma
        .allocate_pages(1, PAGE_SIZE_64K, &AllocationOptions::default())
        .unwrap();
    assert_eq!(a.pages, vec![0]);
    assert_eq!(
        pma.largest_free(),
        Some(MemoryRange::new(PAGE_SIZE_64K, REGION_SIZE - PAGE_SIZE_64K))
    );

    assert_eq!(plain().largest_free(), None);
}

#[test]
fn forced_persistence_marks_every_allocation() {
    let source = MockPageSource::new();
    let pma = numa_pma(&source, InitFlags::new().with_force_persistence(true));
    let a = pma
        .allocate_pages(1, PAGE_SIZE_64K, &AllocationOptions::default())
        .unwrap();
    assert!(pma.page_status(a.pages[0]).unwrap().persistent());
    assert_eq!(pma.persistent_blocks().len(), 1);
}

#[test]
fn pin_and_unpin_switch_evictability() {
    let source = MockPageSource::new();
    let pma = numa_pma(&source, InitFlags::new());
    let a = pma
        .allocate_pages(1, PAGE_SIZE_64K, &AllocationOptions::default())
        .unwrap();
    assert!(pma.page_status(a.pages[0]).unwrap().is_evictable());

    pma.pin_pages(&a.pages, PAGE_SIZE_64K).unwrap();
    assert_eq!(pma.page_status(a.pages[0]).unwrap().state(), FrameState::Pin);
    pma.unpin_pages(&a.pages, PAGE_SIZE_64K).unwrap();
    assert!(pma.page_status(a.pages[0]).unwrap().is_evictable());

    let unallocated = 10 * PAGE_SIZE_64K;
    assert!(matches!(
        pma.pin_pages(&[unallocated], PAGE_SIZE_64K),
        Err(PmaError::InvalidArgument(_))
    ));
    assert_eq!(
        pma.unpin_pages(&[REGION_SIZE], PAGE_SIZE_64K),
        Err(PmaError::ObjectNotFound)
    );
    assert_eq!(
        pma.pin_pages(&[4 * REGION_SIZE], PAGE_SIZE_64K),
        Err(PmaError::ObjectNotFound)
    );
    assert_eq!(pma.stats().num_free_frames, REGION_FRAMES - 1);
}

#[test]
fn eviction_callbacks_register_once() {
    let source = MockPageSource::new();
    let pma = numa_pma(&source, InitFlags::new());
    let first = MockEviction::attach(&pma);
    assert!(matches!(
        pma.register_eviction_cb(first.clone()),
        Err(PmaError::InvalidState(_))
    ));

    pma.unregister_eviction_cb();
    assert!(!pma.is_eviction_pending());
    pma.register_eviction_cb(first).unwrap();
}

#[test]
fn reclaim_threshold_is_clamped() {
    let pma = plain();
    assert_eq!(pma.reclaim_skip_threshold(), 4);
    pma.set_reclaim_skip_threshold(150);
    assert_eq!(pma.reclaim_skip_threshold(), 100);
    pma.set_reclaim_skip_threshold(10);
    assert_eq!(pma.reclaim_skip_threshold(), 10);
}
