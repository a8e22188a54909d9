#![allow(dead_code)]

use kernel_pma::{
    EvictionCallbacks, InitFlags, MemoryProtection, OsAllocFlags, PageSource, Pma, PmaError,
    RegionDescriptor, Result, Scrubber, consts::PMA_PAGE_SIZE,
};
use std::sync::{Arc, Mutex, Weak};

pub const MB: u64 = 1024 * 1024;
pub const NODE: u32 = 1;
pub const COHERENT_BASE: u64 = 0x40_0000_0000;
/// Size of region 0, which starts at GPA 0.
pub const REGION_SIZE: u64 = 32 * MB;
pub const REGION_FRAMES: u64 = REGION_SIZE / PMA_PAGE_SIZE;
/// 64 KiB frame over 4 KiB OS pages.
pub const OS_PAGES_PER_FRAME: u64 = 16;

#[derive(Debug, Default)]
pub struct SourceState {
    /// Next system address handed out.
    pub next: u64,
    /// Successful allocations left; `None` is unlimited.
    pub budget: Option<usize>,
    pub allocs: Vec<(u32, u64)>,
    pub acquired: Vec<(u64, u64)>,
    pub released: Vec<(u64, u64)>,
    pub last_flags: Option<OsAllocFlags>,
    pub usage: (u64, u64),
}

/// Bump allocator over system addresses. Never reuses an address.
pub struct MockPageSource {
    pub state: Mutex<SourceState>,
}

impl MockPageSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SourceState {
                next: COHERENT_BASE,
                ..SourceState::default()
            }),
        })
    }

    pub fn set_budget(&self, budget: usize) {
        self.state.lock().unwrap().budget = Some(budget);
    }

    pub fn hand_out_from(&self, sys: u64) {
        self.state.lock().unwrap().next = sys;
    }

    pub fn released(&self) -> Vec<(u64, u64)> {
        self.state.lock().unwrap().released.clone()
    }

    pub fn alloc_calls(&self) -> usize {
        self.state.lock().unwrap().allocs.len()
    }

    pub fn last_flags(&self) -> Option<OsAllocFlags> {
        self.state.lock().unwrap().last_flags
    }
}

impl PageSource for MockPageSource {
    fn alloc_pages_node(&self, node: u32, length: u64, flags: OsAllocFlags) -> Result<u64> {
        let mut s = self.state.lock().unwrap();
        s.last_flags = Some(flags);
        match s.budget.as_mut() {
            Some(0) => return Err(PmaError::NoMemory),
            Some(n) => *n -= 1,
            None => {}
        }
        let sys = s.next.next_multiple_of(length);
        s.next = sys + length;
        s.allocs.push((node, length));
        Ok(sys)
    }

    fn acquire_page(&self, addr: u64, page_count: u64) {
        self.state.lock().unwrap().acquired.push((addr, page_count));
    }

    fn release_page(&self, addr: u64, page_count: u64) {
        self.state.lock().unwrap().released.push((addr, page_count));
    }

    fn numa_memory_usage(&self, _node: u32) -> (u64, u64) {
        self.state.lock().unwrap().usage
    }
}

/// Completes every page right away, or none at all.
pub struct MockScrubber {
    pub complete: bool,
    pub submitted: Mutex<Vec<u64>>,
}

impl MockScrubber {
    pub fn new(complete: bool) -> Arc<Self> {
        Arc::new(Self {
            complete,
            submitted: Mutex::new(Vec::new()),
        })
    }
}

impl Scrubber for MockScrubber {
    fn submit_pages(&self, _page_size: u64, pages: &[u64]) -> Result<Vec<u64>> {
        self.submitted.lock().unwrap().extend_from_slice(pages);
        Ok(if self.complete { pages.to_vec() } else { Vec::new() })
    }

    fn wait_for_completion(&self) -> Result<Vec<u64>> {
        Ok(Vec::new())
    }
}

/// Eviction client that owns nothing but what the test tells it about.
pub struct MockEviction {
    pma: Mutex<Weak<Pma>>,
    /// Outcome of `evict_range` once the range has been freed.
    pub range_result: Mutex<Result<()>>,
    /// Pages `evict_pages` gives up, in order.
    pub supply: Mutex<Vec<u64>>,
    pub range_calls: Mutex<Vec<(u64, u64, MemoryProtection)>>,
    pub page_calls: Mutex<Vec<(u64, usize, u64, u64)>>,
}

impl MockEviction {
    pub fn attach(pma: &Arc<Pma>) -> Arc<Self> {
        let cb = Arc::new(Self {
            pma: Mutex::new(Arc::downgrade(pma)),
            range_result: Mutex::new(Ok(())),
            supply: Mutex::new(Vec::new()),
            range_calls: Mutex::new(Vec::new()),
            page_calls: Mutex::new(Vec::new()),
        });
        pma.register_eviction_cb(cb.clone()).unwrap();
        cb
    }
}

impl EvictionCallbacks for MockEviction {
    fn evict_range(&self, begin: u64, end: u64, protection: MemoryProtection) -> Result<()> {
        self.range_calls.lock().unwrap().push((begin, end, protection));
        let pma = self.pma.lock().unwrap().upgrade().unwrap();
        let frames: Vec<u64> = (begin..=end).step_by(PMA_PAGE_SIZE as usize).collect();
        pma.free_pages(&frames, PMA_PAGE_SIZE)?;
        *self.range_result.lock().unwrap()
    }

    fn evict_pages(
        &self,
        page_size: u64,
        pages: &mut [u64],
        begin: u64,
        end: u64,
        _protection: MemoryProtection,
    ) -> Result<()> {
        self.page_calls
            .lock()
            .unwrap()
            .push((page_size, pages.len(), begin, end));
        let mut supply = self.supply.lock().unwrap();
        if supply.len() < pages.len() {
            return Err(PmaError::NoMemory);
        }
        for slot in pages.iter_mut() {
            *slot = supply.remove(0);
        }
        Ok(())
    }
}

/// NUMA allocator with region 0 at `[0, 32 MiB)`, onlined on [`NODE`].
pub fn numa_pma(source: &Arc<MockPageSource>, flags: InitFlags) -> Arc<Pma> {
    let pma = Arc::new(Pma::new(flags.with_numa(true), source.clone()));
    pma.register_region(0, RegionDescriptor::new(0, REGION_SIZE - 1))
        .unwrap();
    pma.numa_onlined(NODE, COHERENT_BASE, REGION_SIZE).unwrap();
    pma
}
