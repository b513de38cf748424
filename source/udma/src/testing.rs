//! Test support: a fake [`Platform`] with fault injection and strict
//! resource accounting.
use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::Cell,
    collections::{BTreeMap, HashMap},
    future::Future,
    ptr,
    string::{String, ToString},
    sync::{Arc, Mutex},
    thread::{self, JoinHandle},
    time::{Duration, Instant},
    vec::Vec,
};

use maitake::time::{Clock, Timer};
use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::{
    mm::PAGE_SHIFT,
    platform::{
        Callback, Cookie, DmaDataDirection, Engine, Platform, PrepFlags, TransferDirection,
    },
    sg::Segment,
};

pub(crate) const TX_NAME: &str = "udma-tx";
pub(crate) const RX_NAME: &str = "udma-rx";

#[global_allocator]
static ALLOC: FailingAlloc = FailingAlloc;

/// Wraps the system allocator, failing one allocation of a chosen size on the
/// current thread.
struct FailingAlloc;

thread_local! {
    static FAIL_SIZE: Cell<usize> = const { Cell::new(0) };
}

/// Makes the next allocation of exactly `size` bytes on this thread fail.
pub(crate) fn fail_next_alloc_of(size: usize) {
    FAIL_SIZE.with(|fail| fail.set(size));
}

unsafe impl GlobalAlloc for FailingAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let fail = FAIL_SIZE
            .try_with(|fail| {
                let size = fail.get();
                if size != 0 && size == layout.size() {
                    fail.set(0);
                    return true;
                }
                false
            })
            .unwrap_or(false);
        if fail {
            return ptr::null_mut();
        }
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        System.dealloc(ptr, layout)
    }
}

/// Installs a subscriber for the test's output.
///
/// `UDMA_TEST_LOG` takes a filter, as `RUST_LOG` would. Without it, this
/// crate logs at `trace` so that every state transition shows up, and
/// everything else only logs warnings.
pub(crate) fn trace_init() {
    use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, prelude::*};
    let filter = match std::env::var("UDMA_TEST_LOG") {
        Ok(env) if !env.is_empty() => EnvFilter::builder().parse_lossy(env),
        _ => EnvFilter::new("warn,udma=trace"),
    };

    let _res = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .with_thread_names(true)
        .with_target(false)
        .with_span_events(FmtSpan::CLOSE)
        .without_time()
        .finish()
        .try_init();
}

/// Returns a timer that only moves when it is advanced by hand.
pub(crate) fn test_timer() -> &'static Timer {
    let clock = Clock::new(Duration::from_millis(1), || 0).named("CLOCK_TEST_MANUAL");
    Box::leak(Box::new(Timer::new(clock)))
}

/// Runs `f` to completion on a new thread, the way a blocked caller would
/// run in its own task.
pub(crate) fn spawn_caller<T, F>(
    name: &str,
    f: impl FnOnce() -> F + Send + 'static,
) -> JoinHandle<T>
where
    F: Future<Output = T>,
    T: Send + 'static,
{
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || futures::executor::block_on(f()))
        .unwrap()
}

/// Polls `cond` until it holds, panicking if it takes unreasonably long.
#[track_caller]
pub(crate) fn wait_for(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(Duration::from_millis(1));
    }
}

/// A pinned page, identified by its page frame number.
#[derive(Debug)]
pub(crate) struct TestPage {
    pfn: usize,
}

pub(crate) struct TestPlatform {
    names: Mutex<Result<Vec<String>, i32>>,
    engines: Mutex<HashMap<String, Arc<EngineState>>>,
    hidden: Mutex<Vec<String>>,
    pin_limit: Mutex<Option<usize>>,
    map_limit: Mutex<Option<usize>>,
    last_pin_writable: Mutex<Option<bool>>,
    pinned: Mutex<BTreeMap<usize, usize>>,
    dirty: Mutex<Vec<usize>>,
    mapped: AtomicUsize,
}

pub(crate) struct TestEngine {
    state: Arc<EngineState>,
    released: AtomicBool,
}

#[derive(Debug)]
pub(crate) struct TestTx {
    segments: Vec<Segment>,
}

/// What a [`TestEngine`] has been asked to do.
pub(crate) struct EngineState {
    pending: Mutex<Vec<Callback>>,
    last_sgl: Mutex<Vec<Segment>>,
    last_flags: Mutex<Option<PrepFlags>>,
    last_direction: Mutex<Option<TransferDirection>>,
    fail_prep: AtomicBool,
    reject_submit: AtomicBool,
    submitted: AtomicUsize,
    issued: AtomicUsize,
    terminated: AtomicUsize,
    released: AtomicUsize,
    max_outstanding: AtomicUsize,
}

// === impl TestPlatform ===

impl TestPlatform {
    pub(crate) fn new() -> Self {
        let engines = [TX_NAME, RX_NAME]
            .into_iter()
            .map(|name| (name.to_string(), Arc::new(EngineState::new())))
            .collect();
        Self {
            names: Mutex::new(Ok(vec![TX_NAME.to_string(), RX_NAME.to_string()])),
            engines: Mutex::new(engines),
            hidden: Mutex::new(Vec::new()),
            pin_limit: Mutex::new(None),
            map_limit: Mutex::new(None),
            last_pin_writable: Mutex::new(None),
            pinned: Mutex::new(BTreeMap::new()),
            dirty: Mutex::new(Vec::new()),
            mapped: AtomicUsize::new(0),
        }
    }

    pub(crate) fn set_names(&self, names: Result<Vec<&str>, i32>) {
        *self.names.lock().unwrap() =
            names.map(|names| names.into_iter().map(ToString::to_string).collect());
    }

    pub(crate) fn engine(&self, name: &str) -> Arc<EngineState> {
        self.engines
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(EngineState::new()))
            .clone()
    }

    /// Makes `request_channel(name)` fail until [`Self::show_engine`] is called.
    pub(crate) fn hide_engine(&self, name: &str) {
        self.hidden.lock().unwrap().push(name.to_string());
    }

    pub(crate) fn show_engine(&self, name: &str) {
        self.hidden.lock().unwrap().retain(|hidden| hidden != name);
    }

    /// Pin at most `pages` pages per request.
    pub(crate) fn fail_pin_after(&self, pages: usize) {
        *self.pin_limit.lock().unwrap() = Some(pages);
    }

    /// Map at most `segments` segments per request.
    pub(crate) fn fail_map_after(&self, segments: usize) {
        *self.map_limit.lock().unwrap() = Some(segments);
    }

    /// Number of page pins currently held.
    pub(crate) fn pinned_pages(&self) -> usize {
        self.pinned.lock().unwrap().values().sum()
    }

    pub(crate) fn dirty_pages(&self) -> Vec<usize> {
        self.dirty.lock().unwrap().clone()
    }

    pub(crate) fn mapped_tables(&self) -> usize {
        self.mapped.load(Ordering::SeqCst)
    }

    pub(crate) fn last_pin_writable(&self) -> Option<bool> {
        *self.last_pin_writable.lock().unwrap()
    }
}

impl Platform for TestPlatform {
    type Page = TestPage;
    type Engine = TestEngine;

    fn dma_names(&self) -> Result<Vec<String>, i32> {
        self.names.lock().unwrap().clone()
    }

    fn request_channel(&self, name: &str) -> Option<Self::Engine> {
        if self.hidden.lock().unwrap().iter().any(|hidden| hidden == name) {
            return None;
        }
        Some(TestEngine {
            state: self.engine(name),
            released: AtomicBool::new(false),
        })
    }

    fn pin_user_pages(
        &self,
        start: usize,
        nr_pages: usize,
        write: bool,
        pages: &mut Vec<Self::Page>,
    ) -> usize {
        assert_eq!(
            start & ((1 << PAGE_SHIFT) - 1),
            0,
            "pins must start on a page"
        );
        *self.last_pin_writable.lock().unwrap() = Some(write);

        let limit = self.pin_limit.lock().unwrap().unwrap_or(nr_pages);
        let count = nr_pages.min(limit);
        let mut pinned = self.pinned.lock().unwrap();
        for pfn in (start >> PAGE_SHIFT)..(start >> PAGE_SHIFT) + count {
            *pinned.entry(pfn).or_default() += 1;
            pages.push(TestPage { pfn });
        }
        count
    }

    fn set_page_dirty(&self, page: &Self::Page) {
        assert!(
            self.pinned.lock().unwrap().contains_key(&page.pfn),
            "dirtied unpinned page {page:?}"
        );
        self.dirty.lock().unwrap().push(page.pfn);
    }

    fn put_page(&self, page: Self::Page) {
        let mut pinned = self.pinned.lock().unwrap();
        let Some(count) = pinned.get_mut(&page.pfn) else {
            panic!("released page {page:?} which was not pinned");
        };
        *count -= 1;
        if *count == 0 {
            pinned.remove(&page.pfn);
        }
    }

    fn map_sg(&self, pages: &[Self::Page], sgl: &mut [Segment], _: DmaDataDirection) -> usize {
        let limit = self.map_limit.lock().unwrap().unwrap_or(sgl.len());
        let count = sgl.len().min(limit);
        for seg in &mut sgl[..count] {
            let pfn = pages[seg.page_index()].pfn;
            seg.set_dma_addr(((pfn << PAGE_SHIFT) + seg.offset()) as u64);
        }
        if count > 0 {
            self.mapped.fetch_add(1, Ordering::SeqCst);
        }
        count
    }

    fn unmap_sg(&self, _: &[Self::Page], _: &mut [Segment], _: DmaDataDirection) {
        let prev = self.mapped.fetch_sub(1, Ordering::SeqCst);
        assert_ne!(prev, 0, "unmapped a table that was not mapped");
    }
}

// === impl EngineState ===

impl EngineState {
    fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            last_sgl: Mutex::new(Vec::new()),
            last_flags: Mutex::new(None),
            last_direction: Mutex::new(None),
            fail_prep: AtomicBool::new(false),
            reject_submit: AtomicBool::new(false),
            submitted: AtomicUsize::new(0),
            issued: AtomicUsize::new(0),
            terminated: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            max_outstanding: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_prep(&self, fail: bool) {
        self.fail_prep.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn reject_submit(&self, reject: bool) {
        self.reject_submit.store(reject, Ordering::SeqCst);
    }

    /// Fires the oldest pending completion callback, as the engine's
    /// interrupt handler would. Returns `false` if nothing was pending.
    pub(crate) fn complete_one(&self) -> bool {
        let callback = {
            let mut pending = self.pending.lock().unwrap();
            if pending.is_empty() {
                return false;
            }
            pending.remove(0)
        };
        callback.invoke();
        true
    }

    pub(crate) fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub(crate) fn submitted(&self) -> usize {
        self.submitted.load(Ordering::SeqCst)
    }

    pub(crate) fn issued(&self) -> usize {
        self.issued.load(Ordering::SeqCst)
    }

    pub(crate) fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }

    pub(crate) fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub(crate) fn max_outstanding(&self) -> usize {
        self.max_outstanding.load(Ordering::SeqCst)
    }

    pub(crate) fn last_sgl(&self) -> Vec<Segment> {
        self.last_sgl.lock().unwrap().clone()
    }

    pub(crate) fn last_flags(&self) -> Option<PrepFlags> {
        *self.last_flags.lock().unwrap()
    }

    pub(crate) fn last_direction(&self) -> Option<TransferDirection> {
        *self.last_direction.lock().unwrap()
    }
}

// === impl TestEngine ===

impl Engine for TestEngine {
    type Tx = TestTx;

    fn prep_slave_sg(
        &self,
        sgl: &[Segment],
        direction: TransferDirection,
        flags: PrepFlags,
    ) -> Option<Self::Tx> {
        assert!(
            sgl.iter().all(|seg| seg.dma_addr().is_some()),
            "prepared a descriptor over an unmapped table"
        );
        if self.state.fail_prep.load(Ordering::SeqCst) {
            return None;
        }
        *self.state.last_flags.lock().unwrap() = Some(flags);
        *self.state.last_direction.lock().unwrap() = Some(direction);
        Some(TestTx {
            segments: sgl.to_vec(),
        })
    }

    fn submit(&self, tx: Self::Tx, callback: Callback) -> Cookie {
        let cookie = self.state.submitted.fetch_add(1, Ordering::SeqCst) as i32 + 1;
        if self.state.reject_submit.load(Ordering::SeqCst) {
            // -EIO
            return Cookie(-5);
        }
        *self.state.last_sgl.lock().unwrap() = tx.segments;
        let mut pending = self.state.pending.lock().unwrap();
        pending.push(callback);
        self.state.max_outstanding.fetch_max(pending.len(), Ordering::SeqCst);
        Cookie(cookie)
    }

    fn issue_pending(&self) {
        self.state.issued.fetch_add(1, Ordering::SeqCst);
    }

    fn terminate_all(&self) {
        self.state.terminated.fetch_add(1, Ordering::SeqCst);
        // terminated transactions never complete.
        self.state.pending.lock().unwrap().clear();
    }

    fn release(&self) {
        assert!(
            !self.released.swap(true, Ordering::SeqCst),
            "released a DMA channel twice"
        );
        self.state.released.fetch_add(1, Ordering::SeqCst);
    }
}
