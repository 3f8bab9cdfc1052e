//! Wakeup plumbing for blocking retries
//!
//! A transaction that calls `retry()` parks on a [`Latch`] after pushing a
//! [`Listener`] onto the chain of every cell it read. The next commit that
//! publishes one of those cells drains the chain and opens the latches.
//!
//! Latches are reused across attempts of the same driver loop. Each wait
//! runs in its own era; a listener only opens its latch if the era still
//! matches, so nodes left behind on cells that never changed are inert.

use parking_lot::{Condvar, Mutex};
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Default)]
struct LatchState {
    era: u64,
    open: bool,
}

/// One-shot gate a blocked transaction waits on
#[derive(Debug, Default)]
pub struct Latch {
    state: Mutex<LatchState>,
    cond: Condvar,
}

impl Latch {
    /// Closed latch at era 0
    pub fn new() -> Self {
        Self::default()
    }

    /// Current era
    pub fn era(&self) -> u64 {
        self.state.lock().era
    }

    /// Whether the current era has been opened
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Open the latch if it is still in `era`
    ///
    /// Returns true if this call opened it.
    pub fn open(&self, era: u64) -> bool {
        let mut state = self.state.lock();
        if state.era != era || state.open {
            return false;
        }
        state.open = true;
        self.cond.notify_all();
        true
    }

    /// Close the latch and move to the next era
    pub fn reset(&self) -> u64 {
        let mut state = self.state.lock();
        state.era += 1;
        state.open = false;
        state.era
    }

    /// Wait until `era` is opened or the deadline passes
    ///
    /// Returns false on timeout.
    pub fn await_open(&self, era: u64, deadline: Option<Instant>) -> bool {
        let mut state = self.state.lock();
        loop {
            if state.era != era {
                return true;
            }
            if state.open {
                return true;
            }
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut state, deadline).timed_out() {
                        return state.open;
                    }
                }
                None => self.cond.wait(&mut state),
            }
        }
    }
}

/// A latch subscription for one era
#[derive(Debug, Clone)]
pub struct Listener {
    latch: Arc<Latch>,
    era: u64,
}

impl Listener {
    /// Subscribe `latch` in `era`
    pub fn new(latch: Arc<Latch>, era: u64) -> Self {
        Listener { latch, era }
    }

    /// Open the latch; returns true if it was still waiting
    pub fn notify(&self) -> bool {
        self.latch.open(self.era)
    }
}

/// Open every latch in `listeners`, returning how many were woken
pub fn notify_all(listeners: Vec<Listener>) -> usize {
    listeners.iter().filter(|l| l.notify()).count()
}

struct Node {
    listener: Listener,
    next: *mut Node,
}

/// Lock-free stack of listeners attached to a cell
///
/// Producers prepend with a CAS on the head. The only consumer operation is
/// [`take`](ListenerChain::take), which swaps the whole chain out at once,
/// so no node is ever unlinked while another thread can see it.
#[derive(Debug)]
pub struct ListenerChain {
    head: AtomicPtr<Node>,
}

impl ListenerChain {
    /// Empty chain
    pub fn new() -> Self {
        ListenerChain {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// True if nothing is parked
    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Prepend a listener
    pub fn push(&self, listener: Listener) {
        let node = Box::into_raw(Box::new(Node {
            listener,
            next: ptr::null_mut(),
        }));
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            // SAFETY: `node` came from Box::into_raw above and is not shared
            // until the compare_exchange below succeeds.
            unsafe { (*node).next = head };
            match self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// Detach and return every listener
    pub fn take(&self) -> Vec<Listener> {
        let mut current = self.head.swap(ptr::null_mut(), Ordering::AcqRel);
        let mut listeners = Vec::new();
        while !current.is_null() {
            // SAFETY: the swap made this thread the sole owner of the chain.
            // Every node was allocated by `push` through Box::into_raw and is
            // freed exactly once here.
            let node = unsafe { Box::from_raw(current) };
            current = node.next;
            listeners.push(node.listener);
        }
        listeners
    }
}

impl Default for ListenerChain {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ListenerChain {
    fn drop(&mut self) {
        drop(self.take());
    }
}
