//! Versioned lock word attached to every transactional cell
//!
//! Every cell carries two atomics:
//! - `version`: bumped by exactly one on every committed write
//! - `state`: a packed word holding the lock mode, reader count, surplus,
//!   read-bias flag, read-only streak and poison flag
//!
//! All lock state transitions are CAS loops on `state`; no mutex is ever
//! involved. A transition that is denied because another party holds a
//! conflicting lock is retried at most `spin` times and then reported as a
//! [`LockFailure`]. Retrying beyond that is the transaction's business.
//!
//! # Layout
//!
//! ```text
//! bits  0..10  read-only streak (saturates at MAX_READONLY_STREAK)
//! bit   10     read-biased
//! bit   11     poisoned
//! bits 12..14  lock mode (None / Read / Write / Exclusive)
//! bits 14..35  reader count (only non-zero in Read mode)
//! bits 35..63  surplus (arrived parties)
//! bit   63     commuting (the Write/Exclusive holder only applies commutes)
//! ```
//!
//! # State Machine
//!
//! ```text
//!            acquire(Read)                 acquire(Write | Exclusive)
//!   Free ------------------> Read(1..n)    Free -----------------------> Write | Exclusive
//!   Read(1) --upgrade by the sole reader--> Write | Exclusive
//!   Write   --upgrade by the owner---------> Exclusive
//! ```
//!
//! Commuters take their write lock through [`VersionedLock::acquire_commuting`],
//! which marks the word. Another commuter waits on a marked lock for as long
//! as it takes; every other holder only gets `spin` attempts.

use std::sync::atomic::{AtomicU64, Ordering};
use strata_core::LockMode;

const STREAK_MASK: u64 = 0x3FF;
const READ_BIASED_BIT: u64 = 1 << 10;
const POISONED_BIT: u64 = 1 << 11;
const MODE_SHIFT: u32 = 12;
const MODE_MASK: u64 = 0b11 << MODE_SHIFT;
const READERS_SHIFT: u32 = 14;
const READERS_MASK: u64 = ((1 << 21) - 1) << READERS_SHIFT;
const SURPLUS_SHIFT: u32 = 35;
const SURPLUS_MASK: u64 = ((1 << 28) - 1) << SURPLUS_SHIFT;
const COMMUTING_BIT: u64 = 1 << 63;

/// Largest value the read-only streak field can hold
pub const MAX_READONLY_STREAK: u32 = STREAK_MASK as u32;

/// Default number of consecutive read-only departures before promotion
pub const DEFAULT_READ_BIASED_THRESHOLD: u32 = 128;

const MAX_READERS: u64 = READERS_MASK >> READERS_SHIFT;
const MAX_SURPLUS: u64 = SURPLUS_MASK >> SURPLUS_SHIFT;

/// Decoded view of a packed lock word
///
/// `LockWord` is a plain copy of the state at one instant; mutating it does
/// not touch the cell.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct LockWord(u64);

impl LockWord {
    /// Word of a free, unbiased cell with nobody arrived
    pub const FREE: LockWord = LockWord(0);

    /// Raw packed value
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Current lock mode
    pub fn lock_mode(self) -> LockMode {
        let raw = ((self.0 & MODE_MASK) >> MODE_SHIFT) as u8;
        match LockMode::from_u8(raw) {
            Some(mode) => mode,
            None => unreachable!("two-bit lock mode field out of range"),
        }
    }

    /// Number of read lock holders
    pub fn readers(self) -> u32 {
        ((self.0 & READERS_MASK) >> READERS_SHIFT) as u32
    }

    /// Number of arrived parties
    pub fn surplus(self) -> u32 {
        ((self.0 & SURPLUS_MASK) >> SURPLUS_SHIFT) as u32
    }

    /// Whether pure reads skip arrive/depart bookkeeping
    pub fn is_read_biased(self) -> bool {
        self.0 & READ_BIASED_BIT != 0
    }

    /// Whether the cell was abandoned by an aborted construction
    pub fn is_poisoned(self) -> bool {
        self.0 & POISONED_BIT != 0
    }

    /// Consecutive read-only departures since the last update
    pub fn readonly_streak(self) -> u32 {
        (self.0 & STREAK_MASK) as u32
    }

    /// Whether the write lock is held by a party applying commutes
    pub fn is_commuting(self) -> bool {
        self.0 & COMMUTING_BIT != 0
    }

    fn with_lock_mode(self, mode: LockMode) -> Self {
        LockWord((self.0 & !MODE_MASK) | ((mode.as_u8() as u64) << MODE_SHIFT))
    }

    fn with_readers(self, readers: u32) -> Self {
        assert!(u64::from(readers) <= MAX_READERS, "reader count overflow");
        LockWord((self.0 & !READERS_MASK) | (u64::from(readers) << READERS_SHIFT))
    }

    fn with_surplus(self, surplus: u32) -> Self {
        assert!(u64::from(surplus) <= MAX_SURPLUS, "surplus overflow");
        LockWord((self.0 & !SURPLUS_MASK) | (u64::from(surplus) << SURPLUS_SHIFT))
    }

    fn with_read_biased(self, biased: bool) -> Self {
        if biased {
            LockWord(self.0 | READ_BIASED_BIT)
        } else {
            LockWord(self.0 & !READ_BIASED_BIT)
        }
    }

    fn with_commuting(self, commuting: bool) -> Self {
        if commuting {
            LockWord(self.0 | COMMUTING_BIT)
        } else {
            LockWord(self.0 & !COMMUTING_BIT)
        }
    }

    fn with_poisoned(self) -> Self {
        LockWord(self.0 | POISONED_BIT)
    }

    fn with_readonly_streak(self, streak: u32) -> Self {
        let streak = u64::from(streak.min(MAX_READONLY_STREAK));
        LockWord((self.0 & !STREAK_MASK) | streak)
    }
}

impl std::fmt::Debug for LockWord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockWord")
            .field("lock_mode", &self.lock_mode())
            .field("readers", &self.readers())
            .field("surplus", &self.surplus())
            .field("read_biased", &self.is_read_biased())
            .field("readonly_streak", &self.readonly_streak())
            .field("poisoned", &self.is_poisoned())
            .field("commuting", &self.is_commuting())
            .finish()
    }
}

/// Why a lock word transition was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockFailure {
    /// Another party holds a conflicting lock
    Held,
    /// The cell was poisoned by an aborted construction
    Poisoned,
}

/// Outcome of a successful `arrive()`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arrival {
    /// Surplus was incremented; the caller must depart later
    Registered,
    /// Cell is read-biased; nothing was recorded and nothing is owed
    Unregistered,
}

impl Arrival {
    /// Whether the caller now has a depart obligation
    pub fn is_registered(self) -> bool {
        matches!(self, Arrival::Registered)
    }
}

/// Outcome of a successful lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LockGrant {
    /// Exclusive lock granted while other parties may be reading the cell
    ///
    /// The acquiring transaction must advance the global conflict counter
    /// when it commits so those readers revalidate.
    pub contended: bool,
}

/// How a party leaves a cell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    /// Transaction committed without writing the cell
    AfterReading,
    /// Transaction committed a write to the cell
    AfterUpdate,
    /// Transaction aborted
    AfterFailure,
}

/// The versioned lock word of one cell
#[derive(Debug)]
pub struct VersionedLock {
    state: AtomicU64,
    version: AtomicU64,
}

impl VersionedLock {
    /// Free lock at version 0
    pub fn new() -> Self {
        VersionedLock {
            state: AtomicU64::new(LockWord::FREE.raw()),
            version: AtomicU64::new(0),
        }
    }

    /// Lock already held exclusively by one registered party
    ///
    /// Used for cells created inside a transaction: nobody else can open the
    /// cell until the creating transaction publishes it.
    pub fn new_constructing() -> Self {
        let word = LockWord::FREE
            .with_lock_mode(LockMode::Exclusive)
            .with_surplus(1);
        VersionedLock {
            state: AtomicU64::new(word.raw()),
            version: AtomicU64::new(0),
        }
    }

    /// Snapshot of the packed state
    pub fn word(&self) -> LockWord {
        LockWord(self.state.load(Ordering::Acquire))
    }

    /// Last committed version
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Store a new committed version
    ///
    /// Only the holder of the exclusive lock may call this.
    pub(crate) fn publish_version(&self, version: u64) {
        debug_assert_eq!(self.word().lock_mode(), LockMode::Exclusive);
        self.version.store(version, Ordering::Release);
    }

    fn compare_exchange(&self, current: LockWord, next: LockWord) -> bool {
        self.state
            .compare_exchange_weak(current.0, next.0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Register interest in the cell
    ///
    /// Fails while the cell is exclusively locked (after `spin` attempts)
    /// or when it has been poisoned. Read-biased cells are not counted.
    pub fn arrive(&self, spin: u32) -> Result<Arrival, LockFailure> {
        let mut remaining = spin;
        loop {
            let current = self.word();
            if current.is_poisoned() {
                return Err(LockFailure::Poisoned);
            }
            if current.lock_mode() == LockMode::Exclusive {
                if remaining == 0 {
                    return Err(LockFailure::Held);
                }
                remaining -= 1;
                std::hint::spin_loop();
                continue;
            }
            if current.is_read_biased() {
                return Ok(Arrival::Unregistered);
            }
            let next = current.with_surplus(current.surplus() + 1);
            if self.compare_exchange(current, next) {
                return Ok(Arrival::Registered);
            }
        }
    }

    /// Move from `held` to `requested`
    ///
    /// Re-acquiring a mode at or below the one held is a no-op. Upgrading
    /// from `Read` requires the caller to be the sole reader. `registered`
    /// tells whether the caller is counted in the surplus, which decides if
    /// an exclusive grant is contended.
    pub fn try_acquire(
        &self,
        held: LockMode,
        requested: LockMode,
        registered: bool,
        spin: u32,
    ) -> Result<LockGrant, LockFailure> {
        if requested <= held {
            return Ok(LockGrant::default());
        }

        let mut remaining = spin;
        loop {
            let current = self.word();
            if current.is_poisoned() {
                return Err(LockFailure::Poisoned);
            }

            let next = match (held, requested) {
                (LockMode::None, LockMode::Read) => match current.lock_mode() {
                    LockMode::None | LockMode::Read => Some(
                        current
                            .with_lock_mode(LockMode::Read)
                            .with_readers(current.readers() + 1),
                    ),
                    LockMode::Write | LockMode::Exclusive => None,
                },
                (LockMode::None, _) => match current.lock_mode() {
                    LockMode::None => Some(current.with_lock_mode(requested)),
                    _ => None,
                },
                (LockMode::Read, _) => {
                    assert_eq!(
                        current.lock_mode(),
                        LockMode::Read,
                        "read lock held but lock word is {:?}",
                        current
                    );
                    if current.readers() == 1 {
                        Some(current.with_readers(0).with_lock_mode(requested))
                    } else {
                        None
                    }
                }
                (LockMode::Write, LockMode::Exclusive) => {
                    assert_eq!(
                        current.lock_mode(),
                        LockMode::Write,
                        "write lock held but lock word is {:?}",
                        current
                    );
                    Some(current.with_lock_mode(LockMode::Exclusive))
                }
                (held, requested) => {
                    unreachable!("no transition from {} to {}", held, requested)
                }
            };

            let Some(next) = next else {
                if remaining == 0 {
                    return Err(LockFailure::Held);
                }
                remaining -= 1;
                std::hint::spin_loop();
                continue;
            };

            if self.compare_exchange(current, next) {
                let others = current.surplus().saturating_sub(u32::from(registered));
                let contended = requested == LockMode::Exclusive
                    && (others > 0 || current.is_read_biased());
                return Ok(LockGrant { contended });
            }
        }
    }

    /// Take the write lock on behalf of pending commutes
    ///
    /// While another commuter holds the lock this waits, yielding the thread,
    /// until it is released. Commuters acquire these locks in cell id order
    /// after all their other locks, so commuters never wait on each other in
    /// a cycle. Any other holder gets `spin` attempts before `Held` is
    /// reported.
    pub fn acquire_commuting(&self, spin: u32) -> Result<LockGrant, LockFailure> {
        let mut remaining = spin;
        loop {
            let current = self.word();
            if current.is_poisoned() {
                return Err(LockFailure::Poisoned);
            }
            if current.lock_mode() == LockMode::None {
                let next = current
                    .with_lock_mode(LockMode::Write)
                    .with_commuting(true);
                if self.compare_exchange(current, next) {
                    return Ok(LockGrant::default());
                }
                continue;
            }
            if current.is_commuting() {
                std::thread::yield_now();
                continue;
            }
            if remaining == 0 {
                return Err(LockFailure::Held);
            }
            remaining -= 1;
            std::hint::spin_loop();
        }
    }

    /// Release `held` and settle the surplus owed by the caller
    ///
    /// `threshold` is the read-only streak after which an idle cell is
    /// promoted to read-biased. An update always demotes the cell.
    pub fn depart(
        &self,
        held: LockMode,
        registered: bool,
        departure: Departure,
        threshold: u32,
    ) -> LockWord {
        loop {
            let current = self.word();
            let mut next = match held {
                LockMode::None => current,
                LockMode::Read => {
                    let readers = current.readers();
                    assert!(
                        current.lock_mode() == LockMode::Read && readers > 0,
                        "read lock released but lock word is {:?}",
                        current
                    );
                    let next = current.with_readers(readers - 1);
                    if readers == 1 {
                        next.with_lock_mode(LockMode::None)
                    } else {
                        next
                    }
                }
                LockMode::Write | LockMode::Exclusive => {
                    assert_eq!(
                        current.lock_mode(),
                        held,
                        "{} lock released but lock word is {:?}",
                        held,
                        current
                    );
                    current
                        .with_lock_mode(LockMode::None)
                        .with_commuting(false)
                }
            };

            if registered {
                let surplus = next.surplus();
                assert!(surplus > 0, "depart without arrival: {:?}", current);
                next = next.with_surplus(surplus - 1);
            }

            match departure {
                Departure::AfterUpdate => {
                    next = next.with_readonly_streak(0).with_read_biased(false);
                }
                Departure::AfterReading if !next.is_read_biased() => {
                    let streak = next.readonly_streak().saturating_add(1);
                    next = next.with_readonly_streak(streak);
                    if streak >= threshold.min(MAX_READONLY_STREAK)
                        && next.surplus() == 0
                        && next.lock_mode() == LockMode::None
                    {
                        next = next.with_read_biased(true).with_readonly_streak(0);
                    }
                }
                Departure::AfterReading | Departure::AfterFailure => {}
            }

            if self.compare_exchange(current, next) {
                return next;
            }
        }
    }

    /// Abandon a cell whose constructing transaction aborted
    pub fn poison(&self) {
        loop {
            let current = self.word();
            let next = current
                .with_lock_mode(LockMode::None)
                .with_commuting(false)
                .with_surplus(current.surplus().saturating_sub(1))
                .with_poisoned();
            if self.compare_exchange(current, next) {
                return;
            }
        }
    }
}

impl Default for VersionedLock {
    fn default() -> Self {
        Self::new()
    }
}
