//! Epoch manager.
//!
//! Threads bracket their work with `enter`/`exit` and announce safe points
//! with `quiesce`. A new epoch may open only once every registered thread
//! has quiesced since the previous advance; a closed epoch is reclaimed once
//! no thread still sits inside it. At each epoch end the manager asks its
//! client for a cookie (the current LSN when any region wants GC); when that
//! epoch is reclaimed the cookie comes back through `epoch_reclaimed`, which
//! installs the trim LSN and kicks the reclaim daemons.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use parking_lot::Mutex;
use serval_error::{EngineError, Result};
use serval_types::{CacheAligned, Lsn};

/// Upper bound on threads registered with the manager at once.
pub const EPOCH_SLOTS: usize = 64;

/// What the epoch manager calls back into at epoch boundaries.
pub trait EpochClient: Send + Sync {
    /// An epoch just ended; return a cookie to carry until it is reclaimed.
    fn epoch_ended(&self) -> Option<Lsn>;

    /// The epoch carrying `cookie` has fully quiesced.
    fn epoch_reclaimed(&self, cookie: Option<Lsn>);
}

#[derive(Default)]
struct EpochSlot {
    /// Epoch this thread is currently inside; 0 when outside.
    current: AtomicU64,
    /// Last epoch in which this thread quiesced.
    quiesced_at: AtomicU64,
}

struct PendingEpoch {
    epoch: u64,
    cookie: Option<Lsn>,
}

/// Quiescence-tracking epoch manager.
pub struct EpochManager {
    global: AtomicU64,
    claimed: AtomicU64,
    slots: Box<[CacheAligned<EpochSlot>]>,
    /// Closed epochs awaiting full quiescence; also serializes advances.
    pending: Mutex<VecDeque<PendingEpoch>>,
    client: OnceLock<Arc<dyn EpochClient>>,
}

impl EpochManager {
    #[must_use]
    pub fn new() -> Arc<Self> {
        let mut slots = Vec::with_capacity(EPOCH_SLOTS);
        slots.resize_with(EPOCH_SLOTS, CacheAligned::default);
        Arc::new(Self {
            global: AtomicU64::new(1),
            claimed: AtomicU64::new(0),
            slots: slots.into_boxed_slice(),
            pending: Mutex::new(VecDeque::new()),
            client: OnceLock::new(),
        })
    }

    /// Wire the client. Called once during engine construction, after the
    /// region set exists.
    pub fn attach_client(&self, client: Arc<dyn EpochClient>) {
        let _ = self.client.set(client);
    }

    /// Current epoch number (starts at 1).
    #[inline]
    #[must_use]
    pub fn current_epoch(&self) -> u64 {
        self.global.load(Ordering::Acquire)
    }

    /// Claim a slot for the calling thread. Lowest unset bit in the claimed
    /// bitmap, same protocol as the readers registry.
    pub fn register_thread(&self) -> Result<usize> {
        let mut old = self.claimed.load(Ordering::Acquire);
        loop {
            let new = old | (old.wrapping_add(1));
            if new == old {
                return Err(EngineError::SlotExhausted { limit: EPOCH_SLOTS });
            }
            match self
                .claimed
                .compare_exchange(old, new, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let slot = (new ^ old).trailing_zeros() as usize;
                    let s = &self.slots[slot];
                    s.current.store(0, Ordering::Release);
                    // a freshly registered thread holds nothing: it counts
                    // as quiesced in the current epoch
                    s.quiesced_at
                        .store(self.global.load(Ordering::Acquire), Ordering::Release);
                    return Ok(slot);
                }
                Err(seen) => old = seen,
            }
        }
    }

    /// Release a slot at thread exit.
    pub fn deregister_thread(&self, slot: usize) {
        self.slots[slot].current.store(0, Ordering::Release);
        self.claimed.fetch_xor(1_u64 << slot, Ordering::AcqRel);
    }

    /// Enter the current epoch. Entering is a safe point: the thread held
    /// nothing a moment ago.
    pub fn enter(&self, slot: usize) {
        let e = self.global.load(Ordering::Acquire);
        let s = &self.slots[slot];
        s.current.store(e, Ordering::Release);
        s.quiesced_at.store(e, Ordering::Release);
    }

    /// Leave the epoch (a safe point as well).
    pub fn exit(&self, slot: usize) {
        let e = self.global.load(Ordering::Acquire);
        let s = &self.slots[slot];
        s.quiesced_at.store(e, Ordering::Release);
        s.current.store(0, Ordering::Release);
    }

    /// Announce a safe point without leaving; re-enters the current epoch.
    pub fn quiesce(&self, slot: usize) {
        let e = self.global.load(Ordering::Acquire);
        let s = &self.slots[slot];
        s.quiesced_at.store(e, Ordering::Release);
        if s.current.load(Ordering::Acquire) != 0 {
            s.current.store(e, Ordering::Release);
        }
    }

    /// A new epoch is possible when every registered thread is either
    /// outside or has quiesced in the current epoch.
    #[must_use]
    pub fn new_epoch_possible(&self) -> bool {
        let e = self.global.load(Ordering::Acquire);
        self.for_each_claimed(|s| {
            s.current.load(Ordering::Acquire) == 0 || s.quiesced_at.load(Ordering::Acquire) >= e
        })
    }

    /// Close the current epoch and open the next. Returns `false` when some
    /// thread has not quiesced yet.
    pub fn new_epoch(&self) -> bool {
        let mut pending = self.pending.lock();
        if !self.new_epoch_possible() {
            return false;
        }
        let ending = self.global.load(Ordering::Acquire);
        let cookie = self.client.get().and_then(|c| c.epoch_ended());
        pending.push_back(PendingEpoch { epoch: ending, cookie });
        self.global.store(ending + 1, Ordering::Release);
        true
    }

    /// Reclaim every closed epoch no thread still sits in, oldest first.
    pub fn tick(&self) {
        loop {
            let front = {
                let mut pending = self.pending.lock();
                match pending.front() {
                    Some(p) if self.no_thread_inside(p.epoch) => pending.pop_front(),
                    _ => return,
                }
            };
            if let (Some(p), Some(client)) = (front, self.client.get()) {
                client.epoch_reclaimed(p.cookie);
            }
        }
    }

    fn no_thread_inside(&self, epoch: u64) -> bool {
        self.for_each_claimed(|s| {
            let cur = s.current.load(Ordering::Acquire);
            cur == 0 || cur > epoch
        })
    }

    fn for_each_claimed(&self, mut ok: impl FnMut(&EpochSlot) -> bool) -> bool {
        let mut claimed = self.claimed.load(Ordering::Acquire);
        while claimed != 0 {
            let slot = claimed.trailing_zeros() as usize;
            claimed &= claimed - 1;
            if !ok(&self.slots[slot]) {
                return false;
            }
        }
        true
    }
}

/// Spawn the manager's internal ticker thread.
pub fn spawn_epoch_ticker(
    epochs: Arc<EpochManager>,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::Builder::new()
        .name("serval-epoch".into())
        .spawn(move || {
            while !shutdown.load(Ordering::Acquire) {
                epochs.tick();
                std::thread::sleep(Duration::from_millis(1));
            }
        })
        .expect("spawn epoch ticker")
}
