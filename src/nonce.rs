use ethers::types::{Address, U256};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
struct SenderNonces {
    /// Handed out to runs that have not broadcast yet.
    outstanding: BTreeSet<U256>,
    /// Accepted by the bundler but not yet reflected by the chain.
    broadcast: BTreeSet<U256>,
}

/// Hands out EntryPoint nonces so concurrent drafts for one sender never share a nonce.
///
/// The on-chain nonce only moves once an operation is included, so two runs that fetch it
/// back to back see the same value. The allocator remembers what it handed out and returns
/// the lowest nonce nobody holds. A reservation is a [`NonceLease`]: dropping it before
/// [`NonceLease::commit`] makes the nonce available again, so an abandoned run leaves no
/// gap behind.
#[derive(Debug, Default)]
pub struct NonceAllocator {
    senders: Mutex<HashMap<Address, SenderNonces>>,
}

impl NonceAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserves a nonce for `sender`, given the nonce the chain reports right now.
    pub fn reserve(self: &Arc<Self>, sender: Address, on_chain: U256) -> NonceLease {
        let mut senders = self.senders.lock();
        let entry = senders.entry(sender).or_default();
        // the chain has caught up with these
        entry.broadcast = entry.broadcast.split_off(&on_chain);

        let mut nonce = on_chain;
        while entry.outstanding.contains(&nonce) || entry.broadcast.contains(&nonce) {
            nonce += U256::one();
        }
        entry.outstanding.insert(nonce);

        NonceLease(Arc::new(Reservation {
            allocator: Arc::clone(self),
            sender,
            nonce,
            committed: AtomicBool::new(false),
        }))
    }

    fn release(&self, sender: Address, nonce: U256) {
        let mut senders = self.senders.lock();
        if let Some(entry) = senders.get_mut(&sender) {
            entry.outstanding.remove(&nonce);
            if entry.outstanding.is_empty() && entry.broadcast.is_empty() {
                senders.remove(&sender);
            }
        }
    }

    fn commit(&self, sender: Address, nonce: U256) {
        let mut senders = self.senders.lock();
        let entry = senders.entry(sender).or_default();
        entry.outstanding.remove(&nonce);
        entry.broadcast.insert(nonce);
    }
}

struct Reservation {
    allocator: Arc<NonceAllocator>,
    sender: Address,
    nonce: U256,
    committed: AtomicBool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.committed.load(Ordering::Acquire) {
            self.allocator.release(self.sender, self.nonce);
            tracing::debug!(sender = ?self.sender, nonce = %self.nonce, "released unused nonce");
        }
    }
}

/// A reserved nonce. Clones share the reservation; it is released when the last clone
/// is dropped, unless it was committed first.
#[derive(Clone)]
pub struct NonceLease(Arc<Reservation>);

impl NonceLease {
    pub fn sender(&self) -> Address {
        self.0.sender
    }

    pub fn nonce(&self) -> U256 {
        self.0.nonce
    }

    /// Marks the nonce as used by a broadcast operation. Idempotent.
    pub fn commit(&self) {
        if !self.0.committed.swap(true, Ordering::AcqRel) {
            self.0.allocator.commit(self.0.sender, self.0.nonce);
        }
    }

    pub fn is_committed(&self) -> bool {
        self.0.committed.load(Ordering::Acquire)
    }
}

impl PartialEq for NonceLease {
    fn eq(&self, other: &Self) -> bool {
        self.sender() == other.sender() && self.nonce() == other.nonce()
    }
}

impl Eq for NonceLease {}

impl fmt::Debug for NonceLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NonceLease")
            .field("sender", &self.sender())
            .field("nonce", &self.nonce())
            .field("committed", &self.is_committed())
            .finish()
    }
}
