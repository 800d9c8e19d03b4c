//! In-memory snap-read lock table serializing origin writes against
//! in-flight snapshot reads.
//!
//! A lock exists on an origin chunk for as long as at least one client
//! holds a snapshot read on it. An origin write that finds a lock on one
//! of its chunks cannot reply immediately; its reply is parked as a
//! [`Pending`] that counts down as the blocking reads finish.

use std::rc::Rc;
use std::cell::RefCell;

use chunksnap_data_structures::BucketTable;

/// A deferred reply, shared by every chunk an origin write is waiting on.
///
/// `holdcount` starts at the number of locked chunks plus one (the "all
/// chunks processed" balancing decrement described in the origin-write
/// flow), and the reply fires when it reaches zero.
pub struct Pending {
    pub holdcount: u32,
    pub fired: bool,
}

impl Pending {
    pub fn new() -> Rc<RefCell<Pending>> {
        Rc::new(RefCell::new(Pending { holdcount: 1, fired: false }))
    }
}

struct Lock {
    holders: Vec<u64>,
    waiters: Vec<Rc<RefCell<Pending>>>,
}

/// Hashed set of per-chunk read locks, keyed by origin chunk number.
pub struct LockTable {
    locks: BucketTable<Lock>,
}

impl LockTable {
    pub fn new(hash_bits: u8) -> Self {
        Self {
            locks: BucketTable::new(hash_bits),
        }
    }

    /// Registers `client` as a reader of `chunk`, creating the lock if
    /// this is the first reader.
    pub fn readlock_chunk(&mut self, chunk: u64, client: u64) {
        match self.locks.get_mut(chunk) {
            Some(lock) => lock.holders.push(client),
            None => {
                self.locks.insert(
                    chunk,
                    Lock {
                        holders: vec![client],
                        waiters: Vec::new(),
                    },
                );
            }
        }
    }

    /// If `chunk` is currently locked, links `pending` as a waiter and
    /// bumps its hold count by one. Does nothing if no lock exists (the
    /// caller's exception, if any, can reply without waiting).
    ///
    /// Returns whether a wait was actually registered.
    pub fn waitfor_chunk(&mut self, chunk: u64, pending: &Rc<RefCell<Pending>>) -> bool {
        match self.locks.get_mut(chunk) {
            Some(lock) => {
                pending.borrow_mut().holdcount += 1;
                lock.waiters.push(pending.clone());
                true
            }
            None => false,
        }
    }

    /// Removes `client`'s hold on `chunk`. When the last holder releases,
    /// every waiter's pending reply is counted down; replies that reach
    /// zero fire and the lock itself is freed.
    ///
    /// Returns the pendings that became ready to reply.
    pub fn release_chunk(&mut self, chunk: u64, client: u64) -> Vec<Rc<RefCell<Pending>>> {
        let mut ready = Vec::new();
        let Some(lock) = self.locks.get_mut(chunk) else {
            return ready;
        };
        lock.holders.retain(|&c| c != client);
        if lock.holders.is_empty() {
            let lock = self.locks.remove(chunk).expect("just looked it up");
            for pending in lock.waiters {
                let fire = {
                    let mut p = pending.borrow_mut();
                    p.holdcount -= 1;
                    p.holdcount == 0 && !p.fired
                };
                if fire {
                    pending.borrow_mut().fired = true;
                    ready.push(pending);
                }
            }
        }
        ready
    }

    /// Removes every hold a closed client's session still has across the
    /// whole table, as if it had released each chunk individually.
    pub fn release_all_for_client(&mut self, chunks: &[u64], client: u64) -> Vec<Rc<RefCell<Pending>>> {
        let mut ready = Vec::new();
        for &chunk in chunks {
            ready.extend(self.release_chunk(chunk, client));
        }
        ready
    }

    pub fn is_locked(&self, chunk: u64) -> bool {
        self.locks.contains_key(chunk)
    }
}

/// Balances the initial `holdcount` allocated with a [`Pending`] against
/// the chunks that turned out not to be locked, firing immediately if
/// nothing ever waited on it.
pub fn finish_pending(pending: Rc<RefCell<Pending>>) -> Option<Rc<RefCell<Pending>>> {
    let fire = {
        let mut p = pending.borrow_mut();
        p.holdcount -= 1;
        p.holdcount == 0 && !p.fired
    };
    if fire {
        pending.borrow_mut().fired = true;
        Some(pending)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_with_no_waiters_frees_the_lock() {
        let mut t = LockTable::new(4);
        t.readlock_chunk(7, 1);
        assert!(t.is_locked(7));
        let ready = t.release_chunk(7, 1);
        assert!(ready.is_empty());
        assert!(!t.is_locked(7));
    }

    #[test]
    fn waiter_fires_only_after_last_reader_releases() {
        let mut t = LockTable::new(4);
        t.readlock_chunk(7, 1);
        t.readlock_chunk(7, 2);
        let pending = Pending::new();
        assert!(t.waitfor_chunk(7, &pending));
        // balances Pending::new()'s initial holdcount once all chunks in
        // the request have been processed
        assert!(finish_pending(pending.clone()).is_none());

        assert!(t.release_chunk(7, 1).is_empty());
        let ready = t.release_chunk(7, 2);
        assert_eq!(ready.len(), 1);
        assert!(ready[0].borrow().fired);
    }

    #[test]
    fn waitfor_on_unlocked_chunk_does_nothing() {
        let mut t = LockTable::new(4);
        let pending = Pending::new();
        assert!(!t.waitfor_chunk(9, &pending));
        assert!(finish_pending(pending).is_some());
    }

    #[test]
    fn closing_a_client_releases_every_chunk_it_held() {
        let mut t = LockTable::new(4);
        t.readlock_chunk(1, 5);
        t.readlock_chunk(2, 5);
        let pending = Pending::new();
        t.waitfor_chunk(1, &pending);
        t.waitfor_chunk(2, &pending);
        assert!(finish_pending(pending.clone()).is_none());
        let ready = t.release_all_for_client(&[1, 2], 5);
        assert_eq!(ready.len(), 1);
        assert!(!t.is_locked(1));
        assert!(!t.is_locked(2));
    }
}
