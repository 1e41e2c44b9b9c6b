//! The bounded reservation store.
//!
//! One mutex guards all state; no external code runs under the lock, which
//! makes every operation linearizable. Admission follows the protocol's
//! asymmetry: a refresh by a peer that already holds a slot always succeeds,
//! a new peer is refused once the store is full. Nothing is ever evicted on
//! behalf of somebody else.

use std::{
    collections::HashMap,
    sync::Mutex,
    time::Duration,
};

use libp2p_identity::PeerId;
use multiaddr::Multiaddr;
use web_time::{Instant, SystemTime};

use crate::limit::Limit;

pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .expect("system time to be after the unix epoch")
        .as_secs()
}

/// A peer's slot on the relay.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub peer: PeerId,
    /// Unix seconds at which the slot lapses.
    pub expire: u64,
    /// Addresses the peer advertised when reserving.
    pub addrs: Vec<Multiaddr>,
    /// Circuit limit recorded at admission time.
    pub limit: Limit,
    pub created_at: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Accepted {
        expire: u64,
        /// Whether this replaced an existing reservation of the same peer.
        renewed: bool,
    },
    Refused,
}

pub struct ReservationStore {
    max_reservations: usize,
    reservation_ttl: Duration,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    reservations: HashMap<PeerId, Reservation>,
    /// Insertion order; a refresh keeps its slot.
    order: Vec<PeerId>,
}

impl Inner {
    fn purge_expired(&mut self, now: u64) -> Vec<PeerId> {
        let mut lapsed = Vec::new();
        self.reservations.retain(|peer, reservation| {
            if reservation.expire <= now {
                lapsed.push(*peer);
                false
            } else {
                true
            }
        });
        self.order.retain(|peer| !lapsed.contains(peer));
        lapsed
    }
}

impl ReservationStore {
    pub fn new(max_reservations: usize, reservation_ttl: Duration) -> Self {
        ReservationStore {
            max_reservations,
            reservation_ttl,
            inner: Mutex::default(),
        }
    }

    /// Admit or refresh a reservation for `peer`.
    ///
    /// Lapsed entries are dropped before the capacity check so a stale slot
    /// never blocks a live peer.
    pub fn reserve(&self, peer: PeerId, addrs: Vec<Multiaddr>, limit: Limit) -> ReserveOutcome {
        let now = unix_now();
        let expire = now + self.reservation_ttl.as_secs();

        let mut inner = self.lock();
        inner.purge_expired(now);

        let renewed = inner.reservations.contains_key(&peer);
        if !renewed && inner.reservations.len() >= self.max_reservations {
            return ReserveOutcome::Refused;
        }

        if !renewed {
            inner.order.push(peer);
        }
        inner.reservations.insert(
            peer,
            Reservation {
                peer,
                expire,
                addrs,
                limit,
                created_at: Instant::now(),
            },
        );

        ReserveOutcome::Accepted { expire, renewed }
    }

    /// The live reservation of `peer`, if any. Lapsed entries are reported
    /// absent even before the sweep got to them.
    pub fn get(&self, peer: &PeerId) -> Option<Reservation> {
        self.lock()
            .reservations
            .get(peer)
            .filter(|reservation| reservation.expire > unix_now())
            .cloned()
    }

    pub fn remove(&self, peer: &PeerId) -> Option<Reservation> {
        let mut inner = self.lock();
        let removed = inner.reservations.remove(peer);
        if removed.is_some() {
            inner.order.retain(|p| p != peer);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.lock().reservations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The peer whose reservation has been held the longest.
    pub fn oldest(&self) -> Option<PeerId> {
        self.lock().order.first().copied()
    }

    /// Drop every entry whose expiry has passed. Driven by the service's
    /// coarse sweep timer.
    pub(crate) fn remove_expired(&self) -> Vec<PeerId> {
        self.lock().purge_expired(unix_now())
    }

    pub(crate) fn clear(&self) {
        let mut inner = self.lock();
        inner.reservations.clear();
        inner.order.clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("reservation store lock not to be poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(max: usize) -> ReservationStore {
        ReservationStore::new(max, Duration::from_secs(7200))
    }

    #[test]
    fn reserve_then_get() {
        let store = store(15);
        let peer = PeerId::random();

        let outcome = store.reserve(peer, vec![], Limit::default());
        let ReserveOutcome::Accepted { expire, renewed } = outcome else {
            panic!("expected admission, got {outcome:?}");
        };
        assert!(!renewed);
        assert!(expire >= unix_now() + 7199);

        let reservation = store.get(&peer).unwrap();
        assert_eq!(reservation.peer, peer);
        assert_eq!(reservation.expire, expire);
    }

    #[test]
    fn new_peer_is_refused_at_capacity() {
        let store = store(2);
        store.reserve(PeerId::random(), vec![], Limit::default());
        store.reserve(PeerId::random(), vec![], Limit::default());

        let outcome = store.reserve(PeerId::random(), vec![], Limit::default());
        assert_eq!(outcome, ReserveOutcome::Refused);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn refresh_bypasses_the_capacity_check() {
        let store = store(2);
        let first = PeerId::random();
        store.reserve(first, vec![], Limit::default());
        store.reserve(PeerId::random(), vec![], Limit::default());

        let outcome = store.reserve(first, vec![], Limit::default());
        assert!(matches!(
            outcome,
            ReserveOutcome::Accepted { renewed: true, .. }
        ));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn refresh_pushes_expire_forward_and_keeps_one_entry() {
        let store = store(15);
        let peer = PeerId::random();

        let ReserveOutcome::Accepted { expire: first, .. } =
            store.reserve(peer, vec![], Limit::default())
        else {
            panic!("admission expected");
        };
        let ReserveOutcome::Accepted {
            expire: second,
            renewed,
        } = store.reserve(peer, vec![], Limit::default())
        else {
            panic!("admission expected");
        };

        assert!(renewed);
        assert!(second >= first);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn refresh_keeps_insertion_position() {
        let store = store(15);
        let first = PeerId::random();
        let second = PeerId::random();

        store.reserve(first, vec![], Limit::default());
        store.reserve(second, vec![], Limit::default());
        store.reserve(first, vec![], Limit::default());

        assert_eq!(store.oldest(), Some(first));
    }

    #[test]
    fn remove_drops_the_entry() {
        let store = store(15);
        let peer = PeerId::random();
        store.reserve(peer, vec![], Limit::default());

        assert!(store.remove(&peer).is_some());
        assert!(store.get(&peer).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn lapsed_entries_are_invisible_and_swept() {
        let store = ReservationStore::new(15, Duration::ZERO);
        let peer = PeerId::random();
        store.reserve(peer, vec![], Limit::default());

        // expire == now, so the entry is already dead for lookups.
        assert!(store.get(&peer).is_none());

        let swept = store.remove_expired();
        assert_eq!(swept, vec![peer]);
        assert!(store.is_empty());
    }

    #[test]
    fn lapsed_entries_do_not_count_towards_the_cap() {
        let store = ReservationStore::new(1, Duration::ZERO);
        store.reserve(PeerId::random(), vec![], Limit::default());

        let outcome = store.reserve(PeerId::random(), vec![], Limit::default());
        assert!(matches!(outcome, ReserveOutcome::Accepted { .. }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_race_for_the_last_slot_admits_exactly_one() {
        use std::sync::{atomic::AtomicUsize, atomic::Ordering, Arc, Barrier};

        let store = Arc::new(store(1));
        let admitted = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                let admitted = Arc::clone(&admitted);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let peer = PeerId::random();
                    barrier.wait();
                    if matches!(
                        store.reserve(peer, vec![], Limit::default()),
                        ReserveOutcome::Accepted { .. }
                    ) {
                        admitted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(admitted.load(Ordering::SeqCst), 1);
        assert_eq!(store.len(), 1);
    }
}
