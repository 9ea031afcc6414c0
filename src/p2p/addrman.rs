use parking_lot::RwLock;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Maximum number of addresses to store
const MAX_ADDRESSES: usize = 20000;

/// Attempts after which an address is set aside for `GIVE_UP_COOLDOWN`
const MAX_ATTEMPTS: u32 = 10;

/// How long an address that keeps failing is left alone
const GIVE_UP_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Minimum spacing between two tries of the same address
const RETRY_SPACING: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
struct AddressInfo {
    last_success: Option<Instant>,
    last_try: Option<Instant>,
    attempts: u32,
    /// Configured by the operator: never set aside, never evicted.
    pinned: bool,
}

impl AddressInfo {
    fn new() -> Self {
        Self {
            last_success: None,
            last_try: None,
            attempts: 0,
            pinned: false,
        }
    }

    fn is_terrible(&self, now: Instant) -> bool {
        if self.pinned {
            return false;
        }
        let Some(last_try) = self.last_try else {
            return false;
        };
        let since = now.duration_since(last_try);
        since < RETRY_SPACING || (self.attempts > MAX_ATTEMPTS && since < GIVE_UP_COOLDOWN)
    }

    /// Selection weight in (0, 1].
    fn chance(&self, now: Instant) -> f64 {
        let mut chance = 1.0 / (1 + self.attempts) as f64;
        if let Some(last_success) = self.last_success {
            if now.duration_since(last_success) < Duration::from_secs(1200) {
                chance *= 2.0;
            }
        }
        chance.clamp(f64::MIN_POSITIVE, 1.0)
    }
}

#[derive(Default)]
struct Tables {
    new_addrs: HashMap<SocketAddr, AddressInfo>,
    tried_addrs: HashMap<SocketAddr, AddressInfo>,
    in_use: HashSet<SocketAddr>,
}

impl Tables {
    /// Drop one address that keeps failing to make room. New addresses go
    /// first. Returns false when nothing qualifies.
    fn evict_terrible(&mut self) -> bool {
        let in_use = &self.in_use;
        for map in [&mut self.new_addrs, &mut self.tried_addrs] {
            let victim = map
                .iter()
                .find(|(addr, info)| {
                    !info.pinned && info.attempts > MAX_ATTEMPTS && !in_use.contains(*addr)
                })
                .map(|(addr, _)| *addr);
            if let Some(victim) = victim {
                map.remove(&victim);
                return true;
            }
        }
        false
    }
}

/// Candidate peer addresses, split into never-connected and known-good.
///
/// Addresses currently connected are checked out and never handed out twice.
#[derive(Default)]
pub struct AddressBook {
    tables: RwLock<Tables>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a new address. Returns false if it was already known, or if the
    /// book is full of addresses still worth keeping.
    pub fn add(&self, addr: SocketAddr) -> bool {
        let mut t = self.tables.write();
        if t.tried_addrs.contains_key(&addr) || t.new_addrs.contains_key(&addr) {
            return false;
        }
        if t.new_addrs.len() + t.tried_addrs.len() >= MAX_ADDRESSES && !t.evict_terrible() {
            return false;
        }
        t.new_addrs.insert(addr, AddressInfo::new());
        true
    }

    /// Add an operator-supplied address. It stays selectable however often
    /// it fails; the caller's retry policy paces the attempts.
    pub fn add_pinned(&self, addr: SocketAddr) {
        let mut t = self.tables.write();
        let t = &mut *t;
        match t.new_addrs.get_mut(&addr) {
            Some(info) => info.pinned = true,
            None => match t.tried_addrs.get_mut(&addr) {
                Some(info) => info.pinned = true,
                None => {
                    let mut info = AddressInfo::new();
                    info.pinned = true;
                    t.new_addrs.insert(addr, info);
                }
            },
        }
    }

    /// Pick an address not currently in use and check it out.
    pub fn checkout(&self) -> Option<SocketAddr> {
        let now = Instant::now();
        let mut t = self.tables.write();

        let use_tried = rand::thread_rng().gen_bool(0.5);
        let picked = if use_tried {
            select_from(&t.tried_addrs, &t.in_use, now).or_else(|| select_from(&t.new_addrs, &t.in_use, now))
        } else {
            select_from(&t.new_addrs, &t.in_use, now).or_else(|| select_from(&t.tried_addrs, &t.in_use, now))
        }?;

        let t = &mut *t;
        t.in_use.insert(picked);
        let info = match t.new_addrs.get_mut(&picked) {
            Some(info) => Some(info),
            None => t.tried_addrs.get_mut(&picked),
        };
        if let Some(info) = info {
            info.last_try = Some(now);
            info.attempts += 1;
        }
        Some(picked)
    }

    /// Mark a checked-out address as successfully connected.
    pub fn good(&self, addr: &SocketAddr) {
        let mut t = self.tables.write();
        let info = t.new_addrs.remove(addr).or_else(|| t.tried_addrs.remove(addr));
        let mut info = info.unwrap_or_else(AddressInfo::new);
        info.last_success = Some(Instant::now());
        info.attempts = 0;
        t.tried_addrs.insert(*addr, info);
    }

    /// Return a checked-out address to the pool.
    pub fn release(&self, addr: &SocketAddr) {
        self.tables.write().in_use.remove(addr);
    }

    pub fn len(&self) -> usize {
        let t = self.tables.read();
        t.new_addrs.len() + t.tried_addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_use(&self) -> usize {
        self.tables.read().in_use.len()
    }
}

fn select_from(
    map: &HashMap<SocketAddr, AddressInfo>,
    in_use: &HashSet<SocketAddr>,
    now: Instant,
) -> Option<SocketAddr> {
    let candidates: Vec<_> = map
        .iter()
        .filter(|(addr, info)| !in_use.contains(addr) && !info.is_terrible(now))
        .collect();
    if candidates.is_empty() {
        return None;
    }

    // Weighted random selection based on chance
    let total: f64 = candidates.iter().map(|(_, info)| info.chance(now)).sum();
    let mut threshold = rand::thread_rng().gen::<f64>() * total;
    for (addr, info) in &candidates {
        threshold -= info.chance(now);
        if threshold <= 0.0 {
            return Some(**addr);
        }
    }
    candidates.first().map(|(addr, _)| **addr)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_address() {
        let book = AddressBook::new();
        let addr = "1.2.3.4:8333".parse().unwrap();

        assert!(book.add(addr));
        assert!(!book.add(addr));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_checkout_is_exclusive() {
        let book = AddressBook::new();
        let addr = "1.2.3.4:8333".parse().unwrap();
        book.add(addr);

        assert_eq!(book.checkout(), Some(addr));
        assert_eq!(book.checkout(), None);
        assert_eq!(book.in_use(), 1);
    }

    #[test]
    fn test_failed_address_waits_before_retry() {
        let book = AddressBook::new();
        let addr = "1.2.3.4:8333".parse().unwrap();
        book.add(addr);

        let picked = book.checkout().unwrap();
        book.release(&picked);
        assert_eq!(book.checkout(), None);
    }

    #[test]
    fn test_good_moves_to_tried() {
        let book = AddressBook::new();
        let addr = "1.2.3.4:8333".parse().unwrap();
        book.add(addr);

        let picked = book.checkout().unwrap();
        book.good(&picked);
        assert_eq!(book.len(), 1);
        assert!(!book.add(addr));
    }

    #[test]
    fn test_select_spreads_over_addresses() {
        let book = AddressBook::new();
        for i in 0..10 {
            book.add(format!("1.2.3.{}:8333", i).parse().unwrap());
        }
        let picked: HashSet<_> = (0..10).filter_map(|_| book.checkout()).collect();
        assert_eq!(picked.len(), 10);
    }

    fn set_failures(book: &AddressBook, addr: &SocketAddr, attempts: u32, last_try: Option<Instant>) {
        let mut t = book.tables.write();
        let info = t.new_addrs.get_mut(addr).unwrap();
        info.attempts = attempts;
        info.last_try = last_try;
    }

    #[test]
    fn test_failing_address_returns_after_cooldown() {
        let book = AddressBook::new();
        let addr: SocketAddr = "1.2.3.4:8333".parse().unwrap();
        book.add(addr);

        let now = Instant::now();
        set_failures(&book, &addr, MAX_ATTEMPTS + 1, Some(now));
        assert_eq!(book.checkout(), None);

        let Some(long_ago) = now.checked_sub(GIVE_UP_COOLDOWN + Duration::from_secs(1)) else {
            // monotonic clock too close to its origin to backdate
            return;
        };
        set_failures(&book, &addr, MAX_ATTEMPTS + 1, Some(long_ago));
        assert_eq!(book.checkout(), Some(addr));
    }

    #[test]
    fn test_failing_address_never_tried_is_selectable() {
        let book = AddressBook::new();
        let addr: SocketAddr = "1.2.3.4:8333".parse().unwrap();
        book.add(addr);
        set_failures(&book, &addr, MAX_ATTEMPTS + 1, None);

        assert_eq!(book.checkout(), Some(addr));
    }

    #[test]
    fn test_pinned_address_is_never_set_aside() {
        let book = AddressBook::new();
        let addr: SocketAddr = "10.0.0.1:18444".parse().unwrap();
        book.add_pinned(addr);

        for _ in 0..(MAX_ATTEMPTS * 3) {
            let picked = book.checkout().unwrap();
            book.release(&picked);
        }
        assert_eq!(book.checkout(), Some(addr));
        assert_eq!(book.len(), 1);
    }

    #[test]
    fn test_full_book_evicts_failing_address() {
        let book = AddressBook::new();
        {
            let mut t = book.tables.write();
            for i in 0..MAX_ADDRESSES {
                let addr = SocketAddr::from(([10, (i >> 16) as u8, (i >> 8) as u8, i as u8], 8333));
                let mut info = AddressInfo::new();
                if i == 0 {
                    info.attempts = MAX_ATTEMPTS + 1;
                }
                t.new_addrs.insert(addr, info);
            }
        }
        let dead = SocketAddr::from(([10, 0, 0, 0], 8333));

        let fresh: SocketAddr = "1.2.3.4:8333".parse().unwrap();
        assert!(book.add(fresh));
        assert_eq!(book.len(), MAX_ADDRESSES);
        assert!(!book.tables.read().new_addrs.contains_key(&dead));

        // nothing left to evict
        assert!(!book.add("5.6.7.8:8333".parse().unwrap()));
    }
}
