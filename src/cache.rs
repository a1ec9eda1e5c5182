// per-core L1 cache: hit/miss path, allocation and eviction, snoop responder

use std::cell::RefCell;
use std::rc::Weak;

use log::{debug, error, warn};

use crate::bus::{Bus, BusOp, BusResponse};
use crate::commons::{Addr, SystemSpec};
use crate::stats::Stats;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MesiState {
    Modified,
    Exclusive,
    Shared,
    Invalid,
}

#[derive(Clone, Copy)]
pub struct CacheLine {
    pub tag: u32,
    pub state: MesiState,
}

impl CacheLine {
    fn new() -> CacheLine {
        CacheLine {
            tag: 0,
            state: MesiState::Invalid,
        }
    }
    pub fn is_valid(&self) -> bool {
        self.state != MesiState::Invalid
    }
}

// cache sets

/// One associativity-wide group of lines with exact-LRU ranking.
/// Ranks are a permutation of 0..assoc; 0 is most recently used and the
/// victim is the line with the highest rank (ties broken by lowest index).
pub struct CacheSet {
    lines: Vec<CacheLine>,
    ranks: Vec<u32>,
}

impl CacheSet {
    fn new(assoc: usize) -> CacheSet {
        CacheSet {
            lines: vec![CacheLine::new(); assoc],
            ranks: (0..assoc as u32).collect(),
        }
    }

    /// first valid slot holding `tag`
    pub fn find(&self, tag: u32) -> Option<usize> {
        self.lines
            .iter()
            .position(|l| l.is_valid() && l.tag == tag)
    }

    pub fn find_invalid(&self) -> Option<usize> {
        self.lines.iter().position(|l| !l.is_valid())
    }

    /// slot with the maximum LRU rank
    pub fn victim(&self) -> usize {
        let mut slot = 0;
        for (i, &r) in self.ranks.iter().enumerate() {
            if r > self.ranks[slot] {
                slot = i;
            }
        }
        slot
    }

    /// Claims a slot for `tag`: an invalid slot if one exists, the LRU
    /// victim otherwise. Only the tag is written; the caller is
    /// responsible for having evicted a valid victim and for setting
    /// the line state afterwards.
    pub fn allocate(&mut self, tag: u32) -> usize {
        let slot = self.find_invalid().unwrap_or_else(|| self.victim());
        self.lines[slot].tag = tag;
        self.touch(slot);
        slot
    }

    /// moves `slot` to rank 0, shifting only the ranks in between
    pub fn touch(&mut self, slot: usize) {
        let old = self.ranks[slot];
        for r in self.ranks.iter_mut() {
            if *r < old {
                *r += 1;
            }
        }
        self.ranks[slot] = 0;
    }

    pub fn line(&self, slot: usize) -> &CacheLine {
        &self.lines[slot]
    }

    pub fn line_mut(&mut self, slot: usize) -> &mut CacheLine {
        &mut self.lines[slot]
    }

    pub fn rank(&self, slot: usize) -> u32 {
        self.ranks[slot]
    }
}

// cache

/// what a cache reports back when snooping a bus transaction
pub struct SnoopReply {
    pub provided: bool,
    pub cycles: u64,
    pub writeback: bool,
}

impl SnoopReply {
    fn none() -> SnoopReply {
        SnoopReply {
            provided: false,
            cycles: 0,
            writeback: false,
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum PendingKind {
    ReadMiss,
    WriteMiss,
    WriteUpgrade,
}

#[derive(Clone, Copy, Debug)]
struct PendingRequest {
    addr: Addr,
    kind: PendingKind,
}

pub struct Cache {
    core_id: usize,
    specs: SystemSpec,
    sets: Vec<CacheSet>,
    bus: Weak<RefCell<Bus>>,
    stats: Stats,

    // a cache blocks while a deferred bus request is outstanding and for
    // the transfer window after the bus grants it
    blocked_cycles: u64,
    pending: Option<PendingRequest>,
}

impl Cache {
    pub fn new(core_id: usize, specs: SystemSpec, bus: Weak<RefCell<Bus>>) -> Cache {
        Cache {
            core_id,
            specs,
            sets: (0..specs.num_sets()).map(|_| CacheSet::new(specs.assoc)).collect(),
            bus,
            stats: Stats::default(),
            blocked_cycles: 0,
            pending: None,
        }
    }

    pub fn core_id(&self) -> usize {
        self.core_id
    }
    pub fn stats(&self) -> &Stats {
        &self.stats
    }
    pub fn reset_statistics(&mut self) {
        self.stats.reset();
    }

    pub fn is_blocking(&self) -> bool {
        self.blocked_cycles > 0 || self.pending.is_some()
    }

    pub fn is_counting_down(&self) -> bool {
        self.blocked_cycles > 0
    }

    /// per-cycle bookkeeping: run down the post-grant transfer window
    pub fn process_cycle(&mut self) {
        if self.blocked_cycles > 0 {
            self.blocked_cycles -= 1;
        }
    }

    /// deadlock safety net: drop any stuck state
    pub fn unblock(&mut self) {
        if self.pending.take().is_some() {
            warn!("core {}: dropping an unresolved bus request", self.core_id);
        }
        self.blocked_cycles = 0;
    }

    /// MESI state of the block containing `addr`, Invalid if absent
    pub fn line_state(&self, addr: Addr) -> MesiState {
        let (index, tag) = addr.pos(&self.specs);
        match self.sets[index].find(tag) {
            Some(slot) => self.sets[index].line(slot).state,
            None => MesiState::Invalid,
        }
    }

    // processor-facing operations

    /// Processor-issued read. Returns false while the cache is blocked;
    /// the processor retries the same reference next cycle. `cycles`
    /// reports the full cost of an accepted access.
    pub fn read(&mut self, addr: Addr, cycles: &mut u64) -> bool {
        if self.is_blocking() {
            return false;
        }
        self.stats.accesses += 1;
        self.stats.reads += 1;

        let (index, tag) = addr.pos(&self.specs);
        if let Some(slot) = self.sets[index].find(tag) {
            self.sets[index].touch(slot);
            *cycles = 1;
            return true;
        }

        self.stats.record_read_miss();
        let bus = self.bus.upgrade().expect("bus dropped");
        let resp = bus.borrow_mut().transact(BusOp::BusRd, addr, self.core_id);
        match resp {
            BusResponse::Accepted {
                data_provided,
                cycles: bus_cycles,
            } => {
                let filled = if data_provided {
                    MesiState::Shared
                } else {
                    MesiState::Exclusive
                };
                let evict_cycles = self.fill(addr, filled);
                *cycles = 1 + bus_cycles + evict_cycles;
            }
            BusResponse::NotAccepted => {
                self.pending = Some(PendingRequest {
                    addr,
                    kind: PendingKind::ReadMiss,
                });
                *cycles = 1;
            }
        }
        true
    }

    /// Processor-issued write. Same acceptance contract as `read`.
    pub fn write(&mut self, addr: Addr, cycles: &mut u64) -> bool {
        if self.is_blocking() {
            return false;
        }
        self.stats.accesses += 1;
        self.stats.writes += 1;

        let (index, tag) = addr.pos(&self.specs);
        if let Some(slot) = self.sets[index].find(tag) {
            self.sets[index].touch(slot);
            *cycles = 1;
            let state = self.sets[index].line(slot).state;
            match state {
                MesiState::Modified => {}
                MesiState::Exclusive => {
                    // silent upgrade, nobody else can hold the line
                    self.sets[index].line_mut(slot).state = MesiState::Modified;
                }
                MesiState::Shared => {
                    let bus = self.bus.upgrade().expect("bus dropped");
                    let resp = bus.borrow_mut().transact(BusOp::BusUpgr, addr, self.core_id);
                    match resp {
                        BusResponse::Accepted {
                            cycles: bus_cycles, ..
                        } => {
                            self.sets[index].line_mut(slot).state = MesiState::Modified;
                            *cycles = 1 + bus_cycles;
                        }
                        BusResponse::NotAccepted => {
                            self.pending = Some(PendingRequest {
                                addr,
                                kind: PendingKind::WriteUpgrade,
                            });
                        }
                    }
                }
                MesiState::Invalid => unreachable!("find() only returns valid lines"),
            }
            return true;
        }

        self.stats.record_write_miss();
        let bus = self.bus.upgrade().expect("bus dropped");
        let resp = bus.borrow_mut().transact(BusOp::BusRdX, addr, self.core_id);
        match resp {
            BusResponse::Accepted {
                cycles: bus_cycles, ..
            } => {
                // write-allocate: the line lands Modified no matter who supplied it
                let evict_cycles = self.fill(addr, MesiState::Modified);
                *cycles = 1 + bus_cycles + evict_cycles;
            }
            BusResponse::NotAccepted => {
                self.pending = Some(PendingRequest {
                    addr,
                    kind: PendingKind::WriteMiss,
                });
                *cycles = 1;
            }
        }
        true
    }

    /// The bus finished a transaction this cache had queued while the
    /// bus was busy. Completes the fill and starts the transfer window.
    pub fn complete_transaction(&mut self, data_provided: bool, cycles: u64) {
        let Some(pending) = self.pending.take() else {
            warn!("core {}: bus completion with nothing pending", self.core_id);
            return;
        };
        let mut evict_cycles = 0;
        match pending.kind {
            PendingKind::ReadMiss => {
                let filled = if data_provided {
                    MesiState::Shared
                } else {
                    MesiState::Exclusive
                };
                evict_cycles = self.fill(pending.addr, filled);
            }
            PendingKind::WriteMiss => {
                evict_cycles = self.fill(pending.addr, MesiState::Modified);
            }
            PendingKind::WriteUpgrade => {
                let (index, tag) = pending.addr.pos(&self.specs);
                match self.sets[index].find(tag) {
                    Some(slot) => self.sets[index].line_mut(slot).state = MesiState::Modified,
                    None => {
                        // the shared copy was invalidated while the upgrade sat in
                        // the queue; the broadcast has cleared every other copy, so
                        // refetching straight into Modified is coherent
                        evict_cycles = self.fill(pending.addr, MesiState::Modified);
                    }
                }
            }
        }
        self.blocked_cycles = cycles + evict_cycles;
    }

    // bus-facing operations

    /// Snoops a transaction issued by another cache. State transitions,
    /// data supply and timing follow the MESI table; the bus sums the
    /// reported cycles into the transaction cost.
    pub fn snoop(&mut self, op: BusOp, addr: Addr) -> SnoopReply {
        let (index, tag) = addr.pos(&self.specs);
        let Some(slot) = self.sets[index].find(tag) else {
            return SnoopReply::none();
        };
        let state = self.sets[index].line(slot).state;
        let block = self.specs.block_size() as u64;
        let mut reply = SnoopReply::none();
        match (op, state) {
            (BusOp::BusRd, MesiState::Modified) => {
                // dirty supply: hand the block over and write it back
                reply.provided = true;
                reply.cycles = self.specs.t_flush() + self.specs.t_cache_to_cache_transfer();
                reply.writeback = true;
                self.stats.writebacks += 1;
                self.stats.bus_traffic += block;
                self.sets[index].line_mut(slot).state = MesiState::Shared;
            }
            (BusOp::BusRd, MesiState::Exclusive) | (BusOp::BusRd, MesiState::Shared) => {
                reply.provided = true;
                reply.cycles = self.specs.t_cache_to_cache_transfer();
                self.stats.bus_traffic += block;
                self.sets[index].line_mut(slot).state = MesiState::Shared;
            }
            (BusOp::BusRdX, MesiState::Modified) => {
                reply.provided = true;
                reply.cycles = self.specs.t_dirty_handoff();
                reply.writeback = true;
                self.stats.writebacks += 1;
                self.stats.bus_traffic += block;
                self.stats.invalidations += 1;
                self.sets[index].line_mut(slot).state = MesiState::Invalid;
            }
            (BusOp::BusRdX, MesiState::Exclusive) | (BusOp::BusRdX, MesiState::Shared) => {
                reply.provided = true;
                reply.cycles = self.specs.t_mem_fetch();
                self.stats.bus_traffic += block;
                self.stats.invalidations += 1;
                self.sets[index].line_mut(slot).state = MesiState::Invalid;
            }
            (BusOp::BusUpgr, MesiState::Shared) => {
                self.stats.invalidations += 1;
                self.sets[index].line_mut(slot).state = MesiState::Invalid;
            }
            (BusOp::BusUpgr, MesiState::Modified) | (BusOp::BusUpgr, MesiState::Exclusive) => {
                // an upgrade can only race a line every other cache already
                // dropped; holding it M/E here means the issuer went around us
                debug_assert!(false, "BusUpgr snooped while holding the line {:?}", state);
                error!(
                    "core {}: BusUpgr for {:?} snooped in state {:?}",
                    self.core_id, addr, state
                );
            }
            (_, MesiState::Invalid) => unreachable!("find() only returns valid lines"),
        }
        reply
    }

    /// Another cache dropped its shared copy and this one is the only
    /// holder left: the line is private again.
    pub fn promote_to_exclusive(&mut self, addr: Addr) {
        let (index, tag) = addr.pos(&self.specs);
        if let Some(slot) = self.sets[index].find(tag) {
            let line = self.sets[index].line_mut(slot);
            if line.state == MesiState::Shared {
                line.state = MesiState::Exclusive;
            } else {
                warn!(
                    "core {}: exclusivity promotion of {:?} in state {:?}",
                    self.core_id, addr, line.state
                );
            }
        }
    }

    // allocation and eviction

    /// Brings the block for `addr` into the cache in `state`, evicting
    /// the LRU victim if the set is full. Returns extra cycles charged
    /// by the eviction.
    fn fill(&mut self, addr: Addr, state: MesiState) -> u64 {
        let (index, tag) = addr.pos(&self.specs);
        let mut evict_cycles = 0;
        if self.sets[index].find_invalid().is_none() {
            let victim = self.sets[index].victim();
            evict_cycles = self.evict(index, victim);
        }
        let slot = self.sets[index].allocate(tag);
        self.sets[index].line_mut(slot).state = state;
        debug!(
            "core {}: filled {:?} as {:?} (set {}, slot {})",
            self.core_id, addr, state, index, slot
        );
        evict_cycles
    }

    fn evict(&mut self, index: usize, slot: usize) -> u64 {
        let (tag, state) = {
            let line = self.sets[index].line(slot);
            (line.tag, line.state)
        };
        let victim_addr = Addr::from_parts(tag, index, &self.specs);
        let mut cycles = 0;
        match state {
            MesiState::Modified => {
                // dirty victim goes back to memory
                cycles += self.specs.t_flush();
                self.stats.writebacks += 1;
                let bus = self.bus.upgrade().expect("bus dropped");
                bus.borrow_mut().note_flush();
            }
            MesiState::Shared => {
                // dropping a shared copy may leave a single holder behind
                let bus = self.bus.upgrade().expect("bus dropped");
                let sole = bus.borrow().sole_remaining_sharer(victim_addr, self.core_id);
                if let Some(other) = sole {
                    bus.borrow().promote_to_exclusive(victim_addr, other);
                }
            }
            MesiState::Exclusive => {}
            MesiState::Invalid => unreachable!("only valid victims are evicted"),
        }
        self.stats.evictions += 1;
        self.sets[index].line_mut(slot).state = MesiState::Invalid;
        debug!("core {}: evicted {:?} ({:?})", self.core_id, victim_addr, state);
        cycles
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_permutation(set: &CacheSet, assoc: usize) -> bool {
        let mut seen = vec![false; assoc];
        for slot in 0..assoc {
            let r = set.rank(slot) as usize;
            if r >= assoc || seen[r] {
                return false;
            }
            seen[r] = true;
        }
        true
    }

    #[test]
    fn ranks_stay_a_permutation() {
        let mut set = CacheSet::new(4);
        assert!(is_permutation(&set, 4));
        for &slot in &[2, 0, 3, 0, 1, 3] {
            set.touch(slot);
            assert!(is_permutation(&set, 4));
            assert_eq!(set.rank(slot), 0);
        }
    }

    #[test]
    fn victim_is_least_recently_used() {
        let mut set = CacheSet::new(2);
        set.allocate(10);
        set.allocate(20);
        // slot 0 (tag 10) is older now
        assert_eq!(set.victim(), 0);
        set.touch(0);
        assert_eq!(set.victim(), 1);
    }

    #[test]
    fn victim_ties_break_to_lowest_index() {
        let set = CacheSet::new(1);
        assert_eq!(set.victim(), 0);
    }

    #[test]
    fn find_ignores_invalid_lines() {
        let mut set = CacheSet::new(2);
        let slot = set.allocate(7);
        assert_eq!(set.find(7), None); // allocate leaves the state untouched
        set.line_mut(slot).state = MesiState::Exclusive;
        assert_eq!(set.find(7), Some(slot));
    }

    #[test]
    fn allocate_prefers_invalid_slots() {
        let mut set = CacheSet::new(2);
        let a = set.allocate(1);
        set.line_mut(a).state = MesiState::Exclusive;
        let b = set.allocate(2);
        assert_ne!(a, b);
        set.line_mut(b).state = MesiState::Shared;
        // both valid now; the LRU victim (slot a) is reclaimed
        assert_eq!(set.allocate(3), a);
    }

    #[test]
    fn direct_mapped_always_picks_slot_zero() {
        let mut set = CacheSet::new(1);
        let a = set.allocate(1);
        set.line_mut(a).state = MesiState::Modified;
        assert_eq!(set.victim(), 0);
        assert_eq!(a, 0);
    }
}
