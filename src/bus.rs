// central snooping bus: serializes transactions, fans snoops out to
// every other cache, and accounts the latency of each transfer

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use log::debug;

use crate::cache::Cache;
use crate::commons::{Addr, SystemSpec};
use crate::stats::Stats;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BusOp {
    BusRd,   // read miss
    BusRdX,  // write miss
    BusUpgr, // write to a shared line
}

pub enum BusResponse {
    Accepted { data_provided: bool, cycles: u64 },
    NotAccepted,
}

/// handed back to the simulator when a queued transaction gets processed,
/// so the issuing cache can complete its fill
pub struct BusCompletion {
    pub source: usize,
    pub data_provided: bool,
    pub cycles: u64,
}

struct PendingTransaction {
    op: BusOp,
    addr: Addr,
    source: usize,
}

pub struct Bus {
    specs: SystemSpec,
    caches: Vec<Weak<RefCell<Cache>>>,
    stats: Stats,
    // remaining cycles of the transaction currently occupying the bus;
    // the bus is busy exactly while this is non-zero
    timer: u64,
    pending: VecDeque<PendingTransaction>,
}

impl Bus {
    pub fn new(specs: SystemSpec) -> Bus {
        Bus {
            specs,
            caches: Vec::new(),
            stats: Stats::default(),
            timer: 0,
            pending: VecDeque::new(),
        }
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }
    pub fn reset_statistics(&mut self) {
        self.stats.reset();
    }

    pub fn is_busy(&self) -> bool {
        self.timer > 0
    }
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// places the cache in its dense slot, keyed by core id
    pub fn register(&mut self, cache: &Rc<RefCell<Cache>>, core_id: usize) {
        if core_id >= self.caches.len() {
            self.caches.resize_with(core_id + 1, Weak::new);
        }
        self.caches[core_id] = Rc::downgrade(cache);
    }

    /// called once after every cache is registered
    pub fn connect(&self) {
        let registered = self.caches.iter().filter(|c| c.upgrade().is_some()).count();
        debug_assert_eq!(registered, self.caches.len(), "sparse cache registration");
        debug!("bus connected to {} caches", registered);
    }

    /// Runs a transaction, or queues it when the bus is occupied. Snoop
    /// fan-out for an accepted transaction is atomic: no other
    /// transaction interleaves with it.
    pub fn transact(&mut self, op: BusOp, addr: Addr, source: usize) -> BusResponse {
        if self.timer > 0 || !self.pending.is_empty() {
            debug!("bus busy, queueing {:?} for {:?} from core {}", op, addr, source);
            self.pending.push_back(PendingTransaction { op, addr, source });
            return BusResponse::NotAccepted;
        }
        let (data_provided, cycles) = self.run_transaction(op, addr, source);
        self.timer = cycles;
        BusResponse::Accepted {
            data_provided,
            cycles,
        }
    }

    /// Advances the bus one cycle. When the current transaction's window
    /// ends, the next queued transaction runs and its completion is
    /// returned for the simulator to route to the issuing cache.
    pub fn tick(&mut self) -> Option<BusCompletion> {
        if self.timer > 0 {
            self.timer -= 1;
            if self.timer > 0 {
                return None;
            }
        }
        let tx = self.pending.pop_front()?;
        let (data_provided, cycles) = self.run_transaction(tx.op, tx.addr, tx.source);
        self.timer = cycles;
        Some(BusCompletion {
            source: tx.source,
            data_provided,
            cycles,
        })
    }

    fn run_transaction(&mut self, op: BusOp, addr: Addr, source: usize) -> (bool, u64) {
        let mut data_provided = false;
        let mut snoop_cycles = 0;
        for (id, slot) in self.caches.iter().enumerate() {
            if id == source {
                continue;
            }
            let Some(cache) = slot.upgrade() else { continue };
            let reply = cache.borrow_mut().snoop(op, addr);
            if reply.writeback {
                self.stats.bus_flushes += 1;
            }
            if reply.provided {
                data_provided = true;
            }
            snoop_cycles += reply.cycles;
        }
        let cycles = if data_provided {
            snoop_cycles
        } else {
            // nobody answered: the block (or the invalidation acknowledge)
            // comes from memory
            self.specs.t_mem_fetch()
        };
        match op {
            BusOp::BusRd => self.stats.bus_reads += 1,
            BusOp::BusRdX => self.stats.bus_readxs += 1,
            BusOp::BusUpgr => self.stats.bus_upgrades += 1,
        }
        if data_provided {
            self.stats.bus_traffic += self.specs.block_size() as u64;
        }
        debug!(
            "bus: {:?} {:?} from core {} took {} cycles (c2c: {})",
            op, addr, source, cycles, data_provided
        );
        (data_provided, cycles)
    }

    /// dirty-eviction writeback, visible only as a transaction count
    pub fn note_flush(&mut self) {
        self.stats.bus_flushes += 1;
    }

    /// Some other core than `except` is the only remaining SHARED holder
    /// of `addr`, if exactly one such copy exists.
    pub fn sole_remaining_sharer(&self, addr: Addr, except: usize) -> Option<usize> {
        let mut found = None;
        for (id, slot) in self.caches.iter().enumerate() {
            if id == except {
                continue;
            }
            let Some(cache) = slot.upgrade() else { continue };
            if cache.borrow().line_state(addr) == crate::cache::MesiState::Shared {
                if found.is_some() {
                    return None;
                }
                found = Some(id);
            }
        }
        found
    }

    pub fn promote_to_exclusive(&self, addr: Addr, core_id: usize) {
        if let Some(cache) = self.caches.get(core_id).and_then(|c| c.upgrade()) {
            cache.borrow_mut().promote_to_exclusive(addr);
        }
    }

    /// deadlock safety net: clears the busy window and the queue
    pub fn reset(&mut self) {
        self.timer = 0;
        self.pending.clear();
    }
}
