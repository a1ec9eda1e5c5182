// global clock: advances the bus, then every core, in lockstep

use std::cell::RefCell;
use std::rc::Rc;

use log::{info, warn};

use crate::bus::Bus;
use crate::cache::Cache;
use crate::commons::SystemSpec;
use crate::processor::Processor;
use crate::stats::Stats;
use crate::trace::TraceReader;

/// safety cap; hitting it ends the run instead of spinning forever
pub const MAX_CYCLES: u64 = i32::MAX as u64;

pub struct Simulator {
    specs: SystemSpec,
    trace_prefix: String,
    processors: Vec<Rc<RefCell<Processor>>>,
    caches: Vec<Rc<RefCell<Cache>>>,
    bus: Rc<RefCell<Bus>>,
    current_cycle: u64,
    complete: bool,
    global_stats: Stats,
}

impl Simulator {
    /// Wires up N cores, their caches and the shared bus. Core `i` reads
    /// `<prefix>_proc<i>.trace`; a missing file leaves that core idle.
    pub fn new(specs: SystemSpec, trace_prefix: &str) -> Simulator {
        let bus = Rc::new(RefCell::new(Bus::new(specs)));
        let mut caches = Vec::with_capacity(specs.num_cores);
        let mut processors = Vec::with_capacity(specs.num_cores);
        for i in 0..specs.num_cores {
            let cache = Rc::new(RefCell::new(Cache::new(i, specs, Rc::downgrade(&bus))));
            bus.borrow_mut().register(&cache, i);
            let path = format!("{}_proc{}.trace", trace_prefix, i);
            let proc = Processor::new(i, TraceReader::open(&path), cache.clone());
            caches.push(cache);
            processors.push(Rc::new(RefCell::new(proc)));
        }
        bus.borrow_mut().connect();
        Simulator {
            specs,
            trace_prefix: trace_prefix.to_string(),
            processors,
            caches,
            bus,
            current_cycle: 0,
            complete: false,
            global_stats: Stats::default(),
        }
    }

    pub fn specs(&self) -> &SystemSpec {
        &self.specs
    }
    pub fn trace_prefix(&self) -> &str {
        &self.trace_prefix
    }
    pub fn processors(&self) -> &[Rc<RefCell<Processor>>] {
        &self.processors
    }
    pub fn caches(&self) -> &[Rc<RefCell<Cache>>] {
        &self.caches
    }
    pub fn bus(&self) -> &Rc<RefCell<Bus>> {
        &self.bus
    }
    pub fn current_cycle(&self) -> u64 {
        self.current_cycle
    }
    pub fn is_complete(&self) -> bool {
        self.complete
    }
    pub fn global_stats(&self) -> &Stats {
        &self.global_stats
    }

    /// runs until every trace is drained or the cycle cap is hit
    pub fn run(&mut self) {
        info!(
            "starting simulation: {} cores, {} sets, assoc {}, {}-byte blocks",
            self.specs.num_cores,
            self.specs.num_sets(),
            self.specs.assoc,
            self.specs.block_size()
        );
        while !self.complete && self.current_cycle < MAX_CYCLES {
            self.tick();
        }
        if !self.complete {
            warn!("simulation timed out after {} cycles", self.current_cycle);
            self.log_status();
        }
        self.collect_statistics();
        info!("simulation finished in {} cycles", self.current_cycle);
    }

    /// advances at most `n` cycles; stops early on completion
    pub fn run_cycles(&mut self, n: u64) {
        for _ in 0..n {
            if self.complete {
                break;
            }
            self.tick();
        }
    }

    fn tick(&mut self) {
        // bus first: its side effects must be visible before any core issues
        let completion = self.bus.borrow_mut().tick();
        for cache in &self.caches {
            cache.borrow_mut().process_cycle();
        }
        if let Some(grant) = completion {
            self.caches[grant.source]
                .borrow_mut()
                .complete_transaction(grant.data_provided, grant.cycles);
        }

        for proc in &self.processors {
            let done = proc.borrow().is_trace_complete();
            if !done {
                proc.borrow_mut().execute_cycle();
            }
        }

        self.check_deadlock();
        self.current_cycle += 1;
        self.complete = self
            .processors
            .iter()
            .all(|p| p.borrow().is_trace_complete());
    }

    /// Every live core stuck, the bus idle and its queue drained: nothing
    /// can make progress. Should be unreachable for well-formed traces;
    /// recovered by force-unblocking so the run still terminates.
    fn check_deadlock(&mut self) {
        let mut any_active = false;
        for proc in &self.processors {
            let proc = proc.borrow();
            if !proc.is_trace_complete() {
                if !proc.is_blocked() {
                    return;
                }
                any_active = true;
            }
        }
        if !any_active {
            return;
        }
        {
            let bus = self.bus.borrow();
            if bus.is_busy() || bus.has_pending() {
                return;
            }
        }
        // a running transfer window still counts as progress
        if self
            .caches
            .iter()
            .any(|c| c.borrow().is_counting_down())
        {
            return;
        }
        warn!(
            "deadlock detected at cycle {}: force-unblocking all cores",
            self.current_cycle
        );
        for cache in &self.caches {
            cache.borrow_mut().unblock();
        }
        self.bus.borrow_mut().reset();
    }

    fn collect_statistics(&mut self) {
        self.global_stats.reset();
        for proc in &self.processors {
            let proc = proc.borrow();
            self.global_stats.total_instructions += proc.total_instructions();
            self.global_stats.read_instructions += proc.read_instructions();
            self.global_stats.write_instructions += proc.write_instructions();
        }
        for cache in &self.caches {
            let mut cache_stats = cache.borrow().stats().clone();
            // the supplying cache and the bus both observe the same block
            // crossing the wire; the aggregate counts it once, bus-side
            cache_stats.bus_traffic = 0;
            self.global_stats.absorb(&cache_stats);
        }
        self.global_stats.absorb(self.bus.borrow().stats());
    }

    /// slowest core's wall time, execution plus stalls
    pub fn max_execution_time(&self) -> u64 {
        self.processors
            .iter()
            .map(|p| {
                let p = p.borrow();
                p.total_cycles() + p.idle_cycles()
            })
            .max()
            .unwrap_or(0)
    }

    pub fn reset_statistics(&mut self) {
        self.global_stats.reset();
        for proc in &self.processors {
            proc.borrow_mut().reset_statistics();
        }
        for cache in &self.caches {
            cache.borrow_mut().reset_statistics();
        }
        self.bus.borrow_mut().reset_statistics();
    }

    fn log_status(&self) {
        for proc in &self.processors {
            let proc = proc.borrow();
            warn!(
                "core {}: complete={} blocked={} instructions={}",
                proc.core_id(),
                proc.is_trace_complete(),
                proc.is_blocked(),
                proc.total_instructions()
            );
        }
        let bus = self.bus.borrow();
        warn!(
            "bus: busy={} pending={}",
            bus.is_busy(),
            bus.has_pending()
        );
    }
}
