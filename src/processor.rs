// core-trace driver: issues one reference per cycle against its cache
// and idles while the cache resolves a miss

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

use crate::cache::Cache;
use crate::commons::{MemOp, MemRef};
use crate::trace::TraceReader;

// references buffered ahead of the issue point
const LOOKAHEAD: usize = 5;

pub struct Processor {
    core_id: usize,
    cache: Rc<RefCell<Cache>>,
    reader: TraceReader,
    pending: VecDeque<MemRef>,

    total_instructions: u64,
    read_instructions: u64,
    write_instructions: u64,
    total_cycles: u64,
    idle_cycles: u64,

    blocked: bool,
    trace_complete: bool,
}

impl Processor {
    pub fn new(core_id: usize, reader: TraceReader, cache: Rc<RefCell<Cache>>) -> Processor {
        let mut proc = Processor {
            core_id,
            cache,
            reader,
            pending: VecDeque::new(),
            total_instructions: 0,
            read_instructions: 0,
            write_instructions: 0,
            total_cycles: 0,
            idle_cycles: 0,
            blocked: false,
            trace_complete: false,
        };
        proc.refill();
        proc
    }

    pub fn core_id(&self) -> usize {
        self.core_id
    }
    pub fn total_instructions(&self) -> u64 {
        self.total_instructions
    }
    pub fn read_instructions(&self) -> u64 {
        self.read_instructions
    }
    pub fn write_instructions(&self) -> u64 {
        self.write_instructions
    }
    pub fn total_cycles(&self) -> u64 {
        self.total_cycles
    }
    pub fn idle_cycles(&self) -> u64 {
        self.idle_cycles
    }
    pub fn is_blocked(&self) -> bool {
        self.blocked
    }
    pub fn is_trace_complete(&self) -> bool {
        self.trace_complete
    }

    pub fn reset_statistics(&mut self) {
        self.total_instructions = 0;
        self.read_instructions = 0;
        self.write_instructions = 0;
        self.total_cycles = 0;
        self.idle_cycles = 0;
        self.blocked = false;
    }

    fn refill(&mut self) {
        while self.pending.len() < LOOKAHEAD {
            match self.reader.next_ref() {
                Some(r) => self.pending.push_back(r),
                None => break,
            }
        }
    }

    /// one cycle of execution
    pub fn execute_cycle(&mut self) {
        self.total_cycles += 1;

        if self.blocked {
            let still_blocking = self.cache.borrow().is_blocking();
            if still_blocking {
                self.idle_cycles += 1;
                return;
            }
            self.blocked = false;
        }

        if self.pending.is_empty() {
            self.refill();
        }
        let Some(mem_ref) = self.pending.front().copied() else {
            // nothing ran this cycle
            self.trace_complete = true;
            self.total_cycles -= 1;
            return;
        };

        let mut cycles = 0u64;
        let accepted = match mem_ref.op {
            MemOp::Read => self.cache.borrow_mut().read(mem_ref.addr, &mut cycles),
            MemOp::Write => self.cache.borrow_mut().write(mem_ref.addr, &mut cycles),
        };
        if !accepted {
            // cache is mid-miss; retry the same reference next cycle
            return;
        }

        self.pending.pop_front();
        self.total_instructions += 1;
        match mem_ref.op {
            MemOp::Read => self.read_instructions += 1,
            MemOp::Write => self.write_instructions += 1,
        }

        if cycles > 1 {
            // the stall length is known up front
            self.blocked = true;
            self.idle_cycles += cycles - 1;
        } else {
            // a queued bus transaction blocks for an open-ended wait,
            // accounted cycle by cycle
            let blocking = self.cache.borrow().is_blocking();
            if blocking {
                self.blocked = true;
            }
        }
        self.refill();
    }
}
