/*
    A cycle-accurate simulator for multi-core private L1 caches kept
    coherent by the MESI (Illinois) protocol over a central snooping bus.
 */

pub mod bus;
pub mod cache;
pub mod commons;
pub mod processor;
pub mod report;
pub mod sim;
pub mod stats;
pub mod trace;

pub use bus::{Bus, BusOp, BusResponse};
pub use cache::{Cache, MesiState};
pub use commons::{Addr, MemOp, MemRef, SystemSpec};
pub use processor::Processor;
pub use sim::Simulator;
pub use stats::Stats;
pub use trace::TraceReader;
