// human-readable statistics report

use std::io::{self, Write};

use crate::sim::Simulator;

pub fn write_report<W: Write>(sim: &Simulator, out: &mut W) -> io::Result<()> {
    let specs = sim.specs();

    writeln!(out, "Simulation Parameters:")?;
    writeln!(out, "Trace Prefix: {}", sim.trace_prefix())?;
    writeln!(out, "Set Index Bits: {}", specs.set_index_bits)?;
    writeln!(out, "Associativity: {}", specs.assoc)?;
    writeln!(out, "Block Bits: {}", specs.block_offset_bits)?;
    writeln!(out, "Block Size (Bytes): {}", specs.block_size())?;
    writeln!(out, "Number of Sets: {}", specs.num_sets())?;
    writeln!(
        out,
        "Cache Size (KB per core): {:.2}",
        specs.cache_size() as f64 / 1024.0
    )?;
    writeln!(out, "MESI Protocol: Enabled")?;
    writeln!(out, "Write Policy: Write-back, Write-allocate")?;
    writeln!(out, "Replacement Policy: LRU")?;
    writeln!(out, "Bus: Central snooping bus")?;
    writeln!(out)?;

    for (i, proc) in sim.processors().iter().enumerate() {
        let proc = proc.borrow();
        let cache = sim.caches()[i].borrow();
        let stats = cache.stats();
        let ipc = if proc.total_cycles() > 0 {
            proc.total_instructions() as f64 / proc.total_cycles() as f64
        } else {
            0.0
        };
        writeln!(out, "Core {} Statistics:", i)?;
        writeln!(out, "Total Instructions: {}", proc.total_instructions())?;
        writeln!(out, "Total Reads: {}", proc.read_instructions())?;
        writeln!(out, "Total Writes: {}", proc.write_instructions())?;
        writeln!(out, "Total Execution Cycles: {}", proc.total_cycles())?;
        writeln!(out, "Idle Cycles: {}", proc.idle_cycles())?;
        writeln!(out, "Cache Misses: {}", stats.misses)?;
        writeln!(out, "Cache Miss Rate: {:.2}%", stats.miss_rate() * 100.0)?;
        writeln!(out, "Cache Evictions: {}", stats.evictions)?;
        writeln!(out, "Writebacks: {}", stats.writebacks)?;
        writeln!(out, "Bus Invalidations: {}", stats.invalidations)?;
        writeln!(out, "Data Traffic (Bytes): {}", stats.bus_traffic)?;
        writeln!(out, "IPC: {:.2}", ipc)?;
        writeln!(out)?;
    }

    let bus = sim.bus().borrow();
    let bus_stats = bus.stats();
    writeln!(out, "Overall Bus Summary:")?;
    writeln!(
        out,
        "Total Bus Transactions: {}",
        bus_stats.total_bus_transactions()
    )?;
    writeln!(out, "Total Bus Traffic (Bytes): {}", bus_stats.bus_traffic)?;
    writeln!(
        out,
        "Maximum Execution Time (Cycles): {}",
        sim.max_execution_time()
    )?;
    writeln!(out, "Total Simulation Cycles: {}", sim.current_cycle())?;
    Ok(())
}
