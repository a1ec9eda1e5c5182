use std::fs::File;
use std::io;
use std::process;

use env_logger::Env;

use cachesim_mesi::report::write_report;
use cachesim_mesi::{Simulator, SystemSpec};

fn print_help() {
    println!(
        "Usage: cachesim-mesi [OPTIONS]\n\
         Options:\n\
         \x20 -t <traceprefix>: name of the parallel application (e.g. app1) whose per-core traces are used\n\
         \x20 -s <s>: number of set index bits (number of sets = 2^s, default 6)\n\
         \x20 -E <E>: associativity (cache lines per set, default 2)\n\
         \x20 -b <b>: number of block bits (block size = 2^b bytes, default 5)\n\
         \x20 -o <outfilename>: write the report to a file instead of stdout\n\
         \x20 -h: prints this help"
    );
}

fn parse_args() -> Result<(SystemSpec, String, Option<String>), String> {
    let mut args = pico_args::Arguments::from_env();
    if args.contains(["-h", "--help"]) {
        print_help();
        process::exit(0);
    }

    let trace_prefix: String = args
        .opt_value_from_str("-t")
        .map_err(|e| e.to_string())?
        .ok_or("trace file prefix (-t) is required")?;
    let set_index_bits: u32 = args
        .opt_value_from_str("-s")
        .map_err(|e| e.to_string())?
        .unwrap_or(6);
    let assoc: usize = args
        .opt_value_from_str("-E")
        .map_err(|e| e.to_string())?
        .unwrap_or(2);
    let block_offset_bits: u32 = args
        .opt_value_from_str("-b")
        .map_err(|e| e.to_string())?
        .unwrap_or(5);
    let output: Option<String> = args.opt_value_from_str("-o").map_err(|e| e.to_string())?;

    let rest = args.finish();
    if !rest.is_empty() {
        return Err(format!("unexpected arguments: {:?}", rest));
    }

    if assoc == 0 {
        return Err("associativity must be at least 1".to_string());
    }
    if block_offset_bits < 2 {
        return Err("block size must cover at least one 4-byte word (-b >= 2)".to_string());
    }
    if set_index_bits + block_offset_bits >= 32 {
        return Err("set index and block bits must leave room for a tag".to_string());
    }

    let specs = SystemSpec {
        set_index_bits,
        assoc,
        block_offset_bits,
        ..SystemSpec::default()
    };
    Ok((specs, trace_prefix, output))
}

fn main() {
    env_logger::init_from_env(Env::default().default_filter_or("warn"));

    let (specs, trace_prefix, output) = match parse_args() {
        Ok(parsed) => parsed,
        Err(e) => {
            eprintln!("Error: {}", e);
            print_help();
            process::exit(1);
        }
    };

    let mut sim = Simulator::new(specs, &trace_prefix);
    sim.run();

    let result = match &output {
        Some(path) => match File::create(path) {
            Ok(mut f) => write_report(&sim, &mut f),
            Err(e) => {
                eprintln!("Error: could not open output file {}: {}", path, e);
                process::exit(1);
            }
        },
        None => write_report(&sim, &mut io::stdout()),
    };
    if let Err(e) = result {
        eprintln!("Error: failed to write report: {}", e);
        process::exit(1);
    }
    if let Some(path) = output {
        println!("Output written to {}", path);
    }
}
