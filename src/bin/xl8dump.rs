//! Fragment listing inspector.
//!
//! Loads a fragment listing, prints translation tables, translates cache
//! pcs back to source pcs and optionally checks every fragment's
//! translation metadata for consistency.

use clap::Parser;
use fcache_xl8::core::{MachineContext, XlateConfig};
use fcache_xl8::frag_listing::{parse_listing, MemoryStore, SimThread};
use fcache_xl8::translate::{RecoveryOutcome, StateRecreator};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser, Debug)]
#[command(name = "xl8dump", about = "Inspect code-cache fragment translations")]
struct Args {
    /// Fragment listing to load
    listing: PathBuf,

    /// Cache pc to translate (repeatable, hex with 0x or decimal)
    #[arg(long = "pc", value_parser = parse_addr)]
    pcs: Vec<u64>,

    /// Recreate the whole register state instead of just the pc
    #[arg(long)]
    full_state: bool,

    /// Stack pointer of the captured context for full-state recreation
    #[arg(long, value_parser = parse_addr, default_value = "0")]
    sp: u64,

    /// Print every fragment's translation table
    #[arg(long)]
    tables: bool,

    /// Check table replay and list replay against each other
    #[arg(long)]
    verify: bool,

    /// Rebuild pending-deletion fragments that have no stored table
    #[arg(long)]
    rebuild_deleted: bool,

    /// Print statistics at the end
    #[arg(long)]
    stats: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_addr(text: &str) -> Result<u64, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|e| format!("invalid address '{text}': {e}"))
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = match args.verbose {
        0 => "warn",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    let text = fs::read_to_string(&args.listing)?;
    let listing = parse_listing(&text)?;
    let thread = SimThread::from_listing(&listing);
    let store = MemoryStore::from_listing(listing)?;

    let config = XlateConfig::new()
        .with_rebuild_deleted_fragments(args.rebuild_deleted)
        .with_dump_tables(args.verbose > 0);
    let recreator = StateRecreator::new(&store, &store, &store).with_config(config);

    let mut clean = true;

    if args.tables {
        for fragment in store.fragments() {
            println!("F{} tag {:#x}", fragment.id, fragment.tag);
            match fragment.translation_table() {
                Some(table) => println!("{}", table.display_at(fragment.start_pc)),
                None => match recreator.record_translation_info(&fragment, store.list(fragment.id)) {
                    Ok(table) => println!("{}", table.display_at(fragment.start_pc)),
                    Err(e) => {
                        eprintln!("Error: F{}: {}", fragment.id, e);
                        clean = false;
                    }
                },
            }
        }
    }

    for &pc in &args.pcs {
        if args.full_state {
            let mut mc = MachineContext::new(pc);
            mc.set_sp(args.sp);
            let outcome = recreator.recreate_state(&thread, &mut mc, false, None);
            println!("{pc:#x} => {outcome}");
            if outcome != RecoveryOutcome::Failed {
                print!("{mc}");
            } else {
                clean = false;
            }
        } else {
            match recreator.recreate_pc(&thread, pc, None) {
                Some(app) => println!("{pc:#x} => {app:#x}"),
                None => {
                    println!("{pc:#x} => failed");
                    clean = false;
                }
            }
        }
    }

    if args.verify {
        for fragment in store.fragments() {
            let Some(list) = store.list(fragment.id) else {
                continue;
            };
            let mismatches = recreator.verify_fragment(&thread, &fragment, list);
            if mismatches.is_empty() {
                println!("F{}: ok", fragment.id);
            }
            for mismatch in &mismatches {
                println!("F{}: {}", fragment.id, mismatch);
                clean = false;
            }
        }
    }

    if args.stats {
        print!("{}", recreator.stats().snapshot());
    }

    Ok(if clean { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}
