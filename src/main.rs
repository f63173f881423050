//! nftset - nf_tables set batch builder
//!
//! Builds the nfnetlink batches that create, replace and delete nftables sets
//! and their elements, without talking to the kernel itself. The output is
//! meant to be piped into whatever owns the netlink socket.
//!
//! # Usage
//!
//! ```bash
//! nftset attrs set                 # Attribute table of sets
//! nftset attrs element --json      # Same, as JSON
//! nftset build plan.json           # Hex dump of the batch described by plan.json
//! nftset build plan.json --raw > batch.bin
//! nftset constants                 # Families and socket constants
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use nftset::config;
use nftset::core::attr::AttrTable;
use nftset::core::element::ELEMENT_ATTRIBUTES;
use nftset::core::netlink::{
    self, Family, NETLINK_NETFILTER, NftCommand, SOCKET_AUTOPID, SOCKET_BUFFER_SIZE,
};
use nftset::core::set::SET_ATTRIBUTES;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use strum::IntoEnumIterator;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "nftset")]
#[command(about = "Build nf_tables set batches", long_about = None)]
struct Cli {
    /// Log at debug level (overrides RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum ObjectKind {
    Set,
    Element,
}

impl ObjectKind {
    fn table(self) -> &'static AttrTable {
        match self {
            ObjectKind::Set => &SET_ATTRIBUTES,
            ObjectKind::Element => &ELEMENT_ATTRIBUTES,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Print the attribute table of an object kind
    Attrs {
        #[arg(value_enum)]
        kind: ObjectKind,
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Build the batch described by a JSON plan
    Build {
        plan: PathBuf,
        /// Override the first sequence number
        #[arg(long, value_name = "N")]
        seq: Option<u32>,
        /// Write the raw batch bytes instead of a hex dump
        #[arg(long)]
        raw: bool,
    },
    /// Print address families and socket constants
    Constants,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match handle_cli(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn handle_cli(command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Attrs { kind, json } => {
            let table = kind.table();
            if json {
                println!("{}", serde_json::to_string_pretty(table)?);
            } else {
                println!("{:<12} {:>4}  {:<7} access", table.object, "code", "kind");
                for spec in table.iter() {
                    println!(
                        "{:<12} {:>4}  {:<7} {}",
                        spec.name, spec.code, spec.kind, spec.permission
                    );
                }
            }
        }
        Commands::Build { plan, seq, raw } => {
            let mut plan = config::load_plan(&plan)?;
            if seq.is_some() {
                plan.batch.seq_seed = seq;
            }
            let (mut batch, _sets) = plan.build()?;
            let bytes = batch.dump();
            batch.close();

            if raw {
                let mut stdout = std::io::stdout().lock();
                stdout.write_all(&bytes)?;
                stdout.flush()?;
            } else {
                print_dump(&bytes);
            }
        }
        Commands::Constants => {
            println!("Families:");
            for family in Family::iter() {
                println!("  {:<7} {}", family.to_string(), u8::from(family));
            }
            println!("Socket:");
            println!("  NETLINK_NETFILTER  {NETLINK_NETFILTER}");
            println!("  SOCKET_AUTOPID     {SOCKET_AUTOPID}");
            println!("  SOCKET_BUFFER_SIZE {}", *SOCKET_BUFFER_SIZE);
        }
    }
    Ok(())
}

/// One summary line per message followed by its bytes, 16 per row.
fn print_dump(bytes: &[u8]) {
    let mut offset = 0;
    for (header, _) in netlink::messages(bytes) {
        let name = NftCommand::from_msg_type(header.msg_type).map_or_else(
            || match header.msg_type {
                netlink::NFNL_MSG_BATCH_BEGIN => "BATCH_BEGIN".to_string(),
                netlink::NFNL_MSG_BATCH_END => "BATCH_END".to_string(),
                other => format!("{other:#06x}"),
            },
            |command| command.to_string(),
        );
        println!(
            "# {name} seq={} flags={:#06x} len={}",
            header.seq, header.flags, header.len
        );

        let len = header.len as usize;
        for (row, chunk) in bytes[offset..offset + len].chunks(16).enumerate() {
            let hex: Vec<String> = chunk.iter().map(|b| format!("{b:02x}")).collect();
            println!("{:08x}  {}", offset + row * 16, hex.join(" "));
        }
        offset += netlink::align(len);
    }
}
