//! Clap CLI definitions for Netron.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  netron hub                        Run a hub on the configured listen address
  netron hub --listen 0.0.0.0:8470  Run a hub on a specific address
  netron ping 10.0.0.5:8470         Check that a runtime answers
  netron contexts 10.0.0.5:8470     List the contexts a runtime exposes
  netron watch 10.0.0.5:8470 \
    \"context attach\"                 Print a runtime's events as JSON lines";

/// Netron: peer-to-peer remote objects.
#[derive(Parser)]
#[command(name = "netron", version, about = "Netron remote-object runtime", after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a hub that relays contexts between its peers until Ctrl-C.
    Hub {
        /// Address to listen on (overrides `listen_addr`).
        #[arg(long, short = 'l')]
        listen: Option<String>,
    },
    /// Connect to a runtime and round-trip a ping.
    Ping {
        /// Address of the runtime.
        addr: String,
    },
    /// List the contexts a runtime exposes.
    Contexts {
        /// Address of the runtime.
        addr: String,
        /// Output as JSON for scripting.
        #[arg(long)]
        json: bool,
    },
    /// Print the events of a runtime until Ctrl-C.
    Watch {
        /// Address of the runtime.
        addr: String,
        /// Events to follow, such as "peer online"; all of them when omitted.
        events: Vec<String>,
    },
}
