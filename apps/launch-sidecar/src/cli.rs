use clap::{Parser, Subcommand};

#[derive(Parser, Debug, Clone)]
#[command(
    name = "launch-sidecar",
    version,
    about = "CanSat ground station: radio ingest and launch session tracking"
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Read frames from the ground radio and relay them to the bus.
    Ingest,
    /// Follow the bus, track launch sessions and persist them.
    Track,
}
