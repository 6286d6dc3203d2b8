//! `clap`-derived flag parsing for the `input`/`compute` subcommands.
//!
//! Config values are parsed once at startup and treated as immutable for the
//! run: parse-then-freeze, no env-only surface.

use std::net::SocketAddr;

use clap::{Args, Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(name = "tsb-cli", about = "timeslice-building fabric: input/compute node launcher")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run an input node: read microslices from a source and push timeslice
    /// components into every configured compute node.
    Input(InputArgs),
    /// Run a compute node: accept input-node connections, assemble
    /// timeslices via the red-lantern algorithm, and hand them to workers.
    Compute(ComputeArgs),
}

#[derive(Args, Clone, Debug)]
pub struct HeartbeatArgs {
    /// `H`: number of recent inter-heartbeat gaps averaged for the
    /// liveness-classification threshold.
    #[arg(long, default_value_t = 8)]
    pub heartbeat_history: usize,
    #[arg(long, default_value_t = 4)]
    pub heartbeat_inactive_factor: u64,
    #[arg(long, default_value_t = 10)]
    pub heartbeat_timeout_factor: u64,
    #[arg(long, default_value_t = 3)]
    pub heartbeat_inactive_retry: usize,
    /// Heartbeat probe cadence.
    #[arg(long, default_value_t = 250)]
    pub heartbeat_interval_ms: u64,
}

impl HeartbeatArgs {
    #[must_use]
    pub fn to_config(&self) -> tsb::HeartbeatConfig {
        tsb::HeartbeatConfig {
            history: self.heartbeat_history,
            inactive_factor: self.heartbeat_inactive_factor,
            timeout_factor: self.heartbeat_timeout_factor,
            inactive_retry: self.heartbeat_inactive_retry,
        }
    }
}

#[derive(Args, Clone, Debug)]
pub struct InputArgs {
    /// This input node's own index, carried in `InputNodeInfo`.
    #[arg(long)]
    pub index: u32,
    /// One `host:port` per compute node, in compute-index order; `N_out` is
    /// the length of this list.
    #[arg(long, value_delimiter = ',', required = true)]
    pub compute_addrs: Vec<SocketAddr>,
    #[arg(long, default_value_t = 1024)]
    pub timeslice_size: u64,
    #[arg(long, default_value_t = 0)]
    pub overlap: u64,
    #[arg(long, default_value_t = 20)]
    pub data_buffer_size_exp: u32,
    #[arg(long, default_value_t = 12)]
    pub desc_buffer_size_exp: u32,
    /// Caps outstanding one-sided writes per channel before `send_timeslice`
    /// reports `BackpressureFull`.
    #[arg(long, default_value_t = 16)]
    pub max_pending_writes: u32,
    /// Stop after this many timeslices; unset runs until interrupted.
    #[arg(long)]
    pub max_timeslices: Option<u64>,
    /// Use the built-in fixed-rate synthetic microslice generator instead of
    /// a real detector front end (there is no other source implemented in
    /// this core; see `tsb::source::TimesliceSource`).
    #[arg(long, default_value_t = 256)]
    pub microslice_size: u32,
    #[command(flatten)]
    pub heartbeat: HeartbeatArgs,
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[derive(Args, Clone, Debug)]
pub struct ComputeArgs {
    /// This compute node's own index, carried in `ComputeNodeInfo`.
    #[arg(long = "compute-index")]
    pub index: u32,
    #[arg(long)]
    pub listen_addr: SocketAddr,
    #[arg(long)]
    pub num_input_nodes: usize,
    #[arg(long, default_value_t = 20)]
    pub data_buffer_size_exp: u32,
    #[arg(long, default_value_t = 12)]
    pub desc_buffer_size_exp: u32,
    /// Run without a local worker pool: every work item is completed
    /// immediately instead of being handed to an external process.
    #[arg(long, default_value_t = false)]
    pub drop: bool,
    /// `"<path> %s %i"`: `%s` is substituted with the shared-memory id,
    /// `%i` with the worker index. One process is spawned per
    /// `--num-workers`. Ignored when `--drop` is set.
    #[arg(long)]
    pub processor_executable: Option<String>,
    #[arg(long, default_value_t = 1)]
    pub num_workers: usize,
    #[command(flatten)]
    pub heartbeat: HeartbeatArgs,
    #[arg(long, default_value = "info")]
    pub log_level: String,
}
