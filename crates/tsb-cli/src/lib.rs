//! Glue binary for the timeslice-building core: flag parsing, process
//! supervision for local analysis workers, and the network event loops that
//! drive `tsb::InputBuilder`/`tsb::ComputeBuilder` against a
//! `tsb_transport::TcpTransport`.
//!
//! The core crate never touches a concrete network library, a CLI flag, or a
//! process handle; this crate is where all three meet so the fabric can be
//! exercised end to end from a single binary.

pub mod config;
pub mod processor;
pub mod runtime;

pub use config::{ComputeArgs, InputArgs};
pub use processor::ProcessorPool;
