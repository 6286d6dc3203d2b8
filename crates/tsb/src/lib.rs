//! The timeslice-building core: credit-based flow control, the red-lantern
//! ordering algorithm, shared-memory work distribution, and liveness/failure
//! handling for a fleet of input and compute nodes.
//!
//! This crate has no transport of its own — it is built against the
//! [`transport::Transport`] trait; `tsb-transport` supplies a concrete TCP
//! implementation.

pub mod channel;
pub mod compute_builder;
pub mod credit;
pub mod distributor;
pub mod error;
pub mod heartbeat;
pub mod input_builder;
pub mod ring;
pub mod source;
pub mod transport;
pub mod wire;

pub use compute_builder::ComputeBuilder;
pub use credit::CreditWindow;
pub use distributor::{ItemDistributor, TimesliceCompletion, TimesliceWorkItem};
pub use error::BuilderError;
pub use heartbeat::{FailureConsensus, HeartbeatConfig, HeartbeatLayer};
pub use input_builder::{InputBuilder, InputSendEvent};
pub use ring::{ManagedRingBuffer, RingBuffer};
pub use source::{SyntheticSource, TimesliceSource};

pub use tsb_communication as communication;
pub use tsb_timing as timing;
pub use tsb_utils as utils;
