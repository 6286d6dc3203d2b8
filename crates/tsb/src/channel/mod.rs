mod compute;
mod input;

pub use compute::{ComputeChannel, ComputeChannelState};
pub use input::{InputChannel, TimesliceSendPlan, TimesliceWriteSegment};
