//! The dispatch loop and its configuration.

pub mod loop_;

pub use loop_::{
    DispatchConfig, DispatchLoop, DispatchOutcome, STREAM_CHANNEL_CAPACITY, stream_channel,
};
