//! LI-820 Serve - broadcasting samples to subscribers
//!
//! This crate provides:
//! - The JSON wire record published for every sample
//! - A WebSocket publisher bound to a TCP port and a local socket file
//! - The sample-then-publish run loop

pub mod protocol;
pub mod publisher;
pub mod server;

pub use protocol::{ProtocolError, SampleMessage, decode_sample, encode_sample};
pub use publisher::{
    DEFAULT_HOST, DEFAULT_IPC_PATH, DEFAULT_PORT, Endpoints, PublishError, Publisher,
};
pub use server::{RunSummary, Server, ServerError};

pub use li820::{Sample, SampleError, Sampler, SessionPolicy};
