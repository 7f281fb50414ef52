//! Upstream AI completion service client.
//!
//! The orchestrator talks to the upstream through [`DifyStreamClient`] so tests can swap in stubs.

mod dify;

pub use dify::{
    parse_sse_block, DifyClient, DifyEvent, DifyStreamClient, EventStream, StreamEvent,
    StreamRequest, UploadedFile, UpstreamError,
};
