//! Relay core library: callback crypto, stream cache, upstream client and the gateway
//! that bridges platform webhooks to streaming AI answers.

pub mod agents;
pub mod cache;
pub mod channels;
pub mod config;
pub mod crypto;
pub mod dedup;
pub mod gateway;
pub mod init;
pub mod llm;
pub mod media;
pub mod orchestrator;
pub mod parser;
