//! Gateway: the platform callback endpoint.
//!
//! One port serves URL verification (GET), message intake and poll continuations (POST) on the
//! callback path, plus a health probe at `/`. Long upstream answers run in background turns;
//! the platform pulls their output by polling with `msgtype: stream`.

mod protocol;
mod server;

pub use protocol::{
    welcome_card, CallbackBody, CallbackQuery, EncryptedReply, ImagePayload, MsgItem, StreamBody,
    StreamReply,
};
pub use server::{router, run_gateway, GatewayError, GatewayState};
