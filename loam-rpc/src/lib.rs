//! Wire layer between gateways and processing nodes.
//!
//! Envelopes are postcard-encoded and length-prefixed, multiplexed
//! over one stream by [`RpcConnection`], and exposed as typed calls by
//! [`Client`] and as registered handlers by [`Server`].

mod client;
mod frame;
mod message;
mod rpc;
mod server;

pub use client::{Client, ClientError};
pub use frame::{FrameError, MAX_FRAME_SIZE, read_frame, write_frame};
pub use message::{Envelope, MessageId, WireError, WireMessage};
pub use rpc::{Replier, RpcConnection, RpcError};
pub use server::*;
pub use tokio_util::sync::CancellationToken;
