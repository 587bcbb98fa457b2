// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.
//! streamrpc is an RPC framework for rust built around four call shapes:
//!
//! - **unary**: one request, one response;
//! - **server streaming**: one request, an ordered sequence of responses;
//! - **client streaming**: an ordered sequence of requests, one response produced after the
//!   caller signals it is done sending;
//! - **bidirectional streaming**: independent request and response sequences that progress
//!   concurrently over one call.
//!
//! Every call carries a [`Context`](context::Context) with an optional deadline, a cancellation
//! signal, call-scoped metadata and trace context. Every call ends with exactly one terminal
//! [`Status`], which both the client and the server observe.
//!
//! Some other features:
//! - Pluggable transport: any type impling `Stream<Item = Message> + Sink<Message>` can be
//!   used as a transport to connect the client and server.
//! - Cascading cancellation: canceling a call's context, or dropping every handle to a call,
//!   sends a cancellation message to the server. The server ceases work on the call, and the
//!   handler's context is canceled so any calls it made on the same context are canceled too.
//! - Deadline propagation: the deadline travels with the call. The server stops the handler when
//!   the deadline passes, and calls made with [`Context::child`](context::Context::child) inherit
//!   it.
//! - Opaque payloads: requests and responses are turned into bytes by a [`Codec`]. [`Json`] and
//!   [`Bincode`] are provided.
//!
//! ## Example
//!
//! ```rust
//! use futures::prelude::*;
//! use streamrpc::{client, context, server, transport, Status};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> anyhow::Result<()> {
//! let (client_transport, server_transport) = transport::channel::unbounded();
//!
//! let service = server::Service::new(streamrpc::Json)
//!     .unary("Greet", |_ctx, name: String| async move { Ok(format!("Hello {name}")) })
//!     .server_streaming(
//!         "GreetManyTimes",
//!         |_ctx, name: String, mut sink: server::ResponseSink<String>| async move {
//!             for i in 0..3 {
//!                 sink.send(&format!("Hello {name} number {i}")).await?;
//!             }
//!             Ok::<_, Status>(())
//!         },
//!     );
//! tokio::spawn(server::BaseChannel::with_defaults(server_transport).execute(service));
//!
//! let client = client::new(client::Config::default(), client_transport, streamrpc::Json).spawn();
//!
//! let greeting: String = client.unary(context::current(), "Greet", &"David").await?;
//! assert_eq!(greeting, "Hello David");
//!
//! let greetings: Vec<String> = client
//!     .server_streaming(context::current(), "GreetManyTimes", &"Franco")
//!     .await?
//!     .try_collect()
//!     .await?;
//! assert_eq!(greetings.len(), 3);
//! # Ok(())
//! # }
//! ```
#![deny(missing_docs)]
#![allow(clippy::type_complexity)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub(crate) mod cancellations;
pub mod client;
pub mod codec;
pub mod context;
mod engine;
pub mod server;
mod status;
pub mod trace;
pub mod transport;
pub(crate) mod util;

#[cfg(feature = "serde-transport")]
#[cfg_attr(docsrs, doc(cfg(feature = "serde-transport")))]
pub mod serde_transport;

#[cfg(feature = "serde-transport")]
pub use tokio_serde;

pub use crate::{
    codec::{Bincode, Codec, CodecError, Json},
    engine::{Call, CallState},
    status::{Code, RpcError, Status},
    transport::sealed::Transport,
};

use serde::{Deserialize, Serialize};
use std::{error::Error, sync::Arc};

/// The shape of a logical call: how many messages flow in each direction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CallShape {
    /// One request, one response.
    Unary,
    /// One request, a sequence of responses.
    ServerStreaming,
    /// A sequence of requests, one response.
    ClientStreaming,
    /// Independent sequences of requests and responses.
    BidiStreaming,
}

impl CallShape {
    /// A short name for logging.
    pub fn name(self) -> &'static str {
        match self {
            CallShape::Unary => "unary",
            CallShape::ServerStreaming => "server_streaming",
            CallShape::ClientStreaming => "client_streaming",
            CallShape::BidiStreaming => "bidi_streaming",
        }
    }
}

/// One unit of exchanged data within one direction of a call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Position of the frame within its direction, starting at zero.
    pub ordinal: u64,
    /// The codec-produced payload. Absent on a bare end-of-stream marker.
    pub payload: Option<Vec<u8>>,
    /// True iff the sender will send no more frames in this direction.
    pub terminal: bool,
}

/// A message from a client to a server.
#[derive(Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ClientMessage {
    /// Starts a logical call.
    Open(Open),
    /// A request frame of an open call.
    Frame {
        /// The call the frame belongs to.
        call_id: u64,
        /// The frame.
        frame: Frame,
    },
    /// A command to abort a call, automatically sent by the client when the call's context is
    /// canceled, its deadline passes, or every handle to it is dropped.
    ///
    /// When received, the server cancels the handler's context and stops driving its future. Any
    /// tasks spawned by the handler are not stopped, because the framework does not know about
    /// them; they observe the canceled context.
    Cancel {
        /// The trace context associates the message with a specific chain of causally-related
        /// actions, possibly orchestrated across many distributed systems.
        trace_context: trace::Context,
        /// The ID of the call to cancel.
        call_id: u64,
    },
}

impl ClientMessage {
    /// The call the message belongs to.
    pub fn call_id(&self) -> u64 {
        match self {
            ClientMessage::Open(Open { call_id, .. })
            | ClientMessage::Frame { call_id, .. }
            | ClientMessage::Cancel { call_id, .. } => *call_id,
        }
    }
}

/// The opening message of a logical call.
#[derive(Debug, Serialize, Deserialize)]
pub struct Open {
    /// Uniquely identifies the call across all calls made over a single channel.
    pub call_id: u64,
    /// The name the handler was registered under.
    pub method: String,
    /// The shape the caller expects the method to have.
    pub shape: CallShape,
    /// Call context: deadline, metadata and trace context.
    pub context: context::Context,
}

/// A message from a server to a client.
#[derive(Debug, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ServerMessage {
    /// A response frame of an open call.
    Frame {
        /// The call the frame belongs to.
        call_id: u64,
        /// The frame.
        frame: Frame,
    },
    /// The terminal frame of the response direction. It carries the call's terminal status, and
    /// no messages for the call follow it.
    Close {
        /// The call being closed.
        call_id: u64,
        /// How the call ended.
        status: Status,
    },
}

impl ServerMessage {
    /// The call the message belongs to.
    pub fn call_id(&self) -> u64 {
        match self {
            ServerMessage::Frame { call_id, .. } | ServerMessage::Close { call_id, .. } => *call_id,
        }
    }
}

/// Critical errors that result in a Channel disconnecting.
#[derive(thiserror::Error, Debug)]
pub enum ChannelError<E>
where
    E: Error + Send + Sync + 'static,
{
    /// Could not read from the transport.
    #[error("could not read from the transport")]
    Read(#[source] Arc<E>),
    /// Could not ready the transport for writes.
    #[error("could not ready the transport for writes")]
    Ready(#[source] E),
    /// Could not write to the transport.
    #[error("could not write to the transport")]
    Write(#[source] E),
    /// Could not flush the transport.
    #[error("could not flush the transport")]
    Flush(#[source] E),
    /// Could not close the write end of the transport.
    #[error("could not close the write end of the transport")]
    Close(#[source] E),
}
