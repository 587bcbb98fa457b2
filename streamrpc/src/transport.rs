// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The message pipe underneath a connection.
//!
//! Clients and servers exchange [`ClientMessage`](crate::ClientMessage)s and
//! [`ServerMessage`](crate::ServerMessage)s. All they ask of the pipe is that messages arrive in
//! the order they were sent, none are lost, and both directions can be used at once. Anything
//! that is both a [`Sink`](futures::Sink) of outbound messages and a [`Stream`](futures::Stream)
//! of inbound ones, failing with one error type, qualifies; framing is up to the pipe.
//!
//! [`channel`] connects two peers in the same process. The `serde-transport` feature adds a
//! length-delimited transport over any async byte stream.

pub mod channel;

pub(crate) mod sealed {
    use futures::prelude::*;
    use std::error::Error;

    /// A duplex pipe that sends `Out` messages and receives `In` messages.
    ///
    /// Implemented for every type with the right [`Sink`] and [`Stream`] impls.
    pub trait Transport<Out, In>
    where
        Self: Sink<Out, Error = <Self as Transport<Out, In>>::TransportError>,
        Self: Stream<Item = Result<In, <Self as Sink<Out>>::Error>>,
        <Self as Sink<Out>>::Error: Error,
    {
        /// The error both halves fail with. Named here so that bounds on `Transport` do not
        /// need to restate `Error + Send + Sync`.
        type TransportError: Error + Send + Sync + 'static;
    }

    impl<T, Out, In, E> Transport<Out, In> for T
    where
        T: ?Sized + Sink<Out, Error = E> + Stream<Item = Result<In, E>>,
        E: Error + Send + Sync + 'static,
    {
        type TransportError = E;
    }
}
