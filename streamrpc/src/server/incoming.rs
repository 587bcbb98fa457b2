// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use super::{BaseChannel, Config, Service};
use crate::{ClientMessage, Codec, ServerMessage, Transport};
use futures::prelude::*;

/// An extension trait for [streams](futures::prelude::Stream) of [`Transports`](Transport), e.g.
/// the accepted connections of a listener.
pub trait Incoming<T>
where
    Self: Sized + Stream<Item = T>,
    T: Transport<ServerMessage, ClientMessage> + Send + 'static,
{
    /// Serves every incoming transport with `service` until the stream ends. Each connection is
    /// handled concurrently by spawning a [`BaseChannel`] on tokio's default executor, and each
    /// call is also spawned on tokio's default executor.
    fn execute<C: Codec>(self, config: Config, service: Service<C>) -> BoxedExecute
    where
        Self: Send + 'static,
    {
        self.for_each(move |transport| {
            tracing::info!("AcceptConnection");
            let channel = BaseChannel::new(config.clone(), transport);
            tokio::spawn(channel.execute(service.clone()));
            future::ready(())
        })
        .boxed()
    }
}

/// The future returned by [`Incoming::execute`].
pub type BoxedExecute = future::BoxFuture<'static, ()>;

impl<S, T> Incoming<T> for S
where
    S: Sized + Stream<Item = T>,
    T: Transport<ServerMessage, ClientMessage> + Send + 'static,
{
}
