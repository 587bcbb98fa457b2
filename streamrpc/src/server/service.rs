// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::{
    codec::{decode_stream, exhausted},
    context,
    engine::{Call, CallReceiver, CallSender},
    CallShape, Codec, CodecError, ServerMessage, Status,
};
use fnv::FnvHashMap;
use futures::{future::BoxFuture, prelude::*, stream::BoxStream, task::*};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, pin::Pin, sync::Arc};

type Handler = Arc<
    dyn Fn(
            context::Context,
            CallSender<ServerMessage>,
            CallReceiver,
        ) -> BoxFuture<'static, Result<(), Status>>
        + Send
        + Sync,
>;

type Encoder<T> = Box<dyn Fn(&T) -> Result<Vec<u8>, CodecError> + Send + Sync>;

fn boxed_handler<F, Fut>(f: F) -> Handler
where
    F: Fn(context::Context, CallSender<ServerMessage>, CallReceiver) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), Status>> + Send + 'static,
{
    Arc::new(
        move |ctx: context::Context, sender: CallSender<ServerMessage>, receiver: CallReceiver| {
            f(ctx, sender, receiver).boxed()
        },
    )
}

/// A registered handler, tagged with the shape of call it serves.
#[derive(Clone)]
pub struct Method {
    shape: CallShape,
    handler: Handler,
}

impl Method {
    /// The shape of call the handler serves.
    pub fn shape(&self) -> CallShape {
        self.shape
    }

    pub(super) fn serve(
        &self,
        ctx: context::Context,
        sender: CallSender<ServerMessage>,
        receiver: CallReceiver,
    ) -> BoxFuture<'static, Result<(), Status>> {
        (self.handler)(ctx, sender, receiver)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

/// Maps method names to handlers. Every handler of a service decodes requests and encodes
/// responses with the service's codec.
///
/// A handler ends its call by returning: `Ok` closes the call with an OK status, and `Err`
/// closes it with the returned status.
#[derive(Clone)]
pub struct Service<C> {
    codec: C,
    methods: FnvHashMap<String, Method>,
}

impl<C: Codec> Service<C> {
    /// Returns a service with no methods.
    pub fn new(codec: C) -> Self {
        Self {
            codec,
            methods: FnvHashMap::default(),
        }
    }

    /// Registers a handler that takes one request and returns one response.
    pub fn unary<Req, Resp, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + Sync + 'static,
        F: Fn(context::Context, Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let f = Arc::new(f);
        let handler = boxed_handler(move |ctx, sender, mut receiver| {
            let (f, codec) = (Arc::clone(&f), codec.clone());
            async move {
                let request = single_request(&mut receiver, &codec).await?;
                let response = f(ctx, request).await?;
                ResponseSink::new(sender, codec).send(&response).await
            }
        });
        self.register(name, CallShape::Unary, handler)
    }

    /// Registers a handler that takes one request and sends any number of responses.
    pub fn server_streaming<Req, Resp, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(context::Context, Req, ResponseSink<Resp>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let f = Arc::new(f);
        let handler = boxed_handler(move |ctx, sender, mut receiver| {
            let (f, codec) = (Arc::clone(&f), codec.clone());
            async move {
                let request = single_request(&mut receiver, &codec).await?;
                f(ctx, request, ResponseSink::new(sender, codec)).await
            }
        });
        self.register(name, CallShape::ServerStreaming, handler)
    }

    /// Registers a handler that reads a stream of requests and returns one response.
    pub fn client_streaming<Req, Resp, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + Sync + 'static,
        F: Fn(context::Context, RequestStream<Req>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, Status>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let f = Arc::new(f);
        let handler = boxed_handler(move |ctx, sender, receiver| {
            let (f, codec) = (Arc::clone(&f), codec.clone());
            async move {
                let requests = RequestStream::new(receiver, codec.clone());
                let response = f(ctx, requests).await?;
                ResponseSink::new(sender, codec).send(&response).await
            }
        });
        self.register(name, CallShape::ClientStreaming, handler)
    }

    /// Registers a handler that reads a stream of requests while sending any number of
    /// responses.
    pub fn bidi_streaming<Req, Resp, F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        Req: DeserializeOwned + Send + 'static,
        Resp: Serialize + Send + 'static,
        F: Fn(context::Context, RequestStream<Req>, ResponseSink<Resp>) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let codec = self.codec.clone();
        let handler = boxed_handler(move |ctx, sender, receiver| {
            let requests = RequestStream::new(receiver, codec.clone());
            f(ctx, requests, ResponseSink::new(sender, codec.clone()))
        });
        self.register(name, CallShape::BidiStreaming, handler)
    }

    /// Returns the handler registered under `name`.
    pub fn method(&self, name: &str) -> Option<&Method> {
        self.methods.get(name)
    }

    /// The names and shapes of all registered methods.
    pub fn methods(&self) -> impl Iterator<Item = (&str, CallShape)> {
        self.methods
            .iter()
            .map(|(name, method)| (name.as_str(), method.shape))
    }

    fn register(mut self, name: impl Into<String>, shape: CallShape, handler: Handler) -> Self {
        let name = name.into();
        if let Some(replaced) = self
            .methods
            .insert(name.clone(), Method { shape, handler })
        {
            tracing::warn!(
                method = %name,
                replaced = replaced.shape.name(),
                "Replacing a registered handler."
            );
        }
        self
    }
}

impl<C> fmt::Debug for Service<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(self.methods.iter().map(|(name, method)| (name, method.shape)))
            .finish()
    }
}

/// Reads the request of a unary or server-streaming call.
async fn single_request<Req, C>(receiver: &mut CallReceiver, codec: &C) -> Result<Req, Status>
where
    Req: DeserializeOwned,
    C: Codec,
{
    let payload = receiver
        .receive()
        .await?
        .ok_or_else(|| Status::invalid_argument("the call carried no request"))?;
    codec
        .decode(&payload)
        .map_err(|e| receiver.call().fail(e.into()))
}

/// Sends the responses of a call, in order.
pub struct ResponseSink<Resp> {
    sender: CallSender<ServerMessage>,
    encode: Encoder<Resp>,
}

impl<Resp> ResponseSink<Resp>
where
    Resp: Serialize + 'static,
{
    fn new<C: Codec>(sender: CallSender<ServerMessage>, codec: C) -> Self {
        Self {
            sender,
            encode: Box::new(move |response: &Resp| codec.encode(response)),
        }
    }

    /// Sends one response. Waits while the connection's outbound buffer is full.
    ///
    /// Fails with the call's status once the call is over, e.g. because the client canceled it.
    pub async fn send(&mut self, response: &Resp) -> Result<(), Status> {
        let payload = (self.encode)(response).map_err(|e| self.sender.call().fail(e.into()))?;
        Ok(self.sender.send(payload).await?)
    }
}

impl<Resp> ResponseSink<Resp> {
    /// The call the responses belong to.
    pub fn call(&self) -> &Call {
        self.sender.call()
    }
}

impl<Resp> fmt::Debug for ResponseSink<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseSink")
            .field("call", self.sender.call())
            .finish_non_exhaustive()
    }
}

/// The requests of a call, in the order the client sent them.
///
/// The stream ends once the client closes its direction. If the call fails first, the last item
/// is the failure.
#[must_use = "streams do nothing unless polled"]
pub struct RequestStream<Req> {
    call: Call,
    inner: BoxStream<'static, Result<Req, Status>>,
}

impl<Req> RequestStream<Req>
where
    Req: DeserializeOwned + Send + 'static,
{
    fn new<C: Codec>(receiver: CallReceiver, codec: C) -> Self {
        Self {
            call: receiver.call().clone(),
            inner: decode_stream(receiver, codec),
        }
    }

    /// Receives the next request. Returns `Ok(None)` once the client is done sending.
    ///
    /// Once the stream is exhausted, every further call returns the same result.
    pub async fn message(&mut self) -> Result<Option<Req>, Status> {
        match self.next().await {
            Some(request) => request.map(Some),
            None => exhausted(&self.call),
        }
    }
}

impl<Req> RequestStream<Req> {
    /// The call the requests belong to.
    pub fn call(&self) -> &Call {
        &self.call
    }
}

impl<Req> Stream for RequestStream<Req> {
    type Item = Result<Req, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<Req> fmt::Debug for RequestStream<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestStream")
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::Service;
    use crate::{CallShape, Json, Status};

    #[test]
    fn registered_methods_keep_their_shape() {
        let service = Service::new(Json)
            .unary("Greet", |_, name: String| async move {
                Ok(format!("Hello {name}"))
            })
            .client_streaming("LongGreet", |_, _requests: super::RequestStream<String>| async {
                Ok::<_, Status>(String::new())
            });
        assert_eq!(service.method("Greet").map(|m| m.shape()), Some(CallShape::Unary));
        assert_eq!(
            service.method("LongGreet").map(|m| m.shape()),
            Some(CallShape::ClientStreaming)
        );
        assert!(service.method("Nope").is_none());
        assert_eq!(service.methods().count(), 2);
    }

    #[test]
    fn later_registration_replaces_earlier() {
        let service = Service::new(Json)
            .unary("Greet", |_, name: String| async move { Ok(name) })
            .server_streaming(
                "Greet",
                |_, _name: String, _sink: super::ResponseSink<String>| async { Ok(()) },
            );
        assert_eq!(
            service.method("Greet").map(|m| m.shape()),
            Some(CallShape::ServerStreaming)
        );
    }
}
