// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Typed handles for calls whose requests or responses are streamed.

use super::DispatchRequest;
use crate::{
    codec::{decode_stream, exhausted},
    engine::{Call, CallReceiver, CallSender},
    Codec, CodecError, RpcError, Status,
};
use futures::{prelude::*, stream::BoxStream, task::*};
use serde::{de::DeserializeOwned, Serialize};
use std::{fmt, pin::Pin};

type Encoder<T> = Box<dyn Fn(&T) -> Result<Vec<u8>, CodecError> + Send + Sync>;
type Decoder<T> = Box<dyn Fn(&[u8]) -> Result<T, CodecError> + Send + Sync>;

/// Receives the one response of a unary or client-streaming call, then waits for the server to
/// close the call.
pub(super) async fn single_response<Resp>(
    call: &Call,
    receiver: &mut CallReceiver,
    decode: impl FnOnce(&[u8]) -> Result<Resp, CodecError>,
) -> Result<Resp, RpcError> {
    let payload = receiver
        .receive()
        .await?
        .ok_or_else(|| Status::internal("the server closed the call without a response"))?;
    if receiver.receive().await?.is_some() {
        let status = call.fail(Status::internal("the server sent more than one response"));
        return Err(status.into());
    }
    Ok(decode(&payload).map_err(|e| call.fail(e.into()))?)
}

/// The request direction of a streaming call.
pub struct RequestSink<Req> {
    sender: CallSender<DispatchRequest>,
    encode: Encoder<Req>,
}

impl<Req> RequestSink<Req>
where
    Req: Serialize + 'static,
{
    pub(super) fn new<C: Codec>(sender: CallSender<DispatchRequest>, codec: C) -> Self {
        Self {
            sender,
            encode: Box::new(move |request: &Req| codec.encode(request)),
        }
    }

    /// The call the requests belong to.
    pub fn call(&self) -> &Call {
        self.sender.call()
    }

    /// Sends one request. Waits while the connection's outbound buffer is full.
    ///
    /// Fails with [`RpcError::InvalidState`] once the sink is closed, and with the terminal status
    /// once the call is over.
    pub async fn send(&mut self, request: &Req) -> Result<(), RpcError> {
        let payload = (self.encode)(request).map_err(|e| self.sender.call().fail(e.into()))?;
        self.sender.send(payload).await
    }

    /// Tells the server no more requests follow. A second close fails with
    /// [`RpcError::InvalidState`].
    pub async fn close(&mut self) -> Result<(), RpcError> {
        self.sender.close().await
    }
}

impl<Req> fmt::Debug for RequestSink<Req> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestSink")
            .field("call", self.sender.call())
            .finish_non_exhaustive()
    }
}

/// The responses of a streaming call, in the order the server sent them.
///
/// The stream ends after the server closes the call with an OK status. If the call fails, the
/// last item is the failure. Dropping the stream, along with every other handle to the call,
/// before the call is closed cancels it.
#[must_use = "streams do nothing unless polled"]
pub struct ResponseStream<Resp> {
    call: Call,
    inner: BoxStream<'static, Result<Resp, Status>>,
}

impl<Resp> ResponseStream<Resp>
where
    Resp: DeserializeOwned + Send + 'static,
{
    pub(super) fn new<C: Codec>(call: Call, receiver: CallReceiver, codec: C) -> Self {
        Self {
            call,
            inner: decode_stream(receiver, codec),
        }
    }

    /// Receives the next response. Returns `Ok(None)` once the call closed successfully.
    ///
    /// Once the stream is exhausted, every further call returns the same result: `Ok(None)`, or
    /// the call's failure.
    pub async fn message(&mut self) -> Result<Option<Resp>, Status> {
        match self.next().await {
            Some(response) => response.map(Some),
            None => exhausted(&self.call),
        }
    }
}

impl<Resp> ResponseStream<Resp> {
    /// The call the responses belong to.
    pub fn call(&self) -> &Call {
        &self.call
    }

    /// Cancels the call. The server's handler stops, and the stream ends with
    /// [`Canceled`](crate::Code::Canceled).
    pub fn cancel(&self) -> Status {
        self.call.cancel()
    }

    /// The terminal status, if the call is closed.
    pub fn status(&self) -> Option<Status> {
        self.call.status()
    }
}

impl<Resp> Stream for ResponseStream<Resp> {
    type Item = Result<Resp, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<Resp> fmt::Debug for ResponseStream<Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}

/// A call that sends a stream of requests and receives one response.
pub struct ClientStreamingCall<Req, Resp> {
    sink: RequestSink<Req>,
    receiver: CallReceiver,
    decode: Decoder<Resp>,
    closed: bool,
}

impl<Req, Resp> ClientStreamingCall<Req, Resp>
where
    Req: Serialize + 'static,
    Resp: DeserializeOwned + 'static,
{
    pub(super) fn new<C: Codec>(
        sender: CallSender<DispatchRequest>,
        receiver: CallReceiver,
        codec: C,
    ) -> Self {
        Self {
            sink: RequestSink::new(sender, codec.clone()),
            receiver,
            decode: Box::new(move |payload: &[u8]| codec.decode(payload)),
            closed: false,
        }
    }

    /// Sends one request.
    pub async fn send(&mut self, request: &Req) -> Result<(), RpcError> {
        if self.closed {
            return Err(RpcError::InvalidState);
        }
        self.sink.send(request).await
    }

    /// Tells the server no more requests follow, and waits for its response.
    ///
    /// Only the first call does anything; any later call fails with [`RpcError::InvalidState`].
    pub async fn close_and_receive(&mut self) -> Result<Resp, RpcError> {
        if self.closed {
            return Err(RpcError::InvalidState);
        }
        self.closed = true;
        match self.sink.close().await {
            // The server may answer before reading every request; its status tells the rest.
            Ok(()) | Err(RpcError::InvalidState) => {}
            Err(e) => return Err(e),
        }
        let decode = &self.decode;
        single_response(self.sink.call(), &mut self.receiver, |payload| {
            decode(payload)
        })
        .await
    }
}

impl<Req, Resp> ClientStreamingCall<Req, Resp> {
    /// The underlying call.
    pub fn call(&self) -> &Call {
        self.receiver.call()
    }

    /// Cancels the call.
    pub fn cancel(&self) -> Status {
        self.receiver.call().cancel()
    }
}

impl<Req, Resp> fmt::Debug for ClientStreamingCall<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientStreamingCall")
            .field("call", self.receiver.call())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

/// A call whose request and response streams progress independently.
///
/// [`split`](Self::split) it to drive the directions from separate tasks, or hand both
/// directions to [`drive`](Self::drive).
pub struct BidiStreamingCall<Req, Resp> {
    sink: RequestSink<Req>,
    stream: ResponseStream<Resp>,
}

impl<Req, Resp> BidiStreamingCall<Req, Resp>
where
    Req: Serialize + Send + 'static,
    Resp: DeserializeOwned + Send + 'static,
{
    pub(super) fn new<C: Codec>(
        call: Call,
        sender: CallSender<DispatchRequest>,
        receiver: CallReceiver,
        codec: C,
    ) -> Self {
        Self {
            sink: RequestSink::new(sender, codec.clone()),
            stream: ResponseStream::new(call, receiver, codec),
        }
    }

    /// Separates the request and response directions. Each half keeps the call alive; the call
    /// is canceled only once both are dropped before it closes.
    pub fn split(self) -> (RequestSink<Req>, ResponseStream<Resp>) {
        (self.sink, self.stream)
    }

    /// Runs `send` and `receive` as two tasks and waits for the call to close.
    ///
    /// The first of them to fail aborts the call with its error, which unblocks the other.
    /// Returns the call's terminal status once both tasks finished and the server closed the
    /// call.
    pub async fn drive<S, SFut, R, RFut>(self, send: S, receive: R) -> Status
    where
        S: FnOnce(RequestSink<Req>) -> SFut,
        SFut: Future<Output = Result<(), RpcError>> + Send + 'static,
        R: FnOnce(ResponseStream<Resp>) -> RFut,
        RFut: Future<Output = Result<(), Status>> + Send + 'static,
    {
        let call = self.call().clone();
        let (sink, stream) = self.split();

        let sending = tokio::spawn({
            let call = call.clone();
            let sending = send(sink);
            async move {
                match sending.await {
                    Ok(()) => {}
                    Err(RpcError::Status(status)) => {
                        call.fail(status);
                    }
                    Err(RpcError::InvalidState) => {
                        call.fail(Status::internal("sent a request after closing the call"));
                    }
                }
            }
        });
        let receiving = tokio::spawn({
            let call = call.clone();
            let receiving = receive(stream);
            async move {
                if let Err(status) = receiving.await {
                    call.fail(status);
                }
            }
        });

        for joined in [sending.await, receiving.await] {
            if let Err(e) = joined {
                call.fail(Status::internal(format!("a call task failed: {e}")));
            }
        }
        call.closed().await
    }
}

impl<Req, Resp> BidiStreamingCall<Req, Resp> {
    /// The underlying call.
    pub fn call(&self) -> &Call {
        self.stream.call()
    }

    /// Cancels the call.
    pub fn cancel(&self) -> Status {
        self.stream.cancel()
    }
}

impl<Req, Resp> fmt::Debug for BidiStreamingCall<Req, Resp> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BidiStreamingCall")
            .field("call", self.stream.call())
            .finish_non_exhaustive()
    }
}
