// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Provides a server that concurrently handles many connections sending multiplexed calls.

use crate::{
    cancellations::{cancellations, CallCancellation, CanceledCalls},
    engine::{self, Call, CallReceiver, CallSender, NewCall, Origin},
    ChannelError, ClientMessage, Codec, Open, ServerMessage, Status, Transport,
};
use futures::{prelude::*, ready, stream::Fuse, task::*};
use in_flight_calls::{AlreadyExistsError, CallData, InFlightCalls};
use pin_project::pin_project;
use std::{fmt, pin::Pin, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info_span, instrument::Instrument, Span};

mod in_flight_calls;
mod service;

/// Provides helper methods for streams of transports.
pub mod incoming;

pub use service::{Method, RequestStream, ResponseSink, Service};

/// Settings that control the behavior of [channels](BaseChannel).
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// Controls the buffer size of the in-process channel over which a server's handlers send
    /// response frames and closes to the [`BaseChannel`]. In other words, this is the number of
    /// messages that can sit in the outbound queue before handlers begin blocking.
    pub pending_response_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pending_response_buffer: 100,
        }
    }
}

impl Config {
    /// Returns a channel backed by `transport` and configured with `self`.
    pub fn channel<T>(self, transport: T) -> BaseChannel<T>
    where
        T: Transport<ServerMessage, ClientMessage>,
    {
        BaseChannel::new(self, transport)
    }
}

/// The server end of an open connection with a client. It reads opens, request frames and
/// cancellations off the wire, and writes the response frames and closes of its calls.
///
/// `BaseChannel` is a stream of [`InFlightCalls`](InFlightCall), one per call the client opens.
/// It also drives the writing of responses, so it must be continually polled to ensure progress.
/// [`execute`](BaseChannel::execute) does both, spawning a task per call.
///
/// Cancellation messages are not exposed. The channel handles them by aborting the corresponding
/// call, which stops its handler and cancels the handler's context.
#[pin_project]
pub struct BaseChannel<T> {
    config: Config,
    /// Writes responses to the wire and reads calls off the wire.
    #[pin]
    transport: Fuse<T>,
    /// Calls whose handlers were dropped before closing the call.
    canceled_calls: CanceledCalls,
    /// Notifies `canceled_calls` when a handler is dropped.
    call_cancellation: CallCancellation,
    /// Holds data necessary to route frames to, and clean up, in-flight calls.
    in_flight_calls: InFlightCalls,
    /// Response frames and closes waiting to be written to the wire.
    pending_responses: mpsc::Receiver<ServerMessage>,
    /// Handed out to handlers to fan in responses.
    responses_tx: mpsc::Sender<ServerMessage>,
}

impl<T> BaseChannel<T>
where
    T: Transport<ServerMessage, ClientMessage>,
{
    /// Creates a new channel backed by `transport` and configured with `config`.
    pub fn new(config: Config, transport: T) -> Self {
        let (call_cancellation, canceled_calls) = cancellations();
        let (responses_tx, pending_responses) = mpsc::channel(config.pending_response_buffer);
        BaseChannel {
            config,
            transport: transport.fuse(),
            canceled_calls,
            call_cancellation,
            in_flight_calls: InFlightCalls::default(),
            pending_responses,
            responses_tx,
        }
    }

    /// Creates a new channel backed by `transport` and configured with the defaults.
    pub fn with_defaults(transport: T) -> Self {
        Self::new(Config::default(), transport)
    }

    /// Returns the inner transport over which messages are sent and received.
    pub fn get_ref(&self) -> &T {
        self.transport.get_ref()
    }

    /// Configuration of the channel.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Returns the number of calls the channel is tracking.
    pub fn in_flight_calls(&self) -> usize {
        self.in_flight_calls.len()
    }

    /// Runs every call the client opens on its own task, handling it with `service`, until the
    /// connection closes.
    ///
    /// If the channel encounters an error, it stops and the error is logged.
    pub async fn execute<C: Codec>(self, service: Service<C>) {
        let channel = self;
        futures::pin_mut!(channel);
        while let Some(call) = channel.next().await {
            match call {
                Ok(call) => {
                    tokio::spawn(call.execute(&service));
                }
                Err(e) => {
                    tracing::warn!("Channel errored out: {}", e);
                    break;
                }
            }
        }
    }

    fn in_flight_calls_mut<'a>(self: &'a mut Pin<&mut Self>) -> &'a mut InFlightCalls {
        self.as_mut().project().in_flight_calls
    }

    fn canceled_calls_mut<'a>(self: &'a mut Pin<&mut Self>) -> &'a mut CanceledCalls {
        self.as_mut().project().canceled_calls
    }

    fn pending_responses_mut<'a>(
        self: &'a mut Pin<&mut Self>,
    ) -> &'a mut mpsc::Receiver<ServerMessage> {
        self.as_mut().project().pending_responses
    }

    fn transport_pin_mut<'a>(self: &'a mut Pin<&mut Self>) -> Pin<&'a mut Fuse<T>> {
        self.as_mut().project().transport
    }

    fn start_call(mut self: Pin<&mut Self>, open: Open) -> Option<InFlightCall> {
        let Open {
            call_id,
            method,
            shape,
            mut context,
        } = open;
        let span = info_span!(
            "RPC",
            rpc.call_id = call_id,
            rpc.method = %method,
            rpc.shape = shape.name(),
            rpc.trace_id = %context.trace_id(),
            rpc.deadline = tracing::field::Empty,
            otel.kind = "server",
        );
        if let Some(deadline) = context.deadline {
            span.record(
                "rpc.deadline",
                &tracing::field::display(humantime::format_rfc3339(deadline)),
            );
        }
        context.trace_context = context.trace_context.new_child();
        let cancellation = CancellationToken::new();
        let context = context.with_cancellation(cancellation.clone());

        let entered = span.enter();
        tracing::info!("ReceiveCall");
        let NewCall {
            call,
            sender,
            receiver,
            route,
        } = engine::new_call(
            call_id,
            shape,
            context,
            self.responses_tx.clone(),
            None,
            span.clone(),
        );
        let data = CallData::new(call.downgrade(), route, cancellation, span.clone());
        match self.in_flight_calls_mut().start_call(call_id, data) {
            Ok(()) => {
                drop(entered);
                Some(InFlightCall {
                    method,
                    call,
                    sender,
                    receiver,
                    span,
                    guard: HandlerGuard {
                        call_cancellation: self.call_cancellation.clone(),
                        call_id,
                        cancel: true,
                    },
                })
            }
            Err(AlreadyExistsError) => {
                // The call with this ID is already being handled; a second open is ignored.
                tracing::trace!("DuplicateCall");
                None
            }
        }
    }

    /// Reads the next message off the wire and acts on it. Yields a call iff the message opened
    /// one.
    fn pump_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Option<InFlightCall>, ChannelError<T::Error>>>> {
        let message = match ready!(self.transport_pin_mut().poll_next(cx)) {
            Some(Ok(message)) => message,
            Some(Err(e)) => {
                let e = Arc::new(e);
                let status = Status::unknown(format!("could not read from the transport: {e}"));
                self.in_flight_calls_mut().abort_all(&status);
                return Poll::Ready(Some(Err(ChannelError::Read(e))));
            }
            None => {
                self.in_flight_calls_mut()
                    .abort_all(&Status::unknown("the client closed the connection"));
                return Poll::Ready(None);
            }
        };
        let call = match message {
            ClientMessage::Open(open) => self.as_mut().start_call(open),
            ClientMessage::Frame { call_id, frame } => {
                if !self.in_flight_calls_mut().route_frame(call_id, frame) {
                    tracing::trace!(
                        rpc.call_id = call_id,
                        "Dropping a frame of a call that is no longer in flight."
                    );
                }
                None
            }
            ClientMessage::Cancel {
                trace_context,
                call_id,
            } => {
                match self.in_flight_calls_mut().cancel_call(call_id) {
                    Some(span) => {
                        let _entered = span.enter();
                        tracing::info!("ReceiveCancel");
                    }
                    None => tracing::trace!(
                        rpc.trace_id = %trace_context.trace_id,
                        "Received cancellation, but the call is already complete.",
                    ),
                }
                None
            }
        };
        Poll::Ready(Some(Ok(call)))
    }

    fn pump_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(), ChannelError<T::Error>>>> {
        match self.as_mut().poll_next_response(cx)? {
            Poll::Ready(Some(message)) => {
                // A Ready result from poll_next_response means the transport is ready to be
                // written to. Therefore, we can call start_send without worry of a full buffer.
                self.start_send(message)?;
                Poll::Ready(Some(Ok(())))
            }
            Poll::Ready(None) => {
                // Shutdown can't be done before we finish pumping out remaining responses.
                ready!(self.poll_flush(cx)?);
                Poll::Ready(None)
            }
            Poll::Pending => {
                // No more responses to write, so flush any buffered in the transport.
                ready!(self.poll_flush(cx)?);
                Poll::Pending
            }
        }
    }

    /// Yields a response ready to be written to the wire: the close of a call whose handler was
    /// dropped, or a message from a handler of a call still in flight.
    ///
    /// Note that a response will only be yielded if the transport is *ready* to be written to
    /// (i.e. start_send would succeed).
    fn poll_next_response(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<ServerMessage, ChannelError<T::Error>>>> {
        ready!(self.ensure_writeable(cx)?);

        // Ready(None) can't happen, since `self` holds a CallCancellation.
        while let Poll::Ready(Some(call_id)) = self.canceled_calls_mut().poll_recv(cx) {
            let status = Status::unknown("the server stopped handling the call");
            if let Some(span) = self.in_flight_calls_mut().abort_call(call_id, status.clone()) {
                let _entered = span.enter();
                tracing::info!("ResponseCancelled");
                return Poll::Ready(Some(Ok(ServerMessage::Close { call_id, status })));
            }
        }

        loop {
            match ready!(self.pending_responses_mut().poll_recv(cx)) {
                Some(message) => {
                    if self.in_flight_calls.contains(message.call_id()) {
                        return Poll::Ready(Some(Ok(message)));
                    }
                    // The call was canceled or aborted; the client isn't waiting anymore.
                    tracing::trace!(
                        rpc.call_id = message.call_id(),
                        "Dropping a response of a call that is no longer in flight."
                    );
                }
                // This branch likely won't happen, since the channel is holding a Sender.
                None => return Poll::Ready(None),
            }
        }
    }

    /// Returns Ready if writing a message to the transport would not fail due to a full buffer.
    /// If the transport is not ready to be written to, flushes it until it is ready.
    fn ensure_writeable<'a>(
        self: &'a mut Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(), ChannelError<T::Error>>>> {
        while self
            .transport_pin_mut()
            .poll_ready(cx)
            .map_err(ChannelError::Ready)?
            .is_pending()
        {
            ready!(self.poll_flush(cx)?);
        }
        Poll::Ready(Some(Ok(())))
    }

    fn start_send(
        self: &mut Pin<&mut Self>,
        message: ServerMessage,
    ) -> Result<(), ChannelError<T::Error>> {
        if let ServerMessage::Close { call_id, status } = &message {
            if let Some(span) = self.in_flight_calls_mut().remove_call(*call_id) {
                let _entered = span.enter();
                tracing::info!(code = %status.code(), "SendClose");
            }
        }
        self.transport_pin_mut()
            .start_send(message)
            .map_err(ChannelError::Write)
    }

    fn poll_flush(
        self: &mut Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), ChannelError<T::Error>>> {
        self.transport_pin_mut()
            .poll_flush(cx)
            .map_err(ChannelError::Flush)
    }
}

impl<T> fmt::Debug for BaseChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BaseChannel")
            .field("in_flight_calls", &self.in_flight_calls.len())
            .finish_non_exhaustive()
    }
}

impl<T> Stream for BaseChannel<T>
where
    T: Transport<ServerMessage, ClientMessage>,
{
    type Item = Result<InFlightCall, ChannelError<T::Error>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            let read = self.as_mut().pump_read(cx)?;
            if matches!(read, Poll::Ready(None)) && self.in_flight_calls.is_empty() {
                // Every call was aborted along with the read half, so nothing is left to write.
                tracing::trace!("read: Poll::Ready(None), no calls in flight");
                return Poll::Ready(None);
            }
            let write = self.as_mut().pump_write(cx)?;
            match (read, write) {
                (Poll::Ready(Some(Some(call))), _) => {
                    tracing::trace!("read: Poll::Ready(Some), write: _");
                    return Poll::Ready(Some(Ok(call)));
                }
                (Poll::Ready(Some(None)), _) | (_, Poll::Ready(Some(()))) => {}
                (_, Poll::Ready(None)) => {
                    tracing::trace!("read: _, write: Poll::Ready(None)");
                    return Poll::Ready(None);
                }
                (read, write) => {
                    tracing::trace!(
                        "read pending: {}, write pending: {}",
                        read.is_pending(),
                        write.is_pending()
                    );
                    return Poll::Pending;
                }
            }
        }
    }
}

/// A fail-safe that closes a call on the client's behalf if its handler is dropped before it
/// finishes.
#[derive(Debug)]
struct HandlerGuard {
    call_cancellation: CallCancellation,
    call_id: u64,
    cancel: bool,
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        if self.cancel {
            self.call_cancellation.cancel(self.call_id);
        }
    }
}

/// A call opened by the client, produced by a [`BaseChannel`].
///
/// If dropped without calling [`execute`](InFlightCall::execute), the channel closes the call
/// with [`Unknown`](crate::Code::Unknown).
pub struct InFlightCall {
    method: String,
    call: Call,
    sender: CallSender<ServerMessage>,
    receiver: CallReceiver,
    span: Span,
    guard: HandlerGuard,
}

impl InFlightCall {
    /// The name of the method the client asked for.
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The call.
    pub fn call(&self) -> &Call {
        &self.call
    }

    /// Returns a [future](Future) that handles the call with the method `service` registered
    /// under the call's method name. The handler runs in the scope of the call's context, and
    /// the call's terminal status is sent back to the [`BaseChannel`] that yielded the call.
    ///
    /// The handler stops when the first of the following happens:
    ///
    /// 1. The channel receives a [cancellation message](ClientMessage::Cancel) for the call.
    /// 2. The call's [deadline](crate::context::Context::deadline) is reached.
    /// 3. The call fails, e.g. because a request could not be decoded.
    /// 4. The handler returns.
    ///
    /// A method that is not registered, or is registered with a different shape than the client
    /// asked for, closes the call with [`Unknown`](crate::Code::Unknown).
    pub fn execute<C: Codec>(self, service: &Service<C>) -> impl Future<Output = ()> + Send {
        let method = match service.method(&self.method) {
            Some(method) if method.shape() == self.call.shape() => Ok(method.clone()),
            Some(method) => Err(Status::unknown(format!(
                "method {} is {}, not {}",
                self.method,
                method.shape().name(),
                self.call.shape().name()
            ))),
            None => Err(Status::unknown(format!("unknown method {}", self.method))),
        };
        let Self {
            call,
            sender,
            receiver,
            span,
            guard,
            ..
        } = self;

        async move {
            // Moves the whole guard into the future, so it lives until the call is closed.
            let mut guard = guard;
            let outbound = sender.outbound();
            let ctx = call.context().clone();
            let status = match method {
                Ok(method) => {
                    tracing::info!("BeginCall");
                    let handling = ctx.clone().scope(method.serve(ctx.clone(), sender, receiver));
                    tokio::select! {
                        biased;
                        status = ctx.done() => status,
                        status = call.closed() => status,
                        handled = handling => match handled {
                            Ok(()) => Status::ok(),
                            Err(status) => status,
                        },
                    }
                }
                Err(status) => status,
            };
            let status = call.finish(status, Origin::Local);
            tracing::info!("CompleteCall");
            let close = ServerMessage::Close {
                call_id: call.id(),
                status,
            };
            if outbound.send(close).await.is_err() {
                tracing::trace!("Dropping the close of a call whose channel is gone.");
            } else {
                tracing::info!("BufferClose");
            }
            // The channel owns the call's cleanup from here: it removes the call once the close
            // is written, or has already removed it if the client canceled.
            guard.cancel = false;
        }
        .instrument(span)
    }
}

impl fmt::Debug for InFlightCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InFlightCall")
            .field("method", &self.method)
            .field("call", &self.call)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::{BaseChannel, Config, ResponseSink, Service};
    use crate::{
        context,
        transport::channel::{self, UnboundedChannel},
        CallShape, ClientMessage, Code, Frame, Json, Open, ServerMessage, Status,
    };
    use assert_matches::assert_matches;
    use futures::prelude::*;
    use futures_test::task::noop_context;
    use std::{task::Poll, time::Duration};

    type ClientChannel = UnboundedChannel<ServerMessage, ClientMessage>;

    fn test_channel() -> (
        BaseChannel<UnboundedChannel<ClientMessage, ServerMessage>>,
        ClientChannel,
    ) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let (client_channel, server_channel) = channel::unbounded();
        (
            Config::default().channel(server_channel),
            client_channel,
        )
    }

    fn open(call_id: u64, method: &str, shape: CallShape, ctx: context::Context) -> ClientMessage {
        ClientMessage::Open(Open {
            call_id,
            method: method.to_owned(),
            shape,
            context: ctx,
        })
    }

    fn request(call_id: u64, ordinal: u64, message: &str, terminal: bool) -> ClientMessage {
        ClientMessage::Frame {
            call_id,
            frame: Frame {
                ordinal,
                payload: Some(serde_json::to_vec(message).unwrap()),
                terminal,
            },
        }
    }

    fn greeter() -> Service<Json> {
        Service::new(Json)
            .unary("Greet", |_, name: String| async move {
                Ok(format!("Hello {name}"))
            })
            .server_streaming(
                "GreetForever",
                |_, name: String, mut sink: ResponseSink<String>| async move {
                    loop {
                        sink.send(&format!("Hello {name}")).await?;
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            )
            .unary("Sleep", |_, millis: u64| async move {
                tokio::time::sleep(Duration::from_millis(millis)).await;
                Ok(())
            })
    }

    #[tokio::test]
    async fn base_channel_poll_next_yields_call() {
        let (mut channel, mut client) = test_channel();
        client
            .send(open(0, "Greet", CallShape::Unary, context::current()))
            .await
            .unwrap();

        assert_matches!(channel.poll_next_unpin(&mut noop_context()),
                        Poll::Ready(Some(Ok(call)))
                        if call.method() == "Greet" && call.call().id() == 0
                        && call.call().shape() == CallShape::Unary);
        assert_eq!(channel.in_flight_calls(), 1);
    }

    #[tokio::test]
    async fn base_channel_ignores_duplicate_open() {
        let (mut channel, mut client) = test_channel();
        client
            .send(open(0, "Greet", CallShape::Unary, context::current()))
            .await
            .unwrap();
        client
            .send(open(0, "Greet", CallShape::Unary, context::current()))
            .await
            .unwrap();

        let _call = channel.next().await;
        assert_matches!(channel.poll_next_unpin(&mut noop_context()), Poll::Pending);
        assert_eq!(channel.in_flight_calls(), 1);
    }

    #[tokio::test]
    async fn base_channel_poll_next_aborts_canceled_call() {
        let (mut channel, mut client) = test_channel();
        client
            .send(open(0, "Greet", CallShape::Unary, context::current()))
            .await
            .unwrap();
        let call = channel.next().await.unwrap().unwrap();

        client
            .send(ClientMessage::Cancel {
                trace_context: context::current().trace_context,
                call_id: 0,
            })
            .await
            .unwrap();
        assert_matches!(channel.poll_next_unpin(&mut noop_context()), Poll::Pending);
        assert_eq!(channel.in_flight_calls(), 0);
        assert!(call.call().context().is_canceled());
        assert_matches!(call.call().status(), Some(status) if status.code() == Code::Canceled);
    }

    #[tokio::test]
    async fn base_channel_with_closed_transport_and_no_in_flight_calls_returns_closed() {
        let (mut channel, client) = test_channel();
        drop(client);
        assert_matches!(channel.poll_next_unpin(&mut noop_context()), Poll::Ready(None));
    }

    #[tokio::test]
    async fn closed_transport_aborts_calls_in_flight() {
        let (mut channel, mut client) = test_channel();
        client
            .send(open(0, "Greet", CallShape::Unary, context::current()))
            .await
            .unwrap();
        let call = channel.next().await.unwrap().unwrap();
        drop(client);

        assert_matches!(channel.next().await, None);
        assert_matches!(call.call().status(), Some(status) if status.code() == Code::Unknown);
    }

    #[tokio::test]
    async fn execute_writes_responses_before_close() {
        let (channel, mut client) = test_channel();
        tokio::spawn(channel.execute(greeter()));

        client
            .send(open(0, "Greet", CallShape::Unary, context::current()))
            .await
            .unwrap();
        client.send(request(0, 0, "Franco", true)).await.unwrap();

        assert_matches!(client.next().await,
                        Some(Ok(ServerMessage::Frame { call_id: 0, frame }))
                        if frame.ordinal == 0 && !frame.terminal
                        && frame.payload.as_deref() == Some(&b"\"Hello Franco\""[..]));
        assert_matches!(client.next().await,
                        Some(Ok(ServerMessage::Close { call_id: 0, status })) if status.is_ok());
    }

    #[tokio::test]
    async fn unknown_method_and_wrong_shape_are_unknown() {
        let (channel, mut client) = test_channel();
        tokio::spawn(channel.execute(greeter()));

        client
            .send(open(0, "Farewell", CallShape::Unary, context::current()))
            .await
            .unwrap();
        assert_matches!(client.next().await,
                        Some(Ok(ServerMessage::Close { call_id: 0, status }))
                        if status.code() == Code::Unknown);

        client
            .send(open(1, "Greet", CallShape::BidiStreaming, context::current()))
            .await
            .unwrap();
        assert_matches!(client.next().await,
                        Some(Ok(ServerMessage::Close { call_id: 1, status }))
                        if status.code() == Code::Unknown);
    }

    #[tokio::test]
    async fn missing_request_is_invalid_argument() {
        let (channel, mut client) = test_channel();
        tokio::spawn(channel.execute(greeter()));

        client
            .send(open(0, "Greet", CallShape::Unary, context::current()))
            .await
            .unwrap();
        client
            .send(ClientMessage::Frame {
                call_id: 0,
                frame: Frame {
                    ordinal: 0,
                    payload: None,
                    terminal: true,
                },
            })
            .await
            .unwrap();
        assert_matches!(client.next().await,
                        Some(Ok(ServerMessage::Close { call_id: 0, status }))
                        if status.code() == Code::InvalidArgument);
    }

    #[tokio::test]
    async fn cancel_stops_handler_and_suppresses_close() {
        let (channel, mut client) = test_channel();
        tokio::spawn(channel.execute(greeter()));

        client
            .send(open(0, "GreetForever", CallShape::ServerStreaming, context::current()))
            .await
            .unwrap();
        client.send(request(0, 0, "Franco", true)).await.unwrap();
        assert_matches!(client.next().await, Some(Ok(ServerMessage::Frame { call_id: 0, .. })));

        client
            .send(ClientMessage::Cancel {
                trace_context: context::current().trace_context,
                call_id: 0,
            })
            .await
            .unwrap();
        // Frames already written may still arrive, but nothing follows them: not even a close.
        client
            .send(open(1, "Greet", CallShape::Unary, context::current()))
            .await
            .unwrap();
        client.send(request(1, 0, "David", true)).await.unwrap();
        loop {
            match client.next().await {
                Some(Ok(ServerMessage::Frame { call_id: 0, .. })) => continue,
                Some(Ok(ServerMessage::Frame { call_id: 1, .. })) => break,
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert_matches!(client.next().await,
                        Some(Ok(ServerMessage::Close { call_id: 1, status })) if status.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_closes_call_with_deadline_exceeded() {
        let (channel, mut client) = test_channel();
        tokio::spawn(channel.execute(greeter()));

        let ctx = context::current().with_timeout(Duration::from_secs(1));
        client
            .send(open(0, "Sleep", CallShape::Unary, ctx))
            .await
            .unwrap();
        client
            .send(ClientMessage::Frame {
                call_id: 0,
                frame: Frame {
                    ordinal: 0,
                    payload: Some(b"3000".to_vec()),
                    terminal: true,
                },
            })
            .await
            .unwrap();
        assert_matches!(client.next().await,
                        Some(Ok(ServerMessage::Close { call_id: 0, status }))
                        if status.code() == Code::DeadlineExceeded);
    }

    #[tokio::test(start_paused = true)]
    async fn handler_that_awaits_closes_call_ok() {
        let (channel, mut client) = test_channel();
        tokio::spawn(channel.execute(greeter()));

        client
            .send(open(0, "Sleep", CallShape::Unary, context::current()))
            .await
            .unwrap();
        client
            .send(ClientMessage::Frame {
                call_id: 0,
                frame: Frame {
                    ordinal: 0,
                    payload: Some(b"20".to_vec()),
                    terminal: true,
                },
            })
            .await
            .unwrap();
        assert_matches!(client.next().await,
                        Some(Ok(ServerMessage::Frame { call_id: 0, frame }))
                        if frame.payload.as_deref() == Some(&b"null"[..]));
        assert_matches!(client.next().await,
                        Some(Ok(ServerMessage::Close { call_id: 0, status })) if status.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn streaming_handler_keeps_sending_across_awaits() {
        let (channel, mut client) = test_channel();
        tokio::spawn(channel.execute(greeter()));

        client
            .send(open(0, "GreetForever", CallShape::ServerStreaming, context::current()))
            .await
            .unwrap();
        client.send(request(0, 0, "Franco", true)).await.unwrap();
        for ordinal in 0..3 {
            assert_matches!(client.next().await,
                            Some(Ok(ServerMessage::Frame { call_id: 0, frame }))
                            if frame.ordinal == ordinal
                            && frame.payload.as_deref() == Some(&b"\"Hello Franco\""[..]));
        }
    }

    #[tokio::test]
    async fn execute_finishes_when_channel_is_gone() {
        let (mut channel, mut client) = test_channel();
        client
            .send(open(0, "Greet", CallShape::Unary, context::current()))
            .await
            .unwrap();
        let call = channel.next().await.unwrap().unwrap();
        let handle = call.call().clone();
        drop(channel);

        let executed = tokio::time::timeout(Duration::from_secs(1), call.execute(&greeter())).await;
        assert_matches!(executed, Ok(()));
        assert_matches!(handle.status(), Some(status) if status.code() == Code::Unknown);
    }

    #[tokio::test]
    async fn dropped_call_is_closed_with_unknown() {
        let (mut channel, mut client) = test_channel();
        client
            .send(open(4, "Greet", CallShape::Unary, context::current()))
            .await
            .unwrap();
        let call = channel.next().await.unwrap().unwrap();
        drop(call);

        assert_matches!(channel.poll_next_unpin(&mut noop_context()), Poll::Pending);
        assert_eq!(channel.in_flight_calls(), 0);
        assert_matches!(client.next().await,
                        Some(Ok(ServerMessage::Close { call_id: 4, status }))
                        if status == Status::unknown("the server stopped handling the call"));
    }
}
