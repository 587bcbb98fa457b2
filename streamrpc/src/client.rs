// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Provides a client that connects to a server and makes multiplexed calls of every shape.

mod calls;
mod in_flight_calls;

pub use calls::{BidiStreamingCall, ClientStreamingCall, RequestSink, ResponseStream};

use crate::{
    cancellations::{cancellations, CallCancellation, CanceledCalls},
    context,
    engine::{self, Call, CallReceiver, CallSender, NewCall, Origin, Outgoing},
    trace, CallShape, ChannelError, ClientMessage, Codec, Frame, Open, RpcError, ServerMessage,
    Status, Transport,
};
use futures::{prelude::*, ready, stream::Fuse, task::*};
use in_flight_calls::{CallData, InFlightCalls};
use pin_project::pin_project;
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::sync::{mpsc, Semaphore};
use tracing::Span;

/// Settings that control the behavior of the client.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct Config {
    /// The number of calls that can be open at once. Opening another call waits until one of
    /// them closes.
    pub max_in_flight_calls: usize,
    /// The number of messages that can be buffered client-side before being written to the
    /// transport. Senders block once the buffer is full.
    pub pending_request_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            max_in_flight_calls: 1_000,
            pending_request_buffer: 100,
        }
    }
}

/// A channel and dispatch pair. The dispatch drives the sending and receiving of messages
/// and must be polled continuously or spawned.
pub struct NewClient<C, D> {
    /// The new client.
    pub client: C,
    /// The client's dispatch.
    pub dispatch: D,
}

impl<C, D, E> NewClient<C, D>
where
    D: Future<Output = Result<(), E>> + Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    /// Helper method to spawn the dispatch on the default executor.
    pub fn spawn(self) -> C {
        let dispatch = self.dispatch.unwrap_or_else(move |e| {
            let e = anyhow::Error::new(e);
            tracing::warn!("Connection broken: {:?}", e);
        });
        tokio::spawn(dispatch);
        self.client
    }
}

impl<C, D> fmt::Debug for NewClient<C, D> {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "NewClient")
    }
}

const SHUTDOWN: &str = "the connection to the server was already shut down";

/// Opens calls over a single connection. Cheap to clone; all clones share the connection.
#[derive(Clone)]
pub struct Channel<C> {
    to_dispatch: mpsc::Sender<DispatchRequest>,
    /// Channel to send a cancel message to the dispatcher.
    cancellation: CallCancellation,
    /// The ID to use for the next call to open.
    next_call_id: Arc<AtomicU64>,
    /// One permit per call in flight.
    permits: Arc<Semaphore>,
    codec: C,
}

impl<C> fmt::Debug for Channel<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("next_call_id", &self.next_call_id)
            .field("available_calls", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl<C: Codec> Channel<C> {
    /// Makes a call with one request and one response.
    ///
    /// Fails with the call's terminal status if the server answers with a non-OK status, the
    /// context is canceled or its deadline passes first, or the connection breaks.
    pub async fn unary<Req, Resp>(
        &self,
        ctx: context::Context,
        method: &str,
        request: &Req,
    ) -> Result<Resp, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let (call, mut sender, mut receiver) = self.open(ctx, method, CallShape::Unary).await?;
        let payload = self.encode(&call, request)?;
        sender.send_last(payload).await?;
        let codec = self.codec.clone();
        calls::single_response(&call, &mut receiver, move |payload| codec.decode(payload)).await
    }

    /// Makes a call with one request and a stream of responses. Dropping the stream before it
    /// ends cancels the call.
    pub async fn server_streaming<Req, Resp>(
        &self,
        ctx: context::Context,
        method: &str,
        request: &Req,
    ) -> Result<ResponseStream<Resp>, RpcError>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned + Send + 'static,
    {
        let (call, mut sender, receiver) = self
            .open(ctx, method, CallShape::ServerStreaming)
            .await?;
        let payload = self.encode(&call, request)?;
        sender.send_last(payload).await?;
        Ok(ResponseStream::new(call, receiver, self.codec.clone()))
    }

    /// Opens a call that takes a stream of requests and answers with one response once the
    /// requests are done.
    pub async fn client_streaming<Req, Resp>(
        &self,
        ctx: context::Context,
        method: &str,
    ) -> Result<ClientStreamingCall<Req, Resp>, RpcError>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        let (_, sender, receiver) = self
            .open(ctx, method, CallShape::ClientStreaming)
            .await?;
        Ok(ClientStreamingCall::new(sender, receiver, self.codec.clone()))
    }

    /// Opens a call whose request and response streams progress independently.
    pub async fn bidi_streaming<Req, Resp>(
        &self,
        ctx: context::Context,
        method: &str,
    ) -> Result<BidiStreamingCall<Req, Resp>, RpcError>
    where
        Req: Serialize + Send + 'static,
        Resp: DeserializeOwned + Send + 'static,
    {
        let (call, sender, receiver) = self.open(ctx, method, CallShape::BidiStreaming).await?;
        Ok(BidiStreamingCall::new(
            call,
            sender,
            receiver,
            self.codec.clone(),
        ))
    }

    fn encode<T: Serialize + ?Sized>(&self, call: &Call, message: &T) -> Result<Vec<u8>, Status> {
        self.codec
            .encode(&message)
            .map_err(|e| call.fail(e.into()))
    }

    /// Registers a new call with the dispatch, which writes its open message ahead of any of its
    /// frames.
    async fn open(
        &self,
        mut ctx: context::Context,
        method: &str,
        shape: CallShape,
    ) -> Result<(Call, CallSender<DispatchRequest>, CallReceiver), Status> {
        if let Some(status) = ctx.err() {
            return Err(status);
        }
        ctx.trace_context = ctx.trace_context.new_child();
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let span = tracing::info_span!(
            "RPC",
            rpc.call_id = call_id,
            rpc.method = method,
            rpc.shape = shape.name(),
            rpc.trace_id = %ctx.trace_id(),
            rpc.deadline = tracing::field::Empty,
            otel.kind = "client",
        );
        if let Some(deadline) = ctx.deadline {
            span.record(
                "rpc.deadline",
                &tracing::field::display(humantime::format_rfc3339(deadline)),
            );
        }

        let permit = tokio::select! {
            biased;
            status = ctx.done() => return Err(status),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| Status::unknown(SHUTDOWN))?
            }
        };

        let NewCall {
            call,
            sender,
            receiver,
            route,
        } = engine::new_call(
            call_id,
            shape,
            ctx.clone(),
            self.to_dispatch.clone(),
            Some(self.cancellation.clone()),
            span.clone(),
        );
        let open = DispatchRequest::Open(Box::new(OpenCall {
            data: CallData::new(
                call.downgrade(),
                route,
                ctx.trace_context,
                span.clone(),
                permit,
            ),
            open: Open {
                call_id,
                method: method.to_owned(),
                shape,
                context: ctx.clone(),
            },
        }));
        {
            let _entered = span.enter();
            tracing::info!("OpenCall");
        }
        tokio::select! {
            biased;
            status = ctx.done() => return Err(call.finish(status, Origin::Local)),
            sent = self.to_dispatch.send(open) => {
                if sent.is_err() {
                    return Err(call.finish(Status::unknown(SHUTDOWN), Origin::Remote));
                }
            }
        }
        Ok((call, sender, receiver))
    }
}

/// Returns a channel and dispatcher that manages the lifecycle of calls initiated by the
/// channel. Payloads are encoded with `codec`, which must match the server's.
pub fn new<C, T>(config: Config, transport: T, codec: C) -> NewClient<Channel<C>, CallDispatch<T>>
where
    C: Codec,
    T: Transport<ClientMessage, ServerMessage>,
{
    let (to_dispatch, pending_messages) = mpsc::channel(config.pending_request_buffer);
    let (cancellation, canceled_calls) = cancellations();

    NewClient {
        client: Channel {
            to_dispatch,
            cancellation,
            next_call_id: Arc::new(AtomicU64::new(0)),
            permits: Arc::new(Semaphore::new(config.max_in_flight_calls)),
            codec,
        },
        dispatch: CallDispatch {
            canceled_calls,
            transport: transport.fuse(),
            in_flight_calls: InFlightCalls::default(),
            pending_messages,
        },
    }
}

/// Handles the lifecycle of calls, writing opens and request frames to the wire, managing
/// cancellations, and routing response frames and closes to the appropriate call.
#[must_use]
#[pin_project]
pub struct CallDispatch<T> {
    /// Writes requests to the wire and reads responses off the wire.
    #[pin]
    transport: Fuse<T>,
    /// Messages waiting to be written to the wire.
    pending_messages: mpsc::Receiver<DispatchRequest>,
    /// Calls that were aborted locally or abandoned.
    canceled_calls: CanceledCalls,
    /// Calls already opened on the wire that the server hasn't closed yet.
    in_flight_calls: InFlightCalls,
}

impl<T> fmt::Debug for CallDispatch<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallDispatch")
            .field("in_flight_calls", &self.in_flight_calls.len())
            .finish_non_exhaustive()
    }
}

impl<T> CallDispatch<T>
where
    T: Transport<ClientMessage, ServerMessage>,
{
    fn in_flight_calls<'a>(self: &'a mut Pin<&mut Self>) -> &'a mut InFlightCalls {
        self.as_mut().project().in_flight_calls
    }

    fn transport_pin_mut<'a>(self: &'a mut Pin<&mut Self>) -> Pin<&'a mut Fuse<T>> {
        self.as_mut().project().transport
    }

    fn poll_ready(
        self: &mut Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), ChannelError<T::Error>>> {
        self.transport_pin_mut()
            .poll_ready(cx)
            .map_err(ChannelError::Ready)
    }

    fn start_send(
        self: &mut Pin<&mut Self>,
        message: ClientMessage,
    ) -> Result<(), ChannelError<T::Error>> {
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

    fn poll_close(
        self: &mut Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), ChannelError<T::Error>>> {
        self.transport_pin_mut()
            .poll_close(cx)
            .map_err(ChannelError::Close)
    }

    fn canceled_calls_mut<'a>(self: &'a mut Pin<&mut Self>) -> &'a mut CanceledCalls {
        self.as_mut().project().canceled_calls
    }

    fn pending_messages_mut<'a>(
        self: &'a mut Pin<&mut Self>,
    ) -> &'a mut mpsc::Receiver<DispatchRequest> {
        self.as_mut().project().pending_messages
    }

    fn pump_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(), ChannelError<T::Error>>>> {
        self.transport_pin_mut()
            .poll_next(cx)
            .map_err(|e| {
                let e = Arc::new(e);
                let status = Status::unknown(format!("could not read from the transport: {e}"));
                self.in_flight_calls().abort_all(&status);
                ChannelError::Read(e)
            })
            .map_ok(|message| self.receive(message))
    }

    fn pump_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(), ChannelError<T::Error>>>> {
        enum ReceiverStatus {
            Pending,
            Closed,
        }

        let pending_messages_status = match self.poll_write_message(cx)? {
            Poll::Ready(Some(())) => return Poll::Ready(Some(Ok(()))),
            Poll::Ready(None) => ReceiverStatus::Closed,
            Poll::Pending => ReceiverStatus::Pending,
        };

        let canceled_calls_status = match self.poll_write_cancel(cx)? {
            Poll::Ready(Some(())) => return Poll::Ready(Some(Ok(()))),
            Poll::Ready(None) => ReceiverStatus::Closed,
            Poll::Pending => ReceiverStatus::Pending,
        };

        match (pending_messages_status, canceled_calls_status) {
            (ReceiverStatus::Closed, ReceiverStatus::Closed) => {
                ready!(self.poll_close(cx)?);
                Poll::Ready(None)
            }
            (ReceiverStatus::Pending, _) | (_, ReceiverStatus::Pending) => {
                // No more messages to process, so flush any messages buffered in the transport.
                ready!(self.poll_flush(cx)?);

                // Even if we fully-flush, we return Pending, because we have no more messages
                // or cancellations right now.
                Poll::Pending
            }
        }
    }

    /// Yields the next message to write, if one is ready to be sent.
    ///
    /// Note that a message will only be yielded if the transport is *ready* to be written to (i.e.
    /// start_send would succeed).
    fn poll_next_message(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<ClientMessage, ChannelError<T::Error>>>> {
        ready!(self.ensure_writeable(cx)?);

        loop {
            match ready!(self.pending_messages_mut().poll_recv(cx)) {
                Some(DispatchRequest::Open(open_call)) => {
                    let OpenCall { open, data } = *open_call;
                    if !data.is_live() {
                        let _entered = data.span().enter();
                        tracing::info!("AbortCall");
                        continue;
                    }
                    let call_id = open.call_id;
                    if self.in_flight_calls().insert_call(call_id, data).is_err() {
                        tracing::warn!(rpc.call_id = call_id, "DuplicateCallId");
                        continue;
                    }
                    return Poll::Ready(Some(Ok(ClientMessage::Open(open))));
                }
                Some(DispatchRequest::Message(message)) => {
                    // Frames of a call that already ended have nowhere to go.
                    if !self.in_flight_calls().contains(message.call_id()) {
                        continue;
                    }
                    return Poll::Ready(Some(Ok(message)));
                }
                None => return Poll::Ready(None),
            }
        }
    }

    /// Yields the next pending cancellation, and, if one is ready, stops tracking the associated
    /// call.
    ///
    /// Note that a cancellation will only be yielded if the transport is *ready* to be written to
    /// (i.e. start_send would succeed).
    fn poll_next_cancellation(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(trace::Context, Span, u64), ChannelError<T::Error>>>> {
        ready!(self.ensure_writeable(cx)?);

        loop {
            match ready!(self.canceled_calls_mut().poll_recv(cx)) {
                Some(call_id) => {
                    if let Some((trace_context, span)) = self.in_flight_calls().cancel_call(call_id)
                    {
                        return Poll::Ready(Some(Ok((trace_context, span, call_id))));
                    }
                }
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
        while self.poll_ready(cx)?.is_pending() {
            ready!(self.poll_flush(cx)?);
        }
        Poll::Ready(Some(Ok(())))
    }

    fn poll_write_message<'a>(
        self: &'a mut Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(), ChannelError<T::Error>>>> {
        let message = match ready!(self.as_mut().poll_next_message(cx)?) {
            Some(message) => message,
            None => return Poll::Ready(None),
        };
        let call_id = message.call_id();
        // poll_next_message only returns Ready if there is room to buffer another message.
        if let Err(e) = self.start_send(message) {
            let e = anyhow::Error::new(e);
            if let Some(span) = self
                .in_flight_calls()
                .complete_call(call_id, Status::unknown(format!("{e:#}")))
            {
                let _entered = span.enter();
                tracing::info!("SendError");
            }
        }
        Poll::Ready(Some(Ok(())))
    }

    fn poll_write_cancel<'a>(
        self: &'a mut Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<(), ChannelError<T::Error>>>> {
        let (trace_context, span, call_id) =
            match ready!(self.as_mut().poll_next_cancellation(cx)?) {
                Some(triple) => triple,
                None => return Poll::Ready(None),
            };
        let _entered = span.enter();

        let cancel = ClientMessage::Cancel {
            trace_context,
            call_id,
        };
        self.start_send(cancel)?;
        tracing::info!("SendCancel");
        Poll::Ready(Some(Ok(())))
    }

    /// Hands a server message to the call it belongs to.
    fn receive(mut self: Pin<&mut Self>, message: ServerMessage) {
        match message {
            ServerMessage::Frame { call_id, frame } => {
                if !self.in_flight_calls().route_frame(call_id, frame) {
                    tracing::trace!(
                        rpc.call_id = call_id,
                        "Dropping a frame of a call that is no longer in flight."
                    );
                }
            }
            ServerMessage::Close { call_id, status } => {
                if let Some(span) = self.in_flight_calls().complete_call(call_id, status) {
                    let _entered = span.enter();
                    tracing::info!("ReceiveClose");
                }
            }
        }
    }
}

impl<T> Future for CallDispatch<T>
where
    T: Transport<ClientMessage, ServerMessage>,
{
    type Output = Result<(), ChannelError<T::Error>>;

    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<(), ChannelError<T::Error>>> {
        loop {
            match (self.as_mut().pump_read(cx)?, self.as_mut().pump_write(cx)?) {
                (Poll::Ready(None), _) => {
                    tracing::info!("Shutdown: read half closed, so shutting down.");
                    self.in_flight_calls()
                        .abort_all(&Status::unknown("the server closed the connection"));
                    return Poll::Ready(Ok(()));
                }
                (read, Poll::Ready(None)) => {
                    if self.in_flight_calls.is_empty() {
                        tracing::info!("Shutdown: write half closed, and no calls in flight.");
                        return Poll::Ready(Ok(()));
                    }
                    tracing::info!(
                        "Shutdown: write half closed, and {} calls in flight.",
                        self.in_flight_calls().len()
                    );
                    match read {
                        Poll::Ready(Some(())) => continue,
                        _ => return Poll::Pending,
                    }
                }
                (Poll::Ready(Some(())), _) | (_, Poll::Ready(Some(()))) => {}
                _ => return Poll::Pending,
            }
        }
    }
}

/// A message sent from a [`Channel`] or one of its calls to the dispatch.
#[derive(Debug)]
pub(crate) enum DispatchRequest {
    Open(Box<OpenCall>),
    Message(ClientMessage),
}

#[derive(Debug)]
pub(crate) struct OpenCall {
    open: Open,
    data: CallData,
}

impl Outgoing for DispatchRequest {
    fn frame(call_id: u64, frame: Frame) -> Self {
        DispatchRequest::Message(ClientMessage::frame(call_id, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::{new, CallDispatch, Channel, Config};
    use crate::{
        context,
        transport::{self, channel::UnboundedChannel},
        CallShape, CallState, ClientMessage, Code, Frame, Json, RpcError, ServerMessage, Status,
    };
    use assert_matches::assert_matches;
    use futures::{prelude::*, task::*};
    use std::{pin::Pin, time::Duration};

    type ServerChannel = UnboundedChannel<ClientMessage, ServerMessage>;

    fn set_up(
        config: Config,
    ) -> (
        Pin<Box<CallDispatch<UnboundedChannel<ServerMessage, ClientMessage>>>>,
        Channel<Json>,
        ServerChannel,
    ) {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let (client_channel, server_channel) = transport::channel::unbounded();
        let client = new(config, client_channel, Json);
        (Box::pin(client.dispatch), client.client, server_channel)
    }

    fn response(call_id: u64, ordinal: u64, message: &str) -> ServerMessage {
        ServerMessage::Frame {
            call_id,
            frame: Frame {
                ordinal,
                payload: Some(serde_json::to_vec(message).unwrap()),
                terminal: false,
            },
        }
    }

    #[tokio::test]
    async fn open_precedes_request_frame() {
        let (dispatch, client, mut server_channel) = set_up(Config::default());
        tokio::spawn(dispatch);
        let call = tokio::spawn(async move {
            client
                .unary::<_, String>(context::current(), "Greet", "Franco")
                .await
        });

        assert_matches!(server_channel.next().await,
                        Some(Ok(ClientMessage::Open(open)))
                        if open.call_id == 0 && open.method == "Greet"
                        && open.shape == CallShape::Unary);
        assert_matches!(server_channel.next().await,
                        Some(Ok(ClientMessage::Frame { call_id: 0, frame }))
                        if frame.ordinal == 0 && frame.terminal
                        && frame.payload.as_deref() == Some(&b"\"Franco\""[..]));

        server_channel.send(response(0, 0, "Hello Franco!")).await.unwrap();
        server_channel
            .send(ServerMessage::Close {
                call_id: 0,
                status: Status::ok(),
            })
            .await
            .unwrap();
        assert_matches!(call.await.unwrap(), Ok(greeting) if greeting == "Hello Franco!");
    }

    #[tokio::test]
    async fn server_status_fails_unary() {
        let (dispatch, client, mut server_channel) = set_up(Config::default());
        tokio::spawn(dispatch);
        let call = tokio::spawn(async move {
            client
                .unary::<_, f64>(context::current(), "SquareRoot", &-4)
                .await
        });
        let _open = server_channel.next().await;
        let _request = server_channel.next().await;
        server_channel
            .send(ServerMessage::Close {
                call_id: 0,
                status: Status::invalid_argument("received a negative number: -4"),
            })
            .await
            .unwrap();
        assert_matches!(call.await.unwrap(),
                        Err(RpcError::Status(status)) if status.code() == Code::InvalidArgument);
    }

    #[tokio::test]
    async fn dropping_response_stream_sends_cancel() {
        let (dispatch, client, mut server_channel) = set_up(Config::default());
        tokio::spawn(dispatch);
        let stream = client
            .server_streaming::<_, String>(context::current(), "GreetManyTimes", "Franco")
            .await
            .unwrap();
        let _open = server_channel.next().await;
        let _request = server_channel.next().await;

        drop(stream);
        assert_matches!(server_channel.next().await,
                        Some(Ok(ClientMessage::Cancel { call_id: 0, .. })));
    }

    #[tokio::test]
    async fn closed_call_does_not_send_cancel() {
        let (dispatch, client, mut server_channel) = set_up(Config::default());
        tokio::spawn(dispatch);
        let mut stream = client
            .server_streaming::<_, String>(context::current(), "GreetManyTimes", "Franco")
            .await
            .unwrap();
        let _open = server_channel.next().await;
        let _request = server_channel.next().await;
        server_channel
            .send(ServerMessage::Close {
                call_id: 0,
                status: Status::ok(),
            })
            .await
            .unwrap();
        assert_matches!(stream.next().await, None);
        assert_eq!(stream.call().state(), CallState::Closed);
        drop(stream);
        drop(client);

        // With the client gone and nothing to cancel, the dispatch closes the connection.
        assert_matches!(server_channel.next().await, None);
    }

    #[tokio::test]
    async fn expired_context_fails_before_opening() {
        let (dispatch, client, mut server_channel) = set_up(Config::default());
        tokio::spawn(dispatch);
        let ctx = context::current().with_timeout(Duration::ZERO);
        let result = client.unary::<_, String>(ctx, "Greet", "Franco").await;
        assert_matches!(result,
                        Err(RpcError::Status(status)) if status.code() == Code::DeadlineExceeded);
        drop(client);
        assert_matches!(server_channel.next().await, None);
    }

    #[tokio::test]
    async fn broken_connection_fails_calls_in_flight() {
        let (dispatch, client, mut server_channel) = set_up(Config::default());
        tokio::spawn(dispatch);
        let call = tokio::spawn(async move {
            client
                .unary::<_, String>(context::current(), "Greet", "Franco")
                .await
        });
        let _open = server_channel.next().await;
        drop(server_channel);
        assert_matches!(call.await.unwrap(),
                        Err(RpcError::Status(status)) if status.code() == Code::Unknown);
    }

    #[tokio::test]
    async fn max_in_flight_calls_blocks_open() {
        let mut config = Config::default();
        config.max_in_flight_calls = 1;
        let (dispatch, client, mut server_channel) = set_up(config);
        tokio::spawn(dispatch);

        let first = client
            .bidi_streaming::<String, String>(context::current(), "GreetEveryone")
            .await
            .unwrap();
        let second = client.bidi_streaming::<String, String>(context::current(), "GreetEveryone");
        futures::pin_mut!(second);
        let cx = &mut Context::from_waker(noop_waker_ref());
        assert!(second.as_mut().poll(cx).is_pending());

        let _open = server_channel.next().await;
        server_channel
            .send(ServerMessage::Close {
                call_id: 0,
                status: Status::ok(),
            })
            .await
            .unwrap();
        assert_eq!(first.call().closed().await, Status::ok());
        assert_matches!(second.await, Ok(call) if call.call().id() == 1);
    }

    #[tokio::test]
    async fn frames_of_finished_call_are_not_written() {
        let (dispatch, client, mut server_channel) = set_up(Config::default());
        tokio::spawn(dispatch);
        let mut call = client
            .client_streaming::<String, String>(context::current(), "LongGreet")
            .await
            .unwrap();
        let _open = server_channel.next().await;
        server_channel
            .send(ServerMessage::Close {
                call_id: 0,
                status: Status::not_found("gone"),
            })
            .await
            .unwrap();
        assert_eq!(call.call().closed().await.code(), Code::NotFound);
        assert_matches!(call.send(&"Franco".to_owned()).await,
                        Err(RpcError::Status(status)) if status.code() == Code::NotFound);
        drop(call);
        drop(client);
        assert_matches!(server_channel.next().await, None);
    }
}
