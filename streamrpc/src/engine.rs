// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The per-call state machine shared by every call shape, on both the client and the server.
//!
//! A call is split into a [`CallSender`] and a [`CallReceiver`], which may be driven by two
//! different tasks, plus any number of [`Call`] handles for observing and aborting the call. All
//! of them share one [`Shared`] whose lock serializes state transitions; the engine is the only
//! writer of the call's terminal [`Status`].

use crate::{
    cancellations::CallCancellation, context, CallShape, ClientMessage, Frame, RpcError,
    ServerMessage, Status,
};
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// The lifecycle state of a logical call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallState {
    /// Both directions are open.
    Open,
    /// This side finished sending; the remote side may still send.
    HalfClosedLocal,
    /// The remote side finished sending; this side may still send.
    HalfClosedRemote,
    /// The call is over and its terminal status is recorded.
    Closed,
}

/// Which side caused a call to close.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Origin {
    /// This process: an adapter, a handler, the call's context, or the call being abandoned.
    Local,
    /// The peer, or the transport connecting to it.
    Remote,
}

/// Wraps an outgoing frame in the connection's message type.
pub(crate) trait Outgoing: Send + 'static {
    fn frame(call_id: u64, frame: Frame) -> Self;
}

impl Outgoing for ServerMessage {
    fn frame(call_id: u64, frame: Frame) -> Self {
        ServerMessage::Frame { call_id, frame }
    }
}

impl Outgoing for ClientMessage {
    fn frame(call_id: u64, frame: Frame) -> Self {
        ClientMessage::Frame { call_id, frame }
    }
}

struct Inner {
    state: CallState,
    status: Option<Status>,
    /// Who recorded `status`.
    origin: Option<Origin>,
    /// Set once this side closed its sending direction itself.
    local_done: bool,
}

pub(crate) struct Shared {
    call_id: u64,
    shape: CallShape,
    ctx: context::Context,
    inner: Mutex<Inner>,
    /// Fires when the call reaches `Closed`.
    closed: CancellationToken,
    /// Tells the client dispatch to send a cancel message. `None` on the server, which reports
    /// every outcome with a close message instead.
    cancellation: Option<CallCancellation>,
    span: Span,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        // The critical sections never panic midway, so a poisoned lock still holds valid state.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records `status` and moves to `Closed`, unless the call is already closed, in which case
    /// the status recorded first wins. Returns the recorded status.
    pub(crate) fn finish(&self, status: Status, origin: Origin) -> Status {
        let mut inner = self.lock();
        if let Some(recorded) = &inner.status {
            return recorded.clone();
        }
        inner.state = CallState::Closed;
        inner.status = Some(status.clone());
        inner.origin = Some(origin);
        drop(inner);
        self.closed.cancel();

        let _entered = self.span.enter();
        if status.is_ok() {
            tracing::info!("CallClosed");
        } else {
            tracing::info!(code = %status.code(), message = status.message(), ?origin, "CallClosed");
            if origin == Origin::Local {
                if let Some(cancellation) = &self.cancellation {
                    tracing::info!("CancelCall");
                    cancellation.cancel(self.call_id);
                }
            }
        }
        status
    }

    /// This side will send no more frames.
    fn close_local(&self) {
        let mut inner = self.lock();
        inner.local_done = true;
        match inner.state {
            CallState::Open => inner.state = CallState::HalfClosedLocal,
            CallState::HalfClosedRemote => {
                drop(inner);
                self.finish(Status::ok(), Origin::Local);
            }
            CallState::HalfClosedLocal | CallState::Closed => {}
        }
    }

    /// The remote side will send no more frames.
    fn close_remote(&self) {
        let mut inner = self.lock();
        match inner.state {
            CallState::Open => inner.state = CallState::HalfClosedRemote,
            CallState::HalfClosedLocal => {
                drop(inner);
                self.finish(Status::ok(), Origin::Remote);
            }
            CallState::HalfClosedRemote | CallState::Closed => {}
        }
    }

    fn status(&self) -> Option<Status> {
        self.lock().status.clone()
    }

    fn state(&self) -> CallState {
        self.lock().state
    }
}

// A client call whose every handle was dropped before it closed was abandoned by its caller.
impl Drop for Shared {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap_or_else(PoisonError::into_inner);
        if inner.state != CallState::Closed {
            if let Some(cancellation) = &self.cancellation {
                let _entered = self.span.enter();
                tracing::info!("AbandonCall");
                cancellation.cancel(self.call_id);
            }
        }
    }
}

/// A handle to a logical call, for observing its lifecycle and aborting it.
#[derive(Clone)]
pub struct Call {
    shared: Arc<Shared>,
}

impl Call {
    /// The call's ID, unique among the calls of one connection.
    pub fn id(&self) -> u64 {
        self.shared.call_id
    }

    /// The call's shape.
    pub fn shape(&self) -> CallShape {
        self.shared.shape
    }

    /// The context the call runs under.
    pub fn context(&self) -> &context::Context {
        &self.shared.ctx
    }

    /// A snapshot of the call's lifecycle state.
    pub fn state(&self) -> CallState {
        self.shared.state()
    }

    /// The terminal status, if the call is closed.
    pub fn status(&self) -> Option<Status> {
        self.shared.status()
    }

    /// Closes the call with `status`, unless it is already closed. Returns the recorded status.
    pub fn abort(&self, status: Status) -> Status {
        self.shared.finish(status, Origin::Local)
    }

    /// Cancels the call. Every task blocked sending or receiving on it unblocks with
    /// [`Canceled`](crate::Code::Canceled).
    pub fn cancel(&self) -> Status {
        self.abort(Status::canceled("the call was canceled by the caller"))
    }

    /// Completes once both directions of the call are closed, with the call's terminal status.
    pub async fn closed(&self) -> Status {
        self.shared.closed.cancelled().await;
        self.recorded_status()
    }

    pub(crate) fn finish(&self, status: Status, origin: Origin) -> Status {
        self.shared.finish(status, origin)
    }

    /// Aborts the call with `status`, and returns the status to report: the recorded status if
    /// the call had already failed, `status` otherwise.
    pub(crate) fn fail(&self, status: Status) -> Status {
        let recorded = self.finish(status.clone(), Origin::Local);
        if recorded.is_ok() {
            status
        } else {
            recorded
        }
    }

    pub(crate) fn downgrade(&self) -> WeakCall {
        WeakCall(Arc::downgrade(&self.shared))
    }

    pub(crate) fn span(&self) -> &Span {
        &self.shared.span
    }

    fn recorded_status(&self) -> Status {
        // Only reachable after `closed` fired, which happens after the status is recorded.
        self.shared
            .status()
            .unwrap_or_else(|| Status::unknown("the call closed without a status"))
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.shared.call_id)
            .field("shape", &self.shared.shape)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// A handle that does not keep an abandoned call alive.
#[derive(Clone, Debug)]
pub(crate) struct WeakCall(Weak<Shared>);

impl WeakCall {
    pub(crate) fn upgrade(&self) -> Option<Call> {
        self.0.upgrade().map(|shared| Call { shared })
    }
}

/// Writes the frames of one direction of a call.
pub(crate) struct CallSender<M> {
    call: Call,
    outbound: mpsc::Sender<M>,
    next_ordinal: u64,
}

/// Reads the frames of one direction of a call.
pub(crate) struct CallReceiver {
    call: Call,
    inbound: mpsc::UnboundedReceiver<Frame>,
    next_ordinal: u64,
}

/// Everything needed to drive one new call: the halves for the adapters and the route for the
/// connection.
pub(crate) struct NewCall<M> {
    pub call: Call,
    pub sender: CallSender<M>,
    pub receiver: CallReceiver,
    pub route: mpsc::UnboundedSender<Frame>,
}

pub(crate) fn new_call<M: Outgoing>(
    call_id: u64,
    shape: CallShape,
    ctx: context::Context,
    outbound: mpsc::Sender<M>,
    cancellation: Option<CallCancellation>,
    span: Span,
) -> NewCall<M> {
    let (route, inbound) = mpsc::unbounded_channel();
    let call = Call {
        shared: Arc::new(Shared {
            call_id,
            shape,
            ctx,
            inner: Mutex::new(Inner {
                state: CallState::Open,
                status: None,
                origin: None,
                local_done: false,
            }),
            closed: CancellationToken::new(),
            cancellation,
            span,
        }),
    };
    NewCall {
        sender: CallSender {
            call: call.clone(),
            outbound,
            next_ordinal: 0,
        },
        receiver: CallReceiver {
            call: call.clone(),
            inbound,
            next_ordinal: 0,
        },
        call,
        route,
    }
}

/// Why a frame may not be sent right now, if it may not.
fn check_sendable(inner: &Inner) -> Result<(), RpcError> {
    match (&inner.status, inner.local_done) {
        (_, true) => Err(RpcError::InvalidState),
        (Some(status), false) if status.is_ok() => Err(RpcError::InvalidState),
        (Some(status), false) => Err(RpcError::Status(status.clone())),
        (None, false) => Ok(()),
    }
}

impl<M: Outgoing> CallSender<M> {
    pub(crate) fn call(&self) -> &Call {
        &self.call
    }

    /// Sends one frame carrying `payload`.
    pub(crate) async fn send(&mut self, payload: Vec<u8>) -> Result<(), RpcError> {
        self.send_frame(Some(payload), false).await
    }

    /// Sends one frame carrying `payload` and closes the sending direction.
    pub(crate) async fn send_last(&mut self, payload: Vec<u8>) -> Result<(), RpcError> {
        self.send_frame(Some(payload), true).await
    }

    /// Closes the sending direction.
    pub(crate) async fn close(&mut self) -> Result<(), RpcError> {
        self.send_frame(None, true).await
    }

    async fn send_frame(&mut self, payload: Option<Vec<u8>>, terminal: bool) -> Result<(), RpcError> {
        let shared = &self.call.shared;
        check_sendable(&shared.lock())?;
        let frame = Frame {
            ordinal: self.next_ordinal,
            payload,
            terminal,
        };
        let call_id = shared.call_id;

        // Waiting for room in the outbound queue is the only place a send suspends, so it must
        // give up as soon as the call ends for any other reason.
        let sent = tokio::select! {
            biased;
            status = shared.ctx.done() => Err(shared.finish(status, Origin::Local)),
            _ = shared.closed.cancelled() => {
                return check_sendable(&shared.lock());
            }
            sent = self.outbound.send(M::frame(call_id, frame)) => sent.map_err(|_| {
                shared.finish(
                    Status::unknown("the connection was shut down"),
                    Origin::Remote,
                )
            }),
        };
        sent?;
        self.next_ordinal += 1;
        if terminal {
            let _entered = shared.span.enter();
            tracing::info!("HalfClose");
            shared.close_local();
        }
        Ok(())
    }

    /// Returns a clone of the queue this sender writes to.
    pub(crate) fn outbound(&self) -> mpsc::Sender<M> {
        self.outbound.clone()
    }
}

/// How far along the remote direction is, as seen by the receiver.
enum Progress {
    /// Frames may still arrive.
    Open,
    /// The peer closed the call. Frames it sent before closing may still be buffered.
    Draining(Status),
    /// Nothing more will be received.
    Done(Result<Option<Vec<u8>>, Status>),
}

impl CallReceiver {
    pub(crate) fn call(&self) -> &Call {
        &self.call
    }

    /// Receives the next payload of the remote direction.
    ///
    /// Returns `Ok(None)` once the remote side finished sending and the call did not fail, and
    /// `Err` with the terminal status if the call failed, was canceled, or expired. Once the call
    /// is closed, every further call returns the same result immediately.
    pub(crate) async fn receive(&mut self) -> Result<Option<Vec<u8>>, Status> {
        let shared = Arc::clone(&self.call.shared);
        loop {
            let frame = match self.progress() {
                Progress::Done(result) => return result,
                Progress::Draining(status) => match self.inbound.try_recv() {
                    Ok(frame) => frame,
                    Err(_) => return into_result(status),
                },
                Progress::Open => tokio::select! {
                    biased;
                    status = shared.ctx.done() => {
                        return Err(shared.finish(status, Origin::Local));
                    }
                    _ = shared.closed.cancelled() => continue,
                    frame = self.inbound.recv() => match frame {
                        Some(frame) => frame,
                        None => {
                            let status = shared.finish(
                                Status::unknown("the connection was shut down"),
                                Origin::Remote,
                            );
                            return into_result(status);
                        }
                    },
                },
            };
            if let Some(payload) = self.accept(frame)? {
                return Ok(Some(payload));
            }
        }
    }

    fn accept(&mut self, frame: Frame) -> Result<Option<Vec<u8>>, Status> {
        let shared = &self.call.shared;
        if frame.ordinal != self.next_ordinal {
            let status = Status::internal(format!(
                "received frame {} out of order; expected frame {}",
                frame.ordinal, self.next_ordinal
            ));
            return Err(shared.finish(status, Origin::Local));
        }
        self.next_ordinal += 1;
        if frame.terminal {
            shared.close_remote();
        }
        Ok(frame.payload)
    }

    fn progress(&self) -> Progress {
        let inner = self.call.shared.lock();
        match (&inner.status, inner.origin, inner.state) {
            (Some(status), Some(Origin::Remote), _) => Progress::Draining(status.clone()),
            (Some(status), _, _) => Progress::Done(into_result(status.clone())),
            (None, _, CallState::HalfClosedRemote) => Progress::Done(Ok(None)),
            (None, _, _) => Progress::Open,
        }
    }
}

fn into_result(status: Status) -> Result<Option<Vec<u8>>, Status> {
    if status.is_ok() {
        Ok(None)
    } else {
        Err(status)
    }
}
