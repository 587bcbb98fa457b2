// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::{
    engine::{Origin, WeakCall},
    util::Compact,
    Frame, Status,
};
use fnv::FnvHashMap;
use std::collections::hash_map;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Span;

/// A data structure that tracks in-flight calls. It aborts calls, either on demand or when the
/// connection goes away.
#[derive(Debug, Default)]
pub struct InFlightCalls {
    calls: FnvHashMap<u64, CallData>,
}

/// Data needed to route frames to, and clean up, a single in-flight call.
#[derive(Debug)]
pub struct CallData {
    call: WeakCall,
    /// Hands request frames to the handler.
    route: mpsc::UnboundedSender<Frame>,
    /// Cancels the handler's context, and with it any calls the handler made on a child context.
    cancellation: CancellationToken,
    span: Span,
}

impl CallData {
    pub fn new(
        call: WeakCall,
        route: mpsc::UnboundedSender<Frame>,
        cancellation: CancellationToken,
        span: Span,
    ) -> Self {
        Self {
            call,
            route,
            cancellation,
            span,
        }
    }

    fn abort(self, status: Status) -> Span {
        if let Some(call) = self.call.upgrade() {
            call.finish(status, Origin::Remote);
        }
        self.cancellation.cancel();
        self.span
    }
}

/// An error returned when a call attempted to start with the same ID as a call already in flight.
#[derive(Debug)]
pub struct AlreadyExistsError;

impl InFlightCalls {
    /// Returns the number of in-flight calls.
    pub fn len(&self) -> usize {
        self.calls.len()
    }

    /// Returns true iff there are no calls in flight.
    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn contains(&self, call_id: u64) -> bool {
        self.calls.contains_key(&call_id)
    }

    /// Starts tracking a call, unless a call with the same ID is already in flight.
    pub fn start_call(&mut self, call_id: u64, data: CallData) -> Result<(), AlreadyExistsError> {
        match self.calls.entry(call_id) {
            hash_map::Entry::Vacant(vacant) => {
                vacant.insert(data);
                Ok(())
            }
            hash_map::Entry::Occupied(_) => Err(AlreadyExistsError),
        }
    }

    /// Hands a request frame to its call. Returns false iff the call isn't in flight.
    pub fn route_frame(&mut self, call_id: u64, frame: Frame) -> bool {
        match self.calls.get(&call_id) {
            Some(data) => {
                // A handler that stopped reading still owes the client a close.
                let _ = data.route.send(frame);
                true
            }
            None => false,
        }
    }

    /// Cancels an in-flight call on behalf of the client. Returns the call's span iff the call
    /// was found.
    pub fn cancel_call(&mut self, call_id: u64) -> Option<Span> {
        self.abort_call(call_id, Status::canceled("the client canceled the call"))
    }

    /// Ends an in-flight call with `status` and stops tracking it. Returns the call's span iff
    /// the call was found.
    pub fn abort_call(&mut self, call_id: u64, status: Status) -> Option<Span> {
        let data = self.calls.remove(&call_id)?;
        self.calls.compact();
        Some(data.abort(status))
    }

    /// Stops tracking a call without aborting it. Returns the call's span iff the call was found.
    /// This method should be used when the call's close is being sent.
    pub fn remove_call(&mut self, call_id: u64) -> Option<Span> {
        let data = self.calls.remove(&call_id)?;
        self.calls.compact();
        Some(data.span)
    }

    /// Aborts every in-flight call with `status`.
    pub fn abort_all(&mut self, status: &Status) {
        for (_, data) in self.calls.drain() {
            let span = data.abort(status.clone());
            let _entered = span.enter();
            tracing::info!("AbortCall");
        }
    }
}

/// When InFlightCalls is dropped, any outstanding calls are aborted.
impl Drop for InFlightCalls {
    fn drop(&mut self) {
        self.abort_all(&Status::unknown("the connection was shut down"));
    }
}

#[cfg(test)]
mod tests {
    use super::{AlreadyExistsError, CallData, InFlightCalls};
    use crate::{
        context,
        engine::{new_call, NewCall},
        CallShape, Code, Frame, ServerMessage,
    };
    use assert_matches::assert_matches;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;
    use tracing::Span;

    fn start(
        in_flight: &mut InFlightCalls,
        call_id: u64,
    ) -> (NewCall<ServerMessage>, CancellationToken) {
        let (tx, _rx) = mpsc::channel(1);
        let token = CancellationToken::new();
        let new_call = new_call(
            call_id,
            CallShape::ClientStreaming,
            context::current(),
            tx,
            None,
            Span::none(),
        );
        in_flight
            .start_call(
                call_id,
                CallData::new(
                    new_call.call.downgrade(),
                    new_call.route.clone(),
                    token.clone(),
                    Span::none(),
                ),
            )
            .unwrap();
        (new_call, token)
    }

    #[tokio::test]
    async fn start_call_increases_len() {
        let mut in_flight = InFlightCalls::default();
        assert_eq!(in_flight.len(), 0);
        let _call = start(&mut in_flight, 0);
        assert_eq!(in_flight.len(), 1);
        assert!(in_flight.contains(0));
    }

    #[tokio::test]
    async fn duplicate_call_is_rejected() {
        let mut in_flight = InFlightCalls::default();
        let (new_call, token) = start(&mut in_flight, 3);
        let again = CallData::new(new_call.call.downgrade(), new_call.route.clone(), token, Span::none());
        assert_matches!(in_flight.start_call(3, again), Err(AlreadyExistsError));
    }

    #[tokio::test]
    async fn cancel_call_aborts() {
        let mut in_flight = InFlightCalls::default();
        let (new_call, token) = start(&mut in_flight, 0);

        assert!(in_flight.cancel_call(0).is_some());
        assert!(token.is_cancelled());
        assert_matches!(new_call.call.status(), Some(status) if status.code() == Code::Canceled);
        assert!(in_flight.is_empty());
        assert!(in_flight.cancel_call(0).is_none());
    }

    #[tokio::test]
    async fn remove_call_doesnt_abort() {
        let mut in_flight = InFlightCalls::default();
        let (mut new_call, token) = start(&mut in_flight, 0);
        assert!(in_flight.route_frame(
            0,
            Frame {
                ordinal: 0,
                payload: Some(b"1".to_vec()),
                terminal: true,
            }
        ));

        assert!(in_flight.remove_call(0).is_some());
        assert!(!token.is_cancelled());
        assert_eq!(new_call.call.status(), None);
        assert_eq!(new_call.receiver.receive().await, Ok(Some(b"1".to_vec())));
        assert!(!in_flight.route_frame(0, Frame {
            ordinal: 1,
            payload: None,
            terminal: true,
        }));
    }

    #[tokio::test]
    async fn drop_aborts_calls_in_flight() {
        let mut in_flight = InFlightCalls::default();
        let (new_call, token) = start(&mut in_flight, 1);
        drop(in_flight);
        assert!(token.is_cancelled());
        assert_matches!(new_call.call.status(), Some(status) if status.code() == Code::Unknown);
    }
}
