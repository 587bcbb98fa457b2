// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use crate::{
    engine::{Origin, WeakCall},
    trace,
    util::Compact,
    Frame, Status,
};
use fnv::FnvHashMap;
use std::collections::hash_map;
use tokio::sync::{mpsc, OwnedSemaphorePermit};
use tracing::Span;

/// Calls opened on the wire that the server hasn't closed yet.
#[derive(Debug, Default)]
pub struct InFlightCalls {
    calls: FnvHashMap<u64, CallData>,
}

/// What the dispatch needs to route the frames of one call and to end it.
#[derive(Debug)]
pub struct CallData {
    call: WeakCall,
    route: mpsc::UnboundedSender<Frame>,
    trace_context: trace::Context,
    span: Span,
    /// Frees a slot for another call once this call leaves the map.
    _permit: OwnedSemaphorePermit,
}

impl CallData {
    pub fn new(
        call: WeakCall,
        route: mpsc::UnboundedSender<Frame>,
        trace_context: trace::Context,
        span: Span,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            call,
            route,
            trace_context,
            span,
            _permit: permit,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// False if the call ended, or was abandoned, before it could be written to the wire.
    pub fn is_live(&self) -> bool {
        self.call
            .upgrade()
            .map_or(false, |call| call.status().is_none())
    }
}

/// An error returned when an attempt is made to insert a call with an ID that is already in use.
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
    pub fn insert_call(&mut self, call_id: u64, data: CallData) -> Result<(), AlreadyExistsError> {
        match self.calls.entry(call_id) {
            hash_map::Entry::Vacant(vacant) => {
                vacant.insert(data);
                Ok(())
            }
            hash_map::Entry::Occupied(_) => Err(AlreadyExistsError),
        }
    }

    /// Hands a response frame to its call. Returns false iff the call isn't in flight.
    pub fn route_frame(&mut self, call_id: u64, frame: Frame) -> bool {
        match self.calls.get(&call_id) {
            Some(data) => {
                // The receiver may be gone already; the call still ends with the server's close.
                let _ = data.route.send(frame);
                true
            }
            None => false,
        }
    }

    /// Ends a call with a status decided by the server or the connection. Returns the call's
    /// span iff the call was in flight.
    pub fn complete_call(&mut self, call_id: u64, status: Status) -> Option<Span> {
        let data = self.calls.remove(&call_id)?;
        self.calls.compact();
        if let Some(call) = data.call.upgrade() {
            call.finish(status, Origin::Remote);
        }
        Some(data.span)
    }

    /// Stops tracking a call that ended locally. Returns what is needed to tell the server, iff
    /// the call was in flight.
    pub fn cancel_call(&mut self, call_id: u64) -> Option<(trace::Context, Span)> {
        let data = self.calls.remove(&call_id)?;
        self.calls.compact();
        Some((data.trace_context, data.span))
    }

    /// Ends every call in flight with `status`.
    pub fn abort_all(&mut self, status: &Status) {
        for (_, data) in self.calls.drain() {
            if let Some(call) = data.call.upgrade() {
                let _entered = data.span.enter();
                tracing::info!("ReceiveError");
                call.finish(status.clone(), Origin::Remote);
            }
        }
    }
}

/// Calls still in flight when the dispatch goes away can never complete.
impl Drop for InFlightCalls {
    fn drop(&mut self) {
        self.abort_all(&Status::unknown("the connection was shut down"));
    }
}
