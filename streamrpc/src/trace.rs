// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

#![deny(missing_docs, missing_debug_implementations)]

//! Identifiers that tie together the log events of causally-related calls.
//!
//! A trace is a tree of spans. The client picks a span id for every call it makes; the server
//! logs the call under that trace and, when it makes nested calls while serving, derives child
//! spans from it so the whole chain can be followed across processes.
//!
//! Both identifiers travel as lowercase hex strings, the same way they are rendered in logs.

use rand::Rng;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::{
    fmt,
    num::{NonZeroU128, NonZeroU64},
};

/// Where a call sits in its trace.
#[derive(Debug, Default, PartialEq, Eq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct Context {
    /// Shared by every call caused by the same root call.
    pub trace_id: TraceId,
    /// Identifies this call within its trace.
    pub span_id: SpanId,
}

impl Context {
    /// Starts a new trace.
    pub fn new_root() -> Self {
        let rng = &mut rand::thread_rng();
        Self {
            trace_id: TraceId(rng.gen::<NonZeroU128>().get()),
            span_id: SpanId::random(rng),
        }
    }

    /// Returns a context for a call caused by this one: same trace, new span.
    pub fn new_child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: SpanId::random(&mut rand::thread_rng()),
        }
    }
}

/// A 128-bit identifier of a trace. Zero only in a default context.
#[derive(Default, PartialEq, Eq, Hash, Clone, Copy)]
pub struct TraceId(u128);

impl TraceId {
    /// Returns true iff the trace ID is 0.
    pub fn is_none(&self) -> bool {
        self.0 == 0
    }
}

/// A 64-bit identifier of a span, unique within its trace.
#[derive(Default, PartialEq, Eq, Hash, Clone, Copy)]
pub struct SpanId(u64);

impl SpanId {
    fn random<R: Rng>(rng: &mut R) -> Self {
        SpanId(rng.gen::<NonZeroU64>().get())
    }
}

macro_rules! hex_id {
    ($id:ident, $int:ty, $width:literal) => {
        impl fmt::Display for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:0width$x}", self.0, width = $width)
            }
        }

        impl fmt::Debug for $id {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }

        impl Serialize for $id {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.collect_str(self)
            }
        }

        impl<'de> Deserialize<'de> for $id {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let hex = String::deserialize(deserializer)?;
                <$int>::from_str_radix(&hex, 16)
                    .map($id)
                    .map_err(|e| de::Error::custom(format!("bad {}: {e}", stringify!($id))))
            }
        }
    };
}

hex_id!(TraceId, u128, 32);
hex_id!(SpanId, u64, 16);
