// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Turns typed requests and responses into the opaque payloads carried by frames.
//!
//! The call machinery never looks inside a payload. Both peers of a connection must agree on the
//! codec; a payload that fails to encode or decode ends the call with
//! [`Internal`](crate::Code::Internal).

use crate::{
    engine::{Call, CallReceiver},
    Status,
};
use futures::{prelude::*, stream::BoxStream};
use serde::{de::DeserializeOwned, Serialize};

/// Serializes and deserializes message payloads.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Encodes `value` into bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decodes a value from `bytes`.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// A payload could not be encoded or decoded.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// A JSON payload was invalid.
    #[error("json codec error")]
    Json(#[from] serde_json::Error),
    /// A bincode payload was invalid.
    #[error("bincode codec error")]
    Bincode(#[from] bincode::Error),
}

impl From<CodecError> for Status {
    fn from(e: CodecError) -> Self {
        let e = anyhow::Error::new(e);
        Status::internal(format!("{e:#}"))
    }
}

/// A codec that represents payloads as JSON text.
#[derive(Clone, Copy, Debug, Default)]
pub struct Json;

impl Codec for Json {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// A codec that represents payloads in bincode's compact binary format.
#[derive(Clone, Copy, Debug, Default)]
pub struct Bincode;

impl Codec for Bincode {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        Ok(bincode::serialize(value)?)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Decodes the payloads of `receiver` into a stream that ends after the first error, and keeps
/// returning `None` once ended.
///
/// A payload that fails to decode fails the whole call with [`Internal`](crate::Code::Internal).
pub(crate) fn decode_stream<T, C>(
    receiver: CallReceiver,
    codec: C,
) -> BoxStream<'static, Result<T, Status>>
where
    T: DeserializeOwned + Send + 'static,
    C: Codec,
{
    stream::unfold(Some((receiver, codec)), |state| async move {
        let Some((mut receiver, codec)) = state else {
            return None;
        };
        match receiver.receive().await {
            Ok(Some(payload)) => match codec.decode(&payload) {
                Ok(message) => Some((Ok(message), Some((receiver, codec)))),
                Err(e) => Some((Err(receiver.call().fail(e.into())), None)),
            },
            Ok(None) => None,
            Err(status) => Some((Err(status), None)),
        }
    })
    .fuse()
    .boxed()
}

/// The result of reading past the end of a decoded stream of `call`.
pub(crate) fn exhausted<T>(call: &Call) -> Result<Option<T>, Status> {
    match call.status() {
        Some(status) if !status.is_ok() => Err(status),
        _ => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::{Bincode, Codec, Json};
    use crate::Code;

    #[test]
    fn decode_failure_is_internal() {
        let err = Json.decode::<u32>(b"not json").unwrap_err();
        let status = crate::Status::from(err);
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().starts_with("json codec error"));
    }

    #[test]
    fn bincode_rejects_truncated_payload() {
        let bytes = Bincode.encode(&String::from("hello")).unwrap();
        assert!(Bincode.decode::<String>(&bytes[..3]).is_err());
        assert_eq!(Bincode.decode::<String>(&bytes).unwrap(), "hello");
    }
}
