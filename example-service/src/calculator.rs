// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use streamrpc::{client, context, server::Service, Codec, Json, RpcError, Status};

fn square_root(number: i32) -> Result<f64, Status> {
    if number < 0 {
        return Err(Status::invalid_argument(format!(
            "received a negative number: {number}"
        )));
    }
    Ok(f64::from(number).sqrt())
}

/// Registers the calculator methods on `service`.
pub fn register<C: Codec>(service: Service<C>) -> Service<C> {
    service.unary("SquareRoot", |_, number: i32| async move {
        square_root(number)
    })
}

/// A typed client of the calculator methods.
#[derive(Clone, Debug)]
pub struct CalculatorClient {
    channel: client::Channel<Json>,
}

impl CalculatorClient {
    pub fn new(channel: client::Channel<Json>) -> Self {
        Self { channel }
    }

    /// Returns the square root of `number`. Fails with
    /// [`InvalidArgument`](streamrpc::Code::InvalidArgument) if `number` is negative.
    pub async fn square_root(&self, ctx: context::Context, number: i32) -> Result<f64, RpcError> {
        self.channel.unary(ctx, "SquareRoot", &number).await
    }
}
