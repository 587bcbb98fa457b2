// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! A service that says hello in all four call shapes.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use streamrpc::{
    client::{self, BidiStreamingCall, ClientStreamingCall, ResponseStream},
    context,
    server::{RequestStream, ResponseSink, Service},
    Codec, Json, RpcError,
};

/// The number of greetings `GreetManyTimes` sends.
pub const GREET_MANY_TIMES: usize = 10;

/// How long `GreetWithDeadline` works before answering.
pub const GREET_WITH_DEADLINE_WORK: Duration = Duration::from_secs(3);

/// Who to greet.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub first_name: String,
    pub last_name: String,
}

impl Greeting {
    pub fn new(first_name: impl Into<String>, last_name: impl Into<String>) -> Self {
        Self {
            first_name: first_name.into(),
            last_name: last_name.into(),
        }
    }
}

/// The request of `GreetManyTimes`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GreetManyTimesRequest {
    pub greeting: Greeting,
    /// How long to wait between two greetings.
    pub pause: Duration,
}

/// Registers the greet methods on `service`.
pub fn register<C: Codec>(service: Service<C>) -> Service<C> {
    service
        .unary("Greet", |_, greeting: Greeting| async move {
            tracing::info!(?greeting, "Greet");
            Ok(format!("Hello {}", greeting.first_name))
        })
        .server_streaming(
            "GreetManyTimes",
            |_, request: GreetManyTimesRequest, mut sink: ResponseSink<String>| async move {
                let name = &request.greeting.first_name;
                for i in 0..GREET_MANY_TIMES {
                    if i > 0 {
                        tokio::time::sleep(request.pause).await;
                    }
                    sink.send(&format!("Hello {name} number {i}")).await?;
                }
                Ok(())
            },
        )
        .client_streaming("LongGreet", |_, mut greetings: RequestStream<Greeting>| async move {
            let mut result = String::new();
            while let Some(greeting) = greetings.message().await? {
                result.push_str(&format!("Hello {}! ", greeting.first_name));
            }
            Ok(result)
        })
        .bidi_streaming(
            "GreetEveryone",
            |_, mut greetings: RequestStream<Greeting>, mut sink: ResponseSink<String>| async move {
                while let Some(greeting) = greetings.message().await? {
                    sink.send(&format!("Hello {}!", greeting.first_name))
                        .await?;
                }
                Ok(())
            },
        )
        .unary("GreetWithDeadline", |ctx, greeting: Greeting| async move {
            for _ in 0..GREET_WITH_DEADLINE_WORK.as_secs() {
                if let Some(status) = ctx.err() {
                    tracing::info!(code = %status.code(), "StopWork");
                    return Err(status);
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            Ok(format!("Hello {}", greeting.first_name))
        })
}

/// A typed client of the greet methods.
#[derive(Clone, Debug)]
pub struct GreetClient {
    channel: client::Channel<Json>,
}

impl GreetClient {
    pub fn new(channel: client::Channel<Json>) -> Self {
        Self { channel }
    }

    /// Returns a greeting for `greeting`.
    pub async fn greet(
        &self,
        ctx: context::Context,
        greeting: &Greeting,
    ) -> Result<String, RpcError> {
        self.channel.unary(ctx, "Greet", greeting).await
    }

    /// Returns [`GREET_MANY_TIMES`] numbered greetings, `pause` apart.
    pub async fn greet_many_times(
        &self,
        ctx: context::Context,
        greeting: Greeting,
        pause: Duration,
    ) -> Result<ResponseStream<String>, RpcError> {
        let request = GreetManyTimesRequest { greeting, pause };
        self.channel
            .server_streaming(ctx, "GreetManyTimes", &request)
            .await
    }

    /// Opens a call that answers with one greeting for everyone sent.
    pub async fn long_greet(
        &self,
        ctx: context::Context,
    ) -> Result<ClientStreamingCall<Greeting, String>, RpcError> {
        self.channel.client_streaming(ctx, "LongGreet").await
    }

    /// Opens a call that answers every greeting as it arrives.
    pub async fn greet_everyone(
        &self,
        ctx: context::Context,
    ) -> Result<BidiStreamingCall<Greeting, String>, RpcError> {
        self.channel.bidi_streaming(ctx, "GreetEveryone").await
    }

    /// Returns a greeting after [`GREET_WITH_DEADLINE_WORK`], unless `ctx` expires first.
    pub async fn greet_with_deadline(
        &self,
        ctx: context::Context,
        greeting: &Greeting,
    ) -> Result<String, RpcError> {
        self.channel.unary(ctx, "GreetWithDeadline", greeting).await
    }
}
