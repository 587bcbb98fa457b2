// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::{Parser, Subcommand};
use futures::prelude::*;
use service::{
    blog::{BlogClient, NewBlog},
    calculator::CalculatorClient,
    greet::{GreetClient, Greeting},
};
use std::{net::SocketAddr, time::Duration};
use streamrpc::{
    client::{self, RequestSink, ResponseStream},
    context,
    serde_transport::tcp,
    tokio_serde::formats::Json,
    Code,
};

#[derive(Parser)]
struct Flags {
    /// Sets the server address to connect to.
    #[clap(long)]
    server_addr: SocketAddr,
    /// Sets the first name to greet.
    #[clap(long, default_value = "David")]
    name: String,
    /// Sets the deadline of every call, in milliseconds.
    #[clap(long)]
    deadline_ms: Option<u64>,
    #[clap(subcommand)]
    call: Call,
}

/// The demo call to make.
#[derive(Subcommand)]
enum Call {
    /// One greeting.
    Greet,
    /// Numbered greetings, streamed by the server.
    GreetManyTimes {
        /// How long the server waits between two greetings, in milliseconds.
        #[clap(long, default_value_t = 1000)]
        pause_ms: u64,
    },
    /// Greets three people in one response.
    LongGreet,
    /// Greets three people as they are sent.
    GreetEveryone,
    /// A greeting that takes three seconds to compute.
    GreetWithDeadline,
    /// The square root of a number.
    SquareRoot {
        #[clap(allow_negative_numbers = true)]
        number: i32,
    },
    /// Creates, reads, updates, deletes and lists blogs.
    Blog,
}

const FAMILY: [&str; 3] = ["David", "Franco", "Victoria"];

impl Flags {
    fn context(&self) -> context::Context {
        let ctx = context::current();
        match self.deadline_ms {
            Some(millis) => ctx.with_timeout(Duration::from_millis(millis)),
            None => ctx,
        }
    }

    fn greeting(&self) -> Greeting {
        Greeting::new(&self.name, "Nastasi")
    }
}

fn family() -> impl Iterator<Item = Greeting> {
    FAMILY
        .into_iter()
        .map(|first_name| Greeting::new(first_name, "Nastasi"))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    service::init_tracing("streamrpc.client")?;

    let transport = tcp::connect(flags.server_addr, Json::default(), usize::MAX).await?;
    let channel = client::new(client::Config::default(), transport, streamrpc::Json).spawn();

    match &flags.call {
        Call::Greet => {
            let greet = GreetClient::new(channel);
            let greeting = greet.greet(flags.context(), &flags.greeting()).await?;
            println!("{greeting}");
        }
        Call::GreetManyTimes { pause_ms } => {
            let greet = GreetClient::new(channel);
            let mut greetings = greet
                .greet_many_times(
                    flags.context(),
                    flags.greeting(),
                    Duration::from_millis(*pause_ms),
                )
                .await?;
            while let Some(greeting) = greetings.message().await? {
                println!("{greeting}");
            }
        }
        Call::LongGreet => {
            let greet = GreetClient::new(channel);
            let mut call = greet.long_greet(flags.context()).await?;
            for greeting in family() {
                tracing::info!(?greeting, "Sending");
                call.send(&greeting).await?;
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            println!("{}", call.close_and_receive().await?);
        }
        Call::GreetEveryone => {
            let greet = GreetClient::new(channel);
            let call = greet.greet_everyone(flags.context()).await?;
            let status = call
                .drive(
                    |mut sink: RequestSink<Greeting>| async move {
                        for greeting in family() {
                            tracing::info!(?greeting, "Sending");
                            sink.send(&greeting).await?;
                            tokio::time::sleep(Duration::from_secs(1)).await;
                        }
                        sink.close().await
                    },
                    |greetings: ResponseStream<String>| {
                        greetings.try_for_each(|greeting| {
                            println!("{greeting}");
                            future::ok(())
                        })
                    },
                )
                .await;
            if !status.is_ok() {
                return Err(status.into());
            }
        }
        Call::GreetWithDeadline => {
            let greet = GreetClient::new(channel);
            match greet
                .greet_with_deadline(flags.context(), &flags.greeting())
                .await
            {
                Ok(greeting) => println!("{greeting}"),
                Err(e) if e.code() == Some(Code::DeadlineExceeded) => {
                    println!("The deadline was exceeded.");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Call::SquareRoot { number } => {
            let calculator = CalculatorClient::new(channel);
            match calculator.square_root(flags.context(), *number).await {
                Ok(root) => println!("The square root of {number} is {root}"),
                Err(e) if e.code() == Some(Code::InvalidArgument) => {
                    println!("{number} has no square root: {e}");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Call::Blog => {
            let blog = BlogClient::new(channel);
            demo_blog(&blog, &flags).await?;
        }
    }

    Ok(())
}

async fn demo_blog(blog: &BlogClient, flags: &Flags) -> anyhow::Result<()> {
    let created = blog
        .create_blog(
            flags.context(),
            &NewBlog {
                author_id: flags.name.clone(),
                title: "My first blog".into(),
                content: "Content of the first blog".into(),
            },
        )
        .await?;
    println!("Created {created:?}");

    match blog
        .read_blog(flags.context(), "000000000000000000000000")
        .await
    {
        Err(e) if e.code() == Some(Code::NotFound) => println!("As expected: {e}"),
        unexpected => anyhow::bail!("reading a missing blog returned {unexpected:?}"),
    }

    let read = blog.read_blog(flags.context(), &created.id).await?;
    println!("Read {read:?}");

    let updated = blog
        .update_blog(
            flags.context(),
            &service::blog::Blog {
                title: "My first blog (edited)".into(),
                content: "Content of the first blog, with some awesome additions!".into(),
                ..created.clone()
            },
        )
        .await?;
    println!("Updated {updated:?}");

    let deleted = blog.delete_blog(flags.context(), &created.id).await?;
    println!("Deleted {deleted}");

    println!("Remaining blogs:");
    let mut blogs = blog.list_blog(flags.context()).await?;
    while let Some(blog) = blogs.message().await? {
        println!("{blog:?}");
    }
    Ok(())
}
