// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

use clap::Parser;
use futures::{future, prelude::*};
use service::blog::InMemoryBlogStore;
use std::net::{IpAddr, Ipv6Addr};
use streamrpc::{
    serde_transport::tcp,
    server::{self, incoming::Incoming},
    tokio_serde::formats::Json,
};

#[derive(Parser)]
struct Flags {
    /// Sets the port number to listen on.
    #[clap(long)]
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let flags = Flags::parse();
    service::init_tracing("streamrpc.server")?;

    let server_addr = (IpAddr::V6(Ipv6Addr::LOCALHOST), flags.port);

    // The serde transport frames each message with a length prefix and serializes it with
    // tokio-serde's json format.
    let mut listener = tcp::listen(&server_addr, Json::default).await?;
    tracing::info!(addr = %listener.local_addr(), "Listening");
    listener.config_mut().max_frame_length(usize::MAX);

    let service = service::service(InMemoryBlogStore::default());
    let serving = listener
        // Ignore accept errors.
        .filter_map(|r| future::ready(r.ok()))
        .execute(server::Config::default(), service);

    tokio::select! {
        () = serving => {}
        signal = tokio::signal::ctrl_c() => {
            signal?;
            tracing::info!("Stopping the server");
        }
    }

    Ok(())
}
