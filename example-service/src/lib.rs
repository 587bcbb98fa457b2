// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! Greet, calculator and blog services, each with a typed client.

use opentelemetry::trace::TracerProvider as _;
use std::sync::Arc;
use streamrpc::{server::Service, Json};
use tracing_subscriber::{fmt::format::FmtSpan, prelude::*};

pub mod blog;
pub mod calculator;
pub mod greet;

/// Returns a service serving every method of the greet, calculator and blog services. Blogs are
/// kept in `store`.
pub fn service<S: blog::BlogStore>(store: S) -> Service<Json> {
    let service = Service::new(Json);
    let service = greet::register(service);
    let service = calculator::register(service);
    blog::register(service, Arc::new(store))
}

/// Initializes a tracing subscriber that logs to stdout, filtered by `RUST_LOG`, and exports
/// spans to an OTLP collector under `service_name`.
pub fn init_tracing(service_name: &'static str) -> anyhow::Result<()> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .build()?;
    let tracer_provider = opentelemetry_sdk::trace::SdkTracerProvider::builder()
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_attribute(opentelemetry::KeyValue::new(
                    opentelemetry_semantic_conventions::resource::SERVICE_NAME,
                    service_name,
                ))
                .build(),
        )
        .with_batch_exporter(exporter)
        .build();
    opentelemetry::global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(service_name);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer().with_span_events(FmtSpan::NEW | FmtSpan::CLOSE))
        .with(tracing_opentelemetry::layer().with_tracer(tracer))
        .try_init()?;

    Ok(())
}
