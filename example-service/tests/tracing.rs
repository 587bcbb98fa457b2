#[tokio::test]
async fn init_tracing_installs_one_global_subscriber() -> anyhow::Result<()> {
    service::init_tracing("streamrpc.example_service.test")?;
    assert!(tracing::dispatcher::has_been_set());
    tracing::info_span!("Exported").in_scope(|| tracing::info!("InsideExportedSpan"));

    assert!(service::init_tracing("streamrpc.example_service.test").is_err());
    Ok(())
}
