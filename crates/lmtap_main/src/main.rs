mod cli;
mod config;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use lmtap_domain::ConversationStore;
use lmtap_proxy::intercept::ollama::{OllamaChatInterceptor, OllamaGenerateInterceptor};
use lmtap_proxy::intercept::openai::OpenAiChatInterceptor;
use lmtap_proxy::intercept::{
    CustomInterceptor, Interceptor, LoggingInterceptor, SimpleInterceptor,
};
use lmtap_proxy::ProxyEngine;
use lmtap_storage::PostgresStore;
use tracing::{info, warn};

use crate::cli::Cli;
use crate::config::{parse_timeout, Config, InterceptConfig, InterceptorKind, StorageConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&cli.config).context("could not load config file")?;
    logging::init(&config.logging);
    run(config).await
}

async fn run(config: Config) -> anyhow::Result<()> {
    let upstream_timeout = parse_timeout(config.proxy.upstream.timeout.as_deref(), "upstream");
    let storage_timeout = parse_timeout(config.storage.timeout.as_deref(), "storage");

    let store = build_store(&config.storage)?;
    if store.is_some() {
        info!("initialized storage backend");
    }

    let engine = Arc::new(ProxyEngine::new(
        &config.proxy.upstream.url,
        config.proxy.port,
        upstream_timeout,
    )?);

    for intercept in &config.proxy.intercepts {
        let interceptor = build_interceptor(intercept, store.clone(), storage_timeout);
        engine.register(&intercept.endpoint, &intercept.method, interceptor);
        info!(
            interceptor = intercept.interceptor.name(),
            endpoint = %intercept.endpoint,
            method = %intercept.method,
            "registered interceptor"
        );
    }
    if config.proxy.intercepts.is_empty() {
        info!("no interceptors configured");
    }

    info!("proxy server starting, press Ctrl+C to stop");
    engine.serve(shutdown_signal()).await?;
    info!("server stopped gracefully");
    Ok(())
}

fn build_store(config: &StorageConfig) -> anyhow::Result<Option<Arc<dyn ConversationStore>>> {
    match (config.kind.as_deref(), &config.postgres) {
        (Some("postgres"), Some(postgres)) => {
            let store = PostgresStore::connect(&postgres.dsn)?;
            Ok(Some(Arc::new(store)))
        }
        _ => Ok(None),
    }
}

fn build_interceptor(
    intercept: &InterceptConfig,
    store: Option<Arc<dyn ConversationStore>>,
    storage_timeout: Duration,
) -> Arc<dyn Interceptor> {
    let name = intercept.interceptor.name();
    match intercept.interceptor {
        InterceptorKind::CustomInterceptor => Arc::new(CustomInterceptor::new(name)),
        InterceptorKind::SimpleInterceptor => Arc::new(SimpleInterceptor::new(name)),
        InterceptorKind::LoggingInterceptor => Arc::new(LoggingInterceptor::new(name)),
        InterceptorKind::OllamaChatInterceptor => {
            Arc::new(OllamaChatInterceptor::new(name, store, storage_timeout))
        }
        InterceptorKind::OllamaGenerateInterceptor => {
            Arc::new(OllamaGenerateInterceptor::new(name, store, storage_timeout))
        }
        InterceptorKind::OpenAIChatInterceptor => {
            Arc::new(OpenAiChatInterceptor::new(name, store, storage_timeout))
        }
    }
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}
