use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use clap::Parser;
use serde_json::{Value, json};
use spool_core::ports::FnHandler;
use spool_core::{
    ConsumeType, Handler, HandlerError, Payload, Service, ServiceConfig, ServiceRegistry,
};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "spool")]
#[command(about = "Run the demo services, submit a few tasks, and print the results")]
#[command(version)]
struct Cli {
    /// Exit after the demo submissions instead of waiting for Ctrl-C
    #[arg(long)]
    once: bool,
}

/// バッチ handler の例: `text` を大文字にして返す
struct UpperCase;

#[async_trait]
impl Handler for UpperCase {
    fn name(&self) -> &str {
        "UpperCase"
    }

    async fn handle(
        &self,
        payload: &Payload,
        _cancel: &CancellationToken,
    ) -> Result<Value, HandlerError> {
        let text = payload
            .get("text")
            .and_then(Value::as_str)
            .ok_or_else(|| HandlerError::failed("payload has no text"))?;
        Ok(json!({ "text": text.to_uppercase() }))
    }

    async fn handle_batch(
        &self,
        payloads: &[Payload],
        cancel: &CancellationToken,
    ) -> Result<Vec<Value>, HandlerError> {
        tracing::info!(batch_size = payloads.len(), "upper-casing batch");
        let mut out = Vec::with_capacity(payloads.len());
        for p in payloads {
            out.push(self.handle(p, cancel).await?);
        }
        Ok(out)
    }
}

/// (A) 設定を読み、サービスを registry に登録
fn build_registry() -> anyhow::Result<ServiceRegistry> {
    let mut registry = ServiceRegistry::new();

    let echo = FnHandler::new("Echo", |payload: Payload| async move {
        Ok::<_, HandlerError>(Value::Object(payload))
    });
    let echo_config = ServiceConfig::new("echo")
        .interface("/echo")
        .with_env("SPOOL_ECHO")
        .context("echo service config")?;
    registry.register(Service::new(echo_config, Arc::new(echo))?)?;

    let upper_config = ServiceConfig::new("upper")
        .interface("/upper")
        .consume_type(ConsumeType::Batch)
        .max_batch_size(4)
        .consume_worker(2)
        .with_env("SPOOL_UPPER")
        .context("upper service config")?;
    registry.register(Service::new(upper_config, Arc::new(UpperCase))?)?;

    Ok(registry)
}

/// (C) 各サービスにいくつか投入して、結果を表示
async fn drive(registry: &ServiceRegistry) -> anyhow::Result<()> {
    let mut handles = Vec::new();
    for service in registry.iter() {
        for n in 0..6 {
            let service = Arc::clone(service);
            handles.push(tokio::spawn(async move {
                let mut payload = Payload::new();
                payload.insert("task_type".into(), json!(service.name()));
                payload.insert("text".into(), json!(format!("hello spool #{n}")));
                service.submit(payload).await
            }));
        }
    }

    for handle in handles {
        let snapshot = handle.await??;
        println!("{}", serde_json::to_string(&snapshot)?);
    }

    for service in registry.iter() {
        println!("{}", serde_json::to_string(&service.status())?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "spool=info,spool_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let registry = build_registry()?;

    // (B) ワーカー起動
    registry.start_all()?;
    tracing::info!("{}", registry.describe());

    drive(&registry).await?;

    if !cli.once {
        tracing::info!("serving; press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    // (D) 停止: ワーカーを join し、残った task は failed にする
    registry.stop_all().await;
    Ok(())
}
