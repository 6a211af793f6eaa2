use anyhow::Context;
use loadgen::config::Config;
use loadgen::status::{self, StatusState};
use loadgen::{HttpTransport, LoadTest};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the Prometheus recorder; workers record into it from then on
fn setup_prometheus_metrics() -> anyhow::Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")
}

async fn run() -> anyhow::Result<ExitCode> {
    let prometheus_handle = setup_prometheus_metrics()?;

    let config = Config::from_env();
    info!("Loading plan from {:?}", config.plan_path);
    let plan = config
        .load()
        .with_context(|| format!("Invalid load test plan {:?}", config.plan_path))?;
    info!(
        "Target {}: {} stages over {:?}, {} endpoints, {} thresholds",
        plan.base_url,
        plan.stages.len(),
        plan.total_duration(),
        plan.endpoints.len(),
        plan.thresholds.len()
    );

    let max_workers = plan.stages.iter().map(|s| s.target).max().unwrap_or(0);
    let transport = HttpTransport::new(&plan.base_url, max_workers, plan.request_timeout)
        .context("Failed to build HTTP client")?;

    let status_addr = plan.status_addr;
    let test = LoadTest::new(plan, Arc::new(transport))?;

    if let Some(addr) = status_addr {
        let state = StatusState::new(test.subscribe()).with_prometheus(prometheus_handle);
        tokio::spawn(async move {
            if let Err(e) = status::serve(addr, state).await {
                warn!("Status server stopped: {}", e);
            }
        });
    }

    let interrupt = test.interrupt_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Received Ctrl+C, draining workers");
            interrupt.cancel();
        }
    });

    let report = test.run().await?;

    println!("{}", report.summary());
    println!("JSON: {}", report.to_json()?);

    Ok(ExitCode::from(report.exit_code()))
}

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "loadgen=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
