use anyhow::{Context, anyhow};
use param_table::config::Config;
use param_table::context::ProcessContext;
use param_table::delegate::param::Param;
use param_table::delegate::sgd::{SgdConfig, SgdHandler};
use param_table::delegate::table_delegate::TableDelegate;
use param_table::server::coordinator::Coordinator;
use param_table::server::table_server::TableServer;
use param_table::transport::http::HttpFabric;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const PARAM_TABLE_ID: u32 = 0;

struct Args {
    config: PathBuf,
    rank: Option<usize>,
    steps: u64,
    param_len: usize,
}

fn parse_args() -> anyhow::Result<Args> {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 3 {
        eprintln!(
            "Usage: {} --config <job.json> [--rank <n>] [--steps <n>] [--param-len <n>]",
            args[0]
        );
        eprintln!("Example: {} --config job.json --rank 0", args[0]);
        std::process::exit(1);
    }

    let mut config = None;
    let mut rank = None;
    let mut steps = 10;
    let mut param_len = 1000;

    let mut i = 1;
    while i < args.len() {
        let value = || {
            args.get(i + 1)
                .ok_or_else(|| anyhow!("{} needs a value", args[i]))
        };
        match args[i].as_str() {
            "--config" => config = Some(PathBuf::from(value()?)),
            "--rank" => rank = Some(value()?.parse()?),
            "--steps" => steps = value()?.parse()?,
            "--param-len" => param_len = value()?.parse()?,
            other => {
                tracing::warn!("Ignoring unknown argument {}", other);
                i += 1;
                continue;
            }
        }
        i += 2;
    }

    Ok(Args {
        config: config.ok_or_else(|| anyhow!("--config is required"))?,
        rank,
        steps,
        param_len,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = parse_args()?;
    let mut config = Config::from_json_file(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?
        .apply_env()?;
    if let Some(rank) = args.rank {
        config.rank = rank;
    }
    config.validate()?;

    tracing::info!("Starting rank {} of {}", config.rank, config.size);

    let (fabric, inbox) = HttpFabric::bind(config.rank, config.peers.clone()).await?;
    let ctx = ProcessContext::start(config, fabric, inbox).await?;

    let handler = Arc::new(SgdHandler::new(SgdConfig::default()));
    let delegate = TableDelegate::for_context(&ctx, PARAM_TABLE_ID, handler)?;

    if ctx.config().is_coordinator() {
        let mut coordinator = Coordinator::new(ctx.clone())?;
        coordinator.init_table_servers().await?;
        coordinator.serve_barrier().await?;
        coordinator.wait_for_job_end().await?;
        return Ok(());
    }

    let server = TableServer::new(ctx.clone());
    server.start()?;
    server.wait_assigned().await?;

    let mut param = Param::new(1, vec![1.0; args.param_len]);
    let splits = delegate.register(&param)?;
    tracing::info!("Param {} uses {} splits", param.id, splits);

    if ctx.rank() == 0 {
        delegate.put(&param, 0)?;
    }
    server.barrier().await?;

    for step in 0..args.steps {
        delegate.get(&mut param, step).await?;
        param.grad = param.data.iter().map(|v| v * 0.1).collect();
        delegate.update(&param, step)?;

        let norm: f32 = param.data.iter().map(|v| v * v).sum::<f32>().sqrt();
        tracing::info!("Rank {} step {}: |param| = {:.4}", ctx.rank(), step, norm);
    }

    server.shutdown().await?;
    Ok(())
}
