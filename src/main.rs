use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use certdeploy_lib::{CancellationToken, DeployConfig, ProviderRegistry};
use clap::Parser;
use log::{error, info, warn};

#[derive(Parser)]
#[command(name = "certdeploy")]
#[command(about = "Upload a certificate once and deploy it to a cloud platform", long_about = None)]
struct Args {
    /// Deployment config (JSON)
    #[arg(long)]
    config: PathBuf,

    /// Certificate chain, PEM
    #[arg(long)]
    cert: PathBuf,

    /// Private key, PEM
    #[arg(long)]
    key: PathBuf,
}

async fn run(args: Args) -> Result<()> {
    let config = DeployConfig::load(&args.config)?;
    let cert_pem = tokio::fs::read_to_string(&args.cert)
        .await
        .with_context(|| format!("failed to read {}", args.cert.display()))?;
    let key_pem = tokio::fs::read_to_string(&args.key)
        .await
        .with_context(|| format!("failed to read {}", args.key.display()))?;

    let deployer = ProviderRegistry::with_defaults().build(&config)?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling deployment");
            on_signal.cancel();
        }
    });

    info!("deploying to provider {}", config.provider);
    let result = deployer.deploy(&cancel, &cert_pem, &key_pem).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("deployment failed: {err:#}");
            ExitCode::FAILURE
        }
    }
}
