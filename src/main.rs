use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use neo_service_layer::app::{self, App};
use neo_service_layer::config::load_config;
use neo_service_layer::error::ServiceError;
use neo_service_layer::server;
use neo_service_layer::shutdown::Shutdown;
use neo_service_layer::task_monitor::TaskMonitor;

#[derive(Debug, Parser)]
#[command(version, about = "Neo-N3 service layer")]
struct Args {
    /// Path to the TOML configuration file. Environment variables with
    /// the NEOSL__ prefix override file values.
    #[arg(long, env = "NEOSL_CONFIG")]
    config: Option<PathBuf>,
}

fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            return ExitCode::from(1);
        }
    };

    match runtime.block_on(run(args)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err:#}");

            let code = err
                .downcast_ref::<ServiceError>()
                .map_or(1, |service_err| service_err.kind.exit_code());

            ExitCode::from(code as u8)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;

    app::log_startup(&config.service.service_name);

    let app: Arc<App> = App::new(config.clone()).await?;
    app.bootstrap().await?;

    let (shutdown_timeout, shutdown_delay) = app.shutdown_config();
    let shutdown = Shutdown::spawn(shutdown_timeout, shutdown_delay);

    TaskMonitor::init(app.clone(), shutdown.clone()).await;

    server::run(app, config.server, shutdown.clone()).await?;

    info!("Server stopped, exiting");

    Ok(())
}
