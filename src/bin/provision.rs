//! Operator tool: provisions users and api keys out-of-band. The service
//! itself only reads these tables.
//!
//! ```shell
//! provision --config config.toml user --handle alice
//! provision --config config.toml api-key --user <uuid> --label ci
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use neo_service_layer::config::load_config;
use neo_service_layer::database::methods::DbMethods as _;
use neo_service_layer::database::Database;
use neo_service_layer::error::ServiceError;

#[derive(Debug, Parser)]
#[command(version, about = "Provision users and api keys")]
struct Args {
    #[arg(long, env = "NEOSL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create a user.
    User {
        #[arg(long)]
        handle: String,
    },
    /// Create an api key for a user. The key is printed once and only
    /// its hash is stored.
    ApiKey {
        #[arg(long)]
        user: Uuid,
        #[arg(long, default_value = "")]
        label: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{err:#}");

            let code = err
                .downcast_ref::<ServiceError>()
                .map_or(1, |service_err| service_err.kind.exit_code());

            ExitCode::from(code as u8)
        }
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    let database = Database::new(&config.database).await?;

    match args.command {
        Command::User { handle } => {
            let id = Uuid::new_v4();
            database.pool.insert_user(id, &handle).await?;

            println!("{id}");
        }
        Command::ApiKey { user, label } => {
            let mut key_bytes = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut key_bytes);
            let api_key = format!("nsl_{}", hex::encode(key_bytes));
            let key_hash = hex::encode(Sha256::digest(api_key.as_bytes()));

            database
                .pool
                .insert_api_key(Uuid::new_v4(), user, &key_hash, &label)
                .await?;

            println!("{api_key}");
        }
    }

    Ok(())
}
