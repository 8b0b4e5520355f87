use clap::Parser;
use log::{error, info};
use shardmerge_lib::{CliArgs, MigratorConfig};
use std::process;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match MigratorConfig::from_args(CliArgs::parse()) {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            process::exit(1);
        }
    };

    match shardmerge_lib::run(config).await {
        Ok(summary) => {
            info!(
                "Migrated {} databases in run {} ({} temporary keys dropped)",
                summary.databases.len(),
                summary.run_id,
                summary.temporary_keys_dropped
            );
        }
        Err(e) => {
            error!("Migration failed: {}", e);
            process::exit(1);
        }
    }
}
