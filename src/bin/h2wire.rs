// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use dotenv::dotenv;
use h2wire::service::setup_tracing;
use h2wire::utils::SessionExecutor;
use h2wire::{AppError, AppResult, EchoService, EngineConfig, Server, Shutdown};
use tokio::sync::broadcast;
use tokio::{runtime, signal};
use tracing::{error, info};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Option<Command>,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// run the echo server (default)
    Serve,
    PrintConfig,
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    let config_path = commandline.conf.as_ref().map_or_else(
        || {
            let mut path = PathBuf::from("./");
            path.push("conf.toml");
            path
        },
        PathBuf::from,
    );
    let config = EngineConfig::set_up_config(config_path)?;

    if let Some(Command::PrintConfig) = commandline.command {
        println!("{:#?}", config);
        return Ok(());
    }

    let level = match commandline.verbose {
        0 => config.log.level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let _tracing_guard = setup_tracing(&config.log.dir, level)?;

    let rt = runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()?;

    let config = Arc::new(config);
    let executor = SessionExecutor::new(&config.session_executor, rt.handle().clone());
    let (notify_shutdown, _) = broadcast::channel(1);

    rt.block_on(async {
        let server = Server::bind(config.clone(), executor, Arc::new(EchoService)).await?;
        info!("h2wire echo server listening on {}", server.local_addr()?);

        let shutdown = Shutdown::new(notify_shutdown.subscribe());
        let server_task = tokio::spawn(async move { server.run(shutdown).await });

        if let Err(e) = signal::ctrl_c().await {
            error!("failed to listen for the shutdown signal: {}", e);
        }
        info!("get shutdown signal");
        let _ = notify_shutdown.send(());

        match server_task.await {
            Ok(result) => result,
            Err(join_error) => {
                if join_error.is_panic() {
                    let panic = join_error.into_panic();
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    error!("server task panicked: {}", message);
                }
                Err(AppError::IllegalStateError("server task aborted".to_string()))
            }
        }
    })?;

    info!("h2wire shutdown complete");
    Ok(())
}
