//! Script Host
//!
//! Runs script calls through the executor registry from the command line.

use std::path::PathBuf;
use std::time::Instant;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::info;

use script_host::config::HostConfig;
use script_host::host::Host;
use script_host::logging;
use script_runtime::Runtime;

/// Script runtime executor host
#[derive(Parser, Debug)]
#[command(name = "script-host")]
#[command(about = "Call script modules through pooled executors", long_about = None)]
struct Args {
    /// Path to the config file (defaults to ./script-host.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show registered executors and loaded modules
    List,

    /// Call one method and print the result as JSON
    Call {
        module: String,

        /// Class to instantiate; omit for module-level functions
        #[arg(long, default_value = "")]
        class: String,

        method: String,

        /// Arguments as a JSON array
        #[arg(long, default_value = "[]")]
        args: String,

        /// Go through a worker pool instead of calling inline
        #[arg(long = "async")]
        run_async: bool,
    },

    /// Fire concurrent calls at a pooled executor and report wall time
    Bench {
        #[arg(long, default_value = "Core")]
        module: String,

        #[arg(long, default_value = "Client")]
        class: String,

        #[arg(long, default_value = "sleep_ms")]
        method: String,

        #[arg(long, default_value_t = 5)]
        calls: usize,

        #[arg(long, default_value_t = 2)]
        threads: usize,

        #[arg(long, default_value_t = 50)]
        delay_ms: u64,
    },

    /// Print the effective configuration as TOML
    Config,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = HostConfig::load(args.config.as_deref()).context("loading configuration")?;
    logging::init(&config.logging);

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(run(args.command, config))
}

async fn run(command: Command, config: HostConfig) -> Result<()> {
    info!("Starting script host v{}", env!("CARGO_PKG_VERSION"));
    let host = Host::start(Runtime::global(), &config)?;
    let result = dispatch(&host, &config, command).await;
    host.shutdown();
    result
}

async fn dispatch(host: &Host, config: &HostConfig, command: Command) -> Result<()> {
    let registry = host.registry();

    match command {
        Command::Config => {
            print!("{}", config.to_toml()?);
        }
        Command::List => {
            println!("{}", serde_json::to_string_pretty(&host.describe())?);
        }
        Command::Call {
            module,
            class,
            method,
            args,
            run_async,
        } => {
            let args: Vec<Value> = serde_json::from_str(&args).context("--args must be a JSON array")?;
            if !registry.has_executor(&module, &class) {
                registry.try_register(&module, &class, run_async, 0)?;
            }
            let value: Value = if run_async {
                registry.call_async::<Value>(&module, &class, &method, args)?.await?
            } else {
                registry.call_sync::<Value>(&module, &class, &method, args)?
            };
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Command::Bench {
            module,
            class,
            method,
            calls,
            threads,
            delay_ms,
        } => {
            if threads == 0 {
                bail!("--threads must be at least 1");
            }
            if !registry.has_executor(&module, &class) {
                registry.try_register(&module, &class, true, threads)?;
            }

            let start = Instant::now();
            let futures = (0..calls)
                .map(|_| registry.call_async::<Value>(&module, &class, &method, (delay_ms,)))
                .collect::<Result<Vec<_>, _>>()?;
            let results = futures::future::join_all(futures).await;
            let elapsed = start.elapsed();

            let failed = results.iter().filter(|r| r.is_err()).count();
            info!(calls, failed, elapsed_ms = elapsed.as_millis() as u64, "Bench finished");
            println!(
                "{} calls of {}::{}.{}({}) in {:?} ({} failed)",
                calls, module, class, method, delay_ms, elapsed, failed
            );
        }
    }
    Ok(())
}
