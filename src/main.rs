use anyhow::{bail, Context};
use clap::Parser;
use pg_relay::{Config, PipelineHandle, Replicator};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

#[derive(Parser, Debug)]
#[command(name = "pg-relay")]
#[command(about = "PostgreSQL to PostgreSQL table replicator", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "FILE", default_value = "pg-relay.toml")]
    config: PathBuf,

    #[arg(short, long, help = "Enable JSON output for logs")]
    json_logs: bool,

    #[arg(short, long, help = "Verbose logging")]
    verbose: bool,

    #[arg(long, help = "Skip creating target tables, publication and slot")]
    skip_setup: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(args.json_logs, args.verbose);

    info!("Starting pg-relay");
    info!("Loading configuration from {:?}", args.config);

    let config = Config::from_file(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    info!(
        source_host = %config.source.host,
        source_database = %config.source.database,
        target_host = %config.target.host,
        target_database = %config.target.database,
        publication = %config.replication.publication,
        slot = %config.replication.slot_name,
        tables = config.tables.len(),
        "Configuration summary"
    );

    let replicator = Replicator::new(config).context("Invalid table mappings")?;

    if !args.skip_setup {
        replicator
            .prepare()
            .await
            .context("Failed to prepare target tables and replication")?;
    }

    let pipeline = replicator
        .start()
        .await
        .context("Failed to start the replication pipeline")?;

    console(&pipeline).await;

    println!("Shutting down, waiting for running batches to finish...");
    let report = pipeline.shutdown().await;

    println!(
        "Stopped. {} records handled, {} left unapplied in the queue.",
        report.records_handled, report.records_left_queued
    );
    if let Some(summary) = &report.dispatch {
        println!(
            "{} batches, {} records applied, {} lost.",
            summary.batches, summary.records_applied, summary.records_lost
        );
    }

    if let Some(e) = report.reader_error {
        error!(error = %e, "Stream reader ended with an error");
        bail!("replication stopped: {}", e);
    }
    if let Some(e) = report.dispatcher_error {
        error!(error = %e, "Dispatcher ended with an error");
        bail!("apply stopped: {}", e);
    }
    Ok(())
}

/// Runs the interactive menu until the user quits or the pipeline stops
/// on its own.
async fn console(pipeline: &PipelineHandle) {
    println!("Replication running.");
    println!("  i - show records handled");
    println!("  q - quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = pipeline.cancelled() => {
                warn!("Pipeline stopped on its own");
                println!("The pipeline stopped because of an error, see the log.");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => match line.trim() {
                    "q" => break,
                    "i" => println!(
                        "{} records handled, {} queued",
                        pipeline.records_handled(),
                        pipeline.records_queued()
                    ),
                    "" => {}
                    other => println!("Unknown command '{}'", other),
                },
                // no console: keep running until a signal
                closed => {
                    if let Err(e) = closed {
                        warn!(error = %e, "Could not read the console");
                    }
                    tokio::select! {
                        _ = tokio::signal::ctrl_c() => info!("Interrupted"),
                        _ = pipeline.cancelled() => warn!("Pipeline stopped on its own"),
                    }
                    break;
                }
            },
        }
    }
}

fn init_logging(json: bool, verbose: bool) {
    let env_filter = if verbose {
        EnvFilter::new("pg_relay=debug,info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pg_relay=info,warn"))
    };

    let fmt_layer = if json {
        tracing_subscriber::fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(false)
            .with_span_list(false)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .init();
}
