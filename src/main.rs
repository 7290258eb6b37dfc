use clap::Parser;
use logship::{NoOpEngine, Position, ReplicationConfig, ReplicationOptions, UntilCondition};
use slog::Drain;
use std::error::Error;
use std::path::PathBuf;
use tokio::time::Duration;

/// Replicates a primary's change log into a local no-op engine that logs every change.
#[derive(Parser, Debug)]
#[command(name = "logship", version)]
struct Args {
    /// This replica's server id. Must differ from the primary's.
    #[arg(long)]
    server_id: u32,
    #[arg(long, default_value = "127.0.0.1")]
    primary_host: String,
    #[arg(long, default_value_t = 3306)]
    primary_port: u16,
    #[arg(long, default_value = "repl")]
    user: String,
    #[arg(long, default_value = "")]
    password: String,
    /// Holds the relay log and the recovery records.
    #[arg(long)]
    data_dir: PathBuf,
    /// Where to start on first run, as `log_name:offset`.
    #[arg(long, value_parser = parse_position)]
    start_at: Option<Position>,
    /// Stop applying before this primary position, as `log_name:offset`.
    #[arg(long, value_parser = parse_position)]
    until: Option<Position>,
    /// Skip this many events before applying.
    #[arg(long)]
    skip: Option<u64>,
    /// Host to announce to the primary.
    #[arg(long)]
    report_host: Option<String>,
    #[arg(long, default_value_t = 3306)]
    report_port: u16,
    #[arg(long)]
    connect_retry_secs: Option<u64>,
    #[arg(long)]
    max_connect_retries: Option<u32>,
    #[arg(long)]
    heartbeat_ms: Option<u64>,
    #[arg(long)]
    relay_log_space_limit: Option<u64>,
    /// Drop the relay log on startup and refetch everything not yet applied.
    #[arg(long)]
    relay_log_recovery: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let logger = create_root_logger_for_stdout(args.server_id);

    let options = ReplicationOptions {
        connect_retry_interval: args.connect_retry_secs.map(Duration::from_secs),
        max_connect_retries: args.max_connect_retries,
        heartbeat_period: args.heartbeat_ms.map(Duration::from_millis),
        relay_log_space_limit: args.relay_log_space_limit,
        relay_log_recovery: Some(args.relay_log_recovery),
        ..Default::default()
    };
    let report_port = args.report_port;
    let config = ReplicationConfig {
        server_id: args.server_id,
        primary_host: args.primary_host,
        primary_port: args.primary_port,
        user: args.user,
        password: args.password,
        report_address: args.report_host.map(|host| (host, report_port)),
        data_directory: args.data_dir,
        initial_position: args.start_at,
        info_logger: logger.clone(),
        options,
    };
    let engine = NoOpEngine::new(logger.new(slog::o!("component" => "engine")));
    let replication = logship::try_create_replication(config, Box::new(engine))?;

    if let Some(skip) = args.skip {
        replication.set_skip_counter(skip).await?;
    }
    match args.until {
        Some(until) => {
            replication.start_fetcher().await;
            replication.start_applier_until(UntilCondition::Primary(until)).await?;
        }
        None => replication.start().await?,
    }

    tokio::signal::ctrl_c().await?;
    slog::info!(logger, "Stopping replication.");
    replication.stop().await?;

    println!("{:#?}", replication.status());
    Ok(())
}

fn parse_position(arg: &str) -> Result<Position, String> {
    let (log_name, offset) = arg
        .rsplit_once(':')
        .ok_or_else(|| format!("expected log_name:offset, got {:?}", arg))?;
    let offset = offset.parse().map_err(|e| format!("bad offset {:?}: {}", offset, e))?;
    Ok(Position::new(log_name, offset))
}

fn create_root_logger_for_stdout(server_id: u32) -> slog::Logger {
    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    slog::Logger::root(drain, slog::o!("ServerId" => server_id))
}
