use std::path::PathBuf;

use anyhow::Result;
use clap::{Arg, Command};
use periscope_core::{grpc, http, Config, ServiceContext, PERISCOPE_VERSION};
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let matches = Command::new("periscope-receiver")
        .version(PERISCOPE_VERSION)
        .about("Periscope telemetry receiver")
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Path to the receiver configuration file")
                .default_value("receiver-config.yml"),
        )
        .get_matches();

    let config_path = PathBuf::from(matches.get_one::<String>("config").unwrap());
    let config = Config::load(&config_path)?;

    let context = ServiceContext::build(config).await?;
    context.start().await;

    let grpc_port = context.config.receiver.grpc_port;
    let http_port = context.config.receiver.http_port;
    let grpc_task = tokio::spawn(grpc::serve_grpc(
        grpc_port,
        context.grpc_services(),
        context.shutdown.clone(),
    ));
    let http_task = tokio::spawn(http::serve_http(
        http_port,
        context.http_state()?,
        context.shutdown.clone(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    context.stop();

    for (name, task) in [("grpc", grpc_task), ("http", http_task)] {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(server = name, %err, "server exited with error"),
            Err(err) => error!(server = name, %err, "server task panicked"),
        }
    }
    info!("all servers shut down gracefully");
    Ok(())
}
