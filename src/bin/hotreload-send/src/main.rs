use std::{net::TcpStream, path::PathBuf};

use clap::Parser;
use hotreload::{config::DEFAULT_PORT, ReloadRequest};
use miette::IntoDiagnostic;
use tracing::{info, Level};

/// Ask a running program to reload the given objects or libraries, in order.
#[derive(clap::Parser, Clone, Debug)]
struct Cli {
    #[clap(long, default_value = "127.0.0.1")]
    host: String,
    #[clap(long, short, default_value_t = DEFAULT_PORT)]
    port: u16,
    #[clap(required = true)]
    paths: Vec<PathBuf>,
}

fn main() -> miette::Result<()> {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_max_level(Level::INFO)
            .with_target(false)
            .without_time()
            .finish(),
    )
    .into_diagnostic()?;

    let cli = Cli::parse();
    let paths = cli
        .paths
        .iter()
        .map(|p| std::fs::canonicalize(p).unwrap_or_else(|_| p.clone()))
        .collect::<Vec<_>>();
    let request = ReloadRequest::new(paths);

    let mut stream = TcpStream::connect((cli.host.as_str(), cli.port)).into_diagnostic()?;
    request.write_to(&mut stream).into_diagnostic()?;
    info!(
        "sent {} path(s) to {}:{}",
        request.paths.len(),
        cli.host,
        cli.port
    );
    Ok(())
}
