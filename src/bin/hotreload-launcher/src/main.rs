use std::{
    ffi::{c_char, CString},
    path::PathBuf,
    sync::Arc,
};

use clap::Parser;
use hotreload::{migrate::host::DetachedHost, HotReloadService, ReloadConfig, StatsCollector};
use miette::IntoDiagnostic;
use tracing::{info, Level};

#[derive(clap::Parser, Clone, Debug)]
struct Cli {
    /// Object to link at startup [default: ./output.bootstrap.o].
    #[clap(long, short)]
    bootstrap: Option<PathBuf>,
    /// Port of the reload listener [default: 5567].
    #[clap(long, short)]
    port: Option<u16>,
    /// Entry symbol of the bootstrap object [default: Konan_start].
    #[clap(long)]
    entry: Option<String>,
    /// Run without the reload listener.
    #[clap(long)]
    no_server: bool,
    #[clap(long, short)]
    verbose: bool,
    /// Arguments passed to the entry point.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("failed to set up logging: {}", e);
    }

    match run(cli) {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("{:?}", e);
            std::process::exit(1);
        }
    }
}

fn run(cli: Cli) -> miette::Result<i32> {
    let mut config = ReloadConfig::from_env()?;
    if let Some(path) = cli.bootstrap {
        config = config.with_bootstrap_path(path);
    }
    if let Some(port) = cli.port {
        config = config.with_port(port);
    }
    if let Some(entry) = cli.entry {
        config = config.with_entry_symbol(entry);
    }

    let service = Arc::new(HotReloadService::new(
        config,
        Arc::new(DetachedHost),
        Arc::new(StatsCollector::new()),
    )?);
    let entry = service.load_bootstrap()?;
    if !cli.no_server {
        let addr = service.start_server()?;
        info!("accepting reload requests on {}", addr);
    }

    let program = std::env::args().next().unwrap_or_default();
    let args = std::iter::once(program)
        .chain(cli.args)
        .map(CString::new)
        .collect::<Result<Vec<_>, _>>()
        .into_diagnostic()?;
    let mut argv: Vec<*const c_char> = args.iter().map(|a| a.as_ptr()).collect();
    argv.push(std::ptr::null());

    // Safety: the entry point follows the C `main` convention, and `argv` outlives the call.
    let code = unsafe { entry(args.len() as i32, argv.as_ptr()) };
    info!("entry point returned {}", code);
    service.stop_server();
    Ok(code)
}
