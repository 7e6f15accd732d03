use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info};

use xfront_core::config::ConfigLoader;
use xfront_core::telemetry;
use xfront_server::{LocalEngine, LocalUser, ServerHandle};

/// Poll interval for noticing a stop triggered by the server itself.
const STOP_POLL: Duration = Duration::from_millis(500);

#[derive(Parser, Debug)]
#[command(name = "xfront", version, about = "Connection front-end for a database server")]
struct Cli {
    /// Config file path.
    #[arg(short, long, env = "XFRONT_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address, `host` or `host/namespace` (overrides config).
    #[arg(long)]
    bind: Option<String>,

    /// TCP port (overrides config).
    #[arg(long)]
    port: Option<u16>,

    /// Local socket path (overrides config).
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Account of the built-in engine as `name:password[:admin]`; repeatable.
    #[arg(long = "user", value_parser = parse_user)]
    users: Vec<LocalUser>,

    /// Print the effective configuration as TOML and exit.
    #[arg(long)]
    print_config: bool,
}

fn parse_user(value: &str) -> std::result::Result<LocalUser, String> {
    let mut parts = value.splitn(3, ':');
    let name = parts.next().filter(|n| !n.is_empty()).ok_or("missing user name")?;
    let password = parts.next().unwrap_or_default();
    let user = LocalUser::new(name, password);
    match parts.next() {
        None => Ok(user),
        Some("admin") => Ok(user.privileged()),
        Some(other) => Err(format!("unknown user flag '{other}'")),
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_file(path);
    }
    let mut config = loader.load().context("loading configuration")?;

    if let Some(bind) = cli.bind {
        config.network.bind_address = bind;
    }
    if let Some(port) = cli.port {
        config.network.port = port;
    }
    if let Some(socket) = cli.socket {
        config.network.socket = Some(socket);
    }

    if cli.print_config {
        println!("{}", toml::to_string_pretty(&config).context("serializing configuration")?);
        return Ok(());
    }

    telemetry::init_logging(&config.logging).context("initializing logging")?;
    info!(version = xfront_core::VERSION, "Starting xfront");

    let engine = cli.users.into_iter().fold(LocalEngine::new(), LocalEngine::with_user);
    let ready_timeout = config.network.engine_ready_timeout() + config.network.port_open_timeout();

    let handle = ServerHandle::new();
    if let Err(e) = handle.start(config, Arc::new(engine)) {
        error!(error = %e, "Front-end failed to start");
        std::process::exit(e.exit_code());
    }
    let startup = handle
        .instance()
        .map_or(Ok(()), |core| core.wait_for_startup(ready_timeout + Duration::from_secs(5)));
    if let Err(e) = startup {
        error!(error = %e, "Front-end failed to start");
        handle.exit();
        std::process::exit(e.exit_code());
    }

    wait_for_shutdown(&handle)?;
    handle.exit();
    info!("xfront stopped");
    Ok(())
}

/// Block until Ctrl-C or until the server stops on its own.
fn wait_for_shutdown(handle: &ServerHandle) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building signal runtime")?;

    runtime.block_on(async {
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut poll = tokio::time::interval(STOP_POLL);

        loop {
            tokio::select! {
                result = &mut ctrl_c => {
                    result.context("listening for Ctrl-C")?;
                    info!("Interrupt received, shutting down");
                    handle.request_exit();
                    return Ok(());
                }
                _ = poll.tick() => {
                    if handle.is_stopped() {
                        return Ok(());
                    }
                }
            }
        }
    })
}
