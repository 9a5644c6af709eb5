use std::{io::Cursor, path::PathBuf, sync::Arc, time::Duration};

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Parser};
use tokio::{
    net::{TcpListener, TcpStream},
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
    time::timeout,
};
use tokio_rustls::TlsAcceptor;
use tracing::{info, warn};

use fleetbridge::{
    access::Capabilities,
    commands::Bridge,
    config::Config,
    directory::{Directory, InMemoryDirectory},
    logging, peer,
    server::{accept_loop, SessionTracker},
    session::{run_session, SessionIo},
    tls,
};

/// Startup budget for checking that the upstream answers at all.
const REACHABILITY_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Parser)]
#[command(
    name = "fleetbridge",
    version,
    about = "Remote control for a fleet-management server",
    arg_required_else_help = true
)]
struct Cli {
    /// Increase log verbosity (-v operator, -vv developer messages)
    #[arg(short = 'v', action = ArgAction::Count)]
    verbose: u8,

    /// Read configuration from FILE instead of the default location
    #[arg(short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Listen for TLS command sessions on PORT; client certificates
    /// with a configured access profile are required
    #[arg(short = 'l', value_name = "PORT")]
    listen: Option<u16>,

    /// Execute commands from STRING
    #[arg(short = 'e', value_name = "STRING")]
    execute: Vec<String>,

    /// Execute commands from FILE; non-regular files (FIFOs etc.) are
    /// processed concurrently as their own sessions
    #[arg(short = 'f', value_name = "FILE")]
    file: Vec<PathBuf>,

    /// Read from stdin even when -l, -e or -f is used
    #[arg(short = 'i')]
    interactive: bool,

    /// Upstream server, host[:port]
    target: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = Config::load_or_default(cli.config.clone()).context("loading configuration")?;
    let config = Arc::new(config);

    let target = cli
        .target
        .clone()
        .or_else(|| config.target.clone())
        .map(|addr| Config::normalize_target(&addr))
        .context("no upstream address given (argument or config `target`)")?;

    if config.modules.is_empty() && config.tls.is_none() {
        bail!("no module keywords and no TLS certificates configured => no service");
    }

    // collect -e strings and regular -f files into one batch buffer;
    // everything else becomes its own concurrent session
    let mut batch = String::new();
    for chunk in &cli.execute {
        batch.push('\n');
        batch.push_str(chunk);
    }
    let mut special_files = Vec::new();
    for path in &cli.file {
        match std::fs::metadata(path) {
            Err(err) => warn!("cannot stat {}: {err}", path.display()),
            Ok(meta) if meta.is_dir() => warn!("{} is a directory", path.display()),
            Ok(meta) if meta.is_file() => match std::fs::read_to_string(path) {
                Err(err) => warn!("cannot read {}: {err}", path.display()),
                Ok(content) => {
                    batch.push('\n');
                    batch.push_str(&content);
                }
            },
            Ok(_) => special_files.push(path.clone()),
        }
    }

    let directory: Arc<dyn Directory> = match &config.inventory {
        Some(path) => Arc::new(InMemoryDirectory::load(path).context("loading inventory")?),
        None => Arc::new(InMemoryDirectory::empty()),
    };

    let tls_config = match (&cli.listen, &config.tls) {
        (Some(_), None) => bail!("-l requires TLS certificates to be configured"),
        (Some(_), Some(settings)) => Some(tls::server_config(settings)?),
        (None, _) => None,
    };

    match timeout(REACHABILITY_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(_)) => {}
        _ => bail!("upstream {target} is not reachable"),
    }

    let bridge = Arc::new(Bridge {
        config: Arc::clone(&config),
        directory,
        target: target.clone(),
    });

    // the one upstream this process talks to always speaks the modern
    // dialect as far as we are concerned; the legacy sync fallback
    // stays dormant
    peer::peer(&target, &config).await?.set_modern(true);

    let (tracker, mut active) = SessionTracker::new();
    let legacy = Capabilities::legacy_defaults();
    let mut sessions_started = false;

    if !batch.trim().is_empty() {
        sessions_started = true;
        let guard = tracker.begin();
        let bridge = Arc::clone(&bridge);
        let io = SessionIo::new(
            Cursor::new(batch.into_bytes()),
            tokio::io::stdout(),
            "batch:/dev/stdout",
        );
        tokio::spawn(async move {
            let _guard = guard;
            run_session(bridge, io, legacy).await;
        });
    }

    for path in special_files {
        match tokio::fs::File::open(&path).await {
            Err(err) => warn!("cannot open {}: {err}", path.display()),
            Ok(file) => {
                sessions_started = true;
                let guard = tracker.begin();
                let bridge = Arc::clone(&bridge);
                let label = format!("{}:/dev/stdout", path.display());
                let io = SessionIo::new(file, tokio::io::stdout(), label);
                tokio::spawn(async move {
                    let _guard = guard;
                    run_session(bridge, io, legacy).await;
                });
            }
        }
    }

    let batch_given = !cli.execute.is_empty() || !cli.file.is_empty();
    let mut interactive_session: Option<JoinHandle<()>> = None;
    if cli.interactive || (cli.listen.is_none() && !batch_given) {
        sessions_started = true;
        let guard = tracker.begin();
        let bridge = Arc::clone(&bridge);
        let io = SessionIo::new(
            tokio::io::stdin(),
            tokio::io::stdout(),
            "interactive:/dev/stdin",
        );
        interactive_session = Some(tokio::spawn(async move {
            let _guard = guard;
            run_session(bridge, io, legacy).await;
        }));
    }

    let has_listener = cli.listen.is_some();
    if let Some(port) = cli.listen {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("cannot listen on port {port}"))?;
        info!("accepting connections on port {port}");
        let acceptor = TlsAcceptor::from(
            tls_config.expect("listener implies TLS configuration"),
        );
        let bridge = Arc::clone(&bridge);
        let tracker = tracker.clone();
        tokio::spawn(accept_loop(listener, acceptor, bridge, tracker));
    }

    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;
    let mut sigusr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    let mut sigusr2 = signal(SignalKind::user_defined2()).context("installing SIGUSR2 handler")?;
    let mut sigttin =
        signal(SignalKind::from_raw(libc::SIGTTIN)).context("installing SIGTTIN handler")?;
    let mut sigttou =
        signal(SignalKind::from_raw(libc::SIGTTOU)).context("installing SIGTTOU handler")?;

    // exit only when the session count falls back to zero while no
    // listener is active. Every local session registered its guard
    // synchronously above, so `sessions_started` cannot miss a session
    // that finished before this loop armed.
    let mut seen_positive = sessions_started;
    if seen_positive && *active.borrow() == 0 && !has_listener {
        info!("last connection closed => terminating");
        return Ok(());
    }
    loop {
        tokio::select! {
            _ = sighup.recv() => info!("received signal SIGHUP"),
            _ = sigusr1.recv() => info!("received signal SIGUSR1"),
            _ = sigusr2.recv() => info!("received signal SIGUSR2"),
            _ = sigttin.recv() => close_console(&mut interactive_session),
            _ = sigttou.recv() => close_console(&mut interactive_session),
            changed = active.changed() => {
                if changed.is_err() {
                    break;
                }
                let count = *active.borrow();
                if count > 0 {
                    seen_positive = true;
                } else if seen_positive && !has_listener {
                    info!("last connection closed => terminating");
                    break;
                }
            }
        }
    }

    Ok(())
}

fn close_console(session: &mut Option<JoinHandle<()>>) {
    if let Some(handle) = session.take() {
        info!("closing interactive console");
        handle.abort();
    }
}
