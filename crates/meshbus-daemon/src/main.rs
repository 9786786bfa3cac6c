//! meshbusd - the meshbus message-bus daemon, POSIX host.
//!
//! # Fork safety
//!
//! Daemonization via `fork()` must happen before the tokio runtime exists:
//! `fork()` duplicates only the calling thread, so forking a process that
//! already has runtime worker threads leaves mutexes locked forever in the
//! child. This binary therefore uses a synchronous `fn main()` that parses
//! options, loads configuration, drops privileges, forks, and writes the
//! pidfile in a single-threaded context, and only then constructs the
//! runtime and runs the async daemon via `block_on`.

use std::io::Write;
use std::os::unix::io::{FromRawFd, IntoRawFd};
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use meshbus_core::{BusConfig, BusType};
use meshbus_daemon::auth::InMemoryKeyStore;
use meshbus_daemon::Bus;

const EXIT_OK: i32 = 0;
const EXIT_OPTION_ERROR: i32 = 1;
const EXIT_CONFIG_ERROR: i32 = 2;
const EXIT_STARTUP_ERROR: i32 = 3;
const EXIT_FORK_ERROR: i32 = 4;
const EXIT_IO_ERROR: i32 = 5;
const EXIT_SESSION_ERROR: i32 = 6;

/// meshbus message bus daemon
#[derive(Parser, Debug)]
#[command(name = "meshbusd", disable_version_flag = true, about, long_about = None)]
struct Args {
    /// Print the version string and exit
    #[arg(long)]
    version: bool,

    /// Use the standard configuration for the per-login-session bus
    #[arg(long, conflicts_with_all = ["system", "config_file"])]
    session: bool,

    /// Use the standard configuration for the system bus
    #[arg(long, conflicts_with = "config_file")]
    system: bool,

    /// Use the specified configuration file
    #[arg(long, value_name = "FILE")]
    config_file: Option<PathBuf>,

    /// Print the listen addresses to stdout or the given descriptor
    #[arg(long, value_name = "FD", num_args = 0..=1, default_missing_value = "1")]
    print_address: Option<i32>,

    /// Print the process id to stdout or the given descriptor
    #[arg(long, value_name = "FD", num_args = 0..=1, default_missing_value = "1")]
    print_pid: Option<i32>,

    /// Fork and run in the background
    #[arg(long, conflicts_with = "nofork")]
    fork: bool,

    /// Run in the foreground, overriding the config file
    #[arg(long)]
    nofork: bool,

    /// Logging verbosity: 0 errors only .. 4 trace
    #[arg(long, value_name = "N", default_value_t = 1)]
    verbosity: u8,
}

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e)
            if matches!(
                e.kind(),
                clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
            ) =>
        {
            let _ = e.print();
            return EXIT_OK;
        }
        Err(e) => {
            let _ = e.print();
            return EXIT_OPTION_ERROR;
        }
    };

    if args.version {
        println!(
            "meshbus message bus daemon version {}",
            env!("CARGO_PKG_VERSION")
        );
        return EXIT_OK;
    }

    init_tracing(args.verbosity);

    let config_path = config_path(&args);
    let config = match &config_path {
        Some(path) => match BusConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("meshbusd: {e}");
                return EXIT_CONFIG_ERROR;
            }
        },
        None => BusConfig::default(),
    };

    if let Some(code) = drop_privileges(&config) {
        return code;
    }

    // Fork before any runtime thread exists.
    let should_fork = args.fork || (config.fork && !args.nofork);
    if should_fork {
        match unsafe { nix::unistd::fork() } {
            Ok(nix::unistd::ForkResult::Parent { .. }) => {
                // The parent's job is done.
                return EXIT_OK;
            }
            Ok(nix::unistd::ForkResult::Child) => {
                if nix::unistd::setsid().is_err() {
                    eprintln!("meshbusd: failed to create a new session");
                    return EXIT_SESSION_ERROR;
                }
            }
            Err(e) => {
                eprintln!("meshbusd: fork failed: {e}");
                return EXIT_FORK_ERROR;
            }
        }
    }

    let pid = std::process::id();
    if let Some(path) = &config.pidfile {
        if let Err(e) = std::fs::write(path, format!("{pid}\n")) {
            eprintln!("meshbusd: failed to write pidfile {}: {e}", path.display());
            return EXIT_IO_ERROR;
        }
    }
    if let Some(fd) = args.print_pid {
        if write_to_fd(fd, &format!("{pid}\n")).is_err() {
            eprintln!("meshbusd: failed to print pid to descriptor {fd}");
            return EXIT_IO_ERROR;
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("meshbusd: failed to start runtime: {e}");
            return EXIT_STARTUP_ERROR;
        }
    };
    let code = runtime.block_on(serve(args, config_path, config.clone()));

    if let Some(path) = &config.pidfile {
        let _ = std::fs::remove_file(path);
    }
    code
}

async fn serve(args: Args, config_path: Option<PathBuf>, config: BusConfig) -> i32 {
    let key_store = Arc::new(InMemoryKeyStore::new());
    let bus = match Bus::new(config, key_store) {
        Ok(bus) => bus,
        Err(e) => {
            error!(error = %e, "failed to build bus");
            return EXIT_STARTUP_ERROR;
        }
    };
    if let Err(e) = bus.start().await {
        error!(error = %e, "failed to start listening");
        return EXIT_STARTUP_ERROR;
    }

    if let Some(fd) = args.print_address {
        let addrs = bus.local_addresses().join(";");
        if write_to_fd(fd, &format!("{addrs}\n")).is_err() {
            error!(fd, "failed to print listen addresses");
            bus.shutdown().await;
            return EXIT_IO_ERROR;
        }
    }

    let mut hangup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to install signal handler");
            return EXIT_STARTUP_ERROR;
        }
    };
    let mut interrupt = signal(SignalKind::interrupt()).expect("signal handler");
    let mut terminate = signal(SignalKind::terminate()).expect("signal handler");

    loop {
        tokio::select! {
            _ = hangup.recv() => {
                reload(&bus, config_path.as_deref());
            }
            _ = interrupt.recv() => {
                info!("interrupt received");
                break;
            }
            _ = terminate.recv() => {
                info!("terminate received");
                break;
            }
        }
    }

    bus.shutdown().await;
    EXIT_OK
}

/// SIGHUP: re-read the configuration file. Only the auth-mechanism filter
/// is re-applied at runtime; a failed reload keeps the previous settings.
fn reload(bus: &Arc<Bus>, config_path: Option<&std::path::Path>) {
    let Some(path) = config_path else {
        info!("reload requested, but no config file to reload");
        return;
    };
    match BusConfig::from_file(path) {
        Ok(new_config) => {
            let retained = bus.apply_auth_filter(&new_config.auth_mechanisms);
            info!(
                path = %path.display(),
                mechanisms = retained,
                "configuration reloaded"
            );
        }
        Err(e) => {
            warn!(error = %e, "config reload failed, keeping previous configuration");
        }
    }
}

fn config_path(args: &Args) -> Option<PathBuf> {
    if let Some(path) = &args.config_file {
        return Some(path.clone());
    }
    if args.session {
        return Some(BusConfig::standard_path(BusType::Session));
    }
    if args.system {
        return Some(BusConfig::standard_path(BusType::System));
    }
    None
}

/// Maps `--verbosity=N` onto a tracing filter; `RUST_LOG` wins when set.
fn init_tracing(verbosity: u8) {
    let level = match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Drops root privileges to the configured user, if any.
fn drop_privileges(config: &BusConfig) -> Option<i32> {
    let Some(user) = &config.user else {
        return None;
    };
    if !nix::unistd::Uid::effective().is_root() {
        return None;
    }
    match nix::unistd::User::from_name(user) {
        Ok(Some(entry)) => {
            info!(user, "dropping root privileges");
            if let Err(e) = nix::unistd::setuid(entry.uid) {
                eprintln!("meshbusd: failed to drop privileges: {e}");
                return Some(EXIT_CONFIG_ERROR);
            }
            None
        }
        Ok(None) => {
            eprintln!("meshbusd: user does not exist: {user}");
            Some(EXIT_CONFIG_ERROR)
        }
        Err(e) => {
            eprintln!("meshbusd: user lookup failed: {e}");
            Some(EXIT_CONFIG_ERROR)
        }
    }
}

/// Writes `text` to a file descriptor without taking ownership of it.
fn write_to_fd(fd: i32, text: &str) -> std::io::Result<()> {
    if fd == 1 {
        let mut stdout = std::io::stdout();
        stdout.write_all(text.as_bytes())?;
        return stdout.flush();
    }
    // Borrow the caller-supplied descriptor; it stays open for the caller.
    let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
    let result = file.write_all(text.as_bytes()).and_then(|()| file.flush());
    let _ = file.into_raw_fd();
    result
}
