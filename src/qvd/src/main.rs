use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Timelike;
use env_logger::fmt::Color;
use nix::sys::signal;
use structopt::clap::ErrorKind as ClapErrorKind;
use structopt::StructOpt;

use qvd::config::{Config, ServerConfig};
use qvd::server::RmiServer;

const EXIT_STARTUP_FAILURE: i32 = 1;
const EXIT_BAD_ARGS: i32 = 2;

#[derive(Debug, Clone, StructOpt)]
#[structopt(name = "quo-vadisd")]
struct Opts {
    /// Stay attached to the terminal instead of daemonizing.
    #[structopt(long)]
    foreground: bool,
    /// Socket URL, e.g. tcp://127.0.0.1:55995 or unix:///run/qv.sock.
    #[structopt(long)]
    url: Option<String>,
    /// Optional TOML configuration file.
    #[structopt(short, long)]
    config: Option<PathBuf>,
}

static TERMINATE: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_signal(_sig: i32) {
    TERMINATE.store(true, Ordering::Relaxed);
}

fn install_signal_handlers() -> nix::Result<()> {
    let action = signal::SigAction::new(
        signal::SigHandler::Handler(handle_signal),
        signal::SaFlags::empty(),
        signal::SigSet::empty(),
    );
    unsafe {
        signal::sigaction(signal::SIGINT, &action)?;
        signal::sigaction(signal::SIGTERM, &action)?;
    }
    Ok(())
}

/// Forks and detaches from the controlling terminal; the parent exits as
/// daemon(3) would.
fn become_session_leader() -> nix::Result<()> {
    match unsafe { nix::unistd::fork() }? {
        nix::unistd::ForkResult::Parent { .. } => std::process::exit(0),
        nix::unistd::ForkResult::Child => {}
    }
    nix::unistd::setsid()?;
    Ok(())
}

fn close_stray_fds() {
    let mut rl = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // Default when the limit is unbounded.
    let mut maxfd: u64 = 1024;
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut rl) } == 0
        && rl.rlim_max != libc::RLIM_INFINITY
    {
        maxfd = rl.rlim_max;
    }
    for fd in 0..maxfd {
        unsafe { libc::close(fd as i32) };
    }
}

fn init_logger() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let time = chrono::Local::now();
            let style = buf
                .style()
                .set_color(Color::Black)
                .set_intense(true)
                .clone();
            let time = format!(
                "{:02}:{:02}:{:02}.{:03}",
                time.hour() % 24,
                time.minute(),
                time.second(),
                time.timestamp_subsec_millis()
            );
            writeln!(
                buf,
                "{}{} {} {}{} {}",
                style.value("["),
                time,
                buf.default_styled_level(record.level()),
                record.module_path().unwrap_or(""),
                style.value("]"),
                record.args()
            )
        })
        .init();
}

fn main() {
    better_panic::install();

    let opts = match Opts::from_iter_safe(std::env::args()) {
        Ok(opts) => opts,
        Err(e)
            if e.kind == ClapErrorKind::HelpDisplayed
                || e.kind == ClapErrorKind::VersionDisplayed =>
        {
            print!("{e}");
            std::process::exit(0);
        }
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(EXIT_BAD_ARGS);
        }
    };

    init_logger();

    let config = match &opts.config {
        Some(path) => match Config::from_path(path) {
            Ok(config) => config,
            Err(e) => {
                log::error!("cannot read {}: {e}", path.display());
                std::process::exit(EXIT_BAD_ARGS);
            }
        },
        None => Config::default(),
    };
    let server_config = match ServerConfig::resolve(opts.url.as_deref(), &config) {
        Ok(server_config) => server_config,
        Err(rc) => {
            log::error!("invalid server URL ({rc})");
            std::process::exit(EXIT_BAD_ARGS);
        }
    };

    if !opts.foreground {
        // Clear umask; this call always succeeds.
        nix::sys::stat::umask(nix::sys::stat::Mode::empty());
        if let Err(e) = become_session_leader() {
            log::error!("cannot become session leader: {e}");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
        close_stray_fds();
    }

    if let Err(e) = install_signal_handlers() {
        log::error!("cannot install signal handlers: {e}");
        std::process::exit(EXIT_STARTUP_FAILURE);
    }

    let mut server = match RmiServer::start(&server_config) {
        Ok(server) => server,
        Err(rc) => {
            log::error!("server start failed ({rc})");
            std::process::exit(EXIT_STARTUP_FAILURE);
        }
    };
    log::info!("quo-vadisd serving at {}", server.url());

    while !TERMINATE.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(100));
    }
    server.shutdown();
}
