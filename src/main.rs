//! Botster Hub CLI - manages autonomous coding agents for GitHub issues.
//!
//! Binary entry point; the `botster_hub` library holds the functionality.

use anyhow::Result;
use botster_hub::{auth, config::Config, hub::Hub, keyring::Credentials, tui};
use clap::{Parser, Subcommand};
use crossterm::event::EnableMouseCapture;
use crossterm::execute;
use crossterm::terminal::{enable_raw_mode, EnterAlternateScreen};
use mimalloc::MiMalloc;
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

/// mimalloc outperforms the system allocator under the hub's
/// many-small-allocation workload (frames, cells, JSON).
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Exit code for configuration-level failures.
const EXIT_MISCONFIGURED: i32 = 2;
/// Exit code after SIGINT.
const EXIT_SIGINT: i32 = 130;

/// Signal-triggered shutdown flag (Arc for signal-hook registration).
static SHUTDOWN_FLAG: std::sync::LazyLock<Arc<AtomicBool>> =
    std::sync::LazyLock::new(|| Arc::new(AtomicBool::new(false)));

#[derive(Parser)]
#[command(name = "botster-hub")]
#[command(version = botster_hub::constants::VERSION)]
#[command(about = "Interactive PTY-based daemon for GitHub automation")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hub.
    Start {
        /// Run without the TUI (daemon/CI mode).
        #[arg(long)]
        headless: bool,
    },
    /// Authenticate this device with the control server.
    Login,
    /// Print the browser connection URL for a running hub.
    GetConnectionUrl {
        /// Hub identifier.
        #[arg(long)]
        hub: String,
    },
    /// Remove all botster data (credentials, config, device identity).
    Reset {
        /// Skip the confirmation prompt.
        #[arg(long, short = 'y')]
        yes: bool,
    },
}

fn main() {
    setup_logging();
    setup_panic_hook();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Start { headless } => {
            if headless {
                run_headless()
            } else {
                run_with_tui()
            }
        }
        Commands::Login => run_login(),
        Commands::GetConnectionUrl { hub } => run_get_connection_url(&hub),
        Commands::Reset { yes } => run_reset(yes),
    };

    match result {
        Ok(()) => {
            if SHUTDOWN_FLAG.load(std::sync::atomic::Ordering::Relaxed) {
                std::process::exit(EXIT_SIGINT);
            }
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            let code = if is_config_error(&e) { EXIT_MISCONFIGURED } else { 1 };
            std::process::exit(code);
        }
    }
}

/// File logging keeps the TUI's stdout clean.
fn setup_logging() {
    let log_path = if let Ok(path) = std::env::var("BOTSTER_LOG_FILE") {
        std::path::PathBuf::from(path)
    } else if let Ok(dir) = std::env::var("BOTSTER_CONFIG_DIR") {
        std::path::PathBuf::from(dir).join("botster-hub.log")
    } else {
        std::env::temp_dir().join("botster-hub.log")
    };

    match std::fs::File::create(&log_path) {
        Ok(log_file) => {
            env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or("info"),
            )
            .target(env_logger::Target::Pipe(Box::new(log_file)))
            .format_timestamp_secs()
            .init();
        }
        Err(e) => {
            eprintln!("warning: could not open log file {}: {e}", log_path.display());
            env_logger::Builder::from_env(
                env_logger::Env::default().default_filter_or("warn"),
            )
            .init();
        }
    }
}

/// Log panics and restore the terminal before the default handler runs.
fn setup_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {panic_info:?}");
        let _ = crossterm::terminal::disable_raw_mode();
        let _ = execute!(
            std::io::stdout(),
            crossterm::terminal::LeaveAlternateScreen,
            crossterm::event::DisableMouseCapture,
            crossterm::cursor::Show
        );
        default_hook(panic_info);
    }));
}

fn register_signal_handlers() -> Result<()> {
    use signal_hook::consts::signal::{SIGHUP, SIGINT, SIGTERM};
    use signal_hook::flag;
    flag::register(SIGINT, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGTERM, Arc::clone(&SHUTDOWN_FLAG))?;
    flag::register(SIGHUP, Arc::clone(&SHUTDOWN_FLAG))?;
    Ok(())
}

/// Validate the stored token, running the device flow when needed.
fn ensure_authenticated() -> Result<()> {
    if botster_hub::env::is_test_mode() {
        log::info!("skipping authentication (BOTSTER_ENV=test)");
        return Ok(());
    }

    let mut config = Config::load()?;

    if config.has_token() && auth::validate_token(&config.server_url, &config.token) {
        println!("  Authentication valid.");
        return Ok(());
    }

    if config.has_token() {
        println!("Token invalid or expired. Re-authenticating...");
    }
    let token = auth::device_flow(&config.server_url)?;
    config.save_token(&token)?;
    config.save()?;
    println!("  Token saved.");
    Ok(())
}

fn run_headless() -> Result<()> {
    println!(
        "Starting Botster Hub v{} in headless mode...",
        botster_hub::constants::VERSION
    );
    ensure_authenticated()?;
    register_signal_handlers()?;

    let config = Config::load()?;
    let mut hub = Hub::new(config)?;

    println!("Setting up connections...");
    hub.setup();
    hub.write_connection_url();

    println!("Hub ready. Waiting for work...");
    log::info!(
        "botster-hub v{} started headless for {}",
        botster_hub::constants::VERSION,
        hub.repo_name()
    );

    while !SHUTDOWN_FLAG.load(std::sync::atomic::Ordering::Relaxed) && !hub.quit {
        hub.tick();
        std::thread::sleep(botster_hub::constants::TICK);
    }

    println!("Shutting down...");
    hub.shutdown();
    Ok(())
}

fn run_with_tui() -> Result<()> {
    ensure_authenticated()?;
    register_signal_handlers()?;

    // Build and set up the hub before raw mode so errors stay readable.
    println!("Initializing hub...");
    let config = Config::load()?;
    let mut hub = Hub::new(config)?;

    println!("Setting up connections...");
    hub.setup();

    println!("Starting TUI...");
    enable_raw_mode()?;
    let mut stdout = std::io::stdout();
    execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;

    let _terminal_guard = tui::TerminalGuard::new();

    let backend = CrosstermBackend::new(stdout);
    let terminal = Terminal::new(backend)?;

    log::info!(
        "botster-hub v{} started with TUI for {}",
        botster_hub::constants::VERSION,
        hub.repo_name()
    );

    let result = tui::run_with_hub(&mut hub, terminal, &SHUTDOWN_FLAG);
    hub.shutdown();
    result
}

fn run_login() -> Result<()> {
    let mut config = Config::load()?;
    let token = auth::device_flow(&config.server_url)?;
    config.save_token(&token)?;
    config.save()?;
    println!("  Login complete.");
    Ok(())
}

fn run_get_connection_url(hub: &str) -> Result<()> {
    let dir = Config::config_dir()?;
    match botster_hub::relay::read_connection_url(&dir)? {
        Some(url) => {
            println!("{url}");
            Ok(())
        }
        None => {
            eprintln!("No connection URL found for hub '{hub}'. Is the hub running?");
            std::process::exit(1);
        }
    }
}

fn run_reset(yes: bool) -> Result<()> {
    if !yes {
        print!("Remove all botster data (credentials, config, device identity)? [y/N] ");
        use std::io::Write;
        std::io::stdout().flush()?;
        let mut answer = String::new();
        std::io::stdin().read_line(&mut answer)?;
        if !answer.trim().eq_ignore_ascii_case("y") {
            println!("Aborted.");
            return Ok(());
        }
    }

    Credentials::clear()?;
    let dir = Config::config_dir()?;
    if dir.exists() {
        std::fs::remove_dir_all(&dir)?;
    }
    println!("All botster data removed.");
    Ok(())
}

/// Misconfiguration (bad config dir, missing repo) exits 2. Typed check
/// on the error chain, so runtime errors with similar wording (path
/// validation, git failures) keep exit code 1.
fn is_config_error(error: &anyhow::Error) -> bool {
    error
        .chain()
        .any(|cause| cause.downcast_ref::<botster_hub::config::ConfigError>().is_some())
}
