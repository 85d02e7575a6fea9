//! idlewire CLI - send commands to and watch events from an MPD-style server.
//!
//! See the `idlewire` library for the engine.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use idlewire::{Command, Condition, EngineError, Session, SessionConfig, TaskHandle, TokioScheduler};

/// Subsystems reported by `idle` when no categories are given to `watch`.
const SUBSYSTEMS: &[&str] = &[
    "database",
    "update",
    "stored_playlist",
    "playlist",
    "player",
    "mixer",
    "output",
    "options",
    "partition",
    "sticker",
    "subscription",
    "message",
    "neighbor",
    "mount",
];

// CLI
#[derive(Parser)]
#[command(name = "idlewire")]
#[command(version)]
#[command(about = "Send commands to and watch events from an MPD-style server")]
struct Cli {
    /// Server host (overrides config and IDLEWIRE_HOST)
    #[arg(long, global = true)]
    host: Option<String>,
    /// Server port (overrides config and IDLEWIRE_PORT)
    #[arg(long, global = true)]
    port: Option<u16>,
    /// Shared secret sent with `password` after connecting
    #[arg(long, global = true)]
    password: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one command and print its reply lines
    Send {
        /// Command verb (e.g. "status")
        command: String,
        /// Command arguments
        args: Vec<String>,
    },
    /// Print server events as they happen
    Watch {
        /// Stop after this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Event categories to watch (default: all subsystems)
        categories: Vec<String>,
    },
    /// Print the effective configuration
    Config,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    let cli = Cli::parse();

    let mut config = SessionConfig::load()?;
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if cli.password.is_some() {
        config.password = cli.password;
    }

    match cli.command {
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        command => run(&config, command),
    }
}

/// Run one task to completion on a current-thread runtime.
fn run(config: &SessionConfig, command: Commands) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;
    let local = tokio::task::LocalSet::new();

    local.block_on(&runtime, async move {
        let session = Session::new(Rc::new(TokioScheduler::new()), config.clone());

        let failure: Rc<RefCell<Option<String>>> = Rc::new(RefCell::new(None));
        let sink = Rc::clone(&failure);
        session.set_error_hook(move |task, err| {
            *sink.borrow_mut() = Some(format!("{}: {err:#}", task.name()));
        });

        session
            .connect_with(config)
            .with_context(|| format!("Failed to connect to {}:{}", config.host, config.port))?;

        let task = match command {
            Commands::Send { command, args } => spawn_send(&session, Command::new(command).args(args))?,
            Commands::Watch {
                timeout_ms,
                categories,
            } => spawn_watch(&session, timeout_ms.map(Duration::from_millis), categories)?,
            Commands::Config => return Ok(()),
        };

        let (done_tx, done_rx) = tokio::sync::oneshot::channel::<()>();
        task.add_cleanup(move || {
            let _ = done_tx.send(());
        });

        let (interrupt_tx, mut interrupt_rx) = tokio::sync::mpsc::unbounded_channel::<()>();
        ctrlc::set_handler(move || {
            let _ = interrupt_tx.send(());
        })
        .context("Failed to install Ctrl-C handler")?;

        tokio::select! {
            _ = done_rx => {}
            _ = interrupt_rx.recv() => {
                log::info!("Interrupted, closing task '{}'", task.name());
                task.cancel();
            }
        }
        session.disconnect();

        let failure = failure.borrow_mut().take();
        match failure {
            Some(message) => anyhow::bail!(message),
            None => Ok(()),
        }
    })
}

fn spawn_send(session: &Session, command: Command) -> Result<TaskHandle> {
    let handle = session.spawn("send", move |ctx| async move {
        match ctx.command(command).await {
            Ok(reply) => {
                for line in reply.lines() {
                    println!("{line}");
                }
                Ok(())
            }
            Err(EngineError::ConnectionLost) => anyhow::bail!("connection to server lost"),
            Err(e) => Err(e.into()),
        }
    })?;
    Ok(handle)
}

fn spawn_watch(
    session: &Session,
    timeout: Option<Duration>,
    categories: Vec<String>,
) -> Result<TaskHandle> {
    let categories = if categories.is_empty() {
        SUBSYSTEMS.iter().map(ToString::to_string).collect()
    } else {
        categories
    };
    let deadline = timeout.map(|t| Instant::now() + t);

    let handle = session.spawn("watch", move |ctx| async move {
        loop {
            let mut conditions: Vec<Condition> =
                categories.iter().map(Condition::event).collect();
            if let Some(deadline) = deadline {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Ok(());
                }
                conditions.push(Condition::Timeout(remaining));
            }

            let fired = match ctx.wait(conditions).await {
                Ok(fired) => fired,
                Err(EngineError::ConnectionLost) => anyhow::bail!("connection to server lost"),
                Err(e) => return Err(e.into()),
            };
            let events: Vec<&str> = fired
                .iter()
                .filter(|c| matches!(c, Condition::Event(_)))
                .map(Condition::name)
                .collect();
            if !events.is_empty() {
                println!("{}", events.join(" "));
            }
            if fired.iter().any(|c| matches!(c, Condition::Timeout(_))) {
                return Ok(());
            }
        }
    })?;
    Ok(handle)
}
