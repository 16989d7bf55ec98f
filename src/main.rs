//! vtbridge - run a terminal program inside a re-rendered virtual terminal
//!
//! The host terminal shows the frames produced by the bridge; key presses
//! are translated and sent to the child. Exits when the child does.
//!
//! ```text
//! vtbridge                 # run the configured command (vim by default)
//! vtbridge htop            # run something else
//! vtbridge -c my.toml      # use another config file
//! ```

use std::env;
use std::path::PathBuf;

use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vtbridge::BridgeConfig;

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default)]
struct Args {
    config_path: Option<PathBuf>,
    /// Program and arguments given on the command line
    command: Vec<String>,
}

fn print_help() {
    eprintln!("vtbridge {} - run a terminal program in a virtual terminal", VERSION);
    eprintln!();
    eprintln!("Usage: vtbridge [OPTIONS] [COMMAND [ARGS...]]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -c, --config <PATH>   Config file (default: ~/.vtbridge/config.toml)");
    eprintln!("  -v, --version         Show version");
    eprintln!("  -h, --help            Show this help");
    eprintln!();
    eprintln!("Without COMMAND the `command` from the config file is run.");
    eprintln!("Logs go to ~/.vtbridge/vtbridge.log (RUST_LOG overrides log_level).");
}

fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = env::args().collect();
    let mut parsed = Args::default();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                eprintln!("vtbridge {}", VERSION);
                std::process::exit(0);
            }
            "-c" | "--config" => {
                i += 1;
                let path = args.get(i).ok_or("Missing config path")?;
                parsed.config_path = Some(PathBuf::from(path));
            }
            "--" => {
                parsed.command = args[i + 1..].to_vec();
                break;
            }
            arg if arg.starts_with('-') && parsed.command.is_empty() => {
                return Err(format!("Unknown argument: {}. Use -h for help.", arg));
            }
            _ => {
                // Everything from the program name on belongs to the child
                parsed.command = args[i..].to_vec();
                break;
            }
        }
        i += 1;
    }

    Ok(parsed)
}

fn init_logging(config: &BridgeConfig) {
    let Some(log_path) = BridgeConfig::log_path() else {
        return;
    };
    let Ok(file) = std::fs::OpenOptions::new().create(true).append(true).open(&log_path) else {
        return;
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn main() -> anyhow::Result<()> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("Use --help for usage information");
            std::process::exit(1);
        }
    };

    let mut config = match &args.config_path {
        Some(path) => BridgeConfig::load_from(path),
        None => BridgeConfig::load(),
    };
    if !args.command.is_empty() {
        config.command = shell_words::join(&args.command);
        config.args.clear();
    }

    init_logging(&config);
    info!("vtbridge {} starting: {}", VERSION, config.command);

    #[cfg(unix)]
    return host::run(&config);

    #[cfg(not(unix))]
    {
        eprintln!("vtbridge needs a Unix pseudo terminal.");
        std::process::exit(1);
    }
}

#[cfg(unix)]
mod host {
    use std::time::Duration;

    use anyhow::Context;
    use crossbeam_channel::TryRecvError;
    use crossterm::event::{self, Event, KeyEventKind};
    use tracing::{info, warn};

    use vtbridge::ui::{InputModes, KeyTranslator, Renderer};
    use vtbridge::{Bridge, BridgeConfig, BridgeError, OutboundMessage, WriteError};

    pub fn run(config: &BridgeConfig) -> anyhow::Result<()> {
        let mut bridge = Bridge::from_config(config).context("Failed to start bridge")?;

        let mut renderer = Renderer::new();
        renderer.init()?;

        let result = event_loop(&bridge, &mut renderer);

        let _ = renderer.cleanup();
        bridge.shutdown();

        // Spawn failures are only known once the pump has tried
        for err in bridge.errors().try_iter() {
            eprintln!("vtbridge: {}", err);
        }
        result
    }

    fn event_loop(bridge: &Bridge, renderer: &mut Renderer) -> anyhow::Result<()> {
        let poll_timeout = Duration::from_millis(10);
        let mut modes = InputModes::default();

        // The child is started with the host size
        let (cols, rows) = Renderer::size()?;
        bridge.resize(rows, cols)?;

        loop {
            loop {
                match bridge.outbound().try_recv() {
                    Ok(OutboundMessage::Ready(size)) => {
                        info!("Child running at {}", size);
                        renderer.invalidate();
                    }
                    Ok(OutboundMessage::Frame(frame)) => {
                        modes = InputModes::from(&frame);
                        renderer.render(&frame)?;
                    }
                    Ok(OutboundMessage::Disconnect) | Err(TryRecvError::Disconnected) => {
                        info!("Child exited");
                        return Ok(());
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }

            while let Ok(err) = bridge.errors().try_recv() {
                warn!("{}", err);
            }

            if !event::poll(poll_timeout)? {
                continue;
            }
            let sent = match event::read()? {
                Event::Key(key_event) if key_event.kind != KeyEventKind::Release => {
                    match KeyTranslator::map(&key_event, modes) {
                        Some(bytes) => bridge.send_stdin(bytes),
                        None => Ok(()),
                    }
                }
                Event::Paste(text) => bridge.send_stdin(KeyTranslator::paste(&text, modes)),
                Event::Resize(cols, rows) => bridge.resize(rows, cols),
                _ => Ok(()),
            };

            match sent {
                // The disconnect message is on its way
                Ok(()) | Err(BridgeError::Write(WriteError::Disconnected)) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }
}
