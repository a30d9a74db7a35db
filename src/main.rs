use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use daemonize::Daemonize;
use evdev::Key;
use keylux::bindings::{Binding, Bindings};
use keylux::display::{BrightnessCoordinator, DEFAULT_STEP};
use keylux::input::InputMultiplexer;
use log::{error, warn};
use serde_json::json;

#[derive(Parser)]
#[command(name = "keylux")]
#[command(about = "Drive DDC/CI monitor brightness from keyboard brightness keys")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Listen for brightness keys and adjust every display
    Watch {
        #[arg(short, long, default_value_t = DEFAULT_STEP)]
        step: u16,
        /// Fork into the background
        #[arg(short, long)]
        daemonize: bool,
    },
    /// Print the current brightness as JSON
    Get,
    /// Set an absolute brightness on every display
    Set {
        #[arg(value_name = "VALUE")]
        value: u16,
    },
    /// Increase brightness
    Up {
        #[arg(short, long, default_value_t = DEFAULT_STEP)]
        step: u16,
    },
    /// Decrease brightness
    Down {
        #[arg(short, long, default_value_t = DEFAULT_STEP)]
        step: u16,
    },
    /// List key-capable input devices and usable displays as JSON
    Probe,
}

fn format_level(res: Result<u16>) -> String {
    match res {
        Ok(val) => json!({
            "text": val.to_string(),
            "percentage": val,
            "tooltip": format!("Brightness: {}%", val)
        })
        .to_string(),
        Err(e) => json!({
            "text": "?",
            "percentage": 0,
            "tooltip": format!("Error: {}", e)
        })
        .to_string(),
    }
}

/// The monitoring loop. Init failures are logged and exit cleanly without
/// entering the loop; only runtime errors propagate.
fn watch(step: u16, daemonize: bool) -> Result<()> {
    let coordinator = match BrightnessCoordinator::open(step) {
        Ok(coordinator) => coordinator,
        Err(e) => {
            error!("error while discovering monitors: {e:#}");
            return Ok(());
        }
    };
    let mut inputs = match InputMultiplexer::open() {
        Ok(inputs) => inputs,
        Err(e) => {
            error!("error while discovering keyboards: {e:#}");
            return Ok(());
        }
    };

    if daemonize {
        Daemonize::new()
            .start()
            .context("cannot fork into the background")?;
    }

    let bindings = Bindings::new(vec![
        Binding::new(Key::KEY_BRIGHTNESSUP, || {
            if let Err(e) = coordinator.step_up() {
                warn!("brightness up failed: {e:#}");
            }
        }),
        Binding::new(Key::KEY_BRIGHTNESSDOWN, || {
            if let Err(e) = coordinator.step_down() {
                warn!("brightness down failed: {e:#}");
            }
        }),
    ]);

    inputs.monitor(&bindings)
}

/// Prints the JSON status line for one-shot commands and exits non-zero
/// when the operation failed.
fn report(level: Result<u16>) {
    let ok = level.is_ok();
    println!("{}", format_level(level));
    if !ok {
        process::exit(1);
    }
}

fn adjust_once(step: u16, up: bool) -> Result<u16> {
    let coordinator = BrightnessCoordinator::open(step)?;
    if up {
        coordinator.step_up()?;
    } else {
        coordinator.step_down()?;
    }
    coordinator.current_level()
}

fn probe_report() -> serde_json::Value {
    let inputs = match InputMultiplexer::open() {
        Ok(inputs) => json!(
            inputs
                .sources()
                .map(|(name, path)| json!({
                    "name": name,
                    "path": path.display().to_string()
                }))
                .collect::<Vec<_>>()
        ),
        Err(e) => json!({ "error": e.to_string() }),
    };
    let displays = match BrightnessCoordinator::open(DEFAULT_STEP) {
        Ok(coordinator) => json!(coordinator.display_names()),
        Err(e) => json!({ "error": e.to_string() }),
    };
    json!({ "inputs": inputs, "displays": displays })
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Watch { step, daemonize } => watch(step, daemonize),
        Commands::Get => {
            report(BrightnessCoordinator::open(DEFAULT_STEP).and_then(|c| c.current_level()));
            Ok(())
        }
        Commands::Set { value } => {
            report(BrightnessCoordinator::open(DEFAULT_STEP).and_then(|c| c.set_level(value)));
            Ok(())
        }
        Commands::Up { step } => {
            report(adjust_once(step, true));
            Ok(())
        }
        Commands::Down { step } => {
            report(adjust_once(step, false));
            Ok(())
        }
        Commands::Probe => {
            println!("{}", probe_report());
            Ok(())
        }
    };

    if let Err(e) = result {
        error!("{e:#}");
        process::exit(1);
    }
}
