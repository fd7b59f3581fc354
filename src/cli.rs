//! Interactive console
//!
//! Reads commands with rustyline on its own thread and hands them to the
//! main loop, which owns the device link and the sync engine.

use crate::arduino::PortInfo;
use crate::resolver::Bindings;
use anyhow::{Context, Result};
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc;
use tracing::{debug, warn};

const PROMPT: &str = "deej> ";

/// Command forwarded to the main loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleCommand {
    /// Move a slider from the host
    Set { slider: usize, percent: u8 },
    Ping,
    /// Send an image file to the device
    Image(PathBuf),
    Quit,
}

/// Result of parsing one console line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleInput {
    Command(ConsoleCommand),
    Help,
    Empty,
}

/// Parse one console line
///
/// `set` accepts a slider index or any target name bound to a slider.
pub fn parse_line(line: &str, bindings: &Bindings) -> Result<ConsoleInput, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    let Some(cmd) = parts.first() else {
        return Ok(ConsoleInput::Empty);
    };

    let command = match cmd.to_lowercase().as_str() {
        "set" => {
            let [_, slider, percent] = parts.as_slice() else {
                return Err("Usage: set <slider> <percentage>".to_string());
            };
            let slider = slider
                .parse::<usize>()
                .ok()
                .or_else(|| bindings.slider_for_name(slider))
                .ok_or_else(|| format!("Unknown slider: {}", slider))?;
            let percent = percent
                .parse::<u8>()
                .ok()
                .filter(|p| *p <= 100)
                .ok_or_else(|| "Percentage must be 0-100".to_string())?;
            ConsoleCommand::Set { slider, percent }
        }
        "ping" => ConsoleCommand::Ping,
        "image" => {
            let path = line.trim()[cmd.len()..].trim();
            if path.is_empty() {
                return Err("Usage: image <path>".to_string());
            }
            ConsoleCommand::Image(PathBuf::from(path))
        }
        "help" | "?" => return Ok(ConsoleInput::Help),
        "quit" | "exit" | "q" => ConsoleCommand::Quit,
        other => {
            return Err(format!(
                "Unknown command: {}. Type 'help' for available commands.",
                other
            ))
        }
    };

    Ok(ConsoleInput::Command(command))
}

/// Print commands and the binding table
pub fn print_help(bindings: &Bindings) {
    println!("\n{}", "=== Available Commands ===".bold().cyan());
    println!("  {}  - Set a slider (index or target name)", "set <slider> <percentage>".yellow());
    println!("  {}                       - Ping the Arduino", "ping".yellow());
    println!("  {}               - Send an image to the device", "image <path>".yellow());
    println!("  {}                       - Show this help", "help".yellow());
    println!("  {}                - Exit", "quit/exit/q".yellow());

    println!("\n{}", "Slider Mapping:".bold());
    let mut any = false;
    for binding in bindings.sliders() {
        any = true;
        let targets: Vec<String> = binding.targets.iter().map(|t| t.to_string()).collect();
        if targets.is_empty() {
            println!("  Slider {} -> {}", binding.index, "(unbound)".dimmed());
        } else {
            println!("  Slider {} -> {}", binding.index, targets.join(", ").green());
        }
    }
    if !any {
        println!("  {}", "No sliders mapped".dimmed());
    }

    let buttons: Vec<_> = bindings.buttons().collect();
    if !buttons.is_empty() {
        println!("\n{}", "Button Mapping:".bold());
        for button in buttons {
            println!("  Button {} -> {}", button.index, button.key.to_string().green());
        }
    }
    println!();
}

/// Print serial ports for `--list-ports`
pub fn print_ports(ports: &[PortInfo]) {
    println!("\n{}", "=== Available Serial Ports ===".bold().cyan());
    if ports.is_empty() {
        println!("  {}", "No serial ports found".dimmed());
    }
    for port in ports {
        println!("  {} {}", port.name.green(), port.description.dimmed());
    }
    println!();
}

/// Start the console thread
///
/// The thread exits after sending [`ConsoleCommand::Quit`] or when the
/// receiver goes away.
pub fn spawn_console(
    bindings: Arc<Bindings>,
    tx: mpsc::Sender<ConsoleCommand>,
) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            if let Err(e) = run_console(&bindings, &tx) {
                warn!("Console stopped: {:#}", e);
            }
        })
        .context("Failed to spawn console thread")
}

fn run_console(bindings: &Bindings, tx: &mpsc::Sender<ConsoleCommand>) -> Result<()> {
    let mut rl = DefaultEditor::new().context("Failed to initialise line editor")?;
    println!("Type 'help' for available commands.");

    loop {
        let line = match rl.readline(PROMPT) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                let _ = tx.blocking_send(ConsoleCommand::Quit);
                return Ok(());
            }
            Err(e) => return Err(e).context("Failed to read console input"),
        };

        match parse_line(&line, bindings) {
            Ok(ConsoleInput::Empty) => continue,
            Ok(ConsoleInput::Help) => {
                let _ = rl.add_history_entry(line.as_str());
                print_help(bindings);
            }
            Ok(ConsoleInput::Command(command)) => {
                let _ = rl.add_history_entry(line.as_str());
                let quit = command == ConsoleCommand::Quit;
                debug!("Console command: {:?}", command);
                if tx.blocking_send(command).is_err() || quit {
                    return Ok(());
                }
            }
            Err(message) => println!("{}", message.red()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::{SliderBinding, TargetRef};

    fn bindings() -> Bindings {
        Bindings::new(
            vec![
                SliderBinding {
                    index: 0,
                    targets: vec![TargetRef::Master],
                },
                SliderBinding {
                    index: 3,
                    targets: vec![TargetRef::NamedProcess("spotify.exe".to_string())],
                },
            ],
            vec![],
        )
    }

    #[test]
    fn test_parse_set() {
        let b = bindings();
        assert_eq!(
            parse_line("set 0 75", &b),
            Ok(ConsoleInput::Command(ConsoleCommand::Set {
                slider: 0,
                percent: 75
            }))
        );
        assert_eq!(
            parse_line("SET Spotify.exe 20", &b),
            Ok(ConsoleInput::Command(ConsoleCommand::Set {
                slider: 3,
                percent: 20
            }))
        );
        assert!(parse_line("set 0 101", &b).is_err());
        assert!(parse_line("set 0", &b).is_err());
        assert!(parse_line("set chrome.exe 10", &b).is_err());
    }

    #[test]
    fn test_parse_other_commands() {
        let b = bindings();
        assert_eq!(parse_line("   ", &b), Ok(ConsoleInput::Empty));
        assert_eq!(parse_line("help", &b), Ok(ConsoleInput::Help));
        assert_eq!(
            parse_line("ping", &b),
            Ok(ConsoleInput::Command(ConsoleCommand::Ping))
        );
        assert_eq!(
            parse_line("image  covers/my art.png ", &b),
            Ok(ConsoleInput::Command(ConsoleCommand::Image(PathBuf::from(
                "covers/my art.png"
            ))))
        );
        assert!(parse_line("image", &b).is_err());
        for quit in ["quit", "exit", "q"] {
            assert_eq!(
                parse_line(quit, &b),
                Ok(ConsoleInput::Command(ConsoleCommand::Quit))
            );
        }
        assert!(parse_line("dance", &b).is_err());
    }
}
