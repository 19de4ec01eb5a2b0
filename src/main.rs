//! ptygate: PTY wrapper that intercepts agent permission prompts
//!
//! Modes:
//!   ptygate run <command> [args...]              - PTY wrapper mode
//!   ptygate sessions list [--project <path>]     - List recorded sessions
//!   ptygate sessions delete <id> [--project <path>] - Delete a session
//!
//! PTY mode outputs on captured stderr at startup:
//!   DECISION_PORT=<port>   - TCP port for out-of-band approval answers

mod ansi;
mod approval;
mod config;
mod decision;
mod detect;
mod log;
mod parse;
mod paths;
mod pty;
mod store;

use anyhow::{Context, Result, bail};
use std::env;
use std::panic;

/// Action to take based on command-line arguments
#[derive(Debug, PartialEq)]
enum MainAction {
    /// Run PTY wrapper mode with the agent command and its args
    RunPty(Vec<String>),
    /// List sessions for a project (None = current directory)
    SessionsList { project: Option<String> },
    /// Delete one session by id
    SessionsDelete {
        session_id: String,
        project: Option<String>,
    },
    /// Print usage
    Help,
}

/// Pull a `--project <path>` flag out of an argument list, returning
/// the remaining positional args and the flag value if present.
fn split_project_flag(args: &[String]) -> Result<(Vec<String>, Option<String>)> {
    let mut rest = Vec::new();
    let mut project = None;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if arg == "--project" {
            match iter.next() {
                Some(value) => project = Some(value.clone()),
                None => bail!("--project requires a path"),
            }
        } else {
            rest.push(arg.clone());
        }
    }
    Ok((rest, project))
}

/// Determine what action to take based on command-line arguments
fn determine_action(args: &[String]) -> Result<MainAction> {
    if args.len() < 2 {
        return Ok(MainAction::Help);
    }

    match args[1].as_str() {
        "run" => {
            if args.len() < 3 {
                bail!("run requires a command");
            }
            Ok(MainAction::RunPty(args[2..].to_vec()))
        }
        "sessions" => {
            let (rest, project) = split_project_flag(&args[2..])?;
            match rest.first().map(|s| s.as_str()) {
                Some("list") => Ok(MainAction::SessionsList { project }),
                Some("delete") => match rest.get(1) {
                    Some(id) => Ok(MainAction::SessionsDelete {
                        session_id: id.clone(),
                        project,
                    }),
                    None => bail!("sessions delete requires a session id"),
                },
                _ => bail!("sessions requires a subcommand: list, delete"),
            }
        }
        "--help" | "-h" | "help" => Ok(MainAction::Help),
        other => bail!("unknown command: {}", other),
    }
}

fn print_usage() {
    eprintln!("ptygate - PTY wrapper that intercepts agent permission prompts");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  ptygate run <command> [args...]");
    eprintln!("  ptygate sessions list [--project <path>]");
    eprintln!("  ptygate sessions delete <id> [--project <path>]");
    eprintln!();
    eprintln!("PTY mode announces on captured stderr:");
    eprintln!("  DECISION_PORT=<port>   TCP port for out-of-band approval answers");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  PTYGATE_DIR             Custom ptygate directory (default ~/.ptygate)");
    eprintln!("  PTYGATE_AGENT_DIR       Agent home with session indexes (default ~/.claude)");
    eprintln!("  PTYGATE_AUTO_READONLY   Set to 1 to auto-approve read-only tools");
    eprintln!("  PTYGATE_DEBUG           Verbose logging");
}

fn main() -> Result<()> {
    // Initialize global config from environment variables
    config::Config::init();

    // Set custom panic hook to log to file instead of stderr (prevents display corruption)
    panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let message = if let Some(s) = panic_info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = panic_info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        log::log_error("main", "panic", &format!("{} at {}", message, location));
    }));

    let args: Vec<String> = env::args().collect();

    match determine_action(&args)? {
        MainAction::Help => {
            print_usage();
        }
        MainAction::RunPty(pty_args) => {
            run_pty(&pty_args)?;
        }
        MainAction::SessionsList { project } => {
            sessions_list(project)?;
        }
        MainAction::SessionsDelete {
            session_id,
            project,
        } => {
            sessions_delete(&session_id, project);
        }
    }

    Ok(())
}

fn run_pty(args: &[String]) -> Result<()> {
    let command = args[0].as_str();
    let command_args: Vec<&str> = args[1..].iter().map(|s| s.as_str()).collect();

    let mut proxy = pty::Proxy::spawn(command, &command_args).context("Failed to spawn PTY")?;
    let exit_code = proxy.run().context("PTY run failed")?;

    // Drop proxy to restore the terminal before exiting
    drop(proxy);

    std::process::exit(exit_code);
}

fn project_or_cwd(project: Option<String>) -> Result<String> {
    match project {
        Some(p) => Ok(p),
        None => Ok(env::current_dir()
            .context("cannot determine current directory")?
            .display()
            .to_string()),
    }
}

fn sessions_list(project: Option<String>) -> Result<()> {
    let project = project_or_cwd(project)?;
    let store = store::SessionStore::open();
    let entries = store.list(&project);
    if entries.is_empty() {
        println!("No sessions for {}", project);
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  {:>5} msgs  {}",
            entry.session_id, entry.message_count, entry.summary
        );
    }
    Ok(())
}

fn sessions_delete(session_id: &str, project: Option<String>) {
    let project = match project_or_cwd(project) {
        Ok(p) => p,
        Err(_) => {
            eprintln!("Cannot determine project directory");
            return;
        }
    };
    let store = store::SessionStore::open();
    if store.delete(&project, session_id) {
        println!("Deleted {}", session_id);
    } else {
        println!("No such session: {}", session_id);
    }
}
