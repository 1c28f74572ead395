//! ccc: remote-control bridge between Claude Code sessions in tmux and
//! Telegram.
//!
//! One binary, three roles:
//!   ccc [-c]              - start/attach the session for the cwd
//!   ccc listen            - the long-lived listener (poller + delivery)
//!   ccc hook-*            - short-lived hooks invoked by the assistant

mod commands;
mod config;
mod db;
mod delivery;
mod format;
mod hooks;
mod listener;
mod log;
mod markers;
mod otp;
mod paths;
mod session;
mod telegram;
mod tmux;
mod toolstate;
mod transcript;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "ccc", version, about = "Drive Claude Code sessions from Telegram")]
struct Cli {
    /// Continue the previous assistant conversation
    #[arg(short = 'c', long = "continue")]
    continue_session: bool,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Complete setup: bot, hooks, service
    Setup {
        /// Telegram bot token from @BotFather
        token: String,
        /// Require a TOTP code for remote tool approvals
        #[arg(long)]
        otp: bool,
    },
    /// Start the Telegram listener (normally run by the service manager)
    Listen,
    /// Run the assistant directly (used inside tmux windows)
    Run {
        /// Continue the previous assistant conversation
        #[arg(short = 'c', long = "continue")]
        continue_session: bool,
    },
    /// Send a file to the current session's Telegram topic
    Send { file: String },
    /// Start a detached session and send it an initial prompt
    Start {
        name: String,
        dir: String,
        prompt: Vec<String>,
    },
    /// Configure the Telegram group used for session topics
    Setgroup,
    /// Show or set configuration values
    Config { args: Vec<String> },
    /// Check dependencies and configuration
    Doctor,
    /// Install the Claude hooks manually
    Install,
    /// Remove the Claude hooks
    Uninstall,
    /// Assistant lifecycle hooks (invoked by Claude Code, not by hand)
    #[command(hide = true)]
    HookStop,
    #[command(hide = true)]
    HookUserPrompt,
    #[command(hide = true)]
    HookPreTool,
    #[command(hide = true)]
    HookPostTool,
    #[command(hide = true)]
    HookNotification,
    #[command(hide = true)]
    HookCompact,
    #[command(hide = true)]
    HookStopRetry {
        session: String,
        topic_id: i64,
        transcript_path: String,
    },
}

fn main() {
    // Panics land in the debug log, not on a hook's stdout/stderr where
    // they would corrupt the assistant's TUI.
    std::panic::set_hook(Box::new(|info| {
        let location = info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        let message = if let Some(s) = info.payload().downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = info.payload().downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic".to_string()
        };
        log::hook_log(&format!("panic: {} at {}", message, location));
    }));

    let cli = Cli::parse();
    let result = dispatch(cli);
    if let Err(err) = result {
        eprintln!("Error: {:#}", err);
        std::process::exit(1);
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        None => session::start_session(cli.continue_session),
        Some(Cmd::Setup { token, otp }) => commands::setup(&token, otp),
        Some(Cmd::Listen) => listener::listen(),
        Some(Cmd::Run { continue_session }) => {
            session::run_claude_raw(continue_session || cli.continue_session)
        }
        Some(Cmd::Send { file }) => commands::send_file(&file),
        Some(Cmd::Start { name, dir, prompt }) => {
            session::start_detached(&name, &dir, &prompt.join(" "))
        }
        Some(Cmd::Setgroup) => commands::set_group(),
        Some(Cmd::Config { args }) => commands::config_command(&args),
        Some(Cmd::Doctor) => {
            commands::doctor();
            Ok(())
        }
        Some(Cmd::Install) => commands::install_hooks().and_then(|_| commands::install_skill()),
        Some(Cmd::Uninstall) => commands::uninstall_hooks(),
        // Hooks must never fail the assistant: errors are swallowed and the
        // process exits 0 regardless.
        Some(Cmd::HookStop) => {
            let _ = hooks::handle_stop();
            Ok(())
        }
        Some(Cmd::HookUserPrompt) => {
            let _ = hooks::handle_user_prompt();
            Ok(())
        }
        Some(Cmd::HookPreTool) => {
            let _ = hooks::handle_pre_tool();
            Ok(())
        }
        Some(Cmd::HookPostTool) => {
            let _ = hooks::handle_post_tool();
            Ok(())
        }
        Some(Cmd::HookNotification) => {
            let _ = hooks::handle_notification();
            Ok(())
        }
        Some(Cmd::HookCompact) => {
            let _ = hooks::handle_compact();
            Ok(())
        }
        Some(Cmd::HookStopRetry { session, topic_id, transcript_path }) => {
            let _ = hooks::handle_stop_retry(&session, topic_id, &transcript_path);
            Ok(())
        }
    }
}
