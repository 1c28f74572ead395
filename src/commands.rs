//! CLI-facing operations: setup, doctor, hook installation, shell
//! execution, one-shot assistant runs, and file sending.

use anyhow::{bail, Context, Result};
use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use crate::config::Config;
use crate::telegram::Api;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Timeout for /c shell commands.
const SHELL_TIMEOUT: Duration = Duration::from_secs(2 * 60);
/// Timeout for one-shot assistant invocations.
const ONESHOT_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Output of a child process run: merged stdout+stderr plus an error
/// description when the command failed or timed out.
pub struct CommandOutput {
    pub output: String,
    pub error: Option<String>,
}

/// Run a child to completion with a deadline, merging stdout and stderr.
/// On timeout the child is killed and the partial output returned.
fn run_with_timeout(mut cmd: Command, timeout: Duration) -> CommandOutput {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).stdin(Stdio::null());
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(err) => {
            return CommandOutput { output: format!("Error: {}", err), error: Some(err.to_string()) }
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let out_handle = std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = stdout {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    });
    let err_handle = std::thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut pipe) = stderr {
            let _ = pipe.read_to_string(&mut buf);
        }
        buf
    });

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) => {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    timed_out = true;
                    break child.wait().ok();
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Err(_) => break None,
        }
    };

    let stdout = out_handle.join().unwrap_or_default();
    let stderr = err_handle.join().unwrap_or_default();

    let mut output = stdout;
    if !stderr.is_empty() {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&stderr);
    }

    let error = if timed_out {
        Some("timeout".to_string())
    } else {
        match status {
            Some(s) if s.success() => None,
            Some(s) => Some(format!("exit status {}", s.code().unwrap_or(-1))),
            None => Some("wait failed".to_string()),
        }
    };

    if output.is_empty() {
        output = match &error {
            Some(err) => format!("Error: {}", err),
            None => "(no output)".to_string(),
        };
    }

    CommandOutput { output: output.trim().to_string(), error }
}

/// Execute a /c shell command in a login shell with home as cwd.
pub fn execute_command(cmd_str: &str) -> CommandOutput {
    let shell = if which::which("zsh").is_ok() { "zsh" } else { "bash" };
    let mut cmd = Command::new(shell);
    cmd.args(["-l", "-c", cmd_str]);
    if let Some(home) = dirs::home_dir() {
        cmd.current_dir(home);
    }
    run_with_timeout(cmd, SHELL_TIMEOUT)
}

/// One-shot assistant run for private-chat prompts. A leading word naming a
/// directory under home selects the working directory.
pub fn run_claude_oneshot(prompt: &str) -> CommandOutput {
    let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
    let mut work_dir = home.clone();
    let mut prompt = prompt.to_string();

    if let Some(first_word) = prompt.split_whitespace().next() {
        let candidate = home.join(first_word);
        if candidate.is_dir() {
            work_dir = candidate;
            prompt = prompt
                .strip_prefix(first_word)
                .unwrap_or(&prompt)
                .trim()
                .to_string();
            if prompt.is_empty() {
                return CommandOutput {
                    output: "Error: no prompt provided after directory name".into(),
                    error: None,
                };
            }
        }
    }

    let Some(claude) = crate::tmux::claude_path() else {
        return CommandOutput {
            output: "Error: claude binary not found".into(),
            error: Some("claude not found".into()),
        };
    };
    let mut cmd = Command::new(claude);
    cmd.args(["--dangerously-skip-permissions", "-p", prompt.as_str()])
        .current_dir(work_dir);
    run_with_timeout(cmd, ONESHOT_TIMEOUT)
}

/// Host statistics for /stats.
pub fn system_stats() -> String {
    let mut out = String::new();

    let hostname = nix::unistd::gethostname()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_default();
    out.push_str(&format!("🖥 {}\n\n", hostname));

    if let Ok(uptime) = Command::new("uptime").output() {
        out.push_str(&format!("⏱ {}\n", String::from_utf8_lossy(&uptime.stdout).trim()));
    }

    if let Ok(arch) = Command::new("uname").arg("-m").output() {
        let arch = String::from_utf8_lossy(&arch.stdout).trim().to_string();
        let cores = Command::new("nproc")
            .output()
            .ok()
            .filter(|o| o.status.success())
            .or_else(|| Command::new("sysctl").args(["-n", "hw.ncpu"]).output().ok())
            .map(|o| String::from_utf8_lossy(&o.stdout).trim().to_string())
            .unwrap_or_default();
        out.push_str(&format!("🧠 CPU: {} cores ({})\n", cores, arch));
    }

    if let Ok(free) = Command::new("free").arg("-h").output() {
        for line in String::from_utf8_lossy(&free.stdout).lines() {
            if line.starts_with("Mem:") {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() >= 7 {
                    out.push_str(&format!(
                        "💾 RAM: {} used / {} total (available: {})\n",
                        fields[2], fields[1], fields[6]
                    ));
                }
                break;
            }
        }
    }

    for mount in ["/", "/home"] {
        if let Ok(df) = Command::new("df").args(["-h", mount]).output() {
            if let Some(line) = String::from_utf8_lossy(&df.stdout).lines().nth(1) {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() >= 5 {
                    out.push_str(&format!(
                        "💿 Disk {}: {} used / {} ({})\n",
                        mount, fields[2], fields[1], fields[4]
                    ));
                }
            }
        }
    }

    if let Ok(sessions) = Command::new("tmux").arg("list-sessions").output() {
        let text = String::from_utf8_lossy(&sessions.stdout).trim().to_string();
        if !text.is_empty() {
            out.push_str(&format!("\n📟 Tmux sessions: {}\n{}", text.lines().count(), text));
        }
    }

    out
}

/// `ccc send <file>`: upload a file to the session topic for the cwd.
pub fn send_file(path: &str) -> Result<()> {
    let config = Config::load().context("not configured. Run: ccc setup <bot_token>")?;
    if config.group_id == 0 {
        bail!("no group configured. Run: ccc setgroup");
    }
    let file = PathBuf::from(path);
    if !file.exists() {
        bail!("file not found: {}", path);
    }
    let cwd = std::env::current_dir()?.to_string_lossy().into_owned();
    let (_, topic_id) = config
        .session_by_cwd(&cwd)
        .context("no session matches the current directory")?;
    let api = Api::new(&config.bot_token);
    api.send_document(config.group_id, topic_id, &file)?;
    println!("📎 Sent {}", path);
    Ok(())
}

// --- Hook installation ---

fn claude_settings_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("settings.json")
}

fn hook_entry(command: &str, matcher: Option<&str>, timeout_ms: Option<i64>) -> serde_json::Value {
    let mut hook = serde_json::json!({ "command": command, "type": "command" });
    if let Some(t) = timeout_ms {
        hook["timeout"] = serde_json::json!(t);
    }
    let mut entry = serde_json::json!({ "hooks": [hook] });
    if let Some(m) = matcher {
        entry["matcher"] = serde_json::json!(m);
    }
    entry
}

fn is_ccc_hook(entry: &serde_json::Value) -> bool {
    let has_ccc = |v: &serde_json::Value| {
        v.get("command")
            .and_then(|c| c.as_str())
            .map(|c| c.contains("ccc hook"))
            .unwrap_or(false)
    };
    if has_ccc(entry) {
        return true;
    }
    entry
        .get("hooks")
        .and_then(|h| h.as_array())
        .map(|hooks| hooks.iter().any(has_ccc))
        .unwrap_or(false)
}

const ALL_HOOK_TYPES: &[&str] = &[
    "Stop",
    "Notification",
    "PermissionRequest",
    "PostToolUse",
    "PreToolUse",
    "UserPromptSubmit",
    "PreCompact",
    "SessionStart",
];

/// Install our hooks into ~/.claude/settings.json, replacing any stale ones.
pub fn install_hooks() -> Result<()> {
    let path = claude_settings_path();
    let data = std::fs::read(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut settings: serde_json::Value =
        serde_json::from_slice(&data).context("failed to parse settings.json")?;

    if !settings.get("hooks").map(|h| h.is_object()).unwrap_or(false) {
        settings["hooks"] = serde_json::json!({});
    }
    let hooks = settings["hooks"].as_object_mut().unwrap();

    // Drop every existing ccc entry first.
    for hook_type in ALL_HOOK_TYPES {
        if let Some(existing) = hooks.get_mut(*hook_type).and_then(|v| v.as_array_mut()) {
            existing.retain(|entry| !is_ccc_hook(entry));
            if existing.is_empty() {
                hooks.remove(*hook_type);
            }
        }
    }

    let ccc = crate::tmux::ccc_path();
    let ccc = ccc.display();
    let ours: &[(&str, serde_json::Value)] = &[
        ("PreToolUse", hook_entry(&format!("{} hook-pre-tool", ccc), Some(""), Some(300_000))),
        ("Stop", hook_entry(&format!("{} hook-stop", ccc), None, None)),
        ("PostToolUse", hook_entry(&format!("{} hook-post-tool", ccc), None, None)),
        ("UserPromptSubmit", hook_entry(&format!("{} hook-user-prompt", ccc), None, None)),
        ("Notification", hook_entry(&format!("{} hook-notification", ccc), None, None)),
        ("PreCompact", hook_entry(&format!("{} hook-compact", ccc), None, None)),
        ("SessionStart", hook_entry(&format!("{} hook-compact", ccc), Some("compact"), None)),
    ];
    for (hook_type, entry) in ours {
        let list = hooks
            .entry(hook_type.to_string())
            .or_insert_with(|| serde_json::json!([]));
        if let Some(arr) = list.as_array_mut() {
            arr.insert(0, entry.clone());
        }
    }

    std::fs::write(&path, serde_json::to_vec_pretty(&settings)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("✅ Claude hooks installed!");
    Ok(())
}

pub fn uninstall_hooks() -> Result<()> {
    let path = claude_settings_path();
    let data = std::fs::read(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mut settings: serde_json::Value =
        serde_json::from_slice(&data).context("failed to parse settings.json")?;

    let Some(hooks) = settings.get_mut("hooks").and_then(|h| h.as_object_mut()) else {
        println!("No hooks found");
        return Ok(());
    };
    for hook_type in ALL_HOOK_TYPES {
        if let Some(existing) = hooks.get_mut(*hook_type).and_then(|v| v.as_array_mut()) {
            existing.retain(|entry| !is_ccc_hook(entry));
            if existing.is_empty() {
                hooks.remove(*hook_type);
            }
        }
    }

    std::fs::write(&path, serde_json::to_vec_pretty(&settings)?)
        .with_context(|| format!("failed to write {}", path.display()))?;
    println!("✅ Claude hooks uninstalled!");
    Ok(())
}

/// Install the file-sending skill so the assistant knows about `ccc send`.
pub fn install_skill() -> Result<()> {
    let skill_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("skills");
    std::fs::create_dir_all(&skill_dir)
        .with_context(|| format!("failed to create {}", skill_dir.display()))?;
    let content = "\
# CCC Send - File Transfer Skill

## Description
Send files to the user via Telegram using the ccc send command.

## Usage
When the user asks you to send them a file, or when you have generated a
file the user needs (a build artifact, a report, any other file), run:

```bash
ccc send <file_path>
```

## Notes
- The command detects the current session from your working directory
- Use this proactively when you've created files the user needs!
";
    std::fs::write(skill_dir.join("ccc-send.md"), content)?;
    println!("✅ CCC send skill installed!");
    Ok(())
}

// --- Service management ---

fn is_macos() -> bool {
    std::path::Path::new("/Library").exists()
}

fn launchd_plist_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("Library/LaunchAgents/com.ccc.plist")
}

fn systemd_unit_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config/systemd/user/ccc.service")
}

/// Install the listener as a user service (launchd on macOS, systemd else).
pub fn install_service() -> Result<()> {
    let ccc = crate::tmux::ccc_path();
    if is_macos() {
        let plist = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<!DOCTYPE plist PUBLIC "-//Apple//DTD PLIST 1.0//EN" "http://www.apple.com/DTDs/PropertyList-1.0.dtd">
<plist version="1.0">
<dict>
    <key>Label</key><string>com.ccc</string>
    <key>ProgramArguments</key><array><string>{}</string><string>listen</string></array>
    <key>RunAtLoad</key><true/>
    <key>KeepAlive</key><true/>
    <key>StandardOutPath</key><string>{}</string>
    <key>StandardErrorPath</key><string>{}</string>
</dict>
</plist>
"#,
            ccc.display(),
            crate::paths::cache_dir().join("ccc.log").display(),
            crate::paths::cache_dir().join("ccc.log").display(),
        );
        let path = launchd_plist_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, plist)?;
        let _ = Command::new("launchctl").arg("load").arg(&path).status();
    } else {
        let unit = format!(
            "[Unit]\nDescription=ccc Telegram bridge listener\n\n\
             [Service]\nExecStart={} listen\nRestart=always\nRestartSec=5\n\n\
             [Install]\nWantedBy=default.target\n",
            ccc.display()
        );
        let path = systemd_unit_path();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, unit)?;
        let _ = Command::new("systemctl").args(["--user", "daemon-reload"]).status();
        let _ = Command::new("systemctl")
            .args(["--user", "enable", "--now", "ccc"])
            .status();
    }
    println!("✅ Background service installed!");
    Ok(())
}

pub fn stop_listener_service() {
    if is_macos() {
        let _ = Command::new("launchctl")
            .arg("unload")
            .arg(launchd_plist_path())
            .status();
    } else {
        let _ = Command::new("systemctl").args(["--user", "stop", "ccc"]).status();
    }
    // Also stop a manually started listener via its pid file.
    if let Ok(data) = std::fs::read_to_string(crate::paths::lock_path()) {
        if let Ok(pid) = data.trim().parse::<i32>() {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
    }
    std::thread::sleep(Duration::from_millis(500));
}

pub fn start_listener_service() {
    if is_macos() {
        let _ = Command::new("launchctl")
            .arg("load")
            .arg(launchd_plist_path())
            .status();
    } else {
        let _ = Command::new("systemctl").args(["--user", "start", "ccc"]).status();
    }
}

// --- Setup ---

/// `ccc setup <token> [--otp]`: capture the chat id from the first private
/// message, optionally a supergroup for topics, then install everything.
pub fn setup(bot_token: &str, otp_mode: bool) -> Result<()> {
    println!("🚀 ccc setup");
    println!("============");
    println!();

    let mut config = Config::load().unwrap_or_default();
    config.bot_token = bot_token.to_string();

    println!("Stopping listener...");
    stop_listener_service();

    let api = Api::new(bot_token);

    println!("Step 1/5: Connecting to Telegram...");
    println!("   📱 Send any message to your bot in Telegram");
    println!("   Waiting...");
    let mut offset = 0i64;
    'outer: loop {
        let updates = api.get_updates(offset).context("check your bot token")?;
        for update in updates {
            offset = update.update_id + 1;
            if let Some(msg) = &update.message {
                if msg.chat.id != 0 && msg.chat.chat_type == "private" {
                    config.chat_id = msg.chat.id;
                    config.save()?;
                    println!("✅ Connected! (User: @{})\n", msg.from.username);
                    break 'outer;
                }
            }
        }
        std::thread::sleep(Duration::from_secs(1));
    }

    println!("Step 2/5: Group setup (optional)");
    println!("   Create a group with Topics enabled, add the bot as admin,");
    println!("   and send a message there. Waiting 30 seconds...");
    let deadline = Instant::now() + Duration::from_secs(30);
    'group: while Instant::now() < deadline {
        let Ok(updates) = api.get_updates(offset) else {
            continue;
        };
        for update in updates {
            offset = update.update_id + 1;
            if let Some(msg) = &update.message {
                if msg.chat.chat_type == "supergroup" {
                    config.group_id = msg.chat.id;
                    config.save()?;
                    println!("✅ Group configured!\n");
                    break 'group;
                }
            }
        }
    }
    if config.group_id == 0 {
        println!("⏭️  Skipped (you can run 'ccc setgroup' later)");
    }

    println!("Step 3/5: Installing Claude hooks and skill...");
    if let Err(err) = install_hooks() {
        println!("⚠️  Hook installation failed: {}", err);
        println!("   You can install them later with: ccc install");
    }
    if let Err(err) = install_skill() {
        println!("⚠️  Skill installation failed: {}", err);
    }

    println!("Step 4/5: Installing background service...");
    if let Err(err) = install_service() {
        println!("⚠️  Service installation failed: {}", err);
        println!("   You can start manually with: ccc listen");
    }

    println!("Step 5/5: Configuring permission mode...");
    if otp_mode {
        let (secret, uri) = crate::otp::generate_secret();
        config.otp_secret = secret.clone();
        config.save()?;
        println!("🔐 OTP enabled. Add this secret to your authenticator app:");
        println!();
        println!("   Secret: {}", secret);
        println!("   URI:    {}", uri);
        println!();
        println!("   Save this secret! You'll need it to approve remote permission requests.");
    } else {
        config.otp_secret.clear();
        config.save()?;
        println!("✅ Auto-approve mode — all remote permissions granted automatically");
    }

    println!();
    println!("============");
    println!("✅ Setup complete!");
    println!();
    println!("Usage:");
    println!("  ccc           Start Claude Code in current directory");
    println!("  ccc -c        Continue previous session");
    if config.group_id != 0 {
        println!();
        println!("Telegram commands (in your group):");
        println!("  /new <name>   Create new session");
    }

    println!();
    println!("Restarting listener...");
    start_listener_service();
    Ok(())
}

/// `ccc setgroup`: wait for an authorized message in a supergroup.
pub fn set_group() -> Result<()> {
    let mut config = Config::load().context("not configured. Run: ccc setup <bot_token>")?;
    let api = Api::new(&config.bot_token);

    println!("Send a message in the group where you want to use topics...");
    println!("(Make sure Topics are enabled in group settings)");

    let mut offset = 0i64;
    loop {
        let updates = api.get_updates(offset)?;
        for update in updates {
            offset = update.update_id + 1;
            if let Some(msg) = &update.message {
                if msg.chat.chat_type == "supergroup" && msg.from.id == config.chat_id {
                    config.group_id = msg.chat.id;
                    config.save()?;
                    println!("Group set: {}", msg.chat.id);
                    println!("You can now create sessions with: /new <name>");
                    return Ok(());
                }
            }
        }
    }
}

// --- Doctor ---

pub fn doctor() {
    println!("🩺 ccc doctor");
    println!("=============");
    println!();

    let mut all_good = true;

    print!("tmux.............. ");
    match crate::tmux::tmux_path() {
        Some(path) => println!("✅ {}", path.display()),
        None => {
            println!("❌ not found");
            println!("   Install: brew install tmux (macOS) or apt install tmux (Linux)");
            all_good = false;
        }
    }

    print!("claude............ ");
    match crate::tmux::claude_path() {
        Some(path) => println!("✅ {}", path.display()),
        None => {
            println!("❌ not found");
            println!("   Install: npm install -g @anthropic-ai/claude-code");
            all_good = false;
        }
    }

    print!("ccc in PATH....... ");
    let installed = dirs::home_dir()
        .map(|h| h.join("bin/ccc"))
        .filter(|p| p.exists());
    match installed.or_else(|| which::which("ccc").ok()) {
        Some(path) => println!("✅ {}", path.display()),
        None => {
            println!("❌ not found");
            println!("   Run: cargo install --path . (or cp target/release/ccc ~/bin/)");
            all_good = false;
        }
    }

    print!("config............ ");
    let config = match Config::load() {
        Ok(config) => {
            println!("✅ {}", crate::paths::config_path().display());

            print!("  bot_token....... ");
            if config.bot_token.is_empty() {
                println!("❌ missing");
                all_good = false;
            } else {
                println!("✅ configured");
            }

            print!("  chat_id......... ");
            if config.chat_id == 0 {
                println!("❌ missing");
                all_good = false;
            } else {
                println!("✅ {}", config.chat_id);
            }

            print!("  group_id........ ");
            if config.group_id == 0 {
                println!("⚠️  not set (optional, run: ccc setgroup)");
            } else {
                println!("✅ {}", config.group_id);
            }
            Some(config)
        }
        Err(_) => {
            println!("❌ not found");
            println!("   Run: ccc setup <bot_token>");
            all_good = false;
            None
        }
    };

    print!("claude hooks...... ");
    match std::fs::read(claude_settings_path())
        .ok()
        .and_then(|data| serde_json::from_slice::<serde_json::Value>(&data).ok())
    {
        Some(settings) => {
            let hooks = settings.get("hooks").and_then(|h| h.as_object());
            let has = |name: &str| {
                hooks
                    .and_then(|h| h.get(name))
                    .and_then(|v| v.as_array())
                    .map(|a| !a.is_empty())
                    .unwrap_or(false)
            };
            let installed: Vec<&str> =
                ["Stop", "PreToolUse"].into_iter().filter(|h| has(h)).collect();
            match installed.len() {
                2 => println!("✅ installed ({})", installed.join(", ")),
                0 => println!("❌ not installed (run: ccc install)"),
                _ => println!("⚠️  partial ({}) - run: ccc install", installed.join(", ")),
            }
        }
        None => println!("⚠️  ~/.claude/settings.json not found"),
    }

    print!("service........... ");
    if is_macos() {
        if launchd_plist_path().exists() {
            let loaded = Command::new("launchctl")
                .args(["list", "com.ccc"])
                .status()
                .map(|s| s.success())
                .unwrap_or(false);
            if loaded {
                println!("✅ running (launchd)");
            } else {
                println!("⚠️  installed but not running");
            }
        } else {
            println!("❌ not installed (run: ccc setup <token>)");
            all_good = false;
        }
    } else {
        let active = Command::new("systemctl")
            .args(["--user", "is-active", "ccc"])
            .output()
            .map(|o| String::from_utf8_lossy(&o.stdout).trim() == "active")
            .unwrap_or(false);
        if active {
            println!("✅ running (systemd)");
        } else if systemd_unit_path().exists() {
            println!("⚠️  installed but not running");
            println!("   Run: systemctl --user start ccc");
        } else {
            println!("❌ not installed (run: ccc setup <token>)");
            all_good = false;
        }
    }

    print!("transcription..... ");
    match config.as_ref().map(|c| c.transcription_cmd.as_str()) {
        Some(cmd) if !cmd.is_empty() => println!("✅ {}", cmd),
        _ => println!("⚠️  not set (voice messages disabled)"),
    }

    print!("oauth token....... ");
    let has_env_token = !std::env::var("CLAUDE_CODE_OAUTH_TOKEN").unwrap_or_default().is_empty();
    match config.as_ref() {
        Some(c) if !c.oauth_token.is_empty() => println!("✅ configured (in config)"),
        _ if has_env_token => println!("✅ configured (from environment)"),
        _ => println!("⚠️  not set (optional)"),
    }

    print!("OTP (permissions). ");
    match config.as_ref() {
        Some(c) if c.is_otp_enabled() => println!("✅ enabled"),
        _ => println!("⚠️  disabled (run: ccc setup <token> --otp to enable)"),
    }

    println!();
    if all_good {
        println!("✅ All checks passed!");
    } else {
        println!("❌ Some issues found. Fix them and run 'ccc doctor' again.");
    }
}

// --- Self-update ---

/// GitHub repository the /update command pulls release binaries from.
const UPDATE_REPO: &str = "ccc-bridge/ccc";

#[derive(serde::Deserialize)]
struct Release {
    tag_name: String,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(serde::Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

/// Download the latest release binary for this platform over the current
/// executable (write-temp + rename) and report the new version tag.
pub fn self_update() -> Result<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(Duration::from_secs(120))
        .user_agent(format!("ccc/{}", VERSION))
        .build()?;

    let release: Release = client
        .get(format!("https://api.github.com/repos/{}/releases/latest", UPDATE_REPO))
        .send()
        .context("failed to query latest release")?
        .json()
        .context("failed to parse release metadata")?;

    let wanted = format!("ccc-{}-{}", std::env::consts::OS, std::env::consts::ARCH);
    let asset = release
        .assets
        .iter()
        .find(|a| a.name.contains(&wanted))
        .with_context(|| format!("no release asset for {}", wanted))?;

    let bytes = client
        .get(&asset.browser_download_url)
        .send()
        .context("failed to download release asset")?
        .bytes()
        .context("failed to read release asset")?;

    let exe = std::env::current_exe().context("cannot locate current executable")?;
    let tmp = exe.with_extension("update");
    std::fs::write(&tmp, &bytes)
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o755))?;
    }
    std::fs::rename(&tmp, &exe)
        .with_context(|| format!("failed to replace {}", exe.display()))?;

    Ok(release.tag_name)
}

/// `ccc config ...`: show or set configuration values.
pub fn config_command(args: &[String]) -> Result<()> {
    let mut config = Config::load().context("not configured. Run: ccc setup <bot_token>")?;
    match args {
        [] => {
            println!("chat_id:          {}", config.chat_id);
            println!("group_id:         {}", config.group_id);
            println!("projects_dir:     {}", config.projects_dir);
            println!("transcription:    {}", config.transcription_cmd);
            println!("otp:              {}", if config.is_otp_enabled() { "enabled" } else { "disabled" });
            println!("away:             {}", config.away);
            println!("sessions:         {}", config.sessions.len());
            for (name, info) in &config.sessions {
                println!("  {} → topic {} ({})", name, info.topic_id, info.path);
            }
            Ok(())
        }
        [key, value] if key == "projects-dir" => {
            config.projects_dir = value.clone();
            config.save()?;
            println!("projects_dir set to {}", value);
            Ok(())
        }
        [key, value] if key == "oauth-token" => {
            config.oauth_token = value.clone();
            config.save()?;
            println!("oauth_token saved");
            Ok(())
        }
        [key, value] if key == "transcription-cmd" => {
            config.transcription_cmd = value.clone();
            config.save()?;
            println!("transcription_cmd set to {}", value);
            Ok(())
        }
        [key, value] if key == "away" => {
            config.away = value == "on" || value == "true";
            config.save()?;
            println!("away set to {}", config.away);
            Ok(())
        }
        _ => bail!("usage: ccc config [projects-dir|oauth-token|transcription-cmd|away <value>]"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execute_command_captures_output() {
        let result = execute_command("echo hello");
        assert!(result.output.contains("hello"));
        assert!(result.error.is_none());
    }

    #[test]
    fn execute_command_merges_stderr() {
        let result = execute_command("echo error >&2");
        assert!(result.output.contains("error"));
        assert!(result.error.is_none());
    }

    #[test]
    fn execute_command_reports_failure() {
        let result = execute_command("exit 3");
        assert!(result.error.is_some());
    }

    #[test]
    fn execute_command_handles_missing_binary() {
        let result = execute_command("nonexistentcommand123");
        assert!(result.error.is_some());
    }

    #[test]
    fn run_with_timeout_kills_slow_children() {
        let mut cmd = Command::new("sleep");
        cmd.arg("5");
        let start = Instant::now();
        let result = run_with_timeout(cmd, Duration::from_millis(200));
        assert!(start.elapsed() < Duration::from_secs(3));
        assert_eq!(result.error.as_deref(), Some("timeout"));
    }

    #[test]
    fn hook_entry_shapes() {
        let entry = hook_entry("ccc hook-stop", None, None);
        assert!(is_ccc_hook(&entry));
        assert!(entry.get("matcher").is_none());

        let entry = hook_entry("ccc hook-pre-tool", Some(""), Some(300_000));
        assert_eq!(entry["matcher"], "");
        assert_eq!(entry["hooks"][0]["timeout"], 300_000);

        let other = serde_json::json!({"hooks": [{"command": "other-tool hook", "type": "command"}]});
        assert!(!is_ccc_hook(&other));
    }
}
