use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::access::{AccessError, AccessList};
use crate::error::ScanError;
use crate::orchestrator::Orchestrator;
use crate::ports::display_ports;
use crate::types::{RateTier, RunReport, UserId};

const NOT_AUTHORIZED: &str = "You are not authorized to use this bot.";

const RANGE_FORMATS: &str = "Invalid IP range format detected. Please ensure each line contains either:\n\
    - CIDR notation (e.g., 12.0.0.0/8)\n\
    - IP range (e.g., 12.0.0.0-16.0.0.0)\n\
    - Single IP (e.g., 12.0.0.0)";

const UPLOAD_OK: &str = "File uploaded and validated successfully!\n\
    Now send the ports to scan in any of these formats:\n\
    - Single port: 80\n\
    - Multiple ports: 80,443,8080\n\
    - Port range: 80-100\n\
    - Combined: 80,443,1000-2000";

const PORT_FORMATS: &str = "Invalid port format. Examples:\n\
    Single port: 80\n\
    Multiple ports: 80,443,8080\n\
    Port range: 80-100";

/// Something a user sent through the chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A slash command or a port spec.
    Text(String),
    Document { file_name: String, contents: Vec<u8> },
    /// Inline button payload such as `rate_fast`.
    Callback(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Status,
    Cancel,
    SetRate(Option<String>),
    AddSudo(Option<String>),
    RemoveSudo(Option<String>),
}

impl Command {
    /// `None` for plain text and for unknown commands. `/cmd@botname` is accepted.
    pub fn parse(text: &str) -> Option<Command> {
        let mut words = text.split_whitespace();
        let head = words.next()?.strip_prefix('/')?;
        let name = head.split('@').next().unwrap_or(head);
        let arg = words.next().map(str::to_string);
        match name {
            "start" => Some(Command::Start),
            "help" => Some(Command::Help),
            "status" => Some(Command::Status),
            "cancel" => Some(Command::Cancel),
            "setrate" => Some(Command::SetRate(arg)),
            "addsudo" => Some(Command::AddSudo(arg)),
            "rmsudo" => Some(Command::RemoveSudo(arg)),
            _ => None,
        }
    }
}

/// Maps chat input onto the orchestrator and answers through its transport.
#[derive(Clone)]
pub struct ChatBot {
    orchestrator: Orchestrator,
    access: Arc<AccessList>,
}

impl ChatBot {
    pub fn new(orchestrator: Orchestrator, access: Arc<AccessList>) -> Self {
        Self {
            orchestrator,
            access,
        }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    pub fn access(&self) -> &AccessList {
        &self.access
    }

    /// Handle one inbound item. Returns the run handle when a scan was launched.
    pub async fn handle(&self, user: UserId, inbound: Inbound) -> Option<JoinHandle<RunReport>> {
        match inbound {
            Inbound::Text(text) => match Command::parse(&text) {
                Some(cmd) => {
                    self.handle_command(user, cmd).await;
                    None
                }
                None if text.trim_start().starts_with('/') => {
                    debug!(user, %text, "unknown command ignored");
                    None
                }
                None => self.handle_ports(user, &text).await,
            },
            Inbound::Document {
                file_name,
                contents,
            } => {
                self.handle_document(user, &file_name, &contents).await;
                None
            }
            Inbound::Callback(data) => {
                self.handle_callback(user, &data).await;
                None
            }
        }
    }

    async fn handle_command(&self, user: UserId, cmd: Command) {
        match &cmd {
            Command::AddSudo(arg) => return self.manage_sudo(user, arg.clone(), true).await,
            Command::RemoveSudo(arg) => return self.manage_sudo(user, arg.clone(), false).await,
            _ => {}
        }

        if !self.access.is_allowed(user) {
            if cmd == Command::Start {
                self.reply(user, NOT_AUTHORIZED).await;
            }
            return;
        }

        match cmd {
            Command::Start => self.reply(user, &welcome_text()).await,
            Command::Help => self.reply(user, &self.help_text()).await,
            Command::Status => self.reply(user, &self.status_text(user)).await,
            Command::Cancel => {
                if self.orchestrator.cancel(user).await {
                    self.reply(user, "Canceling scan...").await;
                } else {
                    self.reply(user, "No active scans to cancel.").await;
                }
            }
            Command::SetRate(None) => {
                let choices: Vec<&str> = RateTier::ALL.iter().map(RateTier::as_str).collect();
                self.reply(
                    user,
                    &format!(
                        "Select scan rate: {}\nReply with /setrate <rate>",
                        choices.join(", ")
                    ),
                )
                .await;
            }
            Command::SetRate(Some(rate)) => self.select_rate(user, &rate).await,
            Command::AddSudo(_) | Command::RemoveSudo(_) => {}
        }
    }

    async fn manage_sudo(&self, caller: UserId, arg: Option<String>, add: bool) {
        if !self.access.is_owner(caller) {
            let verb = if add { "add" } else { "remove" };
            self.reply(caller, &format!("Only the owner can {verb} sudo users."))
                .await;
            return;
        }
        let Some(target) = arg.and_then(|a| a.parse::<UserId>().ok()) else {
            let usage = if add { "/addsudo" } else { "/rmsudo" };
            self.reply(caller, &format!("Usage: {usage} {{user_id}}")).await;
            return;
        };

        let result = if add {
            self.access.add_sudo(caller, target)
        } else {
            self.access.remove_sudo(caller, target)
        };
        let text = match result {
            Ok(()) if add => format!("User {target} added as sudo user."),
            Ok(()) => format!("User {target} removed from sudo users."),
            Err(AccessError::AlreadySudo) => "User is already a sudo user.".to_string(),
            Err(AccessError::NotSudo) => "User is not a sudo user.".to_string(),
            Err(AccessError::CannotRemoveOwner) => {
                "Cannot remove the owner from sudo users.".to_string()
            }
            Err(e @ AccessError::NotOwner) => e.to_string(),
        };
        self.reply(caller, &text).await;
    }

    async fn handle_callback(&self, user: UserId, data: &str) {
        if !self.access.is_allowed(user) {
            return;
        }
        match data.strip_prefix("rate_") {
            Some(rate) => self.select_rate(user, rate).await,
            None => debug!(user, data, "unknown callback ignored"),
        }
    }

    async fn select_rate(&self, user: UserId, rate: &str) {
        match rate.parse::<RateTier>() {
            Ok(tier) => {
                self.orchestrator.set_rate(user, tier);
                self.reply(user, &format!("Scan rate set to: {tier}")).await;
            }
            Err(e) => {
                warn!(user, "{e}");
                self.reply(user, "Unknown scan rate. Choose slow, normal or fast.")
                    .await;
            }
        }
    }

    async fn handle_document(&self, user: UserId, file_name: &str, contents: &[u8]) {
        if !self.access.is_allowed(user) {
            self.reply(user, NOT_AUTHORIZED).await;
            return;
        }
        if !file_name.ends_with(".txt") {
            debug!(user, file_name, "non-.txt upload ignored");
            return;
        }

        let text = match self.orchestrator.accept_upload(user, contents).await {
            Ok(_) => UPLOAD_OK.to_string(),
            Err(ScanError::FileTooLarge { .. }) => format!(
                "File too large. Maximum size: {}",
                self.orchestrator.config().max_file_size_label()
            ),
            Err(ScanError::EmptyFile) => {
                "File is empty. Please upload a file with IP ranges.".to_string()
            }
            Err(ScanError::InvalidRangeFormat(_)) => RANGE_FORMATS.to_string(),
            Err(e) => {
                error!(user, "error handling file upload: {e}");
                "Error processing file. Please try again.".to_string()
            }
        };
        self.reply(user, &text).await;
    }

    async fn handle_ports(&self, user: UserId, text: &str) -> Option<JoinHandle<RunReport>> {
        if !self.access.is_allowed(user) {
            return None;
        }
        if self.orchestrator.session(user).files().is_none() {
            return None;
        }

        let ticket = match self.orchestrator.start_scan(user, text).await {
            Ok(ticket) => ticket,
            Err(e) => {
                let reply = match e {
                    ScanError::InvalidPortFormat(_) => PORT_FORMATS.to_string(),
                    ScanError::ConcurrencyLimitExceeded { .. } => {
                        "Maximum concurrent scans reached. Please wait.".to_string()
                    }
                    ScanError::NoInputFile => return None,
                    other => {
                        error!(user, "failed to start scan: {other}");
                        "Error processing file. Please try again.".to_string()
                    }
                };
                self.reply(user, &reply).await;
                return None;
            }
        };

        self.reply(
            user,
            &format!(
                "Starting scan on ports {}\nRate: {} ({} packets/sec)\nType /cancel to stop.",
                display_ports(ticket.ports()),
                ticket.rate(),
                ticket.packets_per_second()
            ),
        )
        .await;
        Some(ticket.launch())
    }

    fn help_text(&self) -> String {
        let cfg = self.orchestrator.config();
        let timeout = if cfg.scan_timeout_secs % 3600 == 0 {
            format!("{} hours", cfg.scan_timeout_secs / 3600)
        } else {
            format!("{} seconds", cfg.scan_timeout_secs)
        };
        format!(
            "Detailed Help:\n\n\
             1. Upload a .txt file with IP ranges (one per line) in any of these formats:\n\
             \x20  - CIDR notation: 12.0.0.0/8\n\
             \x20  - IP range: 12.0.0.0-16.0.0.0\n\
             \x20  - Single IP: 12.0.0.0\n\n\
             2. Enter ports to scan in any of these formats:\n\
             \x20  - Single port: 80\n\
             \x20  - Multiple ports: 80,443,8080\n\
             \x20  - Port range: 80-100\n\
             \x20  - Combined: 80,443,1000-2000\n\n\
             Scan Rates:\n\
             Slow: {} packets/sec\n\
             Normal: {} packets/sec\n\
             Fast: {} packets/sec\n\n\
             File size limit: {}\n\
             Scan timeout: {}",
            cfg.rates.slow,
            cfg.rates.normal,
            cfg.rates.fast,
            cfg.max_file_size_label(),
            timeout
        )
    }

    fn status_text(&self, user: UserId) -> String {
        let snap = self.orchestrator.session(user).snapshot();
        let ports = if snap.ports.is_empty() {
            "Not set".to_string()
        } else {
            snap.ports
                .iter()
                .map(u16::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        };
        let sudo = self
            .access
            .sudo_users()
            .iter()
            .map(UserId::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "Current Status:\nActive scans: {}\nCurrent scan rate: {}\nPorts: {}\nSudo users: {}",
            snap.active_scans, snap.rate, ports, sudo
        )
    }

    async fn reply(&self, user: UserId, text: &str) {
        if let Err(e) = self.orchestrator.transport().send_text(user, text).await {
            warn!(user, "failed to send reply: {e}");
        }
    }
}

fn welcome_text() -> String {
    [
        "Welcome to the Port Scanner Bot!",
        "",
        "Commands:",
        "/start - Show this message",
        "/help - Show detailed help",
        "/status - Check current scan status",
        "/cancel - Cancel ongoing scan",
        "/setrate - Set scan rate",
        "/addsudo - Add sudo user (owner only)",
        "/rmsudo - Remove sudo user (owner only)",
        "",
        "To begin, upload a .txt file with IP ranges.",
    ]
    .join("\n")
}
