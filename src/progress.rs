use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

use crate::transport::Transport;
use crate::types::{MessageId, UserId};

/// `H:MM:SS`, hours unbounded.
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    let (hours, rem) = (secs / 3600, secs % 3600);
    format!("{}:{:02}:{:02}", hours, rem / 60, rem % 60)
}

pub fn format_progress(elapsed: Duration, found: usize, current_range: &str, ports: &str) -> String {
    format!(
        "Scan in progress\n\
         Time elapsed: {}\n\
         IPs found: {}\n\
         Current range: {}\n\
         Ports: {}\n\
         Type /cancel to stop",
        format_elapsed(elapsed),
        found,
        current_range,
        ports
    )
}

/// Keeps one status message up to date for a run.
///
/// Delivery is best effort: a failed send or edit is logged and the scan goes on.
pub struct ProgressReporter {
    transport: Arc<dyn Transport>,
    user: UserId,
    message: Option<MessageId>,
    last_text: String,
    every_lines: u64,
    lines_seen: u64,
}

impl ProgressReporter {
    /// Post the initial status message.
    pub async fn start(
        transport: Arc<dyn Transport>,
        user: UserId,
        initial: &str,
        every_lines: u64,
    ) -> Self {
        let message = match transport.send_text(user, initial).await {
            Ok(id) => Some(id),
            Err(e) => {
                warn!(user, "failed to post progress message: {e}");
                None
            }
        };
        Self {
            transport,
            user,
            message,
            last_text: initial.to_string(),
            every_lines: every_lines.max(1),
            lines_seen: 0,
        }
    }

    /// Count one engine output line; true when a fresh progress text is due.
    pub fn tick(&mut self) -> bool {
        self.lines_seen += 1;
        self.lines_seen % self.every_lines == 0
    }

    /// Edit the status message unless `new_text` is what it already shows.
    ///
    /// Returns whether an edit was delivered.
    pub async fn update_if_changed(&mut self, new_text: &str) -> bool {
        if new_text == self.last_text {
            return false;
        }
        let Some(message) = self.message else {
            return false;
        };
        match self.transport.edit_text(self.user, message, new_text).await {
            Ok(()) => {
                self.last_text = new_text.to_string();
                true
            }
            Err(e) => {
                warn!(user = self.user, "failed to edit progress message: {e}");
                false
            }
        }
    }
}
