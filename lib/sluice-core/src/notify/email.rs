use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use sluice_error::{generic_error, ErrorContext as _, GenericError};
use tokio::{io::AsyncWriteExt as _, process::Command, time::timeout};

use super::{Notification, NotificationChannel};

/// Email channel.
///
/// Pipes an RFC 5322 message to a `sendmail`-compatible command, which is expected to read recipients from the
/// headers (as `sendmail -t` does).
pub struct EmailChannel {
    command: String,
    from: String,
    to: Vec<String>,
    timeout: Duration,
}

impl EmailChannel {
    /// Creates a new `EmailChannel`.
    ///
    /// The command is split on whitespace, so it may carry arguments, such as `/usr/sbin/sendmail -t`.
    pub fn new<C: Into<String>, F: Into<String>>(command: C, from: F, to: Vec<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            from: from.into(),
            to,
            timeout,
        }
    }

    fn render_message(&self, notification: &Notification) -> String {
        let subject: String = notification
            .title
            .chars()
            .map(|c| if c == '\r' || c == '\n' { ' ' } else { c })
            .collect();

        format!(
            "From: {}\r\nTo: {}\r\nSubject: {}\r\nX-Sluice-Level: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}\r\n",
            self.from,
            self.to.join(", "),
            subject,
            notification.level,
            notification.body.replace('\n', "\r\n")
        )
    }
}

#[async_trait]
impl NotificationChannel for EmailChannel {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn deliver(&self, notification: &Notification) -> Result<(), GenericError> {
        if self.to.is_empty() {
            return Err(generic_error!("No email recipients configured."));
        }

        let message = self.render_message(notification);
        let mut parts = self.command.split_whitespace();
        let program = parts.next().error_context("Email command is empty.")?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_error_context(|| format!("Failed to run email command '{}'.", self.command))?;

        let send = async {
            if let Some(mut stdin) = child.stdin.take() {
                stdin
                    .write_all(message.as_bytes())
                    .await
                    .error_context("Failed to write message to email command.")?;
            }
            child
                .wait_with_output()
                .await
                .error_context("Failed to wait for email command.")
        };

        let output = timeout(self.timeout, send)
            .await
            .map_err(|_| generic_error!("Email command did not finish within {} seconds.", self.timeout.as_secs()))??;

        if !output.status.success() {
            return Err(generic_error!(
                "Email command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }

        Ok(())
    }
}
