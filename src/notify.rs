//! Lease notifications.
//!
//! Delivery failures are logged and swallowed by [`deliver`]; they never
//! fail the lifecycle operation that triggered them.

use crate::config::NotifierConfig;
use crate::error::{Error, Result};
use async_trait::async_trait;
use leasepool_protocol::User;
use std::fmt::Debug;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

/// Capability to send a message to a set of identities.
#[async_trait]
pub trait Notifier: Send + Sync + Debug {
    /// Send `subject` and `body` to every recipient.
    async fn notify(&self, recipients: &[User], subject: &str, body: &str) -> Result<()>;
}

/// Writes notices to the log.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, recipients: &[User], subject: &str, body: &str) -> Result<()> {
        let to: Vec<&str> = recipients.iter().map(|u| u.name.as_str()).collect();
        tracing::info!(target: "notify", to = ?to, subject = %subject, body = %body, "notification");
        Ok(())
    }
}

/// Pipes each notice to a mailer program.
///
/// `{subject}` in the configured arguments is replaced by the subject;
/// recipient addresses are appended; the body is written to stdin.
#[derive(Debug)]
pub struct CommandNotifier {
    program: String,
    args: Vec<String>,
}

impl CommandNotifier {
    /// Notifier running `program` with leading `args`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command_args(&self, recipients: &[User], subject: &str) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.replace("{subject}", subject))
            .chain(
                recipients
                    .iter()
                    .filter(|u| !u.email.is_empty())
                    .map(|u| u.email.clone()),
            )
            .collect()
    }
}

#[async_trait]
impl Notifier for CommandNotifier {
    async fn notify(&self, recipients: &[User], subject: &str, body: &str) -> Result<()> {
        if recipients.iter().all(|u| u.email.is_empty()) {
            tracing::debug!(subject = %subject, "no recipient has an email address");
            return Ok(());
        }
        let args = self.command_args(recipients, subject);
        let mut child = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::command_failed(&self.program, e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(body.as_bytes()).await?;
        }
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(Error::command_failed(
                &self.program,
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(())
    }
}

/// Build the configured notifier.
pub fn from_config(config: &NotifierConfig) -> Arc<dyn Notifier> {
    match config {
        NotifierConfig::Log => Arc::new(LogNotifier),
        NotifierConfig::Command { program, args } => {
            Arc::new(CommandNotifier::new(program.clone(), args.clone()))
        }
    }
}

/// Send a notice, logging instead of propagating any failure.
pub async fn deliver(notifier: &dyn Notifier, recipients: &[User], subject: &str, body: &str) {
    if recipients.is_empty() {
        return;
    }
    if let Err(e) = notifier.notify(recipients, subject, body).await {
        tracing::warn!(error = %e, subject = %subject, "notification failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(name: &str, email: &str) -> User {
        User {
            name: name.into(),
            email: email.into(),
            vlaunchtoken: None,
        }
    }

    #[test]
    fn test_command_args_substitute_subject_and_append_addresses() {
        let notifier = CommandNotifier::new("mail", vec!["-s".into(), "{subject}".into()]);
        let args = notifier.command_args(
            &[user("admin", "admin@example.com"), user("bob", "")],
            "alice leased vm1",
        );
        assert_eq!(args, vec!["-s", "alice leased vm1", "admin@example.com"]);
    }

    #[tokio::test]
    async fn test_deliver_swallows_failures() {
        let notifier = CommandNotifier::new("/nonexistent/leasepool-mailer", vec![]);
        // Must return normally.
        deliver(&notifier, &[user("admin", "admin@example.com")], "subject", "body").await;
    }

    #[tokio::test]
    async fn test_log_notifier_succeeds() {
        assert!(LogNotifier
            .notify(&[user("admin", "")], "subject", "body")
            .await
            .is_ok());
    }
}
