//! Interactive confirmation before a job changes anything.

use async_trait::async_trait;
use dialoguer::Confirm;
use hawq_backup::{ConfirmationGate, HdbError, Result};
use std::io::IsTerminal;

/// Prints the job summary and asks on the terminal.
pub struct TerminalGate;

#[async_trait]
impl ConfirmationGate for TerminalGate {
    async fn confirm(&self, summary: &str) -> Result<bool> {
        if !std::io::stdin().is_terminal() {
            return Err(HdbError::Config(
                "Confirmation needs a terminal; rerun with --yes".into(),
            ));
        }
        eprintln!("\n{}", summary);
        tokio::task::spawn_blocking(|| {
            Confirm::new()
                .with_prompt("Continue with these parameters?")
                .default(false)
                .interact()
        })
        .await
        .map_err(|e| HdbError::Io(std::io::Error::other(e.to_string())))?
        .map_err(|e| HdbError::Io(std::io::Error::other(e.to_string())))
    }
}
