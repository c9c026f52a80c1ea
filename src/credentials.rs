//! Mail credential loading from the process environment.
//!
//! The alert dispatcher authenticates with an SMTP app password read from
//! `EMAIL_FROM` / `EMAIL_APP_PASSWORD` / `EMAIL_TO`. Missing credentials
//! are not fatal: the watchdog degrades to log-only alerting.

/// SMTP credentials for the email dispatcher.
#[derive(Clone)]
pub struct MailCredentials {
    /// Sender address, also the SMTP username.
    pub from: String,
    /// App password for the SMTP relay.
    pub app_password: String,
    /// Recipient address for alerts.
    pub to: String,
}

impl std::fmt::Debug for MailCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailCredentials")
            .field("from", &self.from)
            .field("to", &self.to)
            .field("app_password", &"[REDACTED]")
            .finish()
    }
}

impl MailCredentials {
    /// Read credentials from the environment.
    ///
    /// Returns `None` when any of the three variables is absent or empty;
    /// the caller decides whether that downgrades alerting or aborts.
    pub fn from_env() -> Option<Self> {
        let from = non_empty_var("EMAIL_FROM")?;
        let app_password = non_empty_var("EMAIL_APP_PASSWORD")?;
        let to = non_empty_var("EMAIL_TO")?;
        Some(Self {
            from,
            app_password,
            to,
        })
    }
}

/// Read an environment variable, treating empty values as absent.
fn non_empty_var(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(value) if !value.trim().is_empty() => Some(value),
        _ => None,
    }
}
