use thiserror::Error;

/// Failures callers may want to branch on. Everything else travels as a
/// plain `anyhow::Error` with context.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0} is required")]
    MissingField(&'static str),

    #[error("Timed out connecting to {addr} after {secs}s")]
    ConnectTimeout { addr: String, secs: u64 },

    #[error("Proxy error: {0}")]
    Proxy(String),

    #[error("SSH authentication failed for {0}")]
    AuthFailed(String),

    #[error("A command capture is already running")]
    CaptureBusy,

    #[error("Session is closed")]
    Closed,

    #[error("Remote command exited with {code}: {stderr}")]
    RemoteCommand { code: u32, stderr: String },

    #[error("No such file or directory: {0}")]
    NotFound(String),

    #[error("cancelled")]
    Cancelled,

    #[error("Host identity rejected")]
    VerificationRejected,
}

pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<SessionError>(),
        Some(SessionError::Cancelled)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_survives_context_wrapping() {
        let err = anyhow::Error::new(SessionError::Cancelled).context("upload /tmp/a");
        assert!(is_cancelled(&err));
        assert!(!is_cancelled(&anyhow::anyhow!("cancelled")));
    }

    #[test]
    fn remote_command_message_includes_stderr() {
        let err = SessionError::RemoteCommand {
            code: 1,
            stderr: "rm: cannot remove".into(),
        };
        assert_eq!(err.to_string(), "Remote command exited with 1: rm: cannot remove");
    }
}
