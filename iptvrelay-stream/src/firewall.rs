//! Opportunistic inbound firewall rules for session ports.
//!
//! Cast receivers on the LAN must reach the per-session port. On Windows the
//! relay asks `netsh` for an allow rule; everywhere else exposure is a no-op.
//! Failures never reach the session: callers log them and move on.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use iptvrelay_core::config::FirewallConfig;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum FirewallError {
    #[error("firewall rules are not supported on this platform")]
    Unsupported,

    #[error("{tool} exited with {status}: {stderr}")]
    CommandFailed {
        tool: &'static str,
        status: String,
        stderr: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait FirewallManager: Send + Sync + fmt::Debug {
    async fn expose(&self, port: u16) -> Result<(), FirewallError>;
    async fn revoke(&self, port: u16) -> Result<(), FirewallError>;
}

/// Does nothing. Used when exposure is disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFirewall;

#[async_trait]
impl FirewallManager for NoopFirewall {
    async fn expose(&self, _port: u16) -> Result<(), FirewallError> {
        Ok(())
    }

    async fn revoke(&self, _port: u16) -> Result<(), FirewallError> {
        Ok(())
    }
}

/// Windows Defender Firewall through `netsh advfirewall`.
#[derive(Debug, Clone)]
pub struct NetshFirewall {
    rule_prefix: String,
}

impl NetshFirewall {
    pub fn new(rule_prefix: impl Into<String>) -> Self {
        Self {
            rule_prefix: rule_prefix.into(),
        }
    }

    #[must_use]
    pub fn rule_name(&self, port: u16) -> String {
        format!("{} ({port})", self.rule_prefix)
    }

    fn delete_args(&self, port: u16) -> Vec<String> {
        vec![
            "advfirewall".into(),
            "firewall".into(),
            "delete".into(),
            "rule".into(),
            format!("name={}", self.rule_name(port)),
        ]
    }

    fn add_args(&self, port: u16) -> Vec<String> {
        vec![
            "advfirewall".into(),
            "firewall".into(),
            "add".into(),
            "rule".into(),
            format!("name={}", self.rule_name(port)),
            "dir=in".into(),
            "action=allow".into(),
            "protocol=TCP".into(),
            format!("localport={port}"),
            "profile=private,domain".into(),
        ]
    }

    async fn netsh(args: &[String]) -> Result<(), FirewallError> {
        if !cfg!(windows) {
            return Err(FirewallError::Unsupported);
        }

        let mut command = Command::new("netsh");
        command.args(args).kill_on_drop(true);
        #[cfg(windows)]
        command.creation_flags(0x0800_0000); // CREATE_NO_WINDOW

        let output = command.output().await?;
        if output.status.success() {
            Ok(())
        } else {
            Err(FirewallError::CommandFailed {
                tool: "netsh",
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl FirewallManager for NetshFirewall {
    async fn expose(&self, port: u16) -> Result<(), FirewallError> {
        // A stale rule from a crashed run would otherwise be duplicated.
        let _ = Self::netsh(&self.delete_args(port)).await;
        Self::netsh(&self.add_args(port)).await
    }

    async fn revoke(&self, port: u16) -> Result<(), FirewallError> {
        Self::netsh(&self.delete_args(port)).await
    }
}

#[must_use]
pub fn from_config(config: &FirewallConfig) -> Arc<dyn FirewallManager> {
    if config.enabled {
        Arc::new(NetshFirewall::new(config.rule_prefix.clone()))
    } else {
        Arc::new(NoopFirewall)
    }
}
