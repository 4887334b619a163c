use std::fmt;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::error::SessionError;

fn default_port() -> u16 {
    22
}

fn default_path() -> String {
    "/".to_string()
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AuthKind {
    #[default]
    Password,
    Keyfile,
}

#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    None,
    Http,
    Socks4,
    Socks5,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProxySettings {
    #[serde(default)]
    pub kind: ProxyKind,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

impl ProxySettings {
    pub fn is_enabled(&self) -> bool {
        self.kind != ProxyKind::None && !self.host.trim().is_empty()
    }
}

/// Everything needed to reach one remote host. Cloned into each component;
/// never mutated by them.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescriptor {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub auth: AuthKind,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub private_key_path: String,
    #[serde(default)]
    pub key_passphrase: String,
    #[serde(default)]
    pub proxy: ProxySettings,
    #[serde(default)]
    pub jump_host: Option<Box<SessionDescriptor>>,
    #[serde(default = "default_path")]
    pub default_path: String,
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
    #[serde(default)]
    pub probe_checksum: Option<String>,
}

impl Default for SessionDescriptor {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
            username: String::new(),
            auth: AuthKind::Password,
            password: String::new(),
            private_key_path: String::new(),
            key_passphrase: String::new(),
            proxy: ProxySettings::default(),
            jump_host: None,
            default_path: default_path(),
            host_key_fingerprint: None,
            probe_checksum: None,
        }
    }
}

// Secrets stay out of logs.
impl fmt::Debug for SessionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionDescriptor")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("auth", &self.auth)
            .field("proxy", &self.proxy.kind)
            .field("jump_host", &self.jump_host.as_ref().map(|j| j.address()))
            .field("default_path", &self.default_path)
            .finish_non_exhaustive()
    }
}

impl SessionDescriptor {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host.trim(), self.port)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        if self.host.trim().is_empty() {
            return Err(SessionError::MissingField("host"));
        }
        if self.username.trim().is_empty() {
            return Err(SessionError::MissingField("username"));
        }
        if self.auth == AuthKind::Keyfile && self.private_key_path.trim().is_empty() {
            return Err(SessionError::MissingField("private_key_path"));
        }
        if let Some(jump) = &self.jump_host {
            jump.validate()?;
        }
        Ok(())
    }

    pub fn is_root(&self) -> bool {
        self.username.trim() == "root"
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read session file {}", path.display()))?;
        let desc: SessionDescriptor = toml::from_str(&text)
            .with_context(|| format!("Invalid session file {}", path.display()))?;
        Ok(desc)
    }

    /// Rewrites the session file, e.g. after the user accepts a new identity.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Failed to serialize session")?;
        let tmp = path.with_extension("toml.tmp");
        fs::write(&tmp, text).with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(err) = fs::rename(&tmp, path) {
            let _ = fs::remove_file(&tmp);
            return Err(err).with_context(|| format!("Failed to replace {}", path.display()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_session_file_fills_defaults() {
        let desc: SessionDescriptor = toml::from_str(
            r#"
host = "example.org"
username = "deploy"
password = "pw"
"#,
        )
        .unwrap();
        assert_eq!(desc.port, 22);
        assert_eq!(desc.auth, AuthKind::Password);
        assert_eq!(desc.default_path, "/");
        assert!(!desc.proxy.is_enabled());
        assert!(desc.jump_host.is_none());
    }

    #[test]
    fn nested_jump_host_and_proxy_parse() {
        let desc: SessionDescriptor = toml::from_str(
            r#"
host = "10.0.0.5"
username = "app"
auth = "keyfile"
private_key_path = "/home/me/.ssh/id_ed25519"

[proxy]
kind = "socks5"
host = "proxy.local"
port = 1080

[jump_host]
host = "bastion.example.org"
port = 2222
username = "jump"
password = "secret"
"#,
        )
        .unwrap();
        assert_eq!(desc.proxy.kind, ProxyKind::Socks5);
        assert!(desc.proxy.is_enabled());
        let jump = desc.jump_host.as_ref().unwrap();
        assert_eq!(jump.address(), "bastion.example.org:2222");
        assert!(desc.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_host_and_key() {
        let mut desc = SessionDescriptor {
            username: "u".into(),
            ..Default::default()
        };
        assert!(matches!(
            desc.validate(),
            Err(SessionError::MissingField("host"))
        ));
        desc.host = "h".into();
        desc.auth = AuthKind::Keyfile;
        assert!(matches!(
            desc.validate(),
            Err(SessionError::MissingField("private_key_path"))
        ));
    }

    #[test]
    fn recorded_identity_survives_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.toml");
        let desc = SessionDescriptor {
            host: "h".into(),
            username: "u".into(),
            host_key_fingerprint: Some("SHA256:abc".into()),
            probe_checksum: Some("0123".into()),
            ..Default::default()
        };
        desc.save_to(&path).unwrap();
        let loaded = SessionDescriptor::load_from(&path).unwrap();
        assert_eq!(loaded.host_key_fingerprint.as_deref(), Some("SHA256:abc"));
        assert_eq!(loaded.probe_checksum.as_deref(), Some("0123"));
        assert!(!dir.path().join("session.toml.tmp").exists());
    }

    #[test]
    fn debug_output_hides_secrets() {
        let desc = SessionDescriptor {
            host: "h".into(),
            username: "u".into(),
            password: "hunter2".into(),
            ..Default::default()
        };
        assert!(!format!("{desc:?}").contains("hunter2"));
    }
}
