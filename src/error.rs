use thiserror::Error;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("configuration file not found: {0}")]
    ConfigNotFound(String),

    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] ini::Error),

    #[error("invalid configuration in [{section}]: {reason}")]
    ConfigValidation { section: String, reason: String },

    #[error("SSH connection to {0} failed: {1}")]
    SshConnect(String, String),

    #[error("SSH authentication for {0} failed: {1}")]
    SshAuth(String, String),

    #[error("no session available for server {0}")]
    SessionUnavailable(String),

    #[error("unknown server {0}")]
    UnknownServer(String),

    #[error("failed to bind listener on {0}: {1}")]
    ListenerBind(String, String),

    #[error("SOCKS5 protocol error: {0}")]
    Socks5Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, TunnelError>;
