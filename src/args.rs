use crate::error::{Error, Result};
use socks5_impl::protocol::UserKey;
use std::net::SocketAddr;
use std::path::PathBuf;

fn parse_user_key(s: &str) -> Result<UserKey> {
    let (username, password) = s
        .split_once(':')
        .ok_or_else(|| Error::from(format!("`{s}` is not of the form user:password")))?;
    if username.is_empty() {
        return Err("SOCKS5 username must not be empty".into());
    }
    Ok(UserKey::new(username, password))
}

#[derive(Debug, Clone, clap::Parser)]
#[command(author, version, about = "Transparent TLS-capable intercepting proxy.", long_about = None)]
pub struct Args {
    /// Accept transparently redirected TCP connections on this address.
    #[arg(short, long, value_name = "IP:PORT")]
    pub listen: Option<SocketAddr>,

    /// Accept SOCKS5 clients on this address.
    #[arg(long, value_name = "IP:PORT")]
    pub socks_listen: Option<SocketAddr>,

    /// Receive redirected UDP flows on this address.
    /// Requires --fixed-target for the upstream side.
    #[arg(long, value_name = "IP:PORT", requires = "fixed_target")]
    pub udp_listen: Option<SocketAddr>,

    /// Relay every accepted connection to this destination instead of
    /// reading the kernel's original-destination metadata.
    #[arg(long, value_name = "IP:PORT")]
    pub fixed_target: Option<SocketAddr>,

    /// Credentials required from SOCKS5 clients, in the form user:password.
    #[arg(long, value_name = "USER:PASS", value_parser = |s: &str| parse_user_key(s))]
    pub socks_auth: Option<UserKey>,

    /// Write relayed payloads to per-session capture files.
    #[arg(long)]
    pub write_payload: bool,

    /// Directory for payload capture files.
    #[arg(long, value_name = "dir", default_value = "mitm")]
    pub payload_dir: PathBuf,

    /// Capture file name prefix.
    #[arg(long, value_name = "prefix", default_value = "")]
    pub payload_prefix: String,

    /// Capture file name suffix.
    #[arg(long, value_name = "suffix", default_value = "smcap")]
    pub payload_suffix: String,

    /// Certificate chain (PEM) presented on intercepted TLS legs.
    #[arg(long, value_name = "file", requires = "tls_key")]
    pub tls_cert: Option<PathBuf>,

    /// Private key (PEM) matching --tls-cert.
    #[arg(long, value_name = "file", requires = "tls_cert")]
    pub tls_key: Option<PathBuf>,

    /// DNS response cache capacity.
    #[arg(long, value_name = "number", default_value = "2000")]
    pub dns_cache_size: usize,

    /// TCP idle timeout in seconds.
    #[arg(long, value_name = "seconds", default_value = "600")]
    pub tcp_timeout: u64,

    /// UDP idle timeout in seconds.
    #[arg(long, value_name = "seconds", default_value = "60")]
    pub udp_timeout: u64,

    /// Idle timeout for resolved identities in seconds.
    #[arg(long, value_name = "seconds", default_value = "600")]
    pub auth_idle_timeout: u64,

    /// Verbosity level.
    #[arg(short, long, value_name = "level", value_enum, default_value = "info")]
    pub verbosity: ArgVerbosity,

    /// Daemonize (unix only).
    #[arg(long)]
    pub daemonize: bool,

    /// Maximum number of sessions handled concurrently per acceptor.
    #[arg(long, value_name = "number", default_value = "200")]
    pub max_sessions: usize,
}

impl Default for Args {
    fn default() -> Self {
        Args {
            listen: None,
            socks_listen: None,
            udp_listen: None,
            fixed_target: None,
            socks_auth: None,
            write_payload: false,
            payload_dir: PathBuf::from("mitm"),
            payload_prefix: String::new(),
            payload_suffix: "smcap".to_string(),
            tls_cert: None,
            tls_key: None,
            dns_cache_size: 2000,
            tcp_timeout: 600,
            udp_timeout: 60,
            auth_idle_timeout: 600,
            verbosity: ArgVerbosity::Info,
            daemonize: false,
            max_sessions: 200,
        }
    }
}

impl Args {
    pub fn parse_args() -> Self {
        use clap::Parser;
        let args = Self::parse();
        if args.listen.is_none() && args.socks_listen.is_none() && args.udp_listen.is_none() {
            eprintln!("Nothing to do: at least one of '--listen', '--socks-listen', '--udp-listen' must be given.");
            std::process::exit(-1);
        }
        args
    }

    pub fn listen(&mut self, addr: SocketAddr) -> &mut Self {
        self.listen = Some(addr);
        self
    }

    pub fn socks_listen(&mut self, addr: SocketAddr) -> &mut Self {
        self.socks_listen = Some(addr);
        self
    }

    pub fn udp_listen(&mut self, addr: SocketAddr) -> &mut Self {
        self.udp_listen = Some(addr);
        self
    }

    pub fn fixed_target(&mut self, addr: SocketAddr) -> &mut Self {
        self.fixed_target = Some(addr);
        self
    }

    pub fn socks_auth(&mut self, credentials: UserKey) -> &mut Self {
        self.socks_auth = Some(credentials);
        self
    }

    pub fn write_payload(&mut self, write_payload: bool) -> &mut Self {
        self.write_payload = write_payload;
        self
    }

    pub fn verbosity(&mut self, verbosity: ArgVerbosity) -> &mut Self {
        self.verbosity = verbosity;
        self
    }
}

#[repr(C)]
#[derive(Default, Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, clap::ValueEnum)]
pub enum ArgVerbosity {
    Off = 0,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<ArgVerbosity> for log::LevelFilter {
    fn from(verbosity: ArgVerbosity) -> Self {
        match verbosity {
            ArgVerbosity::Off => log::LevelFilter::Off,
            ArgVerbosity::Error => log::LevelFilter::Error,
            ArgVerbosity::Warn => log::LevelFilter::Warn,
            ArgVerbosity::Info => log::LevelFilter::Info,
            ArgVerbosity::Debug => log::LevelFilter::Debug,
            ArgVerbosity::Trace => log::LevelFilter::Trace,
        }
    }
}

impl std::fmt::Display for ArgVerbosity {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            ArgVerbosity::Off => write!(f, "off"),
            ArgVerbosity::Error => write!(f, "error"),
            ArgVerbosity::Warn => write!(f, "warn"),
            ArgVerbosity::Info => write!(f, "info"),
            ArgVerbosity::Debug => write!(f, "debug"),
            ArgVerbosity::Trace => write!(f, "trace"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_key_parsing() {
        let key = parse_user_key("alice:s3cret").unwrap();
        assert_eq!(key, UserKey::new("alice", "s3cret"));
        assert!(parse_user_key("nopassword").is_err());
        assert!(parse_user_key(":missinguser").is_err());
    }
}
