#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("std::io::Error {0:?}")]
    Io(#[from] std::io::Error),

    #[error("std::net::AddrParseError {0:?}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("rustls::Error {0:?}")]
    Rustls(#[from] tokio_rustls::rustls::Error),

    #[error("socks5_impl::Error {0:?}")]
    Socks5Impl(#[from] socks5_impl::Error),

    #[error("{0}")]
    String(String),
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Self::String(err.to_string())
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Self::String(err)
    }
}

impl From<&String> for Error {
    fn from(err: &String) -> Self {
        Self::String(err.to_string())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;
