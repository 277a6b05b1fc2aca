use derive_more::From;

use crate::mirror::CacheError;

pub type Result<T> = core::result::Result<T, Error>;

#[derive(Debug, From)]
pub enum Error {
    #[from]
    Kube(kube::Error),

    #[from]
    Infer(kube::config::InferConfigError),

    #[from]
    HttpHeader(hyper::http::Error),

    #[from]
    Io(std::io::Error),

    #[from]
    Cache(CacheError),

    /// Custom error message
    Custom(String),
}

impl Error {
    /// Custom error from anything printable, mostly for watch-cycle failures
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::result::Result<(), core::fmt::Error> {
        write!(fmt, "{self:?}")
    }
}

impl std::error::Error for Error {}
