//! Request-level error types.

use worker::Response;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures that abort a request.
///
/// Everything local to one pool or one probe is recovered where it happens
/// and never shows up here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no credential configured")]
    CredentialMissing,
    #[error("credential derivation failed: {0}")]
    Derivation(String),
    #[error("upstream proxy failed: {0}")]
    UpstreamProxy(String),
    #[error("worker: {0}")]
    Worker(#[from] worker::Error),
}

impl Error {
    pub fn status_code(&self) -> u16 {
        match self {
            Error::CredentialMissing => 401,
            Error::Derivation(_) | Error::UpstreamProxy(_) | Error::Worker(_) => 500,
        }
    }

    /// Fixed body shown to the client. Internal details stay in the log.
    pub fn public_message(&self) -> &'static str {
        match self {
            Error::CredentialMissing => "Please set the UUID variable",
            Error::Derivation(_) => "Dynamic ID generation failed",
            Error::UpstreamProxy(_) => "Proxy request failed",
            Error::Worker(_) => "Internal server error",
        }
    }

    pub fn into_response(self) -> worker::Result<Response> {
        Response::error(self.public_message(), self.status_code())
    }
}
