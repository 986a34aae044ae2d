//! Existence checks against the external tax registry.
//!
//! A [`RegistryGateway`] answers a single question for a single identifier
//! within a caller supplied deadline. It never retries: deciding whether an
//! unavailable registry deserves another attempt is up to the caller.

pub mod http;
pub mod instrumented;

pub use self::{http::HttpRegistryGateway, instrumented::InstrumentedGateway};
use {
    crate::identifier::Identifier,
    serde::Serialize,
    std::time::Duration,
};

/// Why the registry could not give a definitive answer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, thiserror::Error)]
#[serde(rename_all = "kebab-case")]
pub enum UnavailableCause {
    #[error("registry did not answer before the deadline")]
    Timeout,
    #[error("registry could not be reached")]
    TransportError,
    #[error("registry answered with an unrecognized response")]
    MalformedResponse,
}

impl UnavailableCause {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::TransportError => "transport-error",
            Self::MalformedResponse => "malformed-response",
        }
    }
}

/// Outcome of one registry call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RegistryResult {
    /// The registry knows the identifier. `name` is the registered taxpayer
    /// name if the registry reported one.
    Found { name: Option<String> },
    /// The registry affirmatively says the identifier does not exist.
    NotFound,
    /// No definitive answer could be obtained.
    Unavailable(UnavailableCause),
}

impl RegistryResult {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Found { .. } => "found",
            Self::NotFound => "not_found",
            Self::Unavailable(cause) => match cause {
                UnavailableCause::Timeout => "timeout",
                UnavailableCause::TransportError => "transport_error",
                UnavailableCause::MalformedResponse => "malformed_response",
            },
        }
    }
}

#[cfg_attr(any(test, feature = "test-util"), mockall::automock)]
#[async_trait::async_trait]
pub trait RegistryGateway: Send + Sync {
    /// Issues exactly one request asking whether `identifier` exists. If no
    /// answer arrives within `deadline` the request is dropped and
    /// `Unavailable(Timeout)` is returned.
    async fn check(&self, identifier: Identifier, deadline: Duration) -> RegistryResult;
}
