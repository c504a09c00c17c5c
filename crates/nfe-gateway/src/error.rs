use thiserror::Error;

/// Failure taxonomy of a portal fetch. The poll scheduler keys its state
/// transitions off the variant, never off the message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    #[error("transient portal failure: {0}")]
    Transient(String),
    #[error("portal rate limited the request: {0}")]
    RateLimited(String),
    #[error("permanent portal failure: {0}")]
    Permanent(String),
}

impl GatewayError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::RateLimited(_) => "rate_limited",
            Self::Permanent(_) => "permanent",
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Permanent(_))
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Transient(d) | Self::RateLimited(d) | Self::Permanent(d) => d,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NotifyError {
    #[error("transient delivery failure: {0}")]
    Transient(String),
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
}

impl NotifyError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Transient(_) => "transient",
            Self::Permanent(_) => "permanent",
        }
    }

    pub fn detail(&self) -> &str {
        match self {
            Self::Transient(d) | Self::Permanent(d) => d,
        }
    }
}
