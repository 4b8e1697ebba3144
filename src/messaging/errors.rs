// ============================================================================
// Messaging Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("broker error: {0}")]
    Broker(#[from] lapin::Error),

    #[error("exchange '{0}' is not configured in the topology")]
    ExchangeNotConfigured(String),

    #[error("connection has been closed")]
    ConnectionClosed,

    #[error("consumer connection is not initialized")]
    NotInitialized,

    #[error("event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} is not implemented")]
    Unimplemented(&'static str),
}

impl MessagingError {
    /// A passive exchange declare against a missing exchange closes the
    /// channel with a 404. During cold start this usually means the
    /// producer-side topology initializer has not run yet.
    pub fn is_exchange_not_found(&self) -> bool {
        match self {
            MessagingError::Broker(e) => {
                let message = e.to_string();
                message.contains("NOT_FOUND") || message.contains("NOT-FOUND")
            }
            _ => false,
        }
    }
}
