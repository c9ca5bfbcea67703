use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifierError {
    #[error("failed to build heartbeat client: {0}")]
    Client(String),
    #[error("heartbeat request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Outbound "still alive" call made after each successful probe.
pub trait LivenessNotifier {
    fn notify(&self) -> Result<(), NotifierError>;
}

impl<N: LivenessNotifier + ?Sized> LivenessNotifier for Box<N> {
    fn notify(&self) -> Result<(), NotifierError> {
        (**self).notify()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledNotifier;

impl LivenessNotifier for DisabledNotifier {
    fn notify(&self) -> Result<(), NotifierError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct HttpLivenessNotifier {
    client: reqwest::blocking::Client,
    url: String,
}

impl HttpLivenessNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, NotifierError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| NotifierError::Client(error.to_string()))?;

        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

impl LivenessNotifier for HttpLivenessNotifier {
    /// Connection failures and non-success statuses both come back as
    /// `NotifierError::Request`.
    fn notify(&self) -> Result<(), NotifierError> {
        self.client.get(&self.url).send()?.error_for_status()?;
        tracing::debug!(url = %self.url, "heartbeat delivered");
        Ok(())
    }
}
