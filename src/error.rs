use snafu::Snafu;

use crate::store::StoreError;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("Invalid parameter: {message}"))]
    Validation { message: String },

    /// The ack token does not name a live lease. Either the token is wrong or
    /// the lease it belonged to has already expired.
    #[snafu(display("Unidentified ack: {ack}"))]
    UnidentifiedAck { ack: String },

    #[snafu(display("Error returned from store"))]
    Store {
        #[snafu(source)]
        source: StoreError,
    },

    #[snafu(display("Error encoding or decoding payload"))]
    Payload {
        #[snafu(source)]
        source: serde_json::Error,
    },
}

impl From<StoreError> for Error {
    fn from(source: StoreError) -> Self {
        Self::Store { source }
    }
}

impl From<serde_json::Error> for Error {
    fn from(source: serde_json::Error) -> Self {
        Self::Payload { source }
    }
}

impl Error {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn unidentified_ack(ack: impl Into<String>) -> Self {
        Self::UnidentifiedAck { ack: ack.into() }
    }

    pub fn is_unidentified_ack(&self) -> bool {
        matches!(self, Self::UnidentifiedAck { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. })
    }
}
