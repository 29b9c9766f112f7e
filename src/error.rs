use thiserror::Error;

/// Failures opening or using the serial link.
#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("Failed to open {device}: {reason}")]
    Open { device: String, reason: String },

    #[error("No valid connection")]
    NotConnected,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serialport::Error> for ConnectionError {
    fn from(e: serialport::Error) -> Self {
        ConnectionError::Io(e.into())
    }
}

#[derive(Error, Debug)]
pub enum HistoryError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
