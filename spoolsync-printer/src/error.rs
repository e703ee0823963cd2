//! Error types for the printer link.

use thiserror::Error;

/// Errors raised by the printer client and its builders.
#[derive(Error, Debug)]
pub enum PrinterError {
    /// No live session with the device.
    #[error("printer {0} is not connected")]
    NotConnected(String),

    /// A command argument is outside the range the device accepts.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A calibration read is already waiting for its answer.
    #[error("a calibration read is already pending")]
    CalibrationBusy,

    /// The MQTT client refused the request (channel full or closed).
    #[error("MQTT client error: {0}")]
    Mqtt(#[from] rumqttc::ClientError),

    /// Payload could not be encoded or decoded.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration is incomplete or inconsistent.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type for printer operations.
pub type Result<T> = std::result::Result<T, PrinterError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(bytes)?)
    }

    #[test]
    fn json_failures_convert_with_question_mark() {
        let err = decode(b"{oops").unwrap_err();
        assert!(matches!(err, PrinterError::Json(_)));
        assert!(err.to_string().starts_with("JSON error"));
    }

    #[test]
    fn messages_name_the_device() {
        let err = PrinterError::NotConnected("01P00A1".into());
        assert_eq!(err.to_string(), "printer 01P00A1 is not connected");
    }
}
