//! Custom error types for the bridge.
//!
//! This module defines the primary error type, `CamError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the failure modes of a CAM session: connection
//! problems, protocol timeouts, unparseable acquisition filenames and
//! unreadable slice files.
//!
//! Every failure aborts the current pipeline step and propagates to the
//! host; nothing in this crate swallows an error. The single deliberate
//! exception is the duplicate-notification suppression inside
//! [`crate::client::CamClient::wait_for_image`], which absorbs a repeated
//! filename instead of surfacing it.

use std::time::Duration;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type CamResult<T> = std::result::Result<T, CamError>;

#[derive(Error, Debug)]
pub enum CamError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Connection to CAM server failed: {0}")]
    Connection(String),

    #[error("Not connected to CAM server")]
    NotConnected,

    #[error("Write to CAM server failed: {0}")]
    Write(String),

    #[error("No matching image notification within {0:?}")]
    Timeout(Duration),

    #[error("Filename does not match the CAM naming grammar: {0:?}")]
    MalformedFilename(String),

    #[error("Failed to read image slice '{path}': {reason}")]
    Read { path: String, reason: String },

    #[error("Missing image measurement '{0}'")]
    MissingMeasurement(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_message_names_window() {
        let err = CamError::Timeout(Duration::from_secs(400));
        assert!(err.to_string().contains("400s"));
    }

    #[test]
    fn read_error_names_path() {
        let err = CamError::Read {
            path: "/data/image--Z03--C01.ome.tif".into(),
            reason: "truncated TIFF".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("image--Z03--C01.ome.tif"));
        assert!(msg.contains("truncated TIFF"));
    }
}
