//! Newline-delimited JSON framing.
//!
//! One JSON object per line. Embedded newlines inside string values are
//! escaped by JSON itself, so splitting on `\n` is a complete framing rule.

use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty frame")]
    EmptyFrame,

    #[error("invalid frame: {0}")]
    Invalid(#[from] serde_json::Error),
}

/// Serialize one frame, including the trailing newline.
pub fn encode<T: Serialize>(value: &T) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(value)?;
    line.push('\n');
    Ok(line)
}

/// Parse one frame from a single line. Surrounding whitespace is ignored.
pub fn decode<T: DeserializeOwned>(line: &str) -> Result<T, CodecError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(CodecError::EmptyFrame);
    }
    Ok(serde_json::from_str(trimmed)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{BridgeCommand, BridgeEvent};

    #[test]
    fn test_encode_appends_newline() {
        let line = encode(&BridgeCommand::Shutdown).unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
    }

    #[test]
    fn test_round_trip() {
        let cmd = BridgeCommand::Exec {
            command: "echo 'two\nlines'".to_string(),
            timeout_ms: Some(5_000),
        };
        let line = encode(&cmd).unwrap();
        // The embedded newline must be escaped, keeping one frame per line.
        assert_eq!(line.matches('\n').count(), 1);

        let parsed: BridgeCommand = decode(&line).unwrap();
        let reencoded = encode(&parsed).unwrap();
        assert_eq!(line, reencoded);
    }

    #[test]
    fn test_decode_trims_whitespace() {
        let ev: BridgeEvent = decode("  {\"ev\":\"ready\"}  \r\n").unwrap();
        assert!(matches!(ev, BridgeEvent::Ready));
    }

    #[test]
    fn test_decode_empty_line() {
        let err = decode::<BridgeEvent>("   \n").unwrap_err();
        assert!(matches!(err, CodecError::EmptyFrame));
    }

    #[test]
    fn test_decode_garbage() {
        let err = decode::<BridgeEvent>("not json").unwrap_err();
        assert!(matches!(err, CodecError::Invalid(_)));
    }
}
