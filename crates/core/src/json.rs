//! Payload validation: well-formed JSON, bounded size (§4.7 step 1).

use crate::error::{Error, Result};
use crate::limits::MAX_PAYLOAD_SIZE;

/// Validate a document payload: must be well-formed JSON and within the
/// size bound. The size check happens before the parse so an oversized
/// payload never reaches the JSON parser.
pub fn validate_payload(payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD_SIZE {
        return Err(Error::InvalidPayload(format!(
            "payload of {} bytes exceeds max of {} bytes",
            payload.len(),
            MAX_PAYLOAD_SIZE
        )));
    }
    serde_json::from_slice::<serde_json::Value>(payload)
        .map_err(|e| Error::InvalidPayload(format!("not well-formed JSON: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_well_formed_json() {
        assert!(validate_payload(br#"{"x":1}"#).is_ok());
        assert!(validate_payload(b"[]").is_ok());
        assert!(validate_payload(b"null").is_ok());
    }

    #[test]
    fn rejects_malformed_json() {
        assert!(validate_payload(b"{not json").is_err());
    }

    #[test]
    fn rejects_oversized_payload() {
        let huge = vec![b'1'; MAX_PAYLOAD_SIZE + 1];
        match validate_payload(&huge) {
            Err(Error::InvalidPayload(_)) => {}
            other => panic!("expected InvalidPayload, got {other:?}"),
        }
    }
}
