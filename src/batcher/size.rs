use serde::Serialize;
use std::io;

/// Size assumed for a payload that cannot be serialized.
pub const DEFAULT_MESSAGE_SIZE: usize = 1024;

/// Counts bytes without keeping them.
#[derive(Default)]
struct ByteCounter(usize);

impl io::Write for ByteCounter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0 += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Encoded JSON length of `payload`, or `DEFAULT_MESSAGE_SIZE` if it does not serialize.
pub fn estimate_payload_size<P: Serialize + ?Sized>(payload: &P) -> usize {
    let mut counter = ByteCounter::default();
    match serde_json::to_writer(&mut counter, payload) {
        Ok(()) => counter.0,
        Err(e) => {
            tracing::debug!("Payload size estimation fell back to default: {e}");
            DEFAULT_MESSAGE_SIZE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serializer;
    use serde_json::json;
    use std::collections::HashMap;

    struct Unserializable;

    impl Serialize for Unserializable {
        fn serialize<S: Serializer>(&self, _serializer: S) -> Result<S::Ok, S::Error> {
            Err(serde::ser::Error::custom("opaque handle"))
        }
    }

    #[test]
    fn test_size_matches_encoded_length() {
        let payload = json!({ "symbol": "ACME", "price": 101.25 });
        let encoded = serde_json::to_vec(&payload).unwrap();
        assert_eq!(estimate_payload_size(&payload), encoded.len());
        assert_eq!(estimate_payload_size("x".repeat(198).as_str()), 200);
    }

    #[test]
    fn test_unserializable_payload_uses_fallback() {
        assert_eq!(estimate_payload_size(&Unserializable), DEFAULT_MESSAGE_SIZE);
    }

    #[test]
    fn test_non_string_map_keys_use_fallback() {
        let mut payload = HashMap::new();
        payload.insert((1, 2), "pair");
        assert_eq!(estimate_payload_size(&payload), DEFAULT_MESSAGE_SIZE);
    }
}
