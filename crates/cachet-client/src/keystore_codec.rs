//! CBOR encoding for records stored in the key store.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::ClientError;

/// Encode a record value.
pub(crate) fn encode<T: Serialize>(value: &T) -> Vec<u8> {
    let mut out = Vec::new();
    let Ok(()) = ciborium::into_writer(value, &mut out) else {
        unreachable!("encoding to a Vec cannot fail");
    };
    out
}

/// Decode a record value.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, ClientError> {
    ciborium::from_reader(bytes).map_err(|e| ClientError::Storage(e.to_string()))
}
