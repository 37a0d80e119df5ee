//! CBOR encoding for wire messages and journal records.

use crate::error::{ProtocolError, ProtocolResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Encodes any serializable value as CBOR.
///
/// # Errors
///
/// Returns [`ProtocolError::Encode`] if serialization fails.
pub fn to_cbor<T: Serialize + ?Sized>(value: &T) -> ProtocolResult<Vec<u8>> {
    let mut out = Vec::new();
    ciborium::into_writer(value, &mut out).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(out)
}

/// Decodes a value from CBOR.
///
/// # Errors
///
/// Returns [`ProtocolError::Decode`] on malformed input.
pub fn from_cbor<T: DeserializeOwned>(bytes: &[u8]) -> ProtocolResult<T> {
    ciborium::from_reader(bytes).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Values that can be written to the wire.
pub trait Encode {
    /// Encodes to CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    fn encode(&self) -> ProtocolResult<Vec<u8>>;
}

/// Values that can be read from the wire.
pub trait Decode: Sized {
    /// Decodes from CBOR.
    ///
    /// # Errors
    ///
    /// Returns an error on malformed input.
    fn decode(bytes: &[u8]) -> ProtocolResult<Self>;
}

impl<T: Serialize> Encode for T {
    fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }
}

impl<T: DeserializeOwned> Decode for T {
    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::OpValue;

    #[test]
    fn garbage_is_a_decode_error() {
        let err = OpValue::decode(&[0xff, 0x00]).unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));
    }

    #[test]
    fn encoding_is_deterministic() {
        let mut record = crate::value::Record::new();
        record.insert("b".into(), OpValue::Integer(2));
        record.insert("a".into(), OpValue::Decimal(1.5));
        let value = OpValue::Record(record);
        assert_eq!(value.encode().unwrap(), value.clone().encode().unwrap());
        assert_eq!(OpValue::decode(&value.encode().unwrap()).unwrap(), value);
    }
}
