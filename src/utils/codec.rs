// MessagePack helpers shared by the log, the state machine and
// the command payloads. Named encoding keeps field order stable.

use serde::{de::DeserializeOwned, Serialize};

use crate::error::SerializationError;

pub fn encode<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, SerializationError> {
    Ok(rmp_serde::to_vec_named(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SerializationError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn garbage_is_a_decode_error() {
        let res: Result<Vec<(Vec<u8>, Vec<u8>)>, _> = decode(&[0xc1, 0xff, 0x00]);
        assert!(matches!(res, Err(SerializationError::Decode(_))));
    }

    #[test]
    fn same_value_same_bytes() {
        let pairs = vec![(b"a".to_vec(), b"1".to_vec()), (b"b".to_vec(), b"2".to_vec())];
        assert_eq!(encode(&pairs).unwrap(), encode(&pairs.clone()).unwrap());
    }
}
