// Commands are the only thing the replicated log carries for the
// user keyspace. Writes go through consensus as encoded Commands,
// reads never do.
use serde::{Deserialize, Serialize};

use crate::error::SerializationError;
use crate::utils::codec;

#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum Operation {
    Set,
    Delete,
}

#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct Command {
    pub operation: Operation,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl Command {
    pub fn set(key: &[u8], value: &[u8]) -> Command {
        Command {
            operation: Operation::Set,
            key: key.to_vec(),
            value: value.to_vec(),
        }
    }

    pub fn delete(key: &[u8]) -> Command {
        Command {
            operation: Operation::Delete,
            key: key.to_vec(),
            value: Vec::new(),
        }
    }

    /// Empty keys are never accepted and a delete never carries a value.
    pub fn validate(&self) -> Result<(), SerializationError> {
        if self.key.is_empty() {
            return Err(SerializationError::InvalidCommand("empty key".into()));
        }
        if self.operation == Operation::Delete && !self.value.is_empty() {
            return Err(SerializationError::InvalidCommand(
                "delete must not carry a value".into(),
            ));
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, SerializationError> {
        codec::encode(self)
    }

    /// Decodes and validates a log payload.
    pub fn decode(bytes: &[u8]) -> Result<Command, SerializationError> {
        let command: Command = codec::decode(bytes)?;
        command.validate()?;
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_validates() {
        let cmd = Command::set(b"k", b"v");
        let bytes = cmd.encode().unwrap();
        assert_eq!(Command::decode(&bytes).unwrap(), cmd);

        let bad = Command {
            operation: Operation::Delete,
            key: b"k".to_vec(),
            value: b"oops".to_vec(),
        };
        let bytes = codec::encode(&bad).unwrap();
        assert!(matches!(
            Command::decode(&bytes),
            Err(SerializationError::InvalidCommand(_))
        ));
    }

    #[test]
    fn empty_key_rejected() {
        assert!(Command::set(b"", b"v").validate().is_err());
        assert!(Command::delete(b"").validate().is_err());
        assert!(Command::delete(b"k").validate().is_ok());
    }

    #[test]
    fn unknown_operation_does_not_decode() {
        #[derive(Serialize)]
        struct Foreign {
            operation: &'static str,
            key: Vec<u8>,
            value: Vec<u8>,
        }
        let bytes = codec::encode(&Foreign {
            operation: "Increment",
            key: b"k".to_vec(),
            value: vec![],
        })
        .unwrap();
        assert!(Command::decode(&bytes).is_err());
        assert!(Command::decode(b"\x00\x01garbage").is_err());
    }
}
