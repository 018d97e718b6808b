use crate::protocol::RespValue;
use crate::storage::StorageError;
use thiserror::Error;

/// Why a command was refused. Always sent back as a RESP error; the
/// connection stays open.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CommandError {
    #[error("ERR unknown command")]
    UnknownCommand,

    /// Not an array of strings, or an empty array
    #[error("ERR invalid request, expected an array of bulk strings")]
    InvalidRequest,

    #[error("ERR wrong number of arguments for '{0}' command")]
    InvalidArguments(String),

    #[error("ERR invalid expire time in 'set' command")]
    InvalidTimeout,

    #[error("ERR {0}")]
    UnsupportedOperation(String),

    #[error("READONLY You can't write against a read only replica.")]
    ReadOnly,
}

impl From<StorageError> for CommandError {
    fn from(e: StorageError) -> Self {
        CommandError::UnsupportedOperation(e.to_string())
    }
}

impl From<CommandError> for RespValue {
    fn from(e: CommandError) -> Self {
        RespValue::error(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_messages() {
        assert_eq!(
            RespValue::from(CommandError::UnknownCommand).serialize(),
            b"-ERR unknown command\r\n"
        );
        assert_eq!(
            CommandError::InvalidArguments("get".into()).to_string(),
            "ERR wrong number of arguments for 'get' command"
        );
        assert_eq!(
            CommandError::from(StorageError::UnsupportedPattern("a*".into())).to_string(),
            "ERR pattern 'a*' is not supported, only '*' is"
        );
    }
}
