//! Centralized PPC command set.
//!
//! Parent and children share this one closed enumeration; there is no
//! dynamic opcode allocation.

use std::fmt;

use crate::types::Error;

/// PPC opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Opcode {
    /// No operation, acknowledged with an empty `ResponseOk`.
    Nop = 1,
    /// Ask the parent to spawn a sibling worker for the caller's backend.
    ForkChild = 2,
    /// Successful response.
    ResponseOk = 3,
    /// Failed response, payload is a UTF-8 message.
    ResponseError = 4,
    /// Append a pre-rendered line to the centralized log.
    LogAppend = 5,
}

impl Opcode {
    /// All opcodes, in wire order.
    pub const ALL: [Opcode; 5] = [
        Opcode::Nop,
        Opcode::ForkChild,
        Opcode::ResponseOk,
        Opcode::ResponseError,
        Opcode::LogAppend,
    ];

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Responses travel parent→child and are never dispatched.
    pub fn is_response(self) -> bool {
        matches!(self, Opcode::ResponseOk | Opcode::ResponseError)
    }
}

impl TryFrom<u8> for Opcode {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Opcode::ALL
            .into_iter()
            .find(|op| op.as_u8() == value)
            .ok_or(Error::UnknownCommand(value))
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Nop => "nop",
            Opcode::ForkChild => "fork-child",
            Opcode::ResponseOk => "response-ok",
            Opcode::ResponseError => "response-error",
            Opcode::LogAppend => "log-append",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_opcode_maps_back_from_its_byte() {
        for op in Opcode::ALL {
            assert_eq!(Opcode::try_from(op.as_u8()).unwrap(), op);
        }
    }

    #[test]
    fn bytes_outside_the_set_are_unknown() {
        for byte in [0u8, 6, 0x7F, 0xFF] {
            assert!(matches!(Opcode::try_from(byte), Err(Error::UnknownCommand(b)) if b == byte));
        }
    }

    #[test]
    fn only_responses_are_responses() {
        let responses: Vec<_> = Opcode::ALL.into_iter().filter(|op| op.is_response()).collect();
        assert_eq!(responses, vec![Opcode::ResponseOk, Opcode::ResponseError]);
    }
}
