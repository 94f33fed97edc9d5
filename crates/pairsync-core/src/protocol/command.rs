//! Command bytes the client sends to drive the server.

/// What the server should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// `'s'`: the server sends its unsent files
    Send,
    /// `'r'`: the server receives the client's files
    Receive,
}

impl Command {
    pub fn as_byte(self) -> u8 {
        match self {
            Self::Send => b's',
            Self::Receive => b'r',
        }
    }

    /// Parse a command byte. Returns `None` for anything unknown.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b's' => Some(Self::Send),
            b'r' => Some(Self::Receive),
            _ => None,
        }
    }
}
