// ABOUTME: Validated user-name newtype enforcing the hub's identity rules
// ABOUTME: Names are the only handle a user has, so validation happens once at the boundary

use std::fmt;
use std::str;
use thiserror::Error;

/// Minimum accepted name length in bytes.
pub const MIN_NAME_LEN: usize = 3;
/// Maximum accepted name length in bytes.
pub const MAX_NAME_LEN: usize = 31;

/// Reserved source name used only in hub-originated frames.
pub const SYSTEM_NAME: &str = "SYSTEM";
/// Reserved destination token addressing every active user.
pub const BROADCAST_DEST: &str = "ALL";

/// A validated chat user name.
///
/// Names are 3-31 bytes, start with an ASCII letter, and continue with ASCII
/// letters, digits, or `_`. They are case-sensitive. `SYSTEM` and `ALL` are
/// reserved by the protocol and can never be registered.
///
/// Validation happens exactly once, at construction; every other layer can
/// treat a `UserName` as well-formed (in particular, it is always safe to
/// embed in a frame field or a per-client pipe path).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct UserName(String);

impl UserName {
    /// Validate a raw byte slice as a user name.
    pub fn parse(raw: &[u8]) -> Result<Self, NameError> {
        if raw.len() < MIN_NAME_LEN {
            return Err(NameError::TooShort { len: raw.len() });
        }
        if raw.len() > MAX_NAME_LEN {
            return Err(NameError::TooLong { len: raw.len() });
        }
        if !raw[0].is_ascii_alphabetic() {
            return Err(NameError::InvalidStart { byte: raw[0] });
        }
        for &b in &raw[1..] {
            if !b.is_ascii_alphanumeric() && b != b'_' {
                return Err(NameError::InvalidByte { byte: b });
            }
        }
        // The charset above is pure ASCII, so this cannot fail.
        let name = str::from_utf8(raw).expect("validated ASCII").to_owned();
        if name == SYSTEM_NAME || name == BROADCAST_DEST {
            return Err(NameError::Reserved { name });
        }
        Ok(UserName(name))
    }

    /// Validate a string slice as a user name.
    pub fn parse_str(raw: &str) -> Result<Self, NameError> {
        Self::parse(raw.as_bytes())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl fmt::Display for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for UserName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "UserName({:?})", self.0)
    }
}

impl AsRef<str> for UserName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for UserName {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for UserName {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// Why a candidate name was refused.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NameError {
    #[error("name too short: {len} bytes (minimum {MIN_NAME_LEN})")]
    TooShort { len: usize },

    #[error("name too long: {len} bytes (maximum {MAX_NAME_LEN})")]
    TooLong { len: usize },

    #[error("name must start with a letter, got byte {byte:#04x}")]
    InvalidStart { byte: u8 },

    #[error("name may only contain letters, digits and '_', got byte {byte:#04x}")]
    InvalidByte { byte: u8 },

    #[error("name {name:?} is reserved")]
    Reserved { name: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_valid_names() {
        for name in ["bob", "alice", "User_42", "X_1", "a".repeat(31).as_str()] {
            assert!(UserName::parse_str(name).is_ok(), "rejected {name:?}");
        }
    }

    #[test]
    fn length_boundaries() {
        assert!(UserName::parse_str("abc").is_ok());
        assert!(UserName::parse(b"a".repeat(31).as_slice()).is_ok());
        assert!(matches!(
            UserName::parse_str("ab"),
            Err(NameError::TooShort { len: 2 })
        ));
        assert!(matches!(
            UserName::parse(b"a".repeat(32).as_slice()),
            Err(NameError::TooLong { len: 32 })
        ));
    }

    #[test]
    fn first_byte_must_be_alphabetic() {
        assert!(matches!(
            UserName::parse_str("1abc"),
            Err(NameError::InvalidStart { byte: b'1' })
        ));
        assert!(matches!(
            UserName::parse_str("_abc"),
            Err(NameError::InvalidStart { byte: b'_' })
        ));
    }

    #[test]
    fn rejects_invalid_bytes() {
        assert!(matches!(
            UserName::parse_str("ali ce"),
            Err(NameError::InvalidByte { byte: b' ' })
        ));
        assert!(matches!(
            UserName::parse_str("ali|ce"),
            Err(NameError::InvalidByte { byte: b'|' })
        ));
        assert!(UserName::parse(b"al\xffce").is_err());
    }

    #[test]
    fn rejects_reserved_names() {
        assert!(matches!(
            UserName::parse_str("SYSTEM"),
            Err(NameError::Reserved { .. })
        ));
        assert!(matches!(
            UserName::parse_str("ALL"),
            Err(NameError::Reserved { .. })
        ));
        // Reservation is case-sensitive, like the names themselves.
        assert!(UserName::parse_str("System").is_ok());
        assert!(UserName::parse_str("all").is_ok());
    }
}
