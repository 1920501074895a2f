//! Content-addressed identity.  An `Id` is the 160-bit digest that names
//! jobs, source files, and store entries; everything else in the crate keys
//! off of it.

use serde::de;
use std::convert::TryInto;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Width of an [`Id`] in bytes.
pub const ID_LEN: usize = 20;

/// A fixed-width content digest.  Two jobs with equal ids are
/// interchangeable, which is what makes the output store a cache.
/// Compared and hashed by value; cheap to copy.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id([u8; ID_LEN]);

/// Why a textual id failed to parse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    #[error("invalid hex character {c:?} at offset {index}")]
    NotHex { c: char, index: usize },
    #[error("id is {len} characters, want {}", ID_LEN * 2)]
    WrongLength { len: usize },
}

impl Id {
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Id {
        Id(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Parse the 40-digit hex form.  Both hex cases are accepted; output is
    /// always lowercase.
    pub fn from_hex(text: &str) -> Result<Id, ParseIdError> {
        let raw = hex::decode(text).map_err(|err| match err {
            hex::FromHexError::InvalidHexCharacter { c, index } => {
                ParseIdError::NotHex { c, index }
            }
            _ => ParseIdError::WrongLength { len: text.len() },
        })?;
        let bytes: [u8; ID_LEN] = raw
            .try_into()
            .map_err(|_| ParseIdError::WrongLength { len: text.len() })?;
        Ok(Id(bytes))
    }

    /// Relative path used by filesystem stores: the first byte as a
    /// subdirectory, then the full hex name, e.g. `ab/ab12...`.  Keeps any
    /// single directory's fan-out bounded.
    pub fn storage_path(&self) -> PathBuf {
        let hex = self.to_string();
        PathBuf::from(&hex[..2]).join(hex)
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Id({})", self)
    }
}

impl FromStr for Id {
    type Err = ParseIdError;
    fn from_str(s: &str) -> Result<Id, ParseIdError> {
        Id::from_hex(s)
    }
}

impl serde::Serialize for Id {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> serde::Deserialize<'de> for Id {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Id, D::Error> {
        struct IdVisitor;

        impl<'de> de::Visitor<'de> for IdVisitor {
            type Value = Id;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a 40 character hex id")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Id, E> {
                Id::from_hex(value).map_err(|_| {
                    de::Error::invalid_value(de::Unexpected::Str(value), &self)
                })
            }
        }

        deserializer.deserialize_str(IdVisitor)
    }
}
