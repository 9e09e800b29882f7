//! Capability strings and one-way diminishment
//!
//! A capability is an opaque token naming a file or directory object on the
//! grid. Mutable objects come in a read-write form and a read-only form; the
//! read-only key is derived from the write key by hashing, so a read-write
//! capability can be diminished locally while the reverse is impossible.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

const READKEY_TAG: &[u8] = b"allmydata_mutable_writekey_to_readkey_v1";
const KEY_LEN: usize = 16;
const BASE32_ALPHABET: &[u8; 32] = b"abcdefghijklmnopqrstuvwxyz234567";

/// (read-write prefix, read-only prefix) for every mutable cap family
const MUTABLE_PREFIXES: &[(&str, &str)] = &[
    ("URI:DIR2:", "URI:DIR2-RO:"),
    ("URI:DIR2-MDMF:", "URI:DIR2-MDMF-RO:"),
    ("URI:SSK:", "URI:SSK-RO:"),
    ("URI:MDMF:", "URI:MDMF-RO:"),
];

const IMMUTABLE_PREFIXES: &[&str] = &["URI:CHK:", "URI:LIT:", "URI:DIR2-CHK:", "URI:DIR2-LIT:"];

/// Trust level carried by a capability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// Read-write ("admin") access to a mutable object
    ReadWrite,
    /// Read-only access (diminished mutable, or immutable)
    ReadOnly,
    /// Format not recognized
    Unknown,
}

/// An opaque grid capability
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    pub fn new(cap: impl Into<String>) -> Self {
        Self(cap.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    pub fn access(&self) -> Access {
        if MUTABLE_PREFIXES.iter().any(|(rw, _)| self.0.starts_with(rw)) {
            Access::ReadWrite
        } else if MUTABLE_PREFIXES.iter().any(|(_, ro)| self.0.starts_with(ro))
            || IMMUTABLE_PREFIXES.iter().any(|p| self.0.starts_with(p))
        {
            Access::ReadOnly
        } else {
            Access::Unknown
        }
    }

    pub fn is_read_write(&self) -> bool {
        self.access() == Access::ReadWrite
    }

    pub fn is_directory(&self) -> bool {
        self.0.starts_with("URI:DIR2")
    }

    /// The trailing segment shared by both trust levels of a mutable object
    pub fn fingerprint(&self) -> Option<&str> {
        self.0.rsplit(':').next().filter(|s| !s.is_empty())
    }

    /// Convert to the read-only form.
    ///
    /// Read-only capabilities diminish to themselves. Returns `None` when the
    /// format is unknown or the write key is malformed, so callers can fall
    /// back to asking the grid for the object's `ro_uri`.
    pub fn diminish(&self) -> Option<Capability> {
        match self.access() {
            Access::ReadOnly => Some(self.clone()),
            Access::Unknown => None,
            Access::ReadWrite => {
                let (rw_prefix, ro_prefix) = MUTABLE_PREFIXES
                    .iter()
                    .find(|(rw, _)| self.0.starts_with(rw))?;
                let rest = &self.0[rw_prefix.len()..];
                let (writekey, fingerprint) = rest.split_once(':')?;
                let writekey = base32_decode(writekey)?;
                if writekey.len() != KEY_LEN {
                    return None;
                }
                let readkey = readkey_from_writekey(&writekey);
                Some(Capability(format!(
                    "{}{}:{}",
                    ro_prefix,
                    base32_encode(&readkey),
                    fingerprint
                )))
            }
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Capability {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Capability::new(s))
    }
}

impl AsRef<str> for Capability {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Capability {
    fn from(s: &str) -> Self {
        Capability::new(s)
    }
}

impl From<String> for Capability {
    fn from(s: String) -> Self {
        Capability::new(s)
    }
}

fn readkey_from_writekey(writekey: &[u8]) -> Vec<u8> {
    let mut inner = Sha256::new();
    inner.update(format!("{}:", READKEY_TAG.len()).as_bytes());
    inner.update(READKEY_TAG);
    inner.update(b",");
    inner.update(writekey);
    let first = inner.finalize();
    let second = Sha256::digest(first);
    second[..KEY_LEN].to_vec()
}

/// Lowercase, unpadded RFC 3548 base32
pub(crate) fn base32_encode(data: &[u8]) -> String {
    let mut out = String::with_capacity((data.len() * 8).div_ceil(5));
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for &byte in data {
        buffer = (buffer << 8) | u32::from(byte);
        bits += 8;
        while bits >= 5 {
            bits -= 5;
            out.push(BASE32_ALPHABET[((buffer >> bits) & 0x1f) as usize] as char);
        }
    }
    if bits > 0 {
        out.push(BASE32_ALPHABET[((buffer << (5 - bits)) & 0x1f) as usize] as char);
    }
    out
}

pub(crate) fn base32_decode(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len() * 5 / 8);
    let mut buffer: u32 = 0;
    let mut bits = 0;
    for c in text.bytes() {
        let value = BASE32_ALPHABET.iter().position(|&a| a == c)? as u32;
        buffer = (buffer << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push(((buffer >> bits) & 0xff) as u8);
        }
    }
    Some(out)
}
