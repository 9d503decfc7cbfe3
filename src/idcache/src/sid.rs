//! Security identifiers (`S-R-A-S1-S2-...`)

use crate::error::{IdCacheError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum number of sub-authorities a SID may carry
pub const MAX_SUB_AUTHORITIES: usize = 15;

/// Identifier authorities are 48-bit values
const MAX_AUTHORITY: u64 = (1 << 48) - 1;

/// Parsed security identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Sid {
    revision: u8,
    authority: u64,
    sub_authorities: Vec<u32>,
}

impl Sid {
    /// Build a SID from its components
    pub fn new(revision: u8, authority: u64, sub_authorities: Vec<u32>) -> Result<Self> {
        if authority > MAX_AUTHORITY {
            return Err(IdCacheError::Malformed(format!(
                "SID authority {} exceeds 48 bits",
                authority
            )));
        }
        if sub_authorities.len() > MAX_SUB_AUTHORITIES {
            return Err(IdCacheError::Malformed(format!(
                "SID has {} sub-authorities (max {})",
                sub_authorities.len(),
                MAX_SUB_AUTHORITIES
            )));
        }
        Ok(Self {
            revision,
            authority,
            sub_authorities,
        })
    }

    /// Revision-1 SID with a small authority, for well-known constants
    pub(crate) fn well_known(authority: u8, sub_authorities: &[u32]) -> Self {
        Self {
            revision: 1,
            authority: authority as u64,
            sub_authorities: sub_authorities
                .iter()
                .copied()
                .take(MAX_SUB_AUTHORITIES)
                .collect(),
        }
    }

    pub fn revision(&self) -> u8 {
        self.revision
    }

    pub fn authority(&self) -> u64 {
        self.authority
    }

    pub fn sub_authorities(&self) -> &[u32] {
        &self.sub_authorities
    }

    /// Relative identifier (last sub-authority)
    pub fn rid(&self) -> Option<u32> {
        self.sub_authorities.last().copied()
    }

    /// Whether `prefix` names this SID or one of its ancestors
    ///
    /// `S-1-5-32` is a prefix of `S-1-5-32-544`; `S-1-5-3` is not.
    pub fn starts_with(&self, prefix: &Sid) -> bool {
        self.revision == prefix.revision
            && self.authority == prefix.authority
            && self.sub_authorities.starts_with(&prefix.sub_authorities)
    }

    /// Binary encoding: revision, count, 48-bit big-endian authority,
    /// little-endian sub-authorities
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(8 + 4 * self.sub_authorities.len());
        bytes.push(self.revision);
        bytes.push(self.sub_authorities.len() as u8);
        bytes.extend_from_slice(&self.authority.to_be_bytes()[2..]);
        for sub in &self.sub_authorities {
            bytes.extend_from_slice(&sub.to_le_bytes());
        }
        bytes
    }

    /// Decode the binary form produced by [`Sid::to_bytes`]
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(IdCacheError::Malformed("SID shorter than 8 bytes".to_string()));
        }
        let count = bytes[1] as usize;
        if bytes.len() != 8 + 4 * count {
            return Err(IdCacheError::Malformed(format!(
                "SID length {} does not match {} sub-authorities",
                bytes.len(),
                count
            )));
        }

        let mut authority = [0u8; 8];
        authority[2..].copy_from_slice(&bytes[2..8]);

        let sub_authorities = bytes[8..]
            .chunks_exact(4)
            .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
            .collect();

        Self::new(bytes[0], u64::from_be_bytes(authority), sub_authorities)
    }
}

impl FromStr for Sid {
    type Err = IdCacheError;

    fn from_str(s: &str) -> Result<Self> {
        let malformed = || IdCacheError::Malformed(format!("invalid SID '{}'", s));

        let mut parts = s.trim().split('-');
        match parts.next() {
            Some(prefix) if prefix.eq_ignore_ascii_case("S") => {}
            _ => return Err(malformed()),
        }

        let revision = parts
            .next()
            .and_then(|p| p.parse::<u8>().ok())
            .ok_or_else(malformed)?;

        let authority = parts.next().ok_or_else(malformed)?;
        let authority = match authority.strip_prefix("0x").or_else(|| authority.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => authority.parse::<u64>(),
        }
        .map_err(|_| malformed())?;

        let sub_authorities = parts
            .map(|p| p.parse::<u32>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| malformed())?;

        Self::new(revision, authority, sub_authorities)
    }
}

impl fmt::Display for Sid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "S-{}-", self.revision)?;
        if self.authority > u32::MAX as u64 {
            write!(f, "0x{:012X}", self.authority)?;
        } else {
            write!(f, "{}", self.authority)?;
        }
        for sub in &self.sub_authorities {
            write!(f, "-{}", sub)?;
        }
        Ok(())
    }
}

impl TryFrom<String> for Sid {
    type Error = IdCacheError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<Sid> for String {
    fn from(sid: Sid) -> Self {
        sid.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_domain_sid() {
        let sid: Sid = "S-1-5-21-3623811015-3361044348-30300820-1013".parse().unwrap();

        assert_eq!(sid.revision(), 1);
        assert_eq!(sid.authority(), 5);
        assert_eq!(sid.sub_authorities().len(), 5);
        assert_eq!(sid.rid(), Some(1013));
        assert_eq!(sid.to_string(), "S-1-5-21-3623811015-3361044348-30300820-1013");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<Sid>().is_err());
        assert!("X-1-5-32".parse::<Sid>().is_err());
        assert!("S-1-five-32".parse::<Sid>().is_err());
        assert!("S-1".parse::<Sid>().is_err());
        assert!("S-1-5-1-2-3-4-5-6-7-8-9-10-11-12-13-14-15-16".parse::<Sid>().is_err());
    }

    #[test]
    fn test_prefix_matching() {
        let builtin: Sid = "S-1-5-32".parse().unwrap();
        let admins: Sid = "S-1-5-32-544".parse().unwrap();
        let other: Sid = "S-1-5-3".parse().unwrap();

        assert!(admins.starts_with(&builtin));
        assert!(!admins.starts_with(&other));
        assert!(!builtin.starts_with(&admins));
    }

    #[test]
    fn test_binary_form() {
        let sid: Sid = "S-1-1-0".parse().unwrap();
        let bytes = sid.to_bytes();

        assert_eq!(bytes, vec![1, 1, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0]);
        assert_eq!(Sid::from_bytes(&bytes).unwrap(), sid);
        assert!(Sid::from_bytes(&bytes[..10]).is_err());
    }
}
