//! Core key and classification types

use crate::error::{IdCacheError, Result};
use crate::sid::Sid;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Kerberos principals and X.509 DNs kept per record (and indexed) at most
pub const MAX_REPEATABLE_KEYS: usize = 8;

/// Key space a principal can be looked up by
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyType {
    /// Numeric id of a user or computer
    Uid,
    /// Numeric id of a group or computer group
    Gid,
    /// Global unique id
    Guid,
    /// Security id
    Sid,
    /// Principal name
    Name,
    /// Kerberos principal (repeatable)
    Kerberos,
    /// X.509 distinguished name (repeatable)
    X509Dn,
}

impl KeyType {
    /// Number of key spaces
    pub const COUNT: usize = 7;

    /// Every key space, in index order
    pub const ALL: [KeyType; Self::COUNT] = [
        KeyType::Uid,
        KeyType::Gid,
        KeyType::Guid,
        KeyType::Sid,
        KeyType::Name,
        KeyType::Kerberos,
        KeyType::X509Dn,
    ];

    /// Position of this key space in per-key-type arrays
    pub fn index(self) -> usize {
        self as usize
    }

    /// Authority bit for this key space
    pub fn bit(self) -> KeyTypes {
        KeyTypes::from_bits_truncate(1 << self.index())
    }

    /// Whether one record may be filed under several keys of this type
    pub fn is_repeatable(self) -> bool {
        matches!(self, KeyType::Kerberos | KeyType::X509Dn)
    }

    /// Classes a lookup by this key type can produce when the caller
    /// gives no narrower mask
    pub fn default_class_mask(self) -> RecordClass {
        match self {
            KeyType::Uid => RecordClass::ACCOUNTS,
            KeyType::Gid => RecordClass::GROUPS,
            _ => RecordClass::all(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Uid => "uid",
            KeyType::Gid => "gid",
            KeyType::Guid => "guid",
            KeyType::Sid => "sid",
            KeyType::Name => "name",
            KeyType::Kerberos => "kerberos",
            KeyType::X509Dn => "x509dn",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = IdCacheError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "uid" => Ok(KeyType::Uid),
            "gid" => Ok(KeyType::Gid),
            "guid" | "uuid" => Ok(KeyType::Guid),
            "sid" => Ok(KeyType::Sid),
            "name" => Ok(KeyType::Name),
            "kerberos" | "krb" => Ok(KeyType::Kerberos),
            "x509" | "x509dn" => Ok(KeyType::X509Dn),
            other => Err(IdCacheError::Malformed(format!("unknown key type '{}'", other))),
        }
    }
}

bitflags! {
    /// Set of key types (authority bits, scheduled re-verifies)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyTypes: u8 {
        const UID = 1 << 0;
        const GID = 1 << 1;
        const GUID = 1 << 2;
        const SID = 1 << 3;
        const NAME = 1 << 4;
        const KERBEROS = 1 << 5;
        const X509_DN = 1 << 6;
    }
}

impl KeyTypes {
    /// Lowest key type in the set
    pub fn primary(self) -> Option<KeyType> {
        KeyType::ALL.into_iter().find(|kt| self.contains(kt.bit()))
    }

    pub fn contains_type(self, key_type: KeyType) -> bool {
        self.contains(key_type.bit())
    }
}

impl From<KeyType> for KeyTypes {
    fn from(key_type: KeyType) -> Self {
        key_type.bit()
    }
}

bitflags! {
    /// Principal classification; a union when ambiguous at creation
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct RecordClass: u8 {
        const USER = 1 << 0;
        const GROUP = 1 << 1;
        const COMPUTER = 1 << 2;
        const COMPUTER_GROUP = 1 << 3;
    }
}

impl RecordClass {
    /// Classes addressed by uid and the account name space
    pub const ACCOUNTS: Self = Self::USER.union(Self::COMPUTER);

    /// Classes addressed by gid and the group name space
    pub const GROUPS: Self = Self::GROUP.union(Self::COMPUTER_GROUP);

    pub fn is_account_like(self) -> bool {
        self.intersects(Self::ACCOUNTS)
    }

    pub fn is_group_like(self) -> bool {
        self.intersects(Self::GROUPS)
    }

    /// Invalidation categories touched when a record of this class goes away
    pub fn kinds(self) -> RecordKinds {
        let mut kinds = RecordKinds::empty();
        if self.contains(Self::USER) {
            kinds |= RecordKinds::USER;
        }
        if self.is_group_like() {
            kinds |= RecordKinds::GROUP;
        }
        if self.contains(Self::COMPUTER) {
            kinds |= RecordKinds::HOST;
        }
        kinds
    }

    /// Name spaces this class is filed under in the name index
    pub fn name_spaces(self) -> impl Iterator<Item = NameSpace> {
        let account = self.is_account_like().then_some(NameSpace::Account);
        let group = self.is_group_like().then_some(NameSpace::Group);
        account.into_iter().chain(group)
    }
}

bitflags! {
    /// Record-kind categories reported to invalidation subscribers
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct RecordKinds: u8 {
        const USER = 1 << 0;
        const GROUP = 1 << 1;
        const HOST = 1 << 2;
    }
}

bitflags! {
    /// Per-call resolution flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ResolveFlags: u8 {
        /// Caller is the kernel-facing translation layer
        const KERNEL = 1 << 0;
        /// Do not cache a negative answer for this call
        const NO_NEGATIVE_CACHE = 1 << 1;
    }
}

/// Separates account names from group names inside the name index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum NameSpace {
    Account,
    Group,
}

/// Ordered key stored in a [`crate::index::MultiKeyIndex`]
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IndexKey {
    /// Numeric id (uid or gid)
    Id(u32),
    Guid(Uuid),
    Sid(Sid),
    Name(NameSpace, String),
    /// Kerberos principal or X.509 DN
    Text(String),
}

impl IndexKey {
    /// Parse a caller-supplied key for the given key type
    pub fn parse(key_type: KeyType, raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(IdCacheError::Malformed(format!("empty {} key", key_type)));
        }

        match key_type {
            KeyType::Uid | KeyType::Gid => trimmed
                .parse::<u32>()
                .or_else(|_| trimmed.parse::<i32>().map(|id| id as u32))
                .map(IndexKey::Id)
                .map_err(|_| {
                    IdCacheError::Malformed(format!("invalid numeric id '{}'", trimmed))
                }),
            KeyType::Guid => Uuid::parse_str(trimmed)
                .map(IndexKey::Guid)
                .map_err(|e| IdCacheError::Malformed(format!("invalid GUID '{}': {}", trimmed, e))),
            KeyType::Sid => trimmed.parse::<Sid>().map(IndexKey::Sid),
            KeyType::Name => Ok(IndexKey::Name(NameSpace::Account, trimmed.to_string())),
            KeyType::Kerberos | KeyType::X509Dn => Ok(IndexKey::Text(trimmed.to_string())),
        }
    }

    /// Concrete index keys to probe for a lookup restricted to `class`
    pub(crate) fn lookup_candidates(&self, class: RecordClass) -> Vec<IndexKey> {
        match self {
            IndexKey::Name(_, name) => class
                .name_spaces()
                .map(|space| IndexKey::Name(space, name.clone()))
                .collect(),
            other => vec![other.clone()],
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexKey::Id(id) => write!(f, "{}", id),
            IndexKey::Guid(guid) => write!(f, "{}", guid.hyphenated().to_string().to_uppercase()),
            IndexKey::Sid(sid) => write!(f, "{}", sid),
            IndexKey::Name(_, name) => f.write_str(name),
            IndexKey::Text(text) => f.write_str(text),
        }
    }
}

/// Keys one record contributes to one index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValues {
    Scalar(IndexKey),
    Repeatable(Vec<IndexKey>),
}

impl KeyValues {
    pub fn iter(&self) -> std::slice::Iter<'_, IndexKey> {
        match self {
            KeyValues::Scalar(key) => std::slice::from_ref(key).iter(),
            KeyValues::Repeatable(keys) => keys.iter(),
        }
    }

    pub fn first(&self) -> Option<&IndexKey> {
        self.iter().next()
    }
}
