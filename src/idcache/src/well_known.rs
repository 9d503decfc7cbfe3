//! Reserved principals and locally synthesized pseudo-groups

use crate::compat::compat_guid;
use crate::identity::Identity;
use crate::sid::Sid;
use crate::types::{IndexKey, KeyType, RecordClass};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Group every principal implicitly belongs to, synthesized locally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PseudoGroup {
    pub name: String,
    pub gid: u32,
    /// Defaults to the compatibility GUID for `gid`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<Uuid>,
    pub sid: Sid,
}

impl PseudoGroup {
    pub fn new(name: impl Into<String>, gid: u32, sid: Sid) -> Self {
        Self {
            name: name.into(),
            gid,
            guid: None,
            sid,
        }
    }

    pub fn guid(&self) -> Option<Uuid> {
        self.guid.or_else(|| compat_guid(RecordClass::GROUP, self.gid))
    }

    /// Builtin group identity for this pseudo-group
    pub fn identity(&self) -> Identity {
        let mut identity = Identity::group(self.name.clone(), self.gid)
            .with_sid(self.sid.clone())
            .as_builtin();
        identity.guid = self.guid();
        identity
    }

    fn matches(&self, key_type: KeyType, key: &IndexKey) -> bool {
        match (key_type, key) {
            (KeyType::Gid, IndexKey::Id(id)) => *id == self.gid,
            (KeyType::Guid, IndexKey::Guid(guid)) => self.guid() == Some(*guid),
            (KeyType::Sid, IndexKey::Sid(sid)) => *sid == self.sid,
            (KeyType::Name, IndexKey::Name(_, name)) => name.eq_ignore_ascii_case(&self.name),
            _ => false,
        }
    }
}

/// Reserved identifiers that only builtin records may answer for
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WellKnown {
    /// Numeric ids strictly below this value are reserved
    #[serde(default = "default_reserved_id_max")]
    pub reserved_id_max: u32,

    #[serde(default = "default_reserved_names")]
    pub reserved_names: Vec<String>,

    #[serde(default = "default_reserved_sid_prefixes")]
    pub reserved_sid_prefixes: Vec<Sid>,

    #[serde(default = "default_everyone")]
    pub everyone: PseudoGroup,

    #[serde(default = "default_local_accounts")]
    pub local_accounts: PseudoGroup,

    #[serde(default = "default_network_accounts")]
    pub network_accounts: PseudoGroup,
}

fn default_reserved_id_max() -> u32 { 500 }
fn default_everyone() -> PseudoGroup { PseudoGroup::new("everyone", 12, Sid::well_known(1, &[0])) }
fn default_local_accounts() -> PseudoGroup { PseudoGroup::new("localaccounts", 61, Sid::well_known(2, &[0])) }
fn default_network_accounts() -> PseudoGroup { PseudoGroup::new("netaccounts", 62, Sid::well_known(5, &[2])) }

fn default_reserved_names() -> Vec<String> {
    ["root", "admin", "wheel", "staff", "daemon", "nobody", "everyone", "localaccounts", "netaccounts"]
        .iter()
        .map(|name| name.to_string())
        .collect()
}

fn default_reserved_sid_prefixes() -> Vec<Sid> {
    vec![
        Sid::well_known(5, &[32]),
        Sid::well_known(1, &[]),
        Sid::well_known(2, &[]),
        Sid::well_known(5, &[18]),
        Sid::well_known(5, &[19]),
        Sid::well_known(5, &[20]),
    ]
}

impl Default for WellKnown {
    fn default() -> Self {
        Self {
            reserved_id_max: default_reserved_id_max(),
            reserved_names: default_reserved_names(),
            reserved_sid_prefixes: default_reserved_sid_prefixes(),
            everyone: default_everyone(),
            local_accounts: default_local_accounts(),
            network_accounts: default_network_accounts(),
        }
    }
}

impl WellKnown {
    /// Whether `key` falls in the reserved part of its key space
    pub fn is_reserved(&self, key_type: KeyType, key: &IndexKey) -> bool {
        match (key_type, key) {
            (KeyType::Uid | KeyType::Gid, IndexKey::Id(id)) => *id < self.reserved_id_max,
            (KeyType::Name, IndexKey::Name(_, name)) => self
                .reserved_names
                .iter()
                .any(|reserved| reserved.eq_ignore_ascii_case(name)),
            (KeyType::Sid, IndexKey::Sid(sid)) => self
                .reserved_sid_prefixes
                .iter()
                .any(|prefix| sid.starts_with(prefix)),
            _ => false,
        }
    }

    pub fn pseudo_groups(&self) -> [&PseudoGroup; 3] {
        [&self.everyone, &self.local_accounts, &self.network_accounts]
    }

    /// Locally synthesized identity answering to `key`, if any
    pub fn pseudo_group_for(&self, key_type: KeyType, key: &IndexKey) -> Option<Identity> {
        self.pseudo_groups()
            .into_iter()
            .find(|group| group.matches(key_type, key))
            .map(PseudoGroup::identity)
    }
}
