//! Plain identity attributes as returned by a directory

use crate::sid::Sid;
use crate::types::{IndexKey, KeyType, KeyValues, RecordClass, MAX_REPEATABLE_KEYS};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attributes of one principal
///
/// Every identity attribute is optional; presence is the `Some`/non-empty
/// state of the field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    /// Principal class
    pub class: RecordClass,

    /// Principal (short) name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Human readable name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,

    /// uid for accounts, gid for groups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub numeric_id: Option<u32>,

    /// Primary group gid (accounts only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_group_id: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<Sid>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub kerberos_principals: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub x509_dns: Vec<String>,

    /// Directory partition the identity came from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,

    /// Authoritative local definition of a reserved principal
    #[serde(default)]
    pub builtin: bool,

    /// Partition validity stamp at fetch time
    #[serde(skip)]
    pub partition_token: Option<u64>,
}

impl Identity {
    /// Create an identity of the given class and name
    pub fn new(class: RecordClass, name: impl Into<String>) -> Self {
        Self {
            class,
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// User with a uid
    pub fn user(name: impl Into<String>, uid: u32) -> Self {
        Self::new(RecordClass::USER, name).with_numeric_id(uid)
    }

    /// Group with a gid
    pub fn group(name: impl Into<String>, gid: u32) -> Self {
        Self::new(RecordClass::GROUP, name).with_numeric_id(gid)
    }

    pub fn with_numeric_id(mut self, id: u32) -> Self {
        self.numeric_id = Some(id);
        self
    }

    pub fn with_primary_group(mut self, gid: u32) -> Self {
        self.primary_group_id = Some(gid);
        self
    }

    pub fn with_guid(mut self, guid: Uuid) -> Self {
        self.guid = Some(guid);
        self
    }

    pub fn with_sid(mut self, sid: Sid) -> Self {
        self.sid = Some(sid);
        self
    }

    pub fn with_display_name(mut self, display_name: impl Into<String>) -> Self {
        self.display_name = Some(display_name.into());
        self
    }

    pub fn with_kerberos_principal(mut self, principal: impl Into<String>) -> Self {
        self.kerberos_principals.push(principal.into());
        self
    }

    pub fn with_x509_dn(mut self, dn: impl Into<String>) -> Self {
        self.x509_dns.push(dn.into());
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = Some(partition.into());
        self
    }

    pub fn with_partition_token(mut self, token: u64) -> Self {
        self.partition_token = Some(token);
        self
    }

    pub fn as_builtin(mut self) -> Self {
        self.builtin = true;
        self
    }

    /// Keys this identity contributes to the index of `key_type`
    pub fn keys_for(&self, key_type: KeyType) -> Option<KeyValues> {
        match key_type {
            KeyType::Uid => self
                .numeric_id
                .filter(|_| self.class.is_account_like())
                .map(|id| KeyValues::Scalar(IndexKey::Id(id))),
            KeyType::Gid => self
                .numeric_id
                .filter(|_| self.class.is_group_like())
                .map(|id| KeyValues::Scalar(IndexKey::Id(id))),
            KeyType::Guid => self.guid.map(|guid| KeyValues::Scalar(IndexKey::Guid(guid))),
            KeyType::Sid => self.sid.clone().map(|sid| KeyValues::Scalar(IndexKey::Sid(sid))),
            KeyType::Name => {
                let name = self.name.as_ref()?;
                let keys: Vec<IndexKey> = self
                    .class
                    .name_spaces()
                    .map(|space| IndexKey::Name(space, name.clone()))
                    .collect();
                match keys.len() {
                    0 => None,
                    1 => keys.into_iter().next().map(KeyValues::Scalar),
                    _ => Some(KeyValues::Repeatable(keys)),
                }
            }
            KeyType::Kerberos => repeatable(&self.kerberos_principals),
            KeyType::X509Dn => repeatable(&self.x509_dns),
        }
    }

    /// Whether this identity answers to `key` in the key space `key_type`
    pub fn matches_key(&self, key_type: KeyType, key: &IndexKey) -> bool {
        let Some(values) = self.keys_for(key_type) else {
            return false;
        };
        values.iter().any(|candidate| match (candidate, key) {
            (IndexKey::Name(_, a), IndexKey::Name(_, b)) => a == b,
            (a, b) => a == b,
        })
    }
}

fn repeatable(values: &[String]) -> Option<KeyValues> {
    let keys: Vec<IndexKey> = values
        .iter()
        .filter(|v| !v.is_empty())
        .take(MAX_REPEATABLE_KEYS)
        .map(|v| IndexKey::Text(v.clone()))
        .collect();
    (!keys.is_empty()).then_some(KeyValues::Repeatable(keys))
}
