//! Compatibility GUIDs for numeric-id-only principals
//!
//! A compatibility GUID is a fixed 12-byte prefix that encodes the record
//! class, followed by the big-endian numeric id. Decoding is exact: a GUID
//! decodes only if its prefix is one of the four below.

use crate::types::RecordClass;
use uuid::Uuid;

const USER_PREFIX: [u8; 12] = [
    0xFF, 0xFF, 0xEE, 0xEE, 0xDD, 0xDD, 0xCC, 0xCC, 0xBB, 0xBB, 0xAA, 0xAA,
];
const GROUP_PREFIX: [u8; 12] = [
    0xAB, 0xCD, 0xEF, 0xAB, 0xCD, 0xEF, 0xAB, 0xCD, 0xEF, 0xAB, 0xCD, 0xEF,
];
const COMPUTER_PREFIX: [u8; 12] = [
    0xAA, 0xAA, 0xBB, 0xBB, 0xCC, 0xCC, 0xDD, 0xDD, 0xEE, 0xEE, 0xFF, 0xFF,
];
const COMPUTER_GROUP_PREFIX: [u8; 12] = [
    0xBB, 0xBB, 0xCC, 0xCC, 0xDD, 0xDD, 0xEE, 0xEE, 0xFF, 0xFF, 0xAA, 0xAA,
];

const PREFIXES: [(RecordClass, [u8; 12]); 4] = [
    (RecordClass::USER, USER_PREFIX),
    (RecordClass::GROUP, GROUP_PREFIX),
    (RecordClass::COMPUTER, COMPUTER_PREFIX),
    (RecordClass::COMPUTER_GROUP, COMPUTER_GROUP_PREFIX),
];

/// Synthesize the compatibility GUID for `class` and `id`
///
/// Ambiguous classes pick the first matching class in the order
/// user, group, computer, computer group. Returns `None` for an empty class.
pub fn compat_guid(class: RecordClass, id: u32) -> Option<Uuid> {
    let (_, prefix) = PREFIXES
        .iter()
        .find(|(candidate, _)| class.contains(*candidate))?;

    let mut bytes = [0u8; 16];
    bytes[..12].copy_from_slice(prefix);
    bytes[12..].copy_from_slice(&id.to_be_bytes());
    Some(Uuid::from_bytes(bytes))
}

/// Recover the class and numeric id embedded in a compatibility GUID
pub fn decode_compat_guid(guid: &Uuid) -> Option<(RecordClass, u32)> {
    let bytes = guid.as_bytes();
    let (class, _) = PREFIXES
        .iter()
        .find(|(_, prefix)| bytes[..12] == prefix[..])?;
    let id = u32::from_be_bytes([bytes[12], bytes[13], bytes[14], bytes[15]]);
    Some((*class, id))
}
