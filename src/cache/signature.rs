//! Cheap fingerprint of the family dataset for change detection.

use crate::services::family::model::FamilyData;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::Serialize;

/// Number of hex characters kept from the digest
const CHECKSUM_LEN: usize = 12;

/// Collection counts plus a short checksum over item identities and timestamps.
///
/// Compared field by field; two datasets with equal signatures are treated
/// as unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataChangeSignature {
    pub members: usize,
    pub todos: usize,
    pub events: usize,
    pub groceries: usize,
    pub documents: usize,
    pub checksum: String,
}

impl DataChangeSignature {
    pub fn compute(data: &FamilyData) -> Self {
        let mut hasher = Md5::new();
        hasher.update(data.family_id.as_bytes());

        for member in &data.members {
            feed(&mut hasher, "m", &member.id, member.updated_at, false);
        }
        for todo in &data.todos {
            feed(&mut hasher, "t", &todo.id, todo.updated_at, todo.completed);
        }
        for event in &data.events {
            feed(&mut hasher, "e", &event.id, event.updated_at, false);
        }
        for item in &data.groceries {
            feed(&mut hasher, "g", &item.id, item.updated_at, item.purchased);
        }
        for doc in &data.documents {
            feed(&mut hasher, "d", &doc.id, doc.updated_at, false);
        }

        let digest = hex::encode(hasher.finalize());

        Self {
            members: data.members.len(),
            todos: data.todos.len(),
            events: data.events.len(),
            groceries: data.groceries.len(),
            documents: data.documents.len(),
            checksum: digest[..CHECKSUM_LEN].to_string(),
        }
    }
}

fn feed(hasher: &mut Md5, tag: &str, id: &str, updated_at: Option<DateTime<Utc>>, flag: bool) {
    hasher.update(tag.as_bytes());
    hasher.update(id.as_bytes());
    if let Some(ts) = updated_at {
        hasher.update(ts.timestamp_millis().to_le_bytes());
    }
    hasher.update([flag as u8, b'|']);
}
