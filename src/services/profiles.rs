use anyhow::Context as AnyhowContext;
use mongodb::bson::{doc, from_document, Bson, DateTime, Document};
use serde::{Deserialize, Serialize};

use crate::db::{DocumentStore, FindSpec};

/// Typed view over a balance document. The store itself is schema-free;
/// this is only a convenience for command handlers that read profiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Profile {
    #[serde(rename = "_id")]
    pub id: i64,
    #[serde(default)]
    pub balance: i64,
    #[serde(rename = "ExpireAt", default, skip_serializing_if = "Option::is_none")]
    pub expire_at: Option<DateTime>,
}

pub struct ProfileService {
    store: DocumentStore,
}

impl ProfileService {
    pub fn new(store: DocumentStore) -> Self {
        Self { store }
    }

    pub async fn profile(&self, user_id: i64) -> anyhow::Result<Option<Profile>> {
        match self.store.find(user_id, None).await? {
            Some(document) => Ok(Some(decode(document)?)),
            None => Ok(None),
        }
    }

    /// One projected field of a profile; `None` when the user or the field
    /// is absent.
    pub async fn field(&self, user_id: i64, name: &str) -> anyhow::Result<Option<Bson>> {
        let found = self.store.find(user_id, doc! { name: 1 }).await?;
        Ok(found.and_then(|mut document| document.remove(name)))
    }

    pub async fn balance(&self, user_id: i64) -> anyhow::Result<i64> {
        match self.field(user_id, "balance").await? {
            Some(value) => value
                .as_i64()
                .or_else(|| value.as_i32().map(i64::from))
                .context("balance field is not numeric"),
            None => Ok(0),
        }
    }

    /// The `n` richest profiles, highest balance first.
    pub async fn top_balances(&self, n: i64) -> anyhow::Result<Vec<Profile>> {
        let spec = FindSpec::new()
            .filter(doc! { "balance": { "$exists": true } })
            .sort(doc! { "balance": -1 })
            .limit(n);
        let documents = self.store.find_many(spec).await?;
        let mut profiles = Vec::with_capacity(documents.len());
        for document in documents {
            profiles.push(decode(document)?);
        }
        Ok(profiles)
    }
}

fn decode(document: Document) -> anyhow::Result<Profile> {
    from_document(document).context("malformed profile document")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_decodes_full_document() {
        let stamp = DateTime::from_millis(1_700_000_000_000);
        let profile = decode(doc! {
            "_id": 42_i64,
            "balance": 15_i64,
            "ExpireAt": stamp,
        })
        .unwrap();
        assert_eq!(profile.id, 42);
        assert_eq!(profile.balance, 15);
        assert_eq!(profile.expire_at, Some(stamp));
    }

    #[test]
    fn test_profile_tolerates_sparse_documents() {
        // Ad hoc fields from other features share these documents.
        let profile = decode(doc! {
            "_id": 7_i64,
            "inventory": ["badge"],
        })
        .unwrap();
        assert_eq!(profile.id, 7);
        assert_eq!(profile.balance, 0);
        assert!(profile.expire_at.is_none());
    }

    #[test]
    fn test_profile_requires_an_id() {
        assert!(decode(doc! { "balance": 3_i64 }).is_err());
    }
}
