//! Identity collaborator: bearer tokens, trusted contacts and safety PINs.
//!
//! Identity issuance lives outside this service.  [`StaticDirectory`] reads
//! a TOML file of the following shape:
//!
//! ```toml
//! [[owners]]
//! id = "alice"
//! token = "tok-alice"
//! pin_sha256 = "03ac674216f3e15c761ee1a5e255f067953623c8b388b4459e13f978d7c846f4"
//!
//! [[owners.contacts]]
//! name = "Ana"
//! phone = "+15550001"
//! relationship = "sister"
//! is_safe = true
//! ```
//!
//! PINs are only ever held as SHA-256 digests.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};

use crate::model::TrustedContact;

#[async_trait]
pub trait IdentityDirectory: Send + Sync {
    /// Owner id behind a bearer token.
    async fn resolve_token(&self, token: &str) -> Option<String>;
    /// The owner's current trusted-contact list.
    async fn trusted_contacts(&self, owner_id: &str) -> Vec<TrustedContact>;
    /// Hex SHA-256 of the owner's safety PIN.
    async fn pin_digest(&self, owner_id: &str) -> Option<String>;
}

/// Hex SHA-256 of a PIN.
pub fn hash_pin(pin: &str) -> String {
    hex::encode(Sha256::digest(pin.trim().as_bytes()))
}

/// Compare a candidate PIN against a stored digest without short-circuiting
/// on the first differing byte.
pub fn verify_pin(candidate: &str, digest: &str) -> bool {
    let computed = hash_pin(candidate);
    let expected = digest.trim().to_ascii_lowercase();
    if computed.len() != expected.len() {
        return false;
    }
    computed
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[derive(Debug)]
pub enum DirectoryError {
    Io(std::io::Error),
    Toml(String),
    Duplicate(String),
}

impl std::fmt::Display for DirectoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DirectoryError::Io(e) => write!(f, "io error: {e}"),
            DirectoryError::Toml(e) => write!(f, "directory file error: {e}"),
            DirectoryError::Duplicate(id) => write!(f, "duplicate owner or token: {id}"),
        }
    }
}

impl std::error::Error for DirectoryError {}

impl From<std::io::Error> for DirectoryError {
    fn from(e: std::io::Error) -> Self {
        DirectoryError::Io(e)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ContactEntry {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub relationship: String,
    #[serde(default = "default_is_safe")]
    pub is_safe: bool,
    pub notes: Option<String>,
}

fn default_is_safe() -> bool {
    true
}

impl From<&ContactEntry> for TrustedContact {
    fn from(entry: &ContactEntry) -> Self {
        TrustedContact::new(
            entry.name.clone(),
            entry.phone.clone(),
            entry.relationship.clone(),
            entry.is_safe,
            entry.notes.clone(),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OwnerEntry {
    pub id: String,
    pub token: Option<String>,
    pub pin_sha256: Option<String>,
    #[serde(default)]
    pub contacts: Vec<ContactEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    owners: Vec<OwnerEntry>,
}

#[derive(Debug, Default)]
pub struct StaticDirectory {
    owners: HashMap<String, OwnerEntry>,
    tokens: HashMap<String, String>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(path: &Path) -> Result<Self, DirectoryError> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, DirectoryError> {
        let file: DirectoryFile =
            toml::from_str(contents).map_err(|e| DirectoryError::Toml(e.to_string()))?;
        let mut directory = Self::new();
        for owner in file.owners {
            directory.insert(owner)?;
        }
        Ok(directory)
    }

    pub fn insert(&mut self, owner: OwnerEntry) -> Result<(), DirectoryError> {
        if self.owners.contains_key(&owner.id) {
            return Err(DirectoryError::Duplicate(owner.id));
        }
        if let Some(token) = &owner.token {
            if self.tokens.contains_key(token) {
                return Err(DirectoryError::Duplicate(owner.id));
            }
            self.tokens.insert(token.clone(), owner.id.clone());
        }
        self.owners.insert(owner.id.clone(), owner);
        Ok(())
    }

    /// Builder used by tests and embedding code.
    pub fn with_owner(
        mut self,
        id: &str,
        token: &str,
        pin: &str,
        contacts: Vec<ContactEntry>,
    ) -> Result<Self, DirectoryError> {
        self.insert(OwnerEntry {
            id: id.to_string(),
            token: Some(token.to_string()),
            pin_sha256: Some(hash_pin(pin)),
            contacts,
        })?;
        Ok(self)
    }

    pub fn owner_count(&self) -> usize {
        self.owners.len()
    }
}

#[async_trait]
impl IdentityDirectory for StaticDirectory {
    async fn resolve_token(&self, token: &str) -> Option<String> {
        self.tokens.get(token).cloned()
    }

    async fn trusted_contacts(&self, owner_id: &str) -> Vec<TrustedContact> {
        self.owners
            .get(owner_id)
            .map(|owner| owner.contacts.iter().map(TrustedContact::from).collect())
            .unwrap_or_default()
    }

    async fn pin_digest(&self, owner_id: &str) -> Option<String> {
        self.owners
            .get(owner_id)
            .and_then(|owner| owner.pin_sha256.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::SmsStatus;

    const SAMPLE: &str = r#"
        [[owners]]
        id = "alice"
        token = "tok-alice"
        pin_sha256 = "03ac674216f3e15c761ee1a5e255f067953623c8b388b4459e13f978d7c846f4"

        [[owners.contacts]]
        name = "Ana"
        phone = "+15550001"
        relationship = "sister"

        [[owners.contacts]]
        name = "Ben"
        phone = "+15550002"
        relationship = "ex-partner"
        is_safe = false
        notes = "do not contact"

        [[owners]]
        id = "bob"
    "#;

    #[test]
    fn pin_digest_matches_known_value() {
        assert_eq!(
            hash_pin("1234"),
            "03ac674216f3e15c761ee1a5e255f067953623c8b388b4459e13f978d7c846f4"
        );
        assert!(verify_pin("1234", &hash_pin("1234")));
        assert!(verify_pin(" 1234 ", &hash_pin("1234").to_uppercase()));
        assert!(!verify_pin("4321", &hash_pin("1234")));
        assert!(!verify_pin("1234", "short"));
    }

    #[tokio::test]
    async fn loads_owners_and_contacts_from_toml() {
        let directory = StaticDirectory::from_toml_str(SAMPLE).unwrap();
        assert_eq!(directory.owner_count(), 2);
        assert_eq!(
            directory.resolve_token("tok-alice").await.as_deref(),
            Some("alice")
        );
        assert!(directory.resolve_token("nope").await.is_none());

        let contacts = directory.trusted_contacts("alice").await;
        assert_eq!(contacts.len(), 2);
        assert!(contacts[0].is_safe);
        assert_eq!(contacts[1].sms_status, SmsStatus::Excluded);
        assert_eq!(contacts[1].notes.as_deref(), Some("do not contact"));

        assert!(directory.pin_digest("bob").await.is_none());
        assert!(directory.trusted_contacts("bob").await.is_empty());
    }

    #[test]
    fn rejects_duplicate_owners() {
        let result = StaticDirectory::new()
            .with_owner("alice", "t1", "1111", Vec::new())
            .and_then(|d| d.with_owner("alice", "t2", "2222", Vec::new()));
        assert!(matches!(result, Err(DirectoryError::Duplicate(_))));
    }

    #[test]
    fn rejects_malformed_files() {
        assert!(matches!(
            StaticDirectory::from_toml_str("owners = 3"),
            Err(DirectoryError::Toml(_))
        ));
    }
}
