//! Persistent client registry.
//!
//! Maps API keys to `{name, capacity, rate}` records. Two backends share
//! one interface: a JSON file store for `local` mode and a MongoDB
//! collection for `remote` mode. Both expose `has` as an atomic
//! upsert-read, which is what lets the limiter create budgets lazily on
//! first sight of a key without a check-then-insert race.

use std::collections::HashMap;
use std::path::PathBuf;

use futures::stream::StreamExt;
use mongodb::bson::doc;
use mongodb::options::{ClientOptions, FindOneAndUpdateOptions, FindOptions, ReturnDocument};
use mongodb::{Client as MongoClient, Collection};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A registered client of the balancer. All fields are optional on the
/// wire; empty values are omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub key: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub capacity: u64,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub rate: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

impl Client {
    /// Validates the admin-supplied fields before persisting.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.name.is_empty() {
            Err("empty name")
        } else if self.capacity == 0 {
            Err("null capacity")
        } else if self.rate == 0 {
            Err("null rate")
        } else {
            Ok(())
        }
    }
}

/// Bucket parameters assigned to lazily-created clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    #[serde(default = "default_rate")]
    pub rate: u64,
}

fn default_capacity() -> u64 {
    10
}

fn default_rate() -> u64 {
    1
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            rate: default_rate(),
        }
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("client is not found")]
    NotFound,
    #[error("storage file: {0}")]
    File(#[from] std::io::Error),
    #[error("storage encoding: {0}")]
    Encoding(#[from] serde_json::Error),
    #[error("database: {0}")]
    Database(#[from] mongodb::error::Error),
}

/// JSON file store for `local` mode. The in-memory map is authoritative
/// and mirrored to disk on every mutation; the write lock makes `has` an
/// atomic upsert-read.
struct FileStore {
    path: PathBuf,
    clients: RwLock<HashMap<String, Client>>,
}

impl FileStore {
    async fn open(path: PathBuf) -> Result<Self, StorageError> {
        let clients = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let list: Vec<Client> = serde_json::from_slice(&bytes)?;
                list.into_iter().map(|c| (c.key.clone(), c)).collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => return Err(err.into()),
        };

        Ok(Self {
            path,
            clients: RwLock::new(clients),
        })
    }

    // Callers hold the write lock, so file writes never interleave.
    async fn persist(&self, clients: &HashMap<String, Client>) -> Result<(), StorageError> {
        let mut list: Vec<&Client> = clients.values().collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));

        let json = serde_json::to_vec_pretty(&list)?;
        tokio::fs::write(&self.path, json).await?;
        Ok(())
    }

    async fn list(&self) -> Vec<Client> {
        let clients = self.clients.read().await;
        let mut list: Vec<Client> = clients.values().cloned().collect();
        list.sort_by(|a, b| a.key.cmp(&b.key));
        list
    }

    async fn add(&self, mut client: Client) -> Result<String, StorageError> {
        let key = Uuid::new_v4().to_string();
        client.key = key.clone();

        let mut clients = self.clients.write().await;
        clients.insert(key.clone(), client);
        self.persist(&clients).await?;

        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Client, StorageError> {
        self.clients
            .read()
            .await
            .get(key)
            .cloned()
            .ok_or(StorageError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut clients = self.clients.write().await;
        if clients.remove(key).is_none() {
            return Err(StorageError::NotFound);
        }
        self.persist(&clients).await?;
        Ok(())
    }

    async fn has(&self, key: &str, defaults: Defaults) -> Result<Client, StorageError> {
        if let Some(client) = self.clients.read().await.get(key) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get(key) {
            return Ok(client.clone());
        }

        let client = Client {
            name: Uuid::new_v4().to_string(),
            key: key.to_string(),
            capacity: defaults.capacity,
            rate: defaults.rate,
        };
        clients.insert(key.to_string(), client.clone());
        self.persist(&clients).await?;

        Ok(client)
    }
}

/// MongoDB store for `remote` mode.
struct MongoStore {
    clients: Collection<Client>,
}

impl MongoStore {
    async fn connect(uri: &str, database: &str) -> Result<Self, StorageError> {
        let options = ClientOptions::parse(uri).await?;
        let client = MongoClient::with_options(options)?;
        let clients = client.database(database).collection::<Client>("clients");
        Ok(Self { clients })
    }

    async fn list(&self) -> Result<Vec<Client>, StorageError> {
        let options = FindOptions::builder().sort(doc! { "key": 1 }).build();
        let mut cursor = self.clients.find(None, options).await?;

        let mut list = Vec::new();
        while let Some(client) = cursor.next().await {
            list.push(client?);
        }

        Ok(list)
    }

    async fn add(&self, mut client: Client) -> Result<String, StorageError> {
        let key = Uuid::new_v4().to_string();
        client.key = key.clone();
        self.clients.insert_one(&client, None).await?;
        Ok(key)
    }

    async fn get(&self, key: &str) -> Result<Client, StorageError> {
        self.clients
            .find_one(doc! { "key": key }, None)
            .await?
            .ok_or(StorageError::NotFound)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let result = self.clients.delete_one(doc! { "key": key }, None).await?;
        if result.deleted_count == 0 {
            return Err(StorageError::NotFound);
        }
        Ok(())
    }

    // Single round-trip upsert-read: insert with defaults when the key is
    // unseen, return the stored record either way.
    async fn has(&self, key: &str, defaults: Defaults) -> Result<Client, StorageError> {
        let options = FindOneAndUpdateOptions::builder()
            .upsert(true)
            .return_document(ReturnDocument::After)
            .build();

        let update = doc! {
            "$setOnInsert": {
                "name": Uuid::new_v4().to_string(),
                "capacity": defaults.capacity as i64,
                "rate": defaults.rate as i64,
            }
        };

        self.clients
            .find_one_and_update(doc! { "key": key }, update, options)
            .await?
            .ok_or(StorageError::NotFound)
    }
}

enum Backend {
    Local(FileStore),
    Remote(MongoStore),
}

/// The client registry consumed by the admin handlers and the limiter.
pub struct Registry {
    backend: Backend,
    defaults: Defaults,
}

impl Registry {
    pub async fn local(path: impl Into<PathBuf>, defaults: Defaults) -> Result<Self, StorageError> {
        Ok(Self {
            backend: Backend::Local(FileStore::open(path.into()).await?),
            defaults,
        })
    }

    pub async fn remote(uri: &str, database: &str, defaults: Defaults) -> Result<Self, StorageError> {
        Ok(Self {
            backend: Backend::Remote(MongoStore::connect(uri, database).await?),
            defaults,
        })
    }

    pub fn defaults(&self) -> Defaults {
        self.defaults
    }

    /// All clients, ordered by key.
    pub async fn list(&self) -> Result<Vec<Client>, StorageError> {
        match &self.backend {
            Backend::Local(store) => Ok(store.list().await),
            Backend::Remote(store) => store.list().await,
        }
    }

    /// Persists a new client under a freshly assigned UUID key.
    pub async fn add(&self, client: Client) -> Result<String, StorageError> {
        match &self.backend {
            Backend::Local(store) => store.add(client).await,
            Backend::Remote(store) => store.add(client).await,
        }
    }

    pub async fn get(&self, key: &str) -> Result<Client, StorageError> {
        match &self.backend {
            Backend::Local(store) => store.get(key).await,
            Backend::Remote(store) => store.get(key).await,
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Local(store) => store.delete(key).await,
            Backend::Remote(store) => store.delete(key).await,
        }
    }

    /// Upsert-read: returns the stored record for `key`, creating it with
    /// the default budget and a generated name when unseen.
    pub async fn has(&self, key: &str) -> Result<Client, StorageError> {
        match &self.backend {
            Backend::Local(store) => store.has(key, self.defaults).await,
            Backend::Remote(store) => store.has(key, self.defaults).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const DEFAULTS: Defaults = Defaults {
        capacity: 10,
        rate: 1,
    };

    async fn registry(dir: &TempDir) -> Registry {
        Registry::local(dir.path().join("clients.json"), DEFAULTS)
            .await
            .unwrap()
    }

    fn client(name: &str, capacity: u64, rate: u64) -> Client {
        Client {
            name: name.to_string(),
            key: String::new(),
            capacity,
            rate,
        }
    }

    #[test]
    fn validation_rejects_bad_fields() {
        assert_eq!(client("", 1, 1).validate(), Err("empty name"));
        assert_eq!(client("a", 0, 1).validate(), Err("null capacity"));
        assert_eq!(client("a", 1, 0).validate(), Err("null rate"));
        assert!(client("a", 1, 1).validate().is_ok());
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;

        let key = registry.add(client("acme", 5, 2)).await.unwrap();
        let stored = registry.get(&key).await.unwrap();

        assert_eq!(stored.name, "acme");
        assert_eq!(stored.key, key);
        assert_eq!(stored.capacity, 5);
        assert_eq!(stored.rate, 2);
    }

    #[tokio::test]
    async fn delete_then_get_is_not_found() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;

        let key = registry.add(client("acme", 5, 2)).await.unwrap();
        registry.delete(&key).await.unwrap();

        assert!(matches!(
            registry.get(&key).await,
            Err(StorageError::NotFound)
        ));
        assert!(matches!(
            registry.delete(&key).await,
            Err(StorageError::NotFound)
        ));
    }

    #[tokio::test]
    async fn has_creates_with_defaults_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;
        let key = Uuid::new_v4().to_string();

        let first = registry.has(&key).await.unwrap();
        assert_eq!(first.key, key);
        assert_eq!(first.capacity, DEFAULTS.capacity);
        assert_eq!(first.rate, DEFAULTS.rate);
        assert!(!first.name.is_empty());

        let second = registry.has(&key).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn has_returns_existing_record_untouched() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;

        let key = registry.add(client("acme", 5, 2)).await.unwrap();
        let seen = registry.has(&key).await.unwrap();

        assert_eq!(seen.name, "acme");
        assert_eq!(seen.capacity, 5);
    }

    #[tokio::test]
    async fn list_is_ordered_by_key() {
        let dir = TempDir::new().unwrap();
        let registry = registry(&dir).await;

        for i in 0..4 {
            registry
                .add(client(&format!("client-{i}"), 1, 1))
                .await
                .unwrap();
        }

        let list = registry.list().await.unwrap();
        assert_eq!(list.len(), 4);
        let keys: Vec<&str> = list.iter().map(|c| c.key.as_str()).collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[tokio::test]
    async fn store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clients.json");

        let key = {
            let registry = Registry::local(&path, DEFAULTS).await.unwrap();
            registry.add(client("acme", 5, 2)).await.unwrap()
        };

        let reopened = Registry::local(&path, DEFAULTS).await.unwrap();
        let stored = reopened.get(&key).await.unwrap();
        assert_eq!(stored.name, "acme");
    }

    #[test]
    fn wire_form_omits_empty_fields() {
        let json = serde_json::to_value(client("acme", 5, 0)).unwrap();
        assert_eq!(json.get("name").unwrap(), "acme");
        assert!(json.get("key").is_none());
        assert!(json.get("rate").is_none());
    }
}
