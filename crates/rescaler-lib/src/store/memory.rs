//! In-memory state store
//!
//! Follows the same revision rules as CouchDB: every write must carry the
//! current `_rev` of the document or it fails with a conflict. Used by tests
//! and local runs without a database.

use super::{Document, StateStore, StoreError, StoreResult};
use crate::models::{Limits, Request, Rule, Service, Structure, Subtype};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Default)]
struct Inner {
    databases: HashMap<&'static str, BTreeMap<String, Value>>,
    next_id: u64,
    injected_conflicts: u32,
}

/// State store held in process memory
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

fn revision_number(rev: &str) -> u64 {
    rev.split('-')
        .next()
        .and_then(|n| n.parse().ok())
        .unwrap_or(0)
}

fn encode<T: Document>(doc: &T, id: &str, rev: u64) -> StoreResult<Value> {
    let mut value =
        serde_json::to_value(doc).map_err(|e| StoreError::Decode(format!("{}: {e}", T::KIND)))?;
    if let Value::Object(map) = &mut value {
        map.insert("_id".to_string(), Value::from(id));
        map.insert("_rev".to_string(), Value::from(format!("{rev}-mem")));
    }
    Ok(value)
}

fn decode<T: Document>(value: &Value) -> StoreResult<T> {
    serde_json::from_value(value.clone()).map_err(|e| StoreError::Decode(format!("{}: {e}", T::KIND)))
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a new document, returning it with its assigned `_id` and `_rev`
    pub async fn insert<T: Document>(&self, doc: &T) -> StoreResult<T> {
        let mut inner = self.inner.write().await;
        let id = match doc.id() {
            Some(id) => id.to_string(),
            None if T::named() => doc.key().to_string(),
            None => {
                inner.next_id += 1;
                format!("{}-{}", T::KIND, inner.next_id)
            }
        };
        let value = encode(doc, &id, 1)?;
        let stored = decode(&value)?;
        inner
            .databases
            .entry(T::DATABASE)
            .or_default()
            .insert(id, value);
        Ok(stored)
    }

    /// Make the next `count` updates fail as if another writer won the race
    pub async fn inject_conflicts(&self, count: u32) {
        self.inner.write().await.injected_conflicts = count;
    }

    /// Number of stored documents of type `T`
    pub async fn count<T: Document>(&self) -> usize {
        self.inner
            .read()
            .await
            .databases
            .get(T::DATABASE)
            .map_or(0, BTreeMap::len)
    }

    /// Store a raw document as another writer would, bypassing the typed model
    #[cfg(test)]
    pub(crate) async fn insert_value(&self, database: &'static str, id: &str, mut value: Value) {
        if let Value::Object(map) = &mut value {
            map.insert("_id".to_string(), Value::from(id));
            map.entry("_rev").or_insert_with(|| Value::from("1-mem"));
        }
        self.inner
            .write()
            .await
            .databases
            .entry(database)
            .or_default()
            .insert(id.to_string(), value);
    }

    /// Decode every document of type `T`, returning the ids that failed
    async fn scan<T: Document>(&self) -> (Vec<T>, Vec<String>) {
        let inner = self.inner.read().await;
        let mut docs = Vec::new();
        let mut malformed = Vec::new();
        for (id, value) in inner.databases.get(T::DATABASE).into_iter().flatten() {
            match decode::<T>(value) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    warn!(id = %id, error = %e, "Skipping malformed document");
                    malformed.push(id.clone());
                }
            }
        }
        (docs, malformed)
    }

    async fn list<T: Document>(&self) -> StoreResult<Vec<T>> {
        Ok(self.scan::<T>().await.0)
    }

    /// Look a named document up without decoding its neighbours
    async fn find<T: Document>(&self, name: &str) -> StoreResult<T> {
        let inner = self.inner.read().await;
        let found = inner.databases.get(T::DATABASE).and_then(|db| {
            db.values()
                .find(|v| v.get("name").and_then(Value::as_str) == Some(name))
        });
        match found {
            Some(value) => decode(value),
            None => Err(StoreError::NotFound {
                kind: T::KIND,
                name: name.to_string(),
            }),
        }
    }

    async fn update<T: Document>(&self, doc: &T) -> StoreResult<()> {
        let mut inner = self.inner.write().await;
        if inner.injected_conflicts > 0 {
            inner.injected_conflicts -= 1;
            return Err(StoreError::Conflict(format!("{} {}", T::KIND, doc.key())));
        }

        let id = doc.id().unwrap_or(doc.key()).to_string();
        let db = inner.databases.entry(T::DATABASE).or_default();
        let stored_rev = db
            .get(&id)
            .and_then(|v| v.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);

        let next = match (stored_rev, doc.rev()) {
            (Some(stored), Some(rev)) if stored == rev => revision_number(&stored) + 1,
            (None, None) => 1,
            (None, Some(_)) => {
                return Err(StoreError::NotFound {
                    kind: T::KIND,
                    name: doc.key().to_string(),
                })
            }
            _ => return Err(StoreError::Conflict(format!("{} {}", T::KIND, doc.key()))),
        };

        let value = encode(doc, &id, next)?;
        db.insert(id, value);
        Ok(())
    }

    async fn delete<T: Document>(&self, doc: &T) -> StoreResult<()> {
        let Some(id) = doc.id() else {
            return Err(StoreError::Decode(format!("{} {} has no _id", T::KIND, doc.key())));
        };
        let mut inner = self.inner.write().await;
        let Some(db) = inner.databases.get_mut(T::DATABASE) else {
            return Ok(());
        };
        let stored_rev = db
            .get(id)
            .and_then(|v| v.get("_rev"))
            .and_then(Value::as_str)
            .map(str::to_string);
        match stored_rev {
            None => Ok(()),
            Some(stored) if Some(stored.as_str()) == doc.rev() => {
                db.remove(id);
                Ok(())
            }
            Some(_) => Err(StoreError::Conflict(format!("{} {}", T::KIND, id))),
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get_structure(&self, name: &str) -> StoreResult<Structure> {
        self.find(name).await
    }

    async fn get_structures(&self, subtype: Option<Subtype>) -> StoreResult<Vec<Structure>> {
        let mut structures = self.list::<Structure>().await?;
        if let Some(subtype) = subtype {
            structures.retain(|s| s.subtype == subtype);
        }
        Ok(structures)
    }

    async fn update_structure(&self, structure: &Structure) -> StoreResult<()> {
        self.update(structure).await
    }

    async fn get_requests(&self) -> StoreResult<Vec<Request>> {
        let (requests, malformed) = self.scan::<Request>().await;
        if !malformed.is_empty() {
            let mut inner = self.inner.write().await;
            if let Some(db) = inner.databases.get_mut(Request::DATABASE) {
                for id in &malformed {
                    warn!(id = %id, "Deleting malformed request");
                    db.remove(id);
                }
            }
        }
        Ok(requests)
    }

    async fn add_request(&self, request: &Request) -> StoreResult<()> {
        self.insert(request).await.map(|_| ())
    }

    async fn delete_request(&self, request: &Request) -> StoreResult<()> {
        self.delete(request).await
    }

    async fn get_service(&self, name: &str) -> StoreResult<Service> {
        self.find(name).await
    }

    async fn update_service(&self, service: &Service) -> StoreResult<()> {
        self.update(service).await
    }

    async fn get_rules(&self) -> StoreResult<Vec<Rule>> {
        self.list().await
    }

    async fn get_rule(&self, name: &str) -> StoreResult<Rule> {
        self.find(name).await
    }

    async fn update_rule(&self, rule: &Rule) -> StoreResult<()> {
        self.update(rule).await
    }

    async fn get_limits(&self, structure: &str) -> StoreResult<Limits> {
        self.find(structure).await
    }

    async fn update_limits(&self, limits: &Limits) -> StoreResult<()> {
        self.update(limits).await
    }
}
