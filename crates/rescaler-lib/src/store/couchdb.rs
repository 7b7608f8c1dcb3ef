//! CouchDB-backed state store
//!
//! Each document type lives in its own database. Writes carry the document's
//! `_rev`, so CouchDB answers `409 Conflict` when another writer got there
//! first.

use super::{Document, StateStore, StoreError, StoreResult};
use crate::models::{Limits, Request, Rule, Service, Structure, Subtype};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

#[derive(Deserialize)]
struct AllDocs {
    rows: Vec<Row>,
}

#[derive(Deserialize)]
struct Row {
    id: String,
    #[serde(default)]
    doc: Option<Value>,
}

#[derive(Deserialize)]
struct FindResult {
    docs: Vec<Value>,
}

/// State store client for a CouchDB server
pub struct CouchDbStore {
    client: Client,
    base_url: Url,
}

impl CouchDbStore {
    /// Create a new client for the server at `base_url`
    pub fn new(base_url: &str, timeout: Duration) -> StoreResult<Self> {
        let client = Client::builder().timeout(timeout).build()?;

        let mut normalized = base_url.to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let base_url =
            Url::parse(&normalized).map_err(|e| StoreError::Url(format!("{base_url}: {e}")))?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str) -> StoreResult<Url> {
        self.base_url
            .join(path)
            .map_err(|e| StoreError::Url(format!("{path}: {e}")))
    }

    async fn check(response: Response) -> StoreResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(StoreError::Status {
            status: status.as_u16(),
            body,
        })
    }

    fn decode<T: Document>(doc: Value) -> StoreResult<T> {
        serde_json::from_value(doc).map_err(|e| StoreError::Decode(format!("{}: {e}", T::KIND)))
    }

    async fn all_docs<T: Document>(&self) -> StoreResult<Vec<T>> {
        Ok(self.scan::<T>().await?.0)
    }

    /// Fetch every document of type `T`, returning the `(id, rev)` of rows
    /// that failed to decode alongside the decoded ones
    async fn scan<T: Document>(&self) -> StoreResult<(Vec<T>, Vec<(String, String)>)> {
        let url = self.url(&format!("{}/_all_docs?include_docs=true", T::DATABASE))?;
        let response = Self::check(self.client.get(url).send().await?).await?;
        let all: AllDocs = response.json().await?;

        let mut docs = Vec::with_capacity(all.rows.len());
        let mut malformed = Vec::new();
        for row in all.rows {
            if row.id.starts_with("_design") {
                continue;
            }
            let Some(doc) = row.doc else { continue };
            let rev = doc.get("_rev").and_then(Value::as_str).map(str::to_string);
            match Self::decode::<T>(doc) {
                Ok(doc) => docs.push(doc),
                Err(e) => {
                    warn!(id = %row.id, error = %e, "Skipping malformed document");
                    if let Some(rev) = rev {
                        malformed.push((row.id, rev));
                    }
                }
            }
        }
        Ok((docs, malformed))
    }

    async fn find_by_name<T: Document>(&self, field: &str, name: &str) -> StoreResult<T> {
        let url = self.url(&format!("{}/_find", T::DATABASE))?;
        let query = json!({ "selector": { field: name }, "limit": 1 });
        let response = Self::check(self.client.post(url).json(&query).send().await?).await?;
        let found: FindResult = response.json().await?;

        match found.docs.into_iter().next() {
            Some(doc) => Self::decode(doc),
            None => Err(StoreError::NotFound {
                kind: T::KIND,
                name: name.to_string(),
            }),
        }
    }

    async fn put<T: Document>(&self, doc: &T) -> StoreResult<()> {
        let id = doc.id().unwrap_or(doc.key());
        let url = self.url(&format!("{}/{}", T::DATABASE, id))?;
        let response = self.client.put(url).json(doc).send().await?;

        match response.status() {
            StatusCode::CONFLICT => Err(StoreError::Conflict(format!("{} {}", T::KIND, doc.key()))),
            StatusCode::NOT_FOUND => Err(StoreError::NotFound {
                kind: T::KIND,
                name: doc.key().to_string(),
            }),
            _ => {
                Self::check(response).await?;
                debug!(kind = T::KIND, name = %doc.key(), "Document updated");
                Ok(())
            }
        }
    }

    async fn post<T: Document>(&self, doc: &T) -> StoreResult<()> {
        let url = self.url(T::DATABASE)?;
        Self::check(self.client.post(url).json(doc).send().await?).await?;
        Ok(())
    }

    async fn delete<T: Document>(&self, doc: &T) -> StoreResult<()> {
        let (Some(id), Some(rev)) = (doc.id(), doc.rev()) else {
            return Err(StoreError::Decode(format!(
                "{} {} has no _id/_rev",
                T::KIND,
                doc.key()
            )));
        };
        self.delete_revision(T::DATABASE, T::KIND, id, rev).await
    }

    async fn delete_revision(
        &self,
        database: &str,
        kind: &'static str,
        id: &str,
        rev: &str,
    ) -> StoreResult<()> {
        let mut url = self.url(&format!("{database}/{id}"))?;
        url.query_pairs_mut().append_pair("rev", rev);
        let response = self.client.delete(url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => {
                debug!(kind, id = %id, "Document already deleted");
                Ok(())
            }
            StatusCode::CONFLICT => Err(StoreError::Conflict(format!("{kind} {id}"))),
            _ => {
                Self::check(response).await?;
                Ok(())
            }
        }
    }
}

#[async_trait]
impl StateStore for CouchDbStore {
    async fn get_structure(&self, name: &str) -> StoreResult<Structure> {
        self.find_by_name("name", name).await
    }

    async fn get_structures(&self, subtype: Option<Subtype>) -> StoreResult<Vec<Structure>> {
        let mut structures = self.all_docs::<Structure>().await?;
        if let Some(subtype) = subtype {
            structures.retain(|s| s.subtype == subtype);
        }
        Ok(structures)
    }

    async fn update_structure(&self, structure: &Structure) -> StoreResult<()> {
        self.put(structure).await
    }

    async fn get_requests(&self) -> StoreResult<Vec<Request>> {
        let (requests, malformed) = self.scan::<Request>().await?;
        for (id, rev) in malformed {
            warn!(id = %id, "Deleting malformed request");
            if let Err(e) = self
                .delete_revision(Request::DATABASE, Request::KIND, &id, &rev)
                .await
            {
                warn!(id = %id, error = %e, "Could not delete malformed request");
            }
        }
        Ok(requests)
    }

    async fn add_request(&self, request: &Request) -> StoreResult<()> {
        self.post(request).await
    }

    async fn delete_request(&self, request: &Request) -> StoreResult<()> {
        self.delete(request).await
    }

    async fn get_service(&self, name: &str) -> StoreResult<Service> {
        self.find_by_name("name", name).await
    }

    async fn update_service(&self, service: &Service) -> StoreResult<()> {
        self.put(service).await
    }

    async fn get_rules(&self) -> StoreResult<Vec<Rule>> {
        self.all_docs().await
    }

    async fn get_rule(&self, name: &str) -> StoreResult<Rule> {
        self.find_by_name("name", name).await
    }

    async fn update_rule(&self, rule: &Rule) -> StoreResult<()> {
        self.put(rule).await
    }

    async fn get_limits(&self, structure: &str) -> StoreResult<Limits> {
        self.find_by_name("name", structure).await
    }

    async fn update_limits(&self, limits: &Limits) -> StoreResult<()> {
        self.put(limits).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ResourceKind;
    use mockito::Matcher;

    fn store(server: &mockito::ServerGuard) -> CouchDbStore {
        CouchDbStore::new(&server.url(), Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_get_structure_by_name() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/structures/_find")
            .match_body(Matcher::PartialJson(json!({"selector": {"name": "host0"}})))
            .with_status(200)
            .with_body(
                json!({"docs": [{
                    "_id": "abc", "_rev": "2-x", "type": "structure",
                    "name": "host0", "subtype": "host",
                    "resources": {"cpu": {"max": 400, "free": 100}}
                }]})
                .to_string(),
            )
            .create_async()
            .await;

        let host = store(&server).get_structure("host0").await.unwrap();

        mock.assert_async().await;
        assert_eq!(host.subtype, Subtype::Host);
        assert_eq!(host.rev.as_deref(), Some("2-x"));
        assert_eq!(host.resources[&ResourceKind::Cpu].free, Some(100));
    }

    #[tokio::test]
    async fn test_get_structure_not_found() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", "/structures/_find")
            .with_status(200)
            .with_body(r#"{"docs": []}"#)
            .create_async()
            .await;

        let err = store(&server).get_structure("ghost").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_update_conflict() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("PUT", "/structures/abc")
            .with_status(409)
            .with_body(r#"{"error": "conflict"}"#)
            .create_async()
            .await;

        let mut host = Structure::new("host0", Subtype::Host);
        host.id = Some("abc".to_string());
        host.rev = Some("1-old".to_string());

        let err = store(&server).update_structure(&host).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_requests_skip_design_and_malformed_docs() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/requests/_all_docs")
            .match_query(Matcher::UrlEncoded("include_docs".into(), "true".into()))
            .with_status(200)
            .with_body(
                json!({"rows": [
                    {"id": "_design/requests", "doc": {"views": {}}},
                    {"id": "r1", "doc": {
                        "_id": "r1", "_rev": "1-a", "type": "request",
                        "structure": "node0", "resource": "cpu", "amount": 20,
                        "action": "CpuRescaleUp", "host": "host0",
                        "host_rescaler_ip": "10.0.0.1", "host_rescaler_port": 8000,
                        "timestamp": 100
                    }},
                    {"id": "r2", "doc": {"_id": "r2", "_rev": "1-b", "structure": "node1"}}
                ]})
                .to_string(),
            )
            .create_async()
            .await;
        let malformed = server
            .mock("DELETE", "/requests/r2")
            .match_query(Matcher::UrlEncoded("rev".into(), "1-b".into()))
            .with_status(200)
            .with_body(r#"{"ok": true}"#)
            .expect(1)
            .create_async()
            .await;
        let healthy = server
            .mock("DELETE", "/requests/r1")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;

        let requests = store(&server).get_requests().await.unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].id.as_deref(), Some("r1"));
        malformed.assert_async().await;
        healthy.assert_async().await;
    }

    #[tokio::test]
    async fn test_delete_request_sends_revision() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("DELETE", "/requests/r1")
            .match_query(Matcher::UrlEncoded("rev".into(), "1-a".into()))
            .with_status(200)
            .with_body(r#"{"ok": true}"#)
            .create_async()
            .await;
        let gone = server
            .mock("DELETE", "/requests/r2")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;

        let store = store(&server);
        let mut request: Request = serde_json::from_value(json!({
            "_id": "r1", "_rev": "1-a", "structure": "node0", "resource": "cpu",
            "amount": 20, "action": "CpuRescaleUp", "host": "host0",
            "host_rescaler_ip": "10.0.0.1", "host_rescaler_port": 8000, "timestamp": 100
        }))
        .unwrap();

        store.delete_request(&request).await.unwrap();
        request.id = Some("r2".to_string());
        store.delete_request(&request).await.unwrap();

        mock.assert_async().await;
        gone.assert_async().await;
    }
}
