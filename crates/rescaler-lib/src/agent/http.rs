//! HTTP client for host agents
//!
//! Host agents expose `/container/` (every container on the host) and
//! `/container/{name}` (GET for live limits, PUT for new limits). A PUT is
//! only successful when the agent answers `201 Created`.

use super::{AgentError, HostAgent, LimitUpdate, LiveResources};
use crate::models::AgentEndpoint;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error};
use url::Url;

/// Host agent client over HTTP with a bounded request timeout
#[derive(Clone)]
pub struct HttpHostAgent {
    client: Client,
}

impl HttpHostAgent {
    /// Create a new client; `timeout` bounds every call to an agent
    pub fn new(timeout: Duration) -> Result<Self, AgentError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    fn url(endpoint: &AgentEndpoint, container: &str) -> Result<Url, AgentError> {
        let raw = format!("http://{}:{}/container/{}", endpoint.ip, endpoint.port, container);
        Url::parse(&raw).map_err(|e| AgentError::Url(format!("{raw}: {e}")))
    }

    async fn check(response: Response, expected: StatusCode) -> Result<Response, AgentError> {
        let status = response.status();
        if status == expected {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(AgentError::Status {
            status: status.as_u16(),
            body,
        })
    }
}

#[async_trait]
impl HostAgent for HttpHostAgent {
    async fn container_resources(
        &self,
        endpoint: &AgentEndpoint,
        container: &str,
    ) -> Result<LiveResources, AgentError> {
        let url = Self::url(endpoint, container)?;
        let response = self.client.get(url).send().await?;
        let response = Self::check(response, StatusCode::OK).await?;
        let resources = response.json().await?;
        debug!(container = %container, agent = %endpoint, "Fetched live container resources");
        Ok(resources)
    }

    async fn host_containers(
        &self,
        endpoint: &AgentEndpoint,
    ) -> Result<HashMap<String, LiveResources>, AgentError> {
        let url = Self::url(endpoint, "")?;
        let response = self.client.get(url).send().await?;
        let response = Self::check(response, StatusCode::OK).await?;
        Ok(response.json().await?)
    }

    async fn set_container_resources(
        &self,
        endpoint: &AgentEndpoint,
        container: &str,
        update: &LimitUpdate,
    ) -> Result<(), AgentError> {
        let url = Self::url(endpoint, container)?;
        let response = self
            .client
            .put(url)
            .header("Accept", "application/json")
            .json(update)
            .send()
            .await?;

        match Self::check(response, StatusCode::CREATED).await {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(
                    container = %container,
                    agent = %endpoint,
                    update = ?update,
                    error = %e,
                    "Host agent rejected limit update"
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Limit;
    use crate::models::ResourceKind;

    fn endpoint(server: &mockito::ServerGuard) -> AgentEndpoint {
        let host_port = server.host_with_port();
        let (ip, port) = host_port.rsplit_once(':').unwrap();
        AgentEndpoint {
            ip: ip.to_string(),
            port: port.parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn test_container_resources() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/container/node0")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"cpu": {"cpu_allowance_limit": 150, "cpu_num": "0,1"}, "mem": {"mem_limit": -1}}"#)
            .create_async()
            .await;

        let agent = HttpHostAgent::new(Duration::from_secs(5)).unwrap();
        let live = agent
            .container_resources(&endpoint(&server), "node0")
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(live.limit(ResourceKind::Cpu), Some(Limit::Value(150)));
        assert_eq!(live.limit(ResourceKind::Mem), Some(Limit::Unlimited));
    }

    #[tokio::test]
    async fn test_host_containers() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/container/")
            .with_status(200)
            .with_body(r#"{"node0": {"mem": {"mem_limit": 1024}}, "node1": {}}"#)
            .create_async()
            .await;

        let agent = HttpHostAgent::new(Duration::from_secs(5)).unwrap();
        let all = agent.host_containers(&endpoint(&server)).await.unwrap();

        assert_eq!(all.len(), 2);
        assert_eq!(all["node0"].limit(ResourceKind::Mem), Some(Limit::Value(1024)));
        assert_eq!(all["node1"].limit(ResourceKind::Mem), None);
    }

    #[tokio::test]
    async fn test_set_container_resources_requires_created() {
        let mut server = mockito::Server::new_async().await;
        let update = LimitUpdate::Mem { mem_limit: 2048 };

        let accepted = server
            .mock("PUT", "/container/node0")
            .match_body(mockito::Matcher::Json(
                serde_json::json!({"mem": {"mem_limit": "2048"}}),
            ))
            .with_status(201)
            .with_body("{}")
            .create_async()
            .await;
        let rejected = server
            .mock("PUT", "/container/node1")
            .with_status(200)
            .with_body(r#"{"error": "nope"}"#)
            .create_async()
            .await;

        let agent = HttpHostAgent::new(Duration::from_secs(5)).unwrap();
        let endpoint = endpoint(&server);

        tokio_test::assert_ok!(agent.set_container_resources(&endpoint, "node0", &update).await);
        let err = agent
            .set_container_resources(&endpoint, "node1", &update)
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Status { status: 200, .. }));

        accepted.assert_async().await;
        rejected.assert_async().await;
    }
}
