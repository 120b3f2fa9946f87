//! Driver facade.
//!
//! Wires a [`DriverConfig`] into hosts, a resolver, a host handler and a
//! [`Communication`], and offers typed request execution on top.

use crate::communication::{Communication, RequestExecutor};
use crate::config::{DriverConfig, Protocol};
use crate::connection::{ConnectionFactory, HttpConnectionFactory, VstConnectionFactory};
use crate::error::DriverError;
use crate::handler::create_host_handler;
use crate::host::{Host, HostDescription, HostHandle};
use crate::meta::{ApplyMeta, DocumentMeta};
use crate::pool::ConnectionPool;
use crate::resolver::{
    EndpointResolver, ExtendedHostResolver, HostFactory, HostResolver, SimpleHostResolver,
};
use crate::serializer::{JsonSerializer, Serializer};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Weak};
use velocy_protocol::{Request, RequestType, Response};

/// Database the cluster endpoint list is read from.
const SYSTEM_DATABASE: &str = "_system";

/// Server version information.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerVersion {
    pub server: String,
    pub version: String,
    #[serde(default)]
    pub license: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EndpointList {
    endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Deserialize)]
struct EndpointEntry {
    endpoint: String,
}

/// Client driver.
pub struct Driver<S = JsonSerializer> {
    config: DriverConfig,
    communication: Arc<Communication>,
    serializer: S,
}

impl Driver<JsonSerializer> {
    /// Creates a driver with JSON bodies. No connection is opened until the
    /// first request.
    pub fn new(config: DriverConfig) -> Result<Self, DriverError> {
        Self::with_serializer(config, JsonSerializer)
    }
}

impl<S: Serializer> Driver<S> {
    pub fn with_serializer(config: DriverConfig, serializer: S) -> Result<Self, DriverError> {
        config.validate()?;
        let connection_config = config.connection_config();
        let factory: Arc<dyn ConnectionFactory> = match config.protocol {
            Protocol::Vst => Arc::new(VstConnectionFactory::new(connection_config)),
            Protocol::Http => Arc::new(HttpConnectionFactory::new(connection_config)),
        };
        Ok(Self::with_factory(config, serializer, factory))
    }

    pub(crate) fn with_factory(
        config: DriverConfig,
        serializer: S,
        factory: Arc<dyn ConnectionFactory>,
    ) -> Self {
        let max_connections = config.max_connections();
        let host_factory: HostFactory = Arc::new(move |description: &HostDescription| {
            Arc::new(Host::new(
                description.clone(),
                ConnectionPool::new(description.clone(), max_connections, factory.clone()),
            ))
        });
        let hosts: Vec<Arc<Host>> = config.hosts.iter().map(|d| host_factory(d)).collect();

        let resolver: Arc<dyn HostResolver> = if config.acquire_host_list {
            Arc::new(ExtendedHostResolver::new(
                hosts,
                host_factory,
                config.acquire_host_list_interval(),
            ))
        } else {
            Arc::new(SimpleHostResolver::new(hosts))
        };

        let handler = create_host_handler(config.load_balancing, resolver.clone());
        let communication = Arc::new(Communication::new(handler, config.max_redirects));
        resolver.init(Arc::new(CommunicationEndpointResolver {
            communication: Arc::downgrade(&communication),
        }));

        tracing::debug!(
            "Driver configured: {} host(s), {:?}, {:?}",
            config.hosts.len(),
            config.protocol,
            config.load_balancing
        );

        Self {
            config,
            communication,
            serializer,
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn communication(&self) -> &Arc<Communication> {
        &self.communication
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// A request against the configured database.
    pub fn request(&self, request_type: RequestType, path: impl Into<String>) -> Request {
        Request::new(self.config.database.clone(), request_type, path)
    }

    /// Executes `request` and runs `deserializer` over the response.
    pub async fn execute<T, F>(
        &self,
        request: &Request,
        deserializer: F,
        handle: Option<&mut HostHandle>,
    ) -> Result<T, DriverError>
    where
        F: FnOnce(Response) -> Result<T, DriverError>,
    {
        let response = self.communication.execute(request, handle).await?;
        deserializer(response)
    }

    /// Executes `request` and deserializes the response body.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        request: &Request,
        handle: Option<&mut HostHandle>,
    ) -> Result<T, DriverError> {
        self.execute(
            request,
            |response| {
                let body = response.body.unwrap_or_default();
                self.serializer.deserialize(&body)
            },
            handle,
        )
        .await
    }

    pub async fn version(&self) -> Result<ServerVersion, DriverError> {
        let request = self.request(RequestType::Get, "/_api/version");
        self.execute_json(&request, None).await
    }

    /// Endpoints of the cluster's coordinators.
    pub async fn endpoints(&self) -> Result<Vec<HostDescription>, DriverError> {
        let endpoints = fetch_endpoints(self.communication.as_ref()).await?;
        endpoints
            .iter()
            .map(|e| HostDescription::parse_location(e))
            .collect()
    }

    /// Stores `document` in `collection` and returns it with the assigned
    /// metadata applied.
    pub async fn create_document<T>(&self, collection: &str, document: T) -> Result<T, DriverError>
    where
        T: Serialize + ApplyMeta + Send,
    {
        let body = self.serializer.serialize(&document)?;
        let request = self
            .request(RequestType::Post, format!("/_api/document/{}", collection))
            .with_body(body);
        let meta: DocumentMeta = self.execute_json(&request, None).await?;
        tracing::debug!("Created document {} rev {}", meta.id, meta.rev);
        Ok(document.apply_meta(&meta))
    }

    /// Closes every connection to every host.
    pub async fn shutdown(&self) {
        self.communication.close().await;
    }
}

async fn fetch_endpoints(executor: &dyn RequestExecutor) -> Result<Vec<String>, DriverError> {
    let request = Request::new(SYSTEM_DATABASE, RequestType::Get, "/_api/cluster/endpoints");
    let response = executor.execute(&request, None).await?;
    let body = response.body.unwrap_or_default();
    let list: EndpointList = serde_json::from_slice(&body)?;
    Ok(list.endpoints.into_iter().map(|e| e.endpoint).collect())
}

/// Reads the endpoint list through the driver's own communication.
///
/// Holds the communication weakly: the communication owns the resolver that
/// owns this.
struct CommunicationEndpointResolver {
    communication: Weak<Communication>,
}

#[async_trait]
impl EndpointResolver for CommunicationEndpointResolver {
    async fn resolve_endpoints(&self) -> Result<Vec<String>, DriverError> {
        let Some(communication) = self.communication.upgrade() else {
            return Ok(Vec::new());
        };
        match fetch_endpoints(communication.as_ref()).await {
            // Single servers refuse the endpoint list.
            Err(e) if e.response_code() == Some(403) => Ok(Vec::new()),
            result => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LoadBalancingStrategy;
    use crate::connection::ConnectionConfig;
    use crate::testing::{MockConnectionFactory, Reply, TestServer};
    use serde_json::json;
    use std::time::Duration;

    fn config(hosts: &[&str]) -> DriverConfig {
        DriverConfig {
            hosts: hosts.iter().map(|h| h.parse().unwrap()).collect(),
            ..DriverConfig::default()
        }
    }

    fn json_response(value: serde_json::Value) -> Response {
        Response::new(200).with_body(value.to_string())
    }

    fn endpoints_body(endpoints: &[&str]) -> serde_json::Value {
        let endpoints: Vec<_> = endpoints.iter().map(|e| json!({ "endpoint": e })).collect();
        json!({"error": false, "code": 200, "endpoints": endpoints})
    }

    #[tokio::test]
    async fn test_version() {
        let factory = MockConnectionFactory::with_responder(|_, request| {
            assert_eq!(request.path, "/_api/version");
            assert_eq!(request.database, "_system");
            Ok(json_response(
                json!({"server": "arango", "version": "3.11.4", "license": "community"}),
            ))
        });
        let driver = Driver::with_factory(config(&["db1:8529"]), JsonSerializer, factory);

        let version = driver.version().await.unwrap();
        assert_eq!(version.server, "arango");
        assert_eq!(version.version, "3.11.4");
        assert_eq!(version.license.as_deref(), Some("community"));
    }

    #[tokio::test]
    async fn test_execute_with_custom_deserializer() {
        let factory = MockConnectionFactory::with_responder(|_, _| {
            Ok(Response::new(202).with_meta("x-arango-queue-time-seconds", "0.5"))
        });
        let driver = Driver::with_factory(config(&["db1:8529"]), JsonSerializer, factory);

        let request = driver.request(RequestType::Put, "/_api/job");
        let code = driver
            .execute(&request, |r| Ok(r.response_code), None)
            .await
            .unwrap();
        assert_eq!(code, 202);
    }

    #[tokio::test]
    async fn test_create_document_applies_meta() {
        let factory = MockConnectionFactory::with_responder(|_, request| {
            assert_eq!(request.path, "/_api/document/orders");
            let body: serde_json::Value =
                serde_json::from_slice(request.body.as_deref().unwrap()).unwrap();
            assert_eq!(body["total"], 12);
            Ok(json_response(
                json!({"_id": "orders/42", "_key": "42", "_rev": "_hV2xO--_"}),
            ))
        });
        let driver = Driver::with_factory(config(&["db1:8529"]), JsonSerializer, factory);

        let doc = driver
            .create_document("orders", json!({"total": 12}))
            .await
            .unwrap();
        assert_eq!(doc["_key"], "42");
        assert_eq!(doc["_rev"], "_hV2xO--_");
        assert_eq!(doc["total"], 12);
    }

    #[tokio::test]
    async fn test_endpoints() {
        let factory = MockConnectionFactory::with_responder(|_, _| {
            Ok(json_response(endpoints_body(&["tcp://10.0.0.1:8529", "ssl://[::1]:8530"])))
        });
        let driver = Driver::with_factory(config(&["db1:8529"]), JsonSerializer, factory);

        let endpoints = driver.endpoints().await.unwrap();
        assert_eq!(
            endpoints,
            vec![
                HostDescription::new("10.0.0.1", 8529),
                HostDescription::new("::1", 8530)
            ]
        );
    }

    #[tokio::test]
    async fn test_host_list_refresh_through_driver() {
        let factory = MockConnectionFactory::with_responder(|host, request| {
            if request.path == "/_api/cluster/endpoints" {
                Ok(json_response(endpoints_body(&["tcp://db2:8529"])))
            } else {
                Ok(Response::new(200).with_body(host.host().to_string()))
            }
        });
        let config = DriverConfig {
            acquire_host_list: true,
            ..config(&["db1:8529"])
        };
        let driver = Driver::with_factory(config, JsonSerializer, factory.clone());

        let request = driver.request(RequestType::Get, "/_api/version");
        let first = driver.execute(&request, Ok, None).await.unwrap();
        assert_eq!(first.body.unwrap().as_ref(), b"db1");

        let second = driver.execute(&request, Ok, None).await.unwrap();
        assert_eq!(second.body.unwrap().as_ref(), b"db2");
        assert_eq!(factory.requested_hosts(), vec!["db1", "db1", "db2"]);

        // Within the interval the list is not read again.
        driver.execute(&request, Ok, None).await.unwrap();
        assert_eq!(factory.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_zero_refresh_interval_refreshes_every_request() {
        let factory = MockConnectionFactory::with_responder(|host, request| {
            if request.path == "/_api/cluster/endpoints" {
                Ok(json_response(endpoints_body(&["tcp://db2:8529"])))
            } else {
                Ok(Response::new(200).with_body(host.host().to_string()))
            }
        });
        let config = DriverConfig {
            acquire_host_list: true,
            acquire_host_list_interval_secs: 0,
            ..config(&["db1:8529"])
        };
        config.validate().unwrap();
        let driver = Driver::with_factory(config, JsonSerializer, factory.clone());

        let request = driver.request(RequestType::Get, "/_api/version");
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_secs(5), driver.execute(&request, Ok, None))
                .await
                .unwrap()
                .unwrap();
        }

        let refreshes = factory
            .requests()
            .iter()
            .filter(|r| r.path == "/_api/cluster/endpoints")
            .count();
        assert_eq!(refreshes, 2);
        assert_eq!(factory.requests().len(), 5);
    }

    #[tokio::test]
    async fn test_single_server_keeps_hosts() {
        let factory = MockConnectionFactory::with_responder(|host, request| {
            if request.path == "/_api/cluster/endpoints" {
                Ok(Response::new(403).with_body(
                    r#"{"error":true,"code":403,"errorNum":11,"errorMessage":"forbidden"}"#,
                ))
            } else {
                Ok(Response::new(200).with_body(host.host().to_string()))
            }
        });
        let config = DriverConfig {
            acquire_host_list: true,
            ..config(&["db1:8529"])
        };
        let driver = Driver::with_factory(config, JsonSerializer, factory.clone());

        let request = driver.request(RequestType::Get, "/_api/version");
        for _ in 0..3 {
            let response = driver.execute(&request, Ok, None).await.unwrap();
            assert_eq!(response.body.unwrap().as_ref(), b"db1");
        }
    }

    #[tokio::test]
    async fn test_pinned_follow_up_requests() {
        let factory = MockConnectionFactory::with_responder(|host, _| {
            Ok(Response::new(201).with_body(host.host().to_string()))
        });
        let config = DriverConfig {
            load_balancing: LoadBalancingStrategy::RoundRobin,
            ..config(&["a:8529", "b:8529", "c:8529"])
        };
        let driver = Driver::with_factory(config, JsonSerializer, factory.clone());

        let mut handle = HostHandle::new();
        let cursor = driver.request(RequestType::Post, "/_api/cursor");
        driver.execute(&cursor, Ok, Some(&mut handle)).await.unwrap();
        let served_by = handle.host().cloned().unwrap();

        let next = driver.request(RequestType::Post, "/_api/cursor/1");
        for _ in 0..3 {
            driver.execute(&next, Ok, Some(&mut handle)).await.unwrap();
        }
        let hosts = factory.requested_hosts();
        assert!(hosts.iter().all(|h| h == served_by.host()));
    }

    #[tokio::test]
    async fn test_dirty_reads_use_follower_rotation() {
        let factory = MockConnectionFactory::with_responder(|host, _| {
            Ok(Response::new(200).with_body(host.host().to_string()))
        });
        let driver =
            Driver::with_factory(config(&["a:8529", "b:8529"]), JsonSerializer, factory.clone());

        let read = driver
            .request(RequestType::Get, "/_api/document/c/1")
            .with_dirty_read(true);
        let write = driver.request(RequestType::Post, "/_api/document/c");
        for _ in 0..2 {
            driver.execute(&read, Ok, None).await.unwrap();
            driver.execute(&write, Ok, None).await.unwrap();
        }
        assert_eq!(factory.requested_hosts(), vec!["a", "a", "b", "a"]);
    }

    #[tokio::test]
    async fn test_end_to_end_over_vst() {
        let server = TestServer::start(|request: &Request| {
            Reply::Respond(
                Response::new(200)
                    .with_body(r#"{"server":"arango","version":"3.12.0"}"#)
                    .with_meta("x-path", request.path.clone()),
            )
        })
        .await;
        let config = DriverConfig {
            hosts: vec![server.host()],
            ..DriverConfig::default()
        };
        let factory = Arc::new(VstConnectionFactory::new(config.connection_config()));
        let driver = Driver::with_factory(config, JsonSerializer, factory);

        let version = driver.version().await.unwrap();
        assert_eq!(version.version, "3.12.0");
        assert_eq!(server.authentications(), vec!["root".to_string()]);

        driver.shutdown().await;
    }

    #[tokio::test]
    async fn test_unreachable_hosts() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let config = DriverConfig {
            hosts: vec![HostDescription::new("127.0.0.1", port)],
            ..DriverConfig::default()
        };
        let factory = Arc::new(VstConnectionFactory::new(ConnectionConfig::new()));
        let driver = Driver::with_factory(config, JsonSerializer, factory);

        let err = driver.version().await.unwrap_err();
        match err {
            DriverError::NoHostAvailable { last_error } => {
                assert!(last_error.unwrap().is_transport());
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = DriverConfig {
            hosts: Vec::new(),
            ..DriverConfig::default()
        };
        assert!(matches!(
            Driver::new(config),
            Err(DriverError::Config(_))
        ));
    }
}
