//! Request execution across hosts.
//!
//! [`Communication`] asks the host handler for a host, sends the request on
//! one of that host's connections and classifies what came back:
//!
//! - a redirect penalizes the current host and re-sends, pinned to the new
//!   location, up to `max_redirects` times
//! - a transport failure reports `fail()` and tries the next host the
//!   handler yields, until it yields none
//! - anything else is final and reported as `success()`, since the host
//!   answered

use crate::connection::authentication_error;
use crate::error::DriverError;
use crate::handler::{AccessType, HostHandler};
use crate::host::{HostDescription, HostHandle};
use async_trait::async_trait;
use std::sync::Arc;
use velocy_protocol::{Request, Response};

/// Meta headers naming a redirect target, in order of preference.
const REDIRECT_HEADERS: [&str; 2] = ["location", "x-arango-endpoint"];

/// Executes requests and returns their responses.
#[async_trait]
pub trait RequestExecutor: Send + Sync {
    /// Executes `request`. A handle holding a host pins the request to it;
    /// on success the handle is set to the host that answered.
    async fn execute(
        &self,
        request: &Request,
        handle: Option<&mut HostHandle>,
    ) -> Result<Response, DriverError>;
}

/// Classified result of one attempt.
#[derive(Debug)]
pub enum Outcome {
    Success(Response),
    /// The server asked for the request to be sent elsewhere.
    Redirect(HostDescription),
    Failure(DriverError),
}

impl Outcome {
    pub fn classify(result: Result<Response, DriverError>) -> Self {
        let response = match result {
            Ok(response) => response,
            Err(e) => return Outcome::Failure(e),
        };

        match response.response_code {
            307 | 308 | 503 => {
                let location = REDIRECT_HEADERS
                    .iter()
                    .find_map(|name| response.header(name));
                match location {
                    Some(location) => match HostDescription::parse_location(location) {
                        Ok(host) => Outcome::Redirect(host),
                        Err(e) => Outcome::Failure(e),
                    },
                    None => Outcome::Failure(server_error(&response)),
                }
            }
            401 => Outcome::Failure(authentication_error(&response)),
            code if code >= 400 => Outcome::Failure(server_error(&response)),
            _ => Outcome::Success(response),
        }
    }
}

/// Builds the error for a response with an error code, reading
/// `errorNum`/`errorMessage` from the body when present.
fn server_error(response: &Response) -> DriverError {
    let body = response
        .body
        .as_deref()
        .and_then(|body| serde_json::from_slice::<serde_json::Value>(body).ok());

    let error_num = body
        .as_ref()
        .and_then(|v| v.get("errorNum"))
        .and_then(|v| v.as_i64());
    let message = body
        .as_ref()
        .and_then(|v| v.get("errorMessage"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("response code {}", response.response_code));

    DriverError::Server {
        code: response.response_code,
        error_num,
        message,
    }
}

/// Request executor over a host handler.
pub struct Communication {
    handler: Arc<dyn HostHandler>,
    max_redirects: usize,
}

impl Communication {
    pub fn new(handler: Arc<dyn HostHandler>, max_redirects: usize) -> Self {
        Self {
            handler,
            max_redirects,
        }
    }

    pub fn handler(&self) -> &Arc<dyn HostHandler> {
        &self.handler
    }

    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Closes every host the handler knows.
    pub async fn close(&self) {
        self.handler.close().await;
    }
}

#[async_trait]
impl RequestExecutor for Communication {
    async fn execute(
        &self,
        request: &Request,
        handle: Option<&mut HostHandle>,
    ) -> Result<Response, DriverError> {
        let access = AccessType::of(request);
        let mut pinned = handle.as_ref().and_then(|h| h.host().cloned());
        let mut redirects = 0;
        let mut last_error: Option<DriverError> = None;

        loop {
            let Some(host) = self.handler.get(access).await else {
                self.handler.reset();
                return Err(DriverError::NoHostAvailable {
                    last_error: last_error.map(Box::new),
                });
            };

            let connection = host.connection(pinned.as_ref());
            tracing::debug!(
                "{} {} via {} (connection {})",
                request.request_type,
                request.path,
                connection.host(),
                connection.id()
            );

            match Outcome::classify(connection.execute(request).await) {
                Outcome::Success(response) => {
                    self.handler.success();
                    if let Some(handle) = handle {
                        handle.set_host(connection.host().clone());
                    }
                    return Ok(response);
                }
                Outcome::Redirect(location) => {
                    redirects += 1;
                    if redirects > self.max_redirects {
                        self.handler.success();
                        return Err(DriverError::TooManyRedirects {
                            limit: self.max_redirects,
                        });
                    }
                    tracing::warn!(
                        "{} redirected request {} to {}",
                        connection.host(),
                        request.path,
                        location
                    );
                    self.handler.close_current_on_error().await;
                    self.handler.fail();
                    pinned = Some(location);
                }
                Outcome::Failure(e) if e.is_transport() => {
                    tracing::warn!("Request to {} failed: {}", connection.host(), e);
                    self.handler.fail();
                    pinned = None;
                    last_error = Some(e);
                }
                Outcome::Failure(e) => {
                    self.handler.success();
                    return Err(e);
                }
            }
        }
    }
}
