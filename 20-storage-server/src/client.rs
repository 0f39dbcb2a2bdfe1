use std::{collections::BTreeMap, io, sync::Arc, time::Duration};

use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    config::{FramingConfig, Settings},
    endpoint::Endpoint,
    error::{ClientError, TransportError},
    host::{Clock, SystemClock},
    message::{Request, Response},
    store::sanitize_table,
    transport::{recv_message, send_message},
};

const DEFAULT_CACHE_HOURS: f64 = 24.0;

/// Thin client bound to one table. Every call opens a fresh connection.
///
/// A server that is not running is an expected condition: reads come back
/// empty, writes are dropped, and lock calls report `false`.
#[derive(Clone)]
pub struct Client {
    endpoint: Endpoint,
    table: String,
    framing: FramingConfig,
    pub(crate) cache_timeout: Duration,
    pub(crate) clock: Arc<dyn Clock>,
}

impl Client {
    pub fn new(endpoint: Endpoint, table: &str) -> Self {
        let table = sanitize_table(table);
        if table.is_empty() {
            warn!("no table defined; calls will be ignored");
        } else {
            debug!(%table, "setting table");
        }

        Self {
            endpoint,
            table,
            framing: FramingConfig::default(),
            cache_timeout: hours(DEFAULT_CACHE_HOURS),
            clock: Arc::new(SystemClock),
        }
    }

    pub fn from_settings(settings: &Settings, table: &str) -> Self {
        Self::new(settings.endpoint(), table)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_framing(mut self, framing: FramingConfig) -> Self {
        self.framing = framing;
        self
    }

    pub fn with_cache_timeout_hours(mut self, timeout_hours: f64) -> Self {
        self.set_cache_timeout(timeout_hours);
        self
    }

    /// Lifetime of memoized results, in hours.
    pub fn set_cache_timeout(&mut self, timeout_hours: f64) {
        self.cache_timeout = hours(timeout_hours);
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Stored value, or an empty string when missing or unavailable.
    pub async fn get(&self, name: &str) -> String {
        let request = Request::Get {
            table: self.table.clone(),
            name: name.to_string(),
        };
        match self.call(request, true).await {
            Some(Response::Text(text)) => text,
            _ => String::new(),
        }
    }

    /// Values for `prefix + item`, aligned with `items`. Empty when unavailable.
    pub async fn get_multi(&self, prefix: &str, items: &[String]) -> Vec<String> {
        let request = Request::GetMulti {
            table: self.table.clone(),
            name: prefix.to_string(),
            items: items.to_vec(),
        };
        match self.call(request, true).await {
            Some(Response::List(values)) => values,
            _ => Vec::new(),
        }
    }

    pub async fn set(&self, name: &str, data: &str) {
        let request = Request::Set {
            table: self.table.clone(),
            name: name.to_string(),
            data: Value::from(data),
        };
        self.call(request, false).await;
    }

    pub async fn set_multi(&self, prefix: &str, data: &BTreeMap<String, String>) {
        let request = Request::SetMulti {
            table: self.table.clone(),
            name: prefix.to_string(),
            data: data
                .iter()
                .map(|(item, value)| (item.clone(), Value::from(value.as_str())))
                .collect(),
        };
        self.call(request, false).await;
    }

    /// Deletes every entry whose name matches the SQL `LIKE` pattern.
    pub async fn delete(&self, pattern: &str) {
        let request = Request::Del {
            table: self.table.clone(),
            name: pattern.to_string(),
        };
        self.call(request, true).await;
    }

    pub async fn lock(&self, name: &str) -> bool {
        let request = Request::Lock {
            table: self.table.clone(),
            name: name.to_string(),
        };
        self.call(request, true)
            .await
            .is_some_and(|response| response.is_true())
    }

    pub async fn unlock(&self, name: &str) -> bool {
        let request = Request::Unlock {
            table: self.table.clone(),
            name: name.to_string(),
        };
        self.call(request, true)
            .await
            .is_some_and(|response| response.is_true())
    }

    async fn call(&self, request: Request, expect_reply: bool) -> Option<Response> {
        if self.table.is_empty() {
            debug!(action = request.action(), "no table; skipping");
            return None;
        }

        let action = request.action();
        match self.exchange(&request, expect_reply).await {
            Ok(response) => response,
            Err(ClientError::Unavailable(endpoint)) => {
                debug!(action, %endpoint, "storage server isn't running");
                None
            }
            Err(error) => {
                warn!(action, %error, "request failed");
                None
            }
        }
    }

    async fn exchange(
        &self,
        request: &Request,
        expect_reply: bool,
    ) -> Result<Option<Response>, ClientError> {
        let mut stream = self.endpoint.connect().await.map_err(|error| {
            match error.kind() {
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound => {
                    ClientError::Unavailable(self.endpoint.to_string())
                }
                _ => ClientError::Transport(TransportError::Io(error)),
            }
        })?;

        send_message(&mut stream, &request.encode()?, &self.framing).await?;
        if !expect_reply {
            return Ok(None);
        }

        match recv_message(&mut stream, &self.framing).await {
            Ok(raw) => Ok(Some(Response::decode(&raw)?)),
            // The server hangs up without a reply when it has nothing to say.
            Err(TransportError::Closed) => Ok(None),
            Err(error) => Err(error.into()),
        }
    }
}

/// Saturates instead of panicking: huge or infinite values never expire,
/// negative or NaN values expire at once.
fn hours(value: f64) -> Duration {
    let secs = value * 3600.0;
    Duration::try_from_secs_f64(secs).unwrap_or(if secs > 0.0 {
        Duration::MAX
    } else {
        Duration::ZERO
    })
}
