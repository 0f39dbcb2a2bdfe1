use std::{collections::BTreeMap, sync::Arc};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use crate::{
    config::FramingConfig,
    error::{StoreError, TransportError},
    host::Clock,
    lock::LockManager,
    message::{Request, Response, preview, stored_text},
    store::Store,
    transport::{recv_message, send_message},
};

/// Routes decoded requests to the store and lock manager.
///
/// Owns the only store handle of the process. Storage failures never escape:
/// they are logged and the request degrades to "no response", which clients
/// read as an empty result.
pub struct Dispatcher {
    store: Store,
    locks: LockManager,
    clock: Arc<dyn Clock>,
}

impl Dispatcher {
    /// Stale-lock cutoff is the moment the dispatcher is created.
    pub fn new(store: Store, clock: Arc<dyn Clock>) -> Self {
        let locks = LockManager::new(clock.now());
        Self {
            store,
            locks,
            clock,
        }
    }

    pub fn started_at(&self) -> f64 {
        self.locks.started_at()
    }

    /// Receives one request from `stream`, runs it, and replies if there is a result.
    pub async fn serve<S>(&mut self, stream: &mut S, framing: &FramingConfig) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let raw = recv_message(stream, framing).await?;
        debug!(len = raw.len(), payload = %preview(&raw), "received request");

        let request = Request::decode(&raw);
        let Some(response) = self.handle(request) else {
            return Ok(());
        };

        match response.encode() {
            Ok(encoded) => {
                debug!(len = encoded.len(), payload = %preview(&encoded), "sending response");
                send_message(stream, &encoded, framing).await
            }
            Err(error) => {
                warn!(%error, "could not encode response");
                Ok(())
            }
        }
    }

    pub fn handle(&mut self, request: Request) -> Option<Response> {
        let action = request.action();
        match request {
            Request::Get { table, name } => self
                .store
                .get(&table, &name)
                .map(|found| Response::Text(found.unwrap_or_default()))
                .or_log(action),
            Request::GetMulti { table, name, items } => self
                .store
                .get_multi(&table, &name, &items)
                .map(Response::List)
                .or_log(action),
            Request::Set { table, name, data } => {
                let _ = self.store.set(&table, &name, &stored_text(&data)).or_log(action);
                None
            }
            Request::SetMulti { table, name, data } => {
                let data: BTreeMap<String, String> = data
                    .iter()
                    .map(|(item, value)| (item.clone(), stored_text(value)))
                    .collect();
                let _ = self.store.set_multi(&table, &name, &data).or_log(action);
                None
            }
            Request::Del { table, name } => self
                .store
                .delete(&table, &name)
                .map(|_| Response::flag(true))
                .or_log(action),
            Request::Lock { table, name } => {
                let now = self.clock.now();
                self.locks
                    .lock(&mut self.store, &table, &name, now)
                    .map(Response::flag)
                    .or_log(action)
            }
            Request::Unlock { table, name } => self
                .locks
                .unlock(&mut self.store, &table, &name)
                .map(Response::flag)
                .or_log(action),
            Request::Stop | Request::Unknown => {
                debug!(action, "no handler; nothing to send");
                None
            }
        }
    }
}

trait OrLog<T> {
    fn or_log(self, action: &'static str) -> Option<T>;
}

impl<T> OrLog<T> for Result<T, StoreError> {
    fn or_log(self, action: &'static str) -> Option<T> {
        self.map_err(|error| warn!(action, %error, "storage operation failed"))
            .ok()
    }
}
