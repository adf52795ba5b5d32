//! Unix socket control API.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::protocol::{MAX_REQUEST_LINE, Request, Response, StatusInfo};
use crate::store::{Access, Observation, PropertyStore, PropertyValue};

/// Shared daemon context passed to every connection handler.
#[derive(Clone)]
pub struct ServerState {
    pub store: Arc<Mutex<PropertyStore>>,
    /// Queue of the instrumentation thread. `None` without rendezvous.
    pub observations: Option<SyncSender<Observation>>,
    pub observations_sent: Arc<AtomicU64>,
    pub rendezvous: Option<String>,
    pub pid: u32,
}

impl ServerState {
    pub fn new(store: PropertyStore) -> Self {
        Self {
            store: Arc::new(Mutex::new(store)),
            observations: None,
            observations_sent: Arc::new(AtomicU64::new(0)),
            rendezvous: None,
            pid: std::process::id(),
        }
    }

    pub fn with_observer(
        mut self,
        sender: SyncSender<Observation>,
        sent: Arc<AtomicU64>,
        rendezvous: impl Into<String>,
    ) -> Self {
        self.observations = Some(sender);
        self.observations_sent = sent;
        self.rendezvous = Some(rendezvous.into());
        self
    }

    /// Apply one request. Observations are queued while the store lock is
    /// held so their order matches the order of client accesses.
    pub fn dispatch(&self, request: Request) -> Response {
        let Ok(mut store) = self.store.lock() else {
            return Response::error("property store unavailable");
        };
        let result = match request {
            Request::Put { address, value } => store.put(&address, &value),
            Request::PutArray { address, source } => store.put_array(&address, &source),
            Request::Get { address } => store.get(&address),
            Request::GetArray { address } => store.get_array(&address),
            Request::Status => {
                let counters = store.counters();
                let info = StatusInfo {
                    pid: self.pid,
                    version: env!("CARGO_PKG_VERSION").to_string(),
                    properties: store.len(),
                    get_counter: counters.get,
                    set_counter: counters.set,
                    observations_sent: self.observations_sent.load(Ordering::Relaxed),
                    rendezvous: self.rendezvous.clone(),
                };
                return match serde_json::to_string(&info) {
                    Ok(json) => Response::value(json),
                    Err(e) => Response::error(e.to_string()),
                };
            }
        };
        match result {
            Ok(access) => self.respond(access),
            Err(e) => {
                debug!(error = %e, "Request rejected");
                Response::error(e.to_string())
            }
        }
    }

    fn respond(&self, access: Access) -> Response {
        if let Some(observation) = access.observation {
            match &self.observations {
                Some(queue) => match queue.try_send(observation) {
                    Ok(()) => {}
                    Err(TrySendError::Full(observation)) => warn!(
                        source = %observation.source,
                        "Observation queue full, observation dropped"
                    ),
                    Err(TrySendError::Disconnected(_)) => {
                        warn!("Instrumentation thread gone, observation dropped")
                    }
                },
                None => debug!(
                    source = %observation.source,
                    "Rendezvous disabled, observation dropped"
                ),
            }
        }
        match access.reply {
            PropertyValue::IntArray(elements) => {
                Response::values(elements.iter().map(ToString::to_string).collect())
            }
            scalar => Response::value(scalar.render()),
        }
    }
}

/// Accept connections until the listener fails.
pub async fn serve(listener: UnixListener, state: ServerState) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, state).await {
                        warn!("Connection error: {}", e);
                    }
                });
            }
            Err(e) => {
                warn!("Accept error: {}", e);
            }
        }
    }
}

/// Answer request lines until the client closes its side. An oversized
/// line is answered with an error and ends the connection.
pub async fn handle_connection(stream: UnixStream, state: ServerState) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();

    loop {
        line.clear();
        let n = (&mut reader)
            .take(MAX_REQUEST_LINE as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(());
        }
        if line.len() > MAX_REQUEST_LINE {
            warn!(limit = MAX_REQUEST_LINE, "Oversized request, closing connection");
            let response = Response::error(format!("request exceeds {MAX_REQUEST_LINE} bytes"));
            write_response(&mut writer, &response).await?;
            return Ok(());
        }
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let response = match serde_json::from_slice::<Request>(&line) {
            Ok(request) => {
                debug!(?request, "Request");
                let state = state.clone();
                tokio::task::spawn_blocking(move || state.dispatch(request)).await?
            }
            Err(e) => Response::error(format!("malformed request: {e}")),
        };
        write_response(&mut writer, &response).await?;
    }
}

async fn write_response(writer: &mut OwnedWriteHalf, response: &Response) -> Result<()> {
    let mut encoded = serde_json::to_vec(response)?;
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await?;
    Ok(())
}
