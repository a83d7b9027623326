/// Browser bridge: the TCP endpoint the extension-side shim connects to.
///
/// ```text
///   shim ──frames──▶ serve_client ──▶ forward_events ──WorkerEvent──▶ TabWorker
///                        │  ▲          (unbounded)
///                        │  └── CallResult → pending[call_id] (oneshot)
///                        ▼
///   shim ◀──frames── out_rx ◀── BridgeHandle::{call, cast} ◀── TabWorker
/// ```
///
/// The reader never waits on the worker queue: the worker may itself be
/// parked in `call` until this reader delivers the matching `CallResult`.
/// One shim connection is live at a time; a newer `Hello` takes over.
/// `BridgeHandle` is cheaply cloneable and implements the `Browser`,
/// `Injector` and `BrowserAction` contracts on top of the live connection.
use async_trait::async_trait;
use scrobbler_proto::protocol::{
    ActionView, BrowserCall, CallOutcome, ConnectorInfo, ExtensionEvent, FromBrowser,
    InjectResult, MenuItem, Message, TabId, TabMessage, ToBrowser, MAX_FRAME_LEN,
    PROTOCOL_VERSION,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::browser::{BridgeError, Browser, BrowserAction, Injector};
use crate::worker::WorkerEvent;

// ── handle ────────────────────────────────────────────────────────────────────

#[derive(Clone)]
struct Connection {
    id: usize,
    tx: mpsc::Sender<ToBrowser>,
}

struct BridgeInner {
    connection: RwLock<Option<Connection>>,
    /// call_id → reply channel.  Inserted by `call`, resolved by the reader.
    pending: Mutex<HashMap<u64, oneshot::Sender<CallOutcome>>>,
    next_call_id: AtomicU64,
    call_timeout: Duration,
}

#[derive(Clone)]
pub struct BridgeHandle {
    inner: Arc<BridgeInner>,
}

impl BridgeHandle {
    pub fn new(call_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BridgeInner {
                connection: RwLock::new(None),
                pending: Mutex::new(HashMap::new()),
                next_call_id: AtomicU64::new(1),
                call_timeout,
            }),
        }
    }

    async fn sender(&self) -> Result<mpsc::Sender<ToBrowser>, BridgeError> {
        self.inner
            .connection
            .read()
            .await
            .as_ref()
            .map(|c| c.tx.clone())
            .ok_or(BridgeError::Disconnected)
    }

    fn next_call_id(&self) -> u64 {
        self.inner.next_call_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a frame for the shim, giving up after the call timeout when
    /// the connection stops draining.
    async fn send_frame(
        &self,
        tx: &mpsc::Sender<ToBrowser>,
        frame: ToBrowser,
        method: &'static str,
    ) -> Result<(), BridgeError> {
        match tokio::time::timeout(self.inner.call_timeout, tx.send(frame)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(BridgeError::ChannelClosed),
            Err(_) => Err(BridgeError::Timeout {
                method,
                timeout_ms: self.inner.call_timeout.as_millis() as u64,
            }),
        }
    }

    /// Send a call without waiting for its result.
    async fn cast(&self, call: BrowserCall) -> Result<(), BridgeError> {
        let tx = self.sender().await?;
        let call_id = self.next_call_id();
        let method = call.method();
        debug!("bridge: cast {} id={}", method, call_id);
        self.send_frame(&tx, ToBrowser::Call { call_id, call }, method)
            .await
    }

    /// Send a call and wait for the shim to report its outcome.
    async fn call(&self, call: BrowserCall) -> Result<serde_json::Value, BridgeError> {
        let tx = self.sender().await?;
        let call_id = self.next_call_id();
        let method = call.method();

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().await.insert(call_id, reply_tx);

        debug!("bridge: call {} id={}", method, call_id);
        if let Err(e) = self
            .send_frame(&tx, ToBrowser::Call { call_id, call }, method)
            .await
        {
            self.inner.pending.lock().await.remove(&call_id);
            return Err(e);
        }

        let outcome = match tokio::time::timeout(self.inner.call_timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            // Reply sender dropped: the connection went away.
            Ok(Err(_)) => return Err(BridgeError::Disconnected),
            Err(_) => {
                self.inner.pending.lock().await.remove(&call_id);
                return Err(BridgeError::Timeout {
                    method,
                    timeout_ms: self.inner.call_timeout.as_millis() as u64,
                });
            }
        };

        match outcome {
            CallOutcome::Ok { value } => Ok(value),
            CallOutcome::Error { message } => Err(BridgeError::Remote(message)),
        }
    }

    async fn resolve_call(&self, call_id: u64, outcome: CallOutcome) {
        match self.inner.pending.lock().await.remove(&call_id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            // Results of casts land here too.
            None => debug!("bridge: result for untracked call id={}", call_id),
        }
    }

    async fn attach(&self, id: usize, tx: mpsc::Sender<ToBrowser>) {
        let previous = self
            .inner
            .connection
            .write()
            .await
            .replace(Connection { id, tx });
        if let Some(previous) = previous {
            info!("bridge: client {} replaces client {}", id, previous.id);
            self.fail_pending().await;
        }
    }

    /// Returns true when `id` was the live connection.
    async fn detach(&self, id: usize) -> bool {
        let mut connection = self.inner.connection.write().await;
        if connection.as_ref().map(|c| c.id) != Some(id) {
            return false;
        }
        *connection = None;
        drop(connection);
        self.fail_pending().await;
        true
    }

    /// Dropping the reply senders fails every waiter with `Disconnected`.
    async fn fail_pending(&self) {
        let mut pending = self.inner.pending.lock().await;
        if !pending.is_empty() {
            debug!("bridge: failing {} pending calls", pending.len());
        }
        pending.clear();
    }
}

#[async_trait]
impl Injector for BridgeHandle {
    async fn inject(
        &self,
        tab_id: TabId,
        connector: &ConnectorInfo,
    ) -> Result<InjectResult, BridgeError> {
        let value = self
            .call(BrowserCall::Inject {
                tab_id,
                connector: connector.clone(),
            })
            .await?;
        serde_json::from_value(value).map_err(|source| BridgeError::BadReply {
            method: "inject",
            source,
        })
    }
}

#[async_trait]
impl Browser for BridgeHandle {
    async fn current_tab_id(&self) -> Result<TabId, BridgeError> {
        let value = self.call(BrowserCall::CurrentTab).await?;
        if value.is_null() {
            return Ok(TabId::NO_TAB);
        }
        serde_json::from_value(value).map_err(|source| BridgeError::BadReply {
            method: "current_tab",
            source,
        })
    }

    async fn send_to_tab(&self, tab_id: TabId, message: TabMessage) -> Result<(), BridgeError> {
        self.cast(BrowserCall::SendToTab { tab_id, message }).await
    }

    async fn remove_all_menu_items(&self) -> Result<(), BridgeError> {
        self.cast(BrowserCall::RemoveAllMenuItems).await
    }

    async fn create_menu_item(&self, item: MenuItem) -> Result<(), BridgeError> {
        self.cast(BrowserCall::CreateMenuItem { item }).await
    }

    async fn notify(&self, event: ExtensionEvent) -> Result<(), BridgeError> {
        self.cast(BrowserCall::Notify { event }).await
    }
}

#[async_trait]
impl BrowserAction for BridgeHandle {
    async fn update(&self, tab_id: TabId, view: ActionView) -> Result<(), BridgeError> {
        self.cast(BrowserCall::UpdateAction { tab_id, view }).await
    }

    async fn update_love(&self, tab_id: TabId, is_loved: bool) -> Result<(), BridgeError> {
        self.cast(BrowserCall::UpdateLove { tab_id, is_loved }).await
    }

    async fn reset(&self) -> Result<(), BridgeError> {
        self.cast(BrowserCall::ResetAction).await
    }
}

// ── server ────────────────────────────────────────────────────────────────────

static NEXT_CLIENT_ID: AtomicUsize = AtomicUsize::new(1);

pub fn start_server(
    bind_address: String,
    port: u16,
    handle: BridgeHandle,
    event_tx: mpsc::Sender<WorkerEvent>,
    log_tx: broadcast::Sender<String>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let addr = format!("{}:{}", bind_address, port);

        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind bridge socket {}: {}", addr, e);
                return;
            }
        };

        info!("Bridge listening at {}", addr);

        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let id = NEXT_CLIENT_ID.fetch_add(1, Ordering::Relaxed);
                    info!("Bridge client {} connected from {}", id, peer);

                    tokio::spawn(handle_client(
                        stream,
                        id,
                        handle.clone(),
                        event_tx.clone(),
                        log_tx.subscribe(),
                    ));
                }
                Err(e) => {
                    error!("Failed to accept bridge connection: {}", e);
                }
            }
        }
    })
}

async fn handle_client(
    stream: TcpStream,
    client_id: usize,
    handle: BridgeHandle,
    event_tx: mpsc::Sender<WorkerEvent>,
    log_rx: broadcast::Receiver<String>,
) {
    let (forward_tx, forward_rx) = mpsc::unbounded_channel();
    let forwarder = tokio::spawn(forward_events(forward_rx, event_tx.clone()));

    serve_client(stream, client_id, &handle, &forward_tx, log_rx).await;

    // Fail pending calls first so a worker parked in `call` can get back to
    // draining what this client already queued.
    let was_live = handle.detach(client_id).await;
    drop(forward_tx);
    let _ = forwarder.await;
    if was_live {
        let _ = event_tx.send(WorkerEvent::BrowserDisconnected).await;
    }
    info!("Bridge client {} disconnected", client_id);
}

/// Feed one client's events into the worker queue in arrival order.
async fn forward_events(
    mut rx: mpsc::UnboundedReceiver<WorkerEvent>,
    event_tx: mpsc::Sender<WorkerEvent>,
) {
    while let Some(event) = rx.recv().await {
        if event_tx.send(event).await.is_err() {
            warn!("WorkerEvent channel closed");
            break;
        }
    }
}

async fn serve_client(
    stream: TcpStream,
    client_id: usize,
    handle: &BridgeHandle,
    forward_tx: &mpsc::UnboundedSender<WorkerEvent>,
    mut log_rx: broadcast::Receiver<String>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::channel::<ToBrowser>(256);
    let mut tmp = [0u8; 4096];
    let mut read_buf: Vec<u8> = Vec::new();
    let mut greeted = false;
    let mut logs_open = true;

    loop {
        tokio::select! {
            result = read_half.read(&mut tmp) => {
                match result {
                    Ok(0) => {
                        info!("Bridge client {} closed connection", client_id);
                        break;
                    }
                    Ok(n) => {
                        read_buf.extend_from_slice(&tmp[..n]);

                        while let Some(frame_len) = Message::frame_len(&read_buf) {
                            let frame: Vec<u8> = read_buf.drain(..frame_len).collect();
                            let msg = match Message::decode(&frame) {
                                Ok((Message::FromBrowser(msg), _)) => msg,
                                Ok((Message::ToBrowser(_), _)) => {
                                    debug!("Bridge client {} echoed a daemon frame", client_id);
                                    continue;
                                }
                                Err(e) => {
                                    warn!("Bridge client {} sent a malformed frame: {}", client_id, e);
                                    continue;
                                }
                            };

                            let keep_going = dispatch(
                                msg,
                                client_id,
                                &mut greeted,
                                handle,
                                forward_tx,
                                &out_tx,
                            )
                            .await;
                            if !keep_going {
                                return;
                            }
                        }

                        if declared_len(&read_buf).is_some_and(|len| len > MAX_FRAME_LEN) {
                            error!("Bridge client {} sent an oversized frame", client_id);
                            return;
                        }
                    }
                    Err(e) => {
                        error!("Read error from bridge client {}: {}", client_id, e);
                        break;
                    }
                }
            }

            Some(msg) = out_rx.recv() => {
                match Message::ToBrowser(msg).encode() {
                    Ok(encoded) => {
                        if write_half.write_all(&encoded).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => error!("Failed to encode bridge frame: {}", e),
                }
            }

            line = log_rx.recv(), if logs_open => {
                match line {
                    Ok(message) if greeted => {
                        let _ = out_tx.try_send(ToBrowser::Log { message });
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!("Bridge client {} missed {} log lines", client_id, n);
                    }
                    Err(broadcast::error::RecvError::Closed) => logs_open = false,
                }
            }
        }
    }
}

fn declared_len(data: &[u8]) -> Option<usize> {
    let header: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(header) as usize)
}

/// Route one browser frame.  Returns false when the connection must close.
async fn dispatch(
    msg: FromBrowser,
    client_id: usize,
    greeted: &mut bool,
    handle: &BridgeHandle,
    forward_tx: &mpsc::UnboundedSender<WorkerEvent>,
    out_tx: &mpsc::Sender<ToBrowser>,
) -> bool {
    let event = match msg {
        FromBrowser::Hello { protocol_version } => {
            if protocol_version != PROTOCOL_VERSION {
                warn!(
                    "Bridge client {} speaks protocol {}, expected {}",
                    client_id, protocol_version, PROTOCOL_VERSION
                );
                return false;
            }
            handle.attach(client_id, out_tx.clone()).await;
            *greeted = true;
            // This task drains `out_tx` itself, so it must not wait on it.
            let _ = out_tx.try_send(ToBrowser::Welcome {
                protocol_version: PROTOCOL_VERSION,
            });
            WorkerEvent::BrowserConnected
        }
        _ if !*greeted => {
            warn!("Bridge client {} sent a frame before hello", client_id);
            return true;
        }
        FromBrowser::CallResult { call_id, result } => {
            handle.resolve_call(call_id, result).await;
            return true;
        }
        FromBrowser::TabUpdated { tab_id, url } => WorkerEvent::TabUpdated { tab_id, url },
        FromBrowser::TabActivated { tab_id } => WorkerEvent::TabActivated(tab_id),
        FromBrowser::TabRemoved { tab_id } => WorkerEvent::TabRemoved(tab_id),
        FromBrowser::Command { command } => WorkerEvent::Command(command),
        FromBrowser::PortMessage { tab_id, event } => WorkerEvent::PortMessage { tab_id, event },
        FromBrowser::MenuClicked { item_id } => WorkerEvent::MenuClicked(item_id),
        FromBrowser::Request {
            request_id,
            tab_id,
            request,
        } => {
            let (reply_tx, reply_rx) = oneshot::channel();
            let out = out_tx.clone();
            tokio::spawn(async move {
                if let Ok(response) = reply_rx.await {
                    let _ = out.send(ToBrowser::Response { request_id, response }).await;
                }
            });
            WorkerEvent::Request {
                tab_id,
                request,
                reply: reply_tx,
            }
        }
    };

    if forward_tx.send(event).is_err() {
        warn!("Bridge client {}: worker is gone", client_id);
        return false;
    }
    true
}
