//! Printer session: handshake, keepalive, notifications, and commands.
//!
//! A [`Client`] owns one [`jsonrpc::Client`] and drives the printer-facing
//! lifecycle: connect (locally or through a Reflector relay), handshake,
//! install the notification subscriptions, run the keepalive supervisor,
//! and expose the command wrappers. A session is either connected or
//! terminally disconnected; there is no reconnect.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncRead;
use tokio::sync::oneshot;

use crate::camera::{CameraFrame, CameraFrameMetadata, CAMERA_HEADER_SIZE};
use crate::error::{Error, Result};
use crate::jsonrpc::{self, EmptyParams};
use crate::types::{Printer, PrinterMetadata, PrinterProcess};
use crate::{auth, reflector, transfer};

/// Default JSON-RPC port of a MakerBot printer.
pub const DEFAULT_PORT: &str = "9999";

/// Default deadline for the keepalive ping.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between keepalive pings.
const PING_INTERVAL: Duration = Duration::from_secs(10);

/// Session configuration.
///
/// The auth client id/secret are the values MakerBot hard-codes into its
/// own software; they are configuration here so staging setups can
/// override them.
#[derive(Debug, Clone)]
pub struct Config {
    /// Printer IPv4 address (or hostname).
    pub ip: String,
    /// JSON-RPC TCP port.
    pub port: String,
    /// Keepalive ping deadline.
    pub timeout: Duration,
    /// Log raw wire traffic at debug level.
    pub verbose: bool,
    /// Client id for the printer's HTTP auth endpoint.
    pub client_id: String,
    /// Client secret for the printer's HTTP auth endpoint.
    pub client_secret: String,
}

impl Config {
    /// Configuration for the printer at `ip` with all defaults.
    pub fn new(ip: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: DEFAULT_PORT.to_string(),
            timeout: DEFAULT_PING_TIMEOUT,
            verbose: false,
            client_id: "MakerWare".to_string(),
            client_secret: "secret".to_string(),
        }
    }
}

type StateChangeHandler =
    Arc<dyn Fn(Option<Arc<PrinterMetadata>>, Option<Arc<PrinterMetadata>>) + Send + Sync>;
type CameraFrameHandler = Arc<dyn Fn(CameraFrame) + Send + Sync>;
type DisconnectHandler = Box<dyn FnOnce() + Send>;

/// A session with one MakerBot printer.
///
/// Command calls block until the printer replies, so long-running
/// operations (e.g. [`load_filament`](Self::load_filament)) hold their
/// caller for the duration.
pub struct Client {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: Config,
    /// Set exactly once, at connect time; a disconnected session is
    /// terminal, so there is no reset path.
    rpc: OnceLock<jsonrpc::Client>,
    connected: AtomicBool,
    /// Guards the disconnect handler so the keepalive and read-error paths
    /// cannot both fire it.
    disconnect_fired: AtomicBool,
    printer: RwLock<Option<Printer>>,
    metadata: RwLock<Option<Arc<PrinterMetadata>>>,
    state_handlers: Mutex<Vec<StateChangeHandler>>,
    camera_handlers: Mutex<Vec<CameraFrameHandler>>,
    camera_oneshot: Mutex<Option<oneshot::Sender<CameraFrame>>>,
    disconnect_cb: Mutex<Option<DisconnectHandler>>,
    /// Serializes the keepalive ping against file-upload blocks.
    op_lock: tokio::sync::Mutex<()>,
}

#[derive(Deserialize)]
struct StateNotificationParams {
    #[serde(default)]
    info: Option<PrinterMetadata>,
}

#[derive(Serialize)]
struct ToolIndexParams {
    tool_index: i64,
}

#[derive(Serialize)]
struct ProcessMethodParams<'a> {
    method: &'a str,
}

#[derive(Serialize)]
struct MachineNameParams<'a> {
    machine_name: &'a str,
}

#[derive(Serialize)]
struct AccessTokenParams<'a> {
    access_token: &'a str,
}

#[derive(Serialize)]
struct AuthPacketParams<'a> {
    call_id: &'a str,
    client_code: &'a str,
    printer_id: &'a str,
}

#[derive(Serialize)]
struct PrintParams<'a> {
    filepath: &'a str,
    transfer_wait: bool,
}

impl Client {
    /// Create a session for the printer named by `config`. No I/O happens
    /// until one of the connect methods is called.
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                rpc: OnceLock::new(),
                connected: AtomicBool::new(false),
                disconnect_fired: AtomicBool::new(false),
                printer: RwLock::new(None),
                metadata: RwLock::new(None),
                state_handlers: Mutex::new(Vec::new()),
                camera_handlers: Mutex::new(Vec::new()),
                camera_oneshot: Mutex::new(None),
                disconnect_cb: Mutex::new(None),
                op_lock: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Shorthand for [`Client::new`] with default configuration.
    pub fn with_ip(ip: impl Into<String>) -> Self {
        Self::new(Config::new(ip))
    }

    /// Register `callback`, fired exactly once when the session transitions
    /// to Disconnected (keepalive failure or socket read error).
    ///
    /// At that point the session is unusable; create a new one to
    /// reconnect.
    pub fn on_disconnect<F: FnOnce() + Send + 'static>(&self, callback: F) {
        *self.inner.disconnect_cb.lock().unwrap() = Some(Box::new(callback));
    }

    /// Connect to the printer on the local network and perform the
    /// handshake. Authenticate afterwards with one of the
    /// `authenticate_*` methods.
    pub async fn connect(&self) -> Result<()> {
        let ip = self.inner.config.ip.clone();
        let port = self.inner.config.port.clone();
        self.connect_transport(&ip, &port).await?;
        self.handshake().await
    }

    /// Connect to the printer through a MakerBot Reflector relay.
    ///
    /// Authentication is carried by the Thingiverse `access_token`, so no
    /// further authentication call is needed afterwards.
    pub async fn connect_remote(&self, printer_id: &str, access_token: &str) -> Result<()> {
        let reflector = reflector::Client::new(access_token);
        let call = reflector.call_printer(printer_id).await?;
        let (ip, port) = call.relay_addr()?;

        self.connect_transport(&ip, &port).await?;

        let accepted: Option<bool> = self
            .call(
                "auth_packet",
                AuthPacketParams {
                    call_id: &call.call.id,
                    client_code: &call.call.client_code,
                    printer_id,
                },
            )
            .await?;
        if !accepted.unwrap_or(false) {
            return Err(Error::AuthRefused(
                "printer rejected the Reflector call credentials".to_string(),
            ));
        }

        self.handshake().await
    }

    async fn connect_transport(&self, ip: &str, port: &str) -> Result<()> {
        if self.inner.rpc.get().is_some() {
            return Err(Error::Protocol(
                "session already connected; disconnected sessions are terminal".to_string(),
            ));
        }

        let rpc = jsonrpc::Client::new(ip, port);
        rpc.set_verbose(self.inner.config.verbose);

        let weak = Arc::downgrade(&self.inner);
        rpc.on_read_error(move |err| {
            tracing::warn!(%err, "printer connection lost");
            if let Some(inner) = weak.upgrade() {
                inner.mark_disconnected();
            }
        });

        rpc.connect().await?;
        let _ = self.inner.rpc.set(rpc);
        self.inner.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn handshake(&self) -> Result<()> {
        let printer: Printer = self.call("handshake", EmptyParams {}).await?;
        tracing::debug!(
            machine_name = %printer.machine_name,
            bot_type = %printer.bot_type,
            firmware = %printer.firmware_version,
            "handshake complete"
        );
        *self.inner.printer.write().unwrap() = Some(printer);

        self.install_subscriptions()?;
        self.spawn_keepalive();
        Ok(())
    }

    fn install_subscriptions(&self) -> Result<()> {
        let rpc = self.inner.rpc()?;

        // system_notification and state_notification carry the same payload
        // and feed the same metadata cell.
        for method in ["system_notification", "state_notification"] {
            let weak = Arc::downgrade(&self.inner);
            rpc.subscribe(method, move |params| {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.handle_state_notification(params);
                    }
                }
            })?;
        }

        let weak = Arc::downgrade(&self.inner);
        rpc.subscribe_raw("camera_frame", move |_params, raw| {
            let weak = weak.clone();
            async move {
                let Some(inner) = weak.upgrade() else { return };
                if let Err(err) = inner.handle_camera_frame(raw).await {
                    tracing::warn!(%err, "failed to receive camera frame");
                }
            }
        })?;

        Ok(())
    }

    fn spawn_keepalive(&self) {
        let weak = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                let Some(inner) = weak.upgrade() else { break };
                if !inner.connected.load(Ordering::SeqCst) {
                    break;
                }
                let Some(rpc) = inner.rpc.get().cloned() else { break };

                {
                    let _op = inner.op_lock.lock().await;
                    let ping = rpc.call::<_, Option<bool>>("ping", EmptyParams {});
                    match tokio::time::timeout(inner.config.timeout, ping).await {
                        Ok(Ok(_)) => {}
                        Ok(Err(err)) => {
                            tracing::warn!(%err, "keepalive ping failed");
                            inner.mark_disconnected();
                            rpc.close().await;
                            break;
                        }
                        Err(_) => {
                            tracing::warn!(
                                timeout_ms = inner.config.timeout.as_millis() as u64,
                                "keepalive ping timed out"
                            );
                            inner.mark_disconnected();
                            rpc.close().await;
                            break;
                        }
                    }
                }

                drop(inner);
                tokio::time::sleep(PING_INTERVAL).await;
            }
        });
    }

    /// Whether the session is connected. Once false, it stays false.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Printer descriptor captured during the handshake.
    pub fn printer(&self) -> Option<Printer> {
        self.inner.printer.read().unwrap().clone()
    }

    /// Latest metadata snapshot from the printer's state notifications.
    pub fn metadata(&self) -> Option<Arc<PrinterMetadata>> {
        self.inner.metadata.read().unwrap().clone()
    }

    /// Register `callback` for printer state changes; it receives the
    /// previous and new metadata snapshots. Handlers run concurrently and
    /// the session does not wait for them.
    pub fn handle_state_change<F>(&self, callback: F)
    where
        F: Fn(Option<Arc<PrinterMetadata>>, Option<Arc<PrinterMetadata>>) + Send + Sync + 'static,
    {
        self.inner
            .state_handlers
            .lock()
            .unwrap()
            .push(Arc::new(callback));
    }

    /// Register `callback` for streamed camera frames. Registering the
    /// first handler asks the printer to start streaming.
    pub async fn handle_camera_frame<F>(&self, callback: F) -> Result<()>
    where
        F: Fn(CameraFrame) + Send + Sync + 'static,
    {
        let first = {
            let mut handlers = self.inner.camera_handlers.lock().unwrap();
            handlers.push(Arc::new(callback));
            handlers.len() == 1
        };
        if first {
            self.inner
                .rpc()?
                .call_no_reply("request_camera_stream", EmptyParams {})
                .await?;
        }
        Ok(())
    }

    /// Request a single camera frame and wait for it to arrive.
    pub async fn get_camera_frame(&self) -> Result<CameraFrame> {
        let (tx, rx) = oneshot::channel();
        *self.inner.camera_oneshot.lock().unwrap() = Some(tx);

        let giving: Option<bool> = self.call("request_camera_frame", EmptyParams {}).await?;
        if !giving.unwrap_or(false) {
            self.inner.camera_oneshot.lock().unwrap().take();
            return Err(Error::Protocol(
                "printer refused to provide a camera frame".to_string(),
            ));
        }

        rx.await.map_err(|_| Error::Disconnected)
    }

    // ------------------------------------------------------------------
    // Command wrappers
    // ------------------------------------------------------------------

    /// Begin loading filament into the extruder at `tool_index`.
    pub async fn load_filament(&self, tool_index: i64) -> Result<PrinterProcess> {
        self.call("load_filament", ToolIndexParams { tool_index })
            .await
    }

    /// Begin unloading filament from the extruder at `tool_index`.
    pub async fn unload_filament(&self, tool_index: i64) -> Result<Value> {
        self.call("unload_filament", ToolIndexParams { tool_index })
            .await
    }

    /// Cancel the current process, if any. Fails with a remote error when
    /// the process is not cancellable.
    pub async fn cancel(&self) -> Result<Value> {
        self.call("cancel", EmptyParams {}).await
    }

    /// Send a `process_method` request for `method` to the current process.
    pub async fn process_method(&self, method: &str) -> Result<Value> {
        self.call("process_method", ProcessMethodParams { method })
            .await
    }

    /// Suspend the current process. Reversed by [`resume`](Self::resume).
    pub async fn suspend(&self) -> Result<Value> {
        self.process_method("suspend").await
    }

    /// Resume a suspended process.
    pub async fn resume(&self) -> Result<Value> {
        self.process_method("resume").await
    }

    /// Change the printer's display name.
    pub async fn change_machine_name(&self, name: &str) -> Result<Value> {
        self.call("change_machine_name", MachineNameParams { machine_name: name })
            .await
    }

    /// Authenticate the RPC session with an access token obtained from the
    /// printer's HTTP endpoint.
    pub async fn authenticate(&self, access_token: &str) -> Result<Value> {
        self.call("authenticate", AccessTokenParams { access_token })
            .await
    }

    /// Authenticate by asking the printer for a token and waiting for the
    /// user to press the knob.
    pub async fn authenticate_locally(&self) -> Result<()> {
        let token = auth::local_access_token(
            &self.inner.config.ip,
            &self.inner.config.client_id,
            &self.inner.config.client_secret,
        )
        .await?;
        self.authenticate(&token).await?;
        Ok(())
    }

    /// Authenticate with a Thingiverse token/username pair. The Thingiverse
    /// account must already be authorized on the printer.
    pub async fn authenticate_with_thingiverse(&self, token: &str, username: &str) -> Result<()> {
        let access_token = auth::thingiverse_access_token(
            &self.inner.config.ip,
            &self.inner.config.client_id,
            &self.inner.config.client_secret,
            token,
            username,
        )
        .await?;
        self.authenticate(&access_token).await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // File transfer
    // ------------------------------------------------------------------

    /// Upload `size` bytes from `reader` to `remote_path` on the printer.
    pub async fn put_file<R: AsyncRead + Unpin>(
        &self,
        remote_path: &str,
        reader: R,
        size: u64,
    ) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        transfer::upload(
            self.inner.rpc()?,
            &self.inner.op_lock,
            remote_path,
            reader,
            size,
        )
        .await
    }

    /// Print a `.makerbot` file: announce the print, confirm the build
    /// plate is clear, then upload the file contents. Returns when the
    /// entire file has been sent; watch
    /// [`handle_state_change`](Self::handle_state_change) for progress.
    pub async fn print<R: AsyncRead + Unpin>(
        &self,
        filename: &str,
        reader: R,
        size: u64,
    ) -> Result<()> {
        self.call_no_reply(
            "print",
            PrintParams {
                filepath: filename,
                transfer_wait: true,
            },
        )
        .await?;
        self.call_no_reply(
            "process_method",
            ProcessMethodParams {
                method: "build_plate_cleared",
            },
        )
        .await?;

        let remote_path = format!("/current_thing/{filename}");
        self.put_file(&remote_path, reader, size).await
    }

    /// Convenience wrapper around [`print`](Self::print) that reads the
    /// file at `path`.
    pub async fn print_file(&self, path: &str) -> Result<()> {
        let file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();
        let filename = std::path::Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string());
        self.print(&filename, file, size).await
    }

    /// Close the session deliberately. Does not fire the disconnect
    /// handler.
    pub async fn close(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        // Suppress the disconnect handler for the self-inflicted teardown.
        self.inner.disconnect_fired.store(true, Ordering::SeqCst);
        if let Some(rpc) = self.inner.rpc.get() {
            rpc.close().await;
        }
    }

    async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.inner.rpc()?.call(method, params).await
    }

    async fn call_no_reply<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        self.inner.rpc()?.call_no_reply(method, params).await
    }
}

impl SessionInner {
    fn rpc(&self) -> Result<&jsonrpc::Client> {
        self.rpc.get().ok_or(Error::NotConnected)
    }

    /// Transition to Disconnected and fire the handler, at most once.
    fn mark_disconnected(self: &Arc<Self>) {
        self.connected.store(false, Ordering::SeqCst);
        if self.disconnect_fired.swap(true, Ordering::SeqCst) {
            return;
        }
        let callback = self.disconnect_cb.lock().unwrap().take();
        if let Some(callback) = callback {
            callback();
        }
    }

    fn handle_state_notification(self: &Arc<Self>, params: Value) {
        let info = match serde_json::from_value::<StateNotificationParams>(params) {
            Ok(notification) => notification.info.map(Arc::new),
            Err(err) => {
                tracing::debug!(%err, "dropping malformed state notification");
                return;
            }
        };

        let old = {
            let mut slot = self.metadata.write().unwrap();
            std::mem::replace(&mut *slot, info.clone())
        };

        let handlers = self.state_handlers.lock().unwrap().clone();
        for handler in handlers {
            let old = old.clone();
            let new = info.clone();
            tokio::spawn(async move { handler(old, new) });
        }
    }

    /// Runs inside the `camera_frame` subscription callback (off the reader
    /// task): pull the 16-byte header and the payload off the stream, then
    /// fan the frame out.
    async fn handle_camera_frame(self: &Arc<Self>, mut raw: jsonrpc::RawReader) -> Result<()> {
        let header = raw.read(CAMERA_HEADER_SIZE).await?;
        let metadata = CameraFrameMetadata::unpack(&header)?;
        let data = raw.read(metadata.file_size as usize).await?;
        drop(raw);

        let rpc = self.rpc()?;
        let oneshot_tx = self.camera_oneshot.lock().unwrap().take();
        let handlers = self.camera_handlers.lock().unwrap().clone();

        if oneshot_tx.is_none() && handlers.is_empty() {
            // Nobody is watching anymore; stop the stream.
            let rpc = rpc.clone();
            tokio::spawn(async move {
                if let Err(err) = rpc.call_no_reply("end_camera_stream", EmptyParams {}).await {
                    tracing::debug!(%err, "failed to end camera stream");
                }
            });
        }

        let frame = CameraFrame { data, metadata };
        if let Some(tx) = oneshot_tx {
            let _ = tx.send(frame.clone());
        }
        for handler in handlers {
            let frame = frame.clone();
            tokio::spawn(async move { handler(frame) });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = Config::new("192.168.1.50");
        assert_eq!(config.ip, "192.168.1.50");
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.timeout, DEFAULT_PING_TIMEOUT);
        assert!(!config.verbose);
        assert_eq!(config.client_id, "MakerWare");
        assert_eq!(config.client_secret, "secret");
    }

    #[tokio::test]
    async fn test_commands_fail_synchronously_when_never_connected() {
        let client = Client::with_ip("127.0.0.1");
        assert!(!client.is_connected());
        assert!(matches!(
            client.cancel().await.unwrap_err(),
            Error::NotConnected
        ));
        assert!(matches!(
            client.load_filament(0).await.unwrap_err(),
            Error::NotConnected
        ));
        assert!(matches!(
            client.put_file("/x", &b"data"[..], 4).await.unwrap_err(),
            Error::NotConnected
        ));
    }

    #[test]
    fn test_printer_and_metadata_empty_before_connect() {
        let client = Client::with_ip("127.0.0.1");
        assert!(client.printer().is_none());
        assert!(client.metadata().is_none());
    }
}
