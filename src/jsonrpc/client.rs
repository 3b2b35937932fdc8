//! JSON-RPC multiplexer over a single long-lived TCP connection.
//!
//! One reader task pulls byte chunks off the socket and walks them through
//! the [`JsonFramer`] one frame at a time; every completed JSON value is
//! dispatched from that task, either to the pending call waiting on its
//! `id` or to the subscriber registered for its notification method.
//! Subscriber callbacks are spawned onto their own tasks so a slow handler
//! cannot stall framing.
//!
//! Notifications that herald binary data use [`Client::subscribe_raw`]: the
//! reader parks at the frame boundary and the callback's [`RawReader`]
//! pulls the announced bytes off the stream before JSON framing resumes,
//! so a payload arriving back-to-back with its announcement cannot be
//! misframed.
//!
//! All socket writes go through one async mutex; callers of [`Client::call`]
//! never see another call's response because the pending-call table is keyed
//! by a per-request UUID.

use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpSocket;
use tokio::sync::oneshot;
use uuid::Uuid;

use super::framer::JsonFramer;
use super::protocol::{Notification, Request, Response};
use crate::error::{Error, Result};

/// Socket read chunk size. The framer is byte-oriented, so the chunk size
/// only affects syscall count, not framing behavior.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Boxed future returned by subscriber callbacks.
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

enum Subscriber {
    Json(Arc<dyn Fn(Value) -> BoxFuture<()> + Send + Sync>),
    Raw(Arc<dyn Fn(Value, RawReader) -> BoxFuture<()> + Send + Sync>),
}

impl Clone for Subscriber {
    fn clone(&self) -> Self {
        match self {
            Self::Json(cb) => Self::Json(Arc::clone(cb)),
            Self::Raw(cb) => Self::Raw(Arc::clone(cb)),
        }
    }
}

type ReadErrorCallback = Box<dyn FnOnce(Error) + Send>;

/// A JSON-RPC client bound to one printer address.
///
/// Cheaply cloneable; all clones share the same connection.
#[derive(Clone)]
pub struct Client {
    ip: String,
    port: String,
    shared: Arc<Shared>,
}

struct Shared {
    framer: JsonFramer,
    connected: AtomicBool,
    verbose: AtomicBool,
    /// Write half of the socket; also serializes raw payload writes.
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// In-flight calls by request id.
    pending: Mutex<HashMap<String, oneshot::Sender<Response>>>,
    /// Notification subscribers by method name.
    subs: Mutex<HashMap<String, Subscriber>>,
    /// Invoked at most once, when the reader task hits a socket error.
    error_cb: Mutex<Option<ReadErrorCallback>>,
    /// Serializes standalone raw readers; held across the raw await so a
    /// second raw read blocks until the first completes.
    raw_gate: tokio::sync::Mutex<()>,
}

/// Exclusive access to the byte stream granted to a raw-heralding
/// notification callback.
///
/// While a `RawReader` is alive the reader task consumes nothing on its
/// own; each [`read`](Self::read) pulls exactly the requested bytes.
/// Dropping it resumes JSON framing, so it must not outlive the raw
/// segment of the stream.
pub struct RawReader {
    shared: Arc<Shared>,
}

impl RawReader {
    /// Read exactly `len` opaque bytes from the stream.
    pub async fn read(&mut self, len: usize) -> Result<Bytes> {
        let rx = self.shared.framer.begin_raw(len);
        rx.await.map_err(|_| Error::Disconnected)
    }
}

impl Drop for RawReader {
    fn drop(&mut self) {
        self.shared.framer.release();
    }
}

impl Client {
    /// Create a client for the printer at `ip:port`. No I/O happens until
    /// [`connect`](Self::connect).
    pub fn new(ip: impl Into<String>, port: impl Into<String>) -> Self {
        Self {
            ip: ip.into(),
            port: port.into(),
            shared: Arc::new(Shared {
                framer: JsonFramer::new(),
                connected: AtomicBool::new(false),
                verbose: AtomicBool::new(false),
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                subs: Mutex::new(HashMap::new()),
                error_cb: Mutex::new(None),
                raw_gate: tokio::sync::Mutex::new(()),
            }),
        }
    }

    /// Enable logging of raw wire traffic at debug level.
    pub fn set_verbose(&self, verbose: bool) {
        self.shared.verbose.store(verbose, Ordering::Relaxed);
    }

    /// Resolve the address, open the TCP connection with keepalive enabled,
    /// and spawn the reader task.
    pub async fn connect(&self) -> Result<()> {
        let addr = format!("{}:{}", self.ip, self.port);
        tracing::debug!(%addr, "resolving printer address");

        let target = tokio::net::lookup_host(&addr)
            .await?
            .next()
            .ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("no address found for {addr}"),
                ))
            })?;

        let socket = if target.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(true)?;

        tracing::debug!(%target, "dialing printer");
        let stream = socket.connect(target).await?;
        let (read_half, write_half) = stream.into_split();

        *self.shared.writer.lock().await = Some(write_half);
        self.shared.connected.store(true, Ordering::SeqCst);

        let shared = Arc::clone(&self.shared);
        tokio::spawn(read_loop(read_half, shared));

        Ok(())
    }

    /// Whether the connection is currently up. A disconnected client is
    /// terminal; create a new one to reconnect.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Register a callback fired exactly once when the reader task hits a
    /// socket error. Pending calls are aborted before the callback runs.
    pub fn on_read_error<F>(&self, callback: F)
    where
        F: FnOnce(Error) + Send + 'static,
    {
        *self.shared.error_cb.lock().unwrap() = Some(Box::new(callback));
    }

    /// Call `method` and await its correlated response, decoding `result`
    /// into `R`. A `null` (or absent) result decodes from JSON null.
    pub async fn call<P, R>(&self, method: &str, params: P) -> Result<R>
    where
        P: Serialize,
        R: DeserializeOwned,
    {
        let resp = self.round_trip(method, params).await?;
        if let Some(remote) = resp.error {
            return Err(Error::Remote(remote));
        }
        Ok(serde_json::from_value(resp.result.unwrap_or(Value::Null))?)
    }

    /// Call `method` without waiting for a reply. The request still carries
    /// an id; any response the printer sends for it is dropped.
    pub async fn call_no_reply<P: Serialize>(&self, method: &str, params: P) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_vec(&Request::new(&id, method, params))?;
        self.log_outbound(method, &payload);
        self.shared.write(&payload).await
    }

    async fn round_trip<P: Serialize>(&self, method: &str, params: P) -> Result<Response> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }

        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_vec(&Request::new(&id, method, params))?;
        self.log_outbound(method, &payload);

        // The sink goes into the table before the write so a fast response
        // cannot arrive unclaimed.
        let (tx, rx) = oneshot::channel();
        self.shared.pending.lock().unwrap().insert(id.clone(), tx);

        if let Err(err) = self.shared.write(&payload).await {
            self.shared.pending.lock().unwrap().remove(&id);
            return Err(err);
        }

        rx.await.map_err(|_| Error::Disconnected)
    }

    /// Subscribe `callback` to server-initiated notifications for `method`.
    ///
    /// At most one subscriber per method; a second installation fails with
    /// [`Error::AlreadySubscribed`]. Callbacks run on their own task, never
    /// on the reader task.
    pub fn subscribe<F, Fut>(&self, method: &str, callback: F) -> Result<()>
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.install(
            method,
            Subscriber::Json(Arc::new(move |params| {
                Box::pin(callback(params)) as BoxFuture<()>
            })),
        )
    }

    /// Subscribe to a notification method that is followed on the wire by
    /// binary data.
    ///
    /// The callback receives a [`RawReader`] granting exclusive access to
    /// the stream; it must pull the announced bytes and drop the reader to
    /// resume JSON framing.
    pub fn subscribe_raw<F, Fut>(&self, method: &str, callback: F) -> Result<()>
    where
        F: Fn(Value, RawReader) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.install(
            method,
            Subscriber::Raw(Arc::new(move |params, raw| {
                Box::pin(callback(params, raw)) as BoxFuture<()>
            })),
        )
    }

    fn install(&self, method: &str, subscriber: Subscriber) -> Result<()> {
        if !self.is_connected() {
            return Err(Error::NotConnected);
        }
        let mut subs = self.shared.subs.lock().unwrap();
        if subs.contains_key(method) {
            return Err(Error::AlreadySubscribed(method.to_string()));
        }
        subs.insert(method.to_string(), subscriber);
        Ok(())
    }

    /// Remove the subscriber for `method`. Safe to call when none exists.
    pub fn unsubscribe(&self, method: &str) {
        self.shared.subs.lock().unwrap().remove(method);
    }

    /// Read exactly `len` opaque bytes from the stream, outside JSON
    /// framing.
    ///
    /// For binary data announced by a notification, prefer
    /// [`subscribe_raw`](Self::subscribe_raw), which parks the reader at
    /// the announcement boundary. This standalone form is for callers that
    /// know no other inbound traffic is in flight. Concurrent raw reads
    /// serialize on an internal gate.
    pub async fn read_raw(&self, len: usize) -> Result<Bytes> {
        let _gate = self.shared.raw_gate.lock().await;
        let rx = self.shared.framer.begin_raw(len);
        rx.await.map_err(|_| Error::Disconnected)
    }

    /// Write opaque bytes to the socket under the write mutex.
    pub async fn write_raw(&self, bytes: &[u8]) -> Result<()> {
        self.shared.write(bytes).await
    }

    /// Close the connection. Idempotent; does not fire the read-error
    /// callback. In-flight calls resolve to [`Error::Disconnected`].
    pub async fn close(&self) {
        teardown(&self.shared, None).await;
    }

    fn log_outbound(&self, method: &str, payload: &[u8]) {
        if self.shared.verbose.load(Ordering::Relaxed) {
            tracing::debug!(
                method,
                frame = %String::from_utf8_lossy(payload),
                "sending request"
            );
        }
    }
}

impl Shared {
    async fn write(&self, bytes: &[u8]) -> Result<()> {
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotConnected)?;
        writer.write_all(bytes).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Route one inbound frame. Runs on the reader task; anything that can
    /// block is spawned.
    fn dispatch(self: &Arc<Self>, frame: Bytes) {
        if self.verbose.load(Ordering::Relaxed) {
            tracing::debug!(frame = %String::from_utf8_lossy(&frame), "received frame");
        }

        let resp: Response = match serde_json::from_slice(&frame) {
            Ok(resp) => resp,
            Err(err) => {
                tracing::debug!(%err, "dropping malformed frame");
                return;
            }
        };

        if !resp.version_ok() {
            tracing::warn!("dropping frame with unsupported jsonrpc version");
            return;
        }

        if resp.is_notification_shaped() {
            let notif: Notification = match serde_json::from_slice(&frame) {
                Ok(notif) => notif,
                Err(err) => {
                    tracing::debug!(%err, "dropping malformed notification");
                    return;
                }
            };
            let sub = self.subs.lock().unwrap().get(&notif.method).cloned();
            match sub {
                Some(Subscriber::Json(callback)) => {
                    tokio::spawn(callback(notif.params));
                }
                Some(Subscriber::Raw(callback)) => {
                    // Park the stream at this frame boundary before the
                    // reader can touch the binary bytes that follow; the
                    // callback's RawReader takes it from here.
                    self.framer.hold();
                    let raw = RawReader {
                        shared: Arc::clone(self),
                    };
                    tokio::spawn(callback(notif.params, raw));
                }
                None => {
                    tracing::debug!(method = %notif.method, "no subscriber for notification");
                }
            }
        } else if let Some(id) = resp.id.clone() {
            let tx = self.pending.lock().unwrap().remove(&id);
            match tx {
                Some(tx) => {
                    let _ = tx.send(resp);
                }
                None => tracing::debug!(%id, "dropping response with unknown id"),
            }
        }
        // A message with result/error but no id correlates to nothing.
    }
}

async fn read_loop(mut reader: OwnedReadHalf, shared: Arc<Shared>) {
    let mut backlog = BytesMut::with_capacity(READ_CHUNK_SIZE);
    let mut buf = [0u8; READ_CHUNK_SIZE];
    loop {
        while !backlog.is_empty() {
            let (frame, consumed) = shared.framer.feed_frame(&backlog);
            let _ = backlog.split_to(consumed);
            match frame {
                Some(frame) => shared.dispatch(frame),
                // No progress: the stream is held for a raw consumer.
                None if consumed == 0 => shared.framer.ready().await,
                None => {}
            }
        }

        match reader.read(&mut buf).await {
            Ok(0) => {
                teardown(
                    &shared,
                    Some(Error::Io(io::ErrorKind::UnexpectedEof.into())),
                )
                .await;
                break;
            }
            Ok(n) => backlog.extend_from_slice(&buf[..n]),
            Err(err) => {
                teardown(&shared, Some(Error::Io(err))).await;
                break;
            }
        }
    }
}

/// Tear the connection down once: close the writer, reset the framer, drop
/// every pending sink, and (on a read error) fire the error callback.
async fn teardown(shared: &Arc<Shared>, error: Option<Error>) {
    if !shared.connected.swap(false, Ordering::SeqCst) {
        return;
    }

    {
        let mut guard = shared.writer.lock().await;
        if let Some(mut writer) = guard.take() {
            let _ = writer.shutdown().await;
        }
    }
    shared.framer.reset();
    shared.pending.lock().unwrap().clear();

    if let Some(error) = error {
        tracing::debug!(%error, "connection torn down by read error");
        let callback = shared.error_cb.lock().unwrap().take();
        if let Some(callback) = callback {
            callback(error);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    async fn listen() -> (TcpListener, Client) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port().to_string();
        let client = Client::new("127.0.0.1", port);
        (listener, client)
    }

    #[tokio::test]
    async fn test_call_before_connect_fails_synchronously() {
        let client = Client::new("127.0.0.1", "9999");
        let err = client
            .call::<_, bool>("ping", crate::jsonrpc::EmptyParams {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_subscribe_requires_connection() {
        let client = Client::new("127.0.0.1", "9999");
        let err = client
            .subscribe("state_notification", |_| async {})
            .unwrap_err();
        assert!(matches!(err, Error::NotConnected));
    }

    #[tokio::test]
    async fn test_duplicate_subscription_rejected() {
        let (listener, client) = listen().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        client.connect().await.unwrap();
        let _peer = accept.await.unwrap();

        client.subscribe("state_notification", |_| async {}).unwrap();
        let err = client
            .subscribe("state_notification", |_| async {})
            .unwrap_err();
        assert!(matches!(err, Error::AlreadySubscribed(method) if method == "state_notification"));

        // A raw subscription on the same method is also a duplicate.
        let err = client
            .subscribe_raw("state_notification", |_, _| async {})
            .unwrap_err();
        assert!(matches!(err, Error::AlreadySubscribed(_)));
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent() {
        let (listener, client) = listen().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        client.connect().await.unwrap();
        let _peer = accept.await.unwrap();

        client.unsubscribe("never_subscribed");
        client.subscribe("x", |_| async {}).unwrap();
        client.unsubscribe("x");
        client.unsubscribe("x");
        // Slot is free again.
        client.subscribe("x", |_| async {}).unwrap();
    }

    #[tokio::test]
    async fn test_response_with_unknown_id_dropped() {
        let (listener, client) = listen().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        client.connect().await.unwrap();
        let (mut peer, _) = accept.await.unwrap();

        // A stray response must not disturb a later real call.
        peer.write_all(br#"{"id":"bogus","jsonrpc":"2.0","result":false}"#)
            .await
            .unwrap();

        let server = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let n = peer.read(&mut buf).await.unwrap();
            let req: Value = serde_json::from_slice(&buf[..n]).unwrap();
            let reply = json!({
                "id": req["id"],
                "jsonrpc": "2.0",
                "result": true,
            });
            peer.write_all(reply.to_string().as_bytes()).await.unwrap();
            peer
        });

        let pong: bool = client
            .call("ping", crate::jsonrpc::EmptyParams {})
            .await
            .unwrap();
        assert!(pong);
        drop(server.await.unwrap());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_does_not_fire_error_callback() {
        let (listener, client) = listen().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        client.connect().await.unwrap();
        let _peer = accept.await.unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let fired_cb = Arc::clone(&fired);
        client.on_read_error(move |_| fired_cb.store(true, Ordering::SeqCst));

        client.close().await;
        client.close().await;
        assert!(!client.is_connected());
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_raw_subscription_reads_interleaved_bytes() {
        let (listener, client) = listen().await;
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });
        client.connect().await.unwrap();
        let (mut peer, _) = accept.await.unwrap();

        let (tx, rx) = oneshot::channel::<(Bytes, Value)>();
        let tx = Mutex::new(Some(tx));
        client
            .subscribe_raw("blob", move |params, mut raw| {
                let tx = tx.lock().unwrap().take();
                async move {
                    let data = raw.read(6).await.unwrap();
                    drop(raw);
                    if let Some(tx) = tx {
                        let _ = tx.send((data, params));
                    }
                }
            })
            .unwrap();

        // Announcement and payload in a single write: the hold keeps the
        // payload bytes out of the JSON scanner.
        let mut wire = Vec::new();
        wire.extend_from_slice(br#"{"jsonrpc":"2.0","method":"blob","params":{"length":6}}"#);
        wire.extend_from_slice(b"BINARY");
        wire.extend_from_slice(br#"{"jsonrpc":"2.0","method":"after","params":{}}"#);
        peer.write_all(&wire).await.unwrap();

        let (data, params) = rx.await.unwrap();
        assert_eq!(&data[..], b"BINARY");
        assert_eq!(params["length"], 6);
    }
}
