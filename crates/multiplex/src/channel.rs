//! Named channels over a Unix domain socket
//!
//! [`ChannelServer`] accepts connections on a socket path and serves each one
//! on its own thread. Every incoming [`Envelope`] is routed to the
//! [`ChannelHandler`] registered under its channel name; requests on one
//! connection are handled in order.
//!
//! [`ChannelClient`] keeps a pool of idle connections. A call checks one out
//! for the full request/reply exchange, so a call that blocks on the owner
//! (a lock acquire) never delays other calls from the same process.

use std::io::BufReader;
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use dashmap::DashMap;
use nestdb_core::{Error, ErrorKind, Result};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::{encode_frame, read_frame, send_frame, Call, Envelope, Reply};

/// Idle connections kept by a client beyond which returned ones are closed
const MAX_IDLE_CONNECTIONS: usize = 16;

/// Serves calls addressed to one channel
pub trait ChannelHandler: Send + Sync {
    /// Run `call` and produce its reply; errors are shipped back as `Reply::Failed`
    fn handle(&self, call: Call) -> Result<Reply>;
}

type HandlerMap = DashMap<String, Arc<dyn ChannelHandler>>;

struct ServerShared {
    handlers: HandlerMap,
    connections: Mutex<Vec<(u64, UnixStream)>>,
    stopping: AtomicBool,
    max_message_size: usize,
}

/// Socket listener dispatching to registered channel handlers
pub struct ChannelServer {
    path: PathBuf,
    shared: Arc<ServerShared>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl ChannelServer {
    /// Bind `path` and start accepting connections.
    ///
    /// A leftover socket file from a dead process is removed; a socket that
    /// still accepts connections means another owner is live and binding
    /// fails with `Connection`.
    pub fn bind(path: impl AsRef<Path>, max_message_size: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            if UnixStream::connect(&path).is_ok() {
                return Err(Error::connection(format!(
                    "{} is already served by another process",
                    path.display()
                )));
            }
            std::fs::remove_file(&path)?;
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let listener = UnixListener::bind(&path)?;
        info!(target: "nestdb::mux", path = %path.display(), "Channel server listening");

        let shared = Arc::new(ServerShared {
            handlers: DashMap::new(),
            connections: Mutex::new(Vec::new()),
            stopping: AtomicBool::new(false),
            max_message_size,
        });
        let acceptor = {
            let shared = Arc::clone(&shared);
            thread::Builder::new()
                .name("nestdb-accept".into())
                .spawn(move || accept_loop(listener, shared))?
        };
        Ok(Self {
            path,
            shared,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    /// Socket path being served
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Route `channel` to `handler`, replacing any previous handler
    pub fn register_handler(&self, channel: impl Into<String>, handler: Arc<dyn ChannelHandler>) {
        let channel = channel.into();
        debug!(target: "nestdb::mux", channel = %channel, "Registered channel");
        self.shared.handlers.insert(channel, handler);
    }

    /// Stop routing `channel`; returns whether a handler was registered
    pub fn unregister_handler(&self, channel: &str) -> bool {
        let removed = self.shared.handlers.remove(channel).is_some();
        if removed {
            debug!(target: "nestdb::mux", channel = %channel, "Unregistered channel");
        }
        removed
    }

    /// Whether `channel` has a handler
    pub fn has_handler(&self, channel: &str) -> bool {
        self.shared.handlers.contains_key(channel)
    }

    /// Stop accepting, drop every live connection and remove the socket file
    pub fn shutdown(&self) {
        if self.shared.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        // wake the acceptor so it observes the flag
        let _ = UnixStream::connect(&self.path);
        if let Some(acceptor) = self.acceptor.lock().take() {
            let _ = acceptor.join();
        }
        for (_, stream) in self.shared.connections.lock().drain(..) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        let _ = std::fs::remove_file(&self.path);
        info!(target: "nestdb::mux", path = %self.path.display(), "Channel server stopped");
    }
}

impl Drop for ChannelServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: UnixListener, shared: Arc<ServerShared>) {
    let next_id = AtomicU64::new(0);
    for incoming in listener.incoming() {
        if shared.stopping.load(Ordering::SeqCst) {
            break;
        }
        let stream = match incoming {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target: "nestdb::mux", error = %e, "Failed to accept connection");
                continue;
            }
        };
        let id = next_id.fetch_add(1, Ordering::Relaxed);
        match stream.try_clone() {
            Ok(tracked) => shared.connections.lock().push((id, tracked)),
            Err(e) => {
                warn!(target: "nestdb::mux", error = %e, "Failed to track connection");
                continue;
            }
        }
        let shared = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name(format!("nestdb-conn-{}", id))
            .spawn(move || {
                serve_connection(stream, &shared);
                shared.connections.lock().retain(|(cid, _)| *cid != id);
            });
        if let Err(e) = spawned {
            warn!(target: "nestdb::mux", error = %e, "Failed to spawn connection thread");
        }
    }
}

fn serve_connection(stream: UnixStream, shared: &ServerShared) {
    debug!(target: "nestdb::mux", "Connection opened");
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(e) => {
            warn!(target: "nestdb::mux", error = %e, "Failed to split connection");
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let max = shared.max_message_size;

    loop {
        let envelope: Envelope = match read_frame(&mut reader, max) {
            Ok(Some(envelope)) => envelope,
            Ok(None) => break,
            Err(e) => {
                // the stream position is unknown after a bad frame; answer and hang up
                warn!(target: "nestdb::mux", error = %e, "Dropping connection after bad frame");
                if let Ok(frame) = encode_frame(&Reply::failed(&e), max) {
                    let _ = send_frame(&mut writer, &frame);
                }
                break;
            }
        };

        let reply = dispatch(&shared.handlers, envelope);
        let frame = match encode_frame(&reply, max) {
            Ok(frame) => frame,
            Err(e) => match encode_frame(&Reply::failed(&e), max) {
                Ok(frame) => frame,
                Err(_) => break,
            },
        };
        if let Err(e) = send_frame(&mut writer, &frame) {
            debug!(target: "nestdb::mux", error = %e, "Peer went away");
            break;
        }
    }
    debug!(target: "nestdb::mux", "Connection closed");
}

fn dispatch(handlers: &HandlerMap, envelope: Envelope) -> Reply {
    if matches!(envelope.call, Call::Ping) {
        return Reply::Pong;
    }
    // clone out of the map so no shard lock is held while the handler runs
    let handler = handlers
        .get(&envelope.channel)
        .map(|entry| Arc::clone(entry.value()));
    match handler {
        Some(handler) => handler
            .handle(envelope.call)
            .unwrap_or_else(|e| Reply::failed(&e)),
        None => Reply::Failed {
            kind: ErrorKind::Closed,
            message: format!("no channel named {}", envelope.channel),
        },
    }
}

/// Pooled connection to a [`ChannelServer`]
pub struct ChannelClient {
    path: PathBuf,
    max_message_size: usize,
    idle: Mutex<Vec<UnixStream>>,
}

impl ChannelClient {
    /// Connect to the server at `path`; fails with `Connection` if nothing
    /// is listening
    pub fn connect(path: impl AsRef<Path>, max_message_size: usize) -> Result<Self> {
        let client = Self {
            path: path.as_ref().to_path_buf(),
            max_message_size,
            idle: Mutex::new(Vec::new()),
        };
        let stream = client.open_stream()?;
        client.idle.lock().push(stream);
        Ok(client)
    }

    /// Socket path this client talks to
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Send `call` to `channel` and wait for the reply.
    ///
    /// A `Reply::Failed` from the owner comes back as the corresponding error.
    pub fn call(&self, channel: &str, call: Call) -> Result<Reply> {
        let envelope = Envelope {
            channel: channel.to_string(),
            call,
        };
        let frame = encode_frame(&envelope, self.max_message_size)?;
        let stream = self.checkout()?;
        let (stream, reply) = self.exchange(stream, &frame)?;
        self.checkin(stream);
        reply.into_result()
    }

    fn exchange(&self, mut stream: UnixStream, frame: &[u8]) -> Result<(UnixStream, Reply)> {
        send_frame(&mut stream, frame)?;
        let reply = read_frame::<_, Reply>(&mut stream, self.max_message_size)?
            .ok_or_else(|| Error::connection("owner closed the connection"))?;
        Ok((stream, reply))
    }

    fn checkout(&self) -> Result<UnixStream> {
        if let Some(stream) = self.idle.lock().pop() {
            return Ok(stream);
        }
        self.open_stream()
    }

    fn checkin(&self, stream: UnixStream) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_CONNECTIONS {
            idle.push(stream);
        }
    }

    fn open_stream(&self) -> Result<UnixStream> {
        UnixStream::connect(&self.path).map_err(|e| {
            Error::connection(format!("cannot reach owner at {}: {}", self.path.display(), e))
        })
    }
}
