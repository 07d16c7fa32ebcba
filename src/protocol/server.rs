use std::{
    fs,
    io::{self, ErrorKind},
    net::{SocketAddr, TcpListener},
    os::unix::{
        fs::FileTypeExt,
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
    sync::{
        Arc, Mutex,
        atomic::{AtomicU32, Ordering},
        mpsc::{self, Receiver, SyncSender, TrySendError},
    },
    thread,
};

use log::{debug, info, warn};
use thiserror::Error;

use crate::{
    datastore::Datastore,
    nacm::{AuthzRequest, Decision, Nacm},
    netconf::{ErrorType, RpcError, ok_reply, target_datastore},
    xml::XmlNode,
};

use super::{
    message::{BodyBuilder, Message},
    thread::SessionThreads,
    transport::{Channel, Endpoint, ProtocolTransport, TransportError},
};

pub const DEFAULT_MAX_SESSIONS: usize = 256;

/// Notifications queued for a subscriber that is not reading.
const SUBSCRIBER_BACKLOG: usize = 64;

const SESSION_END_NS: &str = "urn:ietf:params:xml:ns:yang:ietf-netconf-notifications";

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("binding {endpoint}: {source}")]
    Bind { endpoint: String, source: io::Error },

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("server io error: {0}")]
    Io(#[from] io::Error),

    #[error("refusing session, {0} already open")]
    TooManySessions(usize),

    #[error("subscriber list poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendConfig {
    pub endpoint: Endpoint,
    pub max_sessions: usize,
}

impl BackendConfig {
    pub fn new(endpoint: impl Into<Endpoint>) -> Self {
        Self {
            endpoint: endpoint.into(),
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }
}

type Writer = Arc<Mutex<ProtocolTransport<Channel>>>;

/// A subscribed session. Its notifications go through a bounded queue drained
/// by a thread of its own, so a client that stops reading only loses events.
struct Subscriber {
    session: u32,
    queue: SyncSender<String>,
}

/// What a session does after answering a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Request handling shared by every session.
pub struct Backend {
    datastore: Arc<dyn Datastore>,
    nacm: Nacm,
    subscribers: Mutex<Vec<Subscriber>>,
    sessions: AtomicU32,
}

impl Backend {
    pub fn new(datastore: Arc<dyn Datastore>, nacm: Nacm) -> Self {
        Self {
            datastore,
            nacm,
            subscribers: Mutex::new(Vec::new()),
            sessions: AtomicU32::new(0),
        }
    }

    /// Runs one client session until it closes.
    ///
    /// Every request gets exactly one reply. A body that does not parse is
    /// answered with `malformed-message` and the session goes on; transport
    /// failures end it.
    pub fn serve(&self, channel: Channel) -> Result<(), ServerError> {
        let id = self.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        let writer: Writer = Arc::new(Mutex::new(ProtocolTransport::new(channel.try_clone()?)));
        let mut reader = ProtocolTransport::new(channel);
        info!("session {id} started");

        let mut username = None;
        let result = self.session(id, &mut reader, &writer, &mut username);

        let reason = match &result {
            Ok(Flow::Close) => "closed",
            _ => "dropped",
        };
        info!("session {id} {reason}");
        self.end_session(id, username.as_deref(), reason);
        result.map(|_| ())
    }

    fn session(
        &self,
        id: u32,
        reader: &mut ProtocolTransport<Channel>,
        writer: &Writer,
        username: &mut Option<String>,
    ) -> Result<Flow, ServerError> {
        loop {
            let Some(msg) = reader.recv_message()? else {
                debug!("session {id}: peer closed");
                return Ok(Flow::Continue);
            };

            let (reply, flow) = self.handle(id, &msg, writer, username);
            writer
                .lock()
                .map_err(|_| ServerError::Poisoned)?
                .send_message(&Message::encode(&reply).map_err(TransportError::from)?)?;

            if flow == Flow::Close {
                return Ok(flow);
            }
        }
    }

    fn handle(
        &self,
        id: u32,
        msg: &Message,
        writer: &Writer,
        username: &mut Option<String>,
    ) -> (String, Flow) {
        let doc = match msg.decode() {
            Ok(doc) => doc,
            Err(e) => {
                warn!("session {id}: {e}");
                return (RpcError::malformed_message(e.to_string()).to_xml(), Flow::Continue);
            }
        };
        let Some(rpc) = doc.child("rpc") else {
            return (
                RpcError::malformed_message("expected an rpc element").to_xml(),
                Flow::Continue,
            );
        };
        let Some(operation) = rpc.first_child() else {
            return (
                RpcError::malformed_message("rpc has no operation").to_xml(),
                Flow::Continue,
            );
        };

        let user = rpc.attribute("username");
        if let Some(user) = user {
            *username = Some(user.to_string());
        }
        let name = operation.local_name();
        debug!("session {id}: {name} from {user:?}");

        match self.nacm.access(&AuthzRequest::new(user, name)) {
            Ok(Decision::Permit) => {}
            Ok(Decision::Deny(err)) => {
                info!("session {id}: {name} denied for {user:?}");
                return (err.to_xml(), Flow::Continue);
            }
            Err(e) => {
                warn!("session {id}: nacm check failed, refusing {name}: {e}");
                let err = RpcError::operation_failed(ErrorType::Application, e.to_string());
                return (err.to_xml(), Flow::Continue);
            }
        }

        match name {
            "get-config" => (self.get_config(operation), Flow::Continue),
            "close-session" => (ok_reply(), Flow::Close),
            "create-subscription" => match self.subscribe(id, writer) {
                Ok(()) => (ok_reply(), Flow::Continue),
                Err(e) => (
                    RpcError::operation_failed(ErrorType::Application, e.to_string()).to_xml(),
                    Flow::Continue,
                ),
            },
            other => (
                RpcError::operation_not_supported(
                    ErrorType::Protocol,
                    format!("{other} is not supported"),
                )
                .to_xml(),
                Flow::Continue,
            ),
        }
    }

    fn get_config(&self, operation: &XmlNode) -> String {
        let Some(target) = target_datastore(operation, "source") else {
            return RpcError::operation_failed(ErrorType::Rpc, "missing source datastore").to_xml();
        };
        let path = operation
            .child("filter")
            .and_then(|f| f.attribute("select"))
            .unwrap_or_default();

        match self.datastore.get(target.as_str(), path) {
            Ok(tree) => BodyBuilder::new()
                .open("rpc-reply")
                .open("data")
                .raw(&tree.to_string())
                .finish(),
            Err(e) => {
                warn!("get-config {target} '{path}': {e}");
                RpcError::operation_failed(ErrorType::Application, e.to_string()).to_xml()
            }
        }
    }

    fn subscribe(&self, id: u32, writer: &Writer) -> Result<(), ServerError> {
        let mut subscribers = self.subscribers.lock().map_err(|_| ServerError::Poisoned)?;
        if subscribers.iter().any(|s| s.session == id) {
            return Ok(());
        }

        let (queue, events) = mpsc::sync_channel(SUBSCRIBER_BACKLOG);
        let writer = Arc::clone(writer);
        thread::Builder::new()
            .name(format!("notify-{id}"))
            .spawn(move || deliver(id, writer, events))?;
        subscribers.push(Subscriber { session: id, queue });
        debug!("session {id} subscribed");
        Ok(())
    }

    fn end_session(&self, id: u32, username: Option<&str>, reason: &str) {
        let event = BodyBuilder::new()
            .open_with("netconf-session-end", &[("xmlns", SESSION_END_NS)])
            .element("username", username.unwrap_or_default())
            .element("session-id", &id.to_string())
            .element("termination-reason", reason)
            .finish();

        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.retain(|s| s.session != id);
        }
        self.broadcast(&event);
    }

    /// Queues `event` for every subscribed session. Never blocks on a client.
    pub fn broadcast(&self, event: &str) {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            warn!("subscriber list poisoned, dropping notification");
            return;
        };
        subscribers.retain(|s| match s.queue.try_send(event.to_string()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("subscriber {} is not reading, notification dropped", s.session);
                true
            }
            Err(TrySendError::Disconnected(_)) => {
                debug!("dropping subscriber {}", s.session);
                false
            }
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or_default()
    }
}

/// Writes queued notifications to one subscriber until it goes away.
fn deliver(id: u32, writer: Writer, events: Receiver<String>) {
    for event in events {
        let sent = match writer.lock() {
            Ok(mut transport) => transport.notify(&event),
            Err(_) => return,
        };
        if let Err(e) = sent {
            debug!("subscriber {id} gone: {e}");
            return;
        }
    }
}

enum Listener {
    Unix { listener: UnixListener, path: PathBuf },
    Inet(TcpListener),
}

impl Listener {
    fn bind(endpoint: &Endpoint) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            endpoint: endpoint.to_string(),
            source,
        };
        match endpoint {
            Endpoint::Unix(path) => {
                if is_socket(path) {
                    match UnixStream::connect(path) {
                        Ok(_) => {
                            return Err(bind_err(io::Error::new(
                                ErrorKind::AddrInUse,
                                "another backend is serving this socket",
                            )));
                        }
                        Err(e) if e.kind() == ErrorKind::ConnectionRefused => {
                            debug!("removing stale socket {}", path.display());
                            fs::remove_file(path).map_err(bind_err)?;
                        }
                        Err(_) => {}
                    }
                }
                let listener = UnixListener::bind(path).map_err(bind_err)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            Endpoint::Inet(addr) => Ok(Listener::Inet(TcpListener::bind(addr).map_err(bind_err)?)),
        }
    }

    fn local_endpoint(&self) -> io::Result<Endpoint> {
        match self {
            Listener::Unix { path, .. } => Ok(Endpoint::Unix(path.clone())),
            Listener::Inet(listener) => match listener.local_addr()? {
                SocketAddr::V4(addr) => Ok(Endpoint::Inet(addr)),
                SocketAddr::V6(addr) => Err(io::Error::new(
                    ErrorKind::Unsupported,
                    format!("bound to IPv6 address {addr}"),
                )),
            },
        }
    }

    fn accept(&self) -> io::Result<Channel> {
        match self {
            Listener::Unix { listener, .. } => listener.accept().map(|(s, _)| Channel::Unix(s)),
            Listener::Inet(listener) => listener.accept().map(|(s, _)| Channel::Inet(s)),
        }
    }
}

fn is_socket(path: &Path) -> bool {
    fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false)
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = fs::remove_file(path);
        }
    }
}

pub struct BackendServer {
    listener: Listener,
    backend: Arc<Backend>,
    sessions: SessionThreads,
}

impl BackendServer {
    /// Binds the configured endpoint. A unix socket left behind by a dead
    /// backend is replaced; one that still accepts connections is not.
    pub fn bind(
        config: BackendConfig,
        datastore: Arc<dyn Datastore>,
        nacm: Nacm,
    ) -> Result<Self, ServerError> {
        let listener = Listener::bind(&config.endpoint)?;
        info!(
            "listening at {} (nacm {}, at most {} sessions)",
            listener.local_endpoint()?,
            nacm.mode(),
            config.max_sessions
        );
        Ok(Self {
            listener,
            backend: Arc::new(Backend::new(datastore, nacm)),
            sessions: SessionThreads::new(config.max_sessions),
        })
    }

    /// Where clients can reach this server, with the actual port for `:0` binds.
    pub fn local_endpoint(&self) -> Result<Endpoint, ServerError> {
        Ok(self.listener.local_endpoint()?)
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn listen(mut self) -> Result<(), ServerError> {
        loop {
            match self.listener.accept() {
                Ok(channel) => {
                    let backend = Arc::clone(&self.backend);
                    let spawned = self.sessions.spawn(move || {
                        if let Err(e) = backend.serve(channel) {
                            warn!("session failed: {e}");
                        }
                    });
                    if let Err(e) = spawned {
                        warn!("{e}");
                    }
                }
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
    }
}
