//! Connections to the plugin under test.
//!
//! Each endpoint is a small state machine: `Unbound`, or `Bound` to the
//! address it was dialed with. Ensuring a connection to the same address
//! again is a no-op that hands back the existing channel; a different
//! address closes the old channel and dials the new one.
//!
//! The controller endpoint may be left empty, in which case it shares the
//! node connection. The share is evaluated on every call, so a node
//! redial is followed automatically.

use std::future::Future;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::net::UnixStream;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint, Uri};
use tower::service_fn;
use tracing::{debug, info};

use crate::metrics;
use crate::types::{AddressParseError, EndpointAddress};

/// Upper bound for establishing a connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(60);

/// Placeholder URI for Unix-domain sockets; the connector ignores it.
const UNIX_PLACEHOLDER_URI: &str = "http://[::]:50051";

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error(transparent)]
    InvalidAddress(#[from] AddressParseError),

    #[error("failed to connect to {address}: {source}")]
    Transport {
        address: String,
        #[source]
        source: tonic::transport::Error,
    },

    #[error("connection to {address} timed out after {timeout:?}")]
    Timeout { address: String, timeout: Duration },

    #[error("endpoint {address} unavailable: {reason}")]
    Unavailable { address: String, reason: String },
}

/// Which of the two plugin endpoints a connection serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    /// Data plane: node and identity services
    Node,
    /// Control plane: controller service
    Controller,
}

impl EndpointRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            EndpointRole::Node => "node",
            EndpointRole::Controller => "controller",
        }
    }
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opens connections to plugin endpoints.
///
/// Closing a connection is dropping it; `Conn` clones share one
/// underlying connection.
pub trait Dialer {
    type Conn: Clone;

    fn dial(&self, address: &str) -> impl Future<Output = Result<Self::Conn, ConnectError>>;
}

/// Dials gRPC channels with tonic.
#[derive(Debug, Clone)]
pub struct GrpcDialer {
    connect_timeout: Duration,
}

impl Default for GrpcDialer {
    fn default() -> Self {
        Self {
            connect_timeout: CONNECT_TIMEOUT,
        }
    }
}

impl GrpcDialer {
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Dialer for GrpcDialer {
    type Conn = Channel;

    async fn dial(&self, address: &str) -> Result<Channel, ConnectError> {
        let parsed: EndpointAddress = address.parse()?;

        match tokio::time::timeout(self.connect_timeout, connect_channel(&parsed)).await {
            Ok(result) => result.map_err(|source| ConnectError::Transport {
                address: address.to_string(),
                source,
            }),
            Err(_) => Err(ConnectError::Timeout {
                address: address.to_string(),
                timeout: self.connect_timeout,
            }),
        }
    }
}

/// Channel settings shared by TCP and Unix-domain endpoints.
///
/// Keepalive while idle lets a dead plugin surface promptly on the next
/// call instead of hanging the test case.
fn endpoint_builder(uri: String) -> Result<Endpoint, tonic::transport::Error> {
    Ok(Endpoint::from_shared(uri)?
        .connect_timeout(CONNECT_TIMEOUT)
        .tcp_nodelay(true)
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true))
}

async fn connect_channel(address: &EndpointAddress) -> Result<Channel, tonic::transport::Error> {
    match address {
        EndpointAddress::Tcp(uri) => {
            let mut endpoint = endpoint_builder(uri.clone())?;
            if uri.starts_with("https://") {
                endpoint = endpoint.tls_config(ClientTlsConfig::new().with_enabled_roots())?;
            }
            endpoint.connect().await
        }
        EndpointAddress::Unix(path) => {
            let path = path.clone();
            endpoint_builder(UNIX_PLACEHOLDER_URI.to_string())?
                .connect_with_connector(service_fn(move |_: Uri| {
                    let path = path.clone();
                    async move {
                        let stream = UnixStream::connect(path).await?;
                        Ok::<_, std::io::Error>(TokioIo::new(stream))
                    }
                }))
                .await
        }
    }
}

/// Connection state of one endpoint.
#[derive(Debug, Clone)]
pub enum Binding<C> {
    Unbound,
    Bound { address: String, conn: C },
}

impl<C> Default for Binding<C> {
    fn default() -> Self {
        Binding::Unbound
    }
}

impl<C> Binding<C> {
    pub fn conn(&self) -> Option<&C> {
        match self {
            Binding::Bound { conn, .. } => Some(conn),
            Binding::Unbound => None,
        }
    }

    /// Address the current connection was opened with.
    pub fn address(&self) -> Option<&str> {
        match self {
            Binding::Bound { address, .. } => Some(address),
            Binding::Unbound => None,
        }
    }

    pub fn is_bound_to(&self, address: &str) -> bool {
        self.address() == Some(address)
    }

    /// Drop the connection, if any.
    pub fn close(&mut self) {
        if let Binding::Bound { address, .. } = std::mem::take(self) {
            debug!(address = %address, "closing connection");
        }
    }
}

/// What `ensure_connection` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Reused,
    Dialed,
}

/// Make `binding` hold a connection to `want`.
///
/// Reuses the existing connection when it was opened against `want`;
/// otherwise closes it and dials `want`. On dial failure the binding is
/// left `Unbound`.
pub async fn ensure_connection<D: Dialer>(
    binding: &mut Binding<D::Conn>,
    dialer: &D,
    role: EndpointRole,
    want: &str,
) -> Result<Resolution, ConnectError> {
    if binding.is_bound_to(want) {
        info!(endpoint = %role, address = %want, "reusing connection to CSI driver at {}", want);
        metrics::record_reuse(role.as_str());
        return Ok(Resolution::Reused);
    }

    binding.close();
    info!(endpoint = %role, address = %want, "connecting to CSI driver");

    let result = dialer.dial(want).await;
    metrics::record_dial(role.as_str(), result.is_ok());
    let conn = result?;

    *binding = Binding::Bound {
        address: want.to_string(),
        conn,
    };
    Ok(Resolution::Dialed)
}

/// Node and controller connections of one session.
pub struct Connections<D: Dialer> {
    dialer: D,
    node: Binding<D::Conn>,
    /// Dedicated controller connection; `Unbound` while shared.
    controller: Binding<D::Conn>,
    controller_shared: bool,
}

impl<D: Dialer> Connections<D> {
    pub fn new(dialer: D) -> Self {
        Self {
            dialer,
            node: Binding::Unbound,
            controller: Binding::Unbound,
            controller_shared: false,
        }
    }

    pub fn dialer(&self) -> &D {
        &self.dialer
    }

    /// Connect the node endpoint to `address`, reusing when possible.
    pub async fn ensure_node(&mut self, address: &str) -> Result<Resolution, ConnectError> {
        ensure_connection(&mut self.node, &self.dialer, EndpointRole::Node, address).await
    }

    /// Connect the controller endpoint.
    ///
    /// An empty `address` shares the node connection (and its address)
    /// instead of dialing. Call after [`Connections::ensure_node`].
    pub async fn ensure_controller(&mut self, address: &str) -> Result<Resolution, ConnectError> {
        if address.is_empty() {
            if !self.controller_shared {
                debug!("controller address not set, sharing node connection");
            }
            self.controller.close();
            self.controller_shared = true;
            return Ok(Resolution::Reused);
        }

        self.controller_shared = false;
        ensure_connection(
            &mut self.controller,
            &self.dialer,
            EndpointRole::Controller,
            address,
        )
        .await
    }

    pub fn node(&self) -> Option<&D::Conn> {
        self.node.conn()
    }

    pub fn node_address(&self) -> Option<&str> {
        self.node.address()
    }

    pub fn controller(&self) -> Option<&D::Conn> {
        if self.controller_shared {
            self.node.conn()
        } else {
            self.controller.conn()
        }
    }

    pub fn controller_address(&self) -> Option<&str> {
        if self.controller_shared {
            self.node.address()
        } else {
            self.controller.address()
        }
    }

    /// Whether the controller endpoint shares the node connection.
    pub fn controller_is_shared(&self) -> bool {
        self.controller_shared
    }

    /// Close both connections.
    pub fn close(&mut self) {
        self.controller.close();
        self.controller_shared = false;
        self.node.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    /// Hands out numbered connections and remembers every dial.
    #[derive(Default)]
    struct RecordingDialer {
        dials: RefCell<Vec<String>>,
        fail: RefCell<bool>,
    }

    impl Dialer for RecordingDialer {
        type Conn = Rc<usize>;

        async fn dial(&self, address: &str) -> Result<Rc<usize>, ConnectError> {
            if *self.fail.borrow() {
                return Err(ConnectError::Unavailable {
                    address: address.to_string(),
                    reason: "refused".to_string(),
                });
            }
            let mut dials = self.dials.borrow_mut();
            dials.push(address.to_string());
            Ok(Rc::new(dials.len()))
        }
    }

    #[tokio::test]
    async fn test_same_address_reuses() {
        let dialer = RecordingDialer::default();
        let mut binding = Binding::Unbound;

        let first = ensure_connection(&mut binding, &dialer, EndpointRole::Node, "/a.sock")
            .await
            .unwrap();
        let handle = binding.conn().unwrap().clone();
        let second = ensure_connection(&mut binding, &dialer, EndpointRole::Node, "/a.sock")
            .await
            .unwrap();

        assert_eq!(first, Resolution::Dialed);
        assert_eq!(second, Resolution::Reused);
        assert_eq!(dialer.dials.borrow().len(), 1);
        assert!(Rc::ptr_eq(&handle, binding.conn().unwrap()));
    }

    #[tokio::test]
    async fn test_new_address_redials_and_closes() {
        let dialer = RecordingDialer::default();
        let mut binding = Binding::Unbound;

        ensure_connection(&mut binding, &dialer, EndpointRole::Node, "/a.sock")
            .await
            .unwrap();
        let old = Rc::downgrade(binding.conn().unwrap());

        ensure_connection(&mut binding, &dialer, EndpointRole::Node, "/b.sock")
            .await
            .unwrap();

        assert!(old.upgrade().is_none(), "old connection must be closed");
        assert_eq!(*dialer.dials.borrow(), vec!["/a.sock", "/b.sock"]);
        assert_eq!(binding.address(), Some("/b.sock"));
    }

    #[tokio::test]
    async fn test_dial_failure_leaves_unbound() {
        let dialer = RecordingDialer::default();
        let mut binding = Binding::Unbound;
        ensure_connection(&mut binding, &dialer, EndpointRole::Node, "/a.sock")
            .await
            .unwrap();

        *dialer.fail.borrow_mut() = true;
        let err = ensure_connection(&mut binding, &dialer, EndpointRole::Node, "/b.sock")
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::Unavailable { .. }));
        assert!(binding.conn().is_none());
    }

    #[tokio::test]
    async fn test_controller_shares_node_connection() {
        let mut conns = Connections::new(RecordingDialer::default());
        conns.ensure_node("/node.sock").await.unwrap();
        conns.ensure_controller("").await.unwrap();

        assert!(conns.controller_is_shared());
        assert!(Rc::ptr_eq(conns.node().unwrap(), conns.controller().unwrap()));
        assert_eq!(conns.controller_address(), Some("/node.sock"));
        assert_eq!(conns.dialer().dials.borrow().len(), 1);

        // Node redial is followed by the shared controller
        conns.ensure_node("/other.sock").await.unwrap();
        conns.ensure_controller("").await.unwrap();
        assert_eq!(conns.controller_address(), Some("/other.sock"));
        assert!(Rc::ptr_eq(conns.node().unwrap(), conns.controller().unwrap()));
    }

    #[tokio::test]
    async fn test_dedicated_controller() {
        let mut conns = Connections::new(RecordingDialer::default());
        conns.ensure_node("/node.sock").await.unwrap();
        conns.ensure_controller("/ctrl.sock").await.unwrap();
        conns.ensure_controller("/ctrl.sock").await.unwrap();

        assert!(!conns.controller_is_shared());
        assert_eq!(conns.controller_address(), Some("/ctrl.sock"));
        assert_eq!(
            *conns.dialer().dials.borrow(),
            vec!["/node.sock", "/ctrl.sock"]
        );

        // Switching to shared drops the dedicated connection
        let dedicated = Rc::downgrade(conns.controller().unwrap());
        conns.ensure_controller("").await.unwrap();
        assert!(dedicated.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_close() {
        let mut conns = Connections::new(RecordingDialer::default());
        conns.ensure_node("/node.sock").await.unwrap();
        conns.ensure_controller("").await.unwrap();
        conns.close();
        assert!(conns.node().is_none());
        assert!(conns.controller().is_none());
    }

    #[tokio::test]
    async fn test_grpc_dial_missing_socket() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let socket = temp_dir.path().join("missing.sock");
        let dialer = GrpcDialer::with_connect_timeout(Duration::from_secs(5));

        let err = dialer.dial(&socket.to_string_lossy()).await.unwrap_err();
        assert!(matches!(
            err,
            ConnectError::Transport { .. } | ConnectError::Timeout { .. }
        ));
    }

    #[tokio::test]
    async fn test_grpc_dial_invalid_address() {
        let dialer = GrpcDialer::default();
        let err = dialer.dial("").await.unwrap_err();
        assert!(matches!(err, ConnectError::InvalidAddress(_)));
    }
}
