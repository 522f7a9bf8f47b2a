//! Transport adapter trait and the types that cross it.

use async_trait::async_trait;
use tokio::sync::mpsc;

/// Opaque handle for one established connection, as seen from one side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Link {
    id: u64,
    peer: String,
}

impl Link {
    /// Create a link handle.
    #[must_use]
    pub fn new(id: u64, peer: impl Into<String>) -> Self {
        Self {
            id,
            peer: peer.into(),
        }
    }

    /// Transport-assigned link id.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Human-readable name of the far side.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl std::fmt::Display for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.peer, self.id)
    }
}

/// Signals delivered for one outgoing connection attempt.
///
/// The first `Connected`, `Refused`, `Closed` or `Destroyed` is terminal for
/// the attempt itself. After `Connected`, the same stream later reports the
/// link going away.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkSignal {
    /// The link is established and writable.
    Connected(Link),
    /// The peer refused the link.
    Refused(String),
    /// The link closed.
    Closed,
    /// The link was torn down by the far side.
    Destroyed,
    /// Housekeeping, never terminal.
    Notice(String),
}

/// Per-attempt signal stream returned by [`Transport::connect_to`].
pub type LinkAttempt = mpsc::UnboundedReceiver<LinkSignal>;

/// Events pushed by the transport into its attached endpoint.
#[derive(Debug)]
pub enum TransportEvent {
    /// One inbound frame.
    Frame { link: Link, bytes: Vec<u8> },
    /// A remote endpoint linked to our served name.
    Connected { link: Link },
    /// An inbound link closed.
    Disconnected { link: Link },
    /// An inbound link was torn down.
    Destroyed { link: Link },
    /// A transport-level failure not tied to a specific request.
    Error(TransportError),
}

/// Sending half the endpoint hands to its transport.
pub type EventSink = mpsc::UnboundedSender<TransportEvent>;

/// Errors raised by transport adapters.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// No endpoint is attached to this transport.
    #[error("Transport is not attached to an endpoint")]
    NotAttached,

    /// Another endpoint already serves this name.
    #[error("Endpoint name already served: {0}")]
    AddressInUse(String),

    /// The link is closed or unknown.
    #[error("Link {0} is closed")]
    LinkClosed(u64),

    /// I/O error from a socket-backed transport.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raw framed byte delivery between named endpoints.
///
/// Each endpoint owns its own transport instance. The transport pushes
/// inbound frames and link lifecycle events into the sink given to
/// [`Transport::attach`]; outgoing links report through the per-attempt
/// stream returned by [`Transport::connect_to`].
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Install the sink inbound events are pushed into.
    fn attach(&self, sink: EventSink);

    /// Start accepting links under `name`.
    async fn serve(&self, name: &str) -> Result<(), TransportError>;

    /// Begin establishing a link to `peer`.
    async fn connect_to(&self, peer: &str) -> Result<LinkAttempt, TransportError>;

    /// Write one frame on `link`.
    async fn write(&self, link: &Link, frame: Vec<u8>) -> Result<(), TransportError>;

    /// Close every outgoing link to `peer`.
    async fn disconnect(&self, peer: &str);

    /// Stop serving and release every link.
    async fn stop(&self);
}
