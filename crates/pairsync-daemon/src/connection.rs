//! The TCP link to the other peer.
//!
//! Either peer may start first. Bootstrap tries to dial the peer, and if
//! nobody answers it listens for a bounded time instead; whichever side
//! connects out becomes the [`Mode::Client`], the side that accepts becomes
//! the [`Mode::Server`].
//!
//! After a broken connection, [`PeerLink::resume`] recovers according to the
//! last mode:
//! - Server: accept again on the listener it kept open
//! - Client: try to become the server once, else bootstrap from scratch

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Pending connections the listener queues.
pub const LISTEN_BACKLOG: u32 = 2;

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Failed to connect to {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("Timed out connecting to {addr}")]
    DialTimeout { addr: String },

    #[error("Failed to listen on {addr}: {source}")]
    Listen {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("No connection on {addr} within {timeout:?}")]
    AcceptTimeout { addr: String, timeout: Duration },

    #[error("Failed to accept on {addr}: {source}")]
    Accept {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Role of this peer on the current link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// No live connection
    Unconnected,
    /// We dialed the peer; we drive the command loop
    Client,
    /// We accepted the peer; we follow its commands
    Server,
}

/// Events that move a link between modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// An outbound connection succeeded
    Dialed,
    /// An inbound connection was accepted
    Accepted,
    /// A dial or listen attempt failed
    AttemptFailed,
    /// Recovery after a disconnect failed
    ResumeFailed,
}

/// What [`PeerLink::resume`] does for a given mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePlan {
    /// Accept a new connection on the listener kept from the last accept
    Reaccept,
    /// Try once to listen and accept, taking over the server role
    Relisten,
    /// Run the full bootstrap procedure
    Bootstrap,
}

impl Mode {
    pub fn next(self, transition: Transition) -> Mode {
        match transition {
            Transition::Dialed => Mode::Client,
            Transition::Accepted => Mode::Server,
            Transition::AttemptFailed => self,
            Transition::ResumeFailed => Mode::Unconnected,
        }
    }

    pub fn resume_plan(self) -> ResumePlan {
        match self {
            Mode::Server => ResumePlan::Reaccept,
            Mode::Client => ResumePlan::Relisten,
            Mode::Unconnected => ResumePlan::Bootstrap,
        }
    }
}

/// Where to find the peer and how to wait for it.
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Host name or IP address of the other peer
    pub peer_host: String,
    /// Port used both to dial and to listen
    pub port: u16,
    /// Local address to listen on
    pub listen_host: String,
    /// Bound on a single dial or listening attempt
    pub accept_timeout: Duration,
    /// Pause after a listen attempt that could not even bind
    pub retry_delay: Duration,
}

/// The single connection to the other peer, plus the state needed to recover it.
pub struct PeerLink {
    config: LinkConfig,
    mode: Mode,
    /// Live connection (None while unconnected)
    stream: Option<TcpStream>,
    /// Listening socket kept open while we are the server
    listener: Option<TcpListener>,
}

impl PeerLink {
    pub fn new(config: LinkConfig) -> Self {
        Self {
            config,
            mode: Mode::Unconnected,
            stream: None,
            listener: None,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    /// The live connection, if any.
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    fn apply(&mut self, transition: Transition) {
        let next = self.mode.next(transition);
        if next != self.mode {
            debug!("Link mode {:?} -> {:?} ({:?})", self.mode, next, transition);
        }
        self.mode = next;
    }

    fn peer_addr(&self) -> String {
        format!("{}:{}", self.config.peer_host, self.config.port)
    }

    /// Negotiate a role with the peer.
    ///
    /// Alternates dialing and listening until one of them succeeds; never
    /// gives up.
    pub async fn start(&mut self) {
        self.stream = None;
        self.listener = None;
        self.mode = Mode::Unconnected;

        loop {
            info!("Trying to connect to {}", self.peer_addr());
            match self.dial().await {
                Ok(stream) => {
                    self.stream = Some(stream);
                    self.apply(Transition::Dialed);
                    info!("Connected to {}, running as client", self.peer_addr());
                    return;
                }
                Err(e) => {
                    info!("Peer is not up ({}), running as server", e);
                    self.apply(Transition::AttemptFailed);
                }
            }

            match self.listen_once().await {
                Ok(()) => return,
                Err(e) => {
                    info!("{}, trying again", e);
                    self.apply(Transition::AttemptFailed);
                    if matches!(e, ConnectError::Listen { .. }) {
                        sleep(self.config.retry_delay).await;
                    }
                }
            }
        }
    }

    /// Re-establish the link after the connection broke.
    pub async fn resume(&mut self) {
        self.stream = None;

        match self.mode.resume_plan() {
            ResumePlan::Reaccept => match self.reaccept().await {
                Ok(()) => {}
                Err(e) => {
                    warn!("Failed to resume ({}), restarting", e);
                    self.apply(Transition::ResumeFailed);
                    self.start().await;
                }
            },
            ResumePlan::Relisten => match self.listen_once().await {
                Ok(()) => {}
                Err(e) => {
                    info!("Failed to resume ({}), restarting", e);
                    self.apply(Transition::ResumeFailed);
                    self.start().await;
                }
            },
            ResumePlan::Bootstrap => self.start().await,
        }
    }

    async fn dial(&self) -> Result<TcpStream, ConnectError> {
        let addr = self.peer_addr();
        let connect = TcpStream::connect((self.config.peer_host.as_str(), self.config.port));
        match timeout(self.config.accept_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(source)) => Err(ConnectError::Dial { addr, source }),
            Err(_) => Err(ConnectError::DialTimeout { addr }),
        }
    }

    fn bind(&self) -> Result<TcpListener, ConnectError> {
        let addr = format!("{}:{}", self.config.listen_host, self.config.port);
        let listen_error = |source| ConnectError::Listen {
            addr: addr.clone(),
            source,
        };

        let ip: IpAddr = self
            .config
            .listen_host
            .parse()
            .map_err(|e| listen_error(io::Error::new(io::ErrorKind::InvalidInput, e)))?;
        let socket_addr = SocketAddr::new(ip, self.config.port);

        let socket = match socket_addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(listen_error)?;
        socket.set_reuseaddr(true).map_err(listen_error)?;
        socket.bind(socket_addr).map_err(listen_error)?;
        socket.listen(LISTEN_BACKLOG).map_err(listen_error)
    }

    /// Bind, listen and wait a bounded time for the peer.
    ///
    /// On success the listener is kept for later re-accepts.
    async fn listen_once(&mut self) -> Result<(), ConnectError> {
        let listener = self.bind()?;
        let addr = format!("{}:{}", self.config.listen_host, self.config.port);
        info!("Ready to accept connection on {}", addr);

        let accepted = timeout(self.config.accept_timeout, listener.accept()).await;
        match accepted {
            Ok(Ok((stream, peer))) => {
                info!("Accepted connection from {}", peer);
                self.stream = Some(stream);
                self.listener = Some(listener);
                self.apply(Transition::Accepted);
                Ok(())
            }
            Ok(Err(source)) => Err(ConnectError::Accept { addr, source }),
            Err(_) => Err(ConnectError::AcceptTimeout {
                addr,
                timeout: self.config.accept_timeout,
            }),
        }
    }

    /// Wait, without a bound, for the peer to come back on the kept listener.
    async fn reaccept(&mut self) -> Result<(), ConnectError> {
        let addr = format!("{}:{}", self.config.listen_host, self.config.port);
        let Some(listener) = self.listener.as_ref() else {
            return Err(ConnectError::Accept {
                addr,
                source: io::Error::new(io::ErrorKind::NotConnected, "no listening socket"),
            });
        };

        info!("Waiting for the peer to reconnect on {}", addr);
        let accepted = listener.accept().await;
        match accepted {
            Ok((stream, peer)) => {
                info!("Accepted connection from {}", peer);
                self.stream = Some(stream);
                self.apply(Transition::Accepted);
                Ok(())
            }
            Err(source) => {
                self.listener = None;
                Err(ConnectError::Accept { addr, source })
            }
        }
    }
}
