//! Relay instance: one local port, one remote, one event loop.

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Shutdown, SocketAddr};
use std::time::Duration;

use mio::event::Event;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token};
use slab::Slab;
use tracing::{debug, info, warn};

use super::state::{Flow, RelayState};
use crate::error::{Error, Result};
use crate::route::RouteDescriptor;

/// Upper bound on one readiness wait.
pub const POLL_TIMEOUT: Duration = Duration::from_secs(10);

const EVENTS_CAPACITY: usize = 1024;

/// Longest wait before accepting again after the listener failed.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

const LISTENER: Token = Token(0);

fn channel_token(key: usize) -> Token {
    Token(key + 1)
}

fn channel_key(token: Token) -> usize {
    token.0 - 1
}

/// One socket of a connection pair.
struct Channel {
    stream: TcpStream,
    /// The other side of the pair.
    peer: Token,
    /// Interest currently registered, `None` while deregistered.
    interest: Option<Interest>,
}

impl Channel {
    fn new(stream: TcpStream, peer: Token) -> Self {
        Self {
            stream,
            peer,
            interest: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
}

impl From<&Event> for Readiness {
    fn from(event: &Event) -> Self {
        Self {
            token: event.token(),
            readable: event.is_readable() || event.is_read_closed() || event.is_error(),
            writable: event.is_writable() || event.is_write_closed() || event.is_error(),
        }
    }
}

/// Forwards every connection accepted on a local port to one fixed remote.
///
/// All state is owned by the instance and mutated only from [`turn`](Self::turn),
/// so an instance needs no locking and is driven by exactly one thread at a time.
///
/// Each accepted connection becomes a pair of channels with one [`RelayState`]
/// per direction. A state sits in `pending` keyed by its source while intake is
/// running, and in `stalled` keyed by its destination while the destination is
/// behind; it is never in both.
pub struct RelayInstance {
    local_addr: SocketAddr,
    remote_addr: SocketAddr,
    poll: Poll,
    events: Events,
    ready: Vec<Readiness>,
    listener: TcpListener,
    /// The last accept pass stopped on an error with the backlog maybe
    /// non-empty; no new readiness edge is guaranteed for it.
    accept_deferred: bool,
    channels: Slab<Channel>,
    /// Outbound channels waiting for connect completion.
    connecting: HashSet<Token>,
    pending: HashMap<Token, RelayState>,
    stalled: HashMap<Token, RelayState>,
}

impl RelayInstance {
    /// Bind `local` and prepare the event loop for relaying to `remote`.
    pub fn bind(local: SocketAddr, remote: SocketAddr) -> Result<Self> {
        let poll = Poll::new().map_err(Error::Poll)?;
        let mut listener = TcpListener::bind(local).map_err(|source| Error::Bind {
            addr: local,
            source,
        })?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)
            .map_err(Error::Poll)?;
        let local_addr = listener.local_addr()?;

        info!("Relay listening on {} -> {}", local_addr, remote);

        Ok(Self {
            local_addr,
            remote_addr: remote,
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            ready: Vec::with_capacity(EVENTS_CAPACITY),
            listener,
            accept_deferred: false,
            channels: Slab::new(),
            connecting: HashSet::new(),
            pending: HashMap::new(),
            stalled: HashMap::new(),
        })
    }

    /// Resolve the route's remote host and bind its local port on `host`.
    pub fn from_route(route: &RouteDescriptor, host: IpAddr) -> Result<Self> {
        let remote = route.resolve_remote()?;
        Self::bind(route.local_addr(host), remote)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    /// Drive the event loop until the multiplexer fails.
    ///
    /// Only returns with the fatal error; every resource is closed by then.
    pub fn run(mut self) -> Result<()> {
        loop {
            if let Err(e) = self.turn(Some(POLL_TIMEOUT)) {
                self.close();
                return Err(e);
            }
        }
    }

    /// Wait up to `timeout` for readiness and dispatch every ready event once.
    ///
    /// While a failed accept waits to be retried, the wait is capped at 100ms.
    pub fn turn(&mut self, timeout: Option<Duration>) -> Result<()> {
        let mut timeout = timeout;
        if self.accept_deferred {
            self.accept();
        }
        if self.accept_deferred {
            timeout = Some(timeout.map_or(ACCEPT_RETRY, |t| t.min(ACCEPT_RETRY)));
        }

        if let Err(e) = self.poll.poll(&mut self.events, timeout) {
            if e.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(Error::Poll(e));
        }

        let mut ready = std::mem::take(&mut self.ready);
        ready.extend(self.events.iter().map(Readiness::from));
        for readiness in &ready {
            self.dispatch(*readiness);
        }
        ready.clear();
        self.ready = ready;
        Ok(())
    }

    /// Deregister and close the listener and every live connection.
    ///
    /// Failures are logged and skipped. The multiplexer closes on drop.
    pub fn close(mut self) {
        let registry = self.poll.registry();
        if let Err(e) = registry.deregister(&mut self.listener) {
            warn!(
                "Failed to deregister listener on {}: {}",
                self.local_addr, e
            );
        }
        let connections = self.channels.len() / 2;
        for mut channel in self.channels.drain() {
            release(registry, &mut channel);
        }
        self.connecting.clear();
        self.pending.clear();
        self.stalled.clear();

        info!(
            "Relay on {} closed, dropped {} connection(s)",
            self.local_addr, connections
        );
    }

    fn dispatch(&mut self, ready: Readiness) {
        if ready.token == LISTENER {
            self.accept();
            return;
        }
        if self.connecting.contains(&ready.token) {
            if ready.writable {
                self.finish_connect(ready.token);
            }
            return;
        }
        if ready.writable {
            self.on_writable(ready.token);
        }
        if ready.readable {
            self.on_readable(ready.token);
        }
    }

    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((inbound, client_addr)) => {
                    debug!("Accepted {} on {}", client_addr, self.local_addr);
                    self.connect_remote(inbound);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    self.accept_deferred = false;
                    return;
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    // Out of descriptors and the like: retry on the next turn.
                    warn!("Incoming connection on {} failed: {}", self.local_addr, e);
                    self.accept_deferred = true;
                    return;
                }
            }
        }
    }

    /// Start a non-blocking connect for `inbound`; the pair is completed in
    /// [`finish_connect`](Self::finish_connect).
    fn connect_remote(&mut self, inbound: TcpStream) {
        let outbound = match TcpStream::connect(self.remote_addr) {
            Ok(stream) => stream,
            Err(e) => {
                warn!("Outgoing connection to {} failed: {}", self.remote_addr, e);
                return;
            }
        };

        let inbound_key = self.channels.insert(Channel::new(inbound, LISTENER));
        let inbound_token = channel_token(inbound_key);
        let outbound_token =
            channel_token(self.channels.insert(Channel::new(outbound, inbound_token)));
        self.channels[inbound_key].peer = outbound_token;

        self.connecting.insert(outbound_token);
        if let Err(e) = self.sync_interest(outbound_token) {
            warn!(
                "Failed to register outgoing connection to {}: {}",
                self.remote_addr, e
            );
            self.teardown(outbound_token);
        }
    }

    fn finish_connect(&mut self, outbound: Token) {
        let Some(channel) = self.channels.get(channel_key(outbound)) else {
            return;
        };
        let inbound = channel.peer;
        let status = match channel.stream.take_error() {
            Ok(Some(e)) | Err(e) => Err(e),
            Ok(None) => channel.stream.peer_addr().map(|_| ()),
        };

        match status {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotConnected => return,
            Err(e) => {
                warn!("Outgoing connection to {} failed: {}", self.remote_addr, e);
                self.teardown(outbound);
                return;
            }
        }

        self.connecting.remove(&outbound);
        self.pending.insert(inbound, RelayState::new(inbound, outbound));
        self.pending.insert(outbound, RelayState::new(outbound, inbound));
        debug!("Pair {:?}<->{:?} on {}", inbound, outbound, self.local_addr);

        if self.sync_pair(inbound, outbound) {
            // Bytes may have queued up on either side while connecting.
            self.on_readable(inbound);
            self.on_readable(outbound);
        }
    }

    /// Read-forward path for a source in `pending`.
    fn on_readable(&mut self, source: Token) {
        let Some(mut state) = self.pending.remove(&source) else {
            return;
        };
        let destination = state.destination;

        let flow = match (
            self.channels.get(channel_key(source)),
            self.channels.get(channel_key(destination)),
        ) {
            (Some(src), Some(dst)) => state.pump(&src.stream, &dst.stream),
            _ => return,
        };

        match flow {
            Ok(Flow::Drained) => {
                self.pending.insert(source, state);
            }
            Ok(Flow::Stalled) => {
                debug!("{:?} stalled with {} byte(s)", source, state.buffered());
                self.stalled.insert(destination, state);
                self.sync_pair(source, destination);
            }
            Ok(Flow::Finished) => self.finish_direction(source, destination),
            Err(e) => {
                debug!(
                    "Read from {:?} on {} failed: {}",
                    source, self.local_addr, e
                );
                self.teardown(source);
            }
        }
    }

    /// Flush path for a destination in `stalled`.
    fn on_writable(&mut self, destination: Token) {
        let Some(mut state) = self.stalled.remove(&destination) else {
            return;
        };
        let source = state.source;

        let flushed = match self.channels.get(channel_key(destination)) {
            Some(dst) => state.flush(&dst.stream),
            None => return,
        };

        match flushed {
            Ok(false) => {
                self.stalled.insert(destination, state);
            }
            Ok(true) => {
                debug!("{:?} drained, resuming {:?}", destination, source);
                self.pending.insert(source, state);
                if self.sync_pair(source, destination) {
                    // The source was left unread when it stalled, so no new
                    // readiness edge is guaranteed.
                    self.on_readable(source);
                }
            }
            Err(e) => {
                debug!(
                    "Write to {:?} on {} failed: {}",
                    destination, self.local_addr, e
                );
                self.teardown(destination);
            }
        }
    }

    /// `source` hit end of stream: half-close towards the destination, or
    /// tear the pair down if the other direction already ended.
    fn finish_direction(&mut self, source: Token, destination: Token) {
        let reverse_open =
            self.pending.contains_key(&destination) || self.stalled.contains_key(&source);
        if !reverse_open {
            debug!("Pair {:?}<->{:?} closed", source, destination);
            self.teardown(source);
            return;
        }

        let shutdown = self
            .channels
            .get(channel_key(destination))
            .map(|dst| dst.stream.shutdown(Shutdown::Write));
        if let Some(Err(e)) = shutdown {
            debug!("Shutdown of {:?} failed: {}", destination, e);
            self.teardown(source);
            return;
        }
        self.sync_pair(source, destination);
    }

    /// Sync both channels' interest; tears the pair down on failure.
    fn sync_pair(&mut self, a: Token, b: Token) -> bool {
        for token in [a, b] {
            if let Err(e) = self.sync_interest(token) {
                warn!("Failed to update interest for {:?}: {}", token, e);
                self.teardown(token);
                return false;
            }
        }
        true
    }

    /// Register exactly the interest the tables call for: readable while the
    /// channel is a source in `pending`, writable while it is a stalled
    /// destination or still connecting.
    fn sync_interest(&mut self, token: Token) -> io::Result<()> {
        let readable = self.pending.contains_key(&token);
        let writable = self.stalled.contains_key(&token) || self.connecting.contains(&token);
        let wanted = match (readable, writable) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        };

        let Some(channel) = self.channels.get_mut(channel_key(token)) else {
            return Ok(());
        };
        if channel.interest == wanted {
            return Ok(());
        }

        let registry = self.poll.registry();
        match (channel.interest, wanted) {
            (None, Some(interest)) => registry.register(&mut channel.stream, token, interest)?,
            (Some(_), Some(interest)) => {
                registry.reregister(&mut channel.stream, token, interest)?
            }
            (Some(_), None) => registry.deregister(&mut channel.stream)?,
            (None, None) => {}
        }
        channel.interest = wanted;
        Ok(())
    }

    /// Remove both channels of the pair `token` belongs to from every table
    /// and close them.
    fn teardown(&mut self, token: Token) {
        let Some(peer) = self.channels.get(channel_key(token)).map(|c| c.peer) else {
            return;
        };

        let registry = self.poll.registry();
        for token in [token, peer] {
            self.pending.remove(&token);
            self.stalled.remove(&token);
            self.connecting.remove(&token);
            if let Some(mut channel) = self.channels.try_remove(channel_key(token)) {
                release(registry, &mut channel);
            }
        }
    }
}

/// Deregister a channel that is about to be dropped. Dropping closes the socket.
fn release(registry: &Registry, channel: &mut Channel) {
    if channel.interest.take().is_some() {
        if let Err(e) = registry.deregister(&mut channel.stream) {
            debug!("Failed to deregister channel: {}", e);
        }
    }
}
