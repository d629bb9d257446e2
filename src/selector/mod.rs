//! The readiness-based outer loop
//!
//! A thin driver built on `mio` that owns a `Poll`, a listener, and a
//! token-indexed table of channels. It contains no MQTT semantics: it turns
//! readiness events into calls to a channel's `finish_connect`/`read`/
//! `write` entry points and calls `housekeep` on every channel once per
//! iteration so resend and keep-alive fire even on an idle socket.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, warn};

use crate::channel::{Channel, ChannelRole, Handler, Statistics};
use crate::completion::CompletionHandle;

const LISTENER_TOKEN: Token = Token(0);
const WAKE_TOKEN: Token = Token(usize::MAX);
const FIRST_CHANNEL_TOKEN: usize = 1;

/// Owns the listening socket and every established channel, and drives them
/// all from a single thread.
pub struct SelectorLoop<R: ChannelRole, H: Handler<R>> {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    channels: HashMap<Token, Channel<R, H>>,
    next_token: usize,
    resend_interval_ms: i64,
    make_handler: Box<dyn FnMut() -> H + Send>,
    make_role: Box<dyn FnMut() -> R + Send>,
}

impl<R: ChannelRole, H: Handler<R>> SelectorLoop<R, H> {
    /// Binds `addr` (port `0` selects an ephemeral port) and prepares the
    /// loop. `make_role`/`make_handler` construct fresh role/handler
    /// instances for each accepted or outgoing connection.
    pub fn bind(
        addr: SocketAddr,
        resend_interval_ms: i64,
        make_role: impl FnMut() -> R + Send + 'static,
        make_handler: impl FnMut() -> H + Send + 'static,
    ) -> io::Result<Self> {
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            listener,
            channels: HashMap::new(),
            next_token: FIRST_CHANNEL_TOKEN,
            resend_interval_ms,
            make_handler: Box::new(make_handler),
            make_role: Box::new(make_role),
        })
    }

    /// The address the listener actually bound to; useful when `addr`'s
    /// port was `0`.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Creates a [`Waker`] that interrupts a blocked [`Self::run_once`] call
    /// from another thread. Lets a caller driving this loop on a background
    /// thread sleep for a housekeeping-computed deadline of any length
    /// (rather than polling on a short fixed interval) while still reacting
    /// to a shutdown request immediately.
    pub fn make_waker(&self) -> io::Result<Waker> {
        Waker::new(self.poll.registry(), WAKE_TOKEN)
    }

    fn next_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    fn accept_all(&mut self, now: i64) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let token = self.next_token();
                    let stats = std::sync::Arc::new(Statistics::new());
                    let role = (self.make_role)();
                    let handler = (self.make_handler)();
                    let mut channel = Channel::incoming(
                        token,
                        stream,
                        role,
                        handler,
                        stats,
                        self.resend_interval_ms,
                        now,
                    );
                    match self.poll.registry().try_clone() {
                        Ok(registry) => {
                            if let Err(e) = channel.register(registry, token) {
                                warn!(error = %e, "failed to register accepted channel");
                                continue;
                            }
                            debug!(?peer, ?token, "accepted connection");
                            self.channels.insert(token, channel);
                        }
                        Err(e) => {
                            error!(error = %e, "failed to clone selector registry");
                        }
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Polls for readiness (bounded by `timeout`), dispatches every event,
    /// runs housekeeping on every channel, and drops channels that closed
    /// during this iteration. Returns the minimum deadline any remaining
    /// channel reported, for the caller to use as the next poll timeout.
    ///
    /// `start` anchors the millisecond clock every channel entry point sees
    /// as `now`; it's read fresh right after `poll()` returns rather than
    /// before the call, since `poll()` itself may have blocked for most or
    /// all of the previous deadline and a pre-poll timestamp would leave
    /// every resend/keep-alive check in this iteration working off a clock
    /// that's stale by however long the poll just slept.
    pub fn run_once(&mut self, timeout: Option<Duration>, start: Instant) -> io::Result<Option<Duration>> {
        self.poll.poll(&mut self.events, timeout)?;
        let now = start.elapsed().as_millis() as i64;

        // `mio::Event` borrows `self.events`; collect what's needed up front
        // so the loop below can mutate `self.channels` freely.
        let mut saw_listener = false;
        let events: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|e| {
                if e.token() == LISTENER_TOKEN {
                    saw_listener = true;
                }
                (e.token(), e.is_readable(), e.is_writable())
            })
            .collect();

        if saw_listener {
            self.accept_all(now);
        }

        for (token, readable, writable) in events {
            if token == LISTENER_TOKEN {
                continue;
            }
            if let Some(channel) = self.channels.get_mut(&token) {
                if writable {
                    let _ = channel.finish_connect(now);
                    if !channel.is_closed() {
                        let _ = channel.write(now);
                    }
                }
                if !channel.is_closed() && readable {
                    let _ = channel.read(now);
                }
            }
        }

        let mut deadline = i64::MAX;
        self.channels.retain(|_, channel| {
            if channel.is_closed() {
                return false;
            }
            let d = channel.housekeep(now);
            if !channel.is_closed() {
                deadline = deadline.min(d);
            }
            !channel.is_closed()
        });

        if deadline == i64::MAX {
            Ok(None)
        } else {
            Ok(Some(Duration::from_millis(deadline.max(0) as u64)))
        }
    }

    /// Connects to `addr` as an outgoing channel and registers it. Returns
    /// the new channel's token.
    pub fn connect(
        &mut self,
        addr: SocketAddr,
        now: i64,
        connection_complete: Option<CompletionHandle<()>>,
    ) -> io::Result<Token> {
        let stream = TcpStream::connect(addr)?;
        let token = self.next_token();
        let stats = std::sync::Arc::new(Statistics::new());
        let role = (self.make_role)();
        let handler = (self.make_handler)();
        let mut channel = Channel::outgoing(
            token,
            stream,
            role,
            handler,
            stats,
            self.resend_interval_ms,
            now,
            connection_complete,
        );
        let registry = self.poll.registry().try_clone()?;
        channel
            .register(registry, token)
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.channels.insert(token, channel);
        Ok(token)
    }
}
