//! The per-connection channel state machine
//!
//! Drives a single non-blocking TCP socket that speaks MQTT 3.1: frames
//! inbound bytes into packets, queues and drains outbound packets, tracks
//! ackable sends until their acknowledgement arrives, and schedules resend
//! and keep-alive work. Every entry point that depends on wall-clock time
//! takes an explicit `now` (milliseconds) from the caller instead of reading
//! the clock itself, so tests can drive it with an injected time source.
//!
//! Split into [`ChannelCore`] (socket, framing, queues, in-flight map — owns
//! no handler) and [`Channel`] (core plus the handler). The split exists so
//! a handler upcall can receive `&mut ChannelCore` and send a reply in-line
//! without the borrow checker objecting to a channel calling back into its
//! own handler field while that field is itself borrowed.

mod error;
mod handler;
mod role;
mod stats;

pub use error::ChannelError;
pub use handler::Handler;
pub use role::{BrokerRole, ChannelRole, ClientRole};
pub use stats::Statistics;

use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry};
use tracing::{debug, warn};

use crate::codec::{read_variable_int, Decoder, Encoder};
use crate::completion::CompletionHandle;
use crate::protocol::{DecodeError, Packet, PingReq, PingResp};

/// Identifies a channel to its handler and to the selector loop that owns
/// it. Reuses `mio::Token` rather than inventing a parallel id scheme.
pub type ChannelId = mio::Token;

/// Maximum header bytes a fixed header + remaining length can occupy: one
/// packet-type byte plus up to four variable-length-integer bytes.
const MAX_HEADER_LEN: usize = 5;

#[derive(Debug)]
enum ReadState {
    /// Accumulating the fixed header byte and the variable-length remaining
    /// length that follows it.
    Header { buf: [u8; MAX_HEADER_LEN], len: usize },
    /// Accumulating the full frame (header already copied in) into a
    /// pre-sized buffer, so a resend never needs to re-encode.
    Body { buf: BytesMut, pos: usize },
}

struct PendingSend {
    packet: Packet,
    completion: Option<CompletionHandle<Packet>>,
    cursor: usize,
    /// `Some(t)` when this send is a resend of a packet first transmitted at
    /// `t`; keeps `original-send-time` from drifting across resends.
    original_send_time: Option<i64>,
}

struct InFlightEntry {
    packet: Packet,
    completion: Option<CompletionHandle<Packet>>,
    original_send_time: i64,
    next_send_time: i64,
}

enum PollReadResult {
    NoMoreData,
    PeerClosed,
    Packet(Packet),
}

enum FinishConnectOutcome {
    NotConnecting,
    Connected,
    Failed(ChannelError),
}

/// Everything a channel owns except its handler: socket, registered
/// interest, framing state, send queue, in-flight map, and timers. Passed to
/// every [`Handler`] upcall so a handler can send a reply in-line.
pub struct ChannelCore<R: ChannelRole> {
    id: ChannelId,
    stream: TcpStream,
    registry: Option<Registry>,
    role: R,
    stats: Arc<Statistics>,
    decoder: Decoder,

    read_state: ReadState,
    paused_reads: bool,

    in_progress: Option<PendingSend>,
    write_queue: VecDeque<PendingSend>,
    write_interest_armed: bool,

    in_flight: HashMap<u16, InFlightEntry>,

    connecting: bool,
    connected: bool,
    closed: bool,

    last_received_time: i64,
    last_sent_time: i64,
    ping_interval_ms: i64,
    resend_interval_ms: i64,

    conn_ack_completion: Option<CompletionHandle<Packet>>,
    connection_complete: Option<CompletionHandle<()>>,
    pending_close: Option<Option<ChannelError>>,
}

impl<R: ChannelRole> ChannelCore<R> {
    #[allow(clippy::too_many_arguments)]
    fn new(
        id: ChannelId,
        stream: TcpStream,
        role: R,
        stats: Arc<Statistics>,
        resend_interval_ms: i64,
        now: i64,
        connecting: bool,
    ) -> Self {
        Self {
            id,
            stream,
            registry: None,
            role,
            stats,
            decoder: Decoder::new(),
            read_state: ReadState::Header {
                buf: [0u8; MAX_HEADER_LEN],
                len: 0,
            },
            paused_reads: false,
            in_progress: None,
            write_queue: VecDeque::new(),
            write_interest_armed: false,
            in_flight: HashMap::new(),
            connecting,
            connected: false,
            closed: false,
            last_received_time: now,
            last_sent_time: now,
            ping_interval_ms: 0,
            resend_interval_ms,
            conn_ack_completion: None,
            connection_complete: None,
            pending_close: None,
        }
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        &self.stats
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Number of ackable packets currently awaiting their acknowledgement.
    /// Lets a handler (e.g. the mock broker) throttle fan-out against a
    /// per-session in-flight ceiling without duplicating the channel's own
    /// bookkeeping.
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Ackable packets that are either awaiting acknowledgement or still
    /// sitting in the send queue, not yet drained to the socket. A handler
    /// gating sends against a ceiling within a single upcall must count
    /// against this, not [`Self::in_flight_count`] alone: packets it just
    /// handed to [`Self::send`] don't join the in-flight map until a later
    /// `write()` drains them.
    pub fn outstanding_ackable_count(&self) -> usize {
        let queued = self
            .in_progress
            .iter()
            .chain(self.write_queue.iter())
            .filter(|pending| pending.packet.is_ackable())
            .count();
        self.in_flight.len() + queued
    }

    pub fn peer_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.stream.peer_addr()
    }

    pub fn pause_reads(&mut self) {
        self.paused_reads = true;
        self.sync_interest();
    }

    pub fn resume_reads(&mut self) {
        self.paused_reads = false;
        self.sync_interest();
    }

    /// Requests that the channel close once the in-progress upcall returns.
    /// Call sites drain this after every dispatch point (read, write,
    /// housekeep) rather than closing from the middle of a handler upcall.
    pub fn request_close(&mut self, cause: Option<ChannelError>) {
        if self.pending_close.is_none() {
            self.pending_close = Some(cause);
        }
    }

    fn take_pending_close(&mut self) -> Option<Option<ChannelError>> {
        self.pending_close.take()
    }

    fn desired_interest(&self) -> Interest {
        let want_write = self.in_progress.is_some() || self.connecting;
        match (!self.paused_reads, want_write) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (true, false) => Interest::READABLE,
            (false, true) => Interest::WRITABLE,
            (false, false) => Interest::READABLE,
        }
    }

    fn sync_interest(&mut self) {
        let interest = self.desired_interest();
        let want_write = interest.is_writable();
        if want_write == self.write_interest_armed {
            return;
        }
        if let Some(registry) = &self.registry {
            if let Err(e) = registry.reregister(&mut self.stream, self.id, interest) {
                warn!(channel = ?self.id, error = %e, "failed to reregister interest");
            }
        }
        self.write_interest_armed = want_write;
    }

    /// Registers this channel's socket with a selector under `id`. Fails if
    /// a registration already exists.
    pub fn register(&mut self, registry: Registry, id: ChannelId) -> Result<(), ChannelError> {
        if self.registry.is_some() {
            return Err(ChannelError::AlreadyRegistered);
        }
        let interest = self.desired_interest();
        registry.register(&mut self.stream, id, interest)?;
        self.id = id;
        self.write_interest_armed = interest.is_writable();
        self.registry = Some(registry);
        Ok(())
    }

    /// Cancels the selector registration without closing the socket.
    /// Returns whether a registration actually existed.
    fn deregister(&mut self) -> bool {
        if let Some(registry) = self.registry.take() {
            let _ = registry.deregister(&mut self.stream);
            self.write_interest_armed = false;
            true
        } else {
            false
        }
    }

    fn finish_connect(&mut self, now: i64) -> FinishConnectOutcome {
        if !self.connecting {
            return FinishConnectOutcome::NotConnecting;
        }
        self.connecting = false;
        match self.stream.take_error() {
            Ok(None) => {
                self.last_received_time = now;
                self.last_sent_time = now;
                if let Some(comp) = self.connection_complete.take() {
                    comp.complete_success(());
                }
                self.sync_interest();
                FinishConnectOutcome::Connected
            }
            Ok(Some(e)) => {
                let cause = ChannelError::from(e);
                if let Some(comp) = self.connection_complete.take() {
                    comp.complete_failure(cause.clone());
                }
                FinishConnectOutcome::Failed(cause)
            }
            Err(e) => FinishConnectOutcome::Failed(ChannelError::from(e)),
        }
    }

    /// Enqueues `packet` for transmission. A CONNECT's completion resolves
    /// on the matching CONNACK, not on the CONNECT itself draining.
    pub fn send(&mut self, packet: Packet, completion: Option<CompletionHandle<Packet>>) {
        if self.closed {
            if let Some(c) = completion {
                c.complete_failure(ChannelError::PeerClosed);
            }
            return;
        }

        if matches!(packet, Packet::Connect(_)) {
            self.conn_ack_completion = completion;
            self.enqueue(PendingSend {
                packet,
                completion: None,
                cursor: 0,
                original_send_time: None,
            });
        } else {
            self.enqueue(PendingSend {
                packet,
                completion,
                cursor: 0,
                original_send_time: None,
            });
        }
    }

    fn enqueue(&mut self, pending: PendingSend) {
        if self.in_progress.is_some() {
            self.write_queue.push_back(pending);
        } else {
            self.in_progress = Some(pending);
        }
        self.sync_interest();
    }

    /// Drains as much of the in-progress send (and queued sends behind it)
    /// as the socket accepts without blocking. Returns every packet that
    /// fully drained, in order, so the caller can run `message_sent` upcalls
    /// for them.
    fn drain_write(&mut self, now: i64) -> Result<Vec<Packet>, ChannelError> {
        let mut sent = Vec::new();
        loop {
            if self.in_progress.is_none() {
                break;
            }

            let wrote_fully = {
                let pending = self.in_progress.as_mut().unwrap();
                let raw = pending.packet.raw().clone();
                match self.stream.write(&raw[pending.cursor..]) {
                    Ok(0) => false,
                    Ok(n) => {
                        pending.cursor += n;
                        pending.cursor >= raw.len()
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(sent),
                    Err(e) => return Err(e.into()),
                }
            };

            if !wrote_fully {
                break;
            }

            let pending = self.in_progress.take().unwrap();
            let packet = self.finish_send(now, pending);
            sent.push(packet);
            self.in_progress = self.write_queue.pop_front();
        }
        self.sync_interest();
        Ok(sent)
    }

    fn finish_send(&mut self, now: i64, mut pending: PendingSend) -> Packet {
        self.last_sent_time = now;
        let dup = pending.packet.dup();
        self.stats.record_sent(dup);
        let original_send_time = pending.original_send_time.unwrap_or(now);

        let mut completion_consumed = false;

        match &pending.packet {
            Packet::Connect(c) => {
                self.ping_interval_ms = c.keep_alive as i64 * 1000;
            }
            Packet::ConnAck(ack) => {
                if ack.return_code.is_accepted() {
                    self.mark_connected();
                } else {
                    if let Some(comp) = pending.completion.take() {
                        comp.complete_success(pending.packet.clone());
                    }
                    completion_consumed = true;
                    self.request_close(None);
                }
            }
            Packet::Disconnect(_) => {
                if let Some(comp) = pending.completion.take() {
                    comp.complete_success(pending.packet.clone());
                }
                completion_consumed = true;
                self.request_close(None);
            }
            _ => {}
        }

        if !completion_consumed {
            if pending.packet.is_ackable() {
                if let Some(id) = pending.packet.message_id() {
                    self.in_flight.insert(
                        id,
                        InFlightEntry {
                            packet: pending.packet.clone(),
                            completion: pending.completion.take(),
                            original_send_time,
                            next_send_time: if self.resend_interval_ms > 0 {
                                now + self.resend_interval_ms
                            } else {
                                i64::MAX
                            },
                        },
                    );
                }
            } else if !matches!(pending.packet, Packet::Connect(_)) {
                if let Some(comp) = pending.completion.take() {
                    comp.complete_success(pending.packet.clone());
                }
            }
        }

        pending.packet
    }

    fn mark_connected(&mut self) {
        if !self.connected {
            self.connected = true;
            self.role.connected(self.ping_interval_ms);
        }
    }

    /// Reads and decodes the next complete packet, if one is available
    /// without blocking.
    fn poll_read(&mut self, now: i64) -> Result<PollReadResult, ChannelError> {
        if self.paused_reads || self.closed {
            return Ok(PollReadResult::NoMoreData);
        }

        loop {
            let outcome = match &mut self.read_state {
                ReadState::Header { buf, len } => read_header(&mut self.stream, buf, len)?,
                ReadState::Body { buf, pos } => read_body(&mut self.stream, buf, pos)?,
            };

            match outcome {
                HeaderReadOutcome::NeedMore => return Ok(PollReadResult::NoMoreData),
                HeaderReadOutcome::PeerClosed => return Ok(PollReadResult::PeerClosed),
                HeaderReadOutcome::HeaderComplete { total } => {
                    let header_len = match &self.read_state {
                        ReadState::Header { len, .. } => *len,
                        _ => unreachable!(),
                    };
                    if total == header_len {
                        let frame = match &self.read_state {
                            ReadState::Header { buf, len } => BytesMut::from(&buf[..*len]),
                            _ => unreachable!(),
                        };
                        self.read_state = ReadState::Header {
                            buf: [0u8; MAX_HEADER_LEN],
                            len: 0,
                        };
                        if let Some(packet) = self.finish_frame(now, frame) {
                            return Ok(PollReadResult::Packet(packet));
                        }
                    } else {
                        let mut body = BytesMut::zeroed(total);
                        if let ReadState::Header { buf, len } = &self.read_state {
                            body[..*len].copy_from_slice(&buf[..*len]);
                        }
                        self.read_state = ReadState::Body {
                            buf: body,
                            pos: header_len,
                        };
                    }
                }
                HeaderReadOutcome::BodyComplete => {
                    let frame = match std::mem::replace(
                        &mut self.read_state,
                        ReadState::Header {
                            buf: [0u8; MAX_HEADER_LEN],
                            len: 0,
                        },
                    ) {
                        ReadState::Body { buf, .. } => buf,
                        _ => unreachable!(),
                    };
                    if let Some(packet) = self.finish_frame(now, frame) {
                        return Ok(PollReadResult::Packet(packet));
                    }
                }
            }
        }
    }

    fn finish_frame(&mut self, now: i64, frame: BytesMut) -> Option<Packet> {
        self.last_received_time = now;
        match self.decoder.decode(&frame) {
            Ok(Some((packet, _))) => {
                self.stats.record_received(packet.dup());
                debug!(channel = ?self.id, packet_type = ?packet.packet_type(), "received packet");
                Some(packet)
            }
            Ok(None) => {
                warn!(channel = ?self.id, "decoder reported incomplete frame after full accumulation");
                None
            }
            Err(e) => {
                warn!(channel = ?self.id, error = %e, "dropping malformed frame");
                None
            }
        }
    }

    fn complete_in_flight(&mut self, now: i64, id: u16, ack: Packet) {
        if let Some(entry) = self.in_flight.remove(&id) {
            if matches!(entry.packet, Packet::Publish(_)) {
                self.stats
                    .record_ack_latency_ms(now - entry.original_send_time);
            }
            if let Some(comp) = entry.completion {
                comp.complete_success(ack);
            }
        }
    }

    fn auto_pong(&mut self) {
        let mut resp = PingResp::default();
        Encoder::new().encode_pingresp(&mut resp);
        self.enqueue(PendingSend {
            packet: Packet::PingResp(resp),
            completion: None,
            cursor: 0,
            original_send_time: None,
        });
    }

    /// Resends overdue in-flight packets and runs keep-alive bookkeeping.
    /// Returns `(next_deadline_ms, keep_alive_timed_out)`.
    fn run_housekeeping(&mut self, now: i64) -> (i64, bool) {
        if self.closed {
            return (i64::MAX, false);
        }

        if self.resend_interval_ms > 0 {
            let due: Vec<u16> = self
                .in_flight
                .iter()
                .filter(|(_, e)| e.next_send_time <= now + 1000)
                .map(|(id, _)| *id)
                .collect();
            for id in due {
                if let Some(entry) = self.in_flight.remove(&id) {
                    let mut packet = entry.packet;
                    packet.set_dup(true);
                    self.enqueue(PendingSend {
                        packet,
                        completion: entry.completion,
                        cursor: 0,
                        original_send_time: Some(entry.original_send_time),
                    });
                }
            }
        }

        if self.ping_interval_ms > 0 {
            let idle_timeout = self.ping_interval_ms + self.ping_interval_ms / 2;
            if now - self.last_received_time > idle_timeout {
                return (i64::MAX, true);
            }

            if self.role.initiates_ping() && now - self.last_sent_time >= self.ping_interval_ms {
                let mut req = PingReq::default();
                Encoder::new().encode_pingreq(&mut req);
                self.enqueue(PendingSend {
                    packet: Packet::PingReq(req),
                    completion: None,
                    cursor: 0,
                    original_send_time: None,
                });
            }
        }

        self.sync_interest();
        (self.next_deadline(now), false)
    }

    /// Milliseconds until this channel next needs `run_housekeeping` to run
    /// again: the soonest in-flight resend or keep-alive/ping action.
    /// Recomputed after draining the write queue too, since a send that was
    /// only just queued (fan-out, a resend, a ping) may already have been
    /// written out and moved into `in_flight` with a fresh deadline that the
    /// pre-drain scan couldn't have seen.
    fn next_deadline(&self, now: i64) -> i64 {
        let mut deadline = i64::MAX;

        if self.resend_interval_ms > 0 {
            for entry in self.in_flight.values() {
                deadline = deadline.min((entry.next_send_time - now).max(0));
            }
        }

        if self.ping_interval_ms > 0 {
            let idle_timeout = self.ping_interval_ms + self.ping_interval_ms / 2;
            let time_to_idle = (idle_timeout - (now - self.last_received_time)).max(0);
            deadline = deadline.min(time_to_idle);
            if self.role.initiates_ping() {
                let time_to_ping = (self.ping_interval_ms - (now - self.last_sent_time)).max(0);
                deadline = deadline.min(time_to_ping);
            }
        }

        deadline
    }

    /// Closes the channel's socket side and fails every pending completion.
    /// Returns whether this call actually performed the close (`false` if
    /// already closed). Does not invoke the handler — the caller does that.
    fn begin_close(&mut self, cause: Option<ChannelError>) -> bool {
        if self.closed {
            return false;
        }
        self.closed = true;

        if let Some(ref c) = cause {
            if let Some(comp) = self.connection_complete.take() {
                comp.complete_failure(c.clone());
            }
            if let Some(comp) = self.conn_ack_completion.take() {
                comp.complete_failure(c.clone());
            }
            if let Some(pending) = self.in_progress.take() {
                if let Some(comp) = pending.completion {
                    comp.complete_failure(c.clone());
                }
            }
            for pending in self.write_queue.drain(..) {
                if let Some(comp) = pending.completion {
                    comp.complete_failure(c.clone());
                }
            }
            for (_, entry) in self.in_flight.drain() {
                if let Some(comp) = entry.completion {
                    comp.complete_failure(c.clone());
                }
            }
        }

        if self.connected {
            self.role.disconnected();
        }
        self.connected = false;

        let _ = self.deregister();
        if let Err(e) = self.stream.shutdown(std::net::Shutdown::Both) {
            if e.kind() != ErrorKind::NotConnected {
                warn!(channel = ?self.id, error = %e, "error shutting down socket");
            }
        }

        true
    }
}

enum HeaderReadOutcome {
    NeedMore,
    PeerClosed,
    HeaderComplete { total: usize },
    BodyComplete,
}

fn read_header(
    stream: &mut TcpStream,
    buf: &mut [u8; MAX_HEADER_LEN],
    len: &mut usize,
) -> Result<HeaderReadOutcome, ChannelError> {
    // Read one byte at a time: the remaining-length field's width isn't known
    // until a byte without the continuation bit is seen, and a bulk read
    // into the fixed-size header buffer would swallow leading body bytes
    // whenever the header is shorter than what the socket has buffered.
    loop {
        if *len == MAX_HEADER_LEN {
            return Err(DecodeError::InvalidRemainingLength.into());
        }
        match stream.read(&mut buf[*len..*len + 1]) {
            Ok(0) => return Ok(HeaderReadOutcome::PeerClosed),
            Ok(_) => {
                *len += 1;
                if *len < 2 {
                    continue;
                }
                if buf[*len - 1] & 0x80 != 0 {
                    continue;
                }
                return match read_variable_int(&buf[1..*len]) {
                    Ok((value, consumed)) if consumed == *len - 1 => {
                        Ok(HeaderReadOutcome::HeaderComplete {
                            total: *len + value as usize,
                        })
                    }
                    _ => Err(DecodeError::InvalidRemainingLength.into()),
                };
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(HeaderReadOutcome::NeedMore),
            Err(e) => return Err(e.into()),
        }
    }
}

fn read_body(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    pos: &mut usize,
) -> Result<HeaderReadOutcome, ChannelError> {
    let total = buf.len();
    match stream.read(&mut buf[*pos..total]) {
        Ok(0) => Ok(HeaderReadOutcome::PeerClosed),
        Ok(n) => {
            *pos += n;
            if *pos == total {
                Ok(HeaderReadOutcome::BodyComplete)
            } else {
                Ok(HeaderReadOutcome::NeedMore)
            }
        }
        Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(HeaderReadOutcome::NeedMore),
        Err(e) => Err(e.into()),
    }
}

/// A non-blocking, per-connection MQTT 3.1 channel: a [`ChannelCore`] plus
/// the handler that receives its upcalls.
pub struct Channel<R: ChannelRole, H: Handler<R>> {
    core: ChannelCore<R>,
    handler: H,
}

impl<R: ChannelRole, H: Handler<R>> Channel<R, H> {
    /// Wraps an already-accepted socket. Emits `channel_opened` immediately.
    pub fn incoming(
        id: ChannelId,
        stream: TcpStream,
        role: R,
        mut handler: H,
        stats: Arc<Statistics>,
        resend_interval_ms: i64,
        now: i64,
    ) -> Self {
        let mut core = ChannelCore::new(id, stream, role, stats, resend_interval_ms, now, false);
        handler.channel_opened(&mut core);
        Self { core, handler }
    }

    /// Wraps a socket mid-connect. `channel_opened` fires once
    /// [`Channel::finish_connect`] observes the connect succeeded.
    #[allow(clippy::too_many_arguments)]
    pub fn outgoing(
        id: ChannelId,
        stream: TcpStream,
        role: R,
        handler: H,
        stats: Arc<Statistics>,
        resend_interval_ms: i64,
        now: i64,
        connection_complete: Option<CompletionHandle<()>>,
    ) -> Self {
        let mut core = ChannelCore::new(id, stream, role, stats, resend_interval_ms, now, true);
        core.connection_complete = connection_complete;
        Self { core, handler }
    }

    pub fn id(&self) -> ChannelId {
        self.core.id()
    }

    pub fn stats(&self) -> &Arc<Statistics> {
        self.core.stats()
    }

    pub fn is_closed(&self) -> bool {
        self.core.is_closed()
    }

    pub fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    pub fn core(&self) -> &ChannelCore<R> {
        &self.core
    }

    pub fn core_mut(&mut self) -> &mut ChannelCore<R> {
        &mut self.core
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut H {
        &mut self.handler
    }

    pub fn pause_reads(&mut self) {
        self.core.pause_reads();
    }

    pub fn resume_reads(&mut self) {
        self.core.resume_reads();
    }

    pub fn send(&mut self, packet: Packet, completion: Option<CompletionHandle<Packet>>) {
        self.core.send(packet, completion);
    }

    /// Registers this channel's socket with a selector under `id`.
    pub fn register(&mut self, registry: Registry, id: ChannelId) -> Result<(), ChannelError> {
        self.core.register(registry, id)?;
        self.handler.channel_attached(&mut self.core);
        Ok(())
    }

    /// Cancels the selector registration without closing the socket.
    pub fn deregister(&mut self) {
        if self.core.deregister() {
            self.handler.channel_detached(&mut self.core);
        }
    }

    /// Completes the connect handshake for an outgoing channel. A no-op for
    /// channels that were never connecting.
    pub fn finish_connect(&mut self, now: i64) -> Result<(), ChannelError> {
        match self.core.finish_connect(now) {
            FinishConnectOutcome::NotConnecting => {}
            FinishConnectOutcome::Connected => self.handler.channel_opened(&mut self.core),
            FinishConnectOutcome::Failed(cause) => self.close(Some(cause)),
        }
        Ok(())
    }

    /// Drains the outbound queue non-blockingly.
    pub fn write(&mut self, now: i64) -> Result<(), ChannelError> {
        match self.core.drain_write(now) {
            Ok(sent) => {
                for packet in &sent {
                    self.handler.message_sent(&mut self.core, packet);
                }
                self.drain_pending_close();
                Ok(())
            }
            Err(e) => {
                self.close(Some(e));
                Ok(())
            }
        }
    }

    /// Reads and dispatches as many complete packets as are currently
    /// available without blocking.
    pub fn read(&mut self, now: i64) -> Result<(), ChannelError> {
        loop {
            match self.core.poll_read(now) {
                Ok(PollReadResult::NoMoreData) => return Ok(()),
                Ok(PollReadResult::PeerClosed) => {
                    self.close(None);
                    return Ok(());
                }
                Ok(PollReadResult::Packet(packet)) => {
                    self.dispatch(now, packet);
                    if self.core.is_closed() {
                        return Ok(());
                    }
                }
                Err(e) => {
                    self.close(Some(e));
                    return Ok(());
                }
            }
        }
    }

    fn dispatch(&mut self, now: i64, packet: Packet) {
        match packet {
            Packet::Connect(c) => {
                self.core.ping_interval_ms = c.keep_alive as i64 * 1000;
                self.handler.connect(&mut self.core, &c);
            }
            Packet::ConnAck(ack) => {
                if ack.return_code.is_accepted() {
                    self.core.mark_connected();
                }
                if let Some(comp) = self.core.conn_ack_completion.take() {
                    comp.complete_success(Packet::ConnAck(ack.clone()));
                }
                self.handler.conn_ack(&mut self.core, &ack);
                if !ack.return_code.is_accepted() {
                    self.core.request_close(None);
                }
            }
            Packet::Publish(p) => self.handler.publish(&mut self.core, &p),
            Packet::PubAck(a) => {
                self.core
                    .complete_in_flight(now, a.packet_id, Packet::PubAck(a.clone()));
                self.handler.pub_ack(&mut self.core, &a);
            }
            Packet::PubRec(a) => {
                self.core
                    .complete_in_flight(now, a.packet_id, Packet::PubRec(a.clone()));
                self.handler.pub_rec(&mut self.core, &a);
            }
            Packet::PubRel(p) => self.handler.pub_rel(&mut self.core, &p),
            Packet::PubComp(a) => {
                self.core
                    .complete_in_flight(now, a.packet_id, Packet::PubComp(a.clone()));
                self.handler.pub_comp(&mut self.core, &a);
            }
            Packet::Subscribe(s) => self.handler.subscribe(&mut self.core, &s),
            Packet::SubAck(a) => {
                self.core
                    .complete_in_flight(now, a.packet_id, Packet::SubAck(a.clone()));
                self.handler.sub_ack(&mut self.core, &a);
            }
            Packet::Unsubscribe(u) => self.handler.unsubscribe(&mut self.core, &u),
            Packet::UnsubAck(a) => {
                self.core
                    .complete_in_flight(now, a.packet_id, Packet::UnsubAck(a.clone()));
                self.handler.unsub_ack(&mut self.core, &a);
            }
            Packet::PingReq(_) => self.core.auto_pong(),
            Packet::PingResp(_) => {}
            Packet::Disconnect(d) => {
                self.handler.disconnect(&mut self.core, &d);
                self.core.request_close(None);
            }
        }
        self.drain_pending_close();
    }

    fn drain_pending_close(&mut self) {
        if let Some(cause) = self.core.take_pending_close() {
            self.close(cause);
        }
    }

    /// Resends overdue in-flight packets and runs keep-alive. Returns the
    /// number of milliseconds until this channel next needs attention.
    pub fn housekeep(&mut self, now: i64) -> i64 {
        self.handler.tick(&mut self.core);
        let (_, timed_out) = self.core.run_housekeeping(now);
        if timed_out {
            self.close(Some(ChannelError::KeepAliveTimeout));
            return i64::MAX;
        }
        self.drain_pending_close();
        // `tick`/housekeeping may have just queued sends (fan-out, resends,
        // pings) onto a socket that was already idle-writable; re-arming
        // write interest alone can miss that edge, so drain immediately
        // rather than waiting on the next readiness notification.
        if !self.core.is_closed() {
            let _ = self.write(now);
        }
        if self.core.is_closed() {
            return i64::MAX;
        }
        self.core.next_deadline(now)
    }

    /// Closes the channel. Idempotent. When `cause` is set, every pending
    /// completion handle fails with it; `None` models a clean peer close.
    pub fn close(&mut self, cause: Option<ChannelError>) {
        if self.core.begin_close(cause.clone()) {
            self.handler.channel_closed(&mut self.core, cause.as_ref());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::CompletionOutcome;
    use crate::protocol::QoS;
    use std::net::{TcpListener as StdTcpListener, TcpStream as StdTcpStream};

    /// A loopback pair: `near` is a mio socket driven by the `Channel` under
    /// test, `far` is a plain std socket the test uses to feed/observe bytes.
    fn connected_pair() -> (TcpStream, StdTcpStream) {
        let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let far = StdTcpStream::connect(addr).unwrap();
        let (near, _) = listener.accept().unwrap();
        near.set_nonblocking(true).unwrap();
        far.set_nonblocking(true).unwrap();
        (TcpStream::from_std(near), far)
    }

    fn qos0_publish(topic: &str, payload: &[u8]) -> Packet {
        let mut publish = crate::protocol::Publish {
            dup: false,
            qos: QoS::AtMostOnce,
            retain: false,
            topic: Arc::from(topic),
            packet_id: None,
            payload: bytes::Bytes::copy_from_slice(payload),
            raw: BytesMut::new(),
        };
        Encoder::new().encode_publish(&mut publish).unwrap();
        Packet::Publish(publish)
    }

    fn qos1_publish(topic: &str, payload: &[u8], packet_id: u16) -> Packet {
        let mut publish = crate::protocol::Publish {
            dup: false,
            qos: QoS::AtLeastOnce,
            retain: false,
            topic: Arc::from(topic),
            packet_id: Some(packet_id),
            payload: bytes::Bytes::copy_from_slice(payload),
            raw: BytesMut::new(),
        };
        Encoder::new().encode_publish(&mut publish).unwrap();
        Packet::Publish(publish)
    }

    #[derive(Default)]
    struct RecordingHandler {
        received: Vec<(String, Vec<u8>)>,
    }

    impl Handler<BrokerRole> for RecordingHandler {
        fn publish(&mut self, _core: &mut ChannelCore<BrokerRole>, packet: &crate::protocol::Publish) {
            self.received
                .push((packet.topic.to_string(), packet.payload.to_vec()));
        }
    }

    #[test]
    fn framing_handles_arbitrary_chunking() {
        let (near, mut far) = connected_pair();
        let stats = Arc::new(Statistics::new());
        let mut channel: Channel<BrokerRole, RecordingHandler> = Channel::incoming(
            mio::Token(1),
            near,
            BrokerRole,
            RecordingHandler::default(),
            stats,
            0,
            0,
        );

        let mut all_bytes = Vec::new();
        for i in 0..5 {
            let packet = qos0_publish("a/b", format!("payload-{i}").as_bytes());
            all_bytes.extend_from_slice(packet.raw());
        }

        // Feed the encoded frames in deliberately uneven chunks, interleaving
        // writes from the peer with reads on the channel under test so no
        // single `read` call ever sees a whole frame at once.
        for chunk in all_bytes.chunks(3) {
            use std::io::Write as _;
            far.write_all(chunk).unwrap();
            channel.read(0).unwrap();
        }
        // Drain anything left buffered by the kernel after the last chunk.
        channel.read(0).unwrap();

        let received = &channel.handler().received;
        assert_eq!(received.len(), 5);
        for (i, (topic, payload)) in received.iter().enumerate() {
            assert_eq!(topic, "a/b");
            assert_eq!(payload, format!("payload-{i}").as_bytes());
        }
    }

    #[test]
    fn resend_sets_dup_and_preserves_original_send_time() {
        let (near, mut far) = connected_pair();
        let stats = Arc::new(Statistics::new());
        let mut channel: Channel<ClientRole, RecordingHandlerNoop> = Channel::incoming(
            mio::Token(1),
            near,
            ClientRole::default(),
            RecordingHandlerNoop,
            stats,
            2_000,
            0,
        );

        channel.send(qos1_publish("x/y", b"hi", 7), None);
        channel.write(0).unwrap();

        let first = read_one_frame(&mut far);
        assert_eq!(first[0] & 0x08, 0, "first send must not have dup set");

        // Well outside the 1000ms due-soon lookahead: housekeeping must not
        // requeue anything yet.
        let deadline = channel.housekeep(500);
        assert!(deadline > 0);
        channel.write(500).unwrap();
        assert!(
            far.set_read_timeout(Some(std::time::Duration::from_millis(20)))
                .is_ok(),
        );
        let mut probe = [0u8; 1];
        match far.read(&mut probe) {
            Err(e) if e.kind() == ErrorKind::WouldBlock || e.kind() == ErrorKind::TimedOut => {}
            other => panic!("expected no data before the resend interval elapsed, got {other:?}"),
        }
        far.set_read_timeout(None).unwrap();
        far.set_nonblocking(true).unwrap();

        // Within 1000ms of the 2000ms interval elapsing: housekeeping's
        // due-soon lookahead must requeue a duplicate even though the raw
        // interval hasn't fully elapsed yet.
        channel.housekeep(1_050);
        channel.write(1_050).unwrap();
        let second = read_one_frame(&mut far);
        assert_eq!(second[0] & 0x08, 0x08, "resend must have dup set");

        assert_eq!(channel.stats().duplicates_sent(), 1);
    }

    #[derive(Default)]
    struct RecordingHandlerNoop;
    impl Handler<ClientRole> for RecordingHandlerNoop {}

    fn read_one_frame(stream: &mut StdTcpStream) -> Vec<u8> {
        stream.set_nonblocking(false).unwrap();
        stream
            .set_read_timeout(Some(std::time::Duration::from_secs(2)))
            .unwrap();
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).unwrap();
        let remaining = header[1] as usize;
        let mut body = vec![0u8; remaining];
        stream.read_exact(&mut body).unwrap();
        stream.set_nonblocking(true).unwrap();
        let mut frame = header.to_vec();
        frame.extend_from_slice(&body);
        frame
    }

    #[test]
    fn write_interest_armed_tracks_pending_sends() {
        let (near, _far) = connected_pair();
        let stats = Arc::new(Statistics::new());
        let mut core: ChannelCore<BrokerRole> =
            ChannelCore::new(mio::Token(1), near, BrokerRole, stats, 0, 0, false);
        assert!(!core.write_interest_armed);

        core.send(qos0_publish("a", b"x"), None);
        assert!(
            core.write_interest_armed,
            "a pending send must arm write interest even without a registered selector"
        );

        core.drain_write(0).unwrap();
        assert!(
            !core.write_interest_armed,
            "write interest must disarm once the queue drains"
        );
    }

    #[test]
    fn completion_handle_resolves_exactly_once_on_ack() {
        let (near, mut far) = connected_pair();
        let stats = Arc::new(Statistics::new());
        let mut channel: Channel<ClientRole, RecordingHandlerNoop> = Channel::incoming(
            mio::Token(1),
            near,
            ClientRole::default(),
            RecordingHandlerNoop,
            stats,
            0,
            0,
        );

        let handle = CompletionHandle::<Packet>::new();
        channel.send(qos1_publish("a/b", b"hi", 3), Some(handle.clone()));
        channel.write(0).unwrap();
        let _ = read_one_frame(&mut far);

        let mut puback = crate::protocol::PubAck {
            packet_id: 3,
            raw: BytesMut::new(),
        };
        Encoder::new().encode_puback(&mut puback).unwrap();
        use std::io::Write as _;
        far.write_all(&puback.raw).unwrap();
        channel.read(0).unwrap();

        let result = handle.wait(Some(std::time::Duration::from_secs(1)));
        assert!(matches!(result, Some(CompletionOutcome::Success(Packet::PubAck(_)))));
    }
}
