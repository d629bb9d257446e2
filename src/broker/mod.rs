//! Mock broker: the minimal broker-side collaborator that exercises the
//! channel engine end to end.
//!
//! Everything here is deliberately thin — a topic match good enough for the
//! scenarios in the spec, an in-memory credential whitelist, fan-out driven
//! by the channel's own `tick` upcall — because the channel state machine in
//! [`crate::channel`] is the part of this crate under test, not the broker
//! built on top of it.

mod auth;
mod handler;
mod topic;

pub use auth::{Auth, AuthError};
pub use handler::BrokerHandler;
pub use topic::topic_matches;

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::channel::BrokerRole;
use crate::protocol::{Publish, Subscription};
use crate::selector::SelectorLoop;

/// Resolved broker configuration (already past CLI parsing/validation).
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub bind_addr: SocketAddr,
    pub resend_interval_ms: i64,
    pub max_inflight: Option<usize>,
    pub auth: Auth,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            resend_interval_ms: 15_000,
            max_inflight: None,
            auth: Auth::default(),
        }
    }
}

pub(crate) type Token = mio::Token;

/// State shared by every [`BrokerHandler`] instance on this broker: the
/// subscription table and each connected session's delivery inbox.
#[derive(Default)]
pub(crate) struct BrokerState {
    subscriptions: Mutex<std::collections::HashMap<Token, Vec<Subscription>>>,
    inboxes: Mutex<std::collections::HashMap<Token, Arc<Mutex<std::collections::VecDeque<Publish>>>>>,
}

impl BrokerState {
    fn register(&self, token: Token, inbox: Arc<Mutex<std::collections::VecDeque<Publish>>>) {
        self.inboxes.lock().unwrap().insert(token, inbox);
    }

    fn forget(&self, token: Token) {
        self.subscriptions.lock().unwrap().remove(&token);
        self.inboxes.lock().unwrap().remove(&token);
    }

    fn set_subscriptions(&self, token: Token, subs: Vec<Subscription>) {
        self.subscriptions.lock().unwrap().insert(token, subs);
    }

    fn remove_filters(&self, token: Token, filters: &[String]) {
        if let Some(subs) = self.subscriptions.lock().unwrap().get_mut(&token) {
            subs.retain(|s| !filters.iter().any(|f| f == &s.filter));
        }
    }

    /// Fans `publish` out to every subscriber whose filter matches its
    /// topic, queuing onto each recipient's inbox at the minimum of the
    /// publisher's and subscriber's QoS. MQTT 3.1 has no no-local option, so
    /// a client subscribed to its own publish's topic receives it back too.
    fn fan_out(&self, publish: &Publish) {
        let targets: Vec<(Token, crate::protocol::QoS)> = {
            let subs = self.subscriptions.lock().unwrap();
            subs.iter()
                .flat_map(|(token, list)| {
                    list.iter()
                        .filter(|s| topic_matches(&s.filter, &publish.topic))
                        .map(|s| (*token, s.qos.min(publish.qos)))
                        .collect::<Vec<_>>()
                })
                .collect()
        };

        if targets.is_empty() {
            return;
        }
        let inboxes = self.inboxes.lock().unwrap();
        for (token, qos) in targets {
            if let Some(inbox) = inboxes.get(&token) {
                let mut delivered = publish.clone();
                delivered.qos = qos;
                delivered.dup = false;
                delivered.packet_id = None; // assigned by the recipient's own tick
                inbox.lock().unwrap().push_back(delivered);
            }
        }
    }
}

/// A running mock broker. Dropping or calling [`RunningBroker::stop`] closes
/// the listener; per S6, a subsequent connect to `local_addr()` then fails.
pub struct RunningBroker {
    local_addr: SocketAddr,
    stop: Arc<AtomicBool>,
    waker: Arc<mio::Waker>,
    join: Option<JoinHandle<()>>,
}

impl RunningBroker {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Signals the selector thread to exit and waits for it to close the
    /// listener and every open channel.
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for RunningBroker {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

/// Binds `config.bind_addr` and drives the broker's selector loop on a
/// background thread until [`RunningBroker::stop`] is called.
pub fn spawn(config: BrokerConfig) -> io::Result<RunningBroker> {
    let state = Arc::new(BrokerState::default());
    let max_inflight = config.max_inflight;
    let auth = config.auth.clone();
    let state_for_handler = state.clone();

    let mut selector = SelectorLoop::bind(
        config.bind_addr,
        config.resend_interval_ms,
        BrokerRole::default,
        move || BrokerHandler::new(state_for_handler.clone(), auth.clone(), max_inflight),
    )?;
    let local_addr = selector.local_addr()?;
    info!(%local_addr, "mock broker listening");

    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_thread = stop.clone();
    let waker = Arc::new(selector.make_waker()?);
    let start = Instant::now();

    let join = thread::spawn(move || {
        // No timeout on the first iteration: with nothing connected there's
        // nothing for housekeep to report a deadline for. Afterwards, sleep
        // for exactly what housekeep asks for so the resend due-soon
        // lookahead only fires near its true time; `stop()`'s waker
        // interrupts a long sleep immediately rather than needing a short
        // fixed poll interval to notice the shutdown flag.
        let mut timeout = None;
        while !stop_for_thread.load(Ordering::Relaxed) {
            match selector.run_once(timeout, start) {
                Ok(next) => timeout = next,
                Err(e) => {
                    warn!(error = %e, "selector loop iteration failed");
                    timeout = Some(Duration::from_millis(50));
                }
            }
        }
        drop(selector);
        let _ = &state; // keep the Arc alive until the loop (and its handlers) drop
    });

    Ok(RunningBroker {
        local_addr,
        stop,
        waker,
        join: Some(join),
    })
}
