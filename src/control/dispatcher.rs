use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tracing::{debug, enabled, error, info, info_span, warn, Instrument, Level};

use crate::bencode::pretty::pretty_print;
use crate::bencode::{decode_dictionary, BencodeValue};
use crate::control::cookie_cache::CookieCache;
use crate::control::stats::{IntervalStats, PeerStats, PeerStatsTable, TimedCommand};


/// The session-management operations behind the control protocol. Each operation either
///  populates the reply dictionary and returns `Ok`, or returns an error whose message is
///  sent to the peer as the "error-reason".
///
/// Implementations are assumed synchronous-bounded; whatever latency they incur is measured
///  by the dispatcher and fed into the interval statistics (for offer/answer/delete).
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SessionBackend: Send + Sync + 'static {
    async fn offer(&self, request: &BencodeValue, reply: &mut BencodeValue) -> anyhow::Result<()>;
    async fn answer(&self, request: &BencodeValue, reply: &mut BencodeValue) -> anyhow::Result<()>;
    async fn delete(&self, request: &BencodeValue, reply: &mut BencodeValue) -> anyhow::Result<()>;
    async fn query(&self, request: &BencodeValue, reply: &mut BencodeValue) -> anyhow::Result<()>;
    async fn list(&self, request: &BencodeValue, reply: &mut BencodeValue) -> anyhow::Result<()>;
}

/// Sends one reply datagram (`<cookie> SP <payload>`) back to a peer. The listener passes
///  the socket a request arrived on wrapped in this, so replies leave through the same
///  endpoint; tests substitute a capturing fake.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send_reply(&self, to: SocketAddr, cookie: &[u8], payload: &[u8]) -> anyhow::Result<()>;
}


/// The control protocol state machine: splits the envelope, absorbs retransmissions via the
///  cookie cache, decodes the command dictionary, routes to the session backend, and answers
///  every request that carries a recoverable cookie.
pub struct CommandDispatcher {
    backend: Arc<dyn SessionBackend>,
    cookie_cache: Arc<CookieCache>,
    peer_stats: Arc<PeerStatsTable>,
    interval_stats: Arc<IntervalStats>,
}

impl CommandDispatcher {
    pub fn new(
        backend: Arc<dyn SessionBackend>,
        cookie_cache: Arc<CookieCache>,
        peer_stats: Arc<PeerStatsTable>,
        interval_stats: Arc<IntervalStats>,
    ) -> CommandDispatcher {
        CommandDispatcher {
            backend,
            cookie_cache,
            peer_stats,
            interval_stats,
        }
    }

    /// Processes exactly one datagram into exactly one reply. The only silent path is an
    ///  envelope so malformed that no cookie can be extracted; everything else is answered,
    ///  errors included, so the peer's retransmission logic has something to stop on.
    pub async fn handle_packet(&self, buf: &[u8], from: SocketAddr, sender: &dyn ReplySender) {
        let Some((cookie, payload)) = split_envelope(buf) else {
            warn!("received invalid data on control port (no cookie) from {}", from);
            return;
        };

        let peer = self.peer_stats.get_or_create(from).await;

        let (command, reply) = if payload.is_empty() {
            // a cookie exists, so this is answered rather than dropped. NB: the empty-payload
            //  check comes before the duplicate check, as in the protocol's reference behavior
            self.error_reply(&peer, from, payload, "Invalid data (no payload)")
        } else {
            match self.cookie_cache.lookup(cookie).await {
                Some(cached) => {
                    info!("detected command from {} as a duplicate", from);
                    self.transmit(sender, from, cookie, &cached).await;
                    return;
                }
                None => self.process_payload(payload, from, &peer).await,
            }
        };

        let reply_bytes = reply.encode();

        if let Some(command) = &command {
            info!("replying to '{}' from {}", command, from);
            if enabled!(Level::DEBUG) {
                debug!("response dump for '{}' to {}: {}", command, from, pretty_print(&reply));
            }
        }

        self.transmit(sender, from, cookie, &reply_bytes).await;
        // only this non-duplicate path built a reply, so cache population is exactly-once
        //  per distinct cookie
        self.cookie_cache.insert(cookie, reply_bytes).await;
    }

    async fn process_payload(
        &self,
        payload: &[u8],
        from: SocketAddr,
        peer: &PeerStats,
    ) -> (Option<String>, BencodeValue) {
        let request = match decode_dictionary(payload) {
            Ok(request) => request,
            Err(e) => {
                debug!("decode error in packet from {}: {}", from, e);
                return self.error_reply(peer, from, payload, "Could not decode dictionary");
            }
        };

        let Some(command) = request.get_str(b"command").filter(|s| !s.is_empty()) else {
            return self.error_reply(peer, from, payload, "Dictionary contains no key \"command\"");
        };
        let command = String::from_utf8_lossy(command).into_owned();

        // call-id is diagnostic only: it tags all log lines for this request and is
        //  dropped again when the span closes
        let span = match request.get_str(b"call-id") {
            Some(call_id) => info_span!("control", call_id = %String::from_utf8_lossy(call_id)),
            None => info_span!("control"),
        };

        self.run_command(&command, &request, payload, from, peer)
            .instrument(span)
            .await
    }

    async fn run_command(
        &self,
        command: &str,
        request: &BencodeValue,
        payload: &[u8],
        from: SocketAddr,
        peer: &PeerStats,
    ) -> (Option<String>, BencodeValue) {
        info!("received command '{}' from {}", command, from);
        if enabled!(Level::DEBUG) {
            debug!("dump for '{}' from {}: {}", command, from, pretty_print(request));
        }

        let mut reply = BencodeValue::new_dict();
        let mut timed: Option<(TimedCommand, std::time::Duration)> = None;

        let result = match command {
            "ping" => {
                reply.push_str("result", "pong");
                peer.ping.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            "offer" => {
                let started = Instant::now();
                let result = self.backend.offer(request, &mut reply).await;
                peer.offer.fetch_add(1, Ordering::Relaxed);
                let elapsed = started.elapsed();
                info!("offer time = {}.{:06} sec", elapsed.as_secs(), elapsed.subsec_micros());
                timed = Some((TimedCommand::Offer, elapsed));
                result
            }
            "answer" => {
                let started = Instant::now();
                let result = self.backend.answer(request, &mut reply).await;
                peer.answer.fetch_add(1, Ordering::Relaxed);
                let elapsed = started.elapsed();
                info!("answer time = {}.{:06} sec", elapsed.as_secs(), elapsed.subsec_micros());
                timed = Some((TimedCommand::Answer, elapsed));
                result
            }
            "delete" => {
                let started = Instant::now();
                let result = self.backend.delete(request, &mut reply).await;
                peer.delete.fetch_add(1, Ordering::Relaxed);
                let elapsed = started.elapsed();
                info!("delete time = {}.{:06} sec", elapsed.as_secs(), elapsed.subsec_micros());
                timed = Some((TimedCommand::Delete, elapsed));
                result
            }
            "query" => {
                let result = self.backend.query(request, &mut reply).await;
                peer.query.fetch_add(1, Ordering::Relaxed);
                result
            }
            "list" => {
                let result = self.backend.list(request, &mut reply).await;
                peer.list.fetch_add(1, Ordering::Relaxed);
                result
            }
            _ => Err(anyhow::anyhow!("Unrecognized command")),
        };

        if let Err(e) = result {
            // a backend error discards any partial reply contents
            return self.error_reply(peer, from, payload, &e.to_string());
        }

        // interval statistics count successful requests only
        if let Some((kind, duration)) = timed {
            self.interval_stats.record(kind, duration).await;
        }

        (Some(command.to_owned()), reply)
    }

    /// Builds the structured error reply. The command name is cleared (`None`) so the reply
    ///  log line does not claim a successful reply to a named command.
    fn error_reply(
        &self,
        peer: &PeerStats,
        from: SocketAddr,
        payload: &[u8],
        reason: &str,
    ) -> (Option<String>, BencodeValue) {
        warn!("protocol error in packet from {}: {} [{}]", from, reason, String::from_utf8_lossy(payload));

        let mut reply = BencodeValue::new_dict();
        reply.push_str("result", "error");
        reply.push_str("error-reason", reason);
        peer.errors.fetch_add(1, Ordering::Relaxed);
        (None, reply)
    }

    async fn transmit(&self, sender: &dyn ReplySender, to: SocketAddr, cookie: &[u8], payload: &[u8]) {
        if let Err(e) = sender.send_reply(to, cookie, payload).await {
            error!("error sending control reply to {}: {}", to, e);
        }
    }
}

/// Splits `<cookie> SP <payload>` at the first space. `None` if there is no space or the
///  cookie would be empty - such a datagram cannot even be answered with an echoed cookie.
fn split_envelope(buf: &[u8]) -> Option<(&[u8], &[u8])> {
    match buf.iter().position(|&b| b == b' ') {
        Some(0) | None => None,
        Some(space) => Some((&buf[..space], &buf[space + 1..])),
    }
}
