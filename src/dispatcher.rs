use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::Instant;

use crate::client::ClientError;
use crate::config::Config;
use crate::connection::{self, ConnectionError, Link};
use crate::dps::{DpValue, ThermostatState};
use crate::protocol::{
    self, Codec, TuyaMessage, CMD_CONTROL, CMD_CONTROL_NEW, CMD_DP_QUERY, CMD_DP_QUERY_NEW,
    CMD_HEART_BEAT, CMD_STATUS,
};

const RESPONSE_TIMEOUT: Duration = Duration::from_secs(1);
const RETRY_LIMIT: u8 = 5;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const IDLE_WATCHDOG: Duration = Duration::from_secs(30);

const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Torn down after this many malformed frames within one session.
const PROTOCOL_FAULT_LIMIT: u8 = 2;

/// Delta published to subscribers: one DP change, or the device coming
/// and going.
#[derive(Debug, Clone)]
pub enum Event {
    Dp { dp: u8, value: DpValue },
    Online(bool),
}

/// Shared read view over the dispatcher's state. Updated before the
/// corresponding events are published.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub online: bool,
    pub dps: BTreeMap<u8, DpValue>,
    pub thermostat: ThermostatState,
}

pub(crate) enum Request {
    Set {
        dps: serde_json::Value,
        respond: oneshot::Sender<Result<(), ClientError>>,
    },
    Query {
        respond: oneshot::Sender<Result<BTreeMap<u8, DpValue>, ClientError>>,
    },
    Disconnect {
        respond: oneshot::Sender<()>,
    },
}

enum Responder {
    Ack(oneshot::Sender<Result<(), ClientError>>),
    Dps(oneshot::Sender<Result<BTreeMap<u8, DpValue>, ClientError>>),
}

/// The single in-flight request. The plaintext is kept so retries can
/// re-frame the identical payload under a fresh sequence number.
struct Pending {
    cmd: u32,
    plaintext: Vec<u8>,
    seqno: u16,
    deadline: Instant,
    retries_left: u8,
    respond: Option<Responder>,
}

enum Tick {
    Request(Option<Request>),
    Read(Result<usize, ConnectionError>),
    Retry,
    Heartbeat,
    Watchdog,
    Poll,
    Reconnect,
}

/// Per-device engine: one task owns the socket, the DP state and every
/// timer, so there is never a concurrent writer on the connection.
pub(crate) struct Dispatcher {
    config: Config,
    codec: Codec,
    seqno: u16,
    link: Option<Link>,
    pending: Option<Pending>,
    snapshot: Arc<Mutex<Snapshot>>,
    events: broadcast::Sender<Event>,
    requests: mpsc::Receiver<Request>,
    backoff: Duration,
    reconnect_at: Option<Instant>,
    heartbeat_at: Option<Instant>,
    watchdog_at: Option<Instant>,
    poll_at: Option<Instant>,
    protocol_faults: u8,
}

impl Dispatcher {
    pub(crate) fn new(
        config: Config,
        requests: mpsc::Receiver<Request>,
        snapshot: Arc<Mutex<Snapshot>>,
        events: broadcast::Sender<Event>,
    ) -> Self {
        let codec = Codec::new(config.protocol, config.local_key);
        let poll_at = (config.poll_interval_sec > 0)
            .then(|| Instant::now() + Duration::from_secs(config.poll_interval_sec));
        Self {
            config,
            codec,
            seqno: 1,
            link: None,
            pending: None,
            snapshot,
            events,
            requests,
            backoff: BACKOFF_MIN,
            reconnect_at: None,
            heartbeat_at: None,
            watchdog_at: None,
            poll_at,
            protocol_faults: 0,
        }
    }

    pub(crate) async fn run(mut self) {
        loop {
            let retry_at = self.pending.as_ref().map(|p| p.deadline);
            let heartbeat_at = self.link.is_some().then_some(self.heartbeat_at).flatten();
            let watchdog_at = self.link.is_some().then_some(self.watchdog_at).flatten();
            let poll_at = self.poll_at;
            let reconnect_at = self.reconnect_at;
            let link_ready = self.link.is_some();

            let requests = &mut self.requests;
            let link = &mut self.link;

            let tick = tokio::select! {
                req = requests.recv() => Tick::Request(req),
                result = async { link.as_mut().expect("guarded by link_ready").fill().await },
                    if link_ready => Tick::Read(result),
                _ = sleep_until_opt(retry_at), if retry_at.is_some() => Tick::Retry,
                _ = sleep_until_opt(heartbeat_at), if heartbeat_at.is_some() => Tick::Heartbeat,
                _ = sleep_until_opt(watchdog_at), if watchdog_at.is_some() => Tick::Watchdog,
                _ = sleep_until_opt(poll_at), if poll_at.is_some() => Tick::Poll,
                _ = sleep_until_opt(reconnect_at), if reconnect_at.is_some() => Tick::Reconnect,
            };

            match tick {
                Tick::Request(Some(req)) => self.handle_request(req).await,
                Tick::Request(None) => {
                    // Every client handle dropped; shut the engine down
                    self.teardown(false);
                    return;
                }
                Tick::Read(Ok(0)) => {
                    tracing::debug!("Device closed the connection");
                    self.teardown(true);
                }
                Tick::Read(Ok(_)) => {
                    self.watchdog_at = Some(Instant::now() + IDLE_WATCHDOG);
                    self.drain_frames();
                }
                Tick::Read(Err(e)) => {
                    tracing::warn!(error = %e, "Socket read failed");
                    self.teardown(true);
                }
                Tick::Retry => self.on_retry_timer().await,
                Tick::Heartbeat => self.on_heartbeat_timer().await,
                Tick::Watchdog => {
                    tracing::warn!("No frames within the idle window; dropping connection");
                    self.teardown(true);
                }
                Tick::Poll => self.on_poll_timer().await,
                Tick::Reconnect => self.on_reconnect_timer().await,
            }
        }
    }

    async fn handle_request(&mut self, req: Request) {
        match req {
            Request::Disconnect { respond } => {
                self.teardown(false);
                let _ = respond.send(());
            }
            Request::Set { dps, respond } => {
                if let Err(e) = self.ensure_link().await {
                    let _ = respond.send(Err(e));
                    return;
                }
                let (cmd, plaintext) =
                    protocol::set_request(self.config.protocol, &self.config.device_id, &dps);
                self.start_pending(cmd, plaintext, Some(Responder::Ack(respond)))
                    .await;
            }
            Request::Query { respond } => {
                if let Err(e) = self.ensure_link().await {
                    let _ = respond.send(Err(e));
                    return;
                }
                let (cmd, plaintext) =
                    protocol::status_request(self.config.protocol, &self.config.device_id);
                self.start_pending(cmd, plaintext, Some(Responder::Dps(respond)))
                    .await;
            }
        }
    }

    /// Arm a new in-flight request, superseding any previous one. The
    /// superseded op is abandoned without an error: its waiter resolves
    /// as if acknowledged.
    async fn start_pending(&mut self, cmd: u32, plaintext: Vec<u8>, respond: Option<Responder>) {
        if let Some(prev) = self.pending.take() {
            tracing::debug!(cmd = prev.cmd, "Superseding in-flight command");
            if let Some(r) = prev.respond {
                self.resolve_abandoned(r);
            }
        }

        let seqno = connection::next_seq(&mut self.seqno);
        let frame = self.codec.build(seqno, cmd, &plaintext);

        let Some(link) = self.link.as_mut() else {
            if let Some(r) = respond {
                resolve_err(r, ClientError::NotConnected);
            }
            return;
        };

        if let Err(e) = link.send(&frame).await {
            tracing::warn!(error = %e, "Socket write failed");
            self.teardown(true);
            if let Some(r) = respond {
                resolve_err(r, ClientError::NotConnected);
            }
            return;
        }

        self.pending = Some(Pending {
            cmd,
            plaintext,
            seqno,
            deadline: Instant::now() + RESPONSE_TIMEOUT,
            retries_left: RETRY_LIMIT,
            respond,
        });
    }

    async fn on_retry_timer(&mut self) {
        let Some(mut pending) = self.pending.take() else {
            return;
        };

        pending.retries_left -= 1;
        if pending.retries_left == 0 {
            tracing::warn!(cmd = pending.cmd, "Command retries exhausted");
            if let Some(r) = pending.respond.take() {
                resolve_err(r, ClientError::Timeout);
            }
            self.teardown(true);
            return;
        }

        let seqno = connection::next_seq(&mut self.seqno);
        let frame = self.codec.build(seqno, pending.cmd, &pending.plaintext);
        tracing::debug!(
            cmd = pending.cmd,
            seqno,
            retries_left = pending.retries_left,
            "Resending unanswered command"
        );

        let Some(link) = self.link.as_mut() else {
            if let Some(r) = pending.respond.take() {
                resolve_err(r, ClientError::NotConnected);
            }
            return;
        };
        if let Err(e) = link.send(&frame).await {
            tracing::warn!(error = %e, "Socket write failed on retry");
            self.teardown(true);
            if let Some(r) = pending.respond.take() {
                resolve_err(r, ClientError::NotConnected);
            }
            return;
        }

        pending.seqno = seqno;
        pending.deadline = Instant::now() + RESPONSE_TIMEOUT;
        self.pending = Some(pending);
    }

    /// Active-schedule heartbeat. Skipped while a request is in flight;
    /// the reply to that request feeds the watchdog just as well.
    async fn on_heartbeat_timer(&mut self) {
        self.heartbeat_at = Some(Instant::now() + HEARTBEAT_INTERVAL);
        if self.pending.is_some() {
            return;
        }

        let (cmd, plaintext) = protocol::heartbeat_request(&self.config.device_id);
        let seqno = connection::next_seq(&mut self.seqno);
        let frame = self.codec.build(seqno, cmd, &plaintext);

        if let Some(link) = self.link.as_mut() {
            if let Err(e) = link.send(&frame).await {
                tracing::warn!(error = %e, "Heartbeat write failed");
                self.teardown(true);
            } else {
                tracing::trace!(seqno, "Heartbeat sent");
            }
        }
    }

    async fn on_poll_timer(&mut self) {
        self.poll_at = Some(Instant::now() + Duration::from_secs(self.config.poll_interval_sec));
        if self.pending.is_some() {
            return;
        }
        if self.ensure_link().await.is_err() {
            return;
        }
        let (cmd, plaintext) =
            protocol::status_request(self.config.protocol, &self.config.device_id);
        self.start_pending(cmd, plaintext, None).await;
    }

    async fn on_reconnect_timer(&mut self) {
        self.reconnect_at = None;
        if self.ensure_link().await.is_ok() {
            tracing::info!("Reconnected to device");
            // Repopulate the DP map after the gap
            let (cmd, plaintext) =
                protocol::status_request(self.config.protocol, &self.config.device_id);
            self.start_pending(cmd, plaintext, None).await;
        }
    }

    /// Lazily bring up the link; sessions start on the first command or
    /// scheduled refresh rather than at construction.
    async fn ensure_link(&mut self) -> Result<(), ClientError> {
        if self.link.is_some() {
            return Ok(());
        }

        // Fresh nonces, sequence numbers and key state per connection
        self.codec = Codec::new(self.config.protocol, self.config.local_key);
        self.seqno = 1;

        match connection::establish(&self.config, &mut self.codec, &mut self.seqno).await {
            Ok(link) => {
                self.link = Some(link);
                self.backoff = BACKOFF_MIN;
                self.protocol_faults = 0;
                self.reconnect_at = None;
                let now = Instant::now();
                self.watchdog_at = Some(now + IDLE_WATCHDOG);
                self.heartbeat_at = self
                    .config
                    .use_heartbeat
                    .then(|| now + HEARTBEAT_INTERVAL);
                self.set_online(true);
                Ok(())
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to establish device link");
                self.schedule_reconnect();
                Err(ClientError::NotConnected)
            }
        }
    }

    /// Drop the link and cancel everything armed against it. The pending
    /// op, if any, is discarded; its waiter sees NotConnected.
    fn teardown(&mut self, reconnect: bool) {
        if let Some(pending) = self.pending.take() {
            if let Some(r) = pending.respond {
                resolve_err(r, ClientError::NotConnected);
            }
        }
        if self.link.take().is_some() {
            self.set_online(false);
        }
        self.heartbeat_at = None;
        self.watchdog_at = None;
        if reconnect {
            self.schedule_reconnect();
        } else {
            self.reconnect_at = None;
            self.backoff = BACKOFF_MIN;
        }
    }

    fn schedule_reconnect(&mut self) {
        if !self.config.auto_reconnect {
            return;
        }
        // Jittered to half..full of the current backoff step
        let delay = self.backoff.mul_f64(0.5 + rand::random::<f64>() * 0.5);
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Scheduling reconnect");
        self.reconnect_at = Some(Instant::now() + delay);
        self.backoff = (self.backoff * 2).min(BACKOFF_MAX);
    }

    fn drain_frames(&mut self) {
        loop {
            let raw = match self.link.as_mut() {
                Some(link) => link.scanner.next_frame(),
                None => None,
            };
            let Some(raw) = raw else { break };

            match self.codec.parse(&raw) {
                Ok(msg) => self.handle_message(msg),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        key_fp = %self.codec.key_fingerprint(),
                        "Dropping malformed frame"
                    );
                    self.protocol_faults += 1;
                    if self.protocol_faults >= PROTOCOL_FAULT_LIMIT {
                        tracing::warn!("Repeated protocol errors; resetting connection");
                        self.teardown(true);
                        break;
                    }
                }
            }
        }
    }

    fn handle_message(&mut self, msg: TuyaMessage) {
        match msg.cmd {
            CMD_STATUS | CMD_DP_QUERY | CMD_DP_QUERY_NEW | CMD_CONTROL | CMD_CONTROL_NEW
            | CMD_HEART_BEAT => {}
            other => {
                tracing::debug!(cmd = other, seqno = msg.seqno, "Dropping unknown frame type");
                return;
            }
        }

        // Update the DP map first, then resolve any waiter; status pushes
        // that match nothing are still folded in.
        let dps = self.apply_status_payload(&msg.payload);

        let matches = self
            .pending
            .as_ref()
            .is_some_and(|p| u32::from(p.seqno) == msg.seqno);
        if matches {
            let pending = self.pending.take().expect("matched above");
            if let Some(respond) = pending.respond {
                match respond {
                    Responder::Ack(tx) => {
                        let _ = tx.send(Ok(()));
                    }
                    Responder::Dps(tx) => {
                        let result = dps.unwrap_or_else(|| {
                            self.snapshot.lock().expect("snapshot lock").dps.clone()
                        });
                        let _ = tx.send(Ok(result));
                    }
                }
            }
        } else if dps.is_some() {
            tracing::trace!(seqno = msg.seqno, "Out-of-band status update");
        }
    }

    /// Parse a `{"dps":{..}}` payload (possibly nested under `data` on
    /// 3.4), fold it into the snapshot, and publish per-DP deltas.
    fn apply_status_payload(&mut self, payload: &[u8]) -> Option<BTreeMap<u8, DpValue>> {
        if payload.is_empty() {
            return None;
        }
        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                tracing::debug!(error = %e, "Ignoring non-JSON payload");
                return None;
            }
        };

        let dps_obj = value
            .get("dps")
            .or_else(|| value.get("data").and_then(|d| d.get("dps")))?
            .as_object()?;

        let mut parsed = BTreeMap::new();
        for (key, raw) in dps_obj {
            let Ok(dp) = key.parse::<u8>() else { continue };
            let Some(val) = DpValue::from_json(raw) else {
                continue;
            };
            parsed.insert(dp, val);
        }

        let mut changed = Vec::new();
        {
            let mut snap = self.snapshot.lock().expect("snapshot lock");
            for (dp, val) in &parsed {
                let prev = snap.dps.insert(*dp, val.clone());
                snap.thermostat.apply(*dp, val);
                if prev.as_ref() != Some(val) {
                    changed.push((*dp, val.clone()));
                }
            }
        }
        for (dp, value) in changed {
            let _ = self.events.send(Event::Dp { dp, value });
        }

        Some(parsed)
    }

    fn resolve_abandoned(&self, respond: Responder) {
        match respond {
            Responder::Ack(tx) => {
                let _ = tx.send(Ok(()));
            }
            Responder::Dps(tx) => {
                let dps = self.snapshot.lock().expect("snapshot lock").dps.clone();
                let _ = tx.send(Ok(dps));
            }
        }
    }

    fn set_online(&mut self, online: bool) {
        let changed = {
            let mut snap = self.snapshot.lock().expect("snapshot lock");
            let changed = snap.online != online;
            snap.online = online;
            changed
        };
        if changed {
            let _ = self.events.send(Event::Online(online));
        }
    }
}

fn resolve_err(respond: Responder, err: ClientError) {
    match respond {
        Responder::Ack(tx) => {
            let _ = tx.send(Err(err));
        }
        Responder::Dps(tx) => {
            let _ = tx.send(Err(err));
        }
    }
}

async fn sleep_until_opt(at: Option<Instant>) {
    // Branches are guarded on is_some(); the fallback only exists so the
    // expression is valid when disabled.
    let at = at.unwrap_or_else(|| Instant::now() + Duration::from_secs(86400));
    tokio::time::sleep_until(at).await;
}
