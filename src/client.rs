use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::config::Config;
use crate::dispatcher::{Dispatcher, Event, Request, Snapshot};
use crate::dps::{
    self, DpValue, DpsError, FanSpeed, HorizontalSwing, HvacMode, VerticalSwing,
};

const REQUEST_QUEUE: usize = 16;
const EVENT_QUEUE: usize = 64;

#[derive(Debug)]
pub enum ClientError {
    NotConnected,
    Timeout,
    BadValue(DpsError),
    Closed,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::NotConnected => write!(f, "Not connected to device"),
            ClientError::Timeout => write!(f, "Device did not respond"),
            ClientError::BadValue(e) => write!(f, "Bad value: {e}"),
            ClientError::Closed => write!(f, "Device engine has shut down"),
        }
    }
}

impl std::error::Error for ClientError {}

impl From<DpsError> for ClientError {
    fn from(e: DpsError) -> Self {
        ClientError::BadValue(e)
    }
}

/// Handle to one device engine. Cheap to clone; all clones talk to the
/// same dispatcher task.
#[derive(Clone)]
pub struct WytClient {
    requests: mpsc::Sender<Request>,
    snapshot: Arc<Mutex<Snapshot>>,
    events: broadcast::Sender<Event>,
}

impl WytClient {
    /// Spawn the engine for a device binding. The connection itself is
    /// made lazily on the first command or scheduled refresh.
    pub fn spawn(config: Config) -> Self {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let (events, _) = broadcast::channel(EVENT_QUEUE);
        let snapshot = Arc::new(Mutex::new(Snapshot::default()));

        let dispatcher = Dispatcher::new(config, rx, snapshot.clone(), events.clone());
        tokio::spawn(dispatcher.run());

        Self {
            requests: tx,
            snapshot,
            events,
        }
    }

    pub async fn on(&self) -> Result<(), ClientError> {
        self.set_dps(dps::build_power_dps(true)).await
    }

    pub async fn off(&self) -> Result<(), ClientError> {
        self.set_dps(dps::build_power_dps(false)).await
    }

    /// Set the HVAC mode; powers the unit on as part of the same write.
    pub async fn set_mode(&self, mode: HvacMode) -> Result<(), ClientError> {
        self.set_dps(dps::build_mode_dps(mode)).await
    }

    /// Set the target temperature in Fahrenheit; out-of-range values are
    /// clamped to the device's 61..86 range.
    pub async fn set_target_temp(&self, fahrenheit: f64) -> Result<(), ClientError> {
        self.set_dps(dps::build_setpoint_dps(fahrenheit)).await
    }

    pub async fn set_fan(&self, fan: FanSpeed) -> Result<(), ClientError> {
        self.set_dps(dps::build_fan_dps(fan)).await
    }

    pub async fn set_vertical_swing(&self, swing: VerticalSwing) -> Result<(), ClientError> {
        self.set_dps(dps::build_vertical_swing_dps(swing)).await
    }

    pub async fn set_horizontal_swing(&self, swing: HorizontalSwing) -> Result<(), ClientError> {
        self.set_dps(dps::build_horizontal_swing_dps(swing)).await
    }

    pub async fn set_eco(&self, on: bool) -> Result<(), ClientError> {
        self.set_dps(dps::build_eco_dps(on)).await
    }

    pub async fn set_sleep(&self, on: bool) -> Result<(), ClientError> {
        self.set_dps(dps::build_sleep_dps(on)).await
    }

    /// Query the device for its current DP snapshot.
    pub async fn refresh(&self) -> Result<BTreeMap<u8, DpValue>, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Query { respond: tx })
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }

    /// Last known device state without touching the network.
    pub fn snapshot(&self) -> Snapshot {
        self.snapshot.lock().expect("snapshot lock").clone()
    }

    /// Subscribe to DP deltas and presence changes.
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Close the socket and clear session state. The engine stays alive;
    /// a later command reconnects.
    pub async fn disconnect(&self) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Disconnect { respond: tx })
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)
    }

    async fn set_dps(&self, dps: serde_json::Value) -> Result<(), ClientError> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(Request::Set { dps, respond: tx })
            .await
            .map_err(|_| ClientError::Closed)?;
        rx.await.map_err(|_| ClientError::Closed)?
    }
}

impl fmt::Debug for WytClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WytClient").finish_non_exhaustive()
    }
}
