//! Local Tuya-protocol control for Pioneer WYT (Diamante) mini-split heat
//! pumps. Speaks dialects 3.1, 3.3 and 3.4 over TCP/6668 and exposes a
//! thermostat-shaped view of the device.

pub mod bridge;
pub mod client;
pub mod config;
mod connection;
pub mod dispatcher;
pub mod dps;
pub mod protocol;
pub mod session;

pub use client::{ClientError, WytClient};
pub use config::{load_config, BridgeConfig, Config, ConfigError};
pub use dispatcher::{Event, Snapshot};
pub use dps::{
    DpValue, DpsError, FanSpeed, HorizontalSwing, HvacMode, OperatingState, ThermostatState,
    VerticalSwing,
};
pub use protocol::Protocol;
