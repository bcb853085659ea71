use serde::{Deserialize, Serialize};
use std::fmt;

// -- Pioneer WYT (Diamante) mini-split — DPS mapping --
//
// | DPS | Attribute          | Type    | Notes                               |
// |-----|--------------------|---------|-------------------------------------|
// |  1  | power              | Boolean |                                     |
// |  2  | target temperature | Integer | F x 10, writes clamped 610..860     |
// |  3  | current temperature| Integer | Celsius on the wire                 |
// |  4  | mode               | Enum    | cold, hot, wet, wind, auto          |
// |  5  | fan                | Enum    | quiet..strong collapse to 4 speeds  |
// | 18  | humidity           | Integer | %                                   |
// | 20  | fault code         | Integer | opaque                              |
// | 105 | sleep mode         | Boolean |                                     |
// | 113 | vertical swing     | Enum    | off, full, upper, lower             |
// | 114 | horizontal swing   | Enum    | off, full, left, center, right      |
// | 119 | eco mode           | Boolean |                                     |
// | 123 | display/beep       | Integer | bitfield, passed through opaque     |
// | 131 | filter dirty       | Boolean |                                     |

pub const DP_POWER: u8 = 1;
pub const DP_TARGET_TEMP: u8 = 2;
pub const DP_CURRENT_TEMP: u8 = 3;
pub const DP_MODE: u8 = 4;
pub const DP_FAN: u8 = 5;
pub const DP_HUMIDITY: u8 = 18;
pub const DP_FAULT: u8 = 20;
pub const DP_SLEEP: u8 = 105;
pub const DP_VERTICAL_SWING: u8 = 113;
pub const DP_HORIZONTAL_SWING: u8 = 114;
pub const DP_ECO: u8 = 119;
pub const DP_DISPLAY_BEEP: u8 = 123;
pub const DP_FILTER_DIRTY: u8 = 131;

/// Setpoint limits on the wire, tenths of a degree Fahrenheit.
pub const SETPOINT_MIN: i64 = 610;
pub const SETPOINT_MAX: i64 = 860;

/// One untyped DP scalar as the device reports it.
#[derive(Debug, Clone, PartialEq)]
pub enum DpValue {
    Bool(bool),
    Int(i64),
    Str(String),
}

impl DpValue {
    pub fn from_json(v: &serde_json::Value) -> Option<Self> {
        match v {
            serde_json::Value::Bool(b) => Some(DpValue::Bool(*b)),
            serde_json::Value::Number(n) => n.as_i64().map(DpValue::Int),
            serde_json::Value::String(s) => Some(DpValue::Str(s.clone())),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            DpValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            DpValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DpValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for DpValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpValue::Bool(b) => write!(f, "{b}"),
            DpValue::Int(v) => write!(f, "{v}"),
            DpValue::Str(s) => write!(f, "{s}"),
        }
    }
}

#[derive(Debug)]
pub enum DpsError {
    UnknownMode(String),
    UnknownFan(String),
    UnknownSwing(String),
}

impl fmt::Display for DpsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DpsError::UnknownMode(raw) => write!(f, "Unknown HVAC mode: {raw}"),
            DpsError::UnknownFan(raw) => write!(f, "Unknown fan speed: {raw}"),
            DpsError::UnknownSwing(raw) => write!(f, "Unknown swing position: {raw}"),
        }
    }
}

impl std::error::Error for DpsError {}

// -- Enumerated attributes --

/// Operating mode. Wire names follow the Tuya HVAC convention, the domain
/// names the thermostat one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Cool,
    Heat,
    Dry,
    FanOnly,
    Auto,
}

impl HvacMode {
    pub fn wire(self) -> &'static str {
        match self {
            HvacMode::Cool => "cold",
            HvacMode::Heat => "hot",
            HvacMode::Dry => "wet",
            HvacMode::FanOnly => "wind",
            HvacMode::Auto => "auto",
        }
    }

    pub fn from_wire(s: &str) -> Result<Self, DpsError> {
        match s {
            "cold" => Ok(HvacMode::Cool),
            "hot" => Ok(HvacMode::Heat),
            "wet" => Ok(HvacMode::Dry),
            "wind" => Ok(HvacMode::FanOnly),
            "auto" => Ok(HvacMode::Auto),
            other => Err(DpsError::UnknownMode(other.to_owned())),
        }
    }

    pub fn from_name(s: &str) -> Result<Self, DpsError> {
        match s {
            "cool" => Ok(HvacMode::Cool),
            "heat" => Ok(HvacMode::Heat),
            "dry" => Ok(HvacMode::Dry),
            "fan_only" => Ok(HvacMode::FanOnly),
            "auto" => Ok(HvacMode::Auto),
            other => Err(DpsError::UnknownMode(other.to_owned())),
        }
    }
}

/// Fan speed. The device reports seven wire levels which collapse onto
/// four domain speeds; writes always use the canonical wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FanSpeed {
    Low,
    Medium,
    High,
    Auto,
}

impl FanSpeed {
    pub fn wire(self) -> &'static str {
        match self {
            FanSpeed::Low => "low",
            FanSpeed::Medium => "medium",
            FanSpeed::High => "high",
            FanSpeed::Auto => "auto",
        }
    }

    pub fn from_wire(s: &str) -> Result<Self, DpsError> {
        match s {
            "quiet" | "low" => Ok(FanSpeed::Low),
            "medium-low" | "medium" | "medium-high" => Ok(FanSpeed::Medium),
            "high" | "strong" => Ok(FanSpeed::High),
            "auto" => Ok(FanSpeed::Auto),
            other => Err(DpsError::UnknownFan(other.to_owned())),
        }
    }

    pub fn from_name(s: &str) -> Result<Self, DpsError> {
        Self::from_wire(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerticalSwing {
    Off,
    Full,
    Upper,
    Lower,
}

impl VerticalSwing {
    pub fn wire(self) -> &'static str {
        match self {
            VerticalSwing::Off => "off",
            VerticalSwing::Full => "full",
            VerticalSwing::Upper => "upper",
            VerticalSwing::Lower => "lower",
        }
    }

    pub fn from_wire(s: &str) -> Result<Self, DpsError> {
        match s {
            "off" => Ok(VerticalSwing::Off),
            "full" => Ok(VerticalSwing::Full),
            "upper" => Ok(VerticalSwing::Upper),
            "lower" => Ok(VerticalSwing::Lower),
            other => Err(DpsError::UnknownSwing(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HorizontalSwing {
    Off,
    Full,
    Left,
    Center,
    Right,
}

impl HorizontalSwing {
    pub fn wire(self) -> &'static str {
        match self {
            HorizontalSwing::Off => "off",
            HorizontalSwing::Full => "full",
            HorizontalSwing::Left => "left",
            HorizontalSwing::Center => "center",
            HorizontalSwing::Right => "right",
        }
    }

    pub fn from_wire(s: &str) -> Result<Self, DpsError> {
        match s {
            "off" => Ok(HorizontalSwing::Off),
            "full" => Ok(HorizontalSwing::Full),
            "left" => Ok(HorizontalSwing::Left),
            "center" => Ok(HorizontalSwing::Center),
            "right" => Ok(HorizontalSwing::Right),
            other => Err(DpsError::UnknownSwing(other.to_owned())),
        }
    }
}

/// Derived equipment state; not a DP.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingState {
    Cooling,
    Heating,
    FanOnly,
    Idle,
}

impl fmt::Display for OperatingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingState::Cooling => write!(f, "cooling"),
            OperatingState::Heating => write!(f, "heating"),
            OperatingState::FanOnly => write!(f, "fan only"),
            OperatingState::Idle => write!(f, "idle"),
        }
    }
}

// -- Unit conversions --

/// Encode a Fahrenheit setpoint for DP 2: tenths of a degree, clamped to
/// the device's 61..86 F range.
pub fn encode_setpoint(fahrenheit: f64) -> i64 {
    let raw = (fahrenheit * 10.0).round() as i64;
    raw.clamp(SETPOINT_MIN, SETPOINT_MAX)
}

pub fn decode_setpoint(raw: i64) -> f64 {
    raw as f64 / 10.0
}

/// DP 3 reports Celsius; the thermostat view is Fahrenheit.
pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

// -- Thermostat view --

/// Typed thermostat snapshot assembled from reported DPs. Fields stay
/// `None` until the device has reported the corresponding DP.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ThermostatState {
    pub power: Option<bool>,
    pub mode: Option<HvacMode>,
    pub setpoint_f: Option<f64>,
    pub cooling_setpoint_f: Option<f64>,
    pub heating_setpoint_f: Option<f64>,
    pub current_temp_f: Option<f64>,
    pub humidity: Option<i64>,
    pub fan: Option<FanSpeed>,
    pub vertical_swing: Option<VerticalSwing>,
    pub horizontal_swing: Option<HorizontalSwing>,
    pub eco: Option<bool>,
    pub sleep: Option<bool>,
    pub fault: Option<i64>,
    pub display_beep: Option<i64>,
    pub filter_dirty: Option<bool>,
}

impl ThermostatState {
    /// Fold one reported DP into the view. Values of the wrong type for
    /// their DP are ignored.
    pub fn apply(&mut self, dp: u8, value: &DpValue) {
        match dp {
            DP_POWER => self.power = value.as_bool().or(self.power),
            DP_TARGET_TEMP => {
                if let Some(raw) = value.as_int() {
                    self.setpoint_f = Some(decode_setpoint(raw));
                    self.mirror_setpoint();
                }
            }
            DP_CURRENT_TEMP => {
                if let Some(c) = value.as_int() {
                    self.current_temp_f = Some(celsius_to_fahrenheit(c as f64));
                }
            }
            DP_MODE => {
                if let Some(mode) = value.as_str().and_then(|s| HvacMode::from_wire(s).ok()) {
                    self.mode = Some(mode);
                    // The setpoint channel active under the new mode mirrors
                    // DP 2; the inactive channel keeps its last value.
                    self.mirror_setpoint();
                }
            }
            DP_FAN => {
                if let Some(fan) = value.as_str().and_then(|s| FanSpeed::from_wire(s).ok()) {
                    self.fan = Some(fan);
                }
            }
            DP_HUMIDITY => self.humidity = value.as_int().or(self.humidity),
            DP_FAULT => self.fault = value.as_int().or(self.fault),
            DP_SLEEP => self.sleep = value.as_bool().or(self.sleep),
            DP_VERTICAL_SWING => {
                if let Some(s) = value.as_str().and_then(|s| VerticalSwing::from_wire(s).ok()) {
                    self.vertical_swing = Some(s);
                }
            }
            DP_HORIZONTAL_SWING => {
                if let Some(s) = value
                    .as_str()
                    .and_then(|s| HorizontalSwing::from_wire(s).ok())
                {
                    self.horizontal_swing = Some(s);
                }
            }
            DP_ECO => self.eco = value.as_bool().or(self.eco),
            DP_DISPLAY_BEEP => self.display_beep = value.as_int().or(self.display_beep),
            DP_FILTER_DIRTY => self.filter_dirty = value.as_bool().or(self.filter_dirty),
            _ => {}
        }
    }

    fn mirror_setpoint(&mut self) {
        let Some(f) = self.setpoint_f else { return };
        match self.mode {
            Some(HvacMode::Heat) => self.heating_setpoint_f = Some(f),
            Some(_) | None => self.cooling_setpoint_f = Some(f),
        }
    }

    pub fn operating_state(&self) -> OperatingState {
        if self.power != Some(true) {
            return OperatingState::Idle;
        }
        match self.mode {
            Some(HvacMode::Cool) | Some(HvacMode::Dry) => OperatingState::Cooling,
            Some(HvacMode::Heat) => OperatingState::Heating,
            Some(HvacMode::FanOnly) => OperatingState::FanOnly,
            Some(HvacMode::Auto) | None => OperatingState::Idle,
        }
    }
}

// -- Building DPS JSON for sending to the device --

pub fn build_power_dps(on: bool) -> serde_json::Value {
    serde_json::json!({ "1": on })
}

pub fn build_setpoint_dps(fahrenheit: f64) -> serde_json::Value {
    serde_json::json!({ "2": encode_setpoint(fahrenheit) })
}

/// Mode writes force power on in the same update so a mode change on a
/// sleeping unit takes effect.
pub fn build_mode_dps(mode: HvacMode) -> serde_json::Value {
    serde_json::json!({ "1": true, "4": mode.wire() })
}

pub fn build_fan_dps(fan: FanSpeed) -> serde_json::Value {
    serde_json::json!({ "5": fan.wire() })
}

pub fn build_vertical_swing_dps(swing: VerticalSwing) -> serde_json::Value {
    serde_json::json!({ "113": swing.wire() })
}

pub fn build_horizontal_swing_dps(swing: HorizontalSwing) -> serde_json::Value {
    serde_json::json!({ "114": swing.wire() })
}

pub fn build_eco_dps(on: bool) -> serde_json::Value {
    serde_json::json!({ "119": on })
}

pub fn build_sleep_dps(on: bool) -> serde_json::Value {
    serde_json::json!({ "105": on })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setpoint_roundtrip_in_range() {
        for t in 61..=86 {
            let raw = encode_setpoint(t as f64);
            assert_eq!(decode_setpoint(raw), t as f64);
        }
    }

    #[test]
    fn setpoint_clamps_out_of_range() {
        assert_eq!(encode_setpoint(50.0), SETPOINT_MIN);
        assert_eq!(encode_setpoint(100.0), SETPOINT_MAX);
        assert_eq!(encode_setpoint(72.4), 724);
    }

    #[test]
    fn mode_wire_roundtrip() {
        for mode in [
            HvacMode::Cool,
            HvacMode::Heat,
            HvacMode::Dry,
            HvacMode::FanOnly,
            HvacMode::Auto,
        ] {
            assert_eq!(HvacMode::from_wire(mode.wire()).unwrap(), mode);
        }
        assert!(HvacMode::from_wire("defrost").is_err());
    }

    #[test]
    fn fan_wire_collapses_levels() {
        assert_eq!(FanSpeed::from_wire("quiet").unwrap(), FanSpeed::Low);
        assert_eq!(FanSpeed::from_wire("medium-low").unwrap(), FanSpeed::Medium);
        assert_eq!(
            FanSpeed::from_wire("medium-high").unwrap(),
            FanSpeed::Medium
        );
        assert_eq!(FanSpeed::from_wire("strong").unwrap(), FanSpeed::High);
        for fan in [FanSpeed::Low, FanSpeed::Medium, FanSpeed::High, FanSpeed::Auto] {
            assert_eq!(FanSpeed::from_wire(fan.wire()).unwrap(), fan);
        }
    }

    #[test]
    fn current_temp_converts_to_fahrenheit() {
        let mut state = ThermostatState::default();
        state.apply(DP_CURRENT_TEMP, &DpValue::Int(22));
        assert_eq!(state.current_temp_f, Some(71.6));
    }

    #[test]
    fn status_push_updates_view() {
        let mut state = ThermostatState::default();
        state.apply(DP_POWER, &DpValue::Bool(true));
        state.apply(DP_TARGET_TEMP, &DpValue::Int(720));
        state.apply(DP_MODE, &DpValue::Str("cold".into()));

        assert_eq!(state.power, Some(true));
        assert_eq!(state.setpoint_f, Some(72.0));
        assert_eq!(state.mode, Some(HvacMode::Cool));
        assert_eq!(state.operating_state(), OperatingState::Cooling);
    }

    #[test]
    fn setpoint_mirrors_active_channel_only() {
        let mut state = ThermostatState::default();
        state.apply(DP_MODE, &DpValue::Str("cold".into()));
        state.apply(DP_TARGET_TEMP, &DpValue::Int(720));
        assert_eq!(state.cooling_setpoint_f, Some(72.0));
        assert_eq!(state.heating_setpoint_f, None);

        state.apply(DP_MODE, &DpValue::Str("hot".into()));
        assert_eq!(state.heating_setpoint_f, Some(72.0));

        state.apply(DP_TARGET_TEMP, &DpValue::Int(680));
        assert_eq!(state.heating_setpoint_f, Some(68.0));
        // Cooling channel keeps its last mirrored value
        assert_eq!(state.cooling_setpoint_f, Some(72.0));
    }

    #[test]
    fn operating_state_table() {
        let mut state = ThermostatState::default();
        assert_eq!(state.operating_state(), OperatingState::Idle);

        state.apply(DP_POWER, &DpValue::Bool(true));
        state.apply(DP_MODE, &DpValue::Str("hot".into()));
        assert_eq!(state.operating_state(), OperatingState::Heating);

        state.apply(DP_MODE, &DpValue::Str("wind".into()));
        assert_eq!(state.operating_state(), OperatingState::FanOnly);

        state.apply(DP_POWER, &DpValue::Bool(false));
        assert_eq!(state.operating_state(), OperatingState::Idle);
    }

    #[test]
    fn wrong_typed_dp_is_ignored() {
        let mut state = ThermostatState::default();
        state.apply(DP_POWER, &DpValue::Int(3));
        assert_eq!(state.power, None);
        state.apply(DP_MODE, &DpValue::Str("lukewarm".into()));
        assert_eq!(state.mode, None);
    }

    #[test]
    fn mode_dps_forces_power_on() {
        let dps = build_mode_dps(HvacMode::Heat);
        assert_eq!(dps["1"], serde_json::json!(true));
        assert_eq!(dps["4"], serde_json::json!("hot"));
    }
}
