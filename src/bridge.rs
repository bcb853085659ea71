use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::client::{ClientError, WytClient};
use crate::config::BridgeConfig;
use crate::dispatcher::Snapshot;
use crate::dps::{FanSpeed, HorizontalSwing, HvacMode, VerticalSwing};

/// Thin REST adapter over one device engine. Everything except /health
/// requires the configured bearer token, when one is set.
pub struct BridgeState {
    client: WytClient,
    token: Option<String>,
    started: Instant,
}

type ApiError = (StatusCode, Json<Value>);

#[derive(Deserialize)]
struct StatusQuery {
    #[serde(default)]
    refresh: bool,
}

#[derive(Deserialize)]
struct CommandBody {
    command: String,
    value: Value,
}

pub async fn serve(client: WytClient, config: BridgeConfig) -> std::io::Result<()> {
    let state = Arc::new(BridgeState {
        client,
        token: config.token,
        started: Instant::now(),
    });

    let listener = tokio::net::TcpListener::bind(&config.listen).await?;
    tracing::info!(addr = %config.listen, "HTTP bridge listening");
    axum::serve(listener, build_router(state)).await
}

pub fn build_router(state: Arc<BridgeState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/command", post(command))
        .with_state(state)
}

async fn health(State(state): State<Arc<BridgeState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "uptime_secs": state.started.elapsed().as_secs(),
        "version": env!("CARGO_PKG_VERSION"),
        "device_online": state.client.snapshot().online,
    }))
}

async fn status(
    State(state): State<Arc<BridgeState>>,
    Query(query): Query<StatusQuery>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;

    if query.refresh {
        state.client.refresh().await.map_err(client_error)?;
    }

    let snap = state.client.snapshot();
    Ok(Json(json!({
        "success": true,
        "status": status_json(&snap),
    })))
}

async fn command(
    State(state): State<Arc<BridgeState>>,
    headers: HeaderMap,
    Json(body): Json<CommandBody>,
) -> Result<Json<Value>, ApiError> {
    authorize(&state, &headers)?;

    let client = &state.client;
    let result = match body.command.as_str() {
        "power" => {
            let on = body
                .value
                .as_bool()
                .ok_or_else(|| bad_request("power expects a boolean value"))?;
            if on { client.on().await } else { client.off().await }
        }
        "target_temp" => {
            let temp = body
                .value
                .as_f64()
                .ok_or_else(|| bad_request("target_temp expects a number"))?;
            client.set_target_temp(temp).await
        }
        "mode" => {
            let mode = parse_enum(&body.value, HvacMode::from_name)?;
            client.set_mode(mode).await
        }
        "fan" => {
            let fan = parse_enum(&body.value, FanSpeed::from_name)?;
            client.set_fan(fan).await
        }
        "vert_swing" => {
            let swing = parse_enum(&body.value, VerticalSwing::from_wire)?;
            client.set_vertical_swing(swing).await
        }
        "horiz_swing" => {
            let swing = parse_enum(&body.value, HorizontalSwing::from_wire)?;
            client.set_horizontal_swing(swing).await
        }
        other => return Err(bad_request(&format!("unknown command: {other}"))),
    };
    result.map_err(client_error)?;

    let snap = state.client.snapshot();
    Ok(Json(json!({
        "success": true,
        "status": status_json(&snap),
    })))
}

fn parse_enum<T>(
    value: &Value,
    parse: impl Fn(&str) -> Result<T, crate::dps::DpsError>,
) -> Result<T, ApiError> {
    let raw = value
        .as_str()
        .ok_or_else(|| bad_request("expected a string value"))?;
    parse(raw).map_err(|e| bad_request(&e.to_string()))
}

fn authorize(state: &BridgeState, headers: &HeaderMap) -> Result<(), ApiError> {
    let Some(token) = &state.token else {
        return Ok(());
    };

    let presented = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    if presented == Some(token.as_str()) {
        Ok(())
    } else {
        Err((
            StatusCode::UNAUTHORIZED,
            Json(json!({ "success": false, "error": "unauthorized" })),
        ))
    }
}

fn bad_request(msg: &str) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({ "success": false, "error": msg })),
    )
}

fn client_error(e: ClientError) -> ApiError {
    let code = match e {
        ClientError::Timeout => StatusCode::GATEWAY_TIMEOUT,
        ClientError::NotConnected => StatusCode::BAD_GATEWAY,
        ClientError::BadValue(_) => StatusCode::BAD_REQUEST,
        ClientError::Closed => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, Json(json!({ "success": false, "error": e.to_string() })))
}

fn status_json(snap: &Snapshot) -> Value {
    let t = &snap.thermostat;
    json!({
        "online": snap.online,
        "power": t.power,
        "mode": t.mode,
        "operating_state": t.operating_state().to_string(),
        "target_temp": t.setpoint_f,
        "cooling_setpoint": t.cooling_setpoint_f,
        "heating_setpoint": t.heating_setpoint_f,
        "current_temp": t.current_temp_f,
        "humidity": t.humidity,
        "fan": t.fan,
        "vert_swing": t.vertical_swing,
        "horiz_swing": t.horizontal_swing,
        "eco": t.eco,
        "sleep": t.sleep,
        "fault": t.fault,
        "filter_dirty": t.filter_dirty,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dps::{DpValue, DP_MODE, DP_POWER, DP_TARGET_TEMP};

    #[test]
    fn status_json_reflects_thermostat_view() {
        let mut snap = Snapshot::default();
        snap.online = true;
        for (dp, value) in [
            (DP_POWER, DpValue::Bool(true)),
            (DP_MODE, DpValue::Str("cold".into())),
            (DP_TARGET_TEMP, DpValue::Int(720)),
        ] {
            snap.thermostat.apply(dp, &value);
        }

        let status = status_json(&snap);
        assert_eq!(status["power"], json!(true));
        assert_eq!(status["mode"], json!("cool"));
        assert_eq!(status["target_temp"], json!(72.0));
        assert_eq!(status["operating_state"], json!("cooling"));
    }

    #[tokio::test]
    async fn bearer_token_is_checked() {
        let state = BridgeState {
            client: dummy_client(),
            token: Some("s3cret".into()),
            started: Instant::now(),
        };

        let mut headers = HeaderMap::new();
        assert!(authorize(&state, &headers).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer wrong".parse().unwrap());
        assert!(authorize(&state, &headers).is_err());

        headers.insert(header::AUTHORIZATION, "Bearer s3cret".parse().unwrap());
        assert!(authorize(&state, &headers).is_ok());
    }

    #[tokio::test]
    async fn no_token_means_open_access() {
        let state = BridgeState {
            client: dummy_client(),
            token: None,
            started: Instant::now(),
        };
        assert!(authorize(&state, &HeaderMap::new()).is_ok());
    }

    fn dummy_client() -> WytClient {
        use crate::config::Config;
        use crate::protocol::Protocol;

        WytClient::spawn(Config {
            device_ip: "127.0.0.1".into(),
            device_port: 6668,
            device_id: "bf1234567890abcdef12".into(),
            local_key: *b"1234567890abcdef",
            protocol: Protocol::V33,
            poll_interval_sec: 0,
            auto_reconnect: false,
            use_heartbeat: false,
            bridge: None,
        })
    }
}
