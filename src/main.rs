use wyt_local::{bridge, load_config, Event, WytClient};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("wyt_local=debug")
        .init();

    let config = load_config("wyt.toml")?;
    tracing::info!(
        device_ip = %config.device_ip,
        device_id = %config.device_id,
        protocol = %config.protocol,
        "Config loaded"
    );

    let bridge_config = config.bridge.clone();
    let client = WytClient::spawn(config);

    match bridge_config {
        Some(bridge_config) => bridge::serve(client, bridge_config).await?,
        None => {
            // No bridge configured: run headless and log device activity
            let mut events = client.subscribe();
            loop {
                match events.recv().await {
                    Ok(Event::Dp { dp, value }) => tracing::info!(dp, %value, "DP update"),
                    Ok(Event::Online(online)) => tracing::info!(online, "Presence change"),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(missed = n, "Event stream lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    }

    Ok(())
}
