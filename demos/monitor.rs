use bedjet_ble::{
    BedJet, BtleplugClient, ConnectionParams, TimeoutConfig, GEN2_SERVICE_UUID, GEN3_SERVICE_UUID,
};
use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::Manager;
use std::{error::Error, sync::Arc, time::Duration};
use tokio::time::{interval, sleep, Instant};
use tracing::{error, info, warn};

const SCAN_TIME: Duration = Duration::from_secs(5);
const MONITOR_TIME: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize logging
    tracing_subscriber::fmt::init();

    info!("BedJet Monitor Example");
    info!("Scanning for BedJet devices...");

    let manager = Manager::new().await?;
    let Some(adapter) = manager.adapters().await?.into_iter().next() else {
        error!("No Bluetooth adapter found");
        return Ok(());
    };

    adapter
        .start_scan(ScanFilter {
            services: vec![GEN3_SERVICE_UUID, GEN2_SERVICE_UUID],
        })
        .await?;
    sleep(SCAN_TIME).await;
    adapter.stop_scan().await?;

    let mut found = None;
    for peripheral in adapter.peripherals().await? {
        let Some(properties) = peripheral.properties().await? else {
            continue;
        };
        let services = &properties.services;
        if services.contains(&GEN3_SERVICE_UUID) || services.contains(&GEN2_SERVICE_UUID) {
            found = Some((peripheral, properties.local_name.unwrap_or_default()));
            break;
        }
    }

    let Some((peripheral, advertised_name)) = found else {
        warn!("No BedJet found");
        return Ok(());
    };

    let bedjet = BedJet::new(
        Arc::new(BtleplugClient::new(adapter, peripheral)),
        advertised_name,
        ConnectionParams::default(),
        TimeoutConfig::default(),
    );

    let subscription = bedjet.register_callback(|state| {
        println!(
            "{:<14} {:5.1}°C -> {:5.1}°C  fan {:3}%  {:>5}s left",
            state.operating_mode.to_string(),
            state.current_temperature,
            state.target_temperature,
            state.fan_speed,
            state.runtime_remaining.as_secs()
        );
    });

    if let Err(e) = bedjet.update().await {
        error!("Failed to connect: {}", e);
        return Ok(());
    }

    info!(
        "Connected to {} ({}, firmware {})",
        bedjet.name(),
        bedjet.model_name().unwrap_or("unknown model"),
        bedjet.firmware_version().unwrap_or_default()
    );
    for name in [bedjet.m1_name(), bedjet.m2_name(), bedjet.m3_name()]
        .into_iter()
        .flatten()
    {
        info!("Memory preset {}", name);
    }
    if let Some(diagnostics) = bedjet.diagnostics() {
        info!("Pending notification: {}", diagnostics.notification);
    }

    let started = Instant::now();
    let mut ticks = interval(Duration::from_secs(10));
    while started.elapsed() < MONITOR_TIME {
        ticks.tick().await;
        if bedjet.is_data_stale() {
            warn!("No recent data, refreshing");
            if let Err(e) = bedjet.update().await {
                warn!("Refresh failed: {}", e);
            }
        }
    }

    subscription.unregister();
    info!("Disconnecting...");
    bedjet.stop().await;
    Ok(())
}
