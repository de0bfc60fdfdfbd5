//! padlink daemon
//!
//! Connects to the accessory pairing service over D-Bus and reports the
//! controllers it knows about, keyed by platform input device id.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use padlink::{
    config::{BusKind, Config},
    dbus::DbusBinder,
    listener::{ChannelListener, DeviceEvent},
    rumble::RumbleScheduler,
    session::AccessoryManager,
};

/// padlink - game controller bridge for the accessory pairing service
#[derive(Parser, Debug)]
#[command(name = "padlinkd")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/padlink/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Talk to the service on the system bus instead of the configured one
    #[arg(long)]
    system_bus: bool,

    /// Print device events as JSON lines on stdout
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("padlink daemon starting...");

    let loaded = match &args.config {
        Some(path) => Config::load(path),
        None => Config::load_default(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            warn!("Failed to load config, using defaults: {}", e);
            Config::default()
        }
    };
    if args.system_bus {
        config.service.bus = BusKind::System;
    }

    let binder = Arc::new(DbusBinder::new(config.service.clone()));
    let manager = AccessoryManager::with_rumble_scheduler(
        binder,
        RumbleScheduler::new(config.rumble.keepalive_interval()),
    );

    let (listener, mut event_rx) = ChannelListener::channel();
    manager.set_device_listener(Some(Arc::new(listener)));

    if !manager.start().await {
        error!(service = %config.service.name, "Could not bind to accessory service");
        return Err(format!("failed to bind to {}", config.service.name).into());
    }

    let event_manager = manager.clone();
    let json = args.json;
    let event_handle = tokio::spawn(async move {
        process_device_events(&mut event_rx, &event_manager, json).await
    });

    info!("padlink daemon ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, exiting...");
        }
        result = event_handle => {
            if let Err(e) = result {
                error!("Event processing task panicked: {:?}", e);
            }
        }
    }

    manager.stop().await;
    Ok(())
}

/// Report every device event until the manager goes away
async fn process_device_events(
    event_rx: &mut mpsc::UnboundedReceiver<DeviceEvent>,
    manager: &AccessoryManager,
    json: bool,
) {
    while let Some(event) = event_rx.recv().await {
        if json {
            match render_event(&event) {
                Ok(line) => println!("{}", line),
                Err(e) => warn!("Failed to encode event: {}", e),
            }
        } else {
            info!(device_id = %event.device_id(), ?event, "Device event");
        }

        if let DeviceEvent::Added { device_id } = event {
            describe_device(manager, device_id).await;
        }
    }
    info!("Device event channel closed");
}

/// Log the static properties of a newly seen controller
async fn describe_device(manager: &AccessoryManager, device_id: padlink::DeviceId) {
    let category = manager.category(device_id).await;
    let nickname = manager.nickname(device_id).await.unwrap_or_default();
    let battery = manager.battery_percentage(device_id).await;
    let connection = manager.connection_type(device_id).await;

    info!(
        device_id = %device_id,
        %category,
        nickname = %nickname,
        battery,
        %connection,
        "Controller attached"
    );
}

fn render_event(event: &DeviceEvent) -> Result<String, serde_json::Error> {
    serde_json::to_string(event)
}

#[cfg(test)]
mod tests {
    use super::*;
    use padlink::listener::DeviceListener;
    use padlink::DeviceId;

    #[test]
    fn test_args_defaults() {
        let args = Args::parse_from(["padlinkd"]);
        assert!(args.config.is_none());
        assert!(!args.verbose);
        assert!(!args.system_bus);
        assert!(!args.json);
    }

    #[test]
    fn test_args_flags() {
        let args = Args::parse_from([
            "padlinkd",
            "--config",
            "/tmp/padlink.json",
            "-v",
            "--system-bus",
            "--json",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/padlink.json")));
        assert!(args.verbose);
        assert!(args.system_bus);
        assert!(args.json);
    }

    #[test]
    fn test_render_event_json_line() {
        let line = render_event(&DeviceEvent::InputDeviceIdChanged {
            old_device_id: DeviceId::new(5),
            new_device_id: DeviceId::new(6),
        })
        .unwrap();
        assert_eq!(
            line,
            r#"{"event":"input_device_id_changed","old_device_id":5,"new_device_id":6}"#
        );
        assert!(!line.contains('\n'));
    }

    #[tokio::test]
    async fn test_event_channel_preserves_order() {
        let (listener, mut rx) = ChannelListener::channel();

        for id in 0..5 {
            listener.on_event(DeviceEvent::Added { device_id: DeviceId::new(id) });
        }
        for id in 0..5 {
            assert_eq!(rx.recv().await.unwrap().device_id(), DeviceId::new(id));
        }
        assert!(rx.try_recv().is_err());
    }
}
