//! btleplug-backed central-role driver for desktop targets.
//!
//! Desktop BLE stacks expose the central role only; the peripheral half of
//! the dual-role design (advertising + GATT server) needs a platform
//! driver such as BlueZ peripheral mode or the mobile bindings. This
//! driver scans, connects, subscribes to TX notifications and forwards
//! them as [`DriverEvent::InboundFrame`]s.

use crate::driver::{
    BleConnection, BleDriver, DriverConfig, DriverEvent, IDENTITY_CHAR_UUID, RX_CHAR_UUID,
    SERVICE_UUID, TX_CHAR_UUID,
};
use crate::error::MeshError;
use crate::IDENTITY_LENGTH;
use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt;
use log::{debug, warn};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub struct NativeBleDriver {
    adapter: tokio::sync::Mutex<Option<Adapter>>,
    events: tokio::sync::Mutex<Option<mpsc::Sender<DriverEvent>>>,
    cancel: CancellationToken,
}

impl NativeBleDriver {
    pub fn new() -> Self {
        Self {
            adapter: tokio::sync::Mutex::new(None),
            events: tokio::sync::Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    async fn select_adapter(&self, config: &DriverConfig) -> Result<Adapter, MeshError> {
        let manager = Manager::new()
            .await
            .map_err(|err| MeshError::Driver(format!("create BLE manager: {err}")))?;
        let adapters = manager
            .adapters()
            .await
            .map_err(|err| MeshError::Driver(format!("enumerate BLE adapters: {err}")))?;
        if adapters.is_empty() {
            return Err(MeshError::Driver("no BLE adapters available on host".into()));
        }

        if let Some(requested) = config.adapter.as_deref() {
            for adapter in adapters {
                let info = adapter
                    .adapter_info()
                    .await
                    .map_err(|err| MeshError::Driver(format!("read adapter info: {err}")))?;
                if identifiers_match(requested, &info) {
                    return Ok(adapter);
                }
            }
            return Err(MeshError::Driver(format!(
                "configured adapter '{requested}' not found"
            )));
        }

        adapters
            .into_iter()
            .next()
            .ok_or_else(|| MeshError::Driver("no BLE adapters available on host".into()))
    }

    async fn find_peripheral(
        adapter: &Adapter,
        address: &str,
    ) -> Result<Peripheral, MeshError> {
        let peripherals = adapter
            .peripherals()
            .await
            .map_err(|err| MeshError::Driver(format!("list peripherals: {err}")))?;
        for peripheral in peripherals {
            if identifiers_match(address, &peripheral.id().to_string()) {
                return Ok(peripheral);
            }
            if let Ok(Some(properties)) = peripheral.properties().await {
                if identifiers_match(address, &properties.address.to_string()) {
                    return Ok(peripheral);
                }
            }
        }
        Err(MeshError::Driver(format!("peripheral {address} not in scan cache")))
    }
}

impl Default for NativeBleDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BleDriver for NativeBleDriver {
    fn driver_id(&self) -> &'static str {
        "btleplug-central"
    }

    async fn start(
        &self,
        config: &DriverConfig,
        events: mpsc::Sender<DriverEvent>,
    ) -> Result<(), MeshError> {
        let adapter = self.select_adapter(config).await?;
        let service = parse_uuid(SERVICE_UUID)?;
        adapter
            .start_scan(ScanFilter {
                services: vec![service],
            })
            .await
            .map_err(|err| MeshError::Driver(format!("start BLE scan: {err}")))?;

        let mut stream = adapter
            .events()
            .await
            .map_err(|err| MeshError::Driver(format!("open adapter event stream: {err}")))?;
        {
            let mut guard = self.adapter.lock().await;
            *guard = Some(adapter.clone());
        }
        {
            let mut guard = self.events.lock().await;
            *guard = Some(events.clone());
        }

        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = stream.next() => match event {
                        Some(event) => event,
                        None => break,
                    },
                };
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        let rssi = match adapter.peripheral(&id).await {
                            Ok(peripheral) => peripheral
                                .properties()
                                .await
                                .ok()
                                .flatten()
                                .and_then(|properties| properties.rssi)
                                .unwrap_or(-100),
                            Err(_) => -100,
                        };
                        let _ = events
                            .send(DriverEvent::PeerDiscovered {
                                address: id.to_string(),
                                rssi,
                            })
                            .await;
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let _ = events
                            .send(DriverEvent::Disconnected {
                                address: id.to_string(),
                            })
                            .await;
                    }
                    _ => {}
                }
            }
        });
        Ok(())
    }

    async fn connect(&self, address: &str) -> Result<Arc<dyn BleConnection>, MeshError> {
        let adapter = {
            let guard = self.adapter.lock().await;
            guard
                .clone()
                .ok_or_else(|| MeshError::Driver("driver not started".into()))?
        };

        let peripheral = Self::find_peripheral(&adapter, address).await?;
        let connected = peripheral
            .is_connected()
            .await
            .map_err(|err| MeshError::Driver(format!("read connection state: {err}")))?;
        if !connected {
            peripheral
                .connect()
                .await
                .map_err(|err| MeshError::Driver(format!("connect {address}: {err}")))?;
        }
        peripheral
            .discover_services()
            .await
            .map_err(|err| MeshError::Driver(format!("discover services: {err}")))?;

        let rx_char = find_characteristic(&peripheral, RX_CHAR_UUID)?;
        let tx_char = find_characteristic(&peripheral, TX_CHAR_UUID)?;
        let identity_char = find_characteristic(&peripheral, IDENTITY_CHAR_UUID)?;

        peripheral
            .subscribe(&tx_char)
            .await
            .map_err(|err| MeshError::Driver(format!("subscribe TX: {err}")))?;

        // Pump TX notifications into the orchestrator's event stream.
        let events = {
            let guard = self.events.lock().await;
            guard
                .clone()
                .ok_or_else(|| MeshError::Driver("driver not started".into()))?
        };
        let mut notifications = peripheral
            .notifications()
            .await
            .map_err(|err| MeshError::Driver(format!("open notification stream: {err}")))?;
        let notify_uuid = tx_char.uuid;
        let notify_address = address.to_string();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            loop {
                let notification = tokio::select! {
                    _ = cancel.cancelled() => break,
                    notification = notifications.next() => match notification {
                        Some(notification) => notification,
                        None => break,
                    },
                };
                if notification.uuid != notify_uuid {
                    continue;
                }
                if events
                    .send(DriverEvent::InboundFrame {
                        address: notify_address.clone(),
                        payload: notification.value,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        Ok(Arc::new(NativeConnection {
            peripheral,
            address: address.to_string(),
            rx_char,
            identity_char,
        }))
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let guard = self.adapter.lock().await;
        if let Some(adapter) = guard.as_ref() {
            if let Err(err) = adapter.stop_scan().await {
                warn!("stop BLE scan: {err}");
            }
        }
    }
}

struct NativeConnection {
    peripheral: Peripheral,
    address: String,
    rx_char: Characteristic,
    identity_char: Characteristic,
}

#[async_trait]
impl BleConnection for NativeConnection {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn mtu(&self) -> usize {
        // btleplug does not surface the negotiated ATT MTU; stay at the
        // conservative default and let fragmentation absorb the rest.
        247
    }

    async fn write(&self, payload: &[u8]) -> Result<(), MeshError> {
        self.peripheral
            .write(&self.rx_char, payload, WriteType::WithoutResponse)
            .await
            .map_err(|err| MeshError::Driver(format!("write RX: {err}")))
    }

    async fn read_identity(&self) -> Result<[u8; IDENTITY_LENGTH], MeshError> {
        let bytes = self
            .peripheral
            .read(&self.identity_char)
            .await
            .map_err(|err| MeshError::Driver(format!("read IDENTITY: {err}")))?;
        <[u8; IDENTITY_LENGTH]>::try_from(bytes.as_slice())
            .map_err(|_| MeshError::BadIdentityLength(bytes.len()))
    }

    async fn read_rssi(&self) -> Result<i16, MeshError> {
        self.peripheral
            .properties()
            .await
            .map_err(|err| MeshError::Driver(format!("read properties: {err}")))?
            .and_then(|properties| properties.rssi)
            .ok_or_else(|| MeshError::Driver("rssi not reported".into()))
    }

    async fn disconnect(&self) -> Result<(), MeshError> {
        self.peripheral
            .disconnect()
            .await
            .map_err(|err| MeshError::Driver(format!("disconnect: {err}")))
    }
}

fn find_characteristic(
    peripheral: &Peripheral,
    uuid: &str,
) -> Result<Characteristic, MeshError> {
    let wanted = parse_uuid(uuid)?;
    peripheral
        .characteristics()
        .into_iter()
        .find(|characteristic| characteristic.uuid == wanted)
        .ok_or_else(|| {
            debug!("characteristic {uuid} missing on peripheral");
            MeshError::Driver(format!("characteristic {uuid} not found"))
        })
}

fn parse_uuid(value: &str) -> Result<Uuid, MeshError> {
    Uuid::parse_str(value).map_err(|err| MeshError::Driver(format!("invalid uuid '{value}': {err}")))
}

fn identifiers_match(configured: &str, discovered: &str) -> bool {
    normalize_identifier(configured) == normalize_identifier(discovered)
}

fn normalize_identifier(value: &str) -> String {
    value
        .trim()
        .chars()
        .filter(|ch| !matches!(ch, ':' | '-'))
        .flat_map(|ch| ch.to_lowercase())
        .collect()
}
