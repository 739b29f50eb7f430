//! BLE transport session: owns the single GATT link to the BMS.
//!
//! Grounded in `battery_client.rs`'s connect/subscribe/write/notify loop,
//! ported from the stray `btleplug` calls the teacher's source left behind
//! onto `bluest`, the dependency actually declared in the teacher's
//! `Cargo.toml`.

use std::time::Duration;

use bluest::{Adapter, Characteristic, Device, Uuid};
use futures_util::StreamExt;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::TransportError;

const WRITE_CHARACTERISTIC_UUID: &str = "0000fff2-0000-1000-8000-00805f9b34fb";
const NOTIFY_CHARACTERISTIC_UUID: &str = "0000fff1-0000-1000-8000-00805f9b34fb";
const NAME_PREFIX: &str = "DL-";

const DIRECT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SCAN_TIMEOUT: Duration = Duration::from_secs(15);

/// Link state as seen by the Poll Scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// Owns the BLE GATT link to one BMS, identified by MAC address. Not
/// `Clone`; exactly one task (the Poll Scheduler) holds it.
pub struct Transport {
    mac_address: String,
    adapter: Adapter,
    device: Option<Device>,
    write_char: Option<Characteristic>,
    notify_char: Option<Characteristic>,
    state: LinkState,
    disconnect_helper_path: Option<String>,
}

impl Transport {
    pub async fn new(
        mac_address: String,
        disconnect_helper_path: Option<String>,
    ) -> Result<Self, TransportError> {
        let adapter = Adapter::default()
            .await
            .ok_or(TransportError::AdapterUnavailable)?;
        adapter
            .wait_available()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;

        Ok(Self {
            mac_address,
            adapter,
            device: None,
            write_char: None,
            notify_char: None,
            state: LinkState::Disconnected,
            disconnect_helper_path,
        })
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Implements the 3-round connect state machine from §4.2: direct
    /// connect, optional system-disconnect-helper recovery, then a broad
    /// scan matched by address then by name prefix.
    pub async fn connect(&mut self) -> Result<(), TransportError> {
        self.state = LinkState::Connecting;

        match self.connect_direct().await {
            Ok(device) => return self.finish_connect(device).await,
            Err(TransportError::DeviceNotFound) => {
                info!(mac = %self.mac_address, "direct connect found no device, trying disconnect helper");
                if let Some(path) = self.disconnect_helper_path.clone() {
                    if let Err(e) = crate::transport::disconnect_helper::run(&path, &self.mac_address).await {
                        warn!(error = %e, "system-disconnect helper failed");
                    }
                }
            }
            Err(other) => {
                self.state = LinkState::Disconnected;
                return Err(other);
            }
        }

        let device = self.scan_and_match().await?;
        self.finish_connect(device).await
    }

    async fn connect_direct(&self) -> Result<Device, TransportError> {
        let devices = self
            .adapter
            .connected_devices()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;
        for device in devices {
            if device_matches_address(&device, &self.mac_address) {
                return timeout(DIRECT_CONNECT_TIMEOUT, self.adapter.connect_device(&device))
                    .await
                    .map_err(|_| TransportError::ConnectTimeout)?
                    .map_err(|e| TransportError::ConnectRefused(e.to_string()))
                    .map(|_| device);
            }
        }
        Err(TransportError::DeviceNotFound)
    }

    async fn scan_and_match(&self) -> Result<Device, TransportError> {
        let mut scan = self
            .adapter
            .scan(&[])
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let found = timeout(SCAN_TIMEOUT, async {
            while let Some(discovered) = scan.next().await {
                let device = discovered.device;
                if device_matches_address(&device, &self.mac_address) {
                    return Some(device);
                }
                if let Some(name) = device.name_async().await.ok() {
                    if name.starts_with(NAME_PREFIX) {
                        return Some(device);
                    }
                }
            }
            None
        })
        .await
        .map_err(|_| TransportError::ConnectTimeout)?;

        let device = found.ok_or(TransportError::DeviceNotFound)?;
        drop(scan);

        timeout(DIRECT_CONNECT_TIMEOUT, self.adapter.connect_device(&device))
            .await
            .map_err(|_| TransportError::ConnectTimeout)?
            .map_err(|e| TransportError::ConnectRefused(e.to_string()))?;
        Ok(device)
    }

    async fn finish_connect(&mut self, device: Device) -> Result<(), TransportError> {
        device
            .discover_services()
            .await
            .map_err(|e| TransportError::Other(e.to_string()))?;

        let write_char = find_characteristic(&device, WRITE_CHARACTERISTIC_UUID)
            .await
            .ok_or_else(|| TransportError::Other("write characteristic not found".into()))?;
        let notify_char = find_characteristic(&device, NOTIFY_CHARACTERISTIC_UUID)
            .await
            .ok_or_else(|| TransportError::Other("notify characteristic not found".into()))?;

        notify_char
            .notify()
            .await
            .map_err(|e| TransportError::NotifySubscribeFailed(e.to_string()))?;

        self.device = Some(device);
        self.write_char = Some(write_char);
        self.notify_char = Some(notify_char);
        self.state = LinkState::Connected;
        info!(mac = %self.mac_address, "BLE link established");
        Ok(())
    }

    /// Clears the response buffer, writes without response, sleeps for
    /// `wait_duration`, and returns every notification buffered during the
    /// window. Callers must filter echo frames themselves.
    pub async fn send(
        &mut self,
        request: &[u8],
        wait_duration: Duration,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        let notify_char = self
            .notify_char
            .as_ref()
            .ok_or(TransportError::LinkLost("not connected".into()))?;
        let write_char = self
            .write_char
            .as_ref()
            .ok_or(TransportError::LinkLost("not connected".into()))?;

        let mut notifications = notify_char
            .notify()
            .await
            .map_err(|e| TransportError::NotifySubscribeFailed(e.to_string()))?;

        write_char
            .write_without_response(request)
            .await
            .map_err(|e| {
                self.state = LinkState::Connecting;
                TransportError::WriteFailed(e.to_string())
            })?;

        let mut frames = Vec::new();
        let _ = timeout(wait_duration, async {
            while let Some(value) = notifications.next().await {
                if let Ok(bytes) = value {
                    debug!(frame = %hex::encode(&bytes), "notification received");
                    frames.push(bytes);
                }
            }
        })
        .await;

        Ok(frames)
    }

    pub async fn disconnect(&mut self) -> Result<(), TransportError> {
        if let Some(device) = self.device.take() {
            self.adapter
                .disconnect_device(&device)
                .await
                .map_err(|e| TransportError::Other(e.to_string()))?;
        }
        self.write_char = None;
        self.notify_char = None;
        self.state = LinkState::Disconnected;
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::scheduler::PolledTransport for Transport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        Transport::connect(self).await
    }

    async fn send(&mut self, request: &[u8], wait: Duration) -> Result<Vec<Vec<u8>>, TransportError> {
        Transport::send(self, request, wait).await
    }

    fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }
}

fn device_matches_address(device: &Device, mac_address: &str) -> bool {
    device.id().to_string().eq_ignore_ascii_case(mac_address)
}

async fn find_characteristic(device: &Device, uuid: &str) -> Option<Characteristic> {
    let target = Uuid::parse_str(uuid).ok()?;
    let services = device.services().await.ok()?;
    for service in services {
        if let Ok(characteristics) = service.characteristics().await {
            for characteristic in characteristics {
                if characteristic.uuid() == target {
                    return Some(characteristic);
                }
            }
        }
    }
    None
}

pub mod disconnect_helper {
    //! Wraps the OS-level system-disconnect helper invoked on
    //! `DeviceNotFound` during connect (§6). Mirrors
    //! `original_source/tools/bms_disconnect.py`'s structured result and
    //! exit-code contract.

    use serde::Deserialize;
    use tokio::process::Command;

    use crate::error::TransportError;

    #[derive(Debug, Clone, Deserialize)]
    pub struct DisconnectResult {
        pub mac_address: String,
        pub initial_connected: bool,
        pub action_taken: String,
        pub final_connected: bool,
        pub success: bool,
        pub message: String,
        #[serde(default)]
        pub device_info: Option<serde_json::Value>,
    }

    /// Runs the helper at `helper_path` against `mac_address`, expecting a
    /// single JSON object on stdout per the §6 result shape. Exit code 130
    /// (interrupted) and 1 (error) are both surfaced as `Err`; the helper's
    /// own `success` field is not re-validated here, only its exit code.
    pub async fn run(helper_path: &str, mac_address: &str) -> Result<DisconnectResult, TransportError> {
        let output = Command::new(helper_path)
            .arg("--mac-address")
            .arg(mac_address)
            .arg("--json")
            .output()
            .await
            .map_err(|e| TransportError::Other(format!("disconnect helper spawn failed: {e}")))?;

        match output.status.code() {
            Some(0) => {
                let result: DisconnectResult = serde_json::from_slice(&output.stdout)
                    .map_err(|e| TransportError::Other(format!("disconnect helper produced invalid JSON: {e}")))?;
                Ok(result)
            }
            Some(130) => Err(TransportError::Other("disconnect helper interrupted".into())),
            _ => Err(TransportError::Other(format!(
                "disconnect helper exited with {:?}: {}",
                output.status.code(),
                String::from_utf8_lossy(&output.stderr)
            ))),
        }
    }
}
