use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex};

use crate::logging::UiLogger;
use crate::serial::{list_ports, SerialDevice};

use super::profile::{find_matching_port, DeviceFactory, PortMatcher};
use super::{DeviceError, Result};

const TAG: &str = "device.manager";

const CONNECTED_CAPACITY: usize = 64;

/// Owns at most one live device per session.
///
/// Every open and close runs under one session mutex, so two racing `open`
/// calls can never leave two ports open: the second always sees the first
/// device fully closed before it builds its own.
pub struct DeviceManager {
    factory: Arc<dyn DeviceFactory>,
    logger: Arc<dyn UiLogger>,
    session: Mutex<()>,
    device_tx: watch::Sender<Option<Arc<SerialDevice>>>,
}

impl DeviceManager {
    pub fn new(factory: Arc<dyn DeviceFactory>, logger: Arc<dyn UiLogger>) -> Self {
        let (device_tx, _) = watch::channel(None);
        Self {
            factory,
            logger,
            session: Mutex::new(()),
            device_tx,
        }
    }

    /// Open a device on `path`, fully closing any previous device first.
    ///
    /// The returned device is already opening; the reference is published
    /// immediately, so consumers watch the device's own state stream to
    /// learn when it becomes ready.
    pub async fn open(&self, path: &str) -> Arc<SerialDevice> {
        let _session = self.session.lock().await;
        self.close_current().await;

        self.logger.i(TAG, &format!("opening device on {}", path));
        let device = self.factory.open_device(path, self.logger.clone());
        // send_replace stores the reference even while nobody subscribes;
        // send would discard it once every receiver is gone.
        self.device_tx.send_replace(Some(device.clone()));
        device
    }

    /// Enumerate ports and open the first one the matcher accepts.
    pub async fn open_matching(&self, matcher: &dyn PortMatcher) -> Result<Arc<SerialDevice>> {
        let ports = list_ports().map_err(DeviceError::SerialError)?;
        let port = find_matching_port(matcher, &ports).ok_or(DeviceError::NoMatchingPort)?;

        let detail = serde_json::to_string(port).unwrap_or_else(|_| port.path.clone());
        self.logger.i(TAG, &format!("matched port {}", detail));
        Ok(self.open(&port.path).await)
    }

    /// Close the current device, if any, and publish the empty reference.
    pub async fn close(&self) {
        let _session = self.session.lock().await;
        self.close_current().await;
    }

    async fn close_current(&self) {
        let previous = self.device_tx.borrow().clone();
        if let Some(device) = previous {
            self.logger.i(TAG, &format!("closing device {}", device.id()));
            device.close().await;
        }
        self.device_tx.send_replace(None);
    }

    /// The tracked device, only while it is opened.
    pub fn get_connected_device(&self) -> Option<Arc<SerialDevice>> {
        self.device_tx
            .borrow()
            .as_ref()
            .filter(|device| device.is_opened())
            .cloned()
    }

    /// Raw device-reference observable with replay of the latest value.
    /// Carries the device as soon as `open` stores it, still opening.
    pub fn observe_device_ref(&self) -> watch::Receiver<Option<Arc<SerialDevice>>> {
        self.device_tx.subscribe()
    }

    /// Derived stream emitting each device exactly once per open cycle, at
    /// its first Opened transition. Later state changes of the same device
    /// never re-emit it.
    pub fn observe_connected_device(&self) -> mpsc::Receiver<Arc<SerialDevice>> {
        let (tx, rx) = mpsc::channel(CONNECTED_CAPACITY);
        let mut device_rx = self.device_tx.subscribe();

        tokio::spawn(async move {
            loop {
                let device = device_rx.borrow_and_update().clone();
                match device {
                    Some(device) => {
                        let mut opened = device.observe_opened();
                        let became_open = async {
                            loop {
                                if *opened.borrow_and_update() {
                                    return true;
                                }
                                if opened.changed().await.is_err() {
                                    return false;
                                }
                            }
                        };

                        tokio::select! {
                            opened_now = became_open => {
                                if opened_now && tx.send(device.clone()).await.is_err() {
                                    return;
                                }
                                // Emitted (or the device died unopened);
                                // nothing more until the manager replaces it.
                                if device_rx.changed().await.is_err() {
                                    return;
                                }
                            }
                            changed = device_rx.changed() => {
                                if changed.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    None => {
                        if device_rx.changed().await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        rx
    }
}
