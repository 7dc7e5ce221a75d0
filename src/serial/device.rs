use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch, Mutex};
use uuid::Uuid;

use crate::logging::UiLogger;

use super::framing::FrameDecoder;
use super::transport::PortTransport;
use super::{DeviceState, RawPort, Result, SerialError, TimestampedBytes};

const TAG: &str = "serial.device";

const DATA_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 64;

/// TX/RX byte counters, called synchronously from the pump.
pub trait ByteMeter: Send + Sync {
    fn on_write(&self, count: usize);
    fn on_read(&self, count: usize);
}

/// Shared lifecycle cell: a watch channel carries the current state for
/// synchronous reads, a broadcast channel carries every transition in order,
/// and a deduplicated watch<bool> carries connectivity.
pub(crate) struct StateCell {
    current: watch::Sender<DeviceState>,
    events: broadcast::Sender<DeviceState>,
    opened: watch::Sender<bool>,
}

impl StateCell {
    pub(crate) fn new() -> Self {
        let (current, _) = watch::channel(DeviceState::Closed);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (opened, _) = watch::channel(false);
        Self {
            current,
            events,
            opened,
        }
    }

    pub(crate) fn get(&self) -> DeviceState {
        *self.current.borrow()
    }

    /// Apply a transition; repeated values are dropped so every published
    /// event is a real change.
    pub(crate) fn set(&self, next: DeviceState) {
        let changed = self.current.send_if_modified(|state| {
            if *state == next {
                false
            } else {
                *state = next;
                true
            }
        });
        if changed {
            let _ = self.events.send(next);
            self.opened.send_if_modified(|flag| {
                let now = next.is_opened();
                if *flag == now {
                    false
                } else {
                    *flag = now;
                    true
                }
            });
        }
    }

    /// Atomically claim Closed -> Opening. False means an open is already
    /// live and the caller must back off.
    pub(crate) fn try_begin_open(&self) -> bool {
        let armed = self.current.send_if_modified(|state| {
            if *state == DeviceState::Closed {
                *state = DeviceState::Opening;
                true
            } else {
                false
            }
        });
        if armed {
            let _ = self.events.send(DeviceState::Opening);
        }
        armed
    }

    pub(crate) fn subscribe_current(&self) -> watch::Receiver<DeviceState> {
        self.current.subscribe()
    }

    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<DeviceState> {
        self.events.subscribe()
    }

    pub(crate) fn subscribe_opened(&self) -> watch::Receiver<bool> {
        self.opened.subscribe()
    }
}

/// One logical serial device: a transport plus optional framing, exposed as
/// an observable lifecycle and data stream.
///
/// All lifecycle operations serialize on the transport slot, so a close
/// started during an in-flight open waits for that open to settle first.
pub struct SerialDevice {
    id: Uuid,
    state: Arc<StateCell>,
    data_tx: broadcast::Sender<TimestampedBytes>,
    transport: Arc<Mutex<Option<PortTransport>>>,
    meter: Option<Arc<dyn ByteMeter>>,
    logger: Arc<dyn UiLogger>,
}

impl SerialDevice {
    pub fn new(logger: Arc<dyn UiLogger>) -> Self {
        Self::with_meter(logger, None)
    }

    pub fn with_meter(logger: Arc<dyn UiLogger>, meter: Option<Arc<dyn ByteMeter>>) -> Self {
        let (data_tx, _) = broadcast::channel(DATA_CAPACITY);
        Self {
            id: Uuid::new_v4(),
            state: Arc::new(StateCell::new()),
            data_tx,
            transport: Arc::new(Mutex::new(None)),
            meter,
            logger,
        }
    }

    /// Session id for log correlation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> DeviceState {
        self.state.get()
    }

    pub fn is_opened(&self) -> bool {
        self.state.get().is_opened()
    }

    /// Every state transition, in order. Late subscribers read the current
    /// value via `state()`.
    pub fn observe_state(&self) -> broadcast::Receiver<DeviceState> {
        self.state.subscribe_events()
    }

    /// Deduplicated connectivity stream with replay of the latest value.
    pub fn observe_opened(&self) -> watch::Receiver<bool> {
        self.state.subscribe_opened()
    }

    /// Timestamped buffers as read (and, when framing is configured,
    /// decoded) by the pump. Nothing is delivered unless the device is
    /// Opened.
    pub fn subscribe_data(&self) -> broadcast::Receiver<TimestampedBytes> {
        self.data_tx.subscribe()
    }

    /// Open `port`, optionally framing reads through `decoder`.
    ///
    /// Fails with `SerialError::AlreadyOpen` unless the device is Closed.
    pub async fn open(&self, port: Box<dyn RawPort>, decoder: Option<FrameDecoder>) -> Result<()> {
        let mut slot = self.transport.lock().await;
        if !self.state.try_begin_open() {
            return Err(SerialError::AlreadyOpen);
        }

        let mut transport = self.build_transport(port, decoder);
        self.logger.i(
            TAG,
            &format!("device {} opening {}", self.id, transport.path()),
        );
        transport.open().await?;
        *slot = Some(transport);
        Ok(())
    }

    /// Like `open`, but only the Opening transition happens before this
    /// returns; the OS open runs on a spawned task. Device factories use
    /// this so a freshly constructed device is already opening.
    ///
    /// The task holds the transport slot until the open settles, so a
    /// concurrent `close` waits for it.
    pub fn spawn_open(&self, port: Box<dyn RawPort>, decoder: Option<FrameDecoder>) -> Result<()> {
        let mut slot = self
            .transport
            .clone()
            .try_lock_owned()
            .map_err(|_| SerialError::AlreadyOpen)?;
        if !self.state.try_begin_open() {
            return Err(SerialError::AlreadyOpen);
        }

        let mut transport = self.build_transport(port, decoder);
        let logger = self.logger.clone();
        let id = self.id;
        logger.i(TAG, &format!("device {} opening {}", id, transport.path()));

        tokio::spawn(async move {
            match transport.open().await {
                Ok(()) => *slot = Some(transport),
                Err(e) => logger.e(TAG, &format!("device {} open failed: {}", id, e)),
            }
        });
        Ok(())
    }

    fn build_transport(
        &self,
        port: Box<dyn RawPort>,
        decoder: Option<FrameDecoder>,
    ) -> PortTransport {
        PortTransport::new(
            port,
            decoder,
            self.state.clone(),
            self.data_tx.clone(),
            self.meter.clone(),
            self.logger.clone(),
        )
    }

    /// Close the transport and settle in Closed. Ignored when already
    /// Closed or Closing; waits for an in-flight open to settle first.
    /// After this resolves no further data reaches subscribers.
    pub async fn close(&self) {
        let mut slot = self.transport.lock().await;
        let state = self.state.get();
        if matches!(state, DeviceState::Closed | DeviceState::Closing) {
            // A pump-side close leaves the dead transport in the slot.
            *slot = None;
            self.logger.d(
                TAG,
                &format!("device {} close ignored, state {:?}", self.id, state),
            );
            return;
        }
        match slot.take() {
            Some(mut transport) => transport.close().await,
            None => {
                // No transport was ever attached.
                self.state.set(DeviceState::Closed);
            }
        }
    }

    /// Queue bytes for transmission. A device with no live transport logs
    /// the drop and returns; transmission failures are logged by the pump.
    pub async fn write(&self, bytes: &[u8]) {
        let slot = self.transport.lock().await;
        match slot.as_ref() {
            Some(transport) => transport.write(bytes.to_vec()).await,
            None => self.logger.w(
                TAG,
                &format!("device {} write dropped, no transport", self.id),
            ),
        }
    }

    /// Wait for the device to reach Opened. `timeout_ms == 0` waits
    /// indefinitely; an elapsed timeout resolves false.
    pub async fn wait_until_open(&self, timeout_ms: u64) -> bool {
        let mut opened = self.state.subscribe_opened();
        if *opened.borrow_and_update() {
            return true;
        }

        let wait = async {
            loop {
                if opened.changed().await.is_err() {
                    return false;
                }
                if *opened.borrow_and_update() {
                    return true;
                }
            }
        };

        if timeout_ms == 0 {
            wait.await
        } else {
            tokio::time::timeout(Duration::from_millis(timeout_ms), wait)
                .await
                .unwrap_or(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::TryRecvError;

    #[test]
    fn test_state_cell_orders_and_dedups() {
        let cell = StateCell::new();
        let mut events = cell.subscribe_events();

        cell.set(DeviceState::Opening);
        cell.set(DeviceState::Opened);
        cell.set(DeviceState::Opened);
        cell.set(DeviceState::Closing);
        cell.set(DeviceState::Closed);

        assert_eq!(events.try_recv().unwrap(), DeviceState::Opening);
        assert_eq!(events.try_recv().unwrap(), DeviceState::Opened);
        assert_eq!(events.try_recv().unwrap(), DeviceState::Closing);
        assert_eq!(events.try_recv().unwrap(), DeviceState::Closed);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn test_state_cell_opened_flag_follows_state() {
        let cell = StateCell::new();
        let opened = cell.subscribe_opened();

        cell.set(DeviceState::Opening);
        assert!(!*opened.borrow());
        cell.set(DeviceState::Opened);
        assert!(*opened.borrow());
        cell.set(DeviceState::Closing);
        assert!(!*opened.borrow());
    }

    #[test]
    fn test_begin_open_only_from_closed() {
        let cell = StateCell::new();
        assert!(cell.try_begin_open());
        assert!(!cell.try_begin_open());

        cell.set(DeviceState::Opened);
        assert!(!cell.try_begin_open());

        cell.set(DeviceState::Closed);
        assert!(cell.try_begin_open());
    }
}
