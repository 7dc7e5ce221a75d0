use std::sync::Arc;

use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use crate::logging::UiLogger;

use super::device::{ByteMeter, StateCell};
use super::framing::FrameDecoder;
use super::{DeviceState, RawPort, Result, SerialError, TimestampedBytes};

const TAG: &str = "serial.transport";

/// Read slice length; short enough that queued writes are never starved
/// behind a blocked read.
const READ_SLICE_MS: u64 = 25;

const WRITE_QUEUE_CAPACITY: usize = 64;

struct WriteRequest {
    bytes: Vec<u8>,
    done: oneshot::Sender<()>,
}

/// One open/close cycle over a single OS port.
///
/// The pump task is the only code touching the port after open: it serves
/// the write queue, reads in short slices, runs the frame decoder and
/// publishes decoded buffers while the state is Opened. A read error or
/// end-of-stream closes the transport from inside the pump.
///
/// Created fresh per open by `SerialDevice` and discarded on close.
pub struct PortTransport {
    path: String,
    state: Arc<StateCell>,
    port: Arc<Mutex<Box<dyn RawPort>>>,
    decoder: Option<FrameDecoder>,
    data_tx: broadcast::Sender<TimestampedBytes>,
    write_tx: mpsc::Sender<WriteRequest>,
    write_rx: Option<mpsc::Receiver<WriteRequest>>,
    stop_tx: Option<watch::Sender<bool>>,
    pump: Option<JoinHandle<()>>,
    meter: Option<Arc<dyn ByteMeter>>,
    logger: Arc<dyn UiLogger>,
}

impl PortTransport {
    pub(crate) fn new(
        port: Box<dyn RawPort>,
        decoder: Option<FrameDecoder>,
        state: Arc<StateCell>,
        data_tx: broadcast::Sender<TimestampedBytes>,
        meter: Option<Arc<dyn ByteMeter>>,
        logger: Arc<dyn UiLogger>,
    ) -> Self {
        let (write_tx, write_rx) = mpsc::channel(WRITE_QUEUE_CAPACITY);
        Self {
            path: port.path().to_string(),
            state,
            port: Arc::new(Mutex::new(port)),
            decoder,
            data_tx,
            write_tx,
            write_rx: Some(write_rx),
            stop_tx: None,
            pump: None,
            meter,
            logger,
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    /// Open the port and start the pump.
    ///
    /// Already-opened transports return Ok without side effects. On failure
    /// the state reverts to Closed and the error is returned.
    pub(crate) async fn open(&mut self) -> Result<()> {
        if self.state.get().is_opened() {
            return Ok(());
        }
        self.state.set(DeviceState::Opening);

        {
            let mut port = self.port.lock().await;
            if let Err(e) = port.open().await {
                self.logger
                    .e(TAG, &format!("open {} failed: {}", self.path, e));
                self.state.set(DeviceState::Closed);
                return Err(e);
            }
            if !port.is_readable() {
                self.logger
                    .e(TAG, &format!("{} opened but is not readable", self.path));
                if let Err(e) = port.close().await {
                    self.logger
                        .w(TAG, &format!("close {} failed: {}", self.path, e));
                }
                self.state.set(DeviceState::Closed);
                return Err(SerialError::ConnectionFailed(format!(
                    "{} is not readable",
                    self.path
                )));
            }
        }

        let mode = match &self.decoder {
            Some(decoder) => format!("framed {} byte packets", decoder.config().packet_len),
            None => "raw passthrough".to_string(),
        };
        self.state.set(DeviceState::Opened);
        self.start_pump();
        self.logger.i(TAG, &format!("{} opened, {}", self.path, mode));
        Ok(())
    }

    /// Stop the pump, close the port, settle in Closed.
    ///
    /// Ignored when already Closed or Closing; OS close errors are logged
    /// and swallowed so close always completes.
    pub(crate) async fn close(&mut self) {
        let state = self.state.get();
        if matches!(state, DeviceState::Closed | DeviceState::Closing) {
            self.logger.d(
                TAG,
                &format!("close {} ignored, state {:?}", self.path, state),
            );
            return;
        }

        self.state.set(DeviceState::Closing);

        if let Some(stop) = self.stop_tx.take() {
            let _ = stop.send(true);
        }
        if let Some(pump) = self.pump.take() {
            let _ = pump.await;
        }

        {
            let mut port = self.port.lock().await;
            if port.is_open() {
                if let Err(e) = port.close().await {
                    self.logger
                        .w(TAG, &format!("close {} failed: {}", self.path, e));
                }
            }
        }

        self.state.set(DeviceState::Closed);
        self.logger.i(TAG, &format!("{} closed", self.path));
    }

    /// Queue bytes for the pump to write and drain.
    ///
    /// Resolves once the attempt finished; failures are logged by the pump
    /// rather than surfaced here.
    pub(crate) async fn write(&self, bytes: Vec<u8>) {
        let (done_tx, done_rx) = oneshot::channel();
        let request = WriteRequest {
            bytes,
            done: done_tx,
        };
        if self.write_tx.send(request).await.is_err() {
            self.logger
                .w(TAG, &format!("write on {} dropped, pump gone", self.path));
            return;
        }
        let _ = done_rx.await;
    }

    fn start_pump(&mut self) {
        let (stop_tx, stop_rx) = watch::channel(false);
        self.stop_tx = Some(stop_tx);

        let write_rx = self
            .write_rx
            .take()
            .expect("pump started once per transport");
        let shared = PumpShared {
            path: self.path.clone(),
            state: self.state.clone(),
            data_tx: self.data_tx.clone(),
            meter: self.meter.clone(),
            logger: self.logger.clone(),
        };

        self.pump = Some(tokio::spawn(pump_task(
            shared,
            self.port.clone(),
            self.decoder.take(),
            write_rx,
            stop_rx,
        )));
    }
}

struct PumpShared {
    path: String,
    state: Arc<StateCell>,
    data_tx: broadcast::Sender<TimestampedBytes>,
    meter: Option<Arc<dyn ByteMeter>>,
    logger: Arc<dyn UiLogger>,
}

async fn pump_task(
    shared: PumpShared,
    port: Arc<Mutex<Box<dyn RawPort>>>,
    mut decoder: Option<FrameDecoder>,
    mut write_rx: mpsc::Receiver<WriteRequest>,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() || *stop_rx.borrow() {
                    break;
                }
            }
            request = write_rx.recv() => {
                match request {
                    Some(request) => {
                        let result = {
                            let mut port = port.lock().await;
                            match port.write_all(&request.bytes).await {
                                Ok(()) => port.drain().await,
                                Err(e) => Err(e),
                            }
                        };
                        match result {
                            Ok(()) => {
                                if let Some(meter) = &shared.meter {
                                    meter.on_write(request.bytes.len());
                                }
                            }
                            Err(e) => shared.logger.w(
                                TAG,
                                &format!(
                                    "write of {} bytes on {} failed: {}",
                                    request.bytes.len(),
                                    shared.path,
                                    e
                                ),
                            ),
                        }
                        let _ = request.done.send(());
                    }
                    None => break,
                }
            }
            read = async {
                let mut port = port.lock().await;
                port.read_chunk(READ_SLICE_MS).await
            } => {
                match read {
                    Ok(Some(chunk)) => {
                        if let Some(meter) = &shared.meter {
                            meter.on_read(chunk.len());
                        }
                        publish(&shared, &mut decoder, chunk);
                    }
                    Ok(None) => {
                        shared.logger.i(
                            TAG,
                            &format!("{} stream ended, closing", shared.path),
                        );
                        close_from_pump(&shared, &port).await;
                        break;
                    }
                    Err(SerialError::Timeout) => {}
                    Err(e) => {
                        shared.logger.e(
                            TAG,
                            &format!("read on {} failed: {}, closing", shared.path, e),
                        );
                        close_from_pump(&shared, &port).await;
                        break;
                    }
                }
            }
        }
    }
}

/// Feed a chunk through the decoder (when framing is configured) and publish
/// the results. Nothing is delivered unless the state is still Opened.
fn publish(shared: &PumpShared, decoder: &mut Option<FrameDecoder>, chunk: Vec<u8>) {
    match decoder.as_mut() {
        Some(decoder) => {
            let resyncs_before = decoder.resync_count();
            let packets = decoder.push(&chunk);
            if decoder.resync_count() != resyncs_before {
                shared.logger.d(
                    TAG,
                    &format!(
                        "frame resync on {}, chunk {}",
                        shared.path,
                        hex_preview(&chunk)
                    ),
                );
            }
            if shared.state.get().is_opened() {
                for packet in packets {
                    let _ = shared.data_tx.send(TimestampedBytes::now(packet));
                }
            }
        }
        None => {
            if shared.state.get().is_opened() {
                let _ = shared.data_tx.send(TimestampedBytes::now(chunk));
            }
        }
    }
}

async fn close_from_pump(shared: &PumpShared, port: &Mutex<Box<dyn RawPort>>) {
    shared.state.set(DeviceState::Closing);
    {
        let mut port = port.lock().await;
        if port.is_open() {
            if let Err(e) = port.close().await {
                shared.logger.w(
                    TAG,
                    &format!("close {} after error failed: {}", shared.path, e),
                );
            }
        }
    }
    shared.state.set(DeviceState::Closed);
}

fn hex_preview(bytes: &[u8]) -> String {
    const PREVIEW_LEN: usize = 32;
    if bytes.len() > PREVIEW_LEN {
        format!("{}..", hex::encode(&bytes[..PREVIEW_LEN]))
    } else {
        hex::encode(bytes)
    }
}
