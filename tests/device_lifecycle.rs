use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use blocklink_lib::logging::NopLogger;
use blocklink_lib::serial::{
    ByteMeter, DeviceState, FrameDecoder, MockPort, SerialDevice, SerialError, CLASSROOM_FRAMING,
};
use tokio::sync::broadcast;

fn new_device() -> SerialDevice {
    SerialDevice::new(Arc::new(NopLogger))
}

fn frame(payload_byte: u8) -> Vec<u8> {
    let mut bytes = vec![0x02];
    bytes.extend(std::iter::repeat(payload_byte).take(20));
    bytes.push(0x03);
    bytes
}

async fn next_state(events: &mut broadcast::Receiver<DeviceState>) -> DeviceState {
    tokio::time::timeout(Duration::from_secs(1), events.recv())
        .await
        .expect("state event timed out")
        .expect("state channel closed")
}

#[tokio::test]
async fn test_open_reaches_opened() {
    let device = new_device();
    let (port, handle) = MockPort::new("/dev/mock0");

    device.open(Box::new(port), None).await.expect("open");
    assert!(device.is_opened());
    assert_eq!(device.state(), DeviceState::Opened);
    assert_eq!(handle.open_calls(), 1);
}

#[tokio::test]
async fn test_state_sequence_over_full_cycle() {
    let device = new_device();
    let (port, _handle) = MockPort::new("/dev/mock0");
    let mut events = device.observe_state();

    device.open(Box::new(port), None).await.expect("open");
    device.close().await;

    assert_eq!(next_state(&mut events).await, DeviceState::Opening);
    assert_eq!(next_state(&mut events).await, DeviceState::Opened);
    assert_eq!(next_state(&mut events).await, DeviceState::Closing);
    assert_eq!(next_state(&mut events).await, DeviceState::Closed);
}

#[tokio::test]
async fn test_open_failure_reverts_to_closed() {
    let device = new_device();
    let (mut port, handle) = MockPort::new("/dev/mock0");
    port.fail_open_with("no such port");
    let mut events = device.observe_state();

    let result = device.open(Box::new(port), None).await;
    assert!(matches!(result, Err(SerialError::ConnectionFailed(_))));

    assert_eq!(next_state(&mut events).await, DeviceState::Opening);
    assert_eq!(next_state(&mut events).await, DeviceState::Closed);
    assert_eq!(device.state(), DeviceState::Closed);
    assert_eq!(handle.close_calls(), 0);
}

#[tokio::test]
async fn test_unreadable_port_forces_close() {
    let device = new_device();
    let (mut port, handle) = MockPort::new("/dev/mock0");
    port.set_readable(false);

    let result = device.open(Box::new(port), None).await;
    assert!(matches!(result, Err(SerialError::ConnectionFailed(_))));
    assert_eq!(device.state(), DeviceState::Closed);
    assert_eq!(handle.open_calls(), 1);
    assert_eq!(handle.close_calls(), 1);
}

#[tokio::test]
async fn test_open_while_opened_fails() {
    let device = new_device();
    let (port, _handle) = MockPort::new("/dev/mock0");
    device.open(Box::new(port), None).await.expect("open");

    let (second, _second_handle) = MockPort::new("/dev/mock0");
    let result = device.open(Box::new(second), None).await;
    assert!(matches!(result, Err(SerialError::AlreadyOpen)));
    assert!(device.is_opened());
}

#[tokio::test]
async fn test_double_close_single_os_close() {
    let device = new_device();
    let (port, handle) = MockPort::new("/dev/mock0");
    device.open(Box::new(port), None).await.expect("open");

    device.close().await;
    device.close().await;

    assert_eq!(handle.close_calls(), 1);
    assert_eq!(device.state(), DeviceState::Closed);
}

#[tokio::test]
async fn test_raw_data_delivered_while_opened() {
    let device = new_device();
    let (port, handle) = MockPort::new("/dev/mock0");
    let mut data = device.subscribe_data();

    device.open(Box::new(port), None).await.expect("open");
    handle.feed_bytes(b"hello");

    let event = tokio::time::timeout(Duration::from_secs(1), data.recv())
        .await
        .expect("data timed out")
        .expect("data channel closed");
    assert_eq!(event.bytes, b"hello");
}

#[tokio::test]
async fn test_no_data_after_close() {
    let device = new_device();
    let (port, handle) = MockPort::new("/dev/mock0");
    let mut data = device.subscribe_data();

    device.open(Box::new(port), None).await.expect("open");
    handle.feed_bytes(b"before");
    let event = tokio::time::timeout(Duration::from_secs(1), data.recv())
        .await
        .expect("data timed out")
        .expect("data channel closed");
    assert_eq!(event.bytes, b"before");

    device.close().await;
    handle.feed_bytes(b"after");
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(matches!(
        data.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
}

#[tokio::test]
async fn test_framed_delivery_end_to_end() {
    let device = new_device();
    let (port, handle) = MockPort::new("/dev/mock0");
    let mut data = device.subscribe_data();

    device
        .open(Box::new(port), Some(FrameDecoder::new(CLASSROOM_FRAMING)))
        .await
        .expect("open");

    // One frame split over two reads plus leading noise.
    let packet = frame(0x55);
    handle.feed_bytes(&[0x00, 0x11]);
    handle.feed_bytes(&packet[..9]);
    handle.feed_bytes(&packet[9..]);

    let event = tokio::time::timeout(Duration::from_secs(1), data.recv())
        .await
        .expect("data timed out")
        .expect("data channel closed");
    assert_eq!(event.bytes, packet);
}

#[tokio::test]
async fn test_read_error_auto_closes() {
    let device = new_device();
    let (port, handle) = MockPort::new("/dev/mock0");
    let mut events = device.observe_state();

    device.open(Box::new(port), None).await.expect("open");
    handle.feed_error(SerialError::ConnectionFailed("line died".to_string()));

    assert_eq!(next_state(&mut events).await, DeviceState::Opening);
    assert_eq!(next_state(&mut events).await, DeviceState::Opened);
    assert_eq!(next_state(&mut events).await, DeviceState::Closing);
    assert_eq!(next_state(&mut events).await, DeviceState::Closed);
    assert_eq!(handle.close_calls(), 1);
}

#[tokio::test]
async fn test_stream_end_auto_closes() {
    let device = new_device();
    let (port, mut handle) = MockPort::new("/dev/mock0");

    device.open(Box::new(port), None).await.expect("open");
    let mut opened = device.observe_opened();
    handle.end();

    let closed = tokio::time::timeout(Duration::from_secs(1), async {
        while *opened.borrow_and_update() {
            if opened.changed().await.is_err() {
                break;
            }
        }
    })
    .await;
    assert!(closed.is_ok(), "device never left Opened");
    assert_eq!(device.state(), DeviceState::Closed);
    assert_eq!(handle.close_calls(), 1);
}

#[tokio::test]
async fn test_wait_until_open_times_out() {
    let device = new_device();

    let start = Instant::now();
    let opened = device.wait_until_open(50).await;
    let elapsed = start.elapsed();

    assert!(!opened);
    assert!(elapsed >= Duration::from_millis(50));
    assert!(elapsed < Duration::from_millis(500));
}

#[tokio::test]
async fn test_spawn_open_arms_before_returning() {
    let device = new_device();
    let (port, _handle) = MockPort::new("/dev/mock0");

    device.spawn_open(Box::new(port), None).expect("arm");
    assert_ne!(device.state(), DeviceState::Closed);

    assert!(device.wait_until_open(1000).await);
    assert_eq!(device.state(), DeviceState::Opened);
}

struct CountingMeter {
    tx: AtomicUsize,
    rx: AtomicUsize,
}

impl ByteMeter for CountingMeter {
    fn on_write(&self, count: usize) {
        self.tx.fetch_add(count, Ordering::SeqCst);
    }

    fn on_read(&self, count: usize) {
        self.rx.fetch_add(count, Ordering::SeqCst);
    }
}

#[tokio::test]
async fn test_write_and_meter_counts() {
    let meter = Arc::new(CountingMeter {
        tx: AtomicUsize::new(0),
        rx: AtomicUsize::new(0),
    });
    let device = SerialDevice::with_meter(Arc::new(NopLogger), Some(meter.clone()));
    let (port, handle) = MockPort::new("/dev/mock0");
    let mut data = device.subscribe_data();

    device.open(Box::new(port), None).await.expect("open");

    device.write(b"ping!").await;
    assert_eq!(handle.written(), vec![b"ping!".to_vec()]);
    assert_eq!(handle.drain_calls(), 1);
    assert_eq!(meter.tx.load(Ordering::SeqCst), 5);

    handle.feed_bytes(b"pong");
    let event = tokio::time::timeout(Duration::from_secs(1), data.recv())
        .await
        .expect("data timed out")
        .expect("data channel closed");
    assert_eq!(event.bytes, b"pong");
    assert_eq!(meter.rx.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn test_write_failure_keeps_device_open() {
    let meter = Arc::new(CountingMeter {
        tx: AtomicUsize::new(0),
        rx: AtomicUsize::new(0),
    });
    let device = SerialDevice::with_meter(Arc::new(NopLogger), Some(meter.clone()));
    let (mut port, handle) = MockPort::new("/dev/mock0");
    port.fail_writes(true);

    device.open(Box::new(port), None).await.expect("open");

    // A failing write is logged by the pump and still resolves.
    tokio::time::timeout(Duration::from_secs(1), device.write(b"doomed"))
        .await
        .expect("write resolved");

    assert_eq!(device.state(), DeviceState::Opened);
    assert!(handle.written().is_empty());
    assert_eq!(handle.drain_calls(), 0);
    assert_eq!(meter.tx.load(Ordering::SeqCst), 0);
}
