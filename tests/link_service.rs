use async_trait::async_trait;
use ble_csv_link::domain::error::LinkError;
use ble_csv_link::domain::models::{AppEvent, ConnectionStatus, CsvTable, InboundEvent, TransferMode};
use ble_csv_link::domain::settings::Settings;
use ble_csv_link::infrastructure::bluetooth::connection::DisconnectOutcome;
use ble_csv_link::infrastructure::bluetooth::fake::FakeTransport;
use ble_csv_link::infrastructure::bluetooth::protocol::{NUS_NOTIFY_CHAR_UUID, NUS_SERVICE_UUID};
use ble_csv_link::infrastructure::bluetooth::transport::TransportError;
use ble_csv_link::infrastructure::bluetooth::BluetoothService;
use ble_csv_link::infrastructure::csv_sink::{parse_table, CsvSink, SinkError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn setup(fake: &FakeTransport) -> (Arc<BluetoothService>, mpsc::UnboundedReceiver<AppEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let service = BluetoothService::new(Arc::new(fake.clone()), &Settings::default(), tx);
    (Arc::new(service), rx)
}

async fn connected(fake: &FakeTransport) -> (Arc<BluetoothService>, mpsc::UnboundedReceiver<AppEvent>) {
    let (service, rx) = setup(fake);
    service.scan().await.unwrap();
    service.connect_index(0).await.unwrap();
    (service, rx)
}

async fn wait_for<F>(events: &mut mpsc::UnboundedReceiver<AppEvent>, mut matches: F) -> AppEvent
where
    F: FnMut(&AppEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_status(event: &AppEvent, expected: ConnectionStatus) -> bool {
    matches!(event, AppEvent::ConnectionStatus(status) if *status == expected)
}

#[derive(Default)]
struct RecordingSink {
    received: Mutex<Vec<String>>,
    reject: bool,
}

#[async_trait]
impl CsvSink for RecordingSink {
    async fn submit(&self, csv: &str) -> Result<CsvTable, SinkError> {
        if self.reject {
            return Err(SinkError::Malformed("rejected".to_string()));
        }
        self.received.lock().unwrap().push(csv.to_string());
        parse_table(csv)
    }
}

#[tokio::test]
async fn test_scan_appends_results() {
    let fake = FakeTransport::with_sample_device();
    let (service, mut events) = setup(&fake);

    let found = service.scan().await.unwrap();
    assert_eq!(found.len(), 1);
    service.scan().await.unwrap();

    assert_eq!(service.devices().len(), 2);
    assert_eq!(service.status(), ConnectionStatus::NotConnected);
    wait_for(&mut events, |e| matches!(e, AppEvent::DeviceFound(d) if d.name == "Sensor")).await;

    service.clear_devices();
    assert!(service.devices().is_empty());
}

#[tokio::test]
async fn test_scan_failure_sets_error_status() {
    let fake = FakeTransport::with_sample_device();
    fake.fail_scan(TransportError::NoAdapter);
    let (service, _events) = setup(&fake);

    assert!(matches!(service.scan().await, Err(LinkError::Scan(_))));
    assert!(matches!(service.status(), ConnectionStatus::Error(_)));
    assert!(service.devices().is_empty());
}

#[tokio::test]
async fn test_connect_subscribes_and_reports_connected() {
    let fake = FakeTransport::with_sample_device();
    let (service, mut events) = connected(&fake).await;

    assert_eq!(service.status(), ConnectionStatus::Connected);
    assert!(service.is_connected());
    assert!(fake.is_subscribed());
    assert_eq!(service.connected_peripheral().unwrap().name, "Sensor");
    wait_for(&mut events, |e| is_status(e, ConnectionStatus::Connected)).await;
}

#[tokio::test]
async fn test_connect_unknown_index() {
    let fake = FakeTransport::with_sample_device();
    let (service, _events) = setup(&fake);

    assert!(matches!(
        service.connect_index(3).await,
        Err(LinkError::Connect { .. })
    ));
    assert_eq!(fake.connects(), 0);
}

#[tokio::test]
async fn test_idle_notifications_are_text() {
    let fake = FakeTransport::with_sample_device();
    let (service, mut events) = connected(&fake).await;

    assert!(fake.notify("hello "));
    assert!(fake.notify("world"));
    wait_for(&mut events, |e| {
        matches!(e, AppEvent::Inbound(InboundEvent::TextReceived(t)) if t == "world")
    })
    .await;

    assert_eq!(service.text_log(), "hello world");
    assert!(!service.csv_ready());
}

#[tokio::test]
async fn test_csv_capture_with_separate_sentinel() {
    let fake = FakeTransport::with_sample_device();
    let (service, mut events) = connected(&fake).await;

    assert!(service.start_capture());
    assert_eq!(service.transfer_mode(), TransferMode::CapturingCsv);
    fake.notify("t,v\n");
    fake.notify("0,1\n");
    fake.notify("__CSV_END__");

    let done = wait_for(&mut events, |e| {
        matches!(e, AppEvent::Inbound(InboundEvent::CsvComplete(_)))
    })
    .await;
    assert!(
        matches!(done, AppEvent::Inbound(InboundEvent::CsvComplete(csv)) if csv == "t,v\n0,1\n")
    );
    assert!(service.csv_ready());
    assert_eq!(service.transfer_mode(), TransferMode::Idle);
    assert_eq!(service.text_log(), "");
}

#[tokio::test]
async fn test_csv_capture_with_split_sentinel() {
    let fake = FakeTransport::with_sample_device();
    let (service, mut events) = connected(&fake).await;

    service.start_capture();
    fake.notify("a,b\n1,2__CSV");
    fake.notify("_END__");

    wait_for(&mut events, |e| {
        matches!(e, AppEvent::Inbound(InboundEvent::CsvComplete(csv)) if csv == "a,b\n1,2")
    })
    .await;
    assert_eq!(service.take_csv().as_deref(), Some("a,b\n1,2"));
    assert!(!service.csv_ready());

    // Back in idle mode, later payloads are text again
    fake.notify("ok");
    wait_for(&mut events, |e| {
        matches!(e, AppEvent::Inbound(InboundEvent::TextReceived(t)) if t == "ok")
    })
    .await;
}

#[tokio::test]
async fn test_second_start_capture_keeps_buffer() {
    let fake = FakeTransport::with_sample_device();
    let (service, mut events) = connected(&fake).await;

    assert!(service.start_capture());
    fake.notify("a,b\n");
    wait_for(&mut events, |e| {
        matches!(e, AppEvent::Inbound(InboundEvent::CsvFragmentReceived { .. }))
    })
    .await;

    assert!(!service.start_capture());
    assert_eq!(service.buffered_len(), 4);
}

#[tokio::test]
async fn test_send_without_session_writes_nothing() {
    let fake = FakeTransport::with_sample_device();
    let (service, _events) = setup(&fake);

    assert_eq!(service.send("ping").await, Err(LinkError::NotConnected));
    assert!(fake.writes().is_empty());
}

#[tokio::test]
async fn test_send_writes_once_per_message() {
    let fake = FakeTransport::with_sample_device();
    let (service, _events) = connected(&fake).await;

    service.send("ping").await.unwrap();
    service.send("").await.unwrap();
    assert_eq!(fake.writes(), vec![b"ping".to_vec(), b"hello".to_vec()]);
}

#[tokio::test]
async fn test_disconnect_without_session() {
    let fake = FakeTransport::with_sample_device();
    let (service, _events) = setup(&fake);

    assert_eq!(
        service.disconnect().await,
        DisconnectOutcome::NothingToDisconnect
    );
    assert_eq!(fake.disconnects(), 0);
}

#[tokio::test]
async fn test_disconnect_closes_link() {
    let fake = FakeTransport::with_sample_device();
    let (service, _events) = connected(&fake).await;

    assert_eq!(service.disconnect().await, DisconnectOutcome::Disconnected);
    assert_eq!(service.status(), ConnectionStatus::Disconnected);
    assert_eq!(fake.disconnects(), 1);
    assert!(!fake.notify("late"));
    assert_eq!(service.send("ping").await, Err(LinkError::NotConnected));
}

#[tokio::test]
async fn test_link_lost_mid_capture_discards_buffer() {
    let fake = FakeTransport::with_sample_device();
    let (service, mut events) = connected(&fake).await;

    service.start_capture();
    fake.notify("partial");
    assert!(fake.drop_link());

    let mut seen = Vec::new();
    timeout(Duration::from_secs(2), async {
        while let Some(event) = events.recv().await {
            let done = is_status(&event, ConnectionStatus::Disconnected);
            seen.push(event);
            if done {
                break;
            }
        }
    })
    .await
    .expect("timed out waiting for link loss");
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }

    assert!(seen.iter().any(|e| matches!(
        e,
        AppEvent::Inbound(InboundEvent::CsvFragmentReceived { buffered_len: 7, .. })
    )));
    assert!(!seen
        .iter()
        .any(|e| matches!(e, AppEvent::Inbound(InboundEvent::CsvComplete(_)))));

    assert!(!service.is_connected());
    assert_eq!(service.transfer_mode(), TransferMode::Idle);
    assert_eq!(service.buffered_len(), 0);
    assert!(!service.csv_ready());
}

#[tokio::test]
async fn test_capture_started_before_connect_survives_connect() {
    let fake = FakeTransport::with_sample_device();
    let (service, mut events) = setup(&fake);
    service.scan().await.unwrap();

    assert!(service.start_capture());
    service.connect_index(0).await.unwrap();
    assert_eq!(service.transfer_mode(), TransferMode::CapturingCsv);

    fake.notify("a,b\n");
    fake.notify("1,2\n__CSV_END__");
    wait_for(&mut events, |e| {
        matches!(e, AppEvent::Inbound(InboundEvent::CsvComplete(csv)) if csv == "a,b\n1,2\n")
    })
    .await;
    assert!(service.csv_ready());
}

#[tokio::test]
async fn test_missing_characteristic_fails_connect() {
    let fake = FakeTransport::with_sample_device();
    fake.remove(NUS_NOTIFY_CHAR_UUID);
    let (service, _events) = setup(&fake);
    service.scan().await.unwrap();

    match service.connect_index(0).await {
        Err(LinkError::Connect { reason }) => {
            assert!(reason.contains("expected UART service"), "{}", reason)
        }
        other => panic!("unexpected result {:?}", other),
    }
    assert!(matches!(service.status(), ConnectionStatus::Error(_)));
    assert!(!service.is_connected());
    assert_eq!(fake.disconnects(), 1);
}

#[tokio::test]
async fn test_missing_service_fails_connect() {
    let fake = FakeTransport::with_sample_device();
    fake.remove(NUS_SERVICE_UUID);
    let (service, _events) = setup(&fake);
    service.scan().await.unwrap();

    assert!(matches!(
        service.connect_index(0).await,
        Err(LinkError::Connect { .. })
    ));
    assert!(!service.is_connected());
}

#[tokio::test]
async fn test_rejected_subscription_fails_connect() {
    let fake = FakeTransport::with_sample_device();
    fake.reject_subscribe();
    let (service, _events) = setup(&fake);
    service.scan().await.unwrap();

    assert!(service.connect_index(0).await.is_err());
    assert!(matches!(service.status(), ConnectionStatus::Error(_)));
    assert_eq!(fake.disconnects(), 1);
}

#[tokio::test]
async fn test_disconnect_cancels_pending_connect() {
    let fake = FakeTransport::with_sample_device();
    fake.stall_connect();
    let (service, mut events) = setup(&fake);
    service.scan().await.unwrap();

    let connecting = service.clone();
    let attempt = tokio::spawn(async move { connecting.connect_index(0).await });
    wait_for(&mut events, |e| is_status(e, ConnectionStatus::Connecting)).await;

    assert_eq!(service.disconnect().await, DisconnectOutcome::Cancelled);
    let result = timeout(Duration::from_secs(2), attempt)
        .await
        .expect("connect did not give up")
        .unwrap();
    assert_eq!(result, Err(LinkError::connect("cancelled")));
    assert_eq!(service.status(), ConnectionStatus::Disconnected);
    assert!(!service.is_connected());
}

#[tokio::test]
async fn test_disconnect_abandons_pending_write() {
    let fake = FakeTransport::with_sample_device();
    let (service, _events) = connected(&fake).await;
    fake.stall_writes();

    let sender = service.clone();
    let write = tokio::spawn(async move { sender.send("stuck").await });
    tokio::task::yield_now().await;

    service.disconnect().await;
    let result = timeout(Duration::from_secs(2), write)
        .await
        .expect("write did not give up")
        .unwrap();
    assert_eq!(result, Err(LinkError::NotConnected));
    assert!(fake.writes().is_empty());
}

#[tokio::test]
async fn test_reconnect_replaces_session() {
    let fake = FakeTransport::with_sample_device();
    let (service, mut events) = connected(&fake).await;

    service.start_capture();
    fake.notify("partial");
    wait_for(&mut events, |e| {
        matches!(e, AppEvent::Inbound(InboundEvent::CsvFragmentReceived { .. }))
    })
    .await;

    service.connect_index(0).await.unwrap();
    assert_eq!(fake.connects(), 2);
    assert_eq!(fake.disconnects(), 1);
    assert_eq!(service.transfer_mode(), TransferMode::Idle);
    assert_eq!(service.buffered_len(), 0);

    fake.notify("fresh");
    wait_for(&mut events, |e| {
        matches!(e, AppEvent::Inbound(InboundEvent::TextReceived(t)) if t == "fresh")
    })
    .await;
    assert_eq!(service.text_log(), "fresh");
}

#[tokio::test]
async fn test_upload_hands_csv_to_sink() {
    let fake = FakeTransport::with_sample_device();
    let (service, mut events) = connected(&fake).await;
    let sink = RecordingSink::default();

    assert!(matches!(
        service.upload_csv(&sink).await,
        Err(SinkError::Empty)
    ));

    service.start_capture();
    fake.notify("x,y\n1,2\n__CSV_END__");
    wait_for(&mut events, |e| {
        matches!(e, AppEvent::Inbound(InboundEvent::CsvComplete(_)))
    })
    .await;

    let table = service.upload_csv(&sink).await.unwrap();
    assert_eq!(table.columns, vec!["x", "y"]);
    assert_eq!(table.rows[0]["y"], "2");
    assert_eq!(*sink.received.lock().unwrap(), vec!["x,y\n1,2\n".to_string()]);
    assert!(!service.csv_ready());
}

#[tokio::test]
async fn test_rejected_upload_keeps_csv() {
    let fake = FakeTransport::with_sample_device();
    let (service, mut events) = connected(&fake).await;
    let sink = RecordingSink {
        reject: true,
        ..Default::default()
    };

    service.start_capture();
    fake.notify("x\n1\n__CSV_END__");
    wait_for(&mut events, |e| {
        matches!(e, AppEvent::Inbound(InboundEvent::CsvComplete(_)))
    })
    .await;

    assert!(service.upload_csv(&sink).await.is_err());
    assert!(service.csv_ready());
    assert_eq!(service.take_csv().as_deref(), Some("x\n1\n"));
}
