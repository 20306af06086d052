//! End-to-end tests against a broker on an ephemeral localhost port.

use neuro_relay::config::RelayConfig;
use neuro_relay::core::types::{Role, SampleBatch};
use neuro_relay::devices::create_device;
use neuro_relay::{BrokerServer, Error, SourceClient, SubscriberClient};
use std::io::{BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn test_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.network.host = "127.0.0.1".to_string();
    config.network.port = 0;
    config.broker.local_device = false;
    config.client.fetch_timeout_ms = 5000;
    config.client.reply_timeout_ms = 5000;
    config
}

/// Broker running on its own thread, stopped on drop
struct TestBroker {
    addr: SocketAddr,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TestBroker {
    fn start(config: &RelayConfig) -> Self {
        let device = if config.broker.local_device {
            create_device(&config.device).unwrap()
        } else {
            None
        };
        let running = Arc::new(AtomicBool::new(true));
        let server = BrokerServer::bind(config, device, Arc::clone(&running)).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn(move || server.run().unwrap());
        Self {
            addr,
            running,
            handle: Some(handle),
        }
    }
}

impl Drop for TestBroker {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Speaks the line protocol by hand
struct RawClient {
    stream: TcpStream,
    reader: BufReader<TcpStream>,
}

impl RawClient {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self { stream, reader }
    }

    fn send(&mut self, line: &str) {
        self.stream
            .write_all(format!("{}\r\n", line).as_bytes())
            .unwrap();
    }

    fn read_line(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end_matches(['\r', '\n']).to_string()
    }

    fn request(&mut self, line: &str) -> String {
        self.send(line);
        self.read_line()
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}

#[test]
fn test_header_before_watch() {
    let broker = TestBroker::start(&test_config());

    let mut source = RawClient::connect(broker.addr);
    assert_eq!(source.request("eeg"), "200 OK");
    assert_eq!(source.request("setheader H"), "200 OK");

    let mut display = RawClient::connect(broker.addr);
    assert_eq!(display.request("display"), "200 OK");
    assert_eq!(display.request("getheader 0"), "200 OK");
    assert_eq!(display.read_line(), "H");

    let subscriber = SubscriberClient::connect(broker.addr, &test_config()).unwrap();
    assert_eq!(subscriber.sources(), vec![0]);
    assert_eq!(subscriber.source_info(0).unwrap().header, "H");
    assert_eq!(subscriber.header(0).unwrap(), "H");
    assert_eq!(subscriber.role().unwrap(), Role::Subscriber);
}

#[test]
fn test_watch_then_receive() {
    let broker = TestBroker::start(&test_config());

    let mut source = RawClient::connect(broker.addr);
    assert_eq!(source.request("eeg"), "200 OK");

    let subscriber = SubscriberClient::connect(broker.addr, &test_config()).unwrap();
    subscriber.watch(0).unwrap();
    assert!(subscriber.source_info(0).unwrap().watched);

    assert_eq!(source.request("! 0 1 10.5"), "200 OK");
    assert_eq!(source.request("! 1 1 11.0"), "200 OK");

    let block = subscriber.get_data(0, 2).unwrap();
    assert_eq!(block.source_id, 0);
    assert_eq!(block.sequences, vec![0, 1]);
    assert_eq!(block.channels, vec![vec![10.5, 11.0]]);
}

#[test]
fn test_watch_unknown_source() {
    let broker = TestBroker::start(&test_config());

    let mut display = RawClient::connect(broker.addr);
    assert_eq!(display.request("display"), "200 OK");
    assert_eq!(display.request("watch 99"), "400 BAD REQUEST");
    // Connection stays usable
    assert_eq!(display.request("role"), "Subscriber");

    let subscriber = SubscriberClient::connect(broker.addr, &test_config()).unwrap();
    assert!(matches!(subscriber.watch(99), Err(Error::UnknownClient(99))));
}

#[test]
fn test_sequence_gap_still_delivered() {
    let broker = TestBroker::start(&test_config());

    let mut source = RawClient::connect(broker.addr);
    assert_eq!(source.request("eeg"), "200 OK");

    let subscriber = SubscriberClient::connect(broker.addr, &test_config()).unwrap();
    subscriber.watch(0).unwrap();

    assert_eq!(source.request("! 3 1 1.0"), "200 OK");
    assert_eq!(source.request("! 5 1 1.0"), "200 OK");
    // Source worker survived the gap
    assert_eq!(source.request("role"), "Source");

    let block = subscriber.get_data(0, 2).unwrap();
    assert_eq!(block.sequences, vec![3, 5]);
}

#[test]
fn test_two_subscribers_same_order() {
    let broker = TestBroker::start(&test_config());

    let mut source = RawClient::connect(broker.addr);
    assert_eq!(source.request("eeg"), "200 OK");

    let first = SubscriberClient::connect(broker.addr, &test_config()).unwrap();
    let second = SubscriberClient::connect(broker.addr, &test_config()).unwrap();
    first.watch(0).unwrap();
    second.watch(0).unwrap();

    for seq in 0..20 {
        let line = format!("! {} 2 {} {}", seq, seq as f64, -(seq as f64));
        assert_eq!(source.request(&line), "200 OK");
    }

    let expected: Vec<u64> = (0..20).collect();
    for subscriber in [&first, &second] {
        let block = subscriber.get_data(0, 20).unwrap();
        assert_eq!(block.sequences, expected);
        assert_eq!(block.channel_count(), 2);
        assert_eq!(block.channels[1][7], -7.0);
    }
}

#[test]
fn test_status_lists_clients() {
    let broker = TestBroker::start(&test_config());

    let mut source = RawClient::connect(broker.addr);
    assert_eq!(source.request("eeg"), "200 OK");
    let mut first = RawClient::connect(broker.addr);
    assert_eq!(first.request("display"), "200 OK");
    let mut second = RawClient::connect(broker.addr);
    assert_eq!(second.request("display"), "200 OK");

    assert_eq!(first.request("status"), "200 OK");
    assert_eq!(first.read_line(), "3 clients connected");
    let mut entries: Vec<String> = (0..3).map(|_| first.read_line()).collect();
    entries.sort();
    assert_eq!(entries, vec!["0:Source", "1:Subscriber", "2:Subscriber"]);
}

#[test]
fn test_disconnected_source_is_reaped() {
    let broker = TestBroker::start(&test_config());

    let mut source = RawClient::connect(broker.addr);
    assert_eq!(source.request("eeg"), "200 OK");

    let subscriber = SubscriberClient::connect(broker.addr, &test_config()).unwrap();
    subscriber.watch(0).unwrap();
    drop(source);

    assert!(wait_until(|| {
        subscriber.refresh_status().unwrap();
        subscriber.sources().is_empty()
    }));
    assert!(matches!(subscriber.get_data(0, 1), Err(Error::UnknownClient(0))));
}

#[test]
fn test_channel_mismatch_drops_source() {
    let broker = TestBroker::start(&test_config());

    let mut source = RawClient::connect(broker.addr);
    assert_eq!(source.request("eeg"), "200 OK");

    let subscriber = SubscriberClient::connect(broker.addr, &test_config()).unwrap();
    subscriber.watch(0).unwrap();

    assert_eq!(source.request("! 0 2 1.0 2.0"), "200 OK");
    assert_eq!(source.request("! 1 3 1.0 2.0 3.0"), "400 BAD REQUEST");

    assert!(wait_until(|| {
        subscriber.refresh_status().unwrap();
        subscriber.sources().is_empty()
    }));
}

#[test]
fn test_source_client_streams() {
    let broker = TestBroker::start(&test_config());

    let mut source = SourceClient::connect(broker.addr, &test_config()).unwrap();
    source.send_header("two channel test").unwrap();

    let subscriber = SubscriberClient::connect(broker.addr, &test_config()).unwrap();
    assert_eq!(subscriber.header(0).unwrap(), "two channel test");
    subscriber.watch(0).unwrap();

    for seq in 0..5 {
        let batch = SampleBatch::new(seq, vec![seq as f64, 0.5]);
        source.send_batch(&batch).unwrap();
    }
    assert_eq!(source.sent(), 5);

    let block = subscriber.get_data(0, 5).unwrap();
    assert_eq!(block.sequences, vec![0, 1, 2, 3, 4]);
    assert_eq!(block.channels[0], vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    assert_eq!(block.channels[1], vec![0.5; 5]);

    assert!(matches!(
        source.send_batch(&SampleBatch::new(5, vec![1.0])),
        Err(Error::ChannelCountMismatch { .. })
    ));
    source.close();
}

#[test]
fn test_local_simulated_device() {
    let mut config = test_config();
    config.broker.local_device = true;
    config.device.sample_rate_hz = 1000.0;
    config.device.channels = 2;
    config.device.chunk_size = 10;
    config.device.random_seed = 3;
    config.device.header = "simulated test".to_string();
    let broker = TestBroker::start(&config);

    let subscriber = SubscriberClient::connect(broker.addr, &config).unwrap();
    assert_eq!(subscriber.sources(), vec![0]);
    assert_eq!(subscriber.source_info(0).unwrap().header, "simulated test");

    subscriber.watch(0).unwrap();
    let block = subscriber.get_data(0, 50).unwrap();
    assert!(block.len() >= 50);
    assert_eq!(block.channel_count(), 2);
    assert!(block.sequences.windows(2).all(|w| w[0] < w[1]));

    subscriber.unwatch(0).unwrap();
    assert!(!subscriber.source_info(0).unwrap().watched);
    subscriber.close();
}

#[test]
fn test_overlong_line_answered_once() {
    let broker = TestBroker::start(&test_config());

    let mut client = RawClient::connect(broker.addr);
    let mut payload = vec![b'x'; 70_000];
    payload.extend_from_slice(b"\r\nrole\r\n");
    client.stream.write_all(&payload).unwrap();

    assert_eq!(client.read_line(), "400 BAD REQUEST");
    assert_eq!(client.read_line(), "Unassigned");
    // Replies stay paired with requests
    assert_eq!(client.request("display"), "200 OK");
    assert_eq!(client.request("role"), "Subscriber");
}

#[test]
fn test_get_data_keeps_samples_when_broker_stops() {
    let broker = TestBroker::start(&test_config());

    let mut source = RawClient::connect(broker.addr);
    assert_eq!(source.request("eeg"), "200 OK");

    let subscriber = SubscriberClient::connect(broker.addr, &test_config()).unwrap();
    subscriber.watch(0).unwrap();
    assert_eq!(source.request("! 0 1 1.5"), "200 OK");

    let stopper = thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        drop(broker);
    });

    let block = subscriber.get_data(0, 10).unwrap();
    assert_eq!(block.sequences, vec![0]);
    assert_eq!(block.channels, vec![vec![1.5]]);
    stopper.join().unwrap();

    assert!(!subscriber.is_receiving());
    assert!(matches!(subscriber.get_data(0, 1), Err(Error::ReceiverStopped)));
}

#[test]
fn test_dead_watcher_does_not_stall_others() {
    let broker = TestBroker::start(&test_config());

    let mut source = RawClient::connect(broker.addr);
    assert_eq!(source.request("eeg"), "200 OK");

    let subscriber = SubscriberClient::connect(broker.addr, &test_config()).unwrap();
    subscriber.watch(0).unwrap();

    let mut doomed = RawClient::connect(broker.addr);
    assert_eq!(doomed.request("display"), "200 OK");
    assert_eq!(doomed.request("watch 0"), "200 OK");

    for seq in 0..5 {
        assert_eq!(source.request(&format!("! {} 1 {}", seq, seq)), "200 OK");
    }
    drop(doomed);
    for seq in 5..20 {
        assert_eq!(source.request(&format!("! {} 1 {}", seq, seq)), "200 OK");
    }

    let block = subscriber.get_data(0, 20).unwrap();
    assert_eq!(block.sequences, (0..20).collect::<Vec<u64>>());

    assert!(wait_until(|| {
        let entries = subscriber.refresh_status().unwrap();
        entries.len() == 2 && entries.iter().all(|(id, _)| *id != 2)
    }));
    assert!(subscriber.is_receiving());
}
