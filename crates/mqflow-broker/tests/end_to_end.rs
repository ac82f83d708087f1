//! Broker and client talking over in-memory transports.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use mqflow_broker::{serve_connection, Broker, Config, MemorySessionStore, Server, SessionStore};
use mqflow_client::{
    connect_tcp, AsyncClient, ClientConfig, Error, Event, Publish, QoS, SubscribeReturnCode, Will,
};
use mqflow_core::{decode_packet, ConnackCode, Connect, Packet, Subscribe};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

fn broker(config: Config) -> Arc<Broker> {
    Arc::new(Broker::new(config))
}

/// Spawn a broker connection task and return the client end of the pipe
/// with the task, which yields what closed the connection.
fn attach(broker: &Arc<Broker>, name: &str) -> (DuplexStream, JoinHandle<Option<Error>>) {
    let (client_io, broker_io) = tokio::io::duplex(64 * 1024);
    let task = tokio::spawn(serve_connection(
        Arc::downgrade(broker),
        broker_io,
        format!("pipe:{}", name),
    ));
    (client_io, task)
}

struct TestClient {
    client: AsyncClient,
    events: mpsc::UnboundedReceiver<Event>,
    task: JoinHandle<mqflow_client::Result<()>>,
    server: JoinHandle<Option<Error>>,
}

impl TestClient {
    fn start(broker: &Arc<Broker>, config: ClientConfig) -> Self {
        let (io, server) = attach(broker, &config.client_id);
        let (client, mut eventloop) = AsyncClient::new(config, io);
        let (tx, events) = mpsc::unbounded_channel();
        let task = tokio::spawn(async move {
            loop {
                let event = eventloop.poll().await?;
                let done = event == Event::Disconnected;
                let _ = tx.send(event);
                if done {
                    return Ok(());
                }
            }
        });
        Self {
            client,
            events,
            task,
            server,
        }
    }

    fn named(broker: &Arc<Broker>, client_id: &str) -> Self {
        Self::start(broker, ClientConfig::new("pipe").client_id(client_id))
    }

    async fn next_event(&mut self) -> Event {
        timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event loop ended")
    }

    async fn connected(&mut self) -> bool {
        match self.next_event().await {
            Event::Connected { session_present } => session_present,
            other => panic!("expected Connected, got {:?}", other),
        }
    }

    async fn next_message(&mut self) -> Publish {
        loop {
            if let Event::Message(publish) = self.next_event().await {
                return publish;
            }
        }
    }

    /// No message arrives within `quiet`.
    async fn assert_no_message(&mut self, quiet: Duration) {
        let deadline = tokio::time::Instant::now() + quiet;
        while let Ok(Some(event)) = tokio::time::timeout_at(deadline, self.events.recv()).await {
            if let Event::Message(publish) = event {
                panic!("unexpected message {:?}", publish);
            }
        }
    }
}

/// Scripted client speaking raw packets.
struct RawClient {
    io: DuplexStream,
    buf: Vec<u8>,
    server: JoinHandle<Option<Error>>,
}

impl RawClient {
    fn attach(broker: &Arc<Broker>, name: &str) -> Self {
        let (io, server) = attach(broker, name);
        Self {
            io,
            buf: Vec::new(),
            server,
        }
    }

    async fn send(&mut self, packet: Packet) {
        self.io.write_all(&packet.to_bytes().unwrap()).await.unwrap();
    }

    async fn recv(&mut self) -> Packet {
        self.recv_within(WAIT).await.expect("timed out waiting for packet")
    }

    async fn recv_within(&mut self, limit: Duration) -> Option<Packet> {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            if let Some((packet, n)) = decode_packet(&self.buf, 0).unwrap() {
                self.buf.drain(..n);
                return Some(packet);
            }
            let mut chunk = [0u8; 1024];
            let n = match tokio::time::timeout_at(deadline, self.io.read(&mut chunk)).await {
                Ok(read) => read.unwrap(),
                Err(_) => return None,
            };
            assert!(n > 0, "broker closed the pipe");
            self.buf.extend_from_slice(&chunk[..n]);
        }
    }

    async fn connect(&mut self, client_id: &str, clean_session: bool) -> bool {
        self.send(Packet::Connect(Connect::new(client_id, 60, clean_session)))
            .await;
        match self.recv().await {
            Packet::Connack(connack) => {
                assert_eq!(connack.code, ConnackCode::Accepted);
                connack.session_present
            }
            other => panic!("expected CONNACK, got {:?}", other),
        }
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) {
        self.send(Packet::Subscribe(Subscribe {
            packet_id: 1,
            filters: vec![(filter.to_string(), qos)],
        }))
        .await;
        match self.recv().await {
            Packet::Suback(suback) => {
                assert_eq!(suback.return_codes, vec![SubscribeReturnCode::Granted(qos)])
            }
            other => panic!("expected SUBACK, got {:?}", other),
        }
    }

    async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            other => panic!("expected PUBLISH, got {:?}", other),
        }
    }
}

async fn wait_until(mut check: impl FnMut() -> bool) {
    timeout(WAIT, async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached");
}

#[tokio::test]
async fn test_qos1_publish_reaches_wildcard_subscriber_once() {
    let store = Arc::new(MemorySessionStore::new());
    let broker = Arc::new(Broker::with_store(Config::default(), store.clone()));
    let mut a = TestClient::start(
        &broker,
        ClientConfig::new("pipe").client_id("a").clean_session(false),
    );
    let mut b = TestClient::named(&broker, "b");

    let codes = a
        .client
        .subscribe_wait(&[("t/#", QoS::AtLeastOnce)])
        .await
        .unwrap();
    assert_eq!(codes, vec![SubscribeReturnCode::Granted(QoS::AtLeastOnce)]);

    b.client
        .publish_wait("t/x", "hi", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let message = a.next_message().await;
    assert_eq!(message.topic, "t/x");
    assert_eq!(message.payload, Bytes::from_static(b"hi"));
    assert_eq!(message.qos, QoS::AtLeastOnce);
    assert!(!message.retain);
    a.assert_no_message(Duration::from_millis(200)).await;
    assert!(!b.connected().await);

    // A's PUBACK completed the broker's delivery to A: the session it
    // leaves behind has nothing in flight
    a.client.disconnect().await.unwrap();
    wait_until(|| store.len() == 1).await;
    let record = store.resolve("a", false).into_record();
    assert!(record.inflight.is_empty());
    assert!(record.queued.is_empty());
}

#[tokio::test]
async fn test_qos2_end_to_end() {
    let broker = broker(Config::default());
    let mut a = TestClient::named(&broker, "a2");
    let b = TestClient::named(&broker, "b2");

    a.client
        .subscribe_wait(&[("exact/+", QoS::ExactlyOnce)])
        .await
        .unwrap();
    b.client
        .publish_wait("exact/1", "once", QoS::ExactlyOnce, false)
        .await
        .unwrap();

    let message = a.next_message().await;
    assert_eq!(message.qos, QoS::ExactlyOnce);
    assert_eq!(message.payload, Bytes::from_static(b"once"));
    a.assert_no_message(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_retained_message_delivered_on_subscribe() {
    let broker = broker(Config::default());
    let publisher = TestClient::named(&broker, "pub");
    publisher
        .client
        .publish_wait("r/1", "kept", QoS::AtLeastOnce, true)
        .await
        .unwrap();
    assert_eq!(broker.retained_count(), 1);

    let mut late = TestClient::named(&broker, "late");
    late.client
        .subscribe_wait(&[("r/#", QoS::AtMostOnce)])
        .await
        .unwrap();
    let message = late.next_message().await;
    assert_eq!(message.topic, "r/1");
    assert!(message.retain);
    assert_eq!(message.qos, QoS::AtMostOnce);

    // An empty retained payload clears the topic
    publisher
        .client
        .publish_wait("r/1", Bytes::new(), QoS::AtLeastOnce, true)
        .await
        .unwrap();
    assert_eq!(broker.retained_count(), 0);
}

#[tokio::test]
async fn test_persistent_session_receives_offline_messages() {
    let broker = broker(Config::default());
    let persistent = ClientConfig::new("pipe")
        .client_id("p")
        .clean_session(false);

    let mut first = TestClient::start(&broker, persistent.clone());
    assert!(!first.connected().await);
    first
        .client
        .subscribe_wait(&[("q", QoS::AtLeastOnce)])
        .await
        .unwrap();
    first.client.disconnect().await.unwrap();
    {
        let broker = Arc::clone(&broker);
        wait_until(move || broker.session_count() == 1 && broker.connection_count() == 0).await;
    }

    let publisher = TestClient::named(&broker, "pub");
    publisher
        .client
        .publish_wait("q", "while away", QoS::AtLeastOnce, false)
        .await
        .unwrap();
    publisher
        .client
        .publish_wait("q", "dropped", QoS::AtMostOnce, false)
        .await
        .unwrap();

    let mut second = TestClient::start(&broker, persistent);
    assert!(second.connected().await);
    let message = second.next_message().await;
    assert_eq!(message.payload, Bytes::from_static(b"while away"));
    second.assert_no_message(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_reattached_session_resends_unacknowledged_in_order() {
    let broker = broker(Config::default());
    let mut raw = RawClient::attach(&broker, "r");
    assert!(!raw.connect("r", false).await);
    raw.subscribe("r/t", QoS::AtLeastOnce).await;

    let publisher = TestClient::named(&broker, "pub");
    for payload in ["m1", "m2"] {
        publisher
            .client
            .publish_wait("r/t", payload, QoS::AtLeastOnce, false)
            .await
            .unwrap();
    }
    let first = raw.recv_publish().await;
    let second = raw.recv_publish().await;
    assert!(!first.dup);
    drop(raw);

    {
        let broker = Arc::clone(&broker);
        wait_until(move || broker.session_count() == 1).await;
    }

    let mut raw = RawClient::attach(&broker, "r-again");
    assert!(raw.connect("r", false).await);
    let resent = [raw.recv_publish().await, raw.recv_publish().await];
    assert!(resent.iter().all(|p| p.dup));
    assert_eq!(resent[0].packet_id, first.packet_id);
    assert_eq!(resent[0].payload, Bytes::from_static(b"m1"));
    assert_eq!(resent[1].packet_id, second.packet_id);
    assert_eq!(resent[1].payload, Bytes::from_static(b"m2"));
}

#[tokio::test]
async fn test_inflight_window_holds_extra_messages() {
    let mut config = Config::default();
    config.limits.max_inflight = 1;
    let broker = broker(config);

    let mut raw = RawClient::attach(&broker, "slow");
    raw.connect("slow", true).await;
    raw.subscribe("o", QoS::AtLeastOnce).await;

    let publisher = TestClient::named(&broker, "pub");
    for payload in ["1", "2", "3"] {
        publisher
            .client
            .publish_wait("o", payload, QoS::AtLeastOnce, false)
            .await
            .unwrap();
    }

    for expected in ["1", "2", "3"] {
        let publish = raw.recv_publish().await;
        assert_eq!(publish.payload, Bytes::copy_from_slice(expected.as_bytes()));
        assert!(raw.recv_within(Duration::from_millis(100)).await.is_none());
        raw.send(Packet::Puback {
            packet_id: publish.packet_id.unwrap(),
        })
        .await;
    }
}

#[tokio::test]
async fn test_takeover_closes_previous_connection() {
    let broker = broker(Config::default());
    let mut old = TestClient::named(&broker, "dup");
    assert!(!old.connected().await);
    old.client
        .subscribe_wait(&[("d", QoS::AtMostOnce)])
        .await
        .unwrap();

    let mut new = TestClient::named(&broker, "dup");
    assert!(!new.connected().await);

    let result = timeout(WAIT, old.task).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::TransportFailure(_))));
    let cause = timeout(WAIT, old.server).await.unwrap().unwrap();
    assert!(matches!(cause, Some(Error::DuplicateSession(ref id)) if id == "dup"));
    assert_eq!(broker.connection_count(), 1);

    // The clean session of the new connection starts without subscriptions
    assert!(broker.subscriptions_of("dup").is_empty());
    new.client
        .subscribe_wait(&[("d", QoS::AtMostOnce)])
        .await
        .unwrap();
    new.client
        .publish("d", "to self", QoS::AtMostOnce, false)
        .await
        .unwrap();
    assert_eq!(new.next_message().await.payload, Bytes::from_static(b"to self"));
}

#[tokio::test(start_paused = true)]
async fn test_takeover_closes_connection_stuck_on_write() {
    let broker = broker(Config::default());
    let mut old = RawClient::attach(&broker, "old");
    assert!(!old.connect("stuck", false).await);
    old.subscribe("flood", QoS::AtMostOnce).await;

    // The old peer stops reading until the broker's writes block
    let payload = Bytes::from(vec![0u8; 16 * 1024]);
    for _ in 0..16 {
        broker.publish(
            Publish::new("flood", payload.clone(), QoS::AtMostOnce, false),
            "test",
        );
    }

    let mut new = RawClient::attach(&broker, "new");
    new.send(Packet::Connect(Connect::new("stuck", 60, false)))
        .await;
    match new.recv_within(Duration::from_secs(60)).await {
        Some(Packet::Connack(connack)) => {
            assert_eq!(connack.code, ConnackCode::Accepted);
            assert!(connack.session_present);
        }
        other => panic!("expected CONNACK, got {:?}", other),
    }

    let cause = timeout(WAIT, &mut old.server).await.unwrap().unwrap();
    assert!(matches!(cause, Some(Error::DuplicateSession(ref id)) if id == "stuck"));
    assert_eq!(broker.connection_count(), 1);
    assert_eq!(
        broker.subscriptions_of("stuck"),
        vec![("flood".to_string(), QoS::AtMostOnce)]
    );
}

#[tokio::test]
async fn test_will_published_on_abnormal_close_only() {
    let broker = broker(Config::default());
    let mut watcher = TestClient::named(&broker, "watcher");
    watcher
        .client
        .subscribe_wait(&[("status/#", QoS::AtMostOnce)])
        .await
        .unwrap();

    let will = Will {
        topic: "status/dev".into(),
        message: Bytes::from_static(b"offline"),
        qos: QoS::AtMostOnce,
        retain: false,
    };

    let mut polite = TestClient::start(
        &broker,
        ClientConfig::new("pipe").client_id("polite").will(will.clone()),
    );
    polite.connected().await;
    polite.client.disconnect().await.unwrap();

    let mut dev = TestClient::start(&broker, ClientConfig::new("pipe").client_id("dev").will(will));
    dev.connected().await;
    dev.client.close().await;

    let message = watcher.next_message().await;
    assert_eq!(message.topic, "status/dev");
    assert_eq!(message.payload, Bytes::from_static(b"offline"));
    watcher.assert_no_message(Duration::from_millis(200)).await;
}

#[tokio::test]
async fn test_empty_client_id_needs_clean_session() {
    let broker = broker(Config::default());
    let refused = TestClient::start(
        &broker,
        ClientConfig::new("pipe").client_id("").clean_session(false),
    );
    let result = timeout(WAIT, refused.task).await.unwrap().unwrap();
    assert!(matches!(
        result,
        Err(Error::ConnectionRefused(ConnackCode::IdentifierRejected))
    ));

    let mut assigned = TestClient::start(&broker, ClientConfig::new("pipe").client_id(""));
    assert!(!assigned.connected().await);
}

#[tokio::test]
async fn test_tcp_server_round_trip() {
    let mut config = Config::default();
    config.server.bind = "127.0.0.1:0".parse().unwrap();
    let server = Server::bind(config).await.unwrap();
    let addr = server.local_addr().unwrap();
    tokio::spawn(server.run());

    let (client, mut eventloop) = connect_tcp(ClientConfig::new(addr.to_string()).client_id("tcp"))
        .await
        .unwrap();
    let (tx, mut events) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        while let Ok(event) = eventloop.poll().await {
            let _ = tx.send(event);
        }
    });

    client
        .subscribe_wait(&[("echo", QoS::AtLeastOnce)])
        .await
        .unwrap();
    client
        .publish_wait("echo", "ping", QoS::AtLeastOnce, false)
        .await
        .unwrap();

    let message = timeout(WAIT, async {
        loop {
            match events.recv().await {
                Some(Event::Message(publish)) => return publish,
                Some(_) => {}
                None => panic!("event loop ended"),
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(message.payload, Bytes::from_static(b"ping"));
}
