use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use murmur_net::wire::{Advertisement, Record};
use murmur_net::{
    Address, App, AppContext, AppMessage, Channel, DiscoveryKind, Identity, MemoryNetwork,
    MemoryStorage, NetworkError, PeerLookup, Result, Swarm, SwarmConfig, SwarmEvent,
};

// -- Helpers -------------------------------------------------------------

struct Recorder {
    name: &'static str,
    seen: mpsc::UnboundedSender<AppMessage>,
}

#[async_trait]
impl App for Recorder {
    fn name(&self) -> &str {
        self.name
    }

    async fn on_message(&self, message: AppMessage) -> Result<()> {
        let _ = self.seen.send(message);
        Ok(())
    }
}

/// An app that refuses to start.
struct Broken;

#[async_trait]
impl App for Broken {
    fn name(&self) -> &str {
        "broken"
    }

    async fn up(&self, _ctx: AppContext) -> Result<()> {
        Err(NetworkError::App("refusing to start".into()))
    }

    async fn on_message(&self, _message: AppMessage) -> Result<()> {
        Ok(())
    }
}

fn recorder(name: &'static str) -> (Recorder, mpsc::UnboundedReceiver<AppMessage>) {
    let (seen, rx) = mpsc::unbounded_channel();
    (Recorder { name, seen }, rx)
}

fn node(network: &MemoryNetwork, name: &str, boot: &[&str]) -> Swarm {
    let mut config = SwarmConfig::default();
    config.boot_peers = boot.iter().map(|url| url.to_string()).collect();
    config.handshake_timeout = Duration::from_secs(2);
    Swarm::new(config, Arc::new(MemoryStorage::new())).with_channel(network.channel(name))
}

async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for message")
        .expect("channel closed")
}

fn address_of(swarm: &Swarm) -> Address {
    swarm.address().expect("swarm is running")
}

// -- Connection ----------------------------------------------------------

#[tokio::test]
async fn test_boot_peers_connect_both_ways() {
    let network = MemoryNetwork::new();
    let b = node(&network, "b", &[]);
    b.start().await.unwrap();
    let a = node(&network, "a", &["mem://b"]);
    a.start().await.unwrap();

    wait_until("both sides to connect", || {
        a.peer_count() == 1 && b.peer_count() == 1
    })
    .await;

    assert_eq!(a.peers()[0].address(), b.address());
    assert_eq!(b.peers()[0].address(), a.address());
    assert_eq!(a.peers()[0].initiate(), Some(true));
    assert_eq!(b.peers()[0].initiate(), Some(false));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_connected_and_disconnected_events() {
    let network = MemoryNetwork::new();
    let b = node(&network, "b", &[]);
    b.start().await.unwrap();

    let a = node(&network, "a", &[]);
    let mut events = a.subscribe();
    a.start().await.unwrap();
    a.add("mem://b").await.unwrap();

    match tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        SwarmEvent::Connected(def) => assert_eq!(def.address, b.address()),
        other => panic!("expected Connected, got {other:?}"),
    }

    let b_address = address_of(&b);
    b.stop().await;

    match tokio::time::timeout(Duration::from_secs(5), events.recv())
        .await
        .unwrap()
        .unwrap()
    {
        SwarmEvent::Disconnected(address) => assert_eq!(address, b_address),
        other => panic!("expected Disconnected, got {other:?}"),
    }
    assert_eq!(a.peer_count(), 0);

    a.stop().await;
}

#[tokio::test]
async fn test_simultaneous_dials_settle_on_one_session() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a", &[]);
    let b = node(&network, "b", &[]);
    a.start().await.unwrap();
    b.start().await.unwrap();

    let _ = tokio::join!(a.add("mem://b"), b.add("mem://a"));

    let a_address = address_of(&a);
    let b_address = address_of(&b);
    let a_dials = a_address < b_address;
    wait_until("duplicate connections to settle", || {
        let a_side = a.get_peer(&b_address).filter(|p| p.connected());
        let b_side = b.get_peer(&a_address).filter(|p| p.connected());
        match (a_side, b_side) {
            (Some(a_side), Some(b_side)) => {
                a_side.initiate() == Some(a_dials) && b_side.initiate() == Some(!a_dials)
            }
            _ => false,
        }
    })
    .await;

    a.send(&b_address, "none", "ping", &serde_json::json!(1))
        .await
        .unwrap();
    b.send(&a_address, "none", "pong", &serde_json::json!(2))
        .await
        .unwrap();

    a.stop().await;
    b.stop().await;
}

// -- Messaging -----------------------------------------------------------

#[tokio::test]
async fn test_message_reaches_only_matching_app() {
    let network = MemoryNetwork::new();
    let (chat, mut chat_rx) = recorder("chat");
    let (files, mut files_rx) = recorder("files");
    let b = node(&network, "b", &[])
        .with_app(chat)
        .unwrap()
        .with_app(files)
        .unwrap();
    b.start().await.unwrap();
    let mut b_events = b.subscribe();

    let a = node(&network, "a", &["mem://b"]);
    a.start().await.unwrap();

    let payload = serde_json::json!({"text": "hello", "tags": ["x", "y"]});
    a.send(&address_of(&b), "chat", "say", &payload)
        .await
        .unwrap();

    let got = recv(&mut chat_rx).await;
    assert_eq!(got.address, address_of(&a));
    assert_eq!(got.command, "say");
    assert_eq!(got.payload, payload);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(chat_rx.try_recv().is_err(), "delivered more than once");
    assert!(files_rx.try_recv().is_err(), "wrong app received message");

    let event = loop {
        match tokio::time::timeout(Duration::from_secs(5), b_events.recv())
            .await
            .unwrap()
            .unwrap()
        {
            SwarmEvent::Message(message) => break message,
            _ => continue,
        }
    };
    assert_eq!(event.app, "chat");
    assert_eq!(event.payload, payload);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_broadcast_targets_peers_running_app() {
    let network = MemoryNetwork::new();
    let (chat_b, mut rx_b) = recorder("chat");
    let b = node(&network, "b", &[]).with_app(chat_b).unwrap();
    let c = node(&network, "c", &[]);
    b.start().await.unwrap();
    c.start().await.unwrap();

    let a = node(&network, "a", &["mem://b", "mem://c"]);
    a.start().await.unwrap();
    assert_eq!(a.peer_count(), 2);

    let sent = a
        .broadcast("chat", "announce", &serde_json::json!("hi all"))
        .await;
    assert_eq!(sent, 1);
    assert_eq!(recv(&mut rx_b).await.command, "announce");

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

// -- Failure modes -------------------------------------------------------

#[tokio::test]
async fn test_send_after_stop_fails_fast() {
    let network = MemoryNetwork::new();
    let b = node(&network, "b", &[]);
    b.start().await.unwrap();
    let a = node(&network, "a", &["mem://b"]);
    a.start().await.unwrap();
    let b_address = address_of(&b);

    a.stop().await;
    assert_eq!(a.peer_count(), 0);

    let result = tokio::time::timeout(
        Duration::from_secs(1),
        a.send(&b_address, "chat", "say", &serde_json::json!(null)),
    )
    .await
    .expect("send after stop hung");
    assert!(result.unwrap_err().is_not_connected());

    b.stop().await;
}

#[tokio::test]
async fn test_unknown_address_without_discovery() {
    let network = MemoryNetwork::new();
    let a = node(&network, "a", &[]);
    a.start().await.unwrap();

    let stranger = Identity::generate().address().clone();
    let result = tokio::time::timeout(
        Duration::from_secs(1),
        a.send(&stranger, "chat", "say", &serde_json::json!(1)),
    )
    .await
    .expect("send to unknown address hung");
    assert!(matches!(result, Err(NetworkError::PeerNotFound(_))));

    a.stop().await;
}

#[tokio::test]
async fn test_silent_remote_times_out() {
    let network = MemoryNetwork::new();
    let (tx, mut rx) = mpsc::channel(4);
    let silent = network.channel("silent");
    silent.up(tx).await.unwrap();
    let holder = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Some(incoming) = rx.recv().await {
            held.push(incoming);
        }
    });

    let mut config = SwarmConfig::default();
    config.handshake_timeout = Duration::from_millis(200);
    let a = Swarm::new(config, Arc::new(MemoryStorage::new())).with_channel(network.channel("a"));
    a.start().await.unwrap();

    let err = a.add("mem://silent").await.unwrap_err();
    assert!(matches!(err, NetworkError::Timeout(_)));
    assert_eq!(a.peer_count(), 0);

    a.stop().await;
    silent.down().await;
    holder.abort();
}

#[tokio::test]
async fn test_forged_handshake_is_rejected() {
    let network = MemoryNetwork::new();
    let (tx, mut rx) = mpsc::channel(4);
    let forger = network.channel("forger");
    forger.up(tx).await.unwrap();

    let attacker = Identity::generate();
    let victim = Identity::generate();
    let forged = Advertisement {
        address: victim.address().clone(),
        public_key: attacker.public_key(),
        urls: vec!["mem://forger".into()],
        apps: Vec::new(),
    };
    let line = Record::handshake(victim.address(), &forged)
        .unwrap()
        .encode()
        .unwrap();
    let responder = tokio::spawn(async move {
        let mut incoming = rx.recv().await.unwrap();
        incoming.stream.write_all(line.as_bytes()).await.unwrap();
        // Keep the stream open until the other side hangs up.
        let mut sink = Vec::new();
        let _ = tokio::io::AsyncReadExt::read_to_end(&mut incoming.stream, &mut sink).await;
    });

    let a = node(&network, "a", &[]);
    a.start().await.unwrap();
    let err = a.add("mem://forger").await.unwrap_err();
    assert!(matches!(err, NetworkError::Verification(_)));
    assert_eq!(a.peer_count(), 0);

    a.stop().await;
    let _ = tokio::time::timeout(Duration::from_secs(2), responder).await;
}

#[tokio::test]
async fn test_failing_app_does_not_stop_the_node() {
    let network = MemoryNetwork::new();
    let (chat, mut chat_rx) = recorder("chat");
    let b = node(&network, "b", &[])
        .with_app(Broken)
        .unwrap()
        .with_app(chat)
        .unwrap();
    b.start().await.unwrap();
    assert!(b.is_running());

    let a = node(&network, "a", &["mem://b"]);
    a.start().await.unwrap();
    wait_until("peers to connect", || {
        a.peer_count() == 1 && b.peer_count() == 1
    })
    .await;

    a.send(&address_of(&b), "chat", "say", &serde_json::json!("still here"))
        .await
        .unwrap();
    assert_eq!(recv(&mut chat_rx).await.payload, "still here");

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_channel_failing_to_come_up_does_not_stop_the_node() {
    let network = MemoryNetwork::new();
    let b = node(&network, "b", &[]);
    b.start().await.unwrap();

    // Same listening name as b, so this node's channel cannot come up.
    let twin = node(&network, "b", &["mem://b"]);
    twin.start().await.unwrap();
    assert!(twin.is_running());
    wait_until("outbound connection from twin", || {
        twin.peer_count() == 1 && b.peer_count() == 1
    })
    .await;

    twin.stop().await;
    assert!(network.is_listening("b"));
    wait_until("b to drop twin", || b.peer_count() == 0).await;
    b.stop().await;
}

// -- Peer lookup ---------------------------------------------------------

/// a -- b -- c, every node running peer-lookup.
async fn line_topology(network: &MemoryNetwork) -> (Swarm, PeerLookup, Swarm, Swarm) {
    let c = node(network, "c", &[]).with_app(PeerLookup::new()).unwrap();
    let (chat, _) = recorder("chat");
    let c = c.with_app(chat).unwrap();
    c.start().await.unwrap();

    let b = node(network, "b", &["mem://c"])
        .with_app(PeerLookup::new())
        .unwrap();
    b.start().await.unwrap();

    let lookup = PeerLookup::with_timeout(Duration::from_secs(2));
    let a = node(network, "a", &["mem://b"])
        .with_app(lookup.clone())
        .unwrap();
    a.start().await.unwrap();

    wait_until("line topology", || {
        a.peer_count() == 1 && b.peer_count() == 2 && c.peer_count() == 1
    })
    .await;
    (a, lookup, b, c)
}

#[tokio::test]
async fn test_lookup_resolves_two_hops_away() {
    let network = MemoryNetwork::new();
    let (chat_c, mut rx_c) = recorder("chat");
    let c = node(&network, "c", &[])
        .with_app(PeerLookup::new())
        .unwrap()
        .with_app(chat_c)
        .unwrap();
    c.start().await.unwrap();
    let b = node(&network, "b", &["mem://c"])
        .with_app(PeerLookup::new())
        .unwrap();
    b.start().await.unwrap();
    let a = node(&network, "a", &["mem://b"])
        .with_app(PeerLookup::with_timeout(Duration::from_secs(2)))
        .unwrap();
    a.start().await.unwrap();
    wait_until("line topology", || b.peer_count() == 2).await;

    let c_address = address_of(&c);
    assert!(a.get_peer(&c_address).is_none());

    a.send(&c_address, "chat", "hello", &serde_json::json!("from a"))
        .await
        .unwrap();

    let got = recv(&mut rx_c).await;
    assert_eq!(got.address, address_of(&a));
    assert_eq!(got.payload, serde_json::json!("from a"));
    assert!(a.get_peer(&c_address).is_some_and(|p| p.connected()));

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn test_concurrent_lookups_share_one_query() {
    let network = MemoryNetwork::new();
    let (a, lookup, b, c) = line_topology(&network).await;
    let c_address = address_of(&c);

    let (first, second) = tokio::join!(lookup.lookup(&c_address), lookup.lookup(&c_address));
    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.address, Some(c_address.clone()));
    assert_eq!(first, second);
    assert_eq!(lookup.queries_sent(), 1);

    // Served from cache afterwards.
    lookup.lookup(&c_address).await.unwrap();
    assert_eq!(lookup.queries_sent(), 1);

    a.stop().await;
    b.stop().await;
    c.stop().await;
}

#[tokio::test]
async fn test_lookup_of_unknown_address_gives_up() {
    let network = MemoryNetwork::new();
    let b = node(&network, "b", &[]).with_app(PeerLookup::new()).unwrap();
    b.start().await.unwrap();
    let a = node(&network, "a", &["mem://b"])
        .with_app(PeerLookup::with_timeout(Duration::from_millis(300)))
        .unwrap();
    a.start().await.unwrap();

    let stranger = Identity::generate().address().clone();
    let result = tokio::time::timeout(
        Duration::from_secs(3),
        a.send(&stranger, "chat", "say", &serde_json::json!(1)),
    )
    .await
    .expect("lookup did not time out");
    assert!(matches!(result, Err(NetworkError::PeerNotFound(_))));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_lookup_stops_with_swarm() {
    let network = MemoryNetwork::new();
    let lookup = PeerLookup::new();
    let a = node(&network, "a", &[]).with_app(lookup.clone()).unwrap();
    a.start().await.unwrap();
    assert!(a.discovery_kinds().contains(&DiscoveryKind::PeerLookup));

    a.stop().await;
    assert!(!a.discovery_kinds().contains(&DiscoveryKind::PeerLookup));
    let stranger = Identity::generate().address().clone();
    assert!(lookup.lookup(&stranger).await.unwrap_err().is_not_connected());
}

async fn lookup_pair(network: &MemoryNetwork) -> (Swarm, PeerLookup, Swarm) {
    let b = node(network, "b", &[]).with_app(PeerLookup::new()).unwrap();
    b.start().await.unwrap();
    let lookup = PeerLookup::with_timeout(Duration::from_millis(300));
    let a = node(network, "a", &["mem://b"])
        .with_app(lookup.clone())
        .unwrap();
    a.start().await.unwrap();
    wait_until("a and b to connect", || {
        a.peer_count() == 1 && b.peer_count() == 1
    })
    .await;
    (a, lookup, b)
}

#[tokio::test]
async fn test_cancelled_lookup_does_not_wedge_later_lookups() {
    let network = MemoryNetwork::new();
    let (a, lookup, b) = lookup_pair(&network).await;
    let stranger = Identity::generate().address().clone();

    let cancelled =
        tokio::time::timeout(Duration::from_millis(50), lookup.lookup(&stranger)).await;
    assert!(cancelled.is_err());

    // Joins the abandoned query and gives up at its deadline.
    let joined = tokio::time::timeout(Duration::from_secs(3), lookup.lookup(&stranger))
        .await
        .expect("joined lookup hung");
    assert!(matches!(joined, Err(NetworkError::Timeout(_))));
    assert_eq!(lookup.queries_sent(), 1);

    let retried = tokio::time::timeout(Duration::from_secs(3), lookup.lookup(&stranger))
        .await
        .expect("retried lookup hung");
    assert!(matches!(retried, Err(NetworkError::Timeout(_))));
    assert_eq!(lookup.queries_sent(), 2);

    let _ = tokio::time::timeout(
        Duration::from_millis(50),
        a.send(&stranger, "chat", "say", &serde_json::json!(1)),
    )
    .await;
    tokio::time::sleep(Duration::from_millis(400)).await;
    let sent = tokio::time::timeout(
        Duration::from_secs(3),
        a.send(&stranger, "chat", "say", &serde_json::json!(1)),
    )
    .await
    .expect("send after a cancelled send hung");
    assert!(matches!(sent, Err(NetworkError::PeerNotFound(_))));

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_query_from_departed_peer_is_not_chased() {
    let network = MemoryNetwork::new();
    let (a, lookup, b) = lookup_pair(&network).await;
    let departed = Identity::generate().address().clone();

    let query = AppMessage {
        address: departed,
        command: "q".into(),
        payload: serde_json::json!(address_of(&b)),
    };
    let answered = tokio::time::timeout(Duration::from_secs(1), lookup.on_message(query))
        .await
        .expect("answering a departed peer blocked the worker");
    answered.unwrap();
    assert_eq!(lookup.queries_sent(), 0);

    a.stop().await;
    b.stop().await;
}

#[tokio::test]
async fn test_unreachable_cached_peer_is_looked_up_again() {
    let network = MemoryNetwork::new();
    let (a, lookup, b, c) = line_topology(&network).await;
    let c_address = address_of(&c);
    lookup.lookup(&c_address).await.unwrap();
    assert_eq!(lookup.queries_sent(), 1);

    c.stop().await;
    wait_until("b to drop c", || b.peer_count() == 1).await;

    let sent = a
        .send(&c_address, "chat", "say", &serde_json::json!("anyone?"))
        .await;
    assert!(matches!(sent, Err(NetworkError::Dial(_))));

    let again = tokio::time::timeout(Duration::from_secs(4), lookup.lookup(&c_address))
        .await
        .expect("lookup hung");
    assert!(matches!(again, Err(NetworkError::Timeout(_))));
    assert_eq!(lookup.queries_sent(), 2);

    a.stop().await;
    b.stop().await;
}
