//! Wire-level scenarios against a live server over loopback.
//!
//! Peers here are bare sockets speaking records directly, so every byte the
//! server sends is observed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bulb_chat::reader::{FrameReader, ReadOutcome};
use bulb_chat::{IgnoreErrors, MemorySink, ProtocolVersion, Record, Server, ServerConfig, UserInfo};
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(200);
const V1: ProtocolVersion = ProtocolVersion::new(1, 0, 0);

async fn start() -> (Server, SocketAddr, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let config = ServerConfig {
        bind: "127.0.0.1".parse().unwrap(),
        port: 0,
        version: V1,
    };
    let server = Server::new(config, sink.clone(), Arc::new(IgnoreErrors));
    let listener = server.bind().await.unwrap();
    let addr = listener.local_addr().unwrap();
    let acceptor = server.clone();
    tokio::spawn(async move { acceptor.serve(listener).await });
    (server, addr, sink)
}

struct Peer {
    reader: FrameReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Peer {
    async fn connect(addr: SocketAddr) -> Self {
        let (reader, writer) = TcpStream::connect(addr).await.unwrap().into_split();
        Self {
            reader: FrameReader::new(reader),
            writer,
        }
    }

    async fn send(&mut self, record: &Record) {
        self.writer.write_all(&record.encode()).await.unwrap();
    }

    async fn hello(&mut self, name: &str, version: ProtocolVersion) {
        self.send(&Record::UserInfo(UserInfo::new(name, version))).await;
    }

    async fn next(&mut self) -> ReadOutcome {
        timeout(WAIT, self.reader.read_record())
            .await
            .expect("timed out waiting for the server")
            .unwrap()
    }

    async fn recv(&mut self) -> Record {
        match self.next().await {
            ReadOutcome::Record(record) => record,
            ReadOutcome::EndOfStream => panic!("server closed the connection"),
        }
    }

    async fn expect_closed(&mut self) {
        assert!(matches!(self.next().await, ReadOutcome::EndOfStream));
    }

    async fn expect_silence(&mut self) {
        assert!(timeout(QUIET, self.reader.read_record()).await.is_err());
    }
}

fn ack(name: &str) -> Record {
    Record::Connect { user: UserInfo::new(name, V1), validate_only: true }
}

fn sync(name: &str) -> Record {
    Record::Connect { user: UserInfo::new(name, V1), validate_only: false }
}

async fn join(addr: SocketAddr, name: &str) -> Peer {
    let mut peer = Peer::connect(addr).await;
    peer.hello(name, V1).await;
    assert_eq!(peer.recv().await, ack(name));
    peer
}

/// alice and bob, both validated, with the join chatter already read.
async fn pair(addr: SocketAddr) -> (Peer, Peer) {
    let mut alice = join(addr, "alice").await;
    let mut bob = join(addr, "bob").await;
    assert_eq!(bob.recv().await, sync("alice"));
    assert_eq!(alice.recv().await, Record::stdout("Client \"bob\" has connected\n"));
    assert_eq!(alice.recv().await, sync("bob"));
    (alice, bob)
}

#[tokio::test]
async fn lone_member_only_gets_the_acknowledgement() {
    let (server, addr, _) = start().await;
    let mut alice = join(addr, "alice").await;
    alice.expect_silence().await;
    assert_eq!(server.member_names().await, ["alice"]);
}

#[tokio::test]
async fn duplicate_name_is_refused_and_closed() {
    let (server, addr, _) = start().await;
    let mut alice = join(addr, "alice").await;

    let mut imposter = Peer::connect(addr).await;
    imposter.hello("alice", V1).await;
    assert_eq!(
        imposter.recv().await,
        Record::stdout("Sorry, another client is already connected with that name!\n")
    );
    imposter.expect_closed().await;

    alice.expect_silence().await;
    assert_eq!(server.member_names().await, ["alice"]);
}

#[tokio::test]
async fn version_mismatch_is_refused_and_closed() {
    let (server, addr, _) = start().await;
    let mut bob = Peer::connect(addr).await;
    bob.hello("bob", ProtocolVersion::new(2, 0, 0)).await;
    assert_eq!(
        bob.recv().await,
        Record::stdout("Your client version is 2.0.0, however the server expects a client version of 1.0.0!\n")
    );
    bob.expect_closed().await;
    assert!(server.member_names().await.is_empty());
}

#[tokio::test]
async fn empty_name_is_refused_and_closed() {
    let (_server, addr, _) = start().await;
    let mut anon = Peer::connect(addr).await;
    anon.hello("", V1).await;
    assert_eq!(anon.recv().await, Record::stdout("Your username cannot be empty!\n"));
    anon.expect_closed().await;
}

#[tokio::test]
async fn message_reaches_the_other_member_only() {
    let (_server, addr, sink) = start().await;
    let (mut alice, mut bob) = pair(addr).await;

    alice.send(&Record::message("hi")).await;
    assert_eq!(bob.recv().await, Record::stdout("alice: hi\n"));
    alice.expect_silence().await;
    assert!(sink.contains("alice: hi\n"));
}

#[tokio::test]
async fn closing_a_socket_announces_the_departure() {
    let (server, addr, _) = start().await;
    let (mut alice, bob) = pair(addr).await;

    drop(bob);
    assert_eq!(alice.recv().await, Record::disconnect("bob"));
    assert_eq!(server.member_names().await, ["alice"]);
}

#[tokio::test]
async fn disconnect_record_removes_the_named_member() {
    let (server, addr, _) = start().await;
    let (mut alice, mut bob) = pair(addr).await;

    alice.send(&Record::disconnect("bob")).await;
    assert_eq!(alice.recv().await, Record::disconnect("bob"));
    bob.expect_closed().await;
    assert_eq!(server.member_names().await, ["alice"]);
}

#[tokio::test]
async fn kick_closes_the_member_and_tells_the_rest() {
    let (server, addr, _) = start().await;
    let (mut alice, mut bob) = pair(addr).await;

    assert!(server.kick("alice").await);
    assert_eq!(bob.recv().await, Record::disconnect("alice"));
    alice.expect_closed().await;
    assert!(!server.kick("alice").await);
}

#[tokio::test]
async fn chatting_before_the_handshake_closes_the_connection() {
    let (_server, addr, _) = start().await;
    let (_alice, mut bob) = pair(addr).await;

    let mut rude = Peer::connect(addr).await;
    rude.send(&Record::message("hello?")).await;
    rude.expect_closed().await;
    bob.expect_silence().await;
}

#[tokio::test]
async fn unknown_kind_closes_only_the_sender() {
    let (server, addr, _) = start().await;
    let (mut alice, mut bob) = pair(addr).await;

    let mut noisy = Peer::connect(addr).await;
    let mut header = Vec::new();
    header.extend_from_slice(&99u32.to_le_bytes());
    header.extend_from_slice(&12u64.to_le_bytes());
    noisy.writer.write_all(&header).await.unwrap();
    noisy.expect_closed().await;

    bob.send(&Record::message("still here")).await;
    assert_eq!(alice.recv().await, Record::stdout("bob: still here\n"));
    assert_eq!(server.member_names().await, ["alice", "bob"]);
}

#[tokio::test]
async fn oversized_declaration_closes_the_connection() {
    let (_server, addr, _) = start().await;
    let mut alice = join(addr, "alice").await;

    let mut header = Vec::new();
    header.extend_from_slice(&1u32.to_le_bytes());
    header.extend_from_slice(&(1u64 << 40).to_le_bytes());
    alice.writer.write_all(&header).await.unwrap();
    alice.expect_closed().await;
}

#[tokio::test]
async fn disconnect_all_closes_everyone_silently() {
    let (server, addr, _) = start().await;
    let (mut alice, mut bob) = pair(addr).await;

    assert_eq!(server.disconnect_all().await, 2);
    alice.expect_closed().await;
    bob.expect_closed().await;
    assert!(server.member_names().await.is_empty());
}

#[tokio::test]
async fn third_member_learns_the_roster_in_join_order() {
    let (_server, addr, _) = start().await;
    let (mut alice, mut bob) = pair(addr).await;

    let mut carol = join(addr, "carol").await;
    assert_eq!(carol.recv().await, sync("alice"));
    assert_eq!(carol.recv().await, sync("bob"));
    for peer in [&mut alice, &mut bob] {
        assert_eq!(peer.recv().await, Record::stdout("Client \"carol\" has connected\n"));
        assert_eq!(peer.recv().await, sync("carol"));
    }
}
