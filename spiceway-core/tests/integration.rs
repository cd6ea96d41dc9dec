//! Integration tests: full channel lifecycles against fake servers on
//! localhost, from link handshake through migration.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use rsa::pkcs8::EncodePublicKey;
use rsa::{Oaep, RsaPrivateKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;

use spiceway_core::codec::OutboundFrame;
use spiceway_core::header::{OLD_VERSION_MAJOR, VERSION_MAJOR};
use spiceway_core::message::{LinkErrorCode, client, server};
use spiceway_core::protocol::{MigrationDstInfo, SetAck, WireEncode};
use spiceway_core::{
    ChannelEvent, ChannelType, HeaderMode, IncomingMessage, LinkHeader, LinkMess, LinkReply,
    MessageCodec, MigrationState, OutgoingMessage, Session, SessionConfig, SessionEvent,
};

const TIMEOUT: Duration = Duration::from_secs(5);
const PASSWORD: &str = "s3cret";

// ── Fake server ──────────────────────────────────────────────────

type ServerConn = Framed<TcpStream, MessageCodec>;

/// A listener that speaks the server side of the link handshake with
/// ticket authentication and mini headers.
struct FakeServer {
    listener: TcpListener,
    key: RsaPrivateKey,
    /// Kind capability words sent in every link reply.
    kind_caps: Vec<u32>,
}

impl FakeServer {
    async fn bind() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        Self {
            listener,
            key,
            kind_caps: Vec::new(),
        }
    }

    fn port(&self) -> u16 {
        self.listener.local_addr().unwrap().port()
    }

    async fn accept_raw(&self) -> TcpStream {
        let (stream, _) = tokio::time::timeout(TIMEOUT, self.listener.accept())
            .await
            .expect("client never connected")
            .unwrap();
        stream
    }

    /// Read the client's link header and message.
    async fn read_link(stream: &mut TcpStream) -> (LinkHeader, LinkMess) {
        let mut raw = [0u8; LinkHeader::SIZE];
        stream.read_exact(&mut raw).await.unwrap();
        let header = LinkHeader::decode(&raw).unwrap();
        let mut body = vec![0u8; header.size as usize];
        stream.read_exact(&mut body).await.unwrap();
        (header, LinkMess::decode(&body).unwrap())
    }

    /// Accept one channel and complete its handshake.
    async fn accept(&self) -> (LinkHeader, LinkMess, ServerConn) {
        let mut stream = self.accept_raw().await;
        let (header, mess) = Self::read_link(&mut stream).await;
        let conn = self.finish_link(stream, header.major_version).await;
        (header, mess, conn)
    }

    async fn finish_link(&self, mut stream: TcpStream, major: u32) -> ServerConn {
        let der = self.key.to_public_key().to_public_key_der().unwrap();
        // PROTOCOL_AUTH_SELECTION | AUTH_SPICE | MINI_HEADER
        let reply = LinkReply {
            error: 0,
            pub_key: der.as_bytes().to_vec(),
            num_common_caps: 0,
            num_channel_caps: 0,
            caps_offset: 0,
        }
        .encode_with_caps(&[0b1011], &self.kind_caps);
        stream
            .write_all(&LinkHeader::new(major, reply.len() as u32).encode())
            .await
            .unwrap();
        stream.write_all(&reply).await.unwrap();

        let selector = stream.read_u32_le().await.unwrap();
        assert_eq!(selector, 1, "expected ticket authentication");
        let mut ticket = [0u8; 128];
        stream.read_exact(&mut ticket).await.unwrap();
        let plain = self
            .key
            .decrypt(Oaep::new::<sha1::Sha1>(), &ticket)
            .unwrap();
        assert_eq!(plain, format!("{PASSWORD}\0").as_bytes());
        stream.write_u32_le(0).await.unwrap();

        Framed::new(stream, MessageCodec::new(HeaderMode::Mini))
    }

    /// Accept one channel and turn its link down with `code`.
    async fn refuse(&self, code: LinkErrorCode) -> LinkMess {
        let mut stream = self.accept_raw().await;
        let (header, mess) = Self::read_link(&mut stream).await;
        let reply = LinkReply {
            error: code as u32,
            pub_key: Vec::new(),
            num_common_caps: 0,
            num_channel_caps: 0,
            caps_offset: 0,
        }
        .encode_with_caps(&[], &[]);
        stream
            .write_all(&LinkHeader::new(header.major_version, reply.len() as u32).encode())
            .await
            .unwrap();
        stream.write_all(&reply).await.unwrap();
        mess
    }
}

async fn send(conn: &mut ServerConn, ty: ChannelType, msg_type: u16, payload: &[u8]) {
    let message = Arc::new(OutgoingMessage::with_payload(ty, msg_type, payload));
    conn.send(OutboundFrame { serial: 0, message }).await.unwrap();
}

async fn recv(conn: &mut ServerConn) -> IncomingMessage {
    tokio::time::timeout(TIMEOUT, conn.next())
        .await
        .expect("client went quiet")
        .expect("client closed the connection")
        .unwrap()
}

fn encode(value: &impl WireEncode) -> Vec<u8> {
    let mut buf = BytesMut::new();
    value.encode(&mut buf);
    buf.to_vec()
}

fn init_payload(session_id: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    for v in [session_id, 1, 3, 2, 0, 0, 1000, 0] {
        buf.extend_from_slice(&v.to_le_bytes());
    }
    buf
}

fn session_for(port: u16) -> Session {
    Session::new(SessionConfig {
        host: "127.0.0.1".into(),
        port: Some(port),
        password: Some(PASSWORD.into()),
        ..Default::default()
    })
}

/// Next event matching `pred`, skipping others.
async fn wait_event(
    events: &mut broadcast::Receiver<SessionEvent>,
    pred: impl Fn(&SessionEvent) -> bool,
) -> SessionEvent {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event never arrived")
}

/// `true` if nothing matching `pred` arrives within `window`.
async fn quiet(
    events: &mut broadcast::Receiver<SessionEvent>,
    window: Duration,
    pred: impl Fn(&SessionEvent) -> bool,
) -> bool {
    tokio::time::timeout(window, async {
        loop {
            match events.recv().await {
                Ok(event) if pred(&event) => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => std::future::pending::<()>().await,
            }
        }
    })
    .await
    .is_err()
}

fn opened(ty: ChannelType) -> impl Fn(&SessionEvent) -> bool {
    move |event| {
        matches!(event, SessionEvent::Channel { id, event: ChannelEvent::Opened } if id.channel_type == ty)
    }
}

/// Link the main channel and let the server announce session `id`.
async fn linked_main(server: &FakeServer, session: &Session, id: u32) -> ServerConn {
    session.connect().unwrap();
    let (_, _, mut conn) = server.accept().await;
    send(&mut conn, ChannelType::Main, server::main::INIT, &init_payload(id)).await;
    assert_eq!(recv(&mut conn).await.msg_type(), client::main::ATTACH_CHANNELS);
    conn
}

// ── Handshake ────────────────────────────────────────────────────

#[tokio::test]
async fn main_channel_links_with_ticket() {
    let server = FakeServer::bind().await;
    let session = session_for(server.port());
    let mut events = session.subscribe();

    session.connect().unwrap();
    let (header, mess, mut conn) = server.accept().await;
    assert_eq!(header.major_version, VERSION_MAJOR);
    assert_eq!(mess.channel_type, ChannelType::Main as u8);
    assert_eq!(mess.connection_id, 0);

    wait_event(&mut events, opened(ChannelType::Main)).await;

    send(&mut conn, ChannelType::Main, server::main::INIT, &init_payload(42)).await;
    assert_eq!(recv(&mut conn).await.msg_type(), client::main::ATTACH_CHANNELS);
    assert_eq!(session.connection_id(), 42);
    assert_eq!(session.server_info().multi_media_time, 1000);

    assert!(
        quiet(&mut events, Duration::from_millis(300), opened(ChannelType::Main)).await,
        "main channel reported opened twice"
    );

    session.disconnect();
}

#[tokio::test]
async fn rejected_header_downgrades_once() {
    let server = FakeServer::bind().await;
    let session = session_for(server.port());
    let mut events = session.subscribe();
    session.connect().unwrap();

    let mut first = server.accept_raw().await;
    let (header, _) = FakeServer::read_link(&mut first).await;
    assert_eq!(header.major_version, VERSION_MAJOR);
    drop(first);

    let mut second = server.accept_raw().await;
    let (header, _) = FakeServer::read_link(&mut second).await;
    assert_eq!(header.major_version, OLD_VERSION_MAJOR);
    let _conn = server.finish_link(second, OLD_VERSION_MAJOR).await;

    wait_event(&mut events, opened(ChannelType::Main)).await;
    assert_eq!(session.protocol_major(), OLD_VERSION_MAJOR);
    session.disconnect();
}

// ── Base protocol ────────────────────────────────────────────────

#[tokio::test]
async fn ack_window_is_honoured() {
    let server = FakeServer::bind().await;
    let session = session_for(server.port());
    let mut conn = linked_main(&server, &session, 7).await;

    let set_ack = encode(&SetAck {
        generation: 9,
        window: 2,
    });
    send(&mut conn, ChannelType::Main, server::SET_ACK, &set_ack).await;
    let sync = recv(&mut conn).await;
    assert_eq!(sync.msg_type(), client::ACK_SYNC);
    assert_eq!(sync.data(), 9u32.to_le_bytes());

    let ping = [0u8; 12];
    send(&mut conn, ChannelType::Main, server::PING, &ping).await;
    send(&mut conn, ChannelType::Main, server::PING, &ping).await;
    let mut types = Vec::new();
    for _ in 0..3 {
        types.push(recv(&mut conn).await.msg_type());
    }
    types.sort();
    assert_eq!(types, vec![client::ACK, client::PONG, client::PONG]);

    session.disconnect();
}

#[tokio::test]
async fn advertised_channels_join_the_session() {
    let server = FakeServer::bind().await;
    let session = session_for(server.port());
    let mut main = linked_main(&server, &session, 77).await;

    let mut list = 2u32.to_le_bytes().to_vec();
    list.extend_from_slice(&[ChannelType::Display as u8, 0, 200, 0]);
    send(&mut main, ChannelType::Main, server::main::CHANNELS_LIST, &list).await;

    let (_, mess, _display) = server.accept().await;
    assert_eq!(mess.channel_type, ChannelType::Display as u8);
    assert_eq!(mess.connection_id, 77);
    assert!(session.lookup_channel(ChannelType::Display, 0).is_some());
    assert_eq!(session.channels().len(), 2);

    session.disconnect();
    assert!(session.channels().is_empty());
}

#[tokio::test]
async fn wait_for_channels_holds_back_main() {
    let server = FakeServer::bind().await;
    let session = session_for(server.port());
    let mut main = linked_main(&server, &session, 5).await;

    let mut list = 1u32.to_le_bytes().to_vec();
    list.extend_from_slice(&[ChannelType::Display as u8, 0]);
    send(&mut main, ChannelType::Main, server::main::CHANNELS_LIST, &list).await;
    let (_, _, mut display) = server.accept().await;

    // Wait until the display channel has seen serial 1, then ping.
    let mut wait = vec![1u8, ChannelType::Display as u8, 0];
    wait.extend_from_slice(&1u64.to_le_bytes());
    send(&mut main, ChannelType::Main, server::WAIT_FOR_CHANNELS, &wait).await;
    send(&mut main, ChannelType::Main, server::PING, &[0u8; 12]).await;

    let early = tokio::time::timeout(Duration::from_millis(200), main.next()).await;
    assert!(early.is_err(), "main answered before the barrier cleared");

    send(&mut display, ChannelType::Display, 150, b"frame").await;
    assert_eq!(recv(&mut main).await.msg_type(), client::PONG);

    session.disconnect();
}

// ── Migration ────────────────────────────────────────────────────

#[tokio::test]
async fn migration_connects_to_destination() {
    let source = FakeServer::bind().await;
    let mut destination = FakeServer::bind().await;
    destination.kind_caps = vec![0b1];
    let session = session_for(source.port());
    let mut main = linked_main(&source, &session, 11).await;

    let info = encode(&MigrationDstInfo {
        port: destination.port(),
        sport: 0,
        host: "127.0.0.1".into(),
        cert_subject: None,
    });
    send(&mut main, ChannelType::Main, server::main::MIGRATE_BEGIN, &info).await;

    let (_, mess, _shadow_main) = destination.accept().await;
    assert_eq!(mess.channel_type, ChannelType::Main as u8);
    assert_eq!(mess.connection_id, 11);

    assert_eq!(recv(&mut main).await.msg_type(), client::main::MIGRATE_CONNECTED);
    assert_eq!(session.migration_state(), MigrationState::Migrating);

    session.disconnect();
    assert_eq!(session.migration_state(), MigrationState::None);
}

#[tokio::test]
async fn unreachable_destination_reports_error() {
    let source = FakeServer::bind().await;
    let session = session_for(source.port());
    let mut main = linked_main(&source, &session, 12).await;
    let mut events = session.subscribe();

    let dead_port = {
        let spare = TcpListener::bind("127.0.0.1:0").await.unwrap();
        spare.local_addr().unwrap().port()
    };
    let info = encode(&MigrationDstInfo {
        port: dead_port,
        sport: 0,
        host: "127.0.0.1".into(),
        cert_subject: None,
    });
    send(&mut main, ChannelType::Main, server::main::MIGRATE_BEGIN, &info).await;

    assert_eq!(
        recv(&mut main).await.msg_type(),
        client::main::MIGRATE_CONNECT_ERROR
    );
    wait_event(&mut events, |e| {
        matches!(e, SessionEvent::MigrationState(MigrationState::None))
    })
    .await;
    assert_eq!(session.migration_state(), MigrationState::None);

    // The source connection keeps working.
    send(&mut main, ChannelType::Main, server::PING, &[0u8; 12]).await;
    assert_eq!(recv(&mut main).await.msg_type(), client::PONG);
    session.disconnect();
}

/// Link main and one display channel on `server`.
async fn linked_main_and_display(
    server: &FakeServer,
    session: &Session,
    id: u32,
) -> (ServerConn, ServerConn) {
    let mut main = linked_main(server, session, id).await;
    let mut list = 1u32.to_le_bytes().to_vec();
    list.extend_from_slice(&[ChannelType::Display as u8, 0]);
    send(&mut main, ChannelType::Main, server::main::CHANNELS_LIST, &list).await;
    let (_, mess, display) = server.accept().await;
    assert_eq!(mess.channel_type, ChannelType::Display as u8);
    (main, display)
}

fn destination_info(port: u16) -> Vec<u8> {
    encode(&MigrationDstInfo {
        port,
        sport: 0,
        host: "127.0.0.1".into(),
        cert_subject: None,
    })
}

#[tokio::test]
async fn semi_seamless_migration_moves_every_channel() {
    let mut source = FakeServer::bind().await;
    source.kind_caps = vec![0b1];
    let mut destination = FakeServer::bind().await;
    destination.kind_caps = vec![0b1];
    let session = session_for(source.port());
    let mut events = session.subscribe();
    let (mut main, _display) = linked_main_and_display(&source, &session, 21).await;
    wait_event(&mut events, opened(ChannelType::Display)).await;

    send(
        &mut main,
        ChannelType::Main,
        server::main::MIGRATE_BEGIN,
        &destination_info(destination.port()),
    )
    .await;
    let (_, mess, mut dst_main) = destination.accept().await;
    assert_eq!(mess.channel_type, ChannelType::Main as u8);
    assert_eq!(mess.connection_id, 21);
    let (_, mess, mut dst_display) = destination.accept().await;
    assert_eq!(mess.channel_type, ChannelType::Display as u8);
    assert_eq!(mess.connection_id, 21);

    assert_eq!(recv(&mut main).await.msg_type(), client::main::MIGRATE_CONNECTED);
    assert_eq!(session.migration_state(), MigrationState::Migrating);

    send(&mut main, ChannelType::Main, server::main::MIGRATE_END, &[]).await;
    assert_eq!(recv(&mut dst_main).await.msg_type(), client::main::MIGRATE_END);

    send(&mut dst_main, ChannelType::Main, server::main::INIT, &init_payload(21)).await;
    wait_event(&mut events, |e| {
        matches!(e, SessionEvent::MigrationState(MigrationState::None))
    })
    .await;

    send(&mut dst_display, ChannelType::Display, server::PING, &[0u8; 12]).await;
    assert_eq!(recv(&mut dst_display).await.msg_type(), client::PONG);
    assert_eq!(session.migration_state(), MigrationState::None);
    assert_eq!(session.channels().len(), 2);

    session.disconnect();
}

#[tokio::test]
async fn refused_destination_channel_fails_whole_migration() {
    let source = FakeServer::bind().await;
    let destination = FakeServer::bind().await;
    let session = session_for(source.port());
    let mut events = session.subscribe();
    let (mut main, mut display) = linked_main_and_display(&source, &session, 31).await;
    wait_event(&mut events, opened(ChannelType::Display)).await;

    send(
        &mut main,
        ChannelType::Main,
        server::main::MIGRATE_BEGIN,
        &destination_info(destination.port()),
    )
    .await;
    let (_, _, _dst_main) = destination.accept().await;
    let mess = destination.refuse(LinkErrorCode::PermissionDenied).await;
    assert_eq!(mess.channel_type, ChannelType::Display as u8);

    assert_eq!(
        recv(&mut main).await.msg_type(),
        client::main::MIGRATE_CONNECT_ERROR
    );
    let extra = tokio::time::timeout(Duration::from_millis(300), main.next()).await;
    assert!(extra.is_err(), "unexpected second migration reply");
    assert_eq!(session.migration_state(), MigrationState::None);

    send(&mut display, ChannelType::Display, server::PING, &[0u8; 12]).await;
    assert_eq!(recv(&mut display).await.msg_type(), client::PONG);
    assert_eq!(session.channels().len(), 2);

    session.disconnect();
}
