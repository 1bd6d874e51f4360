use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use chat_relay::{
    codec::{DEFAULT_MAX_FRAME_LEN, Frame, read_frame, write_frame},
    config::RelayConfig,
    protocol::{JOIN_CONFIRMATION, NAME_REQUEST},
    server::{Relay, RelayServer},
};
use tokio::{
    io::{AsyncWriteExt, BufReader},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::oneshot,
    task::JoinHandle,
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(2);

struct TestServer {
    addr: SocketAddr,
    relay: Arc<Relay>,
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

impl TestServer {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let server = RelayServer::new(listener, RelayConfig::default());
        let relay = server.relay();

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(async move {
            let _ = shutdown_rx.await;
        }));

        Ok(Self {
            addr,
            relay,
            shutdown,
            task,
        })
    }

    async fn stop(self) -> Result<()> {
        let _ = self.shutdown.send(());
        timeout(WAIT, self.task).await???;
        Ok(())
    }
}

struct Participant {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Participant {
    async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    /// Connects, completes the handshake and consumes the participant's own
    /// join notice, so later joins are observed in order.
    async fn join(addr: SocketAddr, name: &str) -> Result<Self> {
        let mut participant = Self::connect(addr).await?;
        assert_eq!(participant.next().await?.as_deref(), Some(NAME_REQUEST));
        participant.send(name).await?;
        assert_eq!(participant.next().await?.as_deref(), Some(JOIN_CONFIRMATION));
        assert_eq!(
            participant.next().await?,
            Some(format!("{name} has joined the chat!"))
        );
        Ok(participant)
    }

    async fn send(&mut self, text: &str) -> Result<()> {
        write_frame(&mut self.writer, &Frame::encode(text)?).await?;
        Ok(())
    }

    async fn next(&mut self) -> Result<Option<String>> {
        let payload = timeout(WAIT, read_frame(&mut self.reader, DEFAULT_MAX_FRAME_LEN)).await??;
        Ok(payload.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }
}

#[tokio::test]
async fn participants_see_joins_and_chat() -> Result<()> {
    let server = TestServer::start().await?;

    let mut a = Participant::join(server.addr, "A").await?;
    let mut b = Participant::join(server.addr, "B").await?;
    assert_eq!(a.next().await?.as_deref(), Some("B has joined the chat!"));

    a.send("hello").await?;

    assert_eq!(a.next().await?.as_deref(), Some("A: hello"));
    // B never saw A's earlier join notice; chat is the next thing it reads.
    assert_eq!(b.next().await?.as_deref(), Some("A: hello"));

    server.stop().await
}

#[tokio::test]
async fn messages_from_one_sender_stay_in_order() -> Result<()> {
    let server = TestServer::start().await?;
    let mut a = Participant::join(server.addr, "A").await?;
    let mut b = Participant::join(server.addr, "B").await?;
    assert_eq!(a.next().await?.as_deref(), Some("B has joined the chat!"));

    // Push everything in one write so the frames arrive coalesced.
    let mut burst = Vec::new();
    for i in 0..50 {
        burst.extend_from_slice(Frame::encode(format!("line {i}"))?.as_bytes());
    }
    a.writer.write_all(&burst).await?;

    for i in 0..50 {
        assert_eq!(b.next().await?, Some(format!("A: line {i}")));
    }

    server.stop().await
}

#[tokio::test]
async fn duplicate_nickname_is_rejected() -> Result<()> {
    let server = TestServer::start().await?;
    let _alice = Participant::join(server.addr, "alice").await?;

    let mut impostor = Participant::connect(server.addr).await?;
    assert_eq!(impostor.next().await?.as_deref(), Some(NAME_REQUEST));
    impostor.send("alice").await?;

    assert_eq!(
        impostor.next().await?.as_deref(),
        Some("Nickname 'alice' is already in use!")
    );
    assert_eq!(impostor.next().await?, None);
    assert_eq!(server.relay.registry().names(), vec!["alice".to_string()]);

    server.stop().await
}

#[tokio::test]
async fn abrupt_disconnect_is_announced() -> Result<()> {
    let server = TestServer::start().await?;
    let mut a = Participant::join(server.addr, "A").await?;
    let mut b = Participant::join(server.addr, "B").await?;
    assert_eq!(a.next().await?.as_deref(), Some("B has joined the chat!"));

    // Half a frame, then the connection disappears.
    a.writer.write_all(&[0, 0, 0, 9, b'h', b'a']).await?;
    drop(a);

    assert_eq!(b.next().await?.as_deref(), Some("A has left the chat!"));
    assert_eq!(server.relay.registry().names(), vec!["B".to_string()]);

    server.stop().await
}

#[tokio::test]
async fn whitespace_chat_is_never_relayed() -> Result<()> {
    let server = TestServer::start().await?;
    let mut a = Participant::join(server.addr, "A").await?;
    let mut b = Participant::join(server.addr, "B").await?;
    assert_eq!(a.next().await?.as_deref(), Some("B has joined the chat!"));

    a.send("").await?;
    a.send("   ").await?;
    a.send("\r\n").await?;
    a.send("after the blanks").await?;

    assert_eq!(b.next().await?.as_deref(), Some("A: after the blanks"));
    assert_eq!(a.next().await?.as_deref(), Some("A: after the blanks"));

    server.stop().await
}

#[tokio::test]
async fn shutdown_closes_every_connection() -> Result<()> {
    let server = TestServer::start().await?;
    let mut a = Participant::join(server.addr, "A").await?;
    let mut pending = Participant::connect(server.addr).await?;
    assert_eq!(pending.next().await?.as_deref(), Some(NAME_REQUEST));

    let relay = Arc::clone(&server.relay);
    server.stop().await?;

    assert!(relay.registry().is_empty());
    assert!(!matches!(a.next().await, Ok(Some(_))));
    assert!(!matches!(pending.next().await, Ok(Some(_))));
    Ok(())
}
