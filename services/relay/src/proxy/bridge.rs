//! Per-connection relay state machine.
//!
//! A bridge owns the client-facing (downstream) and server-facing (upstream)
//! sockets of one session and moves through four states:
//!
//! ```text
//! Connecting --connect ok--> Active --first fault/EOF--> Closing --both closed--> Closed
//!     |                                                                             ^
//!     +----------------------------- connect failed -------------------------------+
//! ```
//!
//! While `Active`, one sequential routine per direction runs
//! read -> write -> read, so each direction has exactly one buffer in flight.
//! A slow destination therefore delays the next read on its source, which is
//! the only backpressure mechanism.
//!
//! The first fault or EOF on either leg closes *both* sockets. There is no
//! half-open state and no retry.

use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::rc::Rc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, warn};

use super::drained;
use crate::diagnostics::{Direction, SessionId, SessionTap, TransferOp};
use crate::error::RelayError;

/// Default per-direction relay buffer size (8 KiB).
pub const DEFAULT_BUFFER_SIZE: usize = 8192;

/// Session lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BridgeState {
    /// Connecting to the upstream server.
    #[default]
    Connecting,
    /// Both sockets connected, both relay routines running.
    Active,
    /// A leg faulted; both sockets are being closed.
    Closing,
    /// Both sockets closed.
    Closed,
}

impl BridgeState {
    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: BridgeState) -> bool {
        matches!(
            (self, next),
            (BridgeState::Connecting, BridgeState::Active)
                | (BridgeState::Connecting, BridgeState::Closed)
                | (BridgeState::Active, BridgeState::Closing)
                | (BridgeState::Closing, BridgeState::Closed)
        )
    }
}

/// One side of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Leg {
    /// Client-facing socket.
    Downstream,
    /// Server-facing socket.
    Upstream,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Leg::Downstream => f.write_str("downstream"),
            Leg::Upstream => f.write_str("upstream"),
        }
    }
}

/// Source and destination legs of a transfer direction.
fn legs(direction: Direction) -> (Leg, Leg) {
    match direction {
        Direction::Upstream => (Leg::Downstream, Leg::Upstream),
        Direction::Downstream => (Leg::Upstream, Leg::Downstream),
    }
}

/// Why a session left `Active` (or never reached it).
#[derive(Debug)]
pub enum TeardownCause {
    /// The peer on this leg shut down its sending side.
    PeerClosed(Leg),
    /// A connect, read or write failed.
    Fault(RelayError),
    /// The owning worker is draining.
    Drain,
}

impl fmt::Display for TeardownCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TeardownCause::PeerClosed(leg) => write!(f, "{} peer closed", leg),
            TeardownCause::Fault(err) => write!(f, "{}", err),
            TeardownCause::Drain => f.write_str("worker drain"),
        }
    }
}

/// Current state of a session, shared with the owning worker's registry.
///
/// Not `Send`: a session never leaves the worker thread that created it.
#[derive(Debug, Clone, Default)]
pub struct StateCell(Rc<Cell<BridgeState>>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Read the current state.
    pub fn get(&self) -> BridgeState {
        self.0.get()
    }

    fn set(&self, state: BridgeState) {
        self.0.set(state);
    }
}

/// Outcome of a finished session.
#[derive(Debug)]
pub struct BridgeSummary {
    /// Session handle.
    pub session: SessionId,
    /// State at the end of the run (always `Closed`).
    pub final_state: BridgeState,
    /// Whether the session ever reached `Active`.
    pub reached_active: bool,
    /// Bytes written to the upstream server.
    pub bytes_up: u64,
    /// Bytes written to the client.
    pub bytes_down: u64,
    /// First recorded teardown cause.
    pub cause: Option<TeardownCause>,
}

/// A socket with idempotent close.
struct Socket<S> {
    leg: Leg,
    stream: Option<S>,
}

impl<S: AsyncWrite + Unpin> Socket<S> {
    fn open(leg: Leg, stream: S) -> Self {
        Self {
            leg,
            stream: Some(stream),
        }
    }

    fn closed(leg: Leg) -> Self {
        Self { leg, stream: None }
    }

    #[cfg(test)]
    fn is_open(&self) -> bool {
        self.stream.is_some()
    }

    /// Close the socket. Returns false if it was already closed.
    async fn close(&mut self) -> bool {
        let Some(mut stream) = self.stream.take() else {
            return false;
        };
        if let Err(e) = stream.shutdown().await {
            debug!(leg = %self.leg, error = %e, "Shutdown before close failed");
        }
        true
    }
}

/// Per-connection relay between a client socket and the upstream server.
pub struct Bridge<D, U = TcpStream> {
    id: SessionId,
    downstream: Socket<D>,
    upstream: Socket<U>,
    /// Client -> upstream buffer.
    upstream_buf: Vec<u8>,
    /// Upstream -> client buffer.
    downstream_buf: Vec<u8>,
    bytes_up: u64,
    bytes_down: u64,
    reached_active: bool,
    state: StateCell,
    cause: Option<TeardownCause>,
    tap: SessionTap,
}

impl<D, U> Bridge<D, U>
where
    D: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a bridge for an accepted client connection.
    pub fn new(id: SessionId, downstream: D, buffer_size: usize, tap: SessionTap) -> Self {
        Self {
            id,
            downstream: Socket::open(Leg::Downstream, downstream),
            upstream: Socket::closed(Leg::Upstream),
            upstream_buf: vec![0u8; buffer_size],
            downstream_buf: vec![0u8; buffer_size],
            bytes_up: 0,
            bytes_down: 0,
            reached_active: false,
            state: StateCell::new(),
            cause: None,
            tap,
        }
    }

    /// Session handle.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Current state.
    pub fn state(&self) -> BridgeState {
        self.state.get()
    }

    /// Shared view of the state for the worker registry.
    pub fn state_cell(&self) -> StateCell {
        self.state.clone()
    }

    /// Relay over an already connected upstream socket until either leg
    /// faults or the worker drains, then close both legs.
    pub async fn relay(mut self, upstream: U, mut drain: watch::Receiver<bool>) -> BridgeSummary {
        self.upstream = Socket::open(Leg::Upstream, upstream);
        if !self.transition(BridgeState::Active) {
            self.upstream.close().await;
            self.downstream.close().await;
            self.force_closed();
            return self.summary();
        }
        self.reached_active = true;

        let cause = match (self.downstream.stream.as_mut(), self.upstream.stream.as_mut()) {
            (Some(down), Some(up)) => {
                let (mut down_rd, mut down_wr) = tokio::io::split(down);
                let (mut up_rd, mut up_wr) = tokio::io::split(up);

                let to_upstream = pump(
                    Direction::Upstream,
                    &mut down_rd,
                    &mut up_wr,
                    &mut self.upstream_buf,
                    &mut self.bytes_up,
                    &self.tap,
                );
                let to_downstream = pump(
                    Direction::Downstream,
                    &mut up_rd,
                    &mut down_wr,
                    &mut self.downstream_buf,
                    &mut self.bytes_down,
                    &self.tap,
                );

                // The losing routine is dropped here, so no operation is
                // pending once teardown starts.
                tokio::select! {
                    cause = to_upstream => cause,
                    cause = to_downstream => cause,
                    _ = drained(&mut drain) => TeardownCause::Drain,
                }
            }
            _ => TeardownCause::Drain,
        };

        self.begin_closing(cause);
        self.finish_closing().await;
        self.summary()
    }

    /// End a session that never reached `Active`: close the client socket
    /// and go straight to `Closed`.
    pub async fn abort(mut self, cause: TeardownCause) -> BridgeSummary {
        self.cause = Some(cause);
        self.downstream.close().await;
        self.upstream.close().await;
        self.transition(BridgeState::Closed);
        self.summary()
    }

    /// Wait for `connect`, then relay over the socket it yields.
    ///
    /// A failed connect, or a drain while still `Connecting`, closes the
    /// client socket and ends `Closed` without ever reaching `Active`.
    pub async fn connect_and_relay<F>(
        self,
        upstream: SocketAddr,
        connect: F,
        mut drain: watch::Receiver<bool>,
    ) -> BridgeSummary
    where
        F: Future<Output = io::Result<U>>,
    {
        let connected = tokio::select! {
            result = connect => Some(result),
            _ = drained(&mut drain) => None,
        };

        match connected {
            Some(Ok(stream)) => self.relay(stream, drain).await,
            Some(Err(source)) => {
                let err = RelayError::UpstreamConnect {
                    addr: upstream,
                    source,
                };
                debug!(session = %self.id, error = %err, "Upstream connect failed");
                self.abort(TeardownCause::Fault(err)).await
            }
            None => {
                debug!(session = %self.id, "Drained while connecting");
                self.abort(TeardownCause::Drain).await
            }
        }
    }

    /// Record the teardown cause and enter `Closing`.
    ///
    /// The first caller wins; every later call is a no-op returning false.
    fn begin_closing(&mut self, cause: TeardownCause) -> bool {
        match self.state.get() {
            BridgeState::Closing | BridgeState::Closed => {
                debug!(session = %self.id, cause = %cause, "Already closing");
                false
            }
            _ => {
                debug!(session = %self.id, cause = %cause, "Closing session");
                self.cause = Some(cause);
                self.transition(BridgeState::Closing)
            }
        }
    }

    /// Close both legs regardless of which one faulted, then enter `Closed`.
    async fn finish_closing(&mut self) {
        let downstream_closed = self.downstream.close().await;
        let upstream_closed = self.upstream.close().await;
        debug!(
            session = %self.id,
            downstream_closed,
            upstream_closed,
            "Sockets closed"
        );
        self.transition(BridgeState::Closed);
    }

    fn transition(&mut self, next: BridgeState) -> bool {
        let current = self.state.get();
        if !current.can_transition_to(next) {
            warn!(
                session = %self.id,
                from = ?current,
                to = ?next,
                "Ignoring illegal bridge transition"
            );
            return false;
        }
        debug!(session = %self.id, from = ?current, to = ?next, "Bridge transition");
        self.state.set(next);
        true
    }

    fn force_closed(&mut self) {
        self.state.set(BridgeState::Closed);
    }

    fn summary(&mut self) -> BridgeSummary {
        BridgeSummary {
            session: self.id,
            final_state: self.state.get(),
            reached_active: self.reached_active,
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
            cause: self.cause.take(),
        }
    }
}

impl<D> Bridge<D, TcpStream>
where
    D: AsyncRead + AsyncWrite + Unpin,
{
    /// Connect to the upstream server and run the session to completion.
    pub async fn run(self, upstream: SocketAddr, drain: watch::Receiver<bool>) -> BridgeSummary {
        debug!(session = %self.id, upstream = %upstream, "Connecting to upstream");
        self.connect_and_relay(upstream, TcpStream::connect(upstream), drain)
            .await
    }
}

/// One relay direction: read from `source`, write exactly those bytes to
/// `dest`, repeat. Returns on the first EOF or fault.
async fn pump<R, W>(
    direction: Direction,
    source: &mut R,
    dest: &mut W,
    buf: &mut [u8],
    transferred: &mut u64,
    tap: &SessionTap,
) -> TeardownCause
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let (from, to) = legs(direction);
    loop {
        let n = match source.read(buf).await {
            Ok(0) => return TeardownCause::PeerClosed(from),
            Ok(n) => n,
            Err(e) => return relay_fault(from, e),
        };
        tap.record(direction, TransferOp::Read, &buf[..n]);

        if let Err(e) = dest.write_all(&buf[..n]).await {
            return relay_fault(to, e);
        }
        *transferred += n as u64;
        tap.record(direction, TransferOp::Write, &buf[..n]);
    }
}

fn relay_fault(leg: Leg, source: io::Error) -> TeardownCause {
    TeardownCause::Fault(RelayError::RelayIo { leg, source })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use tokio::io::{duplex, DuplexStream, ReadBuf};
    use tokio::net::TcpListener;
    use tokio::task::LocalSet;
    use tokio::time::timeout;

    use crate::diagnostics::{DiagnosticsRecord, MemorySink};

    const WAIT: Duration = Duration::from_secs(5);

    fn bridge<U>(
        downstream: DuplexStream,
        buffer_size: usize,
    ) -> (Bridge<DuplexStream, U>, Arc<MemorySink>)
    where
        U: AsyncRead + AsyncWrite + Unpin,
    {
        let sink = Arc::new(MemorySink::new());
        let id = SessionId::new(0, 1);
        let tap = SessionTap::new(id, sink.clone(), 16);
        (Bridge::new(id, downstream, buffer_size, tap), sink)
    }

    fn steps(records: &[DiagnosticsRecord]) -> Vec<(Direction, TransferOp, usize)> {
        records.iter().map(|r| (r.direction, r.op, r.bytes)).collect()
    }

    /// Upstream socket whose reads never complete and whose writes fail.
    struct ResetOnWrite;

    impl AsyncRead for ResetOnWrite {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    impl AsyncWrite for ResetOnWrite {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    /// Client socket whose reads fail with a reset.
    struct ResetOnRead;

    impl AsyncRead for ResetOnRead {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
        }
    }

    impl AsyncWrite for ResetOnRead {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_state_transitions() {
        use BridgeState::*;
        assert!(Connecting.can_transition_to(Active));
        assert!(Connecting.can_transition_to(Closed));
        assert!(Active.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));

        assert!(!Connecting.can_transition_to(Closing));
        assert!(!Active.can_transition_to(Closed));
        assert!(!Active.can_transition_to(Connecting));
        assert!(!Closed.can_transition_to(Active));
        assert!(!Closing.can_transition_to(Closing));
    }

    #[tokio::test]
    async fn test_begin_closing_first_caller_wins() {
        let (client, _client_peer) = duplex(64);
        let (mut bridge, _sink) = bridge::<DuplexStream>(client, 64);
        assert!(bridge.transition(BridgeState::Active));

        assert!(bridge.begin_closing(TeardownCause::PeerClosed(Leg::Upstream)));
        assert!(!bridge.begin_closing(TeardownCause::Drain));
        assert_eq!(bridge.state(), BridgeState::Closing);
        assert!(matches!(
            bridge.cause,
            Some(TeardownCause::PeerClosed(Leg::Upstream))
        ));

        bridge.finish_closing().await;
        assert_eq!(bridge.state(), BridgeState::Closed);
        assert!(!bridge.begin_closing(TeardownCause::Drain));
    }

    #[tokio::test]
    async fn test_socket_close_is_idempotent() {
        let (stream, mut peer) = duplex(64);
        let mut socket = Socket::open(Leg::Downstream, stream);

        assert!(socket.is_open());
        assert!(socket.close().await);
        assert!(!socket.is_open());
        assert!(!socket.close().await);

        let mut buf = [0u8; 8];
        assert_eq!(peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relay_round_trip_records_in_causal_order() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);
        let (bridge, sink) = bridge::<DuplexStream>(client, 1024);
        let state = bridge.state_cell();
        let (_drain_tx, drain_rx) = watch::channel(false);

        let driver = async {
            client_peer.write_all(b"PING\n").await.unwrap();

            let mut buf = [0u8; 5];
            upstream_peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PING\n");
            assert_eq!(state.get(), BridgeState::Active);

            upstream_peer.write_all(b"PONG\n").await.unwrap();
            client_peer.read_exact(&mut buf).await.unwrap();
            assert_eq!(&buf, b"PONG\n");

            drop(client_peer);

            // The upstream leg is closed as well.
            let mut rest = Vec::new();
            upstream_peer.read_to_end(&mut rest).await.unwrap();
            assert!(rest.is_empty());
        };

        let (summary, ()) = timeout(WAIT, async {
            tokio::join!(bridge.relay(upstream, drain_rx), driver)
        })
        .await
        .unwrap();

        assert_eq!(summary.final_state, BridgeState::Closed);
        assert!(summary.reached_active);
        assert_eq!(summary.bytes_up, 5);
        assert_eq!(summary.bytes_down, 5);
        assert!(matches!(
            summary.cause,
            Some(TeardownCause::PeerClosed(Leg::Downstream))
        ));

        assert_eq!(
            steps(&sink.records()),
            vec![
                (Direction::Upstream, TransferOp::Read, 5),
                (Direction::Upstream, TransferOp::Write, 5),
                (Direction::Downstream, TransferOp::Read, 5),
                (Direction::Downstream, TransferOp::Write, 5),
            ]
        );
        assert_eq!(sink.records()[3].excerpt, b"PONG\n");
    }

    #[tokio::test]
    async fn test_upstream_eof_closes_downstream() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, upstream_peer) = duplex(1024);
        let (bridge, _sink) = bridge::<DuplexStream>(client, 1024);
        let (_drain_tx, drain_rx) = watch::channel(false);

        drop(upstream_peer);

        let summary = timeout(WAIT, bridge.relay(upstream, drain_rx))
            .await
            .unwrap();
        assert_eq!(summary.final_state, BridgeState::Closed);
        assert!(matches!(
            summary.cause,
            Some(TeardownCause::PeerClosed(Leg::Upstream))
        ));

        let mut buf = [0u8; 8];
        assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_write_fault_tears_down_both_legs() {
        let (client, mut client_peer) = duplex(1024);
        let (bridge, sink) = bridge::<ResetOnWrite>(client, 1024);
        let (_drain_tx, drain_rx) = watch::channel(false);

        client_peer.write_all(b"hello").await.unwrap();

        let summary = timeout(WAIT, bridge.relay(ResetOnWrite, drain_rx))
            .await
            .unwrap();

        assert_eq!(summary.final_state, BridgeState::Closed);
        assert_eq!(summary.bytes_up, 0);
        match summary.cause {
            Some(TeardownCause::Fault(RelayError::RelayIo { leg, ref source })) => {
                assert_eq!(leg, Leg::Upstream);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset);
            }
            ref other => panic!("unexpected cause: {:?}", other),
        }

        // One read was recorded, the failed write was not.
        assert_eq!(
            steps(&sink.records()),
            vec![(Direction::Upstream, TransferOp::Read, 5)]
        );

        // The healthy client leg was closed too.
        let mut buf = [0u8; 8];
        assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_stalled_upstream_stops_client_reads() {
        const BUFFER: usize = 512;
        const UPSTREAM_CAPACITY: usize = 1024;
        const PAYLOAD: usize = 64 * 1024;

        let local = LocalSet::new();
        local
            .run_until(async {
                let (client, mut client_peer) = duplex(PAYLOAD);
                let (upstream, mut upstream_peer) = duplex(UPSTREAM_CAPACITY);
                let (bridge, sink) = bridge::<DuplexStream>(client, BUFFER);
                let (_drain_tx, drain_rx) = watch::channel(false);

                let session = tokio::task::spawn_local(bridge.relay(upstream, drain_rx));

                let payload: Vec<u8> = (0..PAYLOAD).map(|i| (i % 251) as u8).collect();
                client_peer.write_all(&payload).await.unwrap();

                // Nobody reads the upstream side yet.
                tokio::time::sleep(Duration::from_millis(100)).await;

                let upstream_bytes = |op: TransferOp| -> usize {
                    sink.records()
                        .iter()
                        .filter(|r| r.direction == Direction::Upstream && r.op == op)
                        .map(|r| r.bytes)
                        .sum()
                };
                let read = upstream_bytes(TransferOp::Read);
                let written = upstream_bytes(TransferOp::Write);

                assert!(written <= UPSTREAM_CAPACITY, "wrote {}", written);
                assert!(read - written <= BUFFER, "read {} wrote {}", read, written);
                assert!(read < PAYLOAD);

                // Resume: everything arrives intact and in order.
                let mut received = vec![0u8; PAYLOAD];
                timeout(WAIT, upstream_peer.read_exact(&mut received))
                    .await
                    .unwrap()
                    .unwrap();
                assert_eq!(received, payload);

                drop(client_peer);
                let summary = timeout(WAIT, session).await.unwrap().unwrap();
                assert_eq!(summary.bytes_up, PAYLOAD as u64);
                assert_eq!(summary.final_state, BridgeState::Closed);
            })
            .await;
    }

    #[tokio::test]
    async fn test_drain_closes_active_bridge() {
        let (client, mut client_peer) = duplex(1024);
        let (upstream, mut upstream_peer) = duplex(1024);
        let (bridge, _sink) = bridge::<DuplexStream>(client, 1024);
        let (drain_tx, drain_rx) = watch::channel(false);

        let driver = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            drain_tx.send(true).unwrap();

            let mut buf = [0u8; 8];
            assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
            assert_eq!(upstream_peer.read(&mut buf).await.unwrap(), 0);
        };

        let (summary, ()) = timeout(WAIT, async {
            tokio::join!(bridge.relay(upstream, drain_rx), driver)
        })
        .await
        .unwrap();

        assert!(summary.reached_active);
        assert_eq!(summary.final_state, BridgeState::Closed);
        assert!(matches!(summary.cause, Some(TeardownCause::Drain)));
    }

    #[tokio::test]
    async fn test_connect_failure_closes_client_without_activating() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = listener.local_addr().unwrap();
        drop(listener);

        let (client, mut client_peer) = duplex(1024);
        let (bridge, sink) = bridge::<TcpStream>(client, 1024);
        let state = bridge.state_cell();
        let (_drain_tx, drain_rx) = watch::channel(false);

        let summary = timeout(WAIT, bridge.run(dead_addr, drain_rx))
            .await
            .unwrap();

        assert!(!summary.reached_active);
        assert_eq!(summary.final_state, BridgeState::Closed);
        assert_eq!(state.get(), BridgeState::Closed);
        assert!(matches!(
            summary.cause,
            Some(TeardownCause::Fault(RelayError::UpstreamConnect { .. }))
        ));
        assert!(sink.is_empty());

        let mut buf = [0u8; 8];
        assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drain_while_connecting_closes_client() {
        let (client, mut client_peer) = duplex(1024);
        let (bridge, sink) = bridge::<DuplexStream>(client, 1024);
        let state = bridge.state_cell();
        let (drain_tx, drain_rx) = watch::channel(false);
        let upstream: SocketAddr = "127.0.0.1:9".parse().unwrap();

        // A connect that never completes.
        let connect = std::future::pending::<io::Result<DuplexStream>>();

        let driver = async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            assert_eq!(state.get(), BridgeState::Connecting);
            drain_tx.send(true).unwrap();

            let mut buf = [0u8; 8];
            assert_eq!(client_peer.read(&mut buf).await.unwrap(), 0);
        };

        let (summary, ()) = timeout(WAIT, async {
            tokio::join!(bridge.connect_and_relay(upstream, connect, drain_rx), driver)
        })
        .await
        .unwrap();

        assert!(!summary.reached_active);
        assert_eq!(summary.final_state, BridgeState::Closed);
        assert_eq!(state.get(), BridgeState::Closed);
        assert!(matches!(summary.cause, Some(TeardownCause::Drain)));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_read_fault_tears_down_both_legs() {
        let (upstream, mut upstream_peer) = duplex(1024);
        let sink = Arc::new(MemorySink::new());
        let id = SessionId::new(2, 7);
        let tap = SessionTap::new(id, sink.clone(), 16);
        let bridge: Bridge<ResetOnRead, DuplexStream> = Bridge::new(id, ResetOnRead, 1024, tap);
        assert_eq!(bridge.id(), id);
        let (_drain_tx, drain_rx) = watch::channel(false);

        let summary = timeout(WAIT, bridge.relay(upstream, drain_rx))
            .await
            .unwrap();

        assert_eq!(summary.session, id);
        assert_eq!(summary.final_state, BridgeState::Closed);
        assert!(summary.reached_active);
        match summary.cause {
            Some(TeardownCause::Fault(RelayError::RelayIo { leg, ref source })) => {
                assert_eq!(leg, Leg::Downstream);
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset);
            }
            ref other => panic!("unexpected cause: {:?}", other),
        }
        assert!(sink.is_empty());

        // The healthy upstream leg was closed too.
        let mut buf = [0u8; 8];
        assert_eq!(upstream_peer.read(&mut buf).await.unwrap(), 0);
    }
}
