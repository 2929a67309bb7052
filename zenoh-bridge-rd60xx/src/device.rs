//! Per-PSU device session: lifecycle state machine and framed transport.
//!
//! A session owns the TCP byte stream for one unit and layers the frame
//! codec over it. It enforces the protocol's strict request/response shape:
//! at most one request is outstanding at a time, every wire wait carries a
//! deadline, and garbage on the stream is resynchronised away rather than
//! crashing the session.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, trace};

use rd60xx_proto::frame::{self, Decoded, Frame};

use crate::error::CommandError;

/// Bytes discarded while resynchronising before the link is declared dead.
const RESYNC_LIMIT: usize = 256;

const READ_CHUNK: usize = 256;

/// Lifecycle of one PSU connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, identity not yet read.
    AwaitingIdentity,
    /// Identity known, not yet registered.
    Identified,
    /// Registered and serving requests.
    Active,
    /// Transport released; every further request resolves `SessionClosed`.
    Closed,
}

/// One connected PSU.
pub struct DeviceSession<S> {
    stream: S,
    peer: SocketAddr,
    state: SessionState,
    rx_buf: Vec<u8>,
    /// Function code of the in-flight request, if any.
    pending: Option<u8>,
    last_activity: Instant,
}

impl<S: AsyncRead + AsyncWrite + Unpin> DeviceSession<S> {
    pub fn new(stream: S, peer: SocketAddr) -> Self {
        Self {
            stream,
            peer,
            state: SessionState::AwaitingIdentity,
            rx_buf: Vec::new(),
            pending: None,
            last_activity: Instant::now(),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Seconds since the last successful exchange.
    pub fn idle_secs(&self) -> f64 {
        self.last_activity.elapsed().as_secs_f64()
    }

    pub fn mark_identified(&mut self) {
        if self.state == SessionState::AwaitingIdentity {
            self.state = SessionState::Identified;
        }
    }

    pub fn mark_active(&mut self) {
        if self.state == SessionState::Identified {
            self.state = SessionState::Active;
        }
    }

    /// Issue one request and await the matching response within `deadline`.
    ///
    /// A second issue while one request is pending resolves `Busy`; callers
    /// queue at the dispatcher, not here. Leftover bytes from a superseded
    /// request are stale and dropped before the new request goes out.
    pub async fn transact(
        &mut self,
        request: &[u8],
        function: u8,
        deadline: Duration,
    ) -> Result<Frame, CommandError> {
        if self.state == SessionState::Closed {
            return Err(CommandError::SessionClosed);
        }
        if self.pending.is_some() {
            return Err(CommandError::Busy);
        }

        self.rx_buf.clear();
        self.pending = Some(function);
        let result = tokio::time::timeout(deadline, async {
            self.stream.write_all(request).await?;
            self.stream.flush().await?;
            self.read_matching(function).await
        })
        .await;
        self.pending = None;

        match result {
            Ok(Ok(frame)) => {
                self.last_activity = Instant::now();
                Ok(frame)
            }
            Ok(Err(err)) => {
                if matches!(err, CommandError::Io(_)) {
                    self.state = SessionState::Closed;
                }
                Err(err)
            }
            Err(_elapsed) => Err(CommandError::Timeout),
        }
    }

    /// Read until a frame matching `function` arrives.
    ///
    /// Frames for other functions are responses to superseded requests and
    /// are discarded. Undecodable input is resynchronised one byte at a time,
    /// up to a bound.
    async fn read_matching(&mut self, function: u8) -> Result<Frame, CommandError> {
        let mut discarded = 0usize;
        loop {
            loop {
                match frame::decode_response(&self.rx_buf) {
                    Ok(Decoded::Frame { frame, consumed }) => {
                        self.rx_buf.drain(..consumed);
                        if frame.function & 0x7F == function {
                            if let Some(code) = frame.exception_code() {
                                return Err(CommandError::Rejected(code));
                            }
                            return Ok(frame);
                        }
                        trace!(peer = %self.peer, function = frame.function, "discarding stale frame");
                    }
                    Ok(Decoded::NeedMoreData) => break,
                    Err(err) => {
                        discarded += 1;
                        if discarded > RESYNC_LIMIT {
                            self.state = SessionState::Closed;
                            return Err(err.into());
                        }
                        if discarded == 1 {
                            debug!(peer = %self.peer, %err, "frame error, resynchronising");
                        }
                        self.rx_buf.remove(0);
                    }
                }
            }

            let mut chunk = [0u8; READ_CHUNK];
            let n = self.stream.read(&mut chunk).await?;
            if n == 0 {
                self.state = SessionState::Closed;
                return Err(CommandError::SessionClosed);
            }
            self.rx_buf.extend_from_slice(&chunk[..n]);
        }
    }

    /// Watch the link while no request is in flight.
    ///
    /// Resolves only when the peer closes the connection or the transport
    /// errors; bytes arriving between requests are stale responses and are
    /// discarded. Cancellation-safe, so it can sit in a `select!` opposite
    /// the job queue.
    pub async fn idle_read(&mut self) -> CommandError {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk).await {
                Ok(0) => {
                    self.state = SessionState::Closed;
                    return CommandError::SessionClosed;
                }
                Ok(n) => {
                    trace!(peer = %self.peer, bytes = n, "discarding stale bytes");
                }
                Err(err) => {
                    self.state = SessionState::Closed;
                    return CommandError::Io(err);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rd60xx_proto::frame::FUNC_READ_HOLDING;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};

    const DEADLINE: Duration = Duration::from_millis(200);

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn pair() -> (DeviceSession<DuplexStream>, DuplexStream) {
        let (near, far) = duplex(4096);
        (DeviceSession::new(near, peer()), far)
    }

    /// Read and discard one request from the far side.
    async fn drain_request(far: &mut DuplexStream, len: usize) {
        let mut buf = vec![0u8; len];
        far.read_exact(&mut buf).await.unwrap();
    }

    #[tokio::test]
    async fn test_transact_roundtrip() {
        let (mut session, mut far) = pair();

        let request = frame::read_request(1, 0, 3);
        let reply = frame::read_response(1, &[60062, 0, 23024]);
        let server = tokio::spawn(async move {
            drain_request(&mut far, 8).await;
            far.write_all(&reply).await.unwrap();
            far
        });

        let frame = session
            .transact(&request, FUNC_READ_HOLDING, DEADLINE)
            .await
            .unwrap();
        assert_eq!(frame.registers().unwrap(), vec![60062, 0, 23024]);
        assert!(session.pending.is_none());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_transact_times_out() {
        let (mut session, _far) = pair();

        let request = frame::read_request(1, 0, 3);
        let result = session
            .transact(&request, FUNC_READ_HOLDING, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(CommandError::Timeout)));
        // A timeout does not kill the session; the dispatcher retries.
        assert_eq!(session.state(), SessionState::AwaitingIdentity);
    }

    #[tokio::test]
    async fn test_second_request_is_busy() {
        let (mut session, _far) = pair();
        session.pending = Some(FUNC_READ_HOLDING);

        let request = frame::read_request(1, 0, 3);
        let result = session
            .transact(&request, FUNC_READ_HOLDING, DEADLINE)
            .await;
        assert!(matches!(result, Err(CommandError::Busy)));
    }

    #[tokio::test]
    async fn test_resync_past_garbage() {
        let (mut session, mut far) = pair();

        let request = frame::read_request(1, 0, 1);
        let reply = frame::read_response(1, &[42]);
        let server = tokio::spawn(async move {
            drain_request(&mut far, 8).await;
            // Garbage with a bad function code ahead of the real frame.
            far.write_all(&[0x01, 0x55, 0xAA]).await.unwrap();
            far.write_all(&reply).await.unwrap();
            far
        });

        let frame = session
            .transact(&request, FUNC_READ_HOLDING, DEADLINE)
            .await
            .unwrap();
        assert_eq!(frame.registers().unwrap(), vec![42]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_stale_frame_for_other_function_discarded() {
        let (mut session, mut far) = pair();

        let request = frame::read_request(1, 0, 1);
        let stale = frame::write_single_request(1, 18, 1); // echo shape of a write response
        let reply = frame::read_response(1, &[7]);
        let server = tokio::spawn(async move {
            drain_request(&mut far, 8).await;
            far.write_all(&stale).await.unwrap();
            far.write_all(&reply).await.unwrap();
            far
        });

        let frame = session
            .transact(&request, FUNC_READ_HOLDING, DEADLINE)
            .await
            .unwrap();
        assert_eq!(frame.registers().unwrap(), vec![7]);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_exception_response_rejected() {
        let (mut session, mut far) = pair();

        let request = frame::read_request(1, 0, 1);
        let exception = frame::encode(1, FUNC_READ_HOLDING | 0x80, &[0x02]);
        let server = tokio::spawn(async move {
            drain_request(&mut far, 8).await;
            far.write_all(&exception).await.unwrap();
            far
        });

        let result = session
            .transact(&request, FUNC_READ_HOLDING, DEADLINE)
            .await;
        assert!(matches!(result, Err(CommandError::Rejected(0x02))));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_peer_close_mid_request() {
        let (mut session, far) = pair();
        drop(far);

        let request = frame::read_request(1, 0, 1);
        // The write or the read fails on the dropped peer; either way the
        // session transitions to Closed.
        let result = session
            .transact(&request, FUNC_READ_HOLDING, DEADLINE)
            .await;
        assert!(result.is_err());
        assert_eq!(session.state(), SessionState::Closed);

        // Every further request resolves SessionClosed immediately.
        let result = session
            .transact(&request, FUNC_READ_HOLDING, DEADLINE)
            .await;
        assert!(matches!(result, Err(CommandError::SessionClosed)));
    }

    #[tokio::test]
    async fn test_idle_read_detects_close() {
        let (mut session, mut far) = pair();

        far.write_all(&[0xFF, 0xFE]).await.unwrap(); // stale bytes, ignored
        drop(far);

        let err = session.idle_read().await;
        assert!(matches!(err, CommandError::SessionClosed));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_repeated_checksum_failure_closes_session() {
        let (mut session, mut far) = pair();

        let request = frame::read_request(1, 0, 1);
        let server = tokio::spawn(async move {
            drain_request(&mut far, 8).await;
            // A long run of valid-looking frames with broken checksums.
            let mut bad = frame::read_response(1, &[1]);
            let last = bad.len() - 1;
            bad[last] ^= 0xFF;
            for _ in 0..64 {
                far.write_all(&bad).await.unwrap();
            }
            far
        });

        let result = session
            .transact(&request, FUNC_READ_HOLDING, DEADLINE)
            .await;
        // The final discard may land on a checksum or framing error; either
        // way the session is dead.
        assert!(matches!(result, Err(CommandError::Frame(_))));
        assert_eq!(session.state(), SessionState::Closed);
        server.await.unwrap();
    }

    #[test]
    fn test_state_transitions() {
        let (near, _far) = duplex(64);
        let mut session = DeviceSession::new(near, peer());

        assert_eq!(session.state(), SessionState::AwaitingIdentity);
        session.mark_active(); // not legal yet
        assert_eq!(session.state(), SessionState::AwaitingIdentity);
        session.mark_identified();
        assert_eq!(session.state(), SessionState::Identified);
        session.mark_active();
        assert_eq!(session.state(), SessionState::Active);
    }
}
