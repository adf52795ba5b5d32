//! Rendezvous channel between the test driver and the server under test.
//!
//! The driver binds one TCP endpoint before the server starts and the server
//! connects to it exactly once. From then on the two sides strictly alternate:
//! the server sends one message and blocks, the driver reads it, inspects it
//! and replies with an (empty) acknowledgement, which releases the server.
//!
//! Every wait on the driver side is bounded. A silent server becomes a
//! [`HarnessError::Timeout`] carrying the step name and the number of cycles
//! that completed, instead of a hung test run.

use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::error::{HarnessError, HarnessResult};
use crate::wire::{decode_payload, read_frame, write_frame};

/// Default bound on a single `await_message`.
pub const DEFAULT_MESSAGE_TIMEOUT: Duration = Duration::from_secs(30);

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(5);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_millis(50);

/// Driver-side position in the request/acknowledge cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    /// No message outstanding; the driver may await the next one.
    Idle,
    /// A message was received and must be acknowledged before anything else.
    Pending,
    /// The channel failed or was closed; every further operation errors.
    Closed,
}

/// Driver end of the rendezvous channel.
pub struct RendezvousChannel {
    listener: TcpListener,
    local_addr: SocketAddr,
    stream: Option<TcpStream>,
    state: ChannelState,
    completed_cycles: u64,
    message_timeout: Duration,
    pending_step: Option<String>,
}

impl RendezvousChannel {
    /// Bind the driver endpoint. Fails with [`HarnessError::Bind`] if the
    /// address is already held by another run.
    pub fn bind(address: &str) -> HarnessResult<Self> {
        let listener = TcpListener::bind(address).map_err(|e| HarnessError::Bind {
            address: address.to_string(),
            reason: e.to_string(),
        })?;
        let local_addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;
        debug!(%local_addr, "Rendezvous channel bound");

        Ok(Self {
            listener,
            local_addr,
            stream: None,
            state: ChannelState::Idle,
            completed_cycles: 0,
            message_timeout: DEFAULT_MESSAGE_TIMEOUT,
            pending_step: None,
        })
    }

    /// Override the bound applied by [`Self::await_message`].
    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Number of fully acknowledged cycles so far.
    pub fn completed_cycles(&self) -> u64 {
        self.completed_cycles
    }

    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Block until the server sends its next message, using the channel's
    /// default timeout.
    pub fn await_message(&mut self, step: &str) -> HarnessResult<String> {
        self.await_message_within(step, self.message_timeout)
    }

    /// Block until the server sends its next message or `timeout` elapses.
    ///
    /// The returned payload has trailing NUL padding removed.
    pub fn await_message_within(&mut self, step: &str, timeout: Duration) -> HarnessResult<String> {
        match self.state {
            ChannelState::Idle => {}
            ChannelState::Pending => {
                let pending = self.pending_step.as_deref().unwrap_or("unknown");
                return Err(HarnessError::Protocol(format!(
                    "awaiting {step} while message for {pending} is still unacknowledged"
                )));
            }
            ChannelState::Closed => {
                return Err(HarnessError::Protocol(format!(
                    "awaiting {step} on a closed rendezvous channel"
                )));
            }
        }

        let started = Instant::now();
        if self.stream.is_none() {
            let stream = self.accept_within(step, timeout, started)?;
            self.stream = Some(stream);
        }

        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            return Err(self.fail_timeout(step, started));
        }

        let Some(stream) = self.stream.as_mut() else {
            return Err(HarnessError::Protocol(format!(
                "no server connection while awaiting {step}"
            )));
        };
        let read_result = stream
            .set_read_timeout(Some(remaining))
            .and_then(|()| read_frame(stream));

        match read_result {
            Ok(raw) => {
                let payload = decode_payload(&raw).inspect_err(|_| {
                    self.state = ChannelState::Closed;
                })?;
                trace!(step, raw_len = raw.len(), %payload, "Rendezvous message received");
                self.state = ChannelState::Pending;
                self.pending_step = Some(step.to_string());
                Ok(payload)
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(self.fail_timeout(step, started))
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => {
                self.state = ChannelState::Closed;
                Err(HarnessError::Protocol(format!(
                    "server closed the rendezvous connection while awaiting {step} \
                     after {} completed cycles",
                    self.completed_cycles
                )))
            }
            Err(e) => {
                self.state = ChannelState::Closed;
                Err(HarnessError::Io(e))
            }
        }
    }

    /// Release the server with an empty acknowledgement.
    pub fn acknowledge(&mut self) -> HarnessResult<()> {
        self.acknowledge_with(b"")
    }

    /// Release the server. The payload content is ignored by the peer.
    pub fn acknowledge_with(&mut self, payload: &[u8]) -> HarnessResult<()> {
        if self.state != ChannelState::Pending {
            return Err(HarnessError::Protocol(format!(
                "acknowledge called in state {:?} without a pending message",
                self.state
            )));
        }
        let Some(stream) = self.stream.as_mut() else {
            return Err(HarnessError::Protocol(
                "acknowledge called before the server connected".to_string(),
            ));
        };
        if let Err(e) = write_frame(stream, payload) {
            self.state = ChannelState::Closed;
            return Err(e);
        }
        self.completed_cycles += 1;
        self.state = ChannelState::Idle;
        let step = self.pending_step.take().unwrap_or_default();
        trace!(step, cycles = self.completed_cycles, "Rendezvous message acknowledged");
        Ok(())
    }

    /// Close the connection and release the bound address.
    pub fn close(mut self) {
        self.state = ChannelState::Closed;
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        debug!(
            local_addr = %self.local_addr,
            cycles = self.completed_cycles,
            "Rendezvous channel closed"
        );
    }

    fn accept_within(
        &mut self,
        step: &str,
        timeout: Duration,
        started: Instant,
    ) -> HarnessResult<TcpStream> {
        let mut delay = ACCEPT_BACKOFF_START;
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    stream.set_nonblocking(false)?;
                    stream.set_nodelay(true)?;
                    debug!(%peer, step, "Server connected to rendezvous channel");
                    return Ok(stream);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {}
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.state = ChannelState::Closed;
                    return Err(HarnessError::Io(e));
                }
            }
            if started.elapsed() >= timeout {
                return Err(self.fail_timeout(step, started));
            }
            thread::sleep(delay);
            delay = (delay * 2).min(ACCEPT_BACKOFF_MAX);
        }
    }

    fn fail_timeout(&mut self, step: &str, started: Instant) -> HarnessError {
        // A partially read frame leaves the stream unusable.
        self.state = ChannelState::Closed;
        let waited = started.elapsed();
        warn!(
            step,
            cycles = self.completed_cycles,
            ?waited,
            "No rendezvous message within timeout"
        );
        HarnessError::Timeout {
            step: step.to_string(),
            completed_cycles: self.completed_cycles,
            waited,
        }
    }
}

/// Server end of the rendezvous channel.
///
/// Each [`RendezvousPeer::send`] blocks until the driver acknowledges.
pub struct RendezvousPeer {
    stream: TcpStream,
    ack_timeout: Option<Duration>,
    sent: u64,
}

impl RendezvousPeer {
    /// Connect to the driver, retrying until `deadline` elapses.
    pub fn connect(address: &str, deadline: Duration) -> HarnessResult<Self> {
        let started = Instant::now();
        let mut delay = ACCEPT_BACKOFF_START;
        loop {
            let attempt = address
                .to_socket_addrs()
                .map_err(|e| {
                    HarnessError::Config(format!("invalid rendezvous address {address}: {e}"))
                })?
                .find_map(|addr| TcpStream::connect(addr).ok());
            if let Some(stream) = attempt {
                stream.set_nodelay(true)?;
                return Ok(Self {
                    stream,
                    ack_timeout: None,
                    sent: 0,
                });
            }
            if started.elapsed() >= deadline {
                return Err(HarnessError::Timeout {
                    step: format!("connect to {address}"),
                    completed_cycles: 0,
                    waited: started.elapsed(),
                });
            }
            thread::sleep(delay);
            delay = (delay * 2).min(ACCEPT_BACKOFF_MAX);
        }
    }

    /// Bound the wait for each acknowledgement. `None` blocks indefinitely.
    pub fn with_ack_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Number of acknowledged sends.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Send one message and block until the driver acknowledges it.
    pub fn send(&mut self, payload: &str) -> HarnessResult<()> {
        self.send_bytes(payload.as_bytes())
    }

    /// Send with trailing NUL padding up to `width` bytes, the way
    /// fixed-buffer senders do.
    pub fn send_padded(&mut self, payload: &str, width: usize) -> HarnessResult<()> {
        let mut bytes = payload.as_bytes().to_vec();
        if bytes.len() < width {
            bytes.resize(width, 0);
        }
        self.send_bytes(&bytes)
    }

    fn send_bytes(&mut self, payload: &[u8]) -> HarnessResult<()> {
        write_frame(&mut self.stream, payload)?;
        self.stream.set_read_timeout(self.ack_timeout)?;
        match read_frame(&mut self.stream) {
            Ok(_ack) => {
                self.sent += 1;
                Ok(())
            }
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(HarnessError::Timeout {
                    step: format!("acknowledgement of message {}", self.sent + 1),
                    completed_cycles: self.sent,
                    waited: self.ack_timeout.unwrap_or_default(),
                })
            }
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => Err(HarnessError::Protocol(
                format!("driver closed the rendezvous connection after {} cycles", self.sent),
            )),
            Err(e) => Err(HarnessError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn bind_ephemeral() -> RendezvousChannel {
        RendezvousChannel::bind("127.0.0.1:0")
            .unwrap()
            .with_message_timeout(Duration::from_secs(5))
    }

    #[test]
    fn test_handshake_cycle_strips_padding() {
        let mut channel = bind_ephemeral();
        let addr = channel.local_addr().to_string();
        let (done_tx, done_rx) = mpsc::channel();

        let server = thread::spawn(move || {
            let mut peer = RendezvousPeer::connect(&addr, Duration::from_secs(5)).unwrap();
            peer.send_padded("4242", 16).unwrap();
            done_tx.send(peer.sent()).unwrap();
        });

        let pid = channel.await_message("handshake").unwrap();
        assert_eq!(pid, "4242");
        assert_eq!(channel.state(), ChannelState::Pending);
        // The server stays blocked until we acknowledge.
        assert!(done_rx.recv_timeout(Duration::from_millis(100)).is_err());

        channel.acknowledge().unwrap();
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(5)).unwrap(), 1);
        assert_eq!(channel.completed_cycles(), 1);
        assert_eq!(channel.state(), ChannelState::Idle);
        server.join().unwrap();
    }

    #[test]
    fn test_acknowledge_without_pending_message_is_protocol_error() {
        let mut channel = bind_ephemeral();
        let err = channel.acknowledge().unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)));
        assert_eq!(channel.completed_cycles(), 0);
    }

    #[test]
    fn test_second_await_without_acknowledge_is_protocol_error() {
        let mut channel = bind_ephemeral();
        let addr = channel.local_addr().to_string();
        let server = thread::spawn(move || {
            let mut peer = RendezvousPeer::connect(&addr, Duration::from_secs(5)).unwrap();
            peer.send("1").unwrap();
        });

        channel.await_message("first").unwrap();
        let err = channel.await_message("second").unwrap_err();
        match err {
            HarnessError::Protocol(msg) => assert!(msg.contains("first")),
            other => panic!("unexpected error: {other}"),
        }
        channel.acknowledge().unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_timeout_when_server_never_connects() {
        let mut channel = bind_ephemeral();
        let started = Instant::now();
        let err = channel
            .await_message_within("handshake", Duration::from_millis(100))
            .unwrap_err();
        assert!(started.elapsed() < Duration::from_secs(2));
        match err {
            HarnessError::Timeout {
                step,
                completed_cycles,
                ..
            } => {
                assert_eq!(step, "handshake");
                assert_eq!(completed_cycles, 0);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[test]
    fn test_timeout_reports_completed_cycles_when_server_goes_quiet() {
        let mut channel = bind_ephemeral();
        let addr = channel.local_addr().to_string();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let server = thread::spawn(move || {
            let mut peer = RendezvousPeer::connect(&addr, Duration::from_secs(5)).unwrap();
            peer.send("7").unwrap();
            // Hold the connection open without sending anything else.
            let _ = release_rx.recv_timeout(Duration::from_secs(5));
        });

        assert_eq!(channel.await_message("value").unwrap(), "7");
        channel.acknowledge().unwrap();
        let err = channel
            .await_message_within("get_counter", Duration::from_millis(150))
            .unwrap_err();
        match err {
            HarnessError::Timeout {
                step,
                completed_cycles,
                waited,
            } => {
                assert_eq!(step, "get_counter");
                assert_eq!(completed_cycles, 1);
                assert!(waited >= Duration::from_millis(100));
            }
            other => panic!("unexpected error: {other}"),
        }
        release_tx.send(()).unwrap();
        server.join().unwrap();
    }

    #[test]
    fn test_peer_ack_timeout_when_driver_never_acknowledges() {
        let mut channel = bind_ephemeral();
        let addr = channel.local_addr().to_string();
        let server = thread::spawn(move || {
            let mut peer = RendezvousPeer::connect(&addr, Duration::from_secs(5))
                .unwrap()
                .with_ack_timeout(Some(Duration::from_millis(100)));
            peer.send("1").unwrap_err()
        });

        assert_eq!(channel.await_message("value").unwrap(), "1");
        let err = server.join().unwrap();
        assert!(matches!(err, HarnessError::Timeout { completed_cycles: 0, .. }));
    }

    #[test]
    fn test_acknowledgement_content_is_irrelevant() {
        let mut channel = bind_ephemeral();
        let addr = channel.local_addr().to_string();
        let server = thread::spawn(move || {
            let mut peer = RendezvousPeer::connect(&addr, Duration::from_secs(5)).unwrap();
            peer.send("8").unwrap();
            peer.send("8").unwrap();
            peer.sent()
        });

        assert_eq!(channel.await_message("get_counter").unwrap(), "8");
        channel.acknowledge_with(b"ignored").unwrap();
        // Re-peeking the same counter without mutation yields the same value.
        assert_eq!(channel.await_message("get_counter_again").unwrap(), "8");
        channel.acknowledge().unwrap();
        assert_eq!(server.join().unwrap(), 2);
    }

    #[test]
    fn test_server_disconnect_is_protocol_error() {
        let mut channel = bind_ephemeral();
        let addr = channel.local_addr().to_string();
        let server = thread::spawn(move || {
            let peer = RendezvousPeer::connect(&addr, Duration::from_secs(5)).unwrap();
            drop(peer);
        });
        server.join().unwrap();

        let err = channel.await_message("value").unwrap_err();
        assert!(matches!(err, HarnessError::Protocol(_)));
    }

    #[test]
    fn test_bind_conflict_while_address_is_held() {
        let first = bind_ephemeral();
        let addr = first.local_addr().to_string();
        let err = RendezvousChannel::bind(&addr).err().expect("second bind must fail");
        assert!(matches!(err, HarnessError::Bind { .. }));

        first.close();
        // Released addresses can be bound again by the next run.
        let again = RendezvousChannel::bind(&addr).unwrap();
        again.close();
    }

    #[test]
    fn test_peer_connect_times_out_without_driver() {
        let port = {
            let channel = bind_ephemeral();
            let port = channel.local_addr().port();
            channel.close();
            port
        };
        let err = RendezvousPeer::connect(&format!("127.0.0.1:{port}"), Duration::from_millis(100))
            .err()
            .expect("nobody is listening");
        assert!(matches!(err, HarnessError::Timeout { .. }));
    }
}
