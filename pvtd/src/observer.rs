//! Instrumentation thread forwarding observations to the driver.
//!
//! Client requests only enqueue; the thread owns the rendezvous connection
//! and blocks on each acknowledgement, so a stalled driver never stalls the
//! control API.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use pvt_common::{HarnessResult, RendezvousPeer};
use tracing::{debug, error, info, warn};

use crate::store::Observation;

/// Messages are NUL-padded to this width, like a fixed send buffer.
pub const MESSAGE_WIDTH: usize = 64;

/// Observations buffered while the driver has not acknowledged yet.
pub const OBSERVATION_QUEUE: usize = 1024;

#[derive(Debug, Clone)]
pub struct ObserverConfig {
    pub address: String,
    pub connect_timeout: Duration,
    pub ack_timeout: Option<Duration>,
    pub pid: u32,
}

/// Handle to the instrumentation thread.
pub struct Observer {
    sender: SyncSender<Observation>,
    sent: Arc<AtomicU64>,
    handle: JoinHandle<()>,
}

impl Observer {
    /// Spawn the thread. It connects, announces `pid`, then forwards
    /// queued observations until the queue closes or the driver goes away.
    pub fn spawn(config: ObserverConfig) -> std::io::Result<Self> {
        let (sender, receiver) = mpsc::sync_channel(OBSERVATION_QUEUE);
        let sent = Arc::new(AtomicU64::new(0));
        let counter = sent.clone();
        let handle = thread::Builder::new()
            .name("pvtd-observer".to_string())
            .spawn(move || {
                if let Err(e) = forward(&config, receiver, &counter) {
                    error!(error = %e, code = e.code(), "Rendezvous forwarding stopped");
                }
            })?;
        Ok(Self {
            sender,
            sent,
            handle,
        })
    }

    /// Cloneable queue handle for request handlers.
    pub fn sender(&self) -> SyncSender<Observation> {
        self.sender.clone()
    }

    pub fn sent(&self) -> Arc<AtomicU64> {
        self.sent.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

fn forward(
    config: &ObserverConfig,
    receiver: Receiver<Observation>,
    sent: &AtomicU64,
) -> HarnessResult<()> {
    let mut peer = RendezvousPeer::connect(&config.address, config.connect_timeout)?
        .with_ack_timeout(config.ack_timeout);
    info!(address = %config.address, pid = config.pid, "Connected to rendezvous driver");

    peer.send_padded(&config.pid.to_string(), MESSAGE_WIDTH)?;
    sent.fetch_add(1, Ordering::Relaxed);

    for observation in receiver {
        debug!(
            source = %observation.source,
            messages = ?observation.messages,
            "Forwarding observation"
        );
        for message in &observation.messages {
            peer.send_padded(message, MESSAGE_WIDTH)?;
            sent.fetch_add(1, Ordering::Relaxed);
        }
    }
    warn!(sent = peer.sent(), "Observation queue closed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pvt_common::RendezvousChannel;

    #[test]
    fn test_pid_then_observations_in_order() {
        let mut channel = RendezvousChannel::bind("127.0.0.1:0")
            .unwrap()
            .with_message_timeout(Duration::from_secs(5));
        let observer = Observer::spawn(ObserverConfig {
            address: channel.local_addr().to_string(),
            connect_timeout: Duration::from_secs(5),
            ack_timeout: Some(Duration::from_secs(5)),
            pid: 4242,
        })
        .unwrap();

        observer
            .sender()
            .send(Observation {
                source: "A/B/C/D_CB".to_string(),
                messages: vec!["10".into(), "2".into(), "1".into()],
            })
            .unwrap();

        for expected in ["4242", "10", "2", "1"] {
            assert_eq!(channel.await_message(expected).unwrap(), expected);
            channel.acknowledge().unwrap();
        }
        assert_eq!(observer.sent().load(Ordering::Relaxed), 4);
        channel.close();
    }

    #[test]
    fn test_unreachable_driver_ends_thread() {
        let observer = Observer::spawn(ObserverConfig {
            // Port 9 on loopback is almost never listening.
            address: "127.0.0.1:9".to_string(),
            connect_timeout: Duration::from_millis(100),
            ack_timeout: None,
            pid: 1,
        })
        .unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !observer.is_finished() && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(observer.is_finished());
        assert_eq!(observer.sent().load(Ordering::Relaxed), 0);
    }
}
