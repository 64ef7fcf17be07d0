//! # Angle Channel Module
//!
//! One-directional control channel carrying rotation angles from a control process to the
//! rendering process. Messages are small text payloads: a decimal integer for a new angle, or
//! the literal [`STOP_SENTINEL`] which ends the receiving loop.
//!
//! The transport is abstracted by [`MessageSink`] and [`MessageSource`] so the same sender and
//! receiver logic runs over a POSIX message queue ([`crate::mqueue::PosixQueue`]) or over the
//! in-process bounded queue returned by [`memory_channel`].

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use derive_more::Display;
use log::{debug, info, warn};
use serde::Deserialize;

use crate::angle::{in_input_range, RotationAngle};
use crate::error::{Error, Result, SendError};

// -----------------------------------------------------------------------------------------------
// CONSTANTS
// -----------------------------------------------------------------------------------------------

/// Payload which stops the receiver.
pub const STOP_SENTINEL: &str = "exit";

/// Default maximum number of messages in flight.
pub const DEFAULT_CAPACITY: usize = 10;

pub const DEFAULT_MESSAGE_SIZE: usize = 256;

// -----------------------------------------------------------------------------------------------
// TRAITS
// -----------------------------------------------------------------------------------------------

/// Write end of a bounded message transport.
pub trait MessageSink: Send {
    /// Place a payload on the channel without blocking.
    fn try_send(&self, payload: &[u8]) -> std::result::Result<(), SendError>;
}

/// Read end of a bounded message transport.
pub trait MessageSource: Send {
    /// Block until a payload arrives.
    ///
    /// Returns an error if the channel is closed or the receive fails.
    fn receive(&mut self) -> Result<Vec<u8>>;
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// A decoded control message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AngleMessage {
    /// A new rotation angle in degrees
    Angle(i32),

    /// Stop the receiver
    Stop,
}

/// What the receiver does when a payload cannot be decoded.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ReceivePolicy {
    /// End the receiver on the first failed or malformed receive
    #[display(fmt = "terminate")]
    Terminate,

    /// Log and drop malformed payloads, keep receiving
    #[display(fmt = "skip")]
    Skip,
}

/// Why a receiver loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiverExit {
    /// The stop sentinel arrived
    Stopped,

    /// The transport failed or was closed
    Closed,

    /// A malformed payload arrived under [`ReceivePolicy::Terminate`]
    Malformed,
}

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

#[derive(Clone)]
pub struct MemorySink {
    tx: SyncSender<Vec<u8>>,
    message_size: usize,
}

pub struct MemorySource {
    rx: Receiver<Vec<u8>>,
}

/// Typed sender for angle updates.
pub struct AngleSender<S: MessageSink> {
    sink: S,
}

/// Owns the receiver thread and a private sink used to stop it.
pub struct ReceiverHandle {
    join: JoinHandle<ReceiverExit>,
    stop: Box<dyn MessageSink>,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl AngleMessage {
    pub fn encode(&self) -> Vec<u8> {
        match self {
            AngleMessage::Angle(a) => a.to_string().into_bytes(),
            AngleMessage::Stop => STOP_SENTINEL.as_bytes().to_vec(),
        }
    }

    /// Decode a wire payload.
    ///
    /// Trailing NUL bytes and surrounding whitespace are ignored, C writers commonly send them.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(payload);
        let text = text.trim_end_matches('\0').trim();

        if text == STOP_SENTINEL {
            return Ok(AngleMessage::Stop);
        }

        text.parse::<i32>()
            .map(AngleMessage::Angle)
            .map_err(|_| Error::MalformedMessage(text.to_string()))
    }
}

impl Default for ReceivePolicy {
    fn default() -> Self {
        ReceivePolicy::Terminate
    }
}

impl MessageSink for MemorySink {
    fn try_send(&self, payload: &[u8]) -> std::result::Result<(), SendError> {
        if payload.len() > self.message_size {
            return Err(SendError::TooLarge(payload.len()));
        }

        self.tx.try_send(payload.to_vec()).map_err(|e| match e {
            TrySendError::Full(_) => SendError::Full,
            TrySendError::Disconnected(_) => SendError::Disconnected,
        })
    }
}

impl MessageSource for MemorySource {
    fn receive(&mut self) -> Result<Vec<u8>> {
        self.rx
            .recv()
            .map_err(|e| Error::ChannelReceiveError(format!("{}", e)))
    }
}

impl<S: MessageSink> AngleSender<S> {
    pub fn new(sink: S) -> Self {
        Self { sink }
    }

    /// Send a new angle.
    ///
    /// Failures are logged and the update is dropped, there is no retry.
    pub fn send(&self, angle: i32) -> std::result::Result<(), SendError> {
        self.send_message(AngleMessage::Angle(angle))
    }

    pub fn stop(&self) -> std::result::Result<(), SendError> {
        self.send_message(AngleMessage::Stop)
    }

    fn send_message(&self, msg: AngleMessage) -> std::result::Result<(), SendError> {
        match self.sink.try_send(&msg.encode()) {
            Ok(()) => {
                debug!("Sent {:?} on the angle channel", msg);
                Ok(())
            }
            Err(e) => {
                warn!("Dropping {:?}, angle channel send failed: {}", msg, e);
                Err(e)
            }
        }
    }
}

impl ReceiverHandle {
    /// Spawn the receiver thread.
    ///
    /// `stop` must feed the same channel as `source`, it is used by [`ReceiverHandle::shutdown`].
    pub fn spawn<Q, S>(source: Q, stop: S, angle: Arc<RotationAngle>, policy: ReceivePolicy) -> Self
    where
        Q: MessageSource + 'static,
        S: MessageSink + 'static,
    {
        let join = thread::spawn(move || run_receiver(source, &angle, policy));

        Self {
            join,
            stop: Box::new(stop),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Stop the receiver and join it.
    ///
    /// Returns `Ok(None)` if the stop sentinel could not be posted, in which case the thread is
    /// left detached rather than joined.
    pub fn shutdown(self) -> Result<Option<ReceiverExit>> {
        if !self.join.is_finished() {
            if let Err(e) = self.stop.try_send(&AngleMessage::Stop.encode()) {
                if !self.join.is_finished() {
                    warn!("Cannot post stop to the angle receiver ({}), detaching it", e);
                    return Ok(None);
                }
            }
        }

        self.join
            .join()
            .map(Some)
            .map_err(|_| Error::ThreadJoinError)
    }
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

/// Create a bounded in-process transport.
pub fn memory_channel(capacity: usize, message_size: usize) -> (MemorySink, MemorySource) {
    let (tx, rx) = sync_channel(capacity);

    (MemorySink { tx, message_size }, MemorySource { rx })
}

/// Blocking receive loop, updates `angle` until the channel stops.
pub fn run_receiver<Q: MessageSource>(
    mut source: Q,
    angle: &RotationAngle,
    policy: ReceivePolicy,
) -> ReceiverExit {
    info!("Angle receiver waiting for messages ({} policy)", policy);

    let exit = loop {
        let payload = match source.receive() {
            Ok(p) => p,
            Err(e) => {
                warn!("Angle receive failed: {}", e);
                break ReceiverExit::Closed;
            }
        };

        match AngleMessage::decode(&payload) {
            Ok(AngleMessage::Stop) => break ReceiverExit::Stopped,
            Ok(AngleMessage::Angle(a)) if in_input_range(a) => {
                debug!("Received angle {}", a);
                angle.store(a);
            }
            Ok(AngleMessage::Angle(a)) => {
                warn!("Ignoring out of range angle {}", a);
            }
            Err(e) => match policy {
                ReceivePolicy::Terminate => {
                    warn!("{}, stopping the angle receiver", e);
                    break ReceiverExit::Malformed;
                }
                ReceivePolicy::Skip => warn!("{}, skipping", e),
            },
        }
    };

    info!("Angle receiver done ({:?})", exit);

    exit
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use std::time::Duration;

    #[test]
    fn test_codec() {
        assert_eq!(AngleMessage::Angle(-45).encode(), b"-45".to_vec());
        assert_eq!(AngleMessage::decode(b"42").unwrap(), AngleMessage::Angle(42));
        assert_eq!(AngleMessage::decode(b"90\0\0").unwrap(), AngleMessage::Angle(90));
        assert_eq!(AngleMessage::decode(b"exit").unwrap(), AngleMessage::Stop);
        assert!(AngleMessage::decode(b"ninety").is_err());
        assert!(AngleMessage::decode(b"").is_err());
    }

    #[test]
    fn test_bounded_send() {
        let (sink, _source) = memory_channel(2, 8);
        let sender = AngleSender::new(sink);

        assert!(sender.send(1).is_ok());
        assert!(sender.send(2).is_ok());
        assert!(matches!(sender.send(3), Err(SendError::Full)));
    }

    #[test]
    fn test_message_size_limit() {
        let (sink, _source) = memory_channel(2, 2);

        assert!(matches!(sink.try_send(b"123"), Err(SendError::TooLarge(3))));
    }

    #[test]
    fn test_send_unopened() {
        let (sink, source) = memory_channel(2, 8);
        drop(source);

        assert!(matches!(
            AngleSender::new(sink).send(5),
            Err(SendError::Disconnected)
        ));
    }

    #[test]
    fn test_round_trip() {
        let (sink, source) = memory_channel(DEFAULT_CAPACITY, DEFAULT_MESSAGE_SIZE);
        let angle = Arc::new(RotationAngle::new(0));
        let handle =
            ReceiverHandle::spawn(source, sink.clone(), angle.clone(), ReceivePolicy::Terminate);

        let sender = AngleSender::new(sink);
        sender.send(42).unwrap();

        let mut waited = 0;
        while angle.load() != 42 && waited < 1000 {
            thread::sleep(Duration::from_millis(1));
            waited += 1;
        }
        assert_eq!(angle.load(), 42);

        assert_eq!(handle.shutdown().unwrap(), Some(ReceiverExit::Stopped));
    }

    #[test]
    fn test_stop_ends_updates() {
        let (sink, source) = memory_channel(DEFAULT_CAPACITY, DEFAULT_MESSAGE_SIZE);
        let sender = AngleSender::new(sink);
        sender.send(10).unwrap();
        sender.stop().unwrap();
        sender.send(20).unwrap();

        let angle = RotationAngle::new(0);
        assert_eq!(
            run_receiver(source, &angle, ReceivePolicy::Terminate),
            ReceiverExit::Stopped
        );
        assert_eq!(angle.load(), 10);
    }

    #[test]
    fn test_malformed_policies() {
        let (sink, source) = memory_channel(DEFAULT_CAPACITY, DEFAULT_MESSAGE_SIZE);
        sink.try_send(b"garbage").unwrap();
        sink.try_send(b"30").unwrap();
        sink.try_send(b"exit").unwrap();

        let angle = RotationAngle::new(0);
        assert_eq!(
            run_receiver(source, &angle, ReceivePolicy::Terminate),
            ReceiverExit::Malformed
        );
        assert_eq!(angle.load(), 0);

        let (sink, source) = memory_channel(DEFAULT_CAPACITY, DEFAULT_MESSAGE_SIZE);
        sink.try_send(b"garbage").unwrap();
        sink.try_send(b"30").unwrap();
        sink.try_send(b"exit").unwrap();

        assert_eq!(
            run_receiver(source, &angle, ReceivePolicy::Skip),
            ReceiverExit::Stopped
        );
        assert_eq!(angle.load(), 30);
    }

    #[test]
    fn test_out_of_range_dropped() {
        let (sink, source) = memory_channel(DEFAULT_CAPACITY, DEFAULT_MESSAGE_SIZE);
        sink.try_send(b"-90").unwrap();
        sink.try_send(b"720").unwrap();
        drop(sink);

        let angle = RotationAngle::new(0);
        assert_eq!(
            run_receiver(source, &angle, ReceivePolicy::Terminate),
            ReceiverExit::Closed
        );
        assert_eq!(angle.load(), -90);
    }
}
