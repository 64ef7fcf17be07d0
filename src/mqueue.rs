//! # POSIX Message Queue Module
//!
//! Named, permissioned, bounded transport for the angle channel. The control process opens the
//! queue for writing and the renderer opens it for reading, both sides create it if it does not
//! exist yet.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::ffi::CString;
use std::io;

use log::debug;

use crate::channel::{MessageSink, MessageSource};
use crate::error::{Error, Result, SendError};

// -----------------------------------------------------------------------------------------------
// DATA STRUCTURES
// -----------------------------------------------------------------------------------------------

/// Attributes used when creating a queue.
#[derive(Debug, Clone)]
pub struct QueueAttributes {
    /// Maximum number of messages in flight
    pub capacity: usize,

    /// Maximum bytes per message
    pub message_size: usize,

    /// Permission bits for a newly created queue
    pub permissions: u32,
}

/// An open POSIX message queue descriptor.
pub struct PosixQueue {
    name: String,
    mqd: libc::mqd_t,
    message_size: usize,
}

// -----------------------------------------------------------------------------------------------
// ENUMERATIONS
// -----------------------------------------------------------------------------------------------

/// Direction a queue is opened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueAccess {
    /// Blocking reads
    Read,

    /// Non-blocking writes, a full queue fails immediately
    Write,
}

// -----------------------------------------------------------------------------------------------
// IMPLEMENTATIONS
// -----------------------------------------------------------------------------------------------

impl Default for QueueAttributes {
    fn default() -> Self {
        Self {
            capacity: crate::channel::DEFAULT_CAPACITY,
            message_size: crate::channel::DEFAULT_MESSAGE_SIZE,
            permissions: 0o664,
        }
    }
}

impl PosixQueue {
    /// Open (creating if needed) the queue called `name`, which must start with `/`.
    pub fn open(name: &str, access: QueueAccess, attrs: &QueueAttributes) -> Result<Self> {
        let open_err = |source| Error::ChannelOpenError {
            name: name.to_string(),
            source,
        };

        let c_name = CString::new(name)
            .map_err(|_| open_err(io::Error::from(io::ErrorKind::InvalidInput)))?;

        // mq_attr carries private padding on some targets, so it cannot be built literally
        let mut attr: libc::mq_attr = unsafe { std::mem::zeroed() };
        attr.mq_maxmsg = attrs.capacity as _;
        attr.mq_msgsize = attrs.message_size as _;

        let flags = libc::O_CREAT
            | match access {
                QueueAccess::Read => libc::O_RDONLY,
                QueueAccess::Write => libc::O_WRONLY | libc::O_NONBLOCK,
            };

        let mqd = unsafe {
            libc::mq_open(
                c_name.as_ptr(),
                flags,
                attrs.permissions as libc::mode_t,
                &mut attr as *mut libc::mq_attr,
            )
        };
        if mqd == -1 {
            return Err(open_err(io::Error::last_os_error()));
        }

        // An existing queue keeps its own attributes, receives must use its real message size
        let mut actual: libc::mq_attr = unsafe { std::mem::zeroed() };
        let message_size = if unsafe { libc::mq_getattr(mqd, &mut actual) } == 0 {
            actual.mq_msgsize as usize
        } else {
            attrs.message_size
        };

        debug!("Opened message queue {} ({:?}, {} byte messages)", name, access, message_size);

        Ok(Self {
            name: name.to_string(),
            mqd,
            message_size,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Remove the queue name from the system, open descriptors stay valid.
    pub fn unlink(name: &str) -> io::Result<()> {
        let c_name =
            CString::new(name).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        if unsafe { libc::mq_unlink(c_name.as_ptr()) } == -1 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

impl MessageSink for PosixQueue {
    fn try_send(&self, payload: &[u8]) -> std::result::Result<(), SendError> {
        if payload.len() > self.message_size {
            return Err(SendError::TooLarge(payload.len()));
        }

        let ret = unsafe {
            libc::mq_send(
                self.mqd,
                payload.as_ptr() as *const libc::c_char,
                payload.len(),
                0,
            )
        };

        if ret == -1 {
            let e = io::Error::last_os_error();
            return Err(match e.raw_os_error() {
                Some(libc::EAGAIN) => SendError::Full,
                Some(libc::EBADF) => SendError::Disconnected,
                _ => SendError::Io(e),
            });
        }

        Ok(())
    }
}

impl MessageSource for PosixQueue {
    fn receive(&mut self) -> Result<Vec<u8>> {
        let mut buffer = vec![0u8; self.message_size];

        let read = unsafe {
            libc::mq_receive(
                self.mqd,
                buffer.as_mut_ptr() as *mut libc::c_char,
                buffer.len(),
                std::ptr::null_mut(),
            )
        };
        if read < 0 {
            return Err(Error::ChannelReceiveError(format!(
                "mq_receive: {}",
                io::Error::last_os_error()
            )));
        }

        buffer.truncate(read as usize);

        Ok(buffer)
    }
}

impl Drop for PosixQueue {
    fn drop(&mut self) {
        unsafe {
            libc::mq_close(self.mqd);
        }
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {

    use super::*;
    use crate::channel::{AngleMessage, AngleSender};

    /// POSIX queues need the mqueue filesystem, which some sandboxes lack.
    fn open_pair(name: &str) -> Option<(PosixQueue, PosixQueue)> {
        let attrs = QueueAttributes {
            capacity: 4,
            ..Default::default()
        };
        let reader = PosixQueue::open(name, QueueAccess::Read, &attrs).ok()?;
        let writer = PosixQueue::open(name, QueueAccess::Write, &attrs).ok()?;

        Some((reader, writer))
    }

    #[test]
    fn test_posix_round_trip() {
        let name = format!("/camrot-test-{}", std::process::id());
        let (mut reader, writer) = match open_pair(&name) {
            Some(p) => p,
            None => return,
        };
        let _ = PosixQueue::unlink(&name);

        let sender = AngleSender::new(writer);
        sender.send(42).unwrap();
        sender.stop().unwrap();

        assert_eq!(
            AngleMessage::decode(&reader.receive().unwrap()).unwrap(),
            AngleMessage::Angle(42)
        );
        assert_eq!(
            AngleMessage::decode(&reader.receive().unwrap()).unwrap(),
            AngleMessage::Stop
        );
    }

    #[test]
    fn test_posix_full() {
        let name = format!("/camrot-full-{}", std::process::id());
        let (_reader, writer) = match open_pair(&name) {
            Some(p) => p,
            None => return,
        };
        let _ = PosixQueue::unlink(&name);

        for a in 0..4 {
            writer.try_send(a.to_string().as_bytes()).unwrap();
        }
        assert!(matches!(writer.try_send(b"5"), Err(SendError::Full)));
    }
}
