//! Framed transport over a byte stream.

use super::Transport;
use super::codec::{self, DEFAULT_MAX_FRAME_LEN};
use crate::error::TransportError;
use crate::message::Message;
use parking_lot::Mutex;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};

type Closer = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// Frames [`Message`]s over a reader/writer pair.
///
/// Closing runs the optional closer (for sockets: `shutdown(Both)`), which is
/// what unblocks a reader parked in `read`.
pub struct StreamTransport {
    reader: Mutex<BufReader<Box<dyn Read + Send>>>,
    writer: Mutex<BufWriter<Box<dyn Write + Send>>>,
    closer: Mutex<Option<Closer>>,
    closed: AtomicBool,
    max_frame_len: usize,
}

impl StreamTransport {
    /// Wraps a reader and writer. Without a closer, `close` only stops
    /// further sends.
    pub fn new<R, W>(reader: R, writer: W) -> Self
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        Self {
            reader: Mutex::new(BufReader::new(Box::new(reader))),
            writer: Mutex::new(BufWriter::new(Box::new(writer))),
            closer: Mutex::new(None),
            closed: AtomicBool::new(false),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }

    /// Sets the action run on close.
    #[must_use]
    pub fn with_closer(self, closer: impl FnOnce() -> io::Result<()> + Send + 'static) -> Self {
        *self.closer.lock() = Some(Box::new(closer));
        self
    }

    /// Sets the largest accepted inbound frame.
    #[must_use]
    pub fn with_max_frame_len(mut self, max: usize) -> Self {
        self.max_frame_len = max;
        self
    }

    /// Builds a transport over a TCP stream.
    pub fn from_tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(Self::new(reader, writer).with_closer(move || match stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }))
    }

    /// Builds a transport over a Unix domain socket.
    #[cfg(unix)]
    pub fn from_unix(stream: std::os::unix::net::UnixStream) -> io::Result<Self> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Ok(Self::new(reader, writer).with_closer(move || match stream.shutdown(Shutdown::Both) {
            Err(err) if err.kind() != io::ErrorKind::NotConnected => Err(err),
            _ => Ok(()),
        }))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Transport for StreamTransport {
    fn send_message(&self, msg: Message) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock();
        codec::write_frame(&mut *writer, &msg)
    }

    fn recv_message(&self) -> Result<Message, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut reader = self.reader.lock();
        match codec::read_frame(&mut *reader, self.max_frame_len) {
            Err(TransportError::Io(_)) if self.is_closed() => Err(TransportError::Closed),
            other => other,
        }
    }

    fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(closer) = self.closer.lock().take() {
            closer()?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for StreamTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTransport")
            .field("closed", &self.is_closed())
            .field("max_frame_len", &self.max_frame_len)
            .finish()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::message::{Bootstrap, Release};
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn messages_cross_a_socket_pair() {
        let (a, b) = UnixStream::pair().unwrap();
        let left = StreamTransport::from_unix(a).unwrap();
        let right = StreamTransport::from_unix(b).unwrap();
        left.send_message(Message::Bootstrap(Bootstrap { question_id: 2 }))
            .unwrap();
        left.send_message(Message::Release(Release {
            id: 1,
            reference_count: 3,
        }))
        .unwrap();
        assert_eq!(
            right.recv_message().unwrap(),
            Message::Bootstrap(Bootstrap { question_id: 2 })
        );
        assert!(matches!(
            right.recv_message().unwrap(),
            Message::Release(Release { id: 1, .. })
        ));
    }

    #[test]
    fn close_unblocks_a_parked_reader() {
        let (a, _b) = UnixStream::pair().unwrap();
        let transport = Arc::new(StreamTransport::from_unix(a).unwrap());
        let reader = Arc::clone(&transport);
        let handle = thread::spawn(move || reader.recv_message());
        thread::sleep(std::time::Duration::from_millis(20));
        transport.close().unwrap();
        let err = handle.join().unwrap().unwrap_err();
        assert!(err.is_closed(), "{err}");
        assert!(transport.send_message(Message::Unknown(3)).unwrap_err().is_closed());
    }

    #[test]
    fn frame_limit_is_inclusive() {
        let (a, b) = UnixStream::pair().unwrap();
        let left = StreamTransport::from_unix(a).unwrap();
        let right = StreamTransport::from_unix(b).unwrap().with_max_frame_len(4);
        // kind (2 bytes) + [9] (2 bytes): exactly at the limit.
        left.send_message(Message::Bootstrap(Bootstrap { question_id: 9 }))
            .unwrap();
        assert_eq!(
            right.recv_message().unwrap(),
            Message::Bootstrap(Bootstrap { question_id: 9 })
        );
        // kind (2 bytes) + [200] (3 bytes): one past it.
        left.send_message(Message::Bootstrap(Bootstrap { question_id: 200 }))
            .unwrap();
        let err = right.recv_message().unwrap_err();
        assert!(
            matches!(err, TransportError::FrameTooLarge { len: 5, max: 4 }),
            "{err}"
        );
        assert!(err.is_malformed());
    }
}
