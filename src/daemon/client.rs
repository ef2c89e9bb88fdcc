//! Client for the daemon's watch stream

use super::protocol::{FrameReader, ReadOutcome, StreamEvent, WatchRequest, decode_ack, decode_frame, write_frame};
use super::{CONNECT_TIMEOUT, DaemonAddr};
use crate::error::{DataError, DataResult};
use crate::types::Message;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a single read blocks before returning [`ReadOutcome::Idle`]
pub const READ_TICK: Duration = Duration::from_millis(200);

/// How long to wait for the daemon to acknowledge a watch request
pub const ACK_TIMEOUT: Duration = Duration::from_secs(5);

enum Stream {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    fn set_timeouts(&self, read: Duration, write: Duration) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => {
                s.set_read_timeout(Some(read))?;
                s.set_write_timeout(Some(write))
            }
            Stream::Tcp(s) => {
                s.set_read_timeout(Some(read))?;
                s.set_write_timeout(Some(write))
            }
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            #[cfg(unix)]
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

fn open_stream(addr: &DaemonAddr, timeout: Duration) -> io::Result<Stream> {
    match addr {
        #[cfg(unix)]
        DaemonAddr::Unix(path) => UnixStream::connect(path).map(Stream::Unix),
        #[cfg(not(unix))]
        DaemonAddr::Unix(_) => Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "unix sockets are not supported on this platform",
        )),
        DaemonAddr::Tcp(raw) => {
            let mut last_err = io::Error::new(io::ErrorKind::NotFound, "address resolved to nothing");
            for sock in raw.to_socket_addrs()? {
                match TcpStream::connect_timeout(&sock, timeout) {
                    Ok(stream) => return Ok(Stream::Tcp(stream)),
                    Err(e) => last_err = e,
                }
            }
            Err(last_err)
        }
    }
}

/// One watch connection to the daemon
pub struct WatchClient {
    addr: DaemonAddr,
    reader: FrameReader<Stream>,
}

impl WatchClient {
    /// Connect without sending anything yet
    pub fn connect(addr: &DaemonAddr) -> DataResult<Self> {
        let stream = open_stream(addr, CONNECT_TIMEOUT)
            .map_err(|e| DataError::Unavailable(format!("connect {}: {}", addr, e)))?;
        stream
            .set_timeouts(READ_TICK, ACK_TIMEOUT)
            .map_err(|e| DataError::Unavailable(format!("configure {}: {}", addr, e)))?;
        debug!(%addr, "connected to daemon");
        Ok(Self {
            addr: addr.clone(),
            reader: FrameReader::new(stream),
        })
    }

    pub fn addr(&self) -> &DaemonAddr {
        &self.addr
    }

    /// Send the watch request and wait for a positive ack
    pub fn watch(&mut self, request: &WatchRequest) -> DataResult<()> {
        self.send(request)?;
        let deadline = Instant::now() + ACK_TIMEOUT;
        loop {
            match self.reader.next_frame()? {
                ReadOutcome::Frame(line) => return decode_ack(&line),
                ReadOutcome::Idle if Instant::now() < deadline => continue,
                ReadOutcome::Idle => {
                    return Err(DataError::Unavailable(format!("{} did not acknowledge watch", self.addr)));
                }
                ReadOutcome::Closed => {
                    return Err(DataError::Unavailable(format!("{} closed before acknowledging", self.addr)));
                }
            }
        }
    }

    fn send(&mut self, request: &WatchRequest) -> DataResult<()> {
        write_frame(self.reader.get_mut(), request)
            .map_err(|e| DataError::Unavailable(format!("write to {}: {}", self.addr, e)))
    }

    /// Next streamed message.
    /// `Ok(None)` means no message arrived within one read tick; a closed stream is an error.
    pub fn next_message(&mut self) -> DataResult<Option<Message>> {
        loop {
            match self.reader.next_frame()? {
                ReadOutcome::Frame(line) => match decode_frame(&line)? {
                    StreamEvent::Message(message) => return Ok(Some(*message)),
                    StreamEvent::KeepAlive => continue,
                },
                ReadOutcome::Idle => return Ok(None),
                ReadOutcome::Closed => {
                    return Err(DataError::Unavailable(format!("{} closed the stream", self.addr)));
                }
            }
        }
    }
}
