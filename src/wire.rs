use crate::errdata;
use crate::error::Result;

use std::io::{BufRead as _, BufReader, Write as _};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// A line-oriented connection. Every message on the wire is one UTF-8 line
/// terminated by \n; receivers strip a trailing \r. The reader and writer
/// halves wrap independent clones of the socket so a connection can be
/// split() across threads, with writes serialized by the owner.
pub struct Connection {
    reader: LineReader,
    writer: LineWriter,
}

impl Connection {
    /// Dials the given address.
    pub fn connect(addr: impl ToSocketAddrs) -> Result<Self> {
        Self::from_stream(TcpStream::connect(addr)?)
    }

    /// Wraps an accepted or dialed socket.
    pub fn from_stream(stream: TcpStream) -> Result<Self> {
        let reader = LineReader::new(stream.try_clone()?);
        let writer = LineWriter::new(stream);
        Ok(Self { reader, writer })
    }

    /// Splits the connection into its reader and writer halves.
    pub fn split(self) -> (LineReader, LineWriter) {
        (self.reader, self.writer)
    }

    /// Reads one line, stripped of the trailing newline.
    pub fn read_line(&mut self) -> Result<String> {
        self.reader.read_line()
    }

    /// Writes one line, appending the newline.
    pub fn write_line(&mut self, line: impl std::fmt::Display) -> Result<()> {
        self.writer.write_line(line)
    }

    /// Sets or clears the read deadline for subsequent reads.
    pub fn set_read_deadline(&self, deadline: Option<Duration>) -> Result<()> {
        self.reader.set_deadline(deadline)
    }

    /// Sets or clears the write deadline for subsequent writes.
    pub fn set_write_deadline(&self, deadline: Option<Duration>) -> Result<()> {
        self.writer.set_deadline(deadline)
    }

    /// The remote address, mainly for logging.
    pub fn peer_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.writer.inner.peer_addr()?)
    }

    /// Shuts down both halves, failing any blocked or future IO.
    pub fn shutdown(&self) {
        self.writer.shutdown();
    }
}

/// The read half of a line-oriented connection.
pub struct LineReader {
    inner: BufReader<TcpStream>,
}

impl LineReader {
    fn new(stream: TcpStream) -> Self {
        Self { inner: BufReader::new(stream) }
    }

    /// Reads one line. A clean EOF is reported as an error, since every
    /// protocol channel is expected to stay open until torn down.
    pub fn read_line(&mut self) -> Result<String> {
        let mut line = String::new();
        if self.inner.read_line(&mut line)? == 0 {
            return errdata!("connection closed by peer");
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(line)
    }

    /// Sets or clears the read deadline.
    pub fn set_deadline(&self, deadline: Option<Duration>) -> Result<()> {
        Ok(self.inner.get_ref().set_read_timeout(deadline)?)
    }
}

/// The write half of a line-oriented connection. Writes go straight to the
/// socket, one line per call, so no flushing is needed.
pub struct LineWriter {
    inner: TcpStream,
}

impl LineWriter {
    fn new(stream: TcpStream) -> Self {
        Self { inner: stream }
    }

    /// Writes one line, appending the newline.
    pub fn write_line(&mut self, line: impl std::fmt::Display) -> Result<()> {
        Ok(self.inner.write_all(format!("{line}\n").as_bytes())?)
    }

    /// Sets or clears the write deadline.
    pub fn set_deadline(&self, deadline: Option<Duration>) -> Result<()> {
        Ok(self.inner.set_write_timeout(deadline)?)
    }

    /// Clones the writer. Used where a reader thread must also reply on the
    /// channel it reads, e.g. the LFD answering GFD_PING.
    pub fn try_clone(&self) -> Result<Self> {
        Ok(Self { inner: self.inner.try_clone()? })
    }

    /// Shuts down the socket, failing any blocked or future IO on either half.
    pub fn shutdown(&self) {
        let _ = self.inner.shutdown(Shutdown::Both);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::net::TcpListener;

    /// Returns a connected (client, server) connection pair over loopback.
    fn pair() -> (Connection, Connection) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = Connection::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();
        (client, Connection::from_stream(stream).unwrap())
    }

    #[test]
    fn line_roundtrip() {
        let (mut client, mut server) = pair();
        client.write_line("PING").unwrap();
        assert_eq!(server.read_line().unwrap(), "PING");
        server.write_line("PONG").unwrap();
        assert_eq!(client.read_line().unwrap(), "PONG");
    }

    #[test]
    fn read_strips_crlf() {
        let (mut client, mut server) = pair();
        client.write_line("STATE S1 7\r").unwrap();
        assert_eq!(server.read_line().unwrap(), "STATE S1 7");
    }

    #[test]
    fn read_eof_is_error() {
        let (client, mut server) = pair();
        drop(client);
        assert!(server.read_line().is_err());
    }

    #[test]
    fn read_deadline_expires() {
        let (_client, mut server) = pair();
        server.set_read_deadline(Some(Duration::from_millis(20))).unwrap();
        assert!(server.read_line().is_err());
    }
}
