//! In-memory transport for tests
//!
//! Each direction is a channel of byte chunks. A chunk boundary carries no
//! meaning: packets may arrive split across writes or several to a write,
//! exactly as they would over a socket.

use std::io::{self, BufRead, Read, Write};

use crossbeam_channel::{Receiver, Sender};

use super::GdbTransport;

/// One end of an in-memory connection
///
/// ```
/// use std::io::Write;
/// use transport::io::{GdbTransport, InMemoryTransport};
///
/// let (gdb, server) = InMemoryTransport::pair();
/// let (_reader, mut writer) = gdb.split()?;
/// writer.write_all(b"$?#3f")?;
/// # drop(server);
/// # Ok::<(), eyre::Error>(())
/// ```
pub struct InMemoryTransport {
    reader: InMemoryReader,
    writer: InMemoryWriter,
}

/// Receiving half; blocks until the peer writes or hangs up
pub struct InMemoryReader {
    chunk: Vec<u8>,
    consumed: usize,
    rx: Receiver<Vec<u8>>,
}

/// Sending half; dropping it is a hang-up
pub struct InMemoryWriter {
    tx: Sender<Vec<u8>>,
}

fn pipe() -> (InMemoryWriter, InMemoryReader) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (
        InMemoryWriter { tx },
        InMemoryReader {
            chunk: Vec::new(),
            consumed: 0,
            rx,
        },
    )
}

impl InMemoryTransport {
    /// Two connected ends: bytes written to one are read from the other
    pub fn pair() -> (Self, Self) {
        let (to_b, from_a) = pipe();
        let (to_a, from_b) = pipe();
        (
            Self {
                reader: from_b,
                writer: to_b,
            },
            Self {
                reader: from_a,
                writer: to_a,
            },
        )
    }
}

impl GdbTransport for InMemoryTransport {
    type Reader = InMemoryReader;
    type Writer = InMemoryWriter;

    fn split(self) -> eyre::Result<(Self::Reader, Self::Writer)> {
        Ok((self.reader, self.writer))
    }
}

impl BufRead for InMemoryReader {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while self.consumed >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.consumed = 0;
                }
                // Peer hung up
                Err(_) => return Ok(&[]),
            }
        }
        Ok(&self.chunk[self.consumed..])
    }

    fn consume(&mut self, amt: usize) {
        self.consumed = (self.consumed + amt).min(self.chunk.len());
    }
}

impl Read for InMemoryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl Write for InMemoryWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.tx
            .send(buf.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer hung up"))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{self, Frame};

    #[test]
    fn test_frame_split_across_writes() -> eyre::Result<()> {
        let (gdb, server) = InMemoryTransport::pair();
        let (_, mut gdb_writer) = gdb.split()?;
        let (mut server_reader, _) = server.split()?;

        let encoded = packet::encode(b"m1000,4");
        let (head, tail) = encoded.split_at(3);
        gdb_writer.write_all(head)?;
        gdb_writer.write_all(tail)?;
        gdb_writer.write_all(&[0x03])?;

        assert_eq!(
            packet::read_frame(&mut server_reader)?,
            Some(Frame::Packet {
                payload: b"m1000,4".to_vec(),
                checksum_ok: true
            })
        );
        assert_eq!(
            packet::read_frame(&mut server_reader)?,
            Some(Frame::Interrupt)
        );
        Ok(())
    }

    #[test]
    fn test_hang_up_is_eof() -> eyre::Result<()> {
        let (gdb, server) = InMemoryTransport::pair();
        let (mut reader, _writer) = gdb.split()?;
        let (_, mut server_writer) = server.split()?;

        server_writer.write_all(b"+$OK#9a")?;
        drop(server_writer);

        let mut all = Vec::new();
        reader.read_to_end(&mut all)?;
        assert_eq!(all, b"+$OK#9a");
        assert!(reader.fill_buf()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_write_after_hang_up_fails() -> eyre::Result<()> {
        let (gdb, server) = InMemoryTransport::pair();
        let (_, mut writer) = gdb.split()?;
        drop(server);

        let err = writer.write_all(b"$g#67").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        Ok(())
    }
}
