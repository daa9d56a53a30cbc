//! A debugger connection speaking the remote serial protocol
//!
//! [`GdbConnection`] owns both halves of a byte transport. It handles packet
//! acknowledgement and the protocol-only packets (feature negotiation, ack
//! mode, `qAttached` and friends) itself, and hands everything else to the
//! caller as a decoded [`Request`].

use std::io::{BufRead, Write};

use eyre::{Context, Result};

use crate::error::PacketError;
use crate::io::GdbTransport;
use crate::packet::{self, Frame, MAX_PACKET_SIZE};
use crate::requests::{self, Packet, ProtocolPacket, Request};
use crate::responses::{Reply, StopNotification};
use crate::types::DetachReason;

/// The controller's view of a debugger connection
pub trait DebuggerConnection {
    /// Block until the next request arrives
    ///
    /// A closed or broken connection is reported as
    /// `Request::Detach(DetachReason::ConnectionLost)`.
    fn receive_request(&mut self) -> Result<Request>;

    fn send_reply(&mut self, reply: Reply) -> Result<()>;

    /// Report that execution halted, or answer a stop reason query
    fn notify_stop(&mut self, stop: StopNotification) -> Result<()>;
}

/// Optional protocol features offered to the debugger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Features {
    /// Advertise `ReverseContinue+` and `ReverseStep+`
    pub reverse_execution: bool,
}

pub struct GdbConnection<R, W> {
    input: R,
    output: W,
    features: Features,
    no_ack: bool,
}

impl<R, W> GdbConnection<R, W>
where
    R: BufRead,
    W: Write,
{
    pub fn new(input: R, output: W, features: Features) -> Self {
        Self {
            input,
            output,
            features,
            no_ack: false,
        }
    }

    fn write_packet(&mut self, payload: &[u8]) -> Result<()> {
        tracing::trace!(payload = %String::from_utf8_lossy(payload), "sending packet");
        self.output
            .write_all(&packet::encode(payload))
            .context("writing packet")?;
        self.output.flush().context("flushing packet")
    }

    fn write_ack(&mut self, ok: bool) -> Result<()> {
        if self.no_ack {
            return Ok(());
        }
        self.output
            .write_all(if ok { b"+" } else { b"-" })
            .context("writing acknowledgement")?;
        self.output.flush().context("flushing acknowledgement")
    }

    fn supported_features(&self) -> String {
        let mut features = format!(
            "PacketSize={MAX_PACKET_SIZE:x};QStartNoAckMode+;qXfer:auxv:read+;\
             qXfer:siginfo:read+;qXfer:siginfo:write+;multiprocess+;swbreak+;\
             ConditionalBreakpoints-"
        );
        if self.features.reverse_execution {
            features.push_str(";ReverseContinue+;ReverseStep+");
        }
        features
    }

    /// Answer a protocol-only packet
    fn handle_protocol_packet(&mut self, packet: ProtocolPacket) -> Result<()> {
        match packet {
            ProtocolPacket::Supported => {
                let features = self.supported_features();
                self.write_packet(features.as_bytes())
            }
            ProtocolPacket::StartNoAckMode => {
                // The OK is still acknowledged; acks stop after it
                self.write_packet(b"OK")?;
                self.no_ack = true;
                Ok(())
            }
            ProtocolPacket::Attached => self.write_packet(b"1"),
            ProtocolPacket::Symbol => self.write_packet(b"OK"),
            ProtocolPacket::VContQuery => self.write_packet(b"vCont;c;C;s;S"),
            ProtocolPacket::ThreadListContinue => self.write_packet(b"l"),
            ProtocolPacket::Unsupported(packet) => {
                tracing::debug!(%packet, "unsupported packet");
                self.write_packet(b"")
            }
        }
    }

    fn next_request(&mut self) -> Result<Option<Request>> {
        loop {
            let frame = match packet::read_frame(&mut self.input) {
                Ok(Some(frame)) => frame,
                Ok(None) => return Ok(None),
                Err(PacketError::TooLarge(max)) => {
                    tracing::warn!(max, "dropping oversized packet");
                    self.write_ack(true)?;
                    self.write_packet(&Reply::error().encode())?;
                    continue;
                }
                Err(PacketError::InvalidChecksum) => {
                    tracing::warn!("packet checksum is not hex");
                    self.write_ack(false)?;
                    continue;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to read packet");
                    return Ok(None);
                }
            };

            match frame {
                Frame::Ack => continue,
                Frame::Nack => {
                    tracing::debug!("debugger rejected our last packet");
                    continue;
                }
                Frame::Interrupt => return Ok(Some(Request::Interrupt)),
                Frame::Packet {
                    payload,
                    checksum_ok,
                } => {
                    self.write_ack(checksum_ok)?;
                    if !checksum_ok {
                        continue;
                    }
                    tracing::trace!(payload = %String::from_utf8_lossy(&payload), "received packet");
                    match requests::parse(&payload) {
                        Ok(Packet::Request(request)) => return Ok(Some(request)),
                        Ok(Packet::Protocol(packet)) => self.handle_protocol_packet(packet)?,
                        Err(e) => {
                            tracing::warn!(error = %e, "could not decode packet");
                            self.write_packet(&Reply::error().encode())?;
                        }
                    }
                }
            }
        }
    }
}

impl<R, W> DebuggerConnection for GdbConnection<R, W>
where
    R: BufRead,
    W: Write,
{
    fn receive_request(&mut self) -> Result<Request> {
        match self.next_request() {
            Ok(Some(request)) => {
                tracing::debug!(?request, "received request");
                Ok(request)
            }
            Ok(None) => {
                tracing::info!("debugger connection closed");
                Ok(Request::Detach(DetachReason::ConnectionLost))
            }
            Err(e) => {
                tracing::warn!(error = %e, "debugger connection failed");
                Ok(Request::Detach(DetachReason::ConnectionLost))
            }
        }
    }

    fn send_reply(&mut self, reply: Reply) -> Result<()> {
        tracing::debug!(?reply, "sending reply");
        self.write_packet(&reply.encode())
            .wrap_err("sending reply")
    }

    fn notify_stop(&mut self, stop: StopNotification) -> Result<()> {
        tracing::debug!(?stop, "sending stop notification");
        self.write_packet(&stop.encode())
            .wrap_err("sending stop notification")
    }
}

/// Open a connection over any [`GdbTransport`]
pub fn connect<T>(
    transport: T,
    features: Features,
) -> Result<GdbConnection<T::Reader, T::Writer>>
where
    T: GdbTransport,
{
    let (input, output) = transport.split().context("splitting transport")?;
    Ok(GdbConnection::new(input, output, features))
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;
    use crate::types::{ResumeKind, ResumeRequest};

    fn connection(input: &[u8], features: Features) -> GdbConnection<Cursor<Vec<u8>>, Vec<u8>> {
        GdbConnection::new(Cursor::new(input.to_vec()), Vec::new(), features)
    }

    fn written(connection: &GdbConnection<Cursor<Vec<u8>>, Vec<u8>>) -> String {
        String::from_utf8(connection.output.clone()).unwrap()
    }

    #[test]
    fn acknowledges_and_decodes_requests() {
        let mut conn = connection(b"$g#67", Features::default());
        assert_eq!(conn.receive_request().unwrap(), Request::GetRegs);
        assert_eq!(written(&conn), "+");
    }

    #[test]
    fn nacks_bad_checksum_and_reads_retransmission() {
        let mut conn = connection(b"$g#00$g#67", Features::default());
        assert_eq!(conn.receive_request().unwrap(), Request::GetRegs);
        assert_eq!(written(&conn), "-+");
    }

    #[test]
    fn reverse_features_only_when_enabled() {
        let mut conn = connection(b"$qSupported#37", Features::default());
        conn.receive_request().unwrap();
        assert!(!written(&conn).contains("ReverseContinue+"));

        let mut conn = connection(
            b"$qSupported#37",
            Features {
                reverse_execution: true,
            },
        );
        conn.receive_request().unwrap();
        let out = written(&conn);
        assert!(out.contains("ReverseContinue+;ReverseStep+"));
        assert!(out.contains("PacketSize=4000"));
    }

    #[test]
    fn no_ack_mode_stops_acknowledgements() {
        let input = [
            packet::encode(b"QStartNoAckMode"),
            packet::encode(b"c"),
        ]
        .concat();
        let mut conn = connection(&input, Features::default());
        assert_eq!(
            conn.receive_request().unwrap(),
            Request::Resume(ResumeRequest::forward(ResumeKind::Continue))
        );
        assert_eq!(written(&conn), "+$OK#9a");
    }

    #[test]
    fn malformed_packets_get_an_error_reply() {
        let input = [packet::encode(b"m1000"), packet::encode(b"?")].concat();
        let mut conn = connection(&input, Features::default());
        assert_eq!(conn.receive_request().unwrap(), Request::GetStopReason);
        assert_eq!(written(&conn), "+$E01#a6+");
    }

    #[test]
    fn oversized_packet_is_refused_and_reading_resumes() {
        let oversized = packet::encode(&vec![b'0'; MAX_PACKET_SIZE + 16]);
        let input = [oversized, packet::encode(b"g")].concat();
        let mut conn = connection(&input, Features::default());
        assert_eq!(conn.receive_request().unwrap(), Request::GetRegs);
        assert_eq!(written(&conn), "+$E01#a6+");
    }

    #[test]
    fn non_hex_checksum_is_nacked_and_reading_resumes() {
        let input = [b"$g#zz".to_vec(), packet::encode(b"g")].concat();
        let mut conn = connection(&input, Features::default());
        assert_eq!(conn.receive_request().unwrap(), Request::GetRegs);
        assert_eq!(written(&conn), "-+");
    }

    #[test]
    fn end_of_stream_is_connection_loss() {
        let mut conn = connection(b"", Features::default());
        assert_eq!(
            conn.receive_request().unwrap(),
            Request::Detach(DetachReason::ConnectionLost)
        );
    }

    #[test]
    fn interrupt_byte() {
        let mut conn = connection(b"\x03", Features::default());
        assert_eq!(conn.receive_request().unwrap(), Request::Interrupt);
    }
}
