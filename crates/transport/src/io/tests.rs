//! Tests for transport implementations

use super::*;

#[test]
fn test_tcp_transport_implements_trait() {
    // Compile-time verification that TcpTransport implements GdbTransport
    fn _assert_impl<T: GdbTransport>() {}
    _assert_impl::<TcpTransport>();
}

#[test]
fn test_memory_transport_implements_trait() {
    fn _assert_impl<T: GdbTransport>() {}
    _assert_impl::<InMemoryTransport>();
}

#[test]
fn test_listener_accepts_loopback_connection() -> eyre::Result<()> {
    use std::io::{Read, Write};

    let listener = GdbListener::bind("127.0.0.1", None)?;
    let port = listener.port()?;
    let client = std::thread::spawn(move || -> std::io::Result<Vec<u8>> {
        let mut stream = std::net::TcpStream::connect(("127.0.0.1", port))?;
        stream.write_all(b"+")?;
        let mut buf = vec![0u8; 2];
        stream.read_exact(&mut buf)?;
        Ok(buf)
    });

    let transport = listener.accept()?;
    let (mut reader, mut writer) = transport.split()?;
    let mut ack = [0u8; 1];
    reader.read_exact(&mut ack)?;
    assert_eq!(&ack, b"+");
    writer.write_all(b"OK")?;

    let received = client.join().expect("client thread panicked")?;
    assert_eq!(received, b"OK");
    Ok(())
}
