//! # rpc
//!
//! why: deliver one outbound request to a peer and collect its single-line reply
//! relations: request lines come from logkv-core's message codec, called by server.rs rounds
//! what: call_line and call_with_payload over one short-lived tcp connection each

use std::io::{self, BufRead, BufReader, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

/// send one request line and read one reply line
///
/// the connection lives for exactly this exchange; `timeout` bounds connect,
/// write and read independently, so a dead peer costs at most a few timeouts
pub fn call_line(addr: &str, line: &str, timeout: Duration) -> io::Result<String> {
    let mut stream = connect(addr, timeout)?;
    stream.write_all(line.as_bytes())?;
    stream.write_all(b"\n")?;
    read_reply(stream)
}

/// send a header line followed by raw payload bytes, then read one reply line
pub fn call_with_payload(
    addr: &str,
    header: &str,
    payload: &[u8],
    timeout: Duration,
) -> io::Result<String> {
    let mut stream = connect(addr, timeout)?;
    stream.write_all(header.as_bytes())?;
    stream.write_all(b"\n")?;
    stream.write_all(payload)?;
    read_reply(stream)
}

fn connect(addr: &str, timeout: Duration) -> io::Result<TcpStream> {
    let sock = addr
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("bad address {addr}")))?;
    let stream = TcpStream::connect_timeout(&sock, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;
    Ok(stream)
}

fn read_reply(stream: TcpStream) -> io::Result<String> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "peer closed without replying",
        ));
    }
    Ok(line.trim_end().to_string())
}
