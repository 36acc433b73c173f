//! Helpers shared by the socket tests.
use std::{
    io::Read,
    net::TcpStream,
    thread,
    time::{Duration, Instant},
};

const WAIT: Duration = Duration::from_secs(5);

/// A request frame with a GameMaker style 12 byte header.
pub(crate) fn frame(tag: u16, code: u8) -> Vec<u8> {
    let mut bytes = vec![0xDE, 0xC0, 0xAD, 0xDE, 12, 0, 0, 0, 3, 0, 0, 0];
    bytes.extend(tag.to_le_bytes());
    bytes.push(code);
    bytes
}

/// Reads `[u16 tag][u8 opcode][u16 length][string][NUL]` off the socket.
pub(crate) fn read_identity(client: &mut TcpStream) -> (u16, u8, u16, String) {
    client.set_read_timeout(Some(WAIT)).unwrap();

    let mut head = [0; 5];
    client.read_exact(&mut head).unwrap();
    let len = u16::from_le_bytes([head[3], head[4]]);

    let mut body = vec![0; len as usize];
    client.read_exact(&mut body).unwrap();
    assert_eq!(body.pop(), Some(0), "missing terminator");

    (
        u16::from_le_bytes([head[0], head[1]]),
        head[2],
        len,
        String::from_utf8(body).unwrap(),
    )
}

/// Polls `cond` until it holds or a few seconds pass.
pub(crate) fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}
