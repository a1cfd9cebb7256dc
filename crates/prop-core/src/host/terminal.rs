//! Interactive terminal over the bridge's serial port.
//!
//! Keyboard input goes to the target, target output goes to the screen.
//! Typing ESC ends the session.

use std::io::{Read, Write};
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::transport::{PacketTransport, TransportError};

/// Key that ends a terminal session.
pub const ESCAPE: u8 = 0x1B;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const READ_CHUNK: usize = 1024;

/// Relay `input` to `transport` and `transport` to `output` until ESC
/// appears in the input, the input ends or the bridge closes the connection.
pub fn relay<T, R, W>(transport: &T, input: R, mut output: W) -> Result<(), TransportError>
where
    T: PacketTransport,
    R: Read + Send + 'static,
    W: Write,
{
    let keys = spawn_reader(input);

    loop {
        loop {
            match keys.try_recv() {
                Ok(chunk) => match chunk.iter().position(|&b| b == ESCAPE) {
                    Some(pos) => {
                        if pos > 0 {
                            transport.send(&chunk[..pos])?;
                        }
                        info!("Escape typed, leaving terminal");
                        return Ok(());
                    }
                    None => {
                        transport.send(&chunk)?;
                    }
                },
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    debug!("Terminal input ended");
                    return Ok(());
                }
            }
        }

        match transport.recv_some(READ_CHUNK, POLL_INTERVAL) {
            Ok(bytes) => {
                output.write_all(&bytes)?;
                output.flush()?;
            }
            Err(TransportError::Timeout { .. }) => {}
            Err(TransportError::Closed) => {
                info!("Bridge closed the terminal connection");
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
}

/// Read `input` on a detached thread. The thread may outlive the session
/// while it is blocked on a read.
fn spawn_reader<R: Read + Send + 'static>(mut input: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = [0u8; 256];
        loop {
            match input.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if tx.send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
    });
    rx
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{MockTransport, TcpTransport};
    use std::io::Cursor;
    use std::net::TcpListener;

    /// Input that never produces data within the test's lifetime.
    struct Idle;

    impl Read for Idle {
        fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
            thread::sleep(Duration::from_secs(5));
            Ok(0)
        }
    }

    #[test]
    fn test_escape_ends_session() {
        let mock = MockTransport::new();
        let mut output = Vec::new();
        relay(&mock, Cursor::new(b"hi\x1b ignored".to_vec()), &mut output).unwrap();
        assert_eq!(mock.get_writes(), vec![b"hi".to_vec()]);
        assert!(output.is_empty());
    }

    #[test]
    fn test_target_output_reaches_screen() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            sock.write_all(b"hello").unwrap();
        });

        let transport = TcpTransport::connect("127.0.0.1", port).unwrap();
        let mut output = Vec::new();
        relay(&transport, Idle, &mut output).unwrap();
        server.join().unwrap();
        assert_eq!(output, b"hello");
    }

    #[test]
    fn test_closed_input_ends_session() {
        let mock = MockTransport::new();
        let mut output = Vec::new();
        relay(&mock, Cursor::new(Vec::new()), &mut output).unwrap();
        assert!(mock.get_writes().is_empty());
    }
}
