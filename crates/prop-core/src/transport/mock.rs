//! Mock transport for testing.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::traits::{PacketTransport, TransportError};

type Responder = Box<dyn FnMut(&[u8]) -> Vec<Vec<u8>> + Send>;

/// Mock transport for unit testing protocol logic.
#[derive(Clone)]
pub struct MockTransport {
    /// Queued replies returned on read.
    reply_queue: Arc<Mutex<VecDeque<Vec<u8>>>>,
    /// Captured writes.
    write_log: Arc<Mutex<Vec<Vec<u8>>>>,
    /// Computes replies from each write.
    responder: Arc<Mutex<Option<Responder>>>,
    /// Whether the peer is "connected".
    connected: Arc<Mutex<bool>>,
    closed: Arc<Mutex<bool>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            reply_queue: Arc::new(Mutex::new(VecDeque::new())),
            write_log: Arc::new(Mutex::new(Vec::new())),
            responder: Arc::new(Mutex::new(None)),
            connected: Arc::new(Mutex::new(true)),
            closed: Arc::new(Mutex::new(false)),
        }
    }

    /// Queue a reply to be returned on the next read.
    pub fn queue_reply(&self, bytes: &[u8]) {
        self.reply_queue.lock().unwrap().push_back(bytes.to_vec());
    }

    /// React to every write with zero or more replies.
    pub fn set_responder<F>(&self, responder: F)
    where
        F: FnMut(&[u8]) -> Vec<Vec<u8>> + Send + 'static,
    {
        *self.responder.lock().unwrap() = Some(Box::new(responder));
    }

    /// Get all captured writes.
    pub fn get_writes(&self) -> Vec<Vec<u8>> {
        self.write_log.lock().unwrap().clone()
    }

    /// Simulate the peer dropping the connection.
    pub fn disconnect(&self) {
        *self.connected.lock().unwrap() = false;
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock().unwrap()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketTransport for MockTransport {
    fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::WriteFailed("connection reset".into()));
        }
        self.write_log.lock().unwrap().push(data.to_vec());
        if let Some(responder) = self.responder.lock().unwrap().as_mut() {
            let replies = responder(data);
            self.reply_queue.lock().unwrap().extend(replies);
        }
        Ok(data.len())
    }

    fn recv_timeout(&self, max_len: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        if !*self.connected.lock().unwrap() {
            return Err(TransportError::Closed);
        }
        let mut reply = self
            .reply_queue
            .lock()
            .unwrap()
            .pop_front()
            .ok_or(TransportError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            })?;
        reply.truncate(max_len);
        Ok(reply)
    }

    fn close(&self) -> Result<(), TransportError> {
        *self.closed.lock().unwrap() = true;
        Ok(())
    }
}
