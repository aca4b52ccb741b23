//! Emulated serial links.
//!
//! An [`EmulatedLink`] answers each write with the reply its responder computes and queues the
//! reply bytes in a fake input buffer, so strategies exercise the same `query` path offline as
//! they do against real hardware.

use crate::transport::{Transport, MAX_REPLY_LEN};
use std::collections::VecDeque;
use std::io;

/// Computes the reply to one command, or `None` when the device stays silent.
pub type Responder = Box<dyn FnMut(&[u8]) -> Option<Vec<u8>> + Send>;

/// Transport that answers each written command through a responder closure.
pub struct EmulatedLink {
    name: String,
    buffer: VecDeque<u8>,
    responder: Responder,
}

impl EmulatedLink {
    /// Link called `name` whose replies come from `responder`.
    pub fn new<F>(name: impl Into<String>, responder: F) -> Self
    where
        F: FnMut(&[u8]) -> Option<Vec<u8>> + Send + 'static,
    {
        Self {
            name: name.into(),
            buffer: VecDeque::new(),
            responder: Box::new(responder),
        }
    }
}

impl Transport for EmulatedLink {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if let Some(reply) = (self.responder)(bytes) {
            self.buffer.extend(reply);
        }
        Ok(())
    }

    fn read_until(&mut self, terminator: u8) -> io::Result<Vec<u8>> {
        let mut reply = Vec::new();
        while let Some(byte) = self.buffer.pop_front() {
            reply.push(byte);
            if byte == terminator || reply.len() >= MAX_REPLY_LEN {
                break;
            }
        }
        Ok(reply)
    }

    fn reset_input_buffer(&mut self) -> io::Result<()> {
        self.buffer.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        format!("emulated {}", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replies_are_buffered_until_read() {
        let mut link = EmulatedLink::new("echo", |cmd| {
            (cmd != b"quiet").then(|| [&b"re:"[..], cmd, &b"\n"[..]].concat())
        });
        link.write_all(b"a").unwrap();
        link.write_all(b"quiet").unwrap();
        link.write_all(b"b").unwrap();
        assert_eq!(link.read_line().unwrap(), b"re:a\n");
        link.reset_input_buffer().unwrap();
        assert!(link.read_line().unwrap().is_empty());
        assert_eq!(link.describe(), "emulated echo");
    }
}
