//! One-way event notifications.
//!
//! A notification is an ordinary message whose body is
//! `<notification><event>…</event></notification>`. Nothing in the header marks
//! it as unsolicited, so receivers that share a channel between replies and
//! notifications tell them apart by the root element.
use std::io::Write;

use log::debug;

use super::{
    message::{BodyBuilder, Message, MessageError},
    transport::{ProtocolTransport, TransportError},
};

/// Encodes the notification envelope around `event`.
///
/// `event` is inserted as-is and must be well-formed XML content.
pub fn notification(event: &str) -> Result<Message, MessageError> {
    BodyBuilder::new()
        .open("notification")
        .open("event")
        .raw(event)
        .build()
}

impl<W: Write> ProtocolTransport<W> {
    /// Pushes `event` to the peer without waiting for any reply.
    pub fn notify(&mut self, event: &str) -> Result<(), TransportError> {
        let msg = notification(event)?;
        debug!("notify len={}", msg.total_len());
        self.send_message(&msg)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn envelope_is_fixed() {
        let msg = notification("<netconf-session-end/>").unwrap();

        assert_eq!(
            msg.body_str().unwrap(),
            "<notification><event><netconf-session-end/></event></notification>"
        );
    }

    #[test]
    fn notify_writes_one_message_and_reads_nothing() {
        let mut transport = ProtocolTransport::new(Vec::new());
        transport.notify("link up").unwrap();
        transport.notify("link down").unwrap();

        let wire = transport.into_inner();
        let mut reader = ProtocolTransport::new(Cursor::new(wire));

        let first = reader.recv_message().unwrap().unwrap().decode().unwrap();
        assert_eq!(
            first.find("notification/event").and_then(|e| e.body()),
            Some("link up")
        );
        let second = reader.recv_message().unwrap().unwrap().decode().unwrap();
        assert_eq!(
            second.find("notification/event").and_then(|e| e.body()),
            Some("link down")
        );
        assert_eq!(reader.recv_message().unwrap(), None);
    }
}
