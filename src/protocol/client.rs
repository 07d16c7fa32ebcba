use std::io::{Read, Write};

use log::debug;

use crate::xml::XmlNode;

use super::{
    atomic::CancelToken,
    message::{BodyBuilder, Message, MessageError},
    transport::{Channel, Endpoint, ProtocolTransport, TransportError},
};

/// Builds an `<rpc>` request around an already well-formed operation element.
pub fn rpc(username: Option<&str>, operation: &str) -> Result<Message, MessageError> {
    let attributes: Vec<(&str, &str)> = username.map(|u| ("username", u)).into_iter().collect();
    BodyBuilder::new()
        .open_with("rpc", &attributes)
        .raw(operation)
        .build()
}

/// Synchronous request/reply over one stream.
pub struct RpcClient<T> {
    transport: ProtocolTransport<T>,
}

impl<T: Read + Write> RpcClient<T> {
    pub fn new(stream: T) -> Self {
        Self {
            transport: ProtocolTransport::new(stream),
        }
    }

    pub fn with_cancel(stream: T, cancel: CancelToken) -> Self {
        Self {
            transport: ProtocolTransport::with_cancel(stream, cancel),
        }
    }

    /// Sends `msg` and blocks for the reply message.
    ///
    /// A close by the peer before the reply arrives is
    /// [`TransportError::UnexpectedClose`]; the stream should be dropped.
    pub fn request(&mut self, msg: &Message) -> Result<Message, TransportError> {
        self.transport.send_message(msg)?;
        self.transport
            .recv_message()?
            .ok_or(TransportError::UnexpectedClose)
    }

    /// Like [`RpcClient::request`], with the reply parsed.
    pub fn request_reply(&mut self, msg: &Message) -> Result<XmlNode, TransportError> {
        Ok(self.request(msg)?.decode()?)
    }

    pub fn transport_mut(&mut self) -> &mut ProtocolTransport<T> {
        &mut self.transport
    }

    pub fn get_ref(&self) -> &T {
        self.transport.get_ref()
    }

    pub fn into_inner(self) -> T {
        self.transport.into_inner()
    }
}

/// Connects, exchanges a single request and reply, and closes the channel.
pub fn one_shot(endpoint: &Endpoint, msg: &Message) -> Result<XmlNode, TransportError> {
    debug!("send msg on {endpoint}");
    let mut client = RpcClient::new(endpoint.connect()?);
    client.request_reply(msg)
}

/// Like [`one_shot`], but hands the open channel to the caller, for example to
/// keep receiving notifications after a subscription request.
pub fn one_shot_keep_open(
    endpoint: &Endpoint,
    msg: &Message,
) -> Result<(XmlNode, RpcClient<Channel>), TransportError> {
    debug!("send msg on {endpoint}, keeping channel open");
    let mut client = RpcClient::new(endpoint.connect()?);
    let reply = client.request_reply(msg)?;
    Ok((reply, client))
}
