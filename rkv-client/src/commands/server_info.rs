use std::time::Duration;

use bytes::Bytes;
use prost::Message;

use rkv_common::messages::RpbGetServerInfoResp;
use rkv_common::{Frame, MessageCode};

use super::{attempts_accessors, lossy};
use crate::command::{Attempts, Command, Decoded, Reply, ResponseHandle};
use crate::error::{ClientError, ClientResult};

/// Server node name and version.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerInfo {
    pub node: String,
    pub server_version: String,
}

/// Asks a node who it is.
#[derive(Debug)]
pub struct FetchServerInfo {
    reply: Reply<ServerInfo>,
    attempts: Attempts,
}

impl FetchServerInfo {
    pub fn new() -> (Self, ResponseHandle<ServerInfo>) {
        let (reply, handle) = Reply::channel();
        (
            FetchServerInfo {
                reply,
                attempts: Attempts::default(),
            },
            handle,
        )
    }

    pub fn with_tries(mut self, tries: u32) -> Self {
        self.attempts.remaining = Some(tries.max(1));
        self
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.attempts.timeout = Some(timeout);
        self
    }
}

impl Command for FetchServerInfo {
    fn name(&self) -> &'static str {
        "FetchServerInfo"
    }

    fn request_code(&self) -> MessageCode {
        MessageCode::GetServerInfoReq
    }

    fn response_code(&self) -> MessageCode {
        MessageCode::GetServerInfoResp
    }

    fn encode_request(&self) -> Bytes {
        Bytes::new()
    }

    fn decode(&mut self, frame: Frame) -> ClientResult<Decoded> {
        let resp = RpbGetServerInfoResp::decode(frame.payload)?;
        self.reply.send(Ok(ServerInfo {
            node: resp.node.as_deref().map(lossy).unwrap_or_default(),
            server_version: resp.server_version.as_deref().map(lossy).unwrap_or_default(),
        }));
        Ok(Decoded::Complete)
    }

    fn on_protocol_error(mut self: Box<Self>, error: ClientError) {
        self.reply.send(Err(error));
    }

    fn on_transport_error(mut self: Box<Self>, error: ClientError) {
        self.reply.send(Err(error));
    }

    fn is_cancelled(&self) -> bool {
        self.reply.is_closed()
    }

    attempts_accessors!();
}
