use std::time::Duration;

use bytes::Bytes;

use rkv_common::{Frame, MessageCode};

use super::attempts_accessors;
use crate::command::{Attempts, Command, Decoded, Reply, ResponseHandle};
use crate::error::{ClientError, ClientResult};

/// Checks that some node answers.
#[derive(Debug)]
pub struct Ping {
    reply: Reply<()>,
    attempts: Attempts,
}

impl Ping {
    pub fn new() -> (Self, ResponseHandle<()>) {
        let (reply, handle) = Reply::channel();
        (
            Ping {
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

impl Command for Ping {
    fn name(&self) -> &'static str {
        "Ping"
    }

    fn request_code(&self) -> MessageCode {
        MessageCode::PingReq
    }

    fn response_code(&self) -> MessageCode {
        MessageCode::PingResp
    }

    fn encode_request(&self) -> Bytes {
        Bytes::new()
    }

    fn decode(&mut self, _frame: Frame) -> ClientResult<Decoded> {
        self.reply.send(Ok(()));
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn any_ping_reply_completes() {
        let (mut ping, response) = Ping::new();
        let decoded = ping.decode(Frame::empty(MessageCode::PingResp)).unwrap();
        assert_eq!(decoded, Decoded::Complete);
        response.await.unwrap();
    }

    #[tokio::test]
    async fn failure_reaches_handle() {
        let (ping, response) = Ping::new();
        Box::new(ping).on_transport_error(ClientError::Closed);
        assert!(matches!(response.await, Err(ClientError::Closed)));
    }

    #[test]
    fn tries_are_at_least_one() {
        let (ping, _response) = Ping::new();
        assert_eq!(ping.with_tries(0).remaining_tries(), Some(1));
    }
}
