use std::time::Duration;

use bytes::Bytes;

use rkv_common::messages::{encode_message, RpbDelReq};
use rkv_common::{Frame, MessageCode};

use super::{attempts_accessors, bucket_type_bytes, check_tries, require, timeout_millis};
use crate::command::{Attempts, Command, Decoded, Reply, ResponseHandle};
use crate::error::{ClientError, ClientResult};

/// Deletes the value under a key. Resolves to `true` once the server
/// acknowledges.
#[derive(Debug)]
pub struct DeleteValue {
    request: RpbDelReq,
    reply: Reply<bool>,
    attempts: Attempts,
}

impl DeleteValue {
    pub fn builder(bucket: impl Into<String>, key: impl Into<String>) -> DeleteValueBuilder {
        DeleteValueBuilder {
            bucket: bucket.into(),
            key: key.into(),
            ..Default::default()
        }
    }
}

/// Options for `DeleteValue`.
#[derive(Debug, Default)]
pub struct DeleteValueBuilder {
    bucket_type: Option<String>,
    bucket: String,
    key: String,
    vclock: Option<Bytes>,
    rw: Option<u32>,
    r: Option<u32>,
    w: Option<u32>,
    pr: Option<u32>,
    pw: Option<u32>,
    dw: Option<u32>,
    timeout: Option<Duration>,
    client_timeout: Option<Duration>,
    tries: Option<u32>,
}

impl DeleteValueBuilder {
    pub fn bucket_type(mut self, bucket_type: impl Into<String>) -> Self {
        self.bucket_type = Some(bucket_type.into());
        self
    }

    pub fn vclock(mut self, vclock: impl Into<Bytes>) -> Self {
        self.vclock = Some(vclock.into());
        self
    }

    pub fn rw(mut self, rw: u32) -> Self {
        self.rw = Some(rw);
        self
    }

    pub fn r(mut self, r: u32) -> Self {
        self.r = Some(r);
        self
    }

    pub fn w(mut self, w: u32) -> Self {
        self.w = Some(w);
        self
    }

    pub fn pr(mut self, pr: u32) -> Self {
        self.pr = Some(pr);
        self
    }

    pub fn pw(mut self, pw: u32) -> Self {
        self.pw = Some(pw);
        self
    }

    pub fn dw(mut self, dw: u32) -> Self {
        self.dw = Some(dw);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = Some(timeout);
        self
    }

    pub fn tries(mut self, tries: u32) -> Self {
        self.tries = Some(tries);
        self
    }

    pub fn build(self) -> ClientResult<(DeleteValue, ResponseHandle<bool>)> {
        require("bucket", &self.bucket)?;
        require("key", &self.key)?;
        check_tries(self.tries)?;

        let request = RpbDelReq {
            bucket: self.bucket.into_bytes(),
            key: self.key.into_bytes(),
            rw: self.rw,
            vclock: self.vclock.map(|v| v.to_vec()),
            r: self.r,
            w: self.w,
            pr: self.pr,
            pw: self.pw,
            dw: self.dw,
            timeout: timeout_millis(self.timeout),
            r#type: bucket_type_bytes(&self.bucket_type),
        };
        let (reply, handle) = Reply::channel();
        Ok((
            DeleteValue {
                request,
                reply,
                attempts: Attempts {
                    remaining: self.tries,
                    timeout: self.client_timeout,
                },
            },
            handle,
        ))
    }
}

impl Command for DeleteValue {
    fn name(&self) -> &'static str {
        "DeleteValue"
    }

    fn request_code(&self) -> MessageCode {
        MessageCode::DelReq
    }

    fn response_code(&self) -> MessageCode {
        MessageCode::DelResp
    }

    fn encode_request(&self) -> Bytes {
        encode_message(&self.request)
    }

    fn decode(&mut self, _frame: Frame) -> ClientResult<Decoded> {
        self.reply.send(Ok(true));
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
    use prost::Message;

    #[tokio::test]
    async fn acknowledgement_resolves_true() {
        let (mut delete, response) = DeleteValue::builder("b", "k").build().unwrap();
        delete.decode(Frame::empty(MessageCode::DelResp)).unwrap();
        assert!(response.await.unwrap());
    }

    #[test]
    fn request_carries_vclock_and_quorum() {
        let (delete, _response) = DeleteValue::builder("b", "k").vclock("vc").rw(2).build().unwrap();
        let req = RpbDelReq::decode(delete.encode_request()).unwrap();
        assert_eq!(req.vclock, Some(b"vc".to_vec()));
        assert_eq!(req.rw, Some(2));
        assert_eq!(req.r#type, None);
    }
}
