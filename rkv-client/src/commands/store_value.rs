use std::time::Duration;

use bytes::Bytes;
use prost::Message;

use rkv_common::messages::{encode_message, RpbPutReq, RpbPutResp};
use rkv_common::{Frame, MessageCode};

use super::{attempts_accessors, bucket_type_bytes, check_tries, lossy, require, timeout_millis, KvObject};
use crate::command::{Attempts, Command, Decoded, Reply, ResponseHandle};
use crate::error::{ClientError, ClientResult};

/// Result of a store.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StoreValueResponse {
    /// Key chosen by the server when the request had none.
    pub generated_key: Option<String>,
    pub vclock: Option<Bytes>,
    /// Stored siblings, present when `return_body` was requested.
    pub values: Vec<KvObject>,
}

/// Writes a value under a key, or under a server-generated key.
#[derive(Debug)]
pub struct StoreValue {
    request: RpbPutReq,
    reply: Reply<StoreValueResponse>,
    attempts: Attempts,
}

impl StoreValue {
    pub fn builder(bucket: impl Into<String>) -> StoreValueBuilder {
        StoreValueBuilder {
            bucket: bucket.into(),
            ..Default::default()
        }
    }
}

/// Options for `StoreValue`.
#[derive(Debug, Default)]
pub struct StoreValueBuilder {
    bucket_type: Option<String>,
    bucket: String,
    key: Option<String>,
    object: Option<KvObject>,
    vclock: Option<Bytes>,
    w: Option<u32>,
    dw: Option<u32>,
    pw: Option<u32>,
    return_body: bool,
    if_not_modified: bool,
    if_none_match: bool,
    timeout: Option<Duration>,
    client_timeout: Option<Duration>,
    tries: Option<u32>,
}

impl StoreValueBuilder {
    pub fn bucket_type(mut self, bucket_type: impl Into<String>) -> Self {
        self.bucket_type = Some(bucket_type.into());
        self
    }

    /// Without a key the server generates one.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn value(mut self, value: impl Into<Bytes>) -> Self {
        self.object = Some(KvObject::new(value));
        self
    }

    pub fn object(mut self, object: KvObject) -> Self {
        self.object = Some(object);
        self
    }

    /// Causal context from a previous fetch.
    pub fn vclock(mut self, vclock: impl Into<Bytes>) -> Self {
        self.vclock = Some(vclock.into());
        self
    }

    pub fn w(mut self, w: u32) -> Self {
        self.w = Some(w);
        self
    }

    pub fn dw(mut self, dw: u32) -> Self {
        self.dw = Some(dw);
        self
    }

    pub fn pw(mut self, pw: u32) -> Self {
        self.pw = Some(pw);
        self
    }

    pub fn return_body(mut self) -> Self {
        self.return_body = true;
        self
    }

    pub fn if_not_modified(mut self) -> Self {
        self.if_not_modified = true;
        self
    }

    pub fn if_none_match(mut self) -> Self {
        self.if_none_match = true;
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

    pub fn build(self) -> ClientResult<(StoreValue, ResponseHandle<StoreValueResponse>)> {
        require("bucket", &self.bucket)?;
        if let Some(key) = &self.key {
            require("key", key)?;
        }
        check_tries(self.tries)?;
        let object = self
            .object
            .ok_or_else(|| ClientError::InvalidArgument("value is required".into()))?;

        let request = RpbPutReq {
            bucket: self.bucket.into_bytes(),
            key: self.key.map(String::into_bytes),
            vclock: self.vclock.map(|v| v.to_vec()),
            content: object.to_content(),
            w: self.w,
            dw: self.dw,
            pw: self.pw,
            return_body: self.return_body.then_some(true),
            if_not_modified: self.if_not_modified.then_some(true),
            if_none_match: self.if_none_match.then_some(true),
            return_head: None,
            timeout: timeout_millis(self.timeout),
            r#type: bucket_type_bytes(&self.bucket_type),
        };
        let (reply, handle) = Reply::channel();
        Ok((
            StoreValue {
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

impl Command for StoreValue {
    fn name(&self) -> &'static str {
        "StoreValue"
    }

    fn request_code(&self) -> MessageCode {
        MessageCode::PutReq
    }

    fn response_code(&self) -> MessageCode {
        MessageCode::PutResp
    }

    fn encode_request(&self) -> Bytes {
        encode_message(&self.request)
    }

    fn decode(&mut self, frame: Frame) -> ClientResult<Decoded> {
        let resp = RpbPutResp::decode(frame.payload)?;
        self.reply.send(Ok(StoreValueResponse {
            generated_key: resp.key.as_deref().map(lossy),
            vclock: resp.vclock.map(Bytes::from),
            values: resp.content.into_iter().map(KvObject::from_content).collect(),
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
