use std::time::Duration;

use bytes::Bytes;
use prost::Message;

use rkv_common::messages::{encode_message, RpbGetBucketKeyPreflistReq, RpbGetBucketKeyPreflistResp};
use rkv_common::{Frame, MessageCode};

use super::{attempts_accessors, bucket_type_bytes, check_tries, lossy, require};
use crate::command::{Attempts, Command, Decoded, Reply, ResponseHandle};
use crate::error::{ClientError, ClientResult};

/// One vnode responsible for a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflistItem {
    pub partition: i64,
    pub node: String,
    pub primary: bool,
}

/// Asks which partitions and nodes hold a key.
#[derive(Debug)]
pub struct FetchPreflist {
    request: RpbGetBucketKeyPreflistReq,
    reply: Reply<Vec<PreflistItem>>,
    attempts: Attempts,
}

impl FetchPreflist {
    pub fn builder(bucket: impl Into<String>, key: impl Into<String>) -> FetchPreflistBuilder {
        FetchPreflistBuilder {
            bucket: bucket.into(),
            key: key.into(),
            ..Default::default()
        }
    }
}

#[derive(Debug, Default)]
pub struct FetchPreflistBuilder {
    bucket_type: Option<String>,
    bucket: String,
    key: String,
    client_timeout: Option<Duration>,
    tries: Option<u32>,
}

impl FetchPreflistBuilder {
    pub fn bucket_type(mut self, bucket_type: impl Into<String>) -> Self {
        self.bucket_type = Some(bucket_type.into());
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

    pub fn build(self) -> ClientResult<(FetchPreflist, ResponseHandle<Vec<PreflistItem>>)> {
        require("bucket", &self.bucket)?;
        require("key", &self.key)?;
        check_tries(self.tries)?;

        let request = RpbGetBucketKeyPreflistReq {
            bucket: self.bucket.into_bytes(),
            key: self.key.into_bytes(),
            r#type: bucket_type_bytes(&self.bucket_type),
        };
        let (reply, handle) = Reply::channel();
        Ok((
            FetchPreflist {
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

impl Command for FetchPreflist {
    fn name(&self) -> &'static str {
        "FetchPreflist"
    }

    fn request_code(&self) -> MessageCode {
        MessageCode::GetBucketKeyPreflistReq
    }

    fn response_code(&self) -> MessageCode {
        MessageCode::GetBucketKeyPreflistResp
    }

    fn encode_request(&self) -> Bytes {
        encode_message(&self.request)
    }

    fn decode(&mut self, frame: Frame) -> ClientResult<Decoded> {
        let resp = RpbGetBucketKeyPreflistResp::decode(frame.payload)?;
        let items = resp
            .preflist
            .into_iter()
            .map(|item| PreflistItem {
                partition: item.partition,
                node: lossy(&item.node),
                primary: item.primary,
            })
            .collect();
        self.reply.send(Ok(items));
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
