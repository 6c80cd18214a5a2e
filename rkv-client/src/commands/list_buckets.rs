use std::time::Duration;

use bytes::Bytes;
use prost::Message;

use rkv_common::messages::{encode_message, RpbListBucketsReq, RpbListBucketsResp};
use rkv_common::{Frame, MessageCode};

use super::{attempts_accessors, bucket_type_bytes, check_tries, lossy, timeout_millis};
use crate::command::{Attempts, Command, Decoded, ResponseStream, StreamReply};
use crate::error::{ClientError, ClientResult};

/// One batch of bucket names.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListBucketsResponse {
    pub buckets: Vec<String>,
    pub done: bool,
}

/// Lists the buckets of a bucket type. Like key listing, this must be
/// enabled with `allow_listing`.
///
/// In streaming mode the server sends batches until `done`; otherwise it
/// answers with one frame.
#[derive(Debug)]
pub struct ListBuckets {
    request: RpbListBucketsReq,
    streaming: bool,
    reply: StreamReply<ListBucketsResponse>,
    attempts: Attempts,
}

impl ListBuckets {
    pub fn builder() -> ListBucketsBuilder {
        ListBucketsBuilder {
            bucket_type: None,
            allow_listing: false,
            streaming: true,
            timeout: None,
            client_timeout: None,
            tries: None,
        }
    }
}

/// Options for `ListBuckets`.
#[derive(Debug)]
pub struct ListBucketsBuilder {
    bucket_type: Option<String>,
    allow_listing: bool,
    streaming: bool,
    timeout: Option<Duration>,
    client_timeout: Option<Duration>,
    tries: Option<u32>,
}

impl ListBucketsBuilder {
    pub fn bucket_type(mut self, bucket_type: impl Into<String>) -> Self {
        self.bucket_type = Some(bucket_type.into());
        self
    }

    pub fn allow_listing(mut self) -> Self {
        self.allow_listing = true;
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = streaming;
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

    pub fn build(self) -> ClientResult<(ListBuckets, ResponseStream<ListBucketsResponse>)> {
        if !self.allow_listing {
            return Err(ClientError::InvalidArgument(
                "listing buckets is expensive; call allow_listing() to enable it".into(),
            ));
        }
        check_tries(self.tries)?;

        let request = RpbListBucketsReq {
            timeout: timeout_millis(self.timeout),
            stream: Some(self.streaming),
            r#type: bucket_type_bytes(&self.bucket_type),
        };
        let (reply, stream) = StreamReply::channel();
        Ok((
            ListBuckets {
                request,
                streaming: self.streaming,
                reply,
                attempts: Attempts {
                    remaining: self.tries,
                    timeout: self.client_timeout,
                },
            },
            stream,
        ))
    }
}

impl Command for ListBuckets {
    fn name(&self) -> &'static str {
        "ListBuckets"
    }

    fn request_code(&self) -> MessageCode {
        MessageCode::ListBucketsReq
    }

    fn response_code(&self) -> MessageCode {
        MessageCode::ListBucketsResp
    }

    fn encode_request(&self) -> Bytes {
        encode_message(&self.request)
    }

    fn decode(&mut self, frame: Frame) -> ClientResult<Decoded> {
        let resp = RpbListBucketsResp::decode(frame.payload)?;
        let done = !self.streaming || resp.done.unwrap_or(false);
        let batch = ListBucketsResponse {
            buckets: resp.buckets.iter().map(|b| lossy(b)).collect(),
            done,
        };
        if done {
            self.reply.finish(batch);
            Ok(Decoded::Complete)
        } else {
            self.reply.item(batch);
            Ok(Decoded::More)
        }
    }

    fn on_protocol_error(mut self: Box<Self>, error: ClientError) {
        self.reply.fail(error);
    }

    fn on_transport_error(mut self: Box<Self>, error: ClientError) {
        self.reply.fail(error);
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn delivered_partial(&self) -> bool {
        self.reply.delivered()
    }

    fn is_cancelled(&self) -> bool {
        self.reply.is_closed()
    }

    attempts_accessors!();
}
