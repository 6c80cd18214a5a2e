use std::time::Duration;

use bytes::Bytes;
use prost::Message;

use rkv_common::messages::{encode_message, RpbListKeysReq, RpbListKeysResp};
use rkv_common::{Frame, MessageCode};

use super::{attempts_accessors, bucket_type_bytes, check_tries, lossy, require, timeout_millis};
use crate::command::{Attempts, Command, Decoded, ResponseStream, StreamReply};
use crate::error::{ClientError, ClientResult};

/// One batch of keys.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListKeysResponse {
    pub keys: Vec<String>,
    /// Set on the final batch only.
    pub done: bool,
}

/// Lists every key in a bucket. This walks the whole keyspace on the
/// server, so it must be enabled explicitly with `allow_listing`.
///
/// Streaming (the default) yields one item per server frame; otherwise a
/// single item carries every key.
#[derive(Debug)]
pub struct ListKeys {
    request: RpbListKeysReq,
    streaming: bool,
    collected: Vec<String>,
    reply: StreamReply<ListKeysResponse>,
    attempts: Attempts,
}

impl ListKeys {
    pub fn builder(bucket: impl Into<String>) -> ListKeysBuilder {
        ListKeysBuilder {
            bucket: bucket.into(),
            bucket_type: None,
            allow_listing: false,
            streaming: true,
            timeout: None,
            client_timeout: None,
            tries: None,
        }
    }
}

/// Options for `ListKeys`.
#[derive(Debug)]
pub struct ListKeysBuilder {
    bucket: String,
    bucket_type: Option<String>,
    allow_listing: bool,
    streaming: bool,
    timeout: Option<Duration>,
    client_timeout: Option<Duration>,
    tries: Option<u32>,
}

impl ListKeysBuilder {
    pub fn bucket_type(mut self, bucket_type: impl Into<String>) -> Self {
        self.bucket_type = Some(bucket_type.into());
        self
    }

    /// Acknowledges that listing is expensive.
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

    pub fn build(self) -> ClientResult<(ListKeys, ResponseStream<ListKeysResponse>)> {
        if !self.allow_listing {
            return Err(ClientError::InvalidArgument(
                "listing keys is expensive; call allow_listing() to enable it".into(),
            ));
        }
        require("bucket", &self.bucket)?;
        check_tries(self.tries)?;

        let request = RpbListKeysReq {
            bucket: self.bucket.into_bytes(),
            timeout: timeout_millis(self.timeout),
            r#type: bucket_type_bytes(&self.bucket_type),
        };
        let (reply, stream) = StreamReply::channel();
        Ok((
            ListKeys {
                request,
                streaming: self.streaming,
                collected: Vec::new(),
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

impl Command for ListKeys {
    fn name(&self) -> &'static str {
        "ListKeys"
    }

    fn request_code(&self) -> MessageCode {
        MessageCode::ListKeysReq
    }

    fn response_code(&self) -> MessageCode {
        MessageCode::ListKeysResp
    }

    fn encode_request(&self) -> Bytes {
        encode_message(&self.request)
    }

    fn begin_attempt(&mut self) {
        self.collected.clear();
    }

    fn decode(&mut self, frame: Frame) -> ClientResult<Decoded> {
        let resp = RpbListKeysResp::decode(frame.payload)?;
        let done = resp.done.unwrap_or(false);
        let keys = resp.keys.iter().map(|k| lossy(k));

        if self.streaming {
            let batch = ListKeysResponse {
                keys: keys.collect(),
                done,
            };
            if done {
                self.reply.finish(batch);
            } else {
                self.reply.item(batch);
            }
        } else {
            self.collected.extend(keys);
            if done {
                self.reply.finish(ListKeysResponse {
                    keys: std::mem::take(&mut self.collected),
                    done: true,
                });
            }
        }

        Ok(if done { Decoded::Complete } else { Decoded::More })
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

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(keys: &[&str], done: bool) -> Frame {
        let resp = RpbListKeysResp {
            keys: keys.iter().map(|k| k.as_bytes().to_vec()).collect(),
            done: done.then_some(true),
        };
        Frame::new(MessageCode::ListKeysResp, encode_message(&resp))
    }

    #[test]
    fn listing_must_be_allowed() {
        assert!(matches!(
            ListKeys::builder("b").build(),
            Err(ClientError::InvalidArgument(_))
        ));
        assert!(ListKeys::builder("b").allow_listing().build().is_ok());
    }

    #[tokio::test]
    async fn streams_one_item_per_frame() {
        let (mut list, mut stream) = ListKeys::builder("b").allow_listing().build().unwrap();
        assert_eq!(list.decode(frame(&["a", "b"], false)).unwrap(), Decoded::More);
        assert!(list.delivered_partial());
        assert_eq!(list.decode(frame(&["c"], true)).unwrap(), Decoded::Complete);

        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.keys, vec!["a", "b"]);
        assert!(!first.done);
        let last = stream.next().await.unwrap().unwrap();
        assert_eq!(last.keys, vec!["c"]);
        assert!(last.done);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn non_streaming_collects_everything() {
        let (mut list, stream) = ListKeys::builder("b")
            .allow_listing()
            .streaming(false)
            .build()
            .unwrap();
        assert!(!list.is_streaming());
        list.decode(frame(&["a", "b"], false)).unwrap();
        assert!(!list.delivered_partial());
        list.decode(frame(&["c"], false)).unwrap();
        list.decode(frame(&[], true)).unwrap();

        let items = stream.collect().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].keys, vec!["a", "b", "c"]);
        assert!(items[0].done);
    }

    #[tokio::test]
    async fn new_attempt_discards_keys_collected_by_failed_one() {
        let (mut list, stream) = ListKeys::builder("b")
            .allow_listing()
            .streaming(false)
            .build()
            .unwrap();
        list.begin_attempt();
        list.decode(frame(&["a", "b"], false)).unwrap();

        // The connection dropped; the next node starts over.
        list.begin_attempt();
        list.decode(frame(&["a", "b"], false)).unwrap();
        list.decode(frame(&["c"], true)).unwrap();

        let items = stream.collect().await.unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].keys, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn error_after_partial_ends_stream() {
        let (mut list, stream) = ListKeys::builder("b").allow_listing().build().unwrap();
        list.decode(frame(&["a"], false)).unwrap();
        Box::new(list).on_transport_error(ClientError::Closed);
        assert!(matches!(stream.collect().await, Err(ClientError::Closed)));
    }
}
