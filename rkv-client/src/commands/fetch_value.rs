use std::time::Duration;

use bytes::Bytes;
use prost::Message;

use rkv_common::messages::{encode_message, RpbGetReq, RpbGetResp};
use rkv_common::{Frame, MessageCode};

use super::{
    attempts_accessors, bucket_type_bytes, check_tries, lossy, require, timeout_millis, KvObject, Location,
    DEFAULT_BUCKET_TYPE,
};
use crate::command::{Attempts, Command, Decoded, Reply, ResponseHandle};
use crate::error::{ClientError, ClientResult};

/// Result of a fetch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FetchValueResponse {
    /// No value is stored under the key.
    pub not_found: bool,
    /// The value has not changed since the `if_modified` vclock.
    pub unchanged: bool,
    pub vclock: Option<Bytes>,
    /// One entry per sibling; empty when not found.
    pub values: Vec<KvObject>,
}

/// Reads the value stored under a key.
#[derive(Debug)]
pub struct FetchValue {
    request: RpbGetReq,
    reply: Reply<FetchValueResponse>,
    attempts: Attempts,
}

impl FetchValue {
    fn location(&self) -> Location {
        Location {
            bucket_type: self
                .request
                .r#type
                .as_deref()
                .map(lossy)
                .unwrap_or_else(|| DEFAULT_BUCKET_TYPE.to_string()),
            bucket: lossy(&self.request.bucket),
            key: lossy(&self.request.key),
        }
    }

    pub fn builder(bucket: impl Into<String>, key: impl Into<String>) -> FetchValueBuilder {
        FetchValueBuilder {
            bucket: bucket.into(),
            key: key.into(),
            ..Default::default()
        }
    }
}

/// Options for `FetchValue`.
#[derive(Debug, Default)]
pub struct FetchValueBuilder {
    bucket_type: Option<String>,
    bucket: String,
    key: String,
    r: Option<u32>,
    pr: Option<u32>,
    basic_quorum: Option<bool>,
    notfound_ok: Option<bool>,
    if_modified: Option<Bytes>,
    head_only: bool,
    return_deleted_vclock: bool,
    timeout: Option<Duration>,
    client_timeout: Option<Duration>,
    tries: Option<u32>,
}

impl FetchValueBuilder {
    pub fn bucket_type(mut self, bucket_type: impl Into<String>) -> Self {
        self.bucket_type = Some(bucket_type.into());
        self
    }

    /// Read quorum.
    pub fn r(mut self, r: u32) -> Self {
        self.r = Some(r);
        self
    }

    /// Primary read quorum.
    pub fn pr(mut self, pr: u32) -> Self {
        self.pr = Some(pr);
        self
    }

    pub fn basic_quorum(mut self, enabled: bool) -> Self {
        self.basic_quorum = Some(enabled);
        self
    }

    pub fn notfound_ok(mut self, enabled: bool) -> Self {
        self.notfound_ok = Some(enabled);
        self
    }

    /// Only return the value if it changed since this vclock.
    pub fn if_modified(mut self, vclock: impl Into<Bytes>) -> Self {
        self.if_modified = Some(vclock.into());
        self
    }

    /// Return metadata without the value bodies.
    pub fn head_only(mut self) -> Self {
        self.head_only = true;
        self
    }

    /// Return the vclock of a tombstone instead of a bare not-found.
    pub fn return_deleted_vclock(mut self) -> Self {
        self.return_deleted_vclock = true;
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

    pub fn build(self) -> ClientResult<(FetchValue, ResponseHandle<FetchValueResponse>)> {
        require("bucket", &self.bucket)?;
        require("key", &self.key)?;
        check_tries(self.tries)?;

        let request = RpbGetReq {
            bucket: self.bucket.into_bytes(),
            key: self.key.into_bytes(),
            r: self.r,
            pr: self.pr,
            basic_quorum: self.basic_quorum,
            notfound_ok: self.notfound_ok,
            if_modified: self.if_modified.map(|v| v.to_vec()),
            head: self.head_only.then_some(true),
            deletedvclock: self.return_deleted_vclock.then_some(true),
            timeout: timeout_millis(self.timeout),
            r#type: bucket_type_bytes(&self.bucket_type),
        };
        let (reply, handle) = Reply::channel();
        Ok((
            FetchValue {
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

impl Command for FetchValue {
    fn name(&self) -> &'static str {
        "FetchValue"
    }

    fn request_code(&self) -> MessageCode {
        MessageCode::GetReq
    }

    fn response_code(&self) -> MessageCode {
        MessageCode::GetResp
    }

    fn encode_request(&self) -> Bytes {
        encode_message(&self.request)
    }

    fn decode(&mut self, frame: Frame) -> ClientResult<Decoded> {
        let resp = if frame.is_empty() {
            RpbGetResp::default()
        } else {
            RpbGetResp::decode(frame.payload)?
        };

        let unchanged = resp.unchanged.unwrap_or(false);
        let location = self.location();
        let mut values: Vec<KvObject> = resp
            .content
            .into_iter()
            .map(|content| KvObject::from_content(content).at(&location))
            .collect();
        // A vclock without content is a lone tombstone: found, but deleted.
        if values.is_empty() && !unchanged && resp.vclock.is_some() {
            values.push(KvObject {
                deleted: true,
                location: Some(location),
                ..Default::default()
            });
        }
        let not_found = values.is_empty() && !unchanged;
        let response = FetchValueResponse {
            not_found,
            unchanged,
            vclock: resp.vclock.map(Bytes::from),
            values,
        };
        self.reply.send(Ok(response));
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
    use rkv_common::messages::RpbContent;

    #[tokio::test]
    async fn empty_reply_means_not_found() {
        let (mut fetch, response) = FetchValue::builder("b", "k").build().unwrap();
        let decoded = fetch.decode(Frame::empty(MessageCode::GetResp)).unwrap();
        assert_eq!(decoded, Decoded::Complete);
        let found = response.await.unwrap();
        assert!(found.not_found);
        assert!(found.values.is_empty());
    }

    #[tokio::test]
    async fn siblings_are_all_returned() {
        let (mut fetch, response) = FetchValue::builder("b", "k").build().unwrap();
        let resp = RpbGetResp {
            content: vec![
                RpbContent {
                    value: b"one".to_vec(),
                    ..Default::default()
                },
                RpbContent {
                    value: b"two".to_vec(),
                    ..Default::default()
                },
            ],
            vclock: Some(b"vc".to_vec()),
            unchanged: None,
        };
        fetch
            .decode(Frame::new(MessageCode::GetResp, encode_message(&resp)))
            .unwrap();
        let found = response.await.unwrap();
        assert!(!found.not_found);
        assert_eq!(found.values.len(), 2);
        assert_eq!(found.vclock.as_deref(), Some(&b"vc"[..]));
    }

    #[tokio::test]
    async fn unchanged_is_not_not_found() {
        let (mut fetch, response) = FetchValue::builder("b", "k").if_modified("vc").build().unwrap();
        let resp = RpbGetResp {
            unchanged: Some(true),
            ..Default::default()
        };
        fetch
            .decode(Frame::new(MessageCode::GetResp, encode_message(&resp)))
            .unwrap();
        let found = response.await.unwrap();
        assert!(found.unchanged);
        assert!(!found.not_found);
    }

    #[tokio::test]
    async fn deleted_vclock_yields_tombstone() {
        let (mut fetch, response) = FetchValue::builder("b", "k")
            .return_deleted_vclock()
            .build()
            .unwrap();
        let resp = RpbGetResp {
            vclock: Some(b"gone".to_vec()),
            ..Default::default()
        };
        fetch
            .decode(Frame::new(MessageCode::GetResp, encode_message(&resp)))
            .unwrap();
        let found = response.await.unwrap();
        assert!(!found.not_found);
        assert_eq!(found.values.len(), 1);
        assert!(found.values[0].deleted);
        assert_eq!(
            found.values[0].location,
            Some(Location {
                bucket_type: "default".into(),
                bucket: "b".into(),
                key: "k".into(),
            })
        );
        assert_eq!(found.vclock.as_deref(), Some(&b"gone"[..]));
    }

    #[test]
    fn request_carries_options() {
        let (fetch, _response) = FetchValue::builder("b", "k")
            .bucket_type("maps")
            .r(3)
            .head_only()
            .timeout(Duration::from_millis(250))
            .build()
            .unwrap();
        let req = RpbGetReq::decode(fetch.encode_request()).unwrap();
        assert_eq!(req.bucket, b"b".to_vec());
        assert_eq!(req.r, Some(3));
        assert_eq!(req.head, Some(true));
        assert_eq!(req.timeout, Some(250));
        assert_eq!(req.r#type, Some(b"maps".to_vec()));
        assert_eq!(req.deletedvclock, None);
    }

    #[test]
    fn missing_key_is_rejected() {
        assert!(matches!(
            FetchValue::builder("b", "").build(),
            Err(ClientError::InvalidArgument(_))
        ));
    }

    #[test]
    fn zero_tries_is_rejected() {
        assert!(FetchValue::builder("b", "k").tries(0).build().is_err());
    }
}
