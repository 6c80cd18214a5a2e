use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use rkv_common::messages::{RpbContent, RpbPair};

use super::lossy;

/// One stored value (a sibling, when there are several) and its metadata.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct KvObject {
    pub value: Bytes,
    pub content_type: Option<String>,
    pub charset: Option<String>,
    pub content_encoding: Option<String>,
    pub vtag: Option<String>,
    pub last_modified: Option<SystemTime>,
    pub user_meta: Vec<(String, Bytes)>,
    pub indexes: Vec<(String, Bytes)>,
    /// Set on tombstones returned when deleted values are requested.
    pub deleted: bool,
    /// Where the object was read from; `None` on objects built locally.
    pub location: Option<Location>,
}

/// Bucket type, bucket and key of a stored object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub bucket_type: String,
    pub bucket: String,
    pub key: String,
}

impl KvObject {
    pub fn new(value: impl Into<Bytes>) -> Self {
        KvObject {
            value: value.into(),
            ..Default::default()
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn with_user_meta(mut self, key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.user_meta.push((key.into(), value.into()));
        self
    }

    pub fn with_index(mut self, name: impl Into<String>, value: impl Into<Bytes>) -> Self {
        self.indexes.push((name.into(), value.into()));
        self
    }

    /// Value as UTF-8, lossily.
    pub fn value_str(&self) -> String {
        lossy(&self.value)
    }

    pub(crate) fn from_content(content: RpbContent) -> Self {
        let last_modified = content.last_mod.map(|secs| {
            let usecs = content.last_mod_usecs.unwrap_or(0);
            UNIX_EPOCH + Duration::from_secs(u64::from(secs)) + Duration::from_micros(u64::from(usecs))
        });
        KvObject {
            value: Bytes::from(content.value),
            content_type: content.content_type.as_deref().map(lossy),
            charset: content.charset.as_deref().map(lossy),
            content_encoding: content.content_encoding.as_deref().map(lossy),
            vtag: content.vtag.as_deref().map(lossy),
            last_modified,
            user_meta: pairs_from_wire(content.usermeta),
            indexes: pairs_from_wire(content.indexes),
            deleted: content.deleted.unwrap_or(false),
            location: None,
        }
    }

    pub(crate) fn at(mut self, location: &Location) -> Self {
        self.location = Some(location.clone());
        self
    }

    pub(crate) fn to_content(&self) -> RpbContent {
        RpbContent {
            value: self.value.to_vec(),
            content_type: self.content_type.as_ref().map(|s| s.as_bytes().to_vec()),
            charset: self.charset.as_ref().map(|s| s.as_bytes().to_vec()),
            content_encoding: self.content_encoding.as_ref().map(|s| s.as_bytes().to_vec()),
            usermeta: pairs_to_wire(&self.user_meta),
            indexes: pairs_to_wire(&self.indexes),
            ..Default::default()
        }
    }
}

fn pairs_from_wire(pairs: Vec<RpbPair>) -> Vec<(String, Bytes)> {
    pairs
        .into_iter()
        .map(|pair| (lossy(&pair.key), Bytes::from(pair.value.unwrap_or_default())))
        .collect()
}

fn pairs_to_wire(pairs: &[(String, Bytes)]) -> Vec<RpbPair> {
    pairs
        .iter()
        .map(|(key, value)| RpbPair {
            key: key.as_bytes().to_vec(),
            value: Some(value.to_vec()),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_wire_content() {
        let content = RpbContent {
            value: b"this is a value".to_vec(),
            content_type: Some(b"text/plain".to_vec()),
            last_mod: Some(1_000),
            last_mod_usecs: Some(500),
            usermeta: vec![RpbPair {
                key: b"owner".to_vec(),
                value: Some(b"alice".to_vec()),
            }],
            deleted: Some(true),
            ..Default::default()
        };
        let object = KvObject::from_content(content);
        assert_eq!(object.value_str(), "this is a value");
        assert_eq!(object.content_type.as_deref(), Some("text/plain"));
        assert_eq!(
            object.last_modified,
            Some(UNIX_EPOCH + Duration::from_secs(1_000) + Duration::from_micros(500))
        );
        assert_eq!(object.user_meta, vec![("owner".to_string(), Bytes::from_static(b"alice"))]);
        assert!(object.deleted);
    }

    #[test]
    fn outgoing_content_omits_server_fields() {
        let object = KvObject::new("v").with_content_type("application/json").with_index("age_int", "42");
        let content = object.to_content();
        assert_eq!(content.value, b"v".to_vec());
        assert_eq!(content.indexes.len(), 1);
        assert!(content.vtag.is_none());
        assert!(content.last_mod.is_none());
    }
}
