//! Built-in commands.
//!
//! Each command is built from a builder (or `new` when it has no options)
//! that validates its arguments and returns the command together with the
//! caller's half: a `ResponseHandle` or, for listings, a `ResponseStream`.
//!
//! ```no_run
//! # async fn demo(cluster: &rkv_client::Cluster) -> rkv_client::ClientResult<()> {
//! use rkv_client::commands::FetchValue;
//!
//! let (fetch, response) = FetchValue::builder("users", "alice").r(2).build()?;
//! cluster.execute(fetch);
//! let found = response.await?;
//! println!("not found: {}", found.not_found);
//! # Ok(())
//! # }
//! ```
//!
//! Timeouts come in two kinds: `timeout` is sent to the server in the
//! request, `client_timeout` bounds one attempt on the client side.

mod delete_value;
mod fetch_preflist;
mod fetch_value;
mod list_buckets;
mod list_keys;
mod object;
mod ping;
mod server_info;
mod store_value;

pub use delete_value::{DeleteValue, DeleteValueBuilder};
pub use fetch_preflist::{FetchPreflist, FetchPreflistBuilder, PreflistItem};
pub use fetch_value::{FetchValue, FetchValueBuilder, FetchValueResponse};
pub use list_buckets::{ListBuckets, ListBucketsBuilder, ListBucketsResponse};
pub use list_keys::{ListKeys, ListKeysBuilder, ListKeysResponse};
pub use object::{KvObject, Location};
pub use ping::Ping;
pub use server_info::{FetchServerInfo, ServerInfo};
pub use store_value::{StoreValue, StoreValueBuilder, StoreValueResponse};

use std::time::Duration;

use crate::error::{ClientError, ClientResult};

/// Bucket type used when none is given; never sent on the wire.
pub const DEFAULT_BUCKET_TYPE: &str = "default";

/// Implements the retry and deadline accessors of `Command` for a struct
/// with an `attempts: Attempts` field.
macro_rules! attempts_accessors {
    () => {
        fn remaining_tries(&self) -> Option<u32> {
            self.attempts.remaining
        }

        fn set_remaining_tries(&mut self, tries: u32) {
            self.attempts.remaining = Some(tries);
        }

        fn timeout(&self) -> Option<std::time::Duration> {
            self.attempts.timeout
        }
    };
}
pub(crate) use attempts_accessors;

pub(crate) fn require(field: &str, value: &str) -> ClientResult<()> {
    if value.is_empty() {
        return Err(ClientError::InvalidArgument(format!("{field} is required")));
    }
    Ok(())
}

/// Wire form of an optional bucket type; the default type is omitted.
pub(crate) fn bucket_type_bytes(bucket_type: &Option<String>) -> Option<Vec<u8>> {
    bucket_type
        .as_deref()
        .filter(|t| !t.is_empty() && *t != DEFAULT_BUCKET_TYPE)
        .map(|t| t.as_bytes().to_vec())
}

/// Server-side timeouts travel as milliseconds.
pub(crate) fn timeout_millis(timeout: Option<Duration>) -> Option<u32> {
    timeout.map(|t| u32::try_from(t.as_millis()).unwrap_or(u32::MAX))
}

pub(crate) fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

fn zero_tries() -> ClientError {
    ClientError::InvalidArgument("tries must be at least 1".into())
}

pub(crate) fn check_tries(tries: Option<u32>) -> ClientResult<()> {
    match tries {
        Some(0) => Err(zero_tries()),
        _ => Ok(()),
    }
}
