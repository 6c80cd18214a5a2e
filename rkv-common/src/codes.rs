// codes.rs - message codes carried in the one-byte slot of every frame
//
// Every frame on the wire is `[u32 length][u8 code][payload]`. The code
// tells the receiver which payload type follows, so a response can be
// matched against the code the request expects without decoding it.
//
// Codes come in request/response pairs (odd request, even response for the
// key/value operations). Two codes are special:
//
//   ERROR_RESP (0): the server answered with an application-level error.
//                   The payload is an `RpbErrorResp`. Any request may get it.
//
//   START_TLS (255): zero-length payload in both directions. After the
//                    server echoes it, every further byte on the socket is
//                    TLS. Nothing may be buffered past the echo.

pub const CODE_ERROR_RESP: u8 = 0;

pub const CODE_PING_REQ: u8 = 1;

pub const CODE_PING_RESP: u8 = 2;

pub const CODE_GET_SERVER_INFO_REQ: u8 = 7;

pub const CODE_GET_SERVER_INFO_RESP: u8 = 8;

pub const CODE_GET_REQ: u8 = 9;

pub const CODE_GET_RESP: u8 = 10;

pub const CODE_PUT_REQ: u8 = 11;

pub const CODE_PUT_RESP: u8 = 12;

pub const CODE_DEL_REQ: u8 = 13;

pub const CODE_DEL_RESP: u8 = 14;

pub const CODE_LIST_BUCKETS_REQ: u8 = 15;

pub const CODE_LIST_BUCKETS_RESP: u8 = 16;

pub const CODE_LIST_KEYS_REQ: u8 = 17;

pub const CODE_LIST_KEYS_RESP: u8 = 18;

pub const CODE_GET_BUCKET_KEY_PREFLIST_REQ: u8 = 33;

pub const CODE_GET_BUCKET_KEY_PREFLIST_RESP: u8 = 34;

pub const CODE_AUTH_REQ: u8 = 253;

pub const CODE_AUTH_RESP: u8 = 254;

pub const CODE_START_TLS: u8 = 255;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageCode {
    /// Application-level error answer to any request
    ErrorResp = CODE_ERROR_RESP,

    PingReq = CODE_PING_REQ,
    PingResp = CODE_PING_RESP,

    GetServerInfoReq = CODE_GET_SERVER_INFO_REQ,
    GetServerInfoResp = CODE_GET_SERVER_INFO_RESP,

    /// Fetch a value
    GetReq = CODE_GET_REQ,
    GetResp = CODE_GET_RESP,

    /// Store a value
    PutReq = CODE_PUT_REQ,
    PutResp = CODE_PUT_RESP,

    /// Delete a value
    DelReq = CODE_DEL_REQ,
    DelResp = CODE_DEL_RESP,

    /// List buckets (may stream)
    ListBucketsReq = CODE_LIST_BUCKETS_REQ,
    ListBucketsResp = CODE_LIST_BUCKETS_RESP,

    /// List keys (always streams from the server)
    ListKeysReq = CODE_LIST_KEYS_REQ,
    ListKeysResp = CODE_LIST_KEYS_RESP,

    GetBucketKeyPreflistReq = CODE_GET_BUCKET_KEY_PREFLIST_REQ,
    GetBucketKeyPreflistResp = CODE_GET_BUCKET_KEY_PREFLIST_RESP,

    AuthReq = CODE_AUTH_REQ,
    AuthResp = CODE_AUTH_RESP,

    /// Begin TLS upgrade (zero-length payload, both directions)
    StartTls = CODE_START_TLS,
}

impl MessageCode {
    /// Convert code to its wire byte
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to map a wire byte to a known code
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            CODE_ERROR_RESP => Some(Self::ErrorResp),
            CODE_PING_REQ => Some(Self::PingReq),
            CODE_PING_RESP => Some(Self::PingResp),
            CODE_GET_SERVER_INFO_REQ => Some(Self::GetServerInfoReq),
            CODE_GET_SERVER_INFO_RESP => Some(Self::GetServerInfoResp),
            CODE_GET_REQ => Some(Self::GetReq),
            CODE_GET_RESP => Some(Self::GetResp),
            CODE_PUT_REQ => Some(Self::PutReq),
            CODE_PUT_RESP => Some(Self::PutResp),
            CODE_DEL_REQ => Some(Self::DelReq),
            CODE_DEL_RESP => Some(Self::DelResp),
            CODE_LIST_BUCKETS_REQ => Some(Self::ListBucketsReq),
            CODE_LIST_BUCKETS_RESP => Some(Self::ListBucketsResp),
            CODE_LIST_KEYS_REQ => Some(Self::ListKeysReq),
            CODE_LIST_KEYS_RESP => Some(Self::ListKeysResp),
            CODE_GET_BUCKET_KEY_PREFLIST_REQ => Some(Self::GetBucketKeyPreflistReq),
            CODE_GET_BUCKET_KEY_PREFLIST_RESP => Some(Self::GetBucketKeyPreflistResp),
            CODE_AUTH_REQ => Some(Self::AuthReq),
            CODE_AUTH_RESP => Some(Self::AuthResp),
            CODE_START_TLS => Some(Self::StartTls),
            _ => None,
        }
    }

    /// Human-readable name used in logs and errors
    pub const fn name(self) -> &'static str {
        match self {
            Self::ErrorResp => "RpbErrorResp",
            Self::PingReq => "RpbPingReq",
            Self::PingResp => "RpbPingResp",
            Self::GetServerInfoReq => "RpbGetServerInfoReq",
            Self::GetServerInfoResp => "RpbGetServerInfoResp",
            Self::GetReq => "RpbGetReq",
            Self::GetResp => "RpbGetResp",
            Self::PutReq => "RpbPutReq",
            Self::PutResp => "RpbPutResp",
            Self::DelReq => "RpbDelReq",
            Self::DelResp => "RpbDelResp",
            Self::ListBucketsReq => "RpbListBucketsReq",
            Self::ListBucketsResp => "RpbListBucketsResp",
            Self::ListKeysReq => "RpbListKeysReq",
            Self::ListKeysResp => "RpbListKeysResp",
            Self::GetBucketKeyPreflistReq => "RpbGetBucketKeyPreflistReq",
            Self::GetBucketKeyPreflistResp => "RpbGetBucketKeyPreflistResp",
            Self::AuthReq => "RpbAuthReq",
            Self::AuthResp => "RpbAuthResp",
            Self::StartTls => "RpbStartTls",
        }
    }

    /// Codes whose frames never carry a payload
    pub const fn is_payload_free(self) -> bool {
        matches!(
            self,
            Self::PingReq | Self::PingResp | Self::GetServerInfoReq | Self::DelResp | Self::AuthResp | Self::StartTls
        )
    }
}

impl std::fmt::Display for MessageCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Formats a raw wire byte, naming it when it is a known code.
pub fn describe_code(code: u8) -> String {
    match MessageCode::from_u8(code) {
        Some(known) => format!("{}({})", known.name(), code),
        None => format!("unknown({})", code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_conversion() {
        let codes = [
            MessageCode::ErrorResp,
            MessageCode::PingReq,
            MessageCode::PingResp,
            MessageCode::GetReq,
            MessageCode::GetResp,
            MessageCode::ListKeysReq,
            MessageCode::ListKeysResp,
            MessageCode::GetBucketKeyPreflistResp,
            MessageCode::StartTls,
        ];

        for code in codes {
            assert_eq!(Some(code), MessageCode::from_u8(code.as_u8()));
        }
    }

    #[test]
    fn test_unknown_code() {
        assert_eq!(MessageCode::from_u8(3), None);
        assert_eq!(MessageCode::from_u8(200), None);
        assert_eq!(describe_code(200), "unknown(200)");
    }

    #[test]
    fn test_start_tls_is_last_code() {
        assert_eq!(MessageCode::StartTls.as_u8(), u8::MAX);
        assert!(MessageCode::StartTls.is_payload_free());
        assert!(!MessageCode::GetResp.is_payload_free());
    }

    #[test]
    fn test_display_uses_name() {
        assert_eq!(MessageCode::GetReq.to_string(), "RpbGetReq");
        assert_eq!(describe_code(10), "RpbGetResp(10)");
    }
}
