use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    pub transaction_id: Vec<u8>,

    /// `q`, `r` or `e`
    #[serde(rename = "y")]
    pub message_type: String,

    #[serde(default, rename = "q", skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,

    #[serde(default, rename = "a", skip_serializing_if = "Option::is_none")]
    pub arguments: Option<DHTArguments>,

    #[serde(default, rename = "r", skip_serializing_if = "Option::is_none")]
    pub response: Option<DHTReturn>,

    #[serde(default, rename = "e", skip_serializing_if = "Option::is_none")]
    pub error: Option<(i64, String)>,

    #[serde(default, rename = "v", with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub version: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub ip: Option<Vec<u8>>,

    #[serde(default, rename = "ro", skip_serializing_if = "Option::is_none")]
    pub read_only: Option<i32>,
}

impl DHTMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<DHTMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

/// Query arguments, every query kind shares this dictionary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTArguments {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub target: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub info_hash: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub token: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub v: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cas: Option<i64>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub k: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub salt: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub sig: Option<Vec<u8>>,
}

/// Response values, every response kind shares this dictionary.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct DHTReturn {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub nodes: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub token: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<Vec<ByteBuf>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub v: Option<Vec<u8>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<i64>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub k: Option<Vec<u8>>,

    #[serde(default, with = "serde_bytes", skip_serializing_if = "Option::is_none")]
    pub sig: Option<Vec<u8>>,
}
