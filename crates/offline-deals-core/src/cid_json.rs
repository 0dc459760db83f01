//! JSON codec for content identifiers.
//!
//! The dataset API and the storage node speak the IPLD JSON link form
//! `{"/": "<cid>"}`. Older API payloads (and hand-written fixtures) use a bare
//! string instead, so both are accepted on input. Output always uses the link
//! form so records round-trip through the same code path as remote payloads.
//!
//! Use with `#[serde(with = "offline_deals_core::cid_json")]`, or
//! `cid_json::option` for fields that may be `null`/absent.

use cid::Cid;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

#[derive(Serialize)]
struct LinkOut<'a> {
    #[serde(rename = "/")]
    link: &'a str,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LinkIn {
    Link {
        #[serde(rename = "/")]
        link: String,
    },
    Plain(String),
}

impl LinkIn {
    fn into_cid<E: serde::de::Error>(self) -> Result<Cid, E> {
        let text = match self {
            LinkIn::Link { link } => link,
            LinkIn::Plain(text) => text,
        };
        parse_cid(&text).map_err(E::custom)
    }
}

/// Parse a content identifier from its canonical string form.
pub fn parse_cid(text: &str) -> crate::Result<Cid> {
    text.trim()
        .parse::<Cid>()
        .map_err(|e| crate::Error::InvalidCid {
            input: text.to_string(),
            reason: e.to_string(),
        })
}

/// The IPLD JSON link form of a content identifier.
pub fn to_link(cid: &Cid) -> serde_json::Value {
    serde_json::json!({ "/": cid.to_string() })
}

pub fn serialize<S: Serializer>(cid: &Cid, serializer: S) -> Result<S::Ok, S::Error> {
    let text = cid.to_string();
    LinkOut { link: &text }.serialize(serializer)
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Cid, D::Error> {
    LinkIn::deserialize(deserializer)?.into_cid()
}

/// Codec for optional identifiers; `null`, a missing field and an empty
/// string all decode to `None`.
pub mod option {
    use super::*;

    pub fn serialize<S: Serializer>(cid: &Option<Cid>, serializer: S) -> Result<S::Ok, S::Error> {
        match cid {
            Some(cid) => super::serialize(cid, serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Cid>, D::Error> {
        match Option::<LinkIn>::deserialize(deserializer)? {
            None => Ok(None),
            Some(LinkIn::Link { link }) | Some(LinkIn::Plain(link)) if link.is_empty() => Ok(None),
            Some(link) => link.into_cid().map(Some),
        }
    }
}
