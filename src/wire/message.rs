use serde::{Deserialize, Serialize};

/// Ordinary traffic record.
///
/// Carries either a chunk of terminal bytes or a resize notification. The
/// format allows both; readers give `content` precedence.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "base64_bytes"
    )]
    pub content: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tty_height: u16,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub tty_width: u16,
}

fn is_zero(v: &u16) -> bool {
    *v == 0
}

impl Message {
    pub fn content(data: &[u8]) -> Self {
        Self {
            content: Some(data.to_vec()),
            ..Self::default()
        }
    }

    pub fn resize(height: u16, width: u16) -> Self {
        Self {
            content: None,
            tty_height: height,
            tty_width: width,
        }
    }

    /// The resize carried by this record, if it should be acted on.
    ///
    /// A record with both dimensions zero carries no resize.
    pub fn size(&self) -> Option<(u16, u16)> {
        if self.tty_height != 0 || self.tty_width != 0 {
            Some((self.tty_height, self.tty_width))
        } else {
            None
        }
    }
}

// Content travels as a base64 string inside the JSON record.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Vec<u8>>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(bytes) => s.serialize_str(&STANDARD.encode(bytes)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Vec<u8>>, D::Error> {
        let encoded: Option<String> = Option::deserialize(d)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(D::Error::custom))
            .transpose()
    }
}
