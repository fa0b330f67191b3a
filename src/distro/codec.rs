//! Payload Codec
//!
//! Encodes the key -> record maps carried in a [`SyncPayload`](super::data::SyncPayload).

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::network::FrameHeader;

/// Serialization format of payload content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    Bincode,
    Json,
}

/// Swappable encoder for payload content
#[derive(Debug, Clone, Copy)]
pub struct DistroCodec {
    format: WireFormat,
    compress: bool,
}

impl Default for DistroCodec {
    fn default() -> Self {
        Self::new(WireFormat::Bincode, false)
    }
}

impl DistroCodec {
    pub fn new(format: WireFormat, compress: bool) -> Self {
        Self { format, compress }
    }

    pub fn format(&self) -> WireFormat {
        self.format
    }

    /// Encode a value
    pub fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        let raw = match self.format {
            WireFormat::Bincode => bincode::serialize(value)?,
            WireFormat::Json => serde_json::to_vec(value)?,
        };

        if self.compress {
            Ok(lz4_flex::compress_prepend_size(&raw))
        } else {
            Ok(raw)
        }
    }

    /// Decode a value; any malformed input is a codec error
    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let decompressed;
        let raw = if self.compress {
            check_prepended_size(bytes)?;
            decompressed = lz4_flex::decompress_size_prepended(bytes)
                .map_err(|e| Error::Codec(format!("decompression failed: {}", e)))?;
            decompressed.as_slice()
        } else {
            bytes
        };

        match self.format {
            WireFormat::Bincode => {
                bincode::deserialize(raw).map_err(|e| Error::Codec(e.to_string()))
            }
            WireFormat::Json => serde_json::from_slice(raw).map_err(|e| Error::Codec(e.to_string())),
        }
    }
}

/// Reject a size prefix larger than any frame before allocating for it
fn check_prepended_size(bytes: &[u8]) -> Result<()> {
    let prefix: [u8; 4] = bytes
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| Error::Codec("missing decompressed size".into()))?;

    let size = u32::from_le_bytes(prefix);
    if size > FrameHeader::MAX_LENGTH {
        return Err(Error::Codec(format!(
            "decompressed size {} exceeds limit {}",
            size,
            FrameHeader::MAX_LENGTH
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Datum, Instance};
    use std::collections::BTreeMap;

    fn sample() -> BTreeMap<String, Datum> {
        let mut datum = Datum::empty_instances("svc:A");
        datum
            .value
            .as_instances_mut()
            .unwrap()
            .add(&[Instance::new("10.0.0.1", 8080)]);
        datum.timestamp = 42;

        let mut map = BTreeMap::new();
        map.insert("svc:A".to_string(), datum);
        map
    }

    #[test]
    fn test_every_format_decodes_what_it_encodes() {
        for codec in [
            DistroCodec::new(WireFormat::Bincode, false),
            DistroCodec::new(WireFormat::Json, false),
            DistroCodec::new(WireFormat::Bincode, true),
            DistroCodec::new(WireFormat::Json, true),
        ] {
            let bytes = codec.encode(&sample()).unwrap();
            let decoded: BTreeMap<String, Datum> = codec.decode(&bytes).unwrap();
            assert_eq!(decoded, sample());
        }
    }

    #[test]
    fn test_malformed_input_is_codec_error() {
        let codec = DistroCodec::new(WireFormat::Json, false);
        let result: Result<BTreeMap<String, Datum>> = codec.decode(b"{not json");
        assert!(matches!(result, Err(Error::Codec(_))));

        let compressed = DistroCodec::new(WireFormat::Bincode, true);
        let result: Result<BTreeMap<String, Datum>> = compressed.decode(&[1, 2]);
        assert!(matches!(result, Err(Error::Codec(_))));
    }

    #[test]
    fn test_oversized_decompressed_length_is_rejected() {
        let codec = DistroCodec::new(WireFormat::Bincode, true);
        let mut bytes = u32::MAX.to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0x10, 0x61]);

        let result: Result<BTreeMap<String, Datum>> = codec.decode(&bytes);
        match result {
            Err(Error::Codec(reason)) => assert!(reason.contains("exceeds limit")),
            other => panic!("expected codec error, got {:?}", other),
        }
    }
}
