//! RemoteBundle codec (spec §3, §4.4, component C4): the wire format for
//! the single remote object that packs an index header plus every output
//! payload. Readers never need a directory listing — the header fully
//! describes offsets and sizes within the payload region.

use crate::cache::index::Index;
use crate::model::OutputId;
use crate::pb;
use byteorder::{BigEndian, ByteOrder};
use prost::Message;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

const LENGTH_PREFIX_BYTES: usize = 8;

#[derive(Debug, Error)]
pub enum BundleError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corrupt bundle header: {0}")]
    Decode(#[from] prost::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zstd,
}

impl Compression {
    fn to_proto(self) -> i32 {
        match self {
            Compression::None => pb::Compression::None as i32,
            Compression::Zstd => pb::Compression::Zstd as i32,
        }
    }

    /// Unknown compression codes decode as `None` (spec §4.4 forward
    /// compatibility note).
    fn from_proto(value: i32) -> Compression {
        match pb::Compression::from_i32(value) {
            Some(pb::Compression::Zstd) => Compression::Zstd,
            _ => Compression::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRecord {
    pub output_id: OutputId,
    pub offset: u64,
    pub size: u64,
    pub compression: Compression,
}

#[derive(Debug, Clone)]
pub struct BundleHeader {
    pub index: Index,
    pub outputs: Vec<OutputRecord>,
    pub output_total_size: u64,
}

impl BundleHeader {
    fn to_proto(&self) -> pb::Header {
        pb::Header {
            index: Some(self.index.to_proto()),
            outputs: self
                .outputs
                .iter()
                .map(|o| pb::OutputRecord {
                    output_id: o.output_id.as_bytes().to_vec(),
                    offset: o.offset,
                    size: o.size,
                    compression: o.compression.to_proto(),
                })
                .collect(),
            output_total_size: self.output_total_size,
        }
    }

    fn from_proto(proto: pb::Header) -> BundleHeader {
        BundleHeader {
            index: proto.index.map(Index::from_proto).unwrap_or_default(),
            outputs: proto
                .outputs
                .into_iter()
                .map(|o| OutputRecord {
                    output_id: OutputId(String::from_utf8_lossy(&o.output_id).into_owned()),
                    offset: o.offset,
                    size: o.size,
                    compression: Compression::from_proto(o.compression),
                })
                .collect(),
            output_total_size: proto.output_total_size,
        }
    }

    /// Output records sorted by ascending offset, as readers must see
    /// them (spec §3 invariant).
    pub fn outputs_by_offset(&self) -> Vec<&OutputRecord> {
        let mut sorted: Vec<&OutputRecord> = self.outputs.iter().collect();
        sorted.sort_by_key(|o| o.offset);
        sorted
    }
}

/// Builds the length-prefixed header bytes for a RemoteBundle (spec
/// §4.4 write path). The returned buffer is everything that precedes the
/// payload region.
pub fn create_header(header: &BundleHeader) -> Vec<u8> {
    let body = header.to_proto().encode_to_vec();
    let mut buf = Vec::with_capacity(LENGTH_PREFIX_BYTES + body.len());
    let mut len_bytes = [0u8; LENGTH_PREFIX_BYTES];
    BigEndian::write_u64(&mut len_bytes, body.len() as u64);
    buf.extend_from_slice(&len_bytes);
    buf.extend_from_slice(&body);
    buf
}

/// Reads the 8-byte big-endian length prefix and the header protobuf that
/// follows it (spec §4.4 read path). Returns the parsed header and the
/// byte offset at which the payload region begins (`8 + L`).
pub async fn read_header<R: AsyncRead + Unpin>(
    mut reader: R,
) -> Result<(BundleHeader, u64), BundleError> {
    let mut len_bytes = [0u8; LENGTH_PREFIX_BYTES];
    reader.read_exact(&mut len_bytes).await?;
    let len = BigEndian::read_u64(&len_bytes);

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    let proto = pb::Header::decode(body.as_slice())?;

    Ok((BundleHeader::from_proto(proto), LENGTH_PREFIX_BYTES as u64 + len))
}

/// Parses a header from an already-fetched byte slice (used by the
/// uploader, which retrieves the base header via a small ranged read
/// rather than a stream).
pub fn parse_header(bytes: &[u8]) -> Result<(BundleHeader, u64), BundleError> {
    if bytes.len() < LENGTH_PREFIX_BYTES {
        return Err(BundleError::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "buffer shorter than the length prefix",
        )));
    }
    let len = BigEndian::read_u64(&bytes[..LENGTH_PREFIX_BYTES]);
    let end = LENGTH_PREFIX_BYTES + len as usize;
    let proto = pb::Header::decode(&bytes[LENGTH_PREFIX_BYTES..end])?;
    Ok((BundleHeader::from_proto(proto), end as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ActionId, IndexEntry};
    use std::io::Cursor;

    fn sample_header() -> BundleHeader {
        let mut index = Index::new();
        index.insert(
            ActionId("A".into()),
            IndexEntry {
                output_id: OutputId("O".into()),
                size: 5,
                time_nanos: 1,
                last_used_at: 2,
            },
        );
        BundleHeader {
            index,
            outputs: vec![OutputRecord {
                output_id: OutputId("O".into()),
                offset: 0,
                size: 5,
                compression: Compression::None,
            }],
            output_total_size: 5,
        }
    }

    #[tokio::test]
    async fn round_trips_through_create_and_read() {
        let header = sample_header();
        let bytes = create_header(&header);
        let (restored, payload_offset) = read_header(Cursor::new(bytes.clone())).await.unwrap();
        assert_eq!(payload_offset, bytes.len() as u64);
        assert_eq!(restored.output_total_size, 5);
        assert_eq!(restored.outputs.len(), 1);
        assert_eq!(restored.outputs[0].output_id, OutputId("O".into()));
    }

    #[test]
    fn unknown_compression_code_decodes_as_none() {
        assert_eq!(Compression::from_proto(99), Compression::None);
    }

    #[test]
    fn outputs_by_offset_is_sorted() {
        let header = BundleHeader {
            index: Index::new(),
            outputs: vec![
                OutputRecord {
                    output_id: OutputId("b".into()),
                    offset: 10,
                    size: 1,
                    compression: Compression::None,
                },
                OutputRecord {
                    output_id: OutputId("a".into()),
                    offset: 0,
                    size: 1,
                    compression: Compression::None,
                },
            ],
            output_total_size: 11,
        };
        let sorted = header.outputs_by_offset();
        assert_eq!(sorted[0].output_id, OutputId("a".into()));
        assert_eq!(sorted[1].output_id, OutputId("b".into()));
    }
}
