//! Size-class compression policy (spec §4.5.2, §4.8): small outputs are
//! never worth the zstd framing overhead, so the uploader only compresses
//! once a declared size crosses a threshold.

/// Below this many bytes, compression overhead outweighs the saving.
pub const COMPRESS_THRESHOLD_BYTES: u64 = 100 * 1024;

/// zstd level used for compressed outputs: fast, not maximal ratio — the
/// bundle is a cache, not archival storage, and upload latency matters
/// more than a few percent of size.
pub const ZSTD_LEVEL: i32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionChoice {
    Raw,
    Zstd,
}

/// Decides how a single output of `declared_size` bytes should be staged.
pub fn choose(declared_size: u64) -> CompressionChoice {
    if declared_size > COMPRESS_THRESHOLD_BYTES {
        CompressionChoice::Zstd
    } else {
        CompressionChoice::Raw
    }
}

pub fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    zstd::stream::encode_all(data, ZSTD_LEVEL)
}

pub fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
    zstd::stream::decode_all(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_outputs_stay_raw() {
        assert_eq!(choose(10), CompressionChoice::Raw);
        assert_eq!(choose(COMPRESS_THRESHOLD_BYTES), CompressionChoice::Raw);
    }

    #[test]
    fn large_outputs_compress() {
        assert_eq!(choose(COMPRESS_THRESHOLD_BYTES + 1), CompressionChoice::Zstd);
    }

    #[test]
    fn round_trips() {
        let data = vec![7u8; 4096];
        let compressed = compress(&data).unwrap();
        let restored = decompress(&compressed).unwrap();
        assert_eq!(restored, data);
    }
}
