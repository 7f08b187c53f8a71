use super::artifact::Codec;
use super::modifier::StreamModifier;
use super::stream::BackupStream;
use crate::error::Result;
use async_compression::tokio::bufread::GzipEncoder;
use async_compression::Level;
use async_trait::async_trait;
use tokio::io::BufReader;

const READ_BUFFER: usize = 64 * 1024;
const COMPRESSION_LEVEL: i32 = 6;

/// Gzip stage. Always present and never skipped.
pub struct Gzip {
    level: Level,
}

impl Gzip {
    pub fn new() -> Self {
        Self {
            level: Level::Precise(COMPRESSION_LEVEL),
        }
    }
}

impl Default for Gzip {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StreamModifier for Gzip {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn required(&self) -> bool {
        true
    }

    fn codec(&self) -> Option<Codec> {
        Some(Codec::Gzip)
    }

    fn apply(&mut self, stream: BackupStream) -> Result<BackupStream> {
        let reader = BufReader::with_capacity(READ_BUFFER, stream);
        Ok(Box::new(GzipEncoder::with_quality(reader, self.level)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::bufread::GzipDecoder;
    use std::io::Cursor;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_gzip_stream_decodes_back() {
        let data = b"-- Test SQL content\nSELECT * FROM test;\n".repeat(1000);
        let mut encoded = Gzip::new()
            .apply(Box::new(Cursor::new(data.clone())))
            .unwrap();
        let mut compressed = Vec::new();
        encoded.read_to_end(&mut compressed).await.unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(&compressed[..2], &[0x1f, 0x8b]);

        let mut decoder = GzipDecoder::new(Cursor::new(compressed));
        let mut decoded = Vec::new();
        decoder.read_to_end(&mut decoded).await.unwrap();
        assert_eq!(decoded, data);
    }
}
