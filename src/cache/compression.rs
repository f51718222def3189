use std::io::{self, Read, Write};

use flate2::{Compression as Level, read::ZlibDecoder, write::ZlibEncoder};

/// Value transform applied to blobs held by the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    #[default]
    None,
    /// zlib at the given level (0-9).
    Zlib(u32),
}

impl Compression {
    pub fn zlib() -> Self {
        Compression::Zlib(Level::default().level())
    }

    pub(crate) fn compress(&self, blob: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Compression::None => Ok(blob.to_vec()),
            Compression::Zlib(level) => {
                let mut encoder = ZlibEncoder::new(Vec::new(), Level::new((*level).min(9)));
                encoder.write_all(blob)?;
                encoder.finish()
            }
        }
    }

    pub(crate) fn decompress(&self, stored: &[u8]) -> io::Result<Vec<u8>> {
        match self {
            Compression::None => Ok(stored.to_vec()),
            Compression::Zlib(_) => {
                let mut out = Vec::new();
                ZlibDecoder::new(stored).read_to_end(&mut out)?;
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zlib_shrinks_repetitive_blobs() {
        let blob = vec![7u8; 64 * 1024];
        let stored = Compression::zlib().compress(&blob).unwrap();

        assert!(stored.len() < blob.len() / 10);
        assert_eq!(Compression::zlib().decompress(&stored).unwrap(), blob);
    }

    #[test]
    fn none_is_identity() {
        let stored = Compression::None.compress(b"sweep").unwrap();
        assert_eq!(stored, b"sweep".to_vec());
    }

    #[test]
    fn garbage_fails_to_inflate() {
        assert!(Compression::zlib().decompress(b"not zlib").is_err());
    }
}
