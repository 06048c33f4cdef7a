//! The blob storage codec: raw or zstd-compressed, dispatched at read time.
//!
//! Raw blobs are stored byte-identical so spaces can hardlink them straight
//! out of the library. Compressed blobs are plain zstd frames, recognized by
//! the frame magic. Content that itself begins with the zstd magic is always
//! stored compressed so the read-side dispatch stays unambiguous.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

/// The zstd frame magic number, little-endian on disk.
pub const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// The compression level used for stored blobs.
const COMPRESSION_LEVEL: i32 = 3;

/// Whether a blob about to be stored should be compressed, given the global
/// flag and the first bytes of its content.
pub fn should_compress(no_compress: bool, leading: &[u8]) -> bool {
    !no_compress || leading.starts_with(&ZSTD_MAGIC)
}

/// Copies `reader` into `writer`, compressing when requested. Returns the
/// number of bytes read from `reader` (the original size).
pub fn write_blob(
    mut reader: impl Read,
    writer: &mut impl std::io::Write,
    compress: bool,
) -> std::io::Result<u64> {
    if compress {
        let mut encoder = zstd::stream::write::Encoder::new(writer, COMPRESSION_LEVEL)?;
        let copied = std::io::copy(&mut reader, &mut encoder)?;
        encoder.finish()?;
        Ok(copied)
    } else {
        std::io::copy(&mut reader, writer)
    }
}

/// A reader over a stored blob that transparently decompresses. Both forms
/// are accepted regardless of how the library is currently configured.
pub enum BlobReader {
    /// The blob was stored raw.
    Raw(BufReader<File>),
    /// The blob was stored as a zstd frame.
    Compressed(Box<zstd::stream::read::Decoder<'static, BufReader<File>>>),
}

impl std::fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlobReader::Raw(_) => f.debug_tuple("Raw").finish(),
            BlobReader::Compressed(_) => f.debug_tuple("Compressed").finish(),
        }
    }
}

impl BlobReader {
    /// Opens a stored blob for reading decompressed bytes.
    pub fn open(path: &Path) -> std::io::Result<Self> {
        let mut file = fs_err::File::open(path)?.into_parts().0;
        if stored_compressed(&mut file)? {
            Ok(BlobReader::Compressed(Box::new(
                zstd::stream::read::Decoder::new(file)?,
            )))
        } else {
            Ok(BlobReader::Raw(BufReader::new(file)))
        }
    }

    /// True when the blob at `path` is stored compressed. Compressed blobs
    /// cannot be hardlinked into spaces.
    pub fn is_compressed(path: &Path) -> std::io::Result<bool> {
        let mut file = fs_err::File::open(path)?.into_parts().0;
        stored_compressed(&mut file)
    }
}

fn stored_compressed(file: &mut File) -> std::io::Result<bool> {
    use std::io::Seek;
    let mut magic = [0u8; 4];
    let compressed = match file.read_exact(&mut magic) {
        Ok(()) => magic == ZSTD_MAGIC,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => false,
        Err(e) => return Err(e),
    };
    file.rewind()?;
    Ok(compressed)
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            BlobReader::Raw(reader) => reader.read(buf),
            BlobReader::Compressed(decoder) => decoder.read(buf),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use rstest::rstest;

    use super::{should_compress, write_blob, BlobReader, ZSTD_MAGIC};

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn round_trips_both_forms(#[case] compress: bool) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let content = b"import this\n".repeat(64);

        let mut file = std::fs::File::create(&path).unwrap();
        write_blob(&content[..], &mut file, compress).unwrap();
        drop(file);

        assert_eq!(BlobReader::is_compressed(&path).unwrap(), compress);
        let mut read_back = Vec::new();
        BlobReader::open(&path)
            .unwrap()
            .read_to_end(&mut read_back)
            .unwrap();
        assert_eq!(read_back, content);
    }

    #[test]
    fn content_starting_with_magic_is_forced_compressed() {
        let mut leading = ZSTD_MAGIC.to_vec();
        leading.extend_from_slice(b"not really a frame");
        assert!(should_compress(true, &leading));
        assert!(should_compress(false, &leading));
        assert!(!should_compress(true, b"plain"));
        assert!(should_compress(false, b"plain"));
    }

    #[test]
    fn empty_blob_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        let mut file = std::fs::File::create(&path).unwrap();
        write_blob(&b""[..], &mut file, false).unwrap();
        drop(file);

        assert!(!BlobReader::is_compressed(&path).unwrap());
        let mut read_back = Vec::new();
        BlobReader::open(&path)
            .unwrap()
            .read_to_end(&mut read_back)
            .unwrap();
        assert!(read_back.is_empty());
    }
}
