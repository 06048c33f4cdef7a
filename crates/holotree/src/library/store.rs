//! The sharded blob store underneath the library.
//!
//! Blobs are written to a tempfile while being hashed, then atomically
//! renamed to `<root>/<aa>/<bb>/<digest>`. A crash can only ever leave a
//! tempfile behind, never a half-written blob under a digest name.

use std::{
    io::{Read, Write},
    path::{Path, PathBuf},
};

use holotree_digest::{HashingReader, Sha256};

use crate::codec::{self, BlobReader};

/// The result of storing one blob.
#[derive(Debug, Clone)]
pub struct StoredBlob {
    /// Hex digest of the decompressed content, also the file name.
    pub digest: String,
    /// Original (decompressed) size in bytes.
    pub size: u64,
    /// Whether the stored form is a zstd frame.
    pub compressed: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct BlobStore {
    root: PathBuf,
    tmp: PathBuf,
    no_compress: bool,
    shared: bool,
}

impl BlobStore {
    pub(crate) fn new(root: PathBuf, tmp: PathBuf, no_compress: bool, shared: bool) -> Self {
        BlobStore {
            root,
            tmp,
            no_compress,
            shared,
        }
    }

    /// The storage path for a digest: sharded by the first four hex chars,
    /// file name is the full digest.
    pub(crate) fn path_for_digest(&self, digest: &str) -> PathBuf {
        if digest.len() < 4 {
            return self.root.join(digest);
        }
        self.root
            .join(&digest[0..2])
            .join(&digest[2..4])
            .join(digest)
    }

    pub(crate) fn contains(&self, digest: &str) -> bool {
        self.path_for_digest(digest).is_file()
    }

    /// Stores the file at `source` and returns its digest. Idempotent: an
    /// already present digest leaves the existing blob untouched.
    pub(crate) fn store_file(&self, source: &Path) -> std::io::Result<StoredBlob> {
        let file = fs_err::File::open(source)?;
        self.store_reader(file)
    }

    /// Streams `reader` into the store, hashing the decompressed bytes on
    /// the way through.
    pub(crate) fn store_reader(&self, reader: impl Read) -> std::io::Result<StoredBlob> {
        let mut reader = reader;

        // Peek at the leading bytes to pick the stored form.
        let mut leading = [0u8; 4];
        let mut filled = 0;
        while filled < leading.len() {
            let n = reader.read(&mut leading[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        let compress = codec::should_compress(self.no_compress, &leading[..filled]);
        let chained = std::io::Cursor::new(leading[..filled].to_vec()).chain(reader);
        let mut hashing = HashingReader::<_, Sha256>::new(chained);

        fs_err::create_dir_all(&self.tmp)?;
        let temp_file = tempfile::Builder::new().tempfile_in(&self.tmp)?;
        let (mut file, temp_path) = temp_file.into_parts();
        let size = codec::write_blob(&mut hashing, &mut file, compress)?;
        file.flush()?;
        drop(file);

        let (_, hash) = hashing.finalize();
        let digest = format!("{hash:x}");
        let path = self.path_for_digest(&digest);
        if let Some(parent) = path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        // Blobs are write-once; losing the race to another writer is fine.
        match temp_path.persist_noclobber(&path).map_err(std::io::Error::from) {
            Ok(_) => self.apply_shared_permissions(&path)?,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
            Err(err) => return Err(err),
        }

        Ok(StoredBlob {
            digest,
            size,
            compressed: compress,
        })
    }

    /// Opens a stored blob for reading decompressed bytes.
    pub(crate) fn open(&self, digest: &str) -> std::io::Result<BlobReader> {
        BlobReader::open(&self.path_for_digest(digest))
    }

    /// True when the stored form of a blob is a zstd frame.
    pub(crate) fn is_compressed(&self, digest: &str) -> std::io::Result<bool> {
        BlobReader::is_compressed(&self.path_for_digest(digest))
    }

    /// Re-hashes a stored blob and compares against its name.
    pub(crate) fn check_integrity(&self, digest: &str) -> std::io::Result<bool> {
        let mut hashing = HashingReader::<_, Sha256>::new(self.open(digest)?);
        std::io::copy(&mut hashing, &mut std::io::sink())?;
        let (_, hash) = hashing.finalize();
        Ok(format!("{hash:x}") == digest)
    }

    /// Renames a corrupt blob out of the way with a `.bad` suffix and
    /// returns the quarantine path.
    pub(crate) fn quarantine(&self, digest: &str) -> std::io::Result<PathBuf> {
        let path = self.path_for_digest(digest);
        let quarantined = path.with_file_name(format!("{digest}.bad"));
        fs_err::rename(&path, &quarantined)?;
        tracing::warn!(
            "quarantined corrupt blob {digest} at '{}'",
            quarantined.display()
        );
        Ok(quarantined)
    }

    fn apply_shared_permissions(&self, path: &Path) -> std::io::Result<()> {
        if !self.shared {
            return Ok(());
        }
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs_err::set_permissions(path, std::fs::Permissions::from_mode(0o664))?;
        }
        #[cfg(not(unix))]
        {
            let _ = path;
        }
        Ok(())
    }
}
