//! Opening bundles, including the appended-ZIP form.
//!
//! An appended bundle is an arbitrary prefix followed by a valid ZIP. The
//! end-of-central-directory record sits in the last 64 KiB + 22 bytes of the
//! file; from its recorded central-directory size and offset the start of
//! the embedded archive can be computed, and the archive is then read
//! through an offset-adjusting reader.

use std::{
    fs::File,
    io::{Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use zip::ZipArchive;

use crate::BundleError;

/// The end-of-central-directory signature, little-endian on disk.
const EOCD_SIGNATURE: [u8; 4] = [0x50, 0x4b, 0x05, 0x06];

/// Maximum ZIP comment length plus the fixed EOCD size.
const EOCD_SCAN_WINDOW: u64 = 64 * 1024 + 22;

/// A reader presenting a suffix of the underlying file as if it started at
/// byte zero, so the zip machinery sees a self-consistent archive.
#[derive(Debug)]
pub struct OffsetReader<R> {
    inner: R,
    offset: u64,
}

impl<R: Read + Seek> OffsetReader<R> {
    /// Wraps `inner`, hiding the first `offset` bytes.
    pub fn new(mut inner: R, offset: u64) -> std::io::Result<Self> {
        inner.seek(SeekFrom::Start(offset))?;
        Ok(OffsetReader { inner, offset })
    }
}

impl<R: Read> Read for OffsetReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.inner.read(buf)
    }
}

impl<R: Seek> Seek for OffsetReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let adjusted = match pos {
            SeekFrom::Start(p) => SeekFrom::Start(p + self.offset),
            relative => relative,
        };
        let absolute = self.inner.seek(adjusted)?;
        absolute.checked_sub(self.offset).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before the start of the embedded archive",
            )
        })
    }
}

/// A bundle opened for reading: either a plain archive or one discovered
/// behind an arbitrary prefix.
#[derive(Debug)]
pub enum Bundle {
    /// The file was a ZIP from byte zero.
    Plain(ZipArchive<File>),
    /// The archive starts at a non-zero offset.
    Appended(ZipArchive<OffsetReader<File>>),
}

impl Bundle {
    /// Entry names in archive order.
    pub fn entry_names(&self) -> Vec<String> {
        match self {
            Bundle::Plain(archive) => archive.file_names().map(str::to_owned).collect(),
            Bundle::Appended(archive) => archive.file_names().map(str::to_owned).collect(),
        }
    }

    /// Reads one entry fully into memory.
    pub fn read_entry(&mut self, name: &str) -> Result<Vec<u8>, BundleError> {
        let mut bytes = Vec::new();
        match self {
            Bundle::Plain(archive) => archive.by_name(name)?.read_to_end(&mut bytes)?,
            Bundle::Appended(archive) => archive.by_name(name)?.read_to_end(&mut bytes)?,
        };
        Ok(bytes)
    }

    /// True when the archive has an entry of this exact name.
    pub fn has_entry(&self, name: &str) -> bool {
        match self {
            Bundle::Plain(archive) => archive.index_for_name(name).is_some(),
            Bundle::Appended(archive) => archive.index_for_name(name).is_some(),
        }
    }

    /// Runs `visit` for every entry, in archive order. The visitor receives
    /// the entry name and a reader over its decompressed payload.
    pub fn for_each_entry(
        &mut self,
        mut visit: impl FnMut(&str, &mut dyn Read) -> Result<(), BundleError>,
    ) -> Result<(), BundleError> {
        let count = match self {
            Bundle::Plain(archive) => archive.len(),
            Bundle::Appended(archive) => archive.len(),
        };
        for index in 0..count {
            match self {
                Bundle::Plain(archive) => {
                    let mut entry = archive.by_index(index)?;
                    if entry.is_dir() {
                        continue;
                    }
                    let name = entry.name().to_owned();
                    visit(&name, &mut entry)?;
                }
                Bundle::Appended(archive) => {
                    let mut entry = archive.by_index(index)?;
                    if entry.is_dir() {
                        continue;
                    }
                    let name = entry.name().to_owned();
                    visit(&name, &mut entry)?;
                }
            }
        }
        Ok(())
    }
}

/// Opens a bundle, discovering an embedded archive behind an arbitrary
/// prefix when the file is not a plain ZIP.
pub fn open_bundle(path: &Path) -> Result<Bundle, BundleError> {
    let file = fs_err::File::open(path)?.into_parts().0;
    match ZipArchive::new(file) {
        Ok(archive) => Ok(Bundle::Plain(archive)),
        Err(zip_err) => {
            tracing::debug!(
                "'{}' is not a plain zip ({zip_err}), scanning for an appended archive",
                path.display()
            );
            let mut file = fs_err::File::open(path)?.into_parts().0;
            let offset = find_embedded_zip_offset(&mut file)?
                .ok_or_else(|| BundleError::NotABundle(path.to_path_buf()))?;
            let reader = OffsetReader::new(file, offset)?;
            Ok(Bundle::Appended(ZipArchive::new(reader)?))
        }
    }
}

/// Scans the tail of `file` for an end-of-central-directory record and
/// computes the byte offset at which the embedded archive starts. Returns
/// `None` when no EOCD signature is present.
pub fn find_embedded_zip_offset(file: &mut File) -> std::io::Result<Option<u64>> {
    let len = file.metadata()?.len();
    let window = len.min(EOCD_SCAN_WINDOW);
    file.seek(SeekFrom::Start(len - window))?;
    let mut tail = vec![0u8; window as usize];
    file.read_exact(&mut tail)?;

    // Latest EOCD wins; scan backwards.
    for pos in (0..tail.len().saturating_sub(21)).rev() {
        if tail[pos..pos + 4] != EOCD_SIGNATURE {
            continue;
        }
        let record = &tail[pos..];
        if record.len() < 22 {
            continue;
        }
        let cd_size = u64::from(u32::from_le_bytes(
            record[12..16].try_into().expect("slice length is fixed"),
        ));
        let cd_offset = u64::from(u32::from_le_bytes(
            record[16..20].try_into().expect("slice length is fixed"),
        ));
        let eocd_absolute = len - window + pos as u64;
        let Some(cd_start) = eocd_absolute.checked_sub(cd_size) else {
            continue;
        };
        let Some(archive_start) = cd_start.checked_sub(cd_offset) else {
            continue;
        };
        return Ok(Some(archive_start));
    }
    Ok(None)
}

/// The destination path for an entry extracted under `root`, or a traversal
/// error when the entry name escapes it.
pub fn safe_destination(root: &Path, entry_name: &str) -> Result<PathBuf, BundleError> {
    let mut sanitized = PathBuf::new();
    for component in Path::new(entry_name).components() {
        match component {
            std::path::Component::Normal(part) => sanitized.push(part),
            std::path::Component::CurDir => {}
            _ => return Err(BundleError::PathTraversal(entry_name.to_owned())),
        }
    }
    if sanitized.as_os_str().is_empty() {
        return Err(BundleError::PathTraversal(entry_name.to_owned()));
    }
    Ok(root.join(sanitized))
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use assert_matches::assert_matches;
    use rstest::rstest;
    use zip::write::SimpleFileOptions;

    use super::{find_embedded_zip_offset, open_bundle, safe_destination};
    use crate::BundleError;

    fn write_test_zip(path: &std::path::Path, prefix: &[u8]) {
        // Built standalone and concatenated after the prefix, the way real
        // launcher stubs are produced: internal offsets are relative to the
        // start of the archive, not the file.
        let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
        writer
            .start_file("envs/demo/conda.yaml", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"channels: [conda-forge]\n").unwrap();
        writer
            .start_file("robot/task.py", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"print('hi')\n").unwrap();
        let archive = writer.finish().unwrap().into_inner();

        let mut file = std::fs::File::create(path).unwrap();
        file.write_all(prefix).unwrap();
        file.write_all(&archive).unwrap();
    }

    #[rstest]
    #[case::no_prefix(0)]
    #[case::small_prefix(17)]
    #[case::script_stub(4096)]
    fn bundles_open_with_any_prefix(#[case] prefix_len: usize) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bundle.zip");
        write_test_zip(&path, &vec![0xAB; prefix_len]);

        let mut bundle = open_bundle(&path).unwrap();
        let names = bundle.entry_names();
        assert_eq!(names, vec!["envs/demo/conda.yaml", "robot/task.py"]);
        assert_eq!(
            bundle.read_entry("envs/demo/conda.yaml").unwrap(),
            b"channels: [conda-forge]\n"
        );
    }

    #[test]
    fn offset_scan_finds_the_prefix_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stubbed.bin");
        write_test_zip(&path, &[0x55; 1234]);
        let mut file = std::fs::File::open(&path).unwrap();
        assert_eq!(find_embedded_zip_offset(&mut file).unwrap(), Some(1234));
    }

    #[test]
    fn garbage_is_not_a_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("noise.bin");
        std::fs::write(&path, vec![0x13; 4096]).unwrap();
        assert_matches!(
            open_bundle(&path),
            Err(BundleError::NotABundle(_) | BundleError::Zip(_))
        );
    }

    #[test]
    fn appended_payloads_match_plain_payloads() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain.zip");
        let appended = dir.path().join("appended.zip");
        write_test_zip(&plain, b"");
        write_test_zip(&appended, &[0x90; 4096]);

        let mut plain = open_bundle(&plain).unwrap();
        let mut appended = open_bundle(&appended).unwrap();
        assert_eq!(plain.entry_names(), appended.entry_names());
        for name in plain.entry_names() {
            assert_eq!(
                plain.read_entry(&name).unwrap(),
                appended.read_entry(&name).unwrap(),
                "payload mismatch for {name}"
            );
        }
    }

    #[rstest]
    #[case("../../etc/passwd")]
    #[case("/etc/passwd")]
    #[case("robot/../../../x")]
    #[case("")]
    fn traversal_names_are_rejected(#[case] name: &str) {
        let err = safe_destination(std::path::Path::new("/dest"), name).unwrap_err();
        assert_matches!(err, BundleError::PathTraversal(_));
    }

    #[test]
    fn normal_names_land_under_the_root() {
        let dest =
            safe_destination(std::path::Path::new("/dest"), "robot/tasks/main.py").unwrap();
        assert_eq!(dest, std::path::Path::new("/dest/robot/tasks/main.py"));
    }
}
