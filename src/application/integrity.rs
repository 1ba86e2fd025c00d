//! # Integrity Verification
//!
//! Checksums are computed while the artifact is being written, never by
//! re-reading it. `ArtifactSink` fans every byte out to the staging file, a
//! whole-object MD5 and a per-part MD5, so after the single write pass we
//! know both the plain content hash and the ETag S3 will report for a
//! multipart upload of the same bytes.

use log::debug;
use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tempfile::TempPath;

use crate::domain::errors::Result;

/// Objects at or above this size are uploaded in parts. Smaller ones go up in
/// one PUT read fully into memory, so this is also the per-worker memory bound
/// for single uploads.
pub const MULTIPART_THRESHOLD: u64 = 100 * 1024 * 1024;
pub const DEFAULT_PART_SIZE: u64 = 64 * 1024 * 1024;
/// S3 rejects non-final parts smaller than this.
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;

/// ETag of a multipart object: `hex(md5(raw_1 ‖ … ‖ raw_n))-n`.
pub fn multipart_etag(part_digests: &[[u8; 16]]) -> String {
    let mut hasher = Md5::new();
    for digest in part_digests {
        hasher.update(digest);
    }
    format!("{}-{}", hex::encode(hasher.finalize()), part_digests.len())
}

/// Plain MD5 as lowercase hex.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(Md5::digest(data))
}

/// Counts bytes passing through to `inner`.
pub struct CountingWriter<W> {
    inner: W,
    count: u64,
}

impl<W: Write> CountingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, count: 0 }
    }

    pub fn count(&self) -> u64 {
        self.count
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.count += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// What the write pass learned about the staged bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkDigest {
    pub size: u64,
    pub md5_hex: String,
    pub part_digests: Vec<[u8; 16]>,
}

/// Fan-out writer: staging file + whole-object MD5 + per-part MD5.
pub struct ArtifactSink {
    file: BufWriter<File>,
    whole: Md5,
    part: Md5,
    part_size: u64,
    part_filled: u64,
    part_digests: Vec<[u8; 16]>,
    size: u64,
}

impl ArtifactSink {
    pub fn new(file: File, part_size: u64) -> Self {
        Self {
            file: BufWriter::with_capacity(256 * 1024, file),
            whole: Md5::new(),
            part: Md5::new(),
            part_size: part_size.max(1),
            part_filled: 0,
            part_digests: Vec::new(),
            size: 0,
        }
    }

    fn close_part(&mut self) {
        let digest = std::mem::take(&mut self.part).finalize();
        self.part_digests.push(digest.into());
        self.part_filled = 0;
    }

    /// Flushes the file and finalizes both hashes.
    pub fn finalize(mut self) -> Result<SinkDigest> {
        self.file.flush()?;
        self.file.get_ref().sync_all()?;
        if self.part_filled > 0 {
            self.close_part();
        }
        Ok(SinkDigest {
            size: self.size,
            md5_hex: hex::encode(self.whole.finalize()),
            part_digests: self.part_digests,
        })
    }
}

impl Write for ArtifactSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        let written = &buf[..n];
        self.whole.update(written);

        let mut rest = written;
        while !rest.is_empty() {
            let room = (self.part_size - self.part_filled) as usize;
            let take = room.min(rest.len());
            self.part.update(&rest[..take]);
            self.part_filled += take as u64;
            rest = &rest[take..];
            if self.part_filled == self.part_size {
                self.close_part();
            }
        }

        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

/// A fully written, checksummed artifact awaiting upload.
///
/// The file lives exactly as long as this value.
#[derive(Debug)]
pub struct StagedArtifact {
    path: TempPath,
    pub size: u64,
    /// Hex MD5 of the whole file.
    pub content_hash: String,
    /// Set when `size` reaches the multipart threshold.
    pub multipart_etag: Option<String>,
    pub part_size: u64,
    /// Serialized bytes before the external compressor. 0 for formats that
    /// compress internally.
    pub uncompressed_size: u64,
    pub row_count: u64,
}

impl StagedArtifact {
    pub fn new(path: TempPath, digest: SinkDigest, part_size: u64, uncompressed_size: u64, row_count: u64) -> Self {
        let multipart_etag = (digest.size >= MULTIPART_THRESHOLD)
            .then(|| multipart_etag(&digest.part_digests));
        debug!(
            "Staged {} ({} bytes, md5 {}, {} parts)",
            path.display(),
            digest.size,
            digest.md5_hex,
            digest.part_digests.len()
        );
        Self {
            path,
            size: digest.size,
            content_hash: digest.md5_hex,
            multipart_etag,
            part_size,
            uncompressed_size,
            row_count,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_multipart(&self) -> bool {
        self.multipart_etag.is_some()
    }

    /// The ETag the destination must report after upload.
    pub fn expected_etag(&self) -> &str {
        self.multipart_etag.as_deref().unwrap_or(&self.content_hash)
    }

    /// Whether a remote object with this size and ETag holds the same bytes.
    pub fn matches_remote(&self, size: u64, etag: Option<&str>) -> bool {
        size == self.size && etag == Some(self.expected_etag())
    }

    /// Copy of the path for diagnostics; the file is still removed on drop.
    pub fn display_path(&self) -> PathBuf {
        self.path.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sink_digest(data: &[u8], part_size: u64, writes: usize) -> SinkDigest {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join("a.bin")).unwrap();
        let mut sink = ArtifactSink::new(file, part_size);
        for piece in data.chunks((data.len() / writes).max(1)) {
            sink.write_all(piece).unwrap();
        }
        sink.finalize().unwrap()
    }

    #[test]
    fn test_multipart_etag_two_parts() {
        let h1 = Md5::digest(b"first part");
        let h2 = Md5::digest(b"second part");
        let mut concat = Vec::new();
        concat.extend_from_slice(&h1);
        concat.extend_from_slice(&h2);
        let expected = format!("{}-2", md5_hex(&concat));

        assert_eq!(multipart_etag(&[h1.into(), h2.into()]), expected);
    }

    #[test]
    fn test_sink_hashes_match_one_shot() {
        let data: Vec<u8> = (0..10_000u32).flat_map(|i| i.to_le_bytes()).collect();
        let digest = sink_digest(&data, 7_000, 13);

        assert_eq!(digest.size, data.len() as u64);
        assert_eq!(digest.md5_hex, md5_hex(&data));

        let expected_parts: Vec<[u8; 16]> = data
            .chunks(7_000)
            .map(|c| Md5::digest(c).into())
            .collect();
        assert_eq!(digest.part_digests, expected_parts);
    }

    #[test]
    fn test_part_boundaries_independent_of_write_sizes() {
        let data = vec![42u8; 50_000];
        let a = sink_digest(&data, 4_096, 1);
        let b = sink_digest(&data, 4_096, 97);
        assert_eq!(a, b);
        assert_eq!(a.part_digests.len(), 13);
    }

    #[test]
    fn test_staged_artifact_removes_file_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let tmp = tempfile::NamedTempFile::new_in(dir.path()).unwrap();
        let (file, path) = tmp.into_parts();
        let mut sink = ArtifactSink::new(file, DEFAULT_PART_SIZE);
        sink.write_all(b"hello").unwrap();
        let staged = StagedArtifact::new(path, sink.finalize().unwrap(), DEFAULT_PART_SIZE, 5, 1);

        let on_disk = staged.display_path();
        assert!(on_disk.exists());
        assert!(!staged.is_multipart());
        assert_eq!(staged.expected_etag(), md5_hex(b"hello"));
        assert!(staged.matches_remote(5, Some(md5_hex(b"hello").as_str())));
        assert!(!staged.matches_remote(5, None));

        drop(staged);
        assert!(!on_disk.exists());
    }
}
