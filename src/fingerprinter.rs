use std::{
    fmt, fs,
    io::{self, Read, Seek, SeekFrom},
    path::Path,
};

use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// Number of leading bytes that participate in a file's identity hash.
pub const FINGERPRINT_BYTES: usize = 512;

/// MD5 digest of the leading bytes of a file, used as a stable identifier
/// across sessions and process restarts.
///
/// Collision resistance is not required; the digest only has to tell log
/// files apart with reasonable confidence. Rendered as 32 lowercase hex
/// characters.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; 16]);

impl Fingerprint {
    pub fn to_hex(self) -> String {
        self.to_string()
    }

    pub fn from_hex(s: &str) -> Option<Fingerprint> {
        if s.len() != 32 || !s.is_ascii() {
            return None;
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hi = (chunk[0] as char).to_digit(16)?;
            let lo = (chunk[1] as char).to_digit(16)?;
            bytes[i] = ((hi << 4) | lo) as u8;
        }
        Some(Fingerprint(bytes))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self)
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s)
            .ok_or_else(|| de::Error::custom("expected 32 lowercase hex characters"))
    }
}

/// Digest over a prefix shorter than the full identity length, captured
/// while the file is still too small to fingerprint. Only good for
/// comparison against a same-length prefix of whatever sits at the path.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct PrefixHash {
    pub bytes: usize,
    pub digest: Fingerprint,
}

/// Three-way outcome of comparing the on-disk prefix hash with the hash of
/// the file the tailer currently holds.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HashComparison {
    Equal,
    Differs,
    Undecided,
}

/// Computes identity and comparison digests over file prefixes.
#[derive(Clone)]
pub struct Fingerprinter {
    bytes: usize,
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Fingerprinter::new(FINGERPRINT_BYTES)
    }
}

impl Fingerprinter {
    pub fn new(bytes: usize) -> Fingerprinter {
        Fingerprinter { bytes }
    }

    /// Identity fingerprint of the file at `path`.
    ///
    /// Returns `Ok(None)` when the file holds fewer than the required number
    /// of prefix bytes, including when it is truncated concurrently with the
    /// read; the rotation detector falls back to size and timestamp signals.
    pub fn fingerprint(&self, path: &Path) -> io::Result<Option<Fingerprint>> {
        let mut file = fs::File::open(path)?;
        read_prefix_exact(&mut file, self.bytes)
    }

    /// Identity fingerprint computed from an already-open handle.
    ///
    /// The handle's cursor is restored before returning, so this is safe to
    /// call mid-read.
    pub fn fingerprint_of(&self, file: &mut fs::File) -> io::Result<Option<Fingerprint>> {
        let restore = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;
        let result = read_prefix_exact(file, self.bytes);
        file.seek(SeekFrom::Start(restore))?;
        result
    }

    /// Digest of exactly the first `bytes` bytes of the file at `path`, or
    /// `None` when the file is shorter than that.
    pub fn prefix_hash(&self, path: &Path, bytes: usize) -> io::Result<Option<PrefixHash>> {
        let mut file = fs::File::open(path)?;
        let digest = read_prefix_exact(&mut file, bytes)?;
        Ok(digest.map(|digest| PrefixHash { bytes, digest }))
    }

    /// Digest of whatever prefix an open handle currently has, up to the
    /// identity length. `None` for an empty file. Cursor is restored.
    pub fn prefix_hash_of(&self, file: &mut fs::File) -> io::Result<Option<PrefixHash>> {
        let restore = file.stream_position()?;
        file.seek(SeekFrom::Start(0))?;
        let mut buffer = Vec::with_capacity(self.bytes);
        let result = file.by_ref().take(self.bytes as u64).read_to_end(&mut buffer);
        file.seek(SeekFrom::Start(restore))?;
        let read = result?;
        if read == 0 {
            return Ok(None);
        }
        Ok(Some(PrefixHash {
            bytes: read,
            digest: digest_of(&buffer[..read]),
        }))
    }
}

fn digest_of(bytes: &[u8]) -> Fingerprint {
    Fingerprint(Md5::digest(bytes).into())
}

/// Read exactly `bytes` leading bytes and digest them. A short file, or one
/// shortened while we read it, yields `Ok(None)`.
fn read_prefix_exact(file: &mut fs::File, bytes: usize) -> io::Result<Option<Fingerprint>> {
    let mut buffer = vec![0u8; bytes];
    match read_full(file, &mut buffer) {
        Ok(()) => Ok(Some(digest_of(&buffer))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e),
    }
}

fn read_full(reader: &mut impl Read, mut buf: &mut [u8]) -> io::Result<()> {
    while !buf.is_empty() {
        match reader.read(buf) {
            Ok(0) => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "EOF reached")),
            Ok(n) => buf = &mut buf[n..],
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Immutable snapshot of a path's length and modification time.
#[derive(Clone, Debug)]
pub struct Attributes {
    len: u64,
    modified: DateTime<Utc>,
    newer: bool,
}

impl Attributes {
    /// Stat `path` and record whether it was modified strictly after
    /// `last_checked`.
    pub fn of(path: &Path, last_checked: DateTime<Utc>) -> io::Result<Attributes> {
        let metadata = fs::metadata(path)?;
        let modified = metadata
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(Attributes {
            len: metadata.len(),
            modified,
            newer: modified > last_checked,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn modified(&self) -> DateTime<Utc> {
        self.modified
    }

    pub fn newer(&self) -> bool {
        self.newer
    }
}
