//! Core types for the restack object model.
//!
//! These types form the vocabulary shared between the
//! [`ObjectStore`](crate::ObjectStore) trait and the engines built on top of
//! it. They contain no process or backend details: parsing and formatting
//! only.

use std::fmt;
use std::io;
use std::str::FromStr;

use bstr::{BString, ByteSlice};
use serde::{Deserialize, Serialize, Serializer};

use crate::error::GitError;

// ---------------------------------------------------------------------------
// Hash
// ---------------------------------------------------------------------------

/// Longest hex form we accept (SHA-256 object ids).
const MAX_HEX: usize = 64;

/// Shortest abbreviation git will accept for an object id.
const MIN_HEX: usize = 4;

/// A git object identifier, kept in its lowercase hex form.
///
/// Holds full SHA-1 (40 chars) and SHA-256 (64 chars) ids as well as
/// abbreviations, so it is stored as an inline ASCII buffer to keep `Copy`
/// semantics. Hashes are only ever produced by the store; callers treat them
/// as opaque tokens.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hash {
    hex: [u8; MAX_HEX],
    len: u8,
}

impl Hash {
    /// The zero hash (`0000...0000`), meaning "absent object".
    pub const ZERO: Self = Self::zeroes(40);

    const fn zeroes(len: usize) -> Self {
        let mut hex = [0u8; MAX_HEX];
        let mut i = 0;
        while i < len {
            hex[i] = b'0';
            i += 1;
        }
        // len <= MAX_HEX, which fits in a u8.
        #[allow(clippy::cast_possible_truncation)]
        let len = len as u8;
        Self { hex, len }
    }

    /// Return the hex form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        std::str::from_utf8(&self.hex[..usize::from(self.len)]).unwrap_or_default()
    }

    /// Return `true` if every digit is `0`.
    ///
    /// Abbreviated zero hashes count as zero too.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.hex[..usize::from(self.len)].iter().all(|&b| b == b'0')
    }

    /// The 7-character short form used in log output.
    #[must_use]
    pub fn short(&self) -> &str {
        let s = self.as_str();
        s.get(..7).unwrap_or(s)
    }

    /// Hex-encode a raw digest. Bytes past 32 are ignored.
    pub(crate) fn from_digest(bytes: &[u8]) -> Self {
        const DIGITS: &[u8; 16] = b"0123456789abcdef";
        let mut hex = [0u8; MAX_HEX];
        let mut len = 0;
        for (pair, byte) in hex.chunks_exact_mut(2).zip(bytes) {
            pair[0] = DIGITS[usize::from(byte >> 4)];
            pair[1] = DIGITS[usize::from(byte & 0x0f)];
            len += 2;
        }
        Self { hex, len }
    }
}

impl Default for Hash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.as_str())
    }
}

impl FromStr for Hash {
    type Err = HashParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() < MIN_HEX || s.len() > MAX_HEX {
            return Err(HashParseError {
                value: s.to_owned(),
                reason: format!(
                    "expected {MIN_HEX} to {MAX_HEX} hex characters, got {}",
                    s.len()
                ),
            });
        }
        let mut hex = [0u8; MAX_HEX];
        for (i, b) in s.bytes().enumerate() {
            if !b.is_ascii_hexdigit() {
                return Err(HashParseError {
                    value: s.to_owned(),
                    reason: format!("invalid hex digit '{}'", char::from(b)),
                });
            }
            hex[i] = b.to_ascii_lowercase();
        }
        #[allow(clippy::cast_possible_truncation)]
        let len = s.len() as u8;
        Ok(Self { hex, len })
    }
}

impl Serialize for Hash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Error from parsing a hex string into a [`Hash`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashParseError {
    /// The raw value that failed.
    pub value: String,
    /// Why it failed.
    pub reason: String,
}

impl fmt::Display for HashParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid hash {:?}: {}", self.value, self.reason)
    }
}

impl std::error::Error for HashParseError {}

// ---------------------------------------------------------------------------
// Mode / ObjectKind
// ---------------------------------------------------------------------------

/// The file mode of a tree entry, as printed by `git ls-tree`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Mode {
    /// No mode (`000000`): an absent object.
    #[default]
    Zero,
    /// Regular file (`100644`).
    Regular,
    /// Executable file (`100755`).
    Executable,
    /// Symbolic link (`120000`).
    Symlink,
    /// Subdirectory (`040000`).
    Directory,
    /// Gitlink / submodule (`160000`).
    Gitlink,
}

impl Mode {
    /// The numeric mode.
    #[must_use]
    pub const fn octal(self) -> u32 {
        match self {
            Self::Zero => 0,
            Self::Regular => 0o100_644,
            Self::Executable => 0o100_755,
            Self::Symlink => 0o120_000,
            Self::Directory => 0o040_000,
            Self::Gitlink => 0o160_000,
        }
    }

    /// The kind of object an entry with this mode points to.
    ///
    /// `None` for [`Mode::Zero`].
    #[must_use]
    pub const fn kind(self) -> Option<ObjectKind> {
        match self {
            Self::Zero => None,
            Self::Regular | Self::Executable | Self::Symlink => Some(ObjectKind::Blob),
            Self::Directory => Some(ObjectKind::Tree),
            Self::Gitlink => Some(ObjectKind::Commit),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06o}", self.octal())
    }
}

impl FromStr for Mode {
    type Err = ModeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ModeParseError {
            value: s.to_owned(),
        };
        let raw = u32::from_str_radix(s, 8).map_err(|_| err())?;
        match raw {
            0 => Ok(Self::Zero),
            0o100_644 => Ok(Self::Regular),
            0o100_755 => Ok(Self::Executable),
            0o120_000 => Ok(Self::Symlink),
            0o040_000 => Ok(Self::Directory),
            0o160_000 => Ok(Self::Gitlink),
            _ => Err(err()),
        }
    }
}

impl Serialize for Mode {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Error from parsing an octal mode string into a [`Mode`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModeParseError {
    /// The raw value that failed.
    pub value: String,
}

impl fmt::Display for ModeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid file mode {:?}", self.value)
    }
}

impl std::error::Error for ModeParseError {}

/// The type of a git object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectKind {
    /// File contents.
    Blob,
    /// A directory listing.
    Tree,
    /// A commit; only appears in trees as a gitlink.
    Commit,
}

impl ObjectKind {
    /// The name git uses for this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::Tree => "tree",
            Self::Commit => "commit",
        }
    }
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "blob" => Ok(Self::Blob),
            "tree" => Ok(Self::Tree),
            "commit" => Ok(Self::Commit),
            other => Err(format!("unknown object type {other:?}")),
        }
    }
}

// ---------------------------------------------------------------------------
// Tree types
// ---------------------------------------------------------------------------

/// A single entry in a git tree object.
///
/// Names are raw bytes: git allows anything but `/` and NUL in a path
/// segment, including invalid UTF-8.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct TreeEntry {
    /// The entry mode.
    pub mode: Mode,
    /// The kind of object `hash` refers to.
    pub kind: ObjectKind,
    /// The object this entry points to.
    pub hash: Hash,
    /// A single path segment, or the full path in recursive listings.
    #[serde(serialize_with = "serialize_path")]
    pub name: BString,
}

impl TreeEntry {
    /// A subdirectory entry.
    #[must_use]
    pub fn new_tree(name: impl Into<BString>, hash: Hash) -> Self {
        Self {
            mode: Mode::Directory,
            kind: ObjectKind::Tree,
            hash,
            name: name.into(),
        }
    }

    /// A blob entry. A [`Mode::Zero`] mode becomes [`Mode::Regular`].
    #[must_use]
    pub fn new_blob(name: impl Into<BString>, mode: Mode, hash: Hash) -> Self {
        let mode = if mode == Mode::Zero { Mode::Regular } else { mode };
        Self {
            mode,
            kind: mode.kind().unwrap_or(ObjectKind::Blob),
            hash,
            name: name.into(),
        }
    }

    /// Check that this entry can be written into a single tree level.
    ///
    /// # Errors
    /// Returns [`GitError::InvalidEntry`] if the name is empty or contains a
    /// `/` or NUL, if the mode is unset, or if the kind disagrees with the
    /// mode.
    pub fn validate(&self) -> Result<(), GitError> {
        let reject = |reason: &str| {
            Err(GitError::InvalidEntry {
                name: self.name.to_string(),
                reason: reason.to_owned(),
            })
        };
        if self.name.is_empty() {
            return reject("name must not be empty");
        }
        if self.name.contains(&b'/') {
            return reject("name contains a slash");
        }
        if self.name.contains(&0) {
            return reject("name contains a NUL byte");
        }
        if self.mode == Mode::Zero {
            return reject("mode not set");
        }
        if (self.kind == ObjectKind::Tree) != (self.mode == Mode::Directory) {
            return reject(&format!(
                "kind {} does not match mode {}",
                self.kind, self.mode
            ));
        }
        Ok(())
    }

    /// Write the exact `ls-tree`/`mktree` record, without a terminator.
    ///
    /// # Errors
    /// Whatever `out` reports.
    pub fn write_record(&self, out: &mut impl io::Write) -> io::Result<()> {
        write!(out, "{} {} {}\t", self.mode, self.kind, self.hash)?;
        out.write_all(&self.name)
    }

    /// Parse one `<mode> <kind> <hash>\t<name>` record. The name may
    /// contain spaces, tabs and bytes that are not UTF-8.
    ///
    /// # Errors
    /// A description of the first malformed field.
    pub fn parse_record(record: &[u8]) -> Result<Self, String> {
        let tab = record
            .find_byte(b'\t')
            .ok_or_else(|| format!("missing tab in {:?}", record.as_bstr()))?;
        let (meta, name) = (&record[..tab], &record[tab + 1..]);
        let meta = std::str::from_utf8(meta)
            .map_err(|_| format!("malformed header {:?}", meta.as_bstr()))?;
        let mut fields = meta.split(' ');
        let (Some(mode), Some(kind), Some(hash), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(format!("expected <mode> <kind> <hash>, got {meta:?}"));
        };
        if name.is_empty() {
            return Err("empty entry name".to_owned());
        }
        Ok(Self {
            mode: mode.parse().map_err(|e: ModeParseError| e.to_string())?,
            kind: kind.parse()?,
            hash: hash.parse().map_err(|e: HashParseError| e.to_string())?,
            name: BString::from(name),
        })
    }
}

/// The record form with the name decoded lossily, for display.
impl fmt::Display for TreeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}\t{}", self.mode, self.kind, self.hash, self.name)
    }
}

/// Serialize a byte path as a string, replacing invalid UTF-8.
///
/// # Errors
/// Whatever the serializer reports.
pub fn serialize_path<S: Serializer>(path: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&path.to_str_lossy())
}

/// [`serialize_path`] for a list of paths.
///
/// # Errors
/// Whatever the serializer reports.
pub fn serialize_paths<S: Serializer>(paths: &[BString], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(paths.iter().map(|p| p.to_str_lossy()))
}

/// A blob to place at a (possibly nested) path.
///
/// Input to tree patching; `path` may span several directory levels
/// (e.g. `"src/git/mod.rs"`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobInfo {
    /// File mode. [`Mode::Zero`] is treated as [`Mode::Regular`].
    pub mode: Mode,
    /// The blob to store.
    pub hash: Hash,
    /// Slash-separated path relative to the tree root.
    pub path: BString,
}

/// Options for [`ObjectStore::list_tree`](crate::ObjectStore::list_tree).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListTreeOptions {
    /// List every blob below the tree, with full paths as names.
    pub recurse: bool,
}

// ---------------------------------------------------------------------------
// Merge types
// ---------------------------------------------------------------------------

/// The stage of a file in a merge conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictStage {
    /// A non-conflicted file.
    Ok,
    /// The common ancestor version.
    Base,
    /// The version from the first branch.
    Ours,
    /// The version from the second branch.
    Theirs,
}

impl fmt::Display for ConflictStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::Base => "base",
            Self::Ours => "ours",
            Self::Theirs => "theirs",
        })
    }
}

impl FromStr for ConflictStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "0" => Ok(Self::Ok),
            "1" => Ok(Self::Base),
            "2" => Ok(Self::Ours),
            "3" => Ok(Self::Theirs),
            other => Err(format!("invalid conflict stage {other:?}")),
        }
    }
}

/// Conflict marker style used when writing conflicted blobs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStyle {
    /// Two-sided markers.
    Merge,
    /// Markers with the base section.
    Diff3,
    /// Like `diff3`, with common lines moved out of the conflict.
    Zdiff3,
}

impl ConflictStyle {
    /// The value of `merge.conflictStyle`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Merge => "merge",
            Self::Diff3 => "diff3",
            Self::Zdiff3 => "zdiff3",
        }
    }
}

impl fmt::Display for ConflictStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "merge" => Ok(Self::Merge),
            "diff3" => Ok(Self::Diff3),
            "zdiff3" => Ok(Self::Zdiff3),
            other => Err(format!(
                "unknown conflict style {other:?} (expected merge, diff3, or zdiff3)"
            )),
        }
    }
}

/// Parameters of a server-side tree merge.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MergeTreeRequest {
    /// First side of the merge ("ours").
    ///
    /// Must be commit-ish when `merge_base` is `None`; any tree-ish
    /// otherwise.
    pub branch1: String,
    /// Second side of the merge ("theirs"). Same rules as `branch1`.
    pub branch2: String,
    /// Explicit merge base. The difference between this and `branch2` is
    /// applied to `branch1`.
    pub merge_base: Option<String>,
    /// Conflict marker style for conflicted blobs.
    pub conflict_style: Option<ConflictStyle>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    // -- Hash --

    #[test]
    fn hash_roundtrip_hex() {
        let hex = "0123456789abcdef0123456789abcdef01234567";
        let hash: Hash = hex.parse().unwrap();
        assert_eq!(hash.to_string(), hex);
        assert_eq!(hash.short(), "0123456");
    }

    #[test]
    fn hash_accepts_sha256_and_abbreviations() {
        let long = "ab".repeat(32);
        assert_eq!(long.parse::<Hash>().unwrap().as_str(), long);
        assert_eq!("abcd".parse::<Hash>().unwrap().short(), "abcd");
    }

    #[test]
    fn hash_normalizes_uppercase() {
        let hash: Hash = "ABCDEF12".parse().unwrap();
        assert_eq!(hash.as_str(), "abcdef12");
        assert_eq!(hash, "abcdef12".parse().unwrap());
    }

    #[test]
    fn hash_zero() {
        assert!(Hash::ZERO.is_zero());
        assert_eq!(Hash::ZERO.to_string(), "0".repeat(40));
        assert!("0000000".parse::<Hash>().unwrap().is_zero());
        assert!(!"0000001".parse::<Hash>().unwrap().is_zero());
        assert_eq!(Hash::default(), Hash::ZERO);
    }

    #[test]
    fn hash_rejects_bad_input() {
        assert!("".parse::<Hash>().is_err());
        assert!("abc".parse::<Hash>().is_err());
        assert!("g".repeat(40).parse::<Hash>().is_err());
        assert!("a".repeat(65).parse::<Hash>().is_err());
    }

    // -- Mode --

    #[test]
    fn mode_roundtrip() {
        for mode in [
            Mode::Zero,
            Mode::Regular,
            Mode::Executable,
            Mode::Symlink,
            Mode::Directory,
            Mode::Gitlink,
        ] {
            assert_eq!(mode.to_string().parse::<Mode>().unwrap(), mode);
        }
        assert_eq!(Mode::Directory.to_string(), "040000");
        assert_eq!(Mode::Zero.to_string(), "000000");
    }

    #[test]
    fn mode_accepts_short_directory_form() {
        assert_eq!("40000".parse::<Mode>().unwrap(), Mode::Directory);
    }

    #[test]
    fn mode_rejects_unknown() {
        assert!("100600".parse::<Mode>().is_err());
        assert!("".parse::<Mode>().is_err());
        assert!("abc".parse::<Mode>().is_err());
    }

    // -- TreeEntry --

    #[test]
    fn entry_validation() {
        let hash: Hash = "a".repeat(40).parse().unwrap();
        assert!(TreeEntry::new_blob("file", Mode::Regular, hash).validate().is_ok());
        assert!(TreeEntry::new_tree("dir", hash).validate().is_ok());
        assert!(TreeEntry::new_blob("a/b", Mode::Regular, hash).validate().is_err());
        assert!(TreeEntry::new_blob("", Mode::Regular, hash).validate().is_err());

        let mut bad_kind = TreeEntry::new_blob("x", Mode::Regular, hash);
        bad_kind.kind = ObjectKind::Tree;
        assert!(matches!(
            bad_kind.validate(),
            Err(GitError::InvalidEntry { .. })
        ));

        let mut no_mode = TreeEntry::new_blob("x", Mode::Regular, hash);
        no_mode.mode = Mode::Zero;
        assert!(no_mode.validate().is_err());
    }

    #[test]
    fn entry_record_roundtrip() {
        let record = b"040000 tree 4b825dc642cb6eb9a060e54bf8d69288fbee4904\tmy dir\tx";
        let entry = TreeEntry::parse_record(record).unwrap();
        assert_eq!(entry.kind, ObjectKind::Tree);
        assert_eq!(entry.name, "my dir\tx");
        let mut out = Vec::new();
        entry.write_record(&mut out).unwrap();
        assert_eq!(out, record);

        assert!(TreeEntry::parse_record(b"100644 blob abcd").is_err());
        assert!(TreeEntry::parse_record(b"100644 abcd\tx").is_err());
        assert!(TreeEntry::parse_record(b"100644 blob abcd\t").is_err());
        assert!(TreeEntry::parse_record(b"100644 bl\xffb abcd\tx").is_err());
    }

    #[test]
    fn entry_names_keep_raw_bytes() {
        let record = b"100644 blob e69de29bb2d1d6434b8b29ae775ad8c2e48c5391\tcaf\xe9";
        let entry = TreeEntry::parse_record(record).unwrap();
        assert_eq!(entry.name, &b"caf\xe9"[..]);
        assert!(entry.validate().is_ok());
        let mut out = Vec::new();
        entry.write_record(&mut out).unwrap();
        assert_eq!(out, record);
        assert!(entry.to_string().ends_with("\tcaf\u{fffd}"));
    }

    #[test]
    fn new_blob_defaults_zero_mode() {
        let entry = TreeEntry::new_blob("x", Mode::Zero, Hash::ZERO);
        assert_eq!(entry.mode, Mode::Regular);
        assert_eq!(entry.kind, ObjectKind::Blob);
        let link = TreeEntry::new_blob("x", Mode::Gitlink, Hash::ZERO);
        assert_eq!(link.kind, ObjectKind::Commit);
    }

    // -- ConflictStage --

    #[test]
    fn stage_parse_and_display() {
        assert_eq!("0".parse::<ConflictStage>().unwrap(), ConflictStage::Ok);
        assert_eq!("3".parse::<ConflictStage>().unwrap(), ConflictStage::Theirs);
        assert!("4".parse::<ConflictStage>().is_err());
        assert_eq!(ConflictStage::Base.to_string(), "base");
    }

    #[test]
    fn conflict_style_parse() {
        assert_eq!("zdiff3".parse::<ConflictStyle>().unwrap(), ConflictStyle::Zdiff3);
        assert!("fancy".parse::<ConflictStyle>().is_err());
    }
}
