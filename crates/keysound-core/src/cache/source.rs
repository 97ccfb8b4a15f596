//! Byte sources accepted by the cache

use std::fmt;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

/// Where the encoded bytes of a keysound come from
pub enum ByteSource {
    /// File on disk
    Path(PathBuf),
    /// Bytes already in memory (embedded resources, archives)
    Bytes(Vec<u8>),
    /// Any readable stream
    Reader(Box<dyn Read + Send>),
}

impl ByteSource {
    /// Read the whole source into memory
    pub fn read_all(self) -> io::Result<Vec<u8>> {
        match self {
            ByteSource::Path(path) => std::fs::read(path),
            ByteSource::Bytes(bytes) => Ok(bytes),
            ByteSource::Reader(mut reader) => {
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes)?;
                Ok(bytes)
            }
        }
    }

    /// File extension to help format probing
    pub fn extension_hint(&self) -> Option<String> {
        match self {
            ByteSource::Path(path) => path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_ascii_lowercase()),
            _ => None,
        }
    }
}

impl fmt::Debug for ByteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ByteSource::Path(path) => f.debug_tuple("Path").field(path).finish(),
            ByteSource::Bytes(bytes) => write!(f, "Bytes({} bytes)", bytes.len()),
            ByteSource::Reader(_) => f.write_str("Reader"),
        }
    }
}

impl From<PathBuf> for ByteSource {
    fn from(path: PathBuf) -> Self {
        ByteSource::Path(path)
    }
}

impl From<&Path> for ByteSource {
    fn from(path: &Path) -> Self {
        ByteSource::Path(path.to_path_buf())
    }
}

impl From<Vec<u8>> for ByteSource {
    fn from(bytes: Vec<u8>) -> Self {
        ByteSource::Bytes(bytes)
    }
}

impl From<&[u8]> for ByteSource {
    fn from(bytes: &[u8]) -> Self {
        ByteSource::Bytes(bytes.to_vec())
    }
}
