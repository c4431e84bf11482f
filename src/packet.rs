use crate::error::{FlowError, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// An opaque payload plus a string-to-string attribute map.
///
/// The file-backed variant holds only the path; its data and size are read
/// from the filesystem at call time, so repeated `read_data` calls each see
/// the current file contents.
#[derive(Debug, Clone)]
pub enum DataPacket {
    Bytes {
        attributes: HashMap<String, String>,
        data: Bytes,
    },
    File {
        path: PathBuf,
    },
    Empty {
        attributes: HashMap<String, String>,
    },
}

impl DataPacket {
    pub fn from_bytes(attributes: HashMap<String, String>, data: impl Into<Bytes>) -> Self {
        DataPacket::Bytes {
            attributes,
            data: data.into(),
        }
    }

    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        DataPacket::File { path: path.into() }
    }

    pub fn empty(attributes: HashMap<String, String>) -> Self {
        DataPacket::Empty { attributes }
    }

    pub fn attributes(&self) -> HashMap<String, String> {
        match self {
            DataPacket::Bytes { attributes, .. } | DataPacket::Empty { attributes } => {
                attributes.clone()
            }
            DataPacket::File { path } => file_attributes(path),
        }
    }

    /// Payload size in bytes. For file-backed packets this is the file
    /// length at call time, 0 when the file is missing.
    pub fn size(&self) -> u64 {
        match self {
            DataPacket::Bytes { data, .. } => data.len() as u64,
            DataPacket::Empty { .. } => 0,
            DataPacket::File { path } => std::fs::metadata(path).map(|m| m.len()).unwrap_or(0),
        }
    }

    /// Read the full payload. Each call produces a fresh view of the data.
    pub async fn read_data(&self) -> Result<Bytes> {
        match self {
            DataPacket::Bytes { data, .. } => Ok(data.clone()),
            DataPacket::Empty { .. } => Ok(Bytes::new()),
            DataPacket::File { path } => match tokio::fs::read(path).await {
                Ok(contents) => Ok(Bytes::from(contents)),
                Err(e) => Err(FlowError::DataFetch(format!(
                    "{}: {}",
                    path.display(),
                    e
                ))),
            },
        }
    }
}

fn file_attributes(path: &Path) -> HashMap<String, String> {
    let mut attributes = HashMap::new();
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    attributes.insert("path".to_string(), parent.display().to_string());
    // Lexical absolutization only: the parent need not exist and symlinks
    // are left unresolved.
    let absolute = std::path::absolute(parent).unwrap_or_else(|_| parent.to_path_buf());
    attributes.insert("absolute.path".to_string(), absolute.display().to_string());
    if let Some(name) = path.file_name() {
        attributes.insert("filename".to_string(), name.to_string_lossy().to_string());
    }
    attributes
}
