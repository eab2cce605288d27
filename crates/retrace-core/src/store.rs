//! The recording directory: where interactions and transcripts live.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::chain::Resolved;
use crate::error::StoreError;
use crate::format::Format;
use crate::record_file::RecordFile;
use crate::request::RecordedRequest;
use crate::response::RecordedResponse;

/// How interactions are laid out on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Layout {
    /// `<name>.json` record files, hashed over the JSON serialization.
    #[default]
    Grouped,
    /// `<hash>.req` / `<hash>.resp` / `<hash>.resp.gz`, hashed over the text
    /// serialization.
    PerHash,
}

impl Layout {
    pub fn format(self) -> Format {
        match self {
            Layout::Grouped => Format::Json,
            Layout::PerHash => Format::Text,
        }
    }
}

impl std::fmt::Display for Layout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Layout::Grouped => "grouped",
            Layout::PerHash => "per-hash",
        })
    }
}

/// A response read back for replay.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredResponse {
    pub response: RecordedResponse,
    /// Original gzip bytes, per-hash layout only.
    pub gzip: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    layout: Layout,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>, layout: Layout) -> Self {
        Self {
            root: root.into(),
            layout,
        }
    }

    pub fn format(&self) -> Format {
        self.layout.format()
    }

    pub fn record_file_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.json"))
    }

    pub fn request_path(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{hash}.req"))
    }

    pub fn response_path(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{hash}.resp"))
    }

    pub fn gzip_path(&self, hash: &str) -> PathBuf {
        self.root.join(format!("{hash}.resp.gz"))
    }

    pub fn transcript_path(&self, name: &str) -> PathBuf {
        self.root.join(format!("{name}.websocket.log"))
    }

    fn ensure_root(&self) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)
            .map_err(|e| StoreError::io(format!("creating {}", self.root.display()), e))
    }

    /// Persists one interaction.
    ///
    /// `reason` is the status reason phrase for per-hash dumps and `gzip`
    /// the compressed body as received, if the upstream sent one.
    pub fn save_interaction(
        &self,
        resolved: &Resolved,
        request: &RecordedRequest,
        response: &RecordedResponse,
        reason: &str,
        gzip: Option<&[u8]>,
    ) -> Result<PathBuf, StoreError> {
        self.ensure_root()?;
        match self.layout {
            Layout::Grouped => {
                let path = self.record_file_path(&resolved.file_name);
                // A sequence starts its file over on its first request of the run.
                let mut file = if resolved.first_in_sequence {
                    RecordFile::new(&resolved.file_name)
                } else {
                    match RecordFile::open(&path) {
                        Ok(file) => file,
                        Err(StoreError::RecordingNotFound(_)) => RecordFile::new(&resolved.file_name),
                        Err(e) => return Err(e),
                    }
                };
                file.push(request.clone(), resolved.hash.clone(), response.clone());
                file.save(&path)?;
                Ok(path)
            }
            Layout::PerHash => {
                let req_path = self.request_path(&resolved.hash);
                write(&req_path, &Format::Text.serialize_request(request)?)?;
                write(&self.response_path(&resolved.hash), &response.to_dump(reason)?)?;
                if let Some(gz) = gzip {
                    write(&self.gzip_path(&resolved.hash), gz)?;
                }
                Ok(req_path)
            }
        }
    }

    /// Looks up the response recorded for a resolved request.
    pub fn load_response(&self, resolved: &Resolved) -> Result<StoredResponse, StoreError> {
        match self.layout {
            Layout::Grouped => {
                let path = self.record_file_path(&resolved.file_name);
                let file = RecordFile::open(&path)?;
                let response = file.find_response(&resolved.hash)?.clone();
                Ok(StoredResponse {
                    response,
                    gzip: None,
                })
            }
            Layout::PerHash => {
                let path = self.response_path(&resolved.hash);
                let data = match read_optional(&path)? {
                    Some(data) => data,
                    None => {
                        return Err(StoreError::InteractionNotFound {
                            file: path.display().to_string(),
                            hash: resolved.hash.clone(),
                        })
                    }
                };
                let response = RecordedResponse::from_dump(&data)?;
                let gzip = read_optional(&self.gzip_path(&resolved.hash))?;
                Ok(StoredResponse { response, gzip })
            }
        }
    }

    pub fn read_transcript(&self, name: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.transcript_path(name);
        read_optional(&path)?.ok_or_else(|| StoreError::RecordingNotFound(path.display().to_string()))
    }

    /// Creates (or truncates) the transcript file for `name`.
    pub fn create_transcript(&self, name: &str) -> Result<(PathBuf, fs::File), StoreError> {
        self.ensure_root()?;
        let path = self.transcript_path(name);
        let file = fs::File::create(&path)
            .map_err(|e| StoreError::io(format!("creating {}", path.display()), e))?;
        Ok((path, file))
    }
}

fn write(path: &Path, data: &[u8]) -> Result<(), StoreError> {
    fs::write(path, data).map_err(|e| StoreError::io(format!("writing {}", path.display()), e))
}

fn read_optional(path: &Path) -> Result<Option<Vec<u8>>, StoreError> {
    match fs::read(path) {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::io(format!("reading {}", path.display()), e)),
    }
}
