//! Manifest files
//!
//! A manifest describes a whole session: runtime settings, the documents and
//! collections the store starts with, message schemas, the actors to spawn
//! and a script of steps to play against them.
//!
//! ```yaml
//! runtime:
//!   dispatch: { auto: false }
//! documents:
//!   machines/counter: { file: counter.yml }
//!   config/counter: { state: machines/counter }
//! schemas:
//!   INC: { type: object, required: [by] }
//! actors:
//!   - id: counter
//!     accepts: [INC]
//! script:
//!   - send: { to: counter, type: INC, payload: { by: 2 } }
//!   - put: { collection: todos, id: t1, record: { title: hi } }
//! ```
//!
//! Anywhere a document or schema is expected, `{ file: <path> }` loads it
//! from a YAML or JSON file relative to the manifest.

use cadence_runtime::{ActorSpec, RuntimeConfig};
use cadence_types::{ActorId, Map, Value};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("Failed to read {path}: {source}")]
    ReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    ParseError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Document '{0}' must be a mapping")]
    NotAMapping(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileRef {
    pub file: PathBuf,
}

/// A value given inline or loaded from a file
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Include {
    File(FileRef),
    Inline(Value),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendStep {
    pub to: ActorId,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default = "default_sender")]
    pub from: ActorId,
}

fn default_sender() -> ActorId {
    ActorId::new("cli")
}

/// One scripted step; the runtime is drained after each
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    /// Append a message to an actor's inbox
    Send(SendStep),
    /// Set one key of a document
    Update {
        document: String,
        key: String,
        value: Value,
    },
    /// Insert or replace a collection record
    Put {
        collection: String,
        id: String,
        record: Value,
    },
    /// Destroy an actor and its children
    Destroy { actor: ActorId },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Manifest {
    #[serde(default)]
    pub runtime: RuntimeConfig,

    #[serde(default)]
    pub documents: BTreeMap<String, Include>,

    #[serde(default)]
    pub collections: BTreeMap<String, BTreeMap<String, Value>>,

    #[serde(default)]
    pub schemas: BTreeMap<String, Include>,

    #[serde(default)]
    pub actors: Vec<ActorSpec>,

    #[serde(default, with = "serde_yaml::with::singleton_map_recursive")]
    pub script: Vec<Step>,

    // Directory of the manifest file, for relative includes
    #[serde(skip)]
    base_dir: PathBuf,
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ManifestError> {
    let content = fs::read_to_string(path).map_err(|source| ManifestError::ReadError {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml::from_str(&content).map_err(|source| ManifestError::ParseError {
        path: path.to_path_buf(),
        source,
    })
}

impl Manifest {
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let mut manifest: Manifest = read_yaml(path)?;
        manifest.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        Ok(manifest)
    }

    /// Resolve a path relative to the manifest
    pub fn resolve_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }

    pub fn load(&self, include: &Include) -> Result<Value, ManifestError> {
        match include {
            Include::Inline(value) => Ok(value.clone()),
            Include::File(FileRef { file }) => read_yaml(&self.resolve_path(file)),
        }
    }

    /// Initial documents, every one loaded and checked to be a mapping
    pub fn documents(&self) -> Result<BTreeMap<String, Map>, ManifestError> {
        let mut documents = BTreeMap::new();
        for (name, include) in &self.documents {
            match self.load(include)? {
                Value::Object(map) => {
                    documents.insert(name.clone(), map);
                }
                _ => return Err(ManifestError::NotAMapping(name.clone())),
            }
        }
        Ok(documents)
    }

    pub fn schemas(&self) -> Result<BTreeMap<String, Value>, ManifestError> {
        self.schemas
            .iter()
            .map(|(kind, include)| Ok((kind.clone(), self.load(include)?)))
            .collect()
    }

    /// Configuration document of an actor under the manifest's layout
    pub fn config_document(&self, spec: &ActorSpec) -> String {
        spec.config
            .clone()
            .unwrap_or_else(|| self.runtime.documents.config(&spec.id))
    }
}
