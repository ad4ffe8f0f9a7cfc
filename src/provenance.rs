//! Provenance collaborator
//!
//! The runner records the software, datasets and computation of every run
//! through the [`ProvenanceRecorder`] trait. [`LocalProvenance`] implements it
//! by keeping an RO-Crate style `ro-crate-metadata.json` in each crate
//! directory.
//!
//! # Document layout
//!
//! ```text
//! {
//!   "@id": "ark:59852/rocrate-…",
//!   "name": …, "organizationName": …, "projectName": …,
//!   "description": …, "keywords": […],
//!   "@graph": [
//!     { "@id": "ark:59852/software-…",    "@type": "Software",    … },
//!     { "@id": "ark:59852/dataset-…",     "@type": "Dataset",     … },
//!     { "@id": "ark:59852/computation-…", "@type": "Computation", … }
//!   ]
//! }
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;
use uuid::Uuid;

use crate::error::ProvenanceError;

pub const ROCRATE_METADATA_FILE: &str = "ro-crate-metadata.json";

const ARK_NAAN: &str = "ark:59852";

/// Attributes of a crate root
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoCrateAttributes {
    pub name: String,
    pub organization_name: String,
    pub project_name: String,
    pub description: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SoftwareAttributes {
    pub name: String,
    pub description: String,
    pub author: String,
    pub version: String,
    pub file_format: String,
    pub url: String,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetAttributes {
    pub name: String,
    pub description: String,
    pub author: String,
    pub version: String,
    pub data_format: String,
    pub date_published: String,
    pub keywords: Vec<String>,
    /// Where the data originally came from, when not produced locally
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputationAttributes {
    pub name: String,
    pub run_by: String,
    pub command: String,
    pub description: String,
    pub keywords: Vec<String>,
}

/// Name, project and organization of an existing crate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrateIdentity {
    pub name: String,
    pub project_name: String,
    pub organization_name: String,
}

/// Narrow contract the runner relies on for provenance bookkeeping
pub trait ProvenanceRecorder {
    fn register_rocrate(
        &self,
        crate_dir: &Path,
        attributes: &RoCrateAttributes,
    ) -> Result<String, ProvenanceError>;

    fn register_software(
        &self,
        crate_dir: &Path,
        attributes: &SoftwareAttributes,
    ) -> Result<String, ProvenanceError>;

    /// Record `source_file`; copies it into the crate unless `skip_copy`
    fn register_dataset(
        &self,
        crate_dir: &Path,
        attributes: &DatasetAttributes,
        source_file: &Path,
        skip_copy: bool,
    ) -> Result<String, ProvenanceError>;

    fn register_computation(
        &self,
        crate_dir: &Path,
        attributes: &ComputationAttributes,
        used_software: &[String],
        used_datasets: &[String],
        generated: &[String],
    ) -> Result<String, ProvenanceError>;

    fn get_id_of_rocrate(&self, crate_dir: &Path) -> Result<String, ProvenanceError>;

    fn get_name_project_org_of_rocrate(
        &self,
        crate_dir: &Path,
    ) -> Result<CrateIdentity, ProvenanceError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct RoCrateDocument {
    #[serde(rename = "@id")]
    id: String,
    #[serde(flatten)]
    attributes: RoCrateAttributes,
    #[serde(rename = "@graph", default)]
    graph: Vec<GraphEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GraphEntry {
    #[serde(rename = "@id")]
    id: String,
    #[serde(rename = "@type")]
    kind: String,
    #[serde(flatten)]
    properties: Map<String, Value>,
}

/// Filesystem-backed provenance recorder
#[derive(Debug, Default, Clone)]
pub struct LocalProvenance;

impl LocalProvenance {
    pub fn new() -> Self {
        Self
    }

    fn metadata_path(crate_dir: &Path) -> PathBuf {
        crate_dir.join(ROCRATE_METADATA_FILE)
    }

    fn load(crate_dir: &Path) -> Result<RoCrateDocument, ProvenanceError> {
        let path = Self::metadata_path(crate_dir);
        if !path.is_file() {
            return Err(ProvenanceError::MissingCrate(crate_dir.to_path_buf()));
        }
        let text = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&text)?)
    }

    fn save(crate_dir: &Path, document: &RoCrateDocument) -> Result<(), ProvenanceError> {
        let text = serde_json::to_string_pretty(document)?;
        fs::write(Self::metadata_path(crate_dir), text)?;
        Ok(())
    }

    fn new_id(kind: &str) -> String {
        format!("{}/{}-{}", ARK_NAAN, kind, Uuid::new_v4())
    }

    fn append<T: Serialize>(
        crate_dir: &Path,
        kind: &str,
        attributes: &T,
        extra: Map<String, Value>,
    ) -> Result<String, ProvenanceError> {
        let mut document = Self::load(crate_dir)?;
        let mut properties = match serde_json::to_value(attributes)? {
            Value::Object(map) => map,
            other => {
                return Err(ProvenanceError::Rejected(format!(
                    "{} attributes must be an object, got {}",
                    kind, other
                )))
            }
        };
        properties.extend(extra);

        let id = Self::new_id(&kind.to_lowercase());
        document.graph.push(GraphEntry {
            id: id.clone(),
            kind: kind.to_string(),
            properties,
        });
        Self::save(crate_dir, &document)?;
        debug!("Registered {} {} in {}", kind, id, crate_dir.display());
        Ok(id)
    }
}

impl ProvenanceRecorder for LocalProvenance {
    fn register_rocrate(
        &self,
        crate_dir: &Path,
        attributes: &RoCrateAttributes,
    ) -> Result<String, ProvenanceError> {
        fs::create_dir_all(crate_dir)?;
        let document = RoCrateDocument {
            id: Self::new_id("rocrate"),
            attributes: attributes.clone(),
            graph: Vec::new(),
        };
        Self::save(crate_dir, &document)?;
        Ok(document.id)
    }

    fn register_software(
        &self,
        crate_dir: &Path,
        attributes: &SoftwareAttributes,
    ) -> Result<String, ProvenanceError> {
        Self::append(crate_dir, "Software", attributes, Map::new())
    }

    fn register_dataset(
        &self,
        crate_dir: &Path,
        attributes: &DatasetAttributes,
        source_file: &Path,
        skip_copy: bool,
    ) -> Result<String, ProvenanceError> {
        let location = if skip_copy {
            source_file.to_path_buf()
        } else {
            let file_name = source_file.file_name().ok_or_else(|| {
                ProvenanceError::Rejected(format!(
                    "{} has no file name",
                    source_file.display()
                ))
            })?;
            let target = crate_dir.join(file_name);
            fs::copy(source_file, &target)?;
            target
        };
        let relative = location.strip_prefix(crate_dir).ok().map(Path::to_path_buf);
        let location = relative.unwrap_or(location);

        let mut extra = Map::new();
        extra.insert(
            "contentUrl".to_string(),
            Value::String(location.display().to_string()),
        );
        Self::append(crate_dir, "Dataset", attributes, extra)
    }

    fn register_computation(
        &self,
        crate_dir: &Path,
        attributes: &ComputationAttributes,
        used_software: &[String],
        used_datasets: &[String],
        generated: &[String],
    ) -> Result<String, ProvenanceError> {
        let mut extra = Map::new();
        extra.insert("usedSoftware".to_string(), serde_json::to_value(used_software)?);
        extra.insert("usedDataset".to_string(), serde_json::to_value(used_datasets)?);
        extra.insert("generated".to_string(), serde_json::to_value(generated)?);
        Self::append(crate_dir, "Computation", attributes, extra)
    }

    fn get_id_of_rocrate(&self, crate_dir: &Path) -> Result<String, ProvenanceError> {
        Ok(Self::load(crate_dir)?.id)
    }

    fn get_name_project_org_of_rocrate(
        &self,
        crate_dir: &Path,
    ) -> Result<CrateIdentity, ProvenanceError> {
        let attributes = Self::load(crate_dir)?.attributes;
        Ok(CrateIdentity {
            name: attributes.name,
            project_name: attributes.project_name,
            organization_name: attributes.organization_name,
        })
    }
}
