//! Image file stem → gene identifier translation
//!
//! The side table is a TSV with at least a `filename` and a `name` column.
//! `filename` may hold several comma separated stems; only the first one is
//! used as the key. Later rows overwrite earlier rows with the same key.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::constants::IMAGE_GENE_NODE_ATTR_FILE;
use crate::error::{EmbeddingError, Result};

const FILENAME_COLUMN: &str = "filename";
const NAME_COLUMN: &str = "name";

/// Read-only lookup from image group key to gene identifier
#[derive(Debug, Clone)]
pub struct IdentifierTranslator {
    source: PathBuf,
    mapping: HashMap<String, String>,
}

impl IdentifierTranslator {
    /// Path of the side table for `fold` under `dir`
    pub fn side_table_path(dir: &Path, fold: u32) -> PathBuf {
        dir.join(format!("{}_{}", fold, IMAGE_GENE_NODE_ATTR_FILE))
    }

    /// Read `<dir>/<fold>_image_gene_node_attributes.tsv`
    pub fn new(dir: &Path, fold: u32) -> Result<Self> {
        Self::from_path(&Self::side_table_path(dir, fold))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let file =
            std::fs::File::open(path).map_err(|e| EmbeddingError::file_access(path, e))?;
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .flexible(true)
            .from_reader(file);

        let headers = reader.headers()?.clone();
        let column = |name: &str| {
            headers
                .iter()
                .position(|h| h == name)
                .ok_or_else(|| EmbeddingError::SideTable {
                    path: path.to_path_buf(),
                    message: format!("missing '{}' column", name),
                })
        };
        let filename_idx = column(FILENAME_COLUMN)?;
        let name_idx = column(NAME_COLUMN)?;

        let mut mapping = HashMap::new();
        for (idx, record) in reader.records().enumerate() {
            let record = record?;
            let (Some(filename), Some(name)) = (record.get(filename_idx), record.get(name_idx))
            else {
                debug!("Skipping short row {} in {}", idx + 1, path.display());
                continue;
            };
            let key = filename.split(',').next().unwrap_or_default().trim();
            if key.is_empty() {
                continue;
            }
            mapping.insert(key.to_string(), name.to_string());
        }

        info!(
            "Loaded {} image to gene mappings from {}",
            mapping.len(),
            path.display()
        );
        Ok(Self {
            source: path.to_path_buf(),
            mapping,
        })
    }

    /// Gene identifier for an image group key, if any
    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.mapping.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.mapping.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mapping.is_empty()
    }

    pub fn source(&self) -> &Path {
        &self.source
    }
}
