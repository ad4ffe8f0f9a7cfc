//! Pipeline runner
//!
//! # Run lifecycle
//!
//! ```text
//! run()
//!   ├─ outdir exists?            → CollisionError, nothing written
//!   ├─ create outdir, scope run logging (unless skipped)
//!   ├─ task start record
//!   ├─ inputdir set?             → ConfigurationError
//!   ├─ register output crate + software
//!   ├─ stream generator rows     → image_emd.tsv + labels_prob.tsv
//!   ├─ register artifacts, output files, computation
//!   └─ task finish record (0 on success, 99 on failure); errors propagate
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{error, info, warn};
use tracing_subscriber::filter::LevelFilter;

use crate::constants::{IMAGE_EMBEDDING_FILE, IMAGE_LABELS_PROBABILITY_FILE, LABEL_NAMES};
use crate::error::{EmbeddingError, ProvenanceError, Result};
use crate::generator::EmbeddingGenerator;
use crate::logging;
use crate::provenance::{
    ComputationAttributes, CrateIdentity, DatasetAttributes, LocalProvenance,
    ProvenanceRecorder, RoCrateAttributes, SoftwareAttributes,
};
use crate::task_record::{login, write_task_finish_json, write_task_start_json};

/// Exit status recorded for a failed run
pub const FAILURE_STATUS: i32 = 99;

const SOFTWARE_NAME: &str = "cellmaps_image_embedding";
const VERSION: &str = env!("CARGO_PKG_VERSION");

fn provenance_error(operation: &'static str) -> impl FnOnce(ProvenanceError) -> EmbeddingError {
    move |source| EmbeddingError::Provenance { operation, source }
}

/// Crate identity used when the input directory carries no RO-Crate
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FallbackIdentity {
    pub name: Option<String>,
    pub organization_name: Option<String>,
    pub project_name: Option<String>,
}

impl FallbackIdentity {
    fn to_identity(&self) -> CrateIdentity {
        CrateIdentity {
            name: self.name.clone().unwrap_or_default(),
            project_name: self.project_name.clone().unwrap_or_default(),
            organization_name: self.organization_name.clone().unwrap_or_default(),
        }
    }
}

/// Builder for [`EmbeddingPipelineRunner`]
pub struct EmbeddingPipelineRunnerBuilder {
    outdir: Option<PathBuf>,
    inputdir: Option<PathBuf>,
    generator: Option<Box<dyn EmbeddingGenerator>>,
    name: Option<String>,
    organization_name: Option<String>,
    project_name: Option<String>,
    fallback_identity: Option<FallbackIdentity>,
    input_data: Value,
    provenance: Option<Box<dyn ProvenanceRecorder>>,
    skip_logging: bool,
    console_level: LevelFilter,
}

impl Default for EmbeddingPipelineRunnerBuilder {
    fn default() -> Self {
        Self {
            outdir: None,
            inputdir: None,
            generator: None,
            name: None,
            organization_name: None,
            project_name: None,
            fallback_identity: None,
            input_data: Value::Null,
            provenance: None,
            skip_logging: true,
            console_level: LevelFilter::OFF,
        }
    }
}

impl EmbeddingPipelineRunnerBuilder {
    pub fn outdir(mut self, outdir: impl Into<PathBuf>) -> Self {
        self.outdir = Some(outdir.into());
        self
    }

    pub fn inputdir(mut self, inputdir: impl Into<PathBuf>) -> Self {
        self.inputdir = Some(inputdir.into());
        self
    }

    pub fn generator(mut self, generator: Box<dyn EmbeddingGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn organization_name(mut self, organization_name: impl Into<String>) -> Self {
        self.organization_name = Some(organization_name.into());
        self
    }

    pub fn project_name(mut self, project_name: impl Into<String>) -> Self {
        self.project_name = Some(project_name.into());
        self
    }

    /// Identity to use when the input directory has no RO-Crate
    ///
    /// Explicit `name`, `organization_name` and `project_name` still win.
    pub fn fallback_identity(mut self, fallback: FallbackIdentity) -> Self {
        self.fallback_identity = Some(fallback);
        self
    }

    /// Command line data stored in the task start record
    pub fn input_data(mut self, input_data: Value) -> Self {
        self.input_data = input_data;
        self
    }

    pub fn provenance(mut self, provenance: Box<dyn ProvenanceRecorder>) -> Self {
        self.provenance = Some(provenance);
        self
    }

    /// When false, `output.log` and `error.log` are written into the outdir
    pub fn skip_logging(mut self, skip_logging: bool) -> Self {
        self.skip_logging = skip_logging;
        self
    }

    /// Console level mirrored while run-scoped logging is active
    pub fn console_level(mut self, level: LevelFilter) -> Self {
        self.console_level = level;
        self
    }

    pub fn build(self) -> Result<EmbeddingPipelineRunner> {
        let outdir = self
            .outdir
            .ok_or_else(|| EmbeddingError::configuration("outdir is None"))?;
        let generator = self
            .generator
            .ok_or_else(|| EmbeddingError::configuration("generator is None"))?;

        Ok(EmbeddingPipelineRunner {
            outdir,
            inputdir: self.inputdir,
            generator,
            name: self.name,
            organization_name: self.organization_name,
            project_name: self.project_name,
            fallback_identity: self.fallback_identity,
            input_data: self.input_data,
            provenance: self
                .provenance
                .unwrap_or_else(|| Box::new(LocalProvenance::new())),
            skip_logging: self.skip_logging,
            console_level: self.console_level,
        })
    }
}

/// Drives one generator to completion and records the run
pub struct EmbeddingPipelineRunner {
    outdir: PathBuf,
    inputdir: Option<PathBuf>,
    generator: Box<dyn EmbeddingGenerator>,
    name: Option<String>,
    organization_name: Option<String>,
    project_name: Option<String>,
    fallback_identity: Option<FallbackIdentity>,
    input_data: Value,
    provenance: Box<dyn ProvenanceRecorder>,
    skip_logging: bool,
    console_level: LevelFilter,
}

impl EmbeddingPipelineRunner {
    pub fn builder() -> EmbeddingPipelineRunnerBuilder {
        EmbeddingPipelineRunnerBuilder::default()
    }

    pub fn outdir(&self) -> &Path {
        &self.outdir
    }

    pub fn image_embedding_file(&self) -> PathBuf {
        self.outdir.join(IMAGE_EMBEDDING_FILE)
    }

    pub fn labels_probability_file(&self) -> PathBuf {
        self.outdir.join(IMAGE_LABELS_PROBABILITY_FILE)
    }

    /// Execute the pipeline, returning the exit status (0 on success)
    pub fn run(&mut self) -> Result<i32> {
        let start = Utc::now();

        // A prior run's directory is left untouched
        if self.outdir.exists() {
            let err = EmbeddingError::Collision(self.outdir.clone());
            error!("{}", err);
            return Err(err);
        }
        std::fs::create_dir_all(&self.outdir)
            .map_err(|e| EmbeddingError::file_access(&self.outdir, e))?;

        if self.skip_logging {
            return self.run_in_outdir(&start);
        }
        match logging::run_log_dispatch(&self.outdir, self.console_level) {
            Ok(dispatch) => {
                tracing::dispatcher::with_default(&dispatch, || self.run_in_outdir(&start))
            }
            Err(e) => {
                error!("Unable to set up run logging: {}", e);
                self.record_failure(&start);
                Err(e)
            }
        }
    }

    fn run_in_outdir(&mut self, start: &DateTime<Utc>) -> Result<i32> {
        match self.execute(start) {
            Ok(()) => {
                write_task_finish_json(&self.outdir, start, 0)?;
                info!("Embedding run finished");
                Ok(0)
            }
            Err(e) => {
                error!("Embedding run failed: {}", e);
                self.record_failure(start);
                Err(e)
            }
        }
    }

    /// Best effort: the run's own error takes precedence
    fn record_failure(&self, start: &DateTime<Utc>) {
        if let Err(e) = write_task_finish_json(&self.outdir, start, FAILURE_STATUS) {
            warn!("Unable to write task finish record: {}", e);
        }
    }

    fn execute(&mut self, start: &DateTime<Utc>) -> Result<()> {
        write_task_start_json(&self.outdir, start, VERSION, &self.input_data)?;

        let inputdir = self
            .inputdir
            .clone()
            .ok_or_else(|| EmbeddingError::configuration("inputdir must be set"))?;
        info!(
            "Generating embeddings from {} into {}",
            inputdir.display(),
            self.outdir.display()
        );

        self.resolve_identity(&inputdir)?;
        let software_id = self.register_crate_and_software()?;

        let rows = self.write_outputs()?;
        info!("Wrote {} embedding rows", rows);

        let artifact_ids = self.register_generator_artifacts()?;
        let generated = self.register_output_files()?;

        let mut used_datasets = Vec::new();
        match self.provenance.get_id_of_rocrate(&inputdir) {
            Ok(id) => used_datasets.push(id),
            Err(ProvenanceError::MissingCrate(dir)) => {
                warn!("Input {} has no RO-Crate; not linking it", dir.display())
            }
            Err(e) => return Err(provenance_error("get_id_of_rocrate")(e)),
        }
        used_datasets.extend(artifact_ids);

        let attributes = ComputationAttributes {
            name: "Image embedding".to_string(),
            run_by: login(),
            command: self.input_data.to_string(),
            description: format!("Run of {} {}", SOFTWARE_NAME, VERSION),
            keywords: self.keywords(&["computation"]),
        };
        self.provenance
            .register_computation(
                &self.outdir,
                &attributes,
                &[software_id],
                &used_datasets,
                &generated,
            )
            .map_err(provenance_error("register_computation"))?;
        Ok(())
    }

    /// Take name, project and organization from the input crate unless given
    fn resolve_identity(&mut self, inputdir: &Path) -> Result<()> {
        if self.name.is_some() && self.project_name.is_some() && self.organization_name.is_some() {
            return Ok(());
        }
        let found = self.provenance.get_name_project_org_of_rocrate(inputdir);
        let identity = match (found, &self.fallback_identity) {
            (Ok(identity), _) => identity,
            (Err(ProvenanceError::MissingCrate(dir)), Some(fallback)) => {
                info!("No RO-Crate in {}, using fallback identity", dir.display());
                fallback.to_identity()
            }
            (Err(e), _) => return Err(provenance_error("get_name_project_org_of_rocrate")(e)),
        };
        self.name.get_or_insert(identity.name);
        self.project_name.get_or_insert(identity.project_name);
        self.organization_name.get_or_insert(identity.organization_name);
        Ok(())
    }

    fn keywords(&self, extra: &[&str]) -> Vec<String> {
        [self.project_name.as_deref(), self.name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::to_string)
            .chain(extra.iter().map(|k| k.to_string()))
            .collect()
    }

    fn register_crate_and_software(&self) -> Result<String> {
        let name = self.name.clone().unwrap_or_default();
        let crate_attributes = RoCrateAttributes {
            name: name.clone(),
            organization_name: self.organization_name.clone().unwrap_or_default(),
            project_name: self.project_name.clone().unwrap_or_default(),
            description: format!("{} image embedding", name),
            keywords: self.keywords(&["image embedding"]),
        };
        self.provenance
            .register_rocrate(&self.outdir, &crate_attributes)
            .map_err(provenance_error("register_rocrate"))?;

        let software = SoftwareAttributes {
            name: SOFTWARE_NAME.to_string(),
            description: env!("CARGO_PKG_DESCRIPTION").to_string(),
            author: "Cell Maps team".to_string(),
            version: VERSION.to_string(),
            file_format: "rs".to_string(),
            url: "https://github.com/idekerlab/cellmaps_image_embedding".to_string(),
            keywords: self.keywords(&["tools", SOFTWARE_NAME]),
        };
        self.provenance
            .register_software(&self.outdir, &software)
            .map_err(provenance_error("register_software"))
    }

    /// Stream every generator row into both tables, returning the row count
    fn write_outputs(&mut self) -> Result<usize> {
        let dimensions = self.generator.dimensions();
        let mut embeddings = tsv_writer(&self.image_embedding_file())?;
        let mut probabilities = tsv_writer(&self.labels_probability_file())?;

        let mut header = vec![String::new()];
        header.extend((1..=dimensions).map(|i| i.to_string()));
        embeddings.write_record(&header)?;

        let mut header = vec![String::new()];
        header.extend(LABEL_NAMES.iter().map(|l| l.to_string()));
        probabilities.write_record(&header)?;

        let mut rows = 0usize;
        for row in self.generator.generate()? {
            let row = row?;
            let mut record = Vec::with_capacity(row.embedding.len() + 1);
            record.push(row.gene.clone());
            record.extend(row.embedding.iter().map(|v| v.to_string()));
            embeddings.write_record(&record)?;

            let mut record = Vec::with_capacity(row.probabilities.len() + 1);
            record.push(row.gene);
            record.extend(row.probabilities.iter().map(|v| v.to_string()));
            probabilities.write_record(&record)?;
            rows += 1;
        }
        embeddings.flush()?;
        probabilities.flush()?;
        Ok(rows)
    }

    fn register_generator_artifacts(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for artifact in self.generator.datasets_needing_registration()? {
            let id = self
                .provenance
                .register_dataset(&self.outdir, &artifact.description, &artifact.path, true)
                .map_err(provenance_error("register_dataset"))?;
            ids.push(id);
        }
        Ok(ids)
    }

    fn register_output_files(&self) -> Result<Vec<String>> {
        let outputs = [
            (
                self.image_embedding_file(),
                "Image embedding file",
                "Per gene image embedding",
            ),
            (
                self.labels_probability_file(),
                "Image labels probability file",
                "Per gene subcellular compartment probabilities",
            ),
        ];

        let mut ids = Vec::new();
        for (path, name, description) in outputs {
            let attributes = DatasetAttributes {
                name: name.to_string(),
                description: format!("{} {}", self.name.as_deref().unwrap_or(""), description)
                    .trim()
                    .to_string(),
                author: SOFTWARE_NAME.to_string(),
                version: VERSION.to_string(),
                data_format: "tsv".to_string(),
                date_published: Utc::now().format("%Y-%m-%d").to_string(),
                keywords: self.keywords(&["image", "embedding", "tsv"]),
                url: None,
            };
            let id = self
                .provenance
                .register_dataset(&self.outdir, &attributes, &path, true)
                .map_err(provenance_error("register_dataset"))?;
            ids.push(id);
        }
        Ok(ids)
    }
}

fn tsv_writer(path: &Path) -> Result<csv::Writer<File>> {
    let file = File::create(path).map_err(|e| EmbeddingError::file_access(path, e))?;
    Ok(csv::WriterBuilder::new()
        .delimiter(b'\t')
        .from_writer(file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{EmbeddingRow, EmbeddingStream, RegistrableArtifact};

    /// Two fixed rows, or a failure after the first one
    struct FixedGenerator {
        fail: bool,
        artifacts: Option<Vec<RegistrableArtifact>>,
    }

    impl EmbeddingGenerator for FixedGenerator {
        fn dimensions(&self) -> usize {
            2
        }

        fn generate(&mut self) -> Result<EmbeddingStream<'_>> {
            self.artifacts = Some(Vec::new());
            let mut rows: Vec<Result<EmbeddingRow>> = vec![Ok(EmbeddingRow {
                gene: "ACTN1".to_string(),
                embedding: vec![0.5, -1.0],
                probabilities: vec![0.1; LABEL_NAMES.len()],
            })];
            rows.push(if self.fail {
                Err(EmbeddingError::State("scorer exploded".to_string()))
            } else {
                Ok(EmbeddingRow {
                    gene: "MYO1B".to_string(),
                    embedding: vec![1.5, 2.0],
                    probabilities: vec![0.2; LABEL_NAMES.len()],
                })
            });
            Ok(Box::new(rows.into_iter()))
        }

        fn datasets_needing_registration(&self) -> Result<&[RegistrableArtifact]> {
            self.artifacts
                .as_deref()
                .ok_or_else(crate::generator::not_generated_yet)
        }
    }

    fn runner(outdir: &Path, inputdir: &Path, fail: bool) -> EmbeddingPipelineRunner {
        EmbeddingPipelineRunner::builder()
            .outdir(outdir)
            .inputdir(inputdir)
            .name("test run")
            .organization_name("org")
            .project_name("project")
            .generator(Box::new(FixedGenerator {
                fail,
                artifacts: None,
            }))
            .build()
            .unwrap()
    }

    fn finish_records(dir: &Path) -> Vec<Value> {
        std::fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with("_finish.json"))
            .map(|e| serde_json::from_str(&std::fs::read_to_string(e.path()).unwrap()).unwrap())
            .collect()
    }

    #[test]
    fn test_builder_requires_outdir() {
        let err = EmbeddingPipelineRunner::builder().build().err().unwrap();
        assert_eq!("outdir is None", err.to_string());
    }

    #[test]
    fn test_rows_written_in_lock_step() {
        let tmp = tempfile::tempdir().unwrap();
        let outdir = tmp.path().join("out");
        let mut runner = runner(&outdir, tmp.path(), false);
        assert_eq!(0, runner.run().unwrap());

        let embeddings = std::fs::read_to_string(runner.image_embedding_file()).unwrap();
        let lines: Vec<&str> = embeddings.lines().collect();
        assert_eq!("\t1\t2", lines[0]);
        assert_eq!("ACTN1\t0.5\t-1", lines[1]);
        assert_eq!(3, lines.len());

        let probabilities = std::fs::read_to_string(runner.labels_probability_file()).unwrap();
        let lines: Vec<&str> = probabilities.lines().collect();
        assert_eq!(3, lines.len());
        assert!(lines[0].starts_with("\tNucleoplasm\t"));
        assert_eq!(LABEL_NAMES.len() + 1, lines[2].split('\t').count());
    }

    #[test]
    fn test_generator_failure_records_status_and_propagates() {
        let tmp = tempfile::tempdir().unwrap();
        let outdir = tmp.path().join("out");
        let err = runner(&outdir, tmp.path(), true).run().unwrap_err();
        assert!(matches!(err, EmbeddingError::State(_)));

        let records = finish_records(&outdir);
        assert_eq!(1, records.len());
        assert_eq!(FAILURE_STATUS, records[0]["status"]);
    }

    #[test]
    fn test_provenance_graph_links_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let outdir = tmp.path().join("out");
        runner(&outdir, tmp.path(), false).run().unwrap();

        let metadata: Value = serde_json::from_str(
            &std::fs::read_to_string(outdir.join(crate::provenance::ROCRATE_METADATA_FILE))
                .unwrap(),
        )
        .unwrap();
        assert_eq!("test run", metadata["name"]);
        let graph = metadata["@graph"].as_array().unwrap();
        let kinds: Vec<&str> = graph.iter().map(|e| e["@type"].as_str().unwrap()).collect();
        assert_eq!(vec!["Software", "Dataset", "Dataset", "Computation"], kinds);
        assert_eq!(2, graph[3]["generated"].as_array().unwrap().len());
    }

    /// Local recorder whose software registration is refused
    struct RejectingSoftware(LocalProvenance);

    impl ProvenanceRecorder for RejectingSoftware {
        fn register_rocrate(
            &self,
            crate_dir: &Path,
            attributes: &RoCrateAttributes,
        ) -> std::result::Result<String, ProvenanceError> {
            self.0.register_rocrate(crate_dir, attributes)
        }

        fn register_software(
            &self,
            _crate_dir: &Path,
            _attributes: &SoftwareAttributes,
        ) -> std::result::Result<String, ProvenanceError> {
            Err(ProvenanceError::Rejected("registry offline".to_string()))
        }

        fn register_dataset(
            &self,
            crate_dir: &Path,
            attributes: &DatasetAttributes,
            source_file: &Path,
            skip_copy: bool,
        ) -> std::result::Result<String, ProvenanceError> {
            self.0
                .register_dataset(crate_dir, attributes, source_file, skip_copy)
        }

        fn register_computation(
            &self,
            crate_dir: &Path,
            attributes: &ComputationAttributes,
            used_software: &[String],
            used_datasets: &[String],
            generated: &[String],
        ) -> std::result::Result<String, ProvenanceError> {
            self.0.register_computation(
                crate_dir,
                attributes,
                used_software,
                used_datasets,
                generated,
            )
        }

        fn get_id_of_rocrate(&self, crate_dir: &Path) -> std::result::Result<String, ProvenanceError> {
            self.0.get_id_of_rocrate(crate_dir)
        }

        fn get_name_project_org_of_rocrate(
            &self,
            crate_dir: &Path,
        ) -> std::result::Result<CrateIdentity, ProvenanceError> {
            self.0.get_name_project_org_of_rocrate(crate_dir)
        }
    }

    #[test]
    fn test_provenance_failure_names_operation_and_records_status() {
        let tmp = tempfile::tempdir().unwrap();
        let outdir = tmp.path().join("out");
        let err = EmbeddingPipelineRunner::builder()
            .outdir(&outdir)
            .inputdir(tmp.path())
            .name("test run")
            .organization_name("org")
            .project_name("project")
            .provenance(Box::new(RejectingSoftware(LocalProvenance::new())))
            .generator(Box::new(FixedGenerator {
                fail: false,
                artifacts: None,
            }))
            .build()
            .unwrap()
            .run()
            .unwrap_err();

        assert!(matches!(
            err,
            EmbeddingError::Provenance {
                operation: "register_software",
                source: ProvenanceError::Rejected(_),
            }
        ));
        assert!(!outdir.join(IMAGE_EMBEDDING_FILE).exists());
        let records = finish_records(&outdir);
        assert_eq!(1, records.len());
        assert_eq!(FAILURE_STATUS, records[0]["status"]);
    }

    fn anonymous_runner(outdir: &Path, inputdir: &Path) -> EmbeddingPipelineRunnerBuilder {
        EmbeddingPipelineRunner::builder()
            .outdir(outdir)
            .inputdir(inputdir)
            .generator(Box::new(FixedGenerator {
                fail: false,
                artifacts: None,
            }))
    }

    fn fallback() -> FallbackIdentity {
        FallbackIdentity {
            name: Some("fallback".to_string()),
            organization_name: Some("fallback org".to_string()),
            project_name: Some("fallback project".to_string()),
        }
    }

    fn output_identity(outdir: &Path) -> CrateIdentity {
        LocalProvenance::new()
            .get_name_project_org_of_rocrate(outdir)
            .unwrap()
    }

    #[test]
    fn test_input_crate_wins_over_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let inputdir = tmp.path().join("input");
        LocalProvenance::new()
            .register_rocrate(
                &inputdir,
                &RoCrateAttributes {
                    name: "crate name".to_string(),
                    organization_name: "crate org".to_string(),
                    project_name: "crate project".to_string(),
                    ..Default::default()
                },
            )
            .unwrap();
        let outdir = tmp.path().join("out");
        anonymous_runner(&outdir, &inputdir)
            .fallback_identity(fallback())
            .build()
            .unwrap()
            .run()
            .unwrap();

        let identity = output_identity(&outdir);
        assert_eq!("crate name", identity.name);
        assert_eq!("crate org", identity.organization_name);
        assert_eq!("crate project", identity.project_name);
    }

    #[test]
    fn test_fallback_used_without_input_crate() {
        let tmp = tempfile::tempdir().unwrap();
        let outdir = tmp.path().join("out");
        anonymous_runner(&outdir, tmp.path())
            .fallback_identity(fallback())
            .project_name("explicit project")
            .build()
            .unwrap()
            .run()
            .unwrap();

        let identity = output_identity(&outdir);
        assert_eq!("fallback", identity.name);
        assert_eq!("fallback org", identity.organization_name);
        assert_eq!("explicit project", identity.project_name);
    }

    #[test]
    fn test_missing_input_crate_without_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        let err = anonymous_runner(&tmp.path().join("out"), tmp.path())
            .build()
            .unwrap()
            .run()
            .unwrap_err();
        assert!(matches!(
            err,
            EmbeddingError::Provenance {
                operation: "get_name_project_org_of_rocrate",
                source: ProvenanceError::MissingCrate(_),
            }
        ));
    }
}
