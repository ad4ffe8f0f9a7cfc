//! File names, channel names and the fixed label taxonomy

/// Side table mapping image file stems to genes, prefixed with `<fold>_`
pub const IMAGE_GENE_NODE_ATTR_FILE: &str = "image_gene_node_attributes.tsv";

/// Embedding table written by the runner
pub const IMAGE_EMBEDDING_FILE: &str = "image_emd.tsv";

/// Per-label probability table written by the runner
pub const IMAGE_LABELS_PROBABILITY_FILE: &str = "labels_prob.tsv";

pub const RED: &str = "red";
pub const GREEN: &str = "green";
pub const BLUE: &str = "blue";
pub const YELLOW: &str = "yellow";

/// Channel order expected by the classification model
pub const CHANNELS: [&str; 4] = [RED, GREEN, BLUE, YELLOW];

pub const DEFAULT_SUFFIX: &str = ".jpg";
pub const DEFAULT_FOLD: u32 = 1;

pub const OUTPUT_LOG_FILE: &str = "output.log";
pub const ERROR_LOG_FILE: &str = "error.log";

/// Human Protein Atlas subcellular compartments, in model output order
pub const LABEL_NAMES: [&str; 28] = [
    "Nucleoplasm",
    "Nuclear membrane",
    "Nucleoli",
    "Nucleoli fibrillar center",
    "Nuclear speckles",
    "Nuclear bodies",
    "Endoplasmic reticulum",
    "Golgi apparatus",
    "Peroxisomes",
    "Endosomes",
    "Lysosomes",
    "Intermediate filaments",
    "Actin filaments",
    "Focal adhesion sites",
    "Microtubules",
    "Microtubule ends",
    "Cytokinetic bridge",
    "Mitotic spindle",
    "Microtubule organizing center",
    "Centrosome",
    "Lipid droplets",
    "Plasma membrane",
    "Cell junctions",
    "Mitochondria",
    "Aggresome",
    "Cytosol",
    "Cytoplasmic bodies",
    "Rods & rings",
];

pub const NUM_CLASSES: usize = LABEL_NAMES.len();
