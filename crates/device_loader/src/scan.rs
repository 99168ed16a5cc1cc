//! Data directory scanning

use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const IMAGES_TO_LOAD_DIR: &str = "images_to_load";
pub const STACKS_TO_LOAD_DIR: &str = "stacks_to_load";
pub const STACKS_TO_RUN_DIR: &str = "stacks_to_run";

/// Inputs found in the loader data directory, each list sorted by path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    pub images_tar: Vec<PathBuf>,
    pub images_tar_gz: Vec<PathBuf>,
    pub stacks_to_load: Vec<PathBuf>,
    pub stacks_to_run: Vec<PathBuf>,
}

impl Scan {
    /// Scan `data_dir`; missing subdirectories yield empty lists
    pub fn scan(data_dir: &Path) -> Self {
        let images_dir = data_dir.join(IMAGES_TO_LOAD_DIR);
        Self {
            images_tar: files_with_suffix(&images_dir, &[".tar"]),
            images_tar_gz: files_with_suffix(&images_dir, &[".tar.gz"]),
            stacks_to_load: files_with_suffix(
                &data_dir.join(STACKS_TO_LOAD_DIR),
                &[".yaml", ".yml"],
            ),
            stacks_to_run: files_with_suffix(&data_dir.join(STACKS_TO_RUN_DIR), &[".yaml", ".yml"]),
        }
    }

    pub fn archives(&self) -> usize {
        self.images_tar.len() + self.images_tar_gz.len()
    }

    pub fn is_empty(&self) -> bool {
        self.archives() == 0 && self.stacks_to_load.is_empty() && self.stacks_to_run.is_empty()
    }
}

/// Regular files directly inside `dir` whose name ends with one of `suffixes`
fn files_with_suffix(dir: &Path, suffixes: &[&str]) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy();
            suffixes.iter().any(|suffix| name.ends_with(suffix))
        })
        .map(|entry| entry.into_path())
        .collect();
    files.sort();
    files
}

/// Bulleted list of file names, one per line, or `(none)`
pub fn list_files(files: &[PathBuf]) -> String {
    if files.is_empty() {
        return "\t(none)".to_string();
    }
    files
        .iter()
        .map(|path| {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            format!("\t- {}", name)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Scan results plus the loader settings that shape a pass
pub struct ScanSummary<'a> {
    pub scan: &'a Scan,
    pub exclude_run: &'a [String],
    pub delete_inputs: bool,
}

impl fmt::Display for ScanSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Current Status:")?;
        writeln!(f)?;
        writeln!(f, "  Images to load (uncompressed):")?;
        writeln!(f, "{}", list_files(&self.scan.images_tar))?;
        writeln!(f)?;
        writeln!(f, "  Images to load (compressed):")?;
        writeln!(f, "{}", list_files(&self.scan.images_tar_gz))?;
        writeln!(f)?;
        writeln!(f, "  Stacks to load:")?;
        writeln!(f, "{}", list_files(&self.scan.stacks_to_load))?;
        writeln!(f)?;
        writeln!(f, "  Stacks to run:")?;
        writeln!(f, "{}", list_files(&self.scan.stacks_to_run))?;
        writeln!(f)?;
        writeln!(f, "  Configuration:")?;
        writeln!(f, "    - Exclude run: {:?}", self.exclude_run)?;
        write!(f, "    - Delete: {}", self.delete_inputs)
    }
}
