//! Compose stack files

use serde::Deserialize;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StackError {
    #[error("Failed to read stack file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse stack file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Service '{service}' in stack '{stack}' has no image")]
    MissingImage { stack: String, service: String },
}

pub type Result<T> = std::result::Result<T, StackError>;

#[derive(Debug, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: HashMap<String, ComposeService>,
}

#[derive(Debug, Deserialize)]
struct ComposeService {
    image: Option<String>,
}

/// Stack (compose project) name: the file name without its YAML extension
pub fn stack_name(path: &Path) -> String {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    file_name
        .strip_suffix(".yaml")
        .or_else(|| file_name.strip_suffix(".yml"))
        .unwrap_or(&file_name)
        .to_string()
}

/// Images referenced by the services of a stack, deduplicated and sorted
pub fn images_in_stack(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).map_err(|source| StackError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_images(path, &content)
}

fn parse_images(path: &Path, content: &str) -> Result<Vec<String>> {
    let compose: ComposeFile =
        serde_yaml::from_str(content).map_err(|source| StackError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let mut images = BTreeSet::new();
    for (service, config) in compose.services {
        let image = config.image.ok_or_else(|| StackError::MissingImage {
            stack: stack_name(path),
            service: service.clone(),
        })?;
        images.insert(image);
    }
    Ok(images.into_iter().collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_name() {
        assert_eq!(stack_name(Path::new("/data/stacks_to_run/duckiebot.yaml")), "duckiebot");
        assert_eq!(stack_name(Path::new("default.yml")), "default");
        assert_eq!(stack_name(Path::new("notes.txt")), "notes.txt");
    }

    #[test]
    fn test_images_are_unique_and_sorted() {
        let content = r#"
version: "3"
services:
  interface:
    image: duckietown/dt-duckiebot-interface:daffy
    restart: unless-stopped
  car:
    image: duckietown/dt-car-interface:daffy
  interface-2:
    image: duckietown/dt-duckiebot-interface:daffy
"#;
        let images = parse_images(Path::new("duckiebot.yaml"), content).unwrap();
        assert_eq!(
            images,
            vec![
                "duckietown/dt-car-interface:daffy".to_string(),
                "duckietown/dt-duckiebot-interface:daffy".to_string(),
            ]
        );
    }

    #[test]
    fn test_service_without_image() {
        let content = "services:\n  builder:\n    build: .\n";
        let err = parse_images(Path::new("dev.yml"), content).unwrap_err();
        assert!(matches!(
            err,
            StackError::MissingImage { ref stack, ref service }
                if stack == "dev" && service == "builder"
        ));
    }

    #[test]
    fn test_images_in_stack_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "services: [unclosed").unwrap();

        match images_in_stack(&path) {
            Err(StackError::Parse { path: p, .. }) => assert_eq!(p, path),
            other => panic!("expected parse error, got {:?}", other),
        }

        assert!(matches!(
            images_in_stack(&dir.path().join("missing.yaml")),
            Err(StackError::Io { .. })
        ));
    }
}
