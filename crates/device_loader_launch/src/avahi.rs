//! Avahi service advertisements
//!
//! Service files are plain XML dropped into the Avahi services directory;
//! avahi-daemon watches that directory and (re)announces its contents, so
//! installing or withdrawing an advertisement is a file operation.

use crate::config::{Environment, EnvironmentError};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_AVAHI_SERVICES_DIR: &str = "/etc/avahi/services";

/// Directory under the project root holding service templates
pub const ASSETS_SUBDIR: &str = "assets/avahi-services";

/// Prefix applied to every installed service file
pub const SERVICE_PREFIX: &str = "dt.";

const SERVICE_EXTENSION: &str = "service";

#[derive(Error, Debug)]
pub enum AvahiError {
    #[error("IO error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to render '{path}': {source}")]
    Render {
        path: String,
        #[source]
        source: EnvironmentError,
    },

    #[error("Invalid service '{name}': {reason}")]
    Invalid { name: String, reason: String },
}

pub type Result<T> = std::result::Result<T, AvahiError>;

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> AvahiError + '_ {
    move |source| AvahiError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// A DNS-SD record declared directly in the launch file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceAdvertisement {
    /// Instance name; `$VAR` references are expanded at install time
    pub name: String,
    /// Service type, e.g. `_duckietown._tcp`
    #[serde(rename = "type")]
    pub service_type: String,
    pub port: AdvertisedPort,
    #[serde(default)]
    pub txt: IndexMap<String, String>,
}

/// Port of an advertisement: a number, or a launch substitution such as
/// `$(arg port)` resolved before installation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AdvertisedPort {
    Number(u16),
    Template(String),
}

impl AdvertisedPort {
    /// The port number, if it is known and non-zero
    pub fn number(&self) -> Option<u16> {
        match self {
            AdvertisedPort::Number(n) => Some(*n),
            AdvertisedPort::Template(s) => s.trim().parse().ok(),
        }
        .filter(|n| *n != 0)
    }
}

impl From<u16> for AdvertisedPort {
    fn from(n: u16) -> Self {
        AdvertisedPort::Number(n)
    }
}

impl std::fmt::Display for AdvertisedPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdvertisedPort::Number(n) => write!(f, "{}", n),
            AdvertisedPort::Template(s) => f.write_str(s),
        }
    }
}

impl ServiceAdvertisement {
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: &str| AvahiError::Invalid {
            name: self.name.clone(),
            reason: reason.to_string(),
        };

        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if !self.service_type.starts_with('_')
            || !(self.service_type.ends_with("._tcp") || self.service_type.ends_with("._udp"))
        {
            return Err(invalid("type must look like '_name._tcp' or '_name._udp'"));
        }
        let substituted = matches!(&self.port, AdvertisedPort::Template(s) if s.contains("$("));
        if !substituted && self.port.number().is_none() {
            return Err(invalid("port must be a non-zero number or a $(...) substitution"));
        }
        Ok(())
    }

    /// Render the advertisement as an Avahi service group
    pub fn to_xml(&self, env: &Environment) -> Result<String> {
        let render_err = |source| AvahiError::Render {
            path: self.name.clone(),
            source,
        };
        let port = self.port.number().ok_or_else(|| AvahiError::Invalid {
            name: self.name.clone(),
            reason: format!("port '{}' is not a valid port number", self.port),
        })?;
        let name = env.expand(&self.name).map_err(render_err)?;
        let mut txt = String::new();
        for (key, value) in &self.txt {
            let value = env.expand(value).map_err(render_err)?;
            txt.push_str(&format!(
                "    <txt-record>{}={}</txt-record>\n",
                xml_escape(key),
                xml_escape(&value)
            ));
        }

        Ok(format!(
            r#"<?xml version="1.0" standalone='no'?>
<!DOCTYPE service-group SYSTEM "avahi-service.dtd">
<service-group>
  <name replace-wildcards="yes">{name}</name>
  <service>
    <type>{service_type}</type>
    <port>{port}</port>
{txt}  </service>
</service-group>
"#,
            name = xml_escape(&name),
            service_type = xml_escape(&self.service_type),
            port = port,
            txt = txt,
        ))
    }
}

/// Escape the five XML special characters
pub fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

/// Reduce an instance name to something safe to use as a file name
pub fn slugify(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}

/// File name an advertisement is installed under
pub fn service_file_name(name: &str) -> String {
    let stem = name.strip_suffix(".service").unwrap_or(name);
    if stem.starts_with(SERVICE_PREFIX) {
        format!("{}.{}", stem, SERVICE_EXTENSION)
    } else {
        format!("{}{}.{}", SERVICE_PREFIX, stem, SERVICE_EXTENSION)
    }
}

/// Default template directory: `$DT_PROJECT_PATH/assets/avahi-services`,
/// or relative to the working directory when the variable is unset
pub fn default_services_dir(env: &Environment) -> PathBuf {
    match env.lookup("DT_PROJECT_PATH") {
        Some(root) if !root.is_empty() => Path::new(&root).join(ASSETS_SUBDIR),
        _ => PathBuf::from(ASSETS_SUBDIR),
    }
}

/// Installs advertisements into the Avahi services directory
#[derive(Debug, Clone)]
pub struct ServiceInstaller {
    source_dir: Option<PathBuf>,
    target_dir: PathBuf,
}

impl ServiceInstaller {
    pub fn new(source_dir: Option<PathBuf>, target_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir,
            target_dir: target_dir.into(),
        }
    }

    pub fn target_dir(&self) -> &Path {
        &self.target_dir
    }

    /// Template files that would be installed, sorted by name
    pub fn templates(&self) -> Result<Vec<PathBuf>> {
        let Some(dir) = &self.source_dir else {
            return Ok(Vec::new());
        };
        if !dir.is_dir() {
            log::debug!("[services] No templates at {}", dir.display());
            return Ok(Vec::new());
        }

        let mut files = Vec::new();
        for entry in std::fs::read_dir(dir).map_err(io_err(dir))? {
            let path = entry.map_err(io_err(dir))?.path();
            if path.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(SERVICE_EXTENSION)
            {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Install every template plus the inline advertisements
    pub fn install_all(
        &self,
        env: &Environment,
        inline: &[ServiceAdvertisement],
    ) -> Result<Vec<PathBuf>> {
        let templates = self.templates()?;
        if templates.is_empty() && inline.is_empty() {
            log::info!("[services] Nothing to advertise");
            return Ok(Vec::new());
        }

        std::fs::create_dir_all(&self.target_dir).map_err(io_err(&self.target_dir))?;

        let mut installed = Vec::with_capacity(templates.len() + inline.len());
        for template in &templates {
            installed.push(self.install_template(template, env)?);
        }
        for service in inline {
            service.validate()?;
            let render_err = |source| AvahiError::Render {
                path: service.name.clone(),
                source,
            };
            let content = service.to_xml(env)?;
            let name = env.expand(&service.name).map_err(render_err)?;
            installed.push(self.write(&service_file_name(&slugify(&name)), &content)?);
        }

        log::info!(
            "[services] Installed {} service(s) into {}",
            installed.len(),
            self.target_dir.display()
        );
        Ok(installed)
    }

    /// Render one template with the environment and install it
    pub fn install_template(&self, template: &Path, env: &Environment) -> Result<PathBuf> {
        let raw = std::fs::read_to_string(template).map_err(io_err(template))?;
        let content = env.expand(&raw).map_err(|source| AvahiError::Render {
            path: template.display().to_string(),
            source,
        })?;
        let stem = template
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| AvahiError::Invalid {
                name: template.display().to_string(),
                reason: "file name is not valid UTF-8".to_string(),
            })?;
        self.write(&service_file_name(stem), &content)
    }

    fn write(&self, file_name: &str, content: &str) -> Result<PathBuf> {
        let path = self.target_dir.join(file_name);
        std::fs::write(&path, content).map_err(io_err(&path))?;
        log::debug!("[services] Wrote {}", path.display());
        Ok(path)
    }
}

/// Withdraw an advertisement. Returns whether a file was removed.
pub fn disable_service(target_dir: &Path, name: &str) -> Result<bool> {
    let path = target_dir.join(service_file_name(name));
    if !path.exists() {
        return Ok(false);
    }
    std::fs::remove_file(&path).map_err(io_err(&path))?;
    log::info!("[services] Withdrew {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn advertisement() -> ServiceAdvertisement {
        let mut txt = IndexMap::new();
        txt.insert("vehicle".to_string(), "${VEHICLE_NAME}".to_string());
        ServiceAdvertisement {
            name: "device-loader on ${VEHICLE_NAME}".to_string(),
            service_type: "_duckietown._tcp".to_string(),
            port: 8081.into(),
            txt,
        }
    }

    #[test]
    fn test_service_file_name() {
        assert_eq!(service_file_name("device-init"), "dt.device-init.service");
        assert_eq!(service_file_name("dt.device-init"), "dt.device-init.service");
        assert_eq!(service_file_name("dt.device-init.service"), "dt.device-init.service");
    }

    #[test]
    fn test_to_xml_expands_environment() {
        let mut env = Environment::new();
        env.set("VEHICLE_NAME", "autobot01");

        let xml = advertisement().to_xml(&env).unwrap();
        assert!(xml.contains("<name replace-wildcards=\"yes\">device-loader on autobot01</name>"));
        assert!(xml.contains("<type>_duckietown._tcp</type>"));
        assert!(xml.contains("<port>8081</port>"));
        assert!(xml.contains("<txt-record>vehicle=autobot01</txt-record>"));
    }

    #[test]
    fn test_validate() {
        assert!(advertisement().validate().is_ok());

        let mut bad = advertisement();
        bad.service_type = "http".to_string();
        assert!(bad.validate().is_err());

        let mut bad = advertisement();
        bad.port = 0.into();
        assert!(bad.validate().is_err());

        let mut bad = advertisement();
        bad.port = AdvertisedPort::Template("eighty".to_string());
        assert!(bad.validate().is_err());

        let mut templated = advertisement();
        templated.port = AdvertisedPort::Template("$(arg port)".to_string());
        assert!(templated.validate().is_ok());
        // Substitutions must be resolved before rendering
        assert!(matches!(
            templated.to_xml(&Environment::new()),
            Err(AvahiError::Invalid { .. })
        ));

        templated.port = AdvertisedPort::Template("8082".to_string());
        let xml = templated.to_xml(&Environment::new()).unwrap();
        assert!(xml.contains("<port>8082</port>"));
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify(" Device Loader/01 "), "device-loader-01");
    }

    #[test]
    fn test_xml_escape() {
        assert_eq!(xml_escape("a<b & 'c'"), "a&lt;b &amp; &apos;c&apos;");
    }

    #[test]
    fn test_install_and_disable() {
        let source = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        std::fs::write(
            source.path().join("device-init.service"),
            "<name>${VEHICLE_NAME}</name>",
        )
        .unwrap();
        std::fs::write(source.path().join("README.md"), "not a service").unwrap();

        let mut env = Environment::new();
        env.set("VEHICLE_NAME", "autobot01");

        let installer = ServiceInstaller::new(Some(source.path().to_path_buf()), target.path());
        let installed = installer.install_all(&env, &[advertisement()]).unwrap();
        assert_eq!(installed.len(), 2);

        let init = target.path().join("dt.device-init.service");
        assert_eq!(std::fs::read_to_string(&init).unwrap(), "<name>autobot01</name>");
        assert!(target
            .path()
            .join("dt.device-loader-on-autobot01.service")
            .exists());

        assert!(disable_service(target.path(), "dt.device-init").unwrap());
        assert!(!init.exists());
        assert!(!disable_service(target.path(), "dt.device-init").unwrap());
    }

    #[test]
    fn test_missing_source_dir_installs_nothing() {
        let target = tempfile::tempdir().unwrap();
        let installer = ServiceInstaller::new(
            Some(PathBuf::from("/nonexistent/avahi-services")),
            target.path().join("services"),
        );
        let installed = installer.install_all(&Environment::new(), &[]).unwrap();
        assert!(installed.is_empty());
        assert!(!target.path().join("services").exists());
    }
}
