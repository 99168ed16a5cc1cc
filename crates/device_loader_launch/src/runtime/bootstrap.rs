//! The production bootstrap steps, driven by a launch file

use crate::avahi::{
    self, AdvertisedPort, ServiceAdvertisement, ServiceInstaller, DEFAULT_AVAHI_SERVICES_DIR,
};
use crate::config::{Environment, ExecMode, LaunchFile, SubstitutionContext};
use crate::lifecycle::LifecycleScope;
use crate::runtime::process::{
    exec_replace, ExitReport, ProcessConfig, StopHandle, SupervisedProcess,
};
use crate::runtime::sequencer::{BootstrapSteps, SequenceError};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Bootstrap state carried between steps
pub struct Bootstrap {
    launch_file: LaunchFile,
    args: HashMap<String, String>,
    stop: StopHandle,
    scope: Option<LifecycleScope>,
}

/// What a bootstrap would do, for `--dry-run`
#[derive(Debug)]
pub struct LaunchPlan {
    pub env_file: String,
    pub env: Vec<(String, String)>,
    pub services_enabled: bool,
    pub services_dir: PathBuf,
    pub templates: Vec<PathBuf>,
    pub advertised: Vec<String>,
    pub target_dir: PathBuf,
    pub process: ProcessConfig,
    pub mode: ExecMode,
}

impl Bootstrap {
    /// Merge argument defaults with overrides. Overrides must name a
    /// declared argument.
    pub fn new(
        launch_file: LaunchFile,
        arg_overrides: HashMap<String, String>,
        stop: StopHandle,
    ) -> Result<Self, SequenceError> {
        let mut args: HashMap<String, String> = launch_file
            .args
            .iter()
            .map(|(name, def)| (name.clone(), def.default.to_string()))
            .collect();

        for (name, value) in arg_overrides {
            if !launch_file.args.contains_key(&name) {
                return Err(SequenceError::UnknownArgument(name));
            }
            args.insert(name, value);
        }

        Ok(Self {
            launch_file,
            args,
            stop,
            scope: None,
        })
    }

    pub fn launch_file(&self) -> &LaunchFile {
        &self.launch_file
    }

    pub fn scope(&self) -> Option<&LifecycleScope> {
        self.scope.as_ref()
    }

    fn context(&self, env: Option<&Environment>) -> SubstitutionContext {
        let ctx = SubstitutionContext::new().with_args(self.args.clone());
        match env {
            Some(env) => ctx.with_envs(env.iter()),
            None => ctx,
        }
    }

    fn resolve(
        ctx: &SubstitutionContext,
        value: &str,
        context: impl FnOnce() -> String,
    ) -> Result<String, SequenceError> {
        ctx.substitute(value)
            .map_err(|source| SequenceError::Substitution {
                context: context(),
                source,
            })
    }

    fn services_dir(&self, env: &Environment) -> Result<PathBuf, SequenceError> {
        match &self.launch_file.services.dir {
            Some(dir) => {
                let ctx = self.context(Some(env));
                Ok(PathBuf::from(Self::resolve(&ctx, dir, || {
                    "services.dir".to_string()
                })?))
            }
            None => Ok(avahi::default_services_dir(env)),
        }
    }

    fn target_dir(&self, env: &Environment) -> Result<PathBuf, SequenceError> {
        match &self.launch_file.services.target_dir {
            Some(dir) => {
                let ctx = self.context(Some(env));
                Ok(PathBuf::from(Self::resolve(&ctx, dir, || {
                    "services.target_dir".to_string()
                })?))
            }
            None => Ok(env
                .lookup("AVAHI_SERVICES_DIR")
                .filter(|d| !d.is_empty())
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_AVAHI_SERVICES_DIR))),
        }
    }

    fn installer(&self, env: &Environment) -> Result<ServiceInstaller, SequenceError> {
        Ok(ServiceInstaller::new(
            Some(self.services_dir(env)?),
            self.target_dir(env)?,
        ))
    }

    /// Inline advertisements with `$(...)` ports resolved
    fn advertisements(
        &self,
        env: &Environment,
    ) -> Result<Vec<ServiceAdvertisement>, SequenceError> {
        let ctx = self.context(Some(env));
        self.launch_file
            .services
            .advertise
            .iter()
            .map(|service| {
                let mut service = service.clone();
                if let AdvertisedPort::Template(port) = &service.port {
                    let resolved = Self::resolve(&ctx, port, || {
                        format!("port of advertisement '{}'", service.name)
                    })?;
                    service.port = AdvertisedPort::Template(resolved);
                }
                Ok(service)
            })
            .collect()
    }

    /// Build the application command with the loaded environment
    pub fn process_config(&self, env: &Environment) -> Result<ProcessConfig, SequenceError> {
        let app = &self.launch_file.app;
        let ctx = self.context(Some(env));

        let executable = Self::resolve(&ctx, &app.executable, || "app.executable".to_string())?;
        let args = app
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| Self::resolve(&ctx, arg, || format!("app.args[{}]", i)))
            .collect::<Result<Vec<_>, _>>()?;
        let working_dir = app
            .working_dir
            .as_deref()
            .map(|dir| Self::resolve(&ctx, dir, || "app.working_dir".to_string()))
            .transpose()?
            .map(PathBuf::from);

        Ok(ProcessConfig {
            name: app.name.clone(),
            executable,
            args,
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            working_dir,
        })
    }

    /// Describe the bootstrap without running it
    pub fn plan(&mut self) -> Result<LaunchPlan, SequenceError> {
        let env = self.load_environment()?;
        let installer = self.installer(&env)?;
        let advertised = self
            .advertisements(&env)?
            .iter()
            .map(|s| format!("{} ({}:{})", s.name, s.service_type, s.port))
            .collect();

        Ok(LaunchPlan {
            env_file: self.env_file_path()?,
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            services_enabled: self.launch_file.services.enabled,
            services_dir: self.services_dir(&env)?,
            templates: installer.templates()?,
            advertised,
            target_dir: installer.target_dir().to_path_buf(),
            process: self.process_config(&env)?,
            mode: self.launch_file.app.mode,
        })
    }

    fn env_file_path(&self) -> Result<String, SequenceError> {
        // Only arguments and the process environment are known at this point
        Self::resolve(&self.context(None), &self.launch_file.env_file, || {
            "env_file".to_string()
        })
    }
}

impl BootstrapSteps for Bootstrap {
    fn load_environment(&mut self) -> Result<Environment, SequenceError> {
        let path = self.env_file_path()?;
        log::info!("Loading environment: {}", path);
        let mut env = Environment::from_file(&path)?;

        for (name, value) in &self.launch_file.env {
            let ctx = self.context(Some(&env));
            let resolved = Self::resolve(&ctx, value, || format!("env '{}'", name))?;
            env.set(name.clone(), resolved);
        }

        Ok(env)
    }

    fn init_lifecycle(&mut self, _env: &Environment) -> Result<(), SequenceError> {
        if self.scope.is_some() {
            return Err(SequenceError::Lifecycle(
                "lifecycle already initialised".to_string(),
            ));
        }
        self.scope = Some(LifecycleScope::init(self.launch_file.app.name.clone()));
        Ok(())
    }

    fn install_services(&mut self, env: &Environment) -> Result<usize, SequenceError> {
        if !self.launch_file.services.enabled {
            log::info!("[services] Service installation disabled");
            return Ok(0);
        }

        let advertise = self.advertisements(env)?;
        let installed = self.installer(env)?.install_all(env, &advertise)?;
        Ok(installed.len())
    }

    fn exec_application(&mut self, env: &Environment) -> Result<ExitReport, SequenceError> {
        let config = self.process_config(env)?;

        match self.launch_file.app.mode {
            ExecMode::Replace => Err(exec_replace(&config).into()),
            ExecMode::Supervise => {
                let timeout = Duration::from_millis(self.launch_file.app.shutdown_timeout_ms);
                let process = SupervisedProcess::spawn(config)?;
                Ok(process.wait(&self.stop, timeout)?)
            }
        }
    }

    fn terminate_lifecycle(&mut self, exit: Option<&ExitReport>) {
        if let Some(scope) = self.scope.as_mut() {
            scope.terminate(exit);
        }
    }
}

/// Display the launch plan in a human-readable format
impl fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Launch Plan")?;
        writeln!(f, "===========")?;
        writeln!(f)?;

        writeln!(f, "1. Environment: {}", self.env_file)?;
        for (key, value) in &self.env {
            writeln!(f, "     {}={}", key, value)?;
        }

        writeln!(f, "2. Lifecycle init: {}", self.process.name)?;

        if self.services_enabled {
            writeln!(
                f,
                "3. Services: {} -> {}",
                self.services_dir.display(),
                self.target_dir.display()
            )?;
            for template in &self.templates {
                writeln!(f, "     template {}", template.display())?;
            }
            for service in &self.advertised {
                writeln!(f, "     advertise {}", service)?;
            }
        } else {
            writeln!(f, "3. Services: disabled")?;
        }

        writeln!(
            f,
            "4. Exec ({}): {} {}",
            self.mode,
            self.process.executable,
            self.process.args.join(" ")
        )?;
        if let Some(dir) = &self.process.working_dir {
            writeln!(f, "     Working dir: {}", dir.display())?;
        }

        writeln!(f, "5. Lifecycle terminate")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn launch_file(env_file: &str) -> LaunchFile {
        LaunchFile::from_yaml(&format!(
            r#"
args:
  port:
    default: 8081
env_file: "{env_file}"
env:
  LOADER_PORT: "$(arg port)"
app:
  executable: device-loader
  args: ["--port", "$(env LOADER_PORT)", "--name", "$(env VEHICLE_NAME)"]
"#
        ))
        .unwrap()
    }

    #[test]
    fn test_unknown_override_is_rejected() {
        let mut overrides = HashMap::new();
        overrides.insert("nope".to_string(), "1".to_string());
        let result = Bootstrap::new(launch_file("/environment.sh"), overrides, StopHandle::new());
        assert!(matches!(result, Err(SequenceError::UnknownArgument(_))));
    }

    #[test]
    fn test_process_config_resolves_args_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("environment.sh");
        std::fs::write(&env_file, "export VEHICLE_NAME=autobot01\n").unwrap();

        let mut overrides = HashMap::new();
        overrides.insert("port".to_string(), "9090".to_string());
        let mut bootstrap = Bootstrap::new(
            launch_file(env_file.to_str().unwrap()),
            overrides,
            StopHandle::new(),
        )
        .unwrap();

        let env = bootstrap.load_environment().unwrap();
        assert_eq!(env.get("LOADER_PORT"), Some("9090"));

        let config = bootstrap.process_config(&env).unwrap();
        assert_eq!(config.args, vec!["--port", "9090", "--name", "autobot01"]);
        assert!(config
            .env
            .contains(&("VEHICLE_NAME".to_string(), "autobot01".to_string())));
    }

    #[test]
    fn test_plan_display() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("environment.sh");
        std::fs::write(&env_file, "VEHICLE_NAME=autobot01\n").unwrap();

        let mut bootstrap = Bootstrap::new(
            launch_file(env_file.to_str().unwrap()),
            HashMap::new(),
            StopHandle::new(),
        )
        .unwrap();
        let plan = bootstrap.plan().unwrap().to_string();

        assert!(plan.contains("1. Environment:"));
        assert!(plan.contains("4. Exec (supervise): device-loader --port 8081 --name autobot01"));
        assert!(bootstrap.scope().is_none());
    }

    #[test]
    fn test_advertised_port_follows_override() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join("environment.sh");
        std::fs::write(&env_file, "VEHICLE_NAME=autobot01\n").unwrap();
        std::fs::create_dir_all(dir.path().join("templates")).unwrap();

        let launch_file = LaunchFile::from_yaml(&format!(
            r#"
args:
  port:
    default: 8081
env_file: "{env_file}"
services:
  dir: "{templates}"
  target_dir: "{avahi}"
  advertise:
    - name: "device-loader on ${{VEHICLE_NAME}}"
      type: _http._tcp
      port: "$(arg port)"
app:
  executable: device-loader
"#,
            env_file = env_file.display(),
            templates = dir.path().join("templates").display(),
            avahi = dir.path().join("avahi").display(),
        ))
        .unwrap();
        launch_file.validate().unwrap();

        let mut overrides = HashMap::new();
        overrides.insert("port".to_string(), "8082".to_string());
        let mut bootstrap = Bootstrap::new(launch_file, overrides, StopHandle::new()).unwrap();

        let plan = bootstrap.plan().unwrap().to_string();
        assert!(plan.contains("advertise device-loader on ${VEHICLE_NAME} (_http._tcp:8082)"));

        let env = bootstrap.load_environment().unwrap();
        assert_eq!(bootstrap.install_services(&env).unwrap(), 1);
        let xml = std::fs::read_to_string(
            dir.path()
                .join("avahi")
                .join(avahi::service_file_name(&avahi::slugify("device-loader on autobot01"))),
        )
        .unwrap();
        assert!(xml.contains("<port>8082</port>"));
    }

    #[test]
    fn test_init_twice_is_an_error() {
        let mut bootstrap =
            Bootstrap::new(LaunchFile::default(), HashMap::new(), StopHandle::new()).unwrap();
        let env = Environment::new();
        bootstrap.init_lifecycle(&env).unwrap();
        assert!(matches!(
            bootstrap.init_lifecycle(&env),
            Err(SequenceError::Lifecycle(_))
        ));
    }
}
