//! Build tool adapters behind one `build`/`run`/`dev` contract
//!
//! Each adapter owns its template and hides how the tool is told which port
//! to serve on. The runner only ever sees [`Implementation`].

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::process::{BuildResult, ProcessRunner, SpawnOptions};
use crate::scaffold::{Project, Template};
use crate::scenario::ServeMode;
use crate::server::RunningInstance;

/// A supported build tool
#[async_trait]
pub trait Implementation: Send + Sync {
    fn name(&self) -> &'static str;

    /// The skeleton every project handed to this implementation comes from
    fn template(&self) -> Template;

    /// Production build; blocks until the tool exits
    fn build(&self, project: &Project) -> E2eResult<BuildResult>;

    /// Serve the production build on `port`
    async fn run(&self, project: &Project, port: u16) -> E2eResult<RunningInstance>;

    /// Serve through the development server on `port`
    async fn dev(&self, project: &Project, port: u16) -> E2eResult<RunningInstance>;

    async fn start(&self, mode: ServeMode, project: &Project, port: u16) -> E2eResult<RunningInstance> {
        match mode {
            ServeMode::Production => self.run(project, port).await,
            ServeMode::Development => self.dev(project, port).await,
        }
    }
}

/// The fixed set of implementations, in run order
pub fn implementations(config: &HarnessConfig) -> Vec<Arc<dyn Implementation>> {
    let scripts = ScriptRunner::new(config);
    vec![
        Arc::new(ViteAdapter::new(scripts.clone())),
        Arc::new(ParcelAdapter::new(scripts)),
    ]
}

/// How a server learns its port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortWiring {
    /// A command-line flag followed by the port
    Flag(&'static str),
    /// An environment variable read by the application server
    Env(&'static str),
}

/// A fully resolved command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub options: SpawnOptions,
}

/// Runs package.json scripts through the configured package manager
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    package_manager: String,
    runner: ProcessRunner,
}

impl ScriptRunner {
    pub fn new(config: &HarnessConfig) -> Self {
        Self {
            package_manager: config.tools.package_manager.clone(),
            runner: ProcessRunner::new(config.process.clone()),
        }
    }

    /// `<pm> run <script> [extra...]`, with the port wired in when serving
    pub fn invocation(
        &self,
        cwd: &Path,
        script: &str,
        extra: &[&str],
        serve: Option<(PortWiring, u16)>,
    ) -> Invocation {
        let mut args = vec!["run".to_string(), script.to_string()];
        let mut options = SpawnOptions::new(cwd);

        let mut passthrough: Vec<String> = extra.iter().map(|a| a.to_string()).collect();
        if let Some((wiring, port)) = serve {
            match wiring {
                PortWiring::Flag(flag) => {
                    passthrough.push(flag.to_string());
                    passthrough.push(port.to_string());
                }
                PortWiring::Env(var) => options = options.env(var, port.to_string()),
            }
            options = options.port(port);
        }

        if !passthrough.is_empty() {
            // npm swallows script arguments without the separator
            if self.needs_separator() {
                args.push("--".to_string());
            }
            args.extend(passthrough);
        }

        Invocation {
            program: self.package_manager.clone(),
            args,
            options,
        }
    }

    fn needs_separator(&self) -> bool {
        Path::new(&self.package_manager)
            .file_stem()
            .map(|stem| stem == "npm")
            .unwrap_or(false)
    }

    fn complete(&self, invocation: &Invocation) -> E2eResult<BuildResult> {
        self.runner
            .run_to_completion(&invocation.program, &invocation.args, &invocation.options)
    }

    async fn serve(&self, invocation: &Invocation) -> E2eResult<RunningInstance> {
        self.runner
            .spawn(&invocation.program, &invocation.args, &invocation.options)
            .await
    }
}

fn ensure_template(implementation: &dyn Implementation, project: &Project) -> E2eResult<()> {
    if project.template() == implementation.template() {
        Ok(())
    } else {
        Err(E2eError::TemplateMismatch {
            implementation: implementation.name().to_string(),
            expected: implementation.template().to_string(),
            found: project.template().to_string(),
        })
    }
}

/// Vite: the port goes straight onto the command line in both modes
#[derive(Debug, Clone)]
pub struct ViteAdapter {
    scripts: ScriptRunner,
}

impl ViteAdapter {
    const PORT: PortWiring = PortWiring::Flag("--port");

    pub fn new(scripts: ScriptRunner) -> Self {
        Self { scripts }
    }

    pub fn build_invocation(&self, cwd: &Path) -> Invocation {
        self.scripts.invocation(cwd, "build", &[], None)
    }

    pub fn run_invocation(&self, cwd: &Path, port: u16) -> Invocation {
        self.scripts.invocation(cwd, "start", &[], Some((Self::PORT, port)))
    }

    pub fn dev_invocation(&self, cwd: &Path, port: u16) -> Invocation {
        // Without --strictPort vite quietly moves to the next free port
        self.scripts
            .invocation(cwd, "dev", &["--strictPort"], Some((Self::PORT, port)))
    }
}

#[async_trait]
impl Implementation for ViteAdapter {
    fn name(&self) -> &'static str {
        "vite"
    }

    fn template(&self) -> Template {
        Template::RscVite
    }

    fn build(&self, project: &Project) -> E2eResult<BuildResult> {
        ensure_template(self, project)?;
        self.scripts.complete(&self.build_invocation(project.path()))
    }

    async fn run(&self, project: &Project, port: u16) -> E2eResult<RunningInstance> {
        ensure_template(self, project)?;
        self.scripts.serve(&self.run_invocation(project.path(), port)).await
    }

    async fn dev(&self, project: &Project, port: u16) -> E2eResult<RunningInstance> {
        ensure_template(self, project)?;
        self.scripts.serve(&self.dev_invocation(project.path(), port)).await
    }
}

/// Parcel: the app server reads `PORT`; parcel's own HMR port floats
///
/// Known limitation: parcel's production bundle currently carries two copies
/// of react, so `run` serves through `dev` instead of the build output.
#[derive(Debug, Clone)]
pub struct ParcelAdapter {
    scripts: ScriptRunner,
}

impl ParcelAdapter {
    const PORT: PortWiring = PortWiring::Env("PORT");

    /// Whether `run` actually serves the production build
    pub const SERVES_PRODUCTION_BUILD: bool = false;

    pub fn new(scripts: ScriptRunner) -> Self {
        Self { scripts }
    }

    pub fn build_invocation(&self, cwd: &Path) -> Invocation {
        self.scripts.invocation(cwd, "build", &[], None)
    }

    pub fn dev_invocation(&self, cwd: &Path, port: u16) -> Invocation {
        self.scripts.invocation(cwd, "dev", &[], Some((Self::PORT, port)))
    }
}

#[async_trait]
impl Implementation for ParcelAdapter {
    fn name(&self) -> &'static str {
        "parcel"
    }

    fn template(&self) -> Template {
        Template::RscParcel
    }

    fn build(&self, project: &Project) -> E2eResult<BuildResult> {
        ensure_template(self, project)?;
        self.scripts.complete(&self.build_invocation(project.path()))
    }

    async fn run(&self, project: &Project, port: u16) -> E2eResult<RunningInstance> {
        // TODO: serve the build output once parcel stops duplicating react in production bundles
        warn!("parcel: production bundle duplicates react, serving via dev instead");
        self.dev(project, port).await
    }

    async fn dev(&self, project: &Project, port: u16) -> E2eResult<RunningInstance> {
        ensure_template(self, project)?;
        info!("parcel: app server on port {}, bundler port left to parcel", port);
        self.scripts.serve(&self.dev_invocation(project.path(), port)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolConfig;
    use crate::scaffold::{FileSet, Scaffolder};
    use std::path::PathBuf;

    fn scripts(pm: &str) -> ScriptRunner {
        ScriptRunner::new(&HarnessConfig {
            tools: ToolConfig {
                package_manager: pm.to_string(),
            },
            ..Default::default()
        })
    }

    fn args(invocation: &Invocation) -> Vec<&str> {
        invocation.args.iter().map(String::as_str).collect()
    }

    #[test]
    fn test_vite_wires_port_as_flag() {
        let vite = ViteAdapter::new(scripts("pnpm"));
        let cwd = PathBuf::from("/tmp/project");

        let run = vite.run_invocation(&cwd, 4321);
        assert_eq!(run.program, "pnpm");
        assert_eq!(args(&run), ["run", "start", "--port", "4321"]);
        assert!(run.options.env.is_empty());
        assert_eq!(run.options.port, Some(4321));

        let dev = vite.dev_invocation(&cwd, 4322);
        assert_eq!(args(&dev), ["run", "dev", "--strictPort", "--port", "4322"]);
        assert_eq!(dev.options.cwd, cwd);
    }

    #[test]
    fn test_parcel_wires_port_through_env() {
        let parcel = ParcelAdapter::new(scripts("pnpm"));
        let dev = parcel.dev_invocation(Path::new("/tmp/p"), 5100);

        assert_eq!(args(&dev), ["run", "dev"]);
        assert_eq!(dev.options.env.get("PORT").map(String::as_str), Some("5100"));
        assert_eq!(dev.options.port, Some(5100));
        assert!(!ParcelAdapter::SERVES_PRODUCTION_BUILD);
    }

    #[test]
    fn test_build_has_no_port() {
        let vite = ViteAdapter::new(scripts("pnpm"));
        let build = vite.build_invocation(Path::new("/tmp/p"));
        assert_eq!(args(&build), ["run", "build"]);
        assert_eq!(build.options.port, None);
    }

    #[test]
    fn test_npm_gets_argument_separator() {
        let vite = ViteAdapter::new(scripts("/usr/local/bin/npm"));
        let run = vite.run_invocation(Path::new("/tmp/p"), 3000);
        assert_eq!(args(&run), ["run", "start", "--", "--port", "3000"]);
    }

    #[test]
    fn test_registry_pairs_each_tool_with_its_template() {
        let all = implementations(&HarnessConfig::default());
        let pairs: Vec<(&str, Template)> = all.iter().map(|i| (i.name(), i.template())).collect();
        assert_eq!(
            pairs,
            vec![("vite", Template::RscVite), ("parcel", Template::RscParcel)]
        );
    }

    #[test]
    fn test_foreign_template_is_rejected() {
        let templates = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(templates.path().join("rsc-parcel")).unwrap();
        let project = Scaffolder::new(templates.path())
            .scaffold(Template::RscParcel, &FileSet::new())
            .unwrap();

        let err = ViteAdapter::new(scripts("pnpm")).build(&project).unwrap_err();
        assert!(matches!(err, E2eError::TemplateMismatch { .. }));
    }
}
