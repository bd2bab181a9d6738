//! Main test runner that drives every implementation through every scenario

use futures::stream::{self, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::config::HarnessConfig;
use crate::error::{E2eError, E2eResult};
use crate::implementation::Implementation;
use crate::playwright::Browser;
use crate::port::PortAllocator;
use crate::scaffold::{Project, Scaffolder};
use crate::scenario::{Check, Scenario, ServeMode};
use crate::server::RunningInstance;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaseStatus {
    Passed,
    Failed,
    Skipped,
}

/// Result of running one scenario under one implementation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseResult {
    pub implementation: String,
    pub scenario: String,
    pub mode: ServeMode,
    pub status: CaseStatus,
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl CaseResult {
    pub fn id(&self) -> String {
        format!("{} / {} ({})", self.implementation, self.scenario, self.mode)
    }
}

/// Result of running all cases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteResult {
    pub total: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub duration_ms: u64,
    pub finished_at: String,
    pub results: Vec<CaseResult>,
}

impl SuiteResult {
    fn from_results(results: Vec<CaseResult>, duration: Duration) -> Self {
        let count = |status: CaseStatus| results.iter().filter(|r| r.status == status).count();
        let (passed, failed, skipped) = (
            count(CaseStatus::Passed),
            count(CaseStatus::Failed),
            count(CaseStatus::Skipped),
        );
        Self {
            total: results.len(),
            passed,
            failed,
            skipped,
            duration_ms: duration.as_millis() as u64,
            finished_at: chrono::Utc::now().to_rfc3339(),
            results,
        }
    }

    /// Cases that failed, leaving out skipped ones that carry a reason
    pub fn failures(&self) -> impl Iterator<Item = &CaseResult> {
        self.results.iter().filter(|r| r.status == CaseStatus::Failed)
    }
}

/// Orchestrates scaffold → build → start → assert → stop for every case
pub struct TestRunner<B: Browser> {
    implementations: Vec<Arc<dyn Implementation>>,
    scaffolder: Scaffolder,
    ports: PortAllocator,
    browser: B,
    http: reqwest::Client,
    concurrency: usize,
    output_dir: PathBuf,
}

impl<B: Browser> TestRunner<B> {
    /// Create a test runner from harness configuration
    pub fn new(
        config: &HarnessConfig,
        implementations: Vec<Arc<dyn Implementation>>,
        browser: B,
    ) -> E2eResult<Self> {
        let mut scaffolder = Scaffolder::new(&config.templates_dir).keep_projects(config.keep_projects);
        if let Some(dir) = &config.work_dir {
            scaffolder = scaffolder.work_dir(dir);
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.browser.step_timeout_ms))
            .build()?;

        Ok(Self {
            implementations,
            scaffolder,
            ports: PortAllocator::shared(),
            browser,
            http,
            concurrency: config.concurrency.max(1),
            output_dir: config.output_dir.clone(),
        })
    }

    /// Use a dedicated port allocator instead of the process-wide one
    pub fn with_ports(mut self, ports: PortAllocator) -> Self {
        self.ports = ports;
        self
    }

    pub fn implementations(&self) -> &[Arc<dyn Implementation>] {
        &self.implementations
    }

    /// Keep only implementations whose name is listed
    pub fn retain_implementations(&mut self, names: &[String]) {
        if !names.is_empty() {
            self.implementations
                .retain(|i| names.iter().any(|n| n == i.name()));
        }
    }

    /// Run every implementation against every scenario
    pub async fn run_all(&self, scenarios: &[Scenario]) -> SuiteResult {
        let start = Instant::now();
        let cases: Vec<(&Arc<dyn Implementation>, &Scenario)> = self
            .implementations
            .iter()
            .flat_map(|implementation| scenarios.iter().map(move |s| (implementation, s)))
            .collect();

        info!(
            "Running {} case(s) across {} implementation(s), {} at a time...",
            cases.len(),
            self.implementations.len(),
            self.concurrency
        );

        let results: Vec<CaseResult> = stream::iter(cases)
            .map(|(implementation, scenario)| self.run_case(implementation, scenario))
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let suite = SuiteResult::from_results(results, start.elapsed());
        info!(
            "Test Results: {} passed, {} failed, {} skipped ({} ms)",
            suite.passed, suite.failed, suite.skipped, suite.duration_ms
        );
        suite
    }

    /// Run one scenario under one implementation, never returning early
    pub async fn run_case(&self, implementation: &Arc<dyn Implementation>, scenario: &Scenario) -> CaseResult {
        let start = Instant::now();
        let mut result = CaseResult {
            implementation: implementation.name().to_string(),
            scenario: scenario.name.clone(),
            mode: scenario.mode,
            status: CaseStatus::Skipped,
            duration_ms: 0,
            error: None,
        };

        if let Some(reason) = &scenario.pending {
            info!("- {} skipped: {}", result.id(), reason);
            result.error = Some(reason.clone());
            return result;
        }

        match self.execute(implementation, scenario).await {
            Ok(()) => {
                result.status = CaseStatus::Passed;
                info!("✓ {} ({} ms)", result.id(), start.elapsed().as_millis());
            }
            Err(e) => {
                result.status = CaseStatus::Failed;
                error!("✗ {} - {}", result.id(), e);
                result.error = Some(e.to_string());
            }
        }

        result.duration_ms = start.elapsed().as_millis() as u64;
        result
    }

    async fn execute(&self, implementation: &Arc<dyn Implementation>, scenario: &Scenario) -> E2eResult<()> {
        // Declared first so it is released only after the server is gone
        let lease = self.ports.acquire()?;
        let project = self.scaffolder.scaffold(implementation.template(), &scenario.files)?;

        let project = self.build(implementation, project).await?;

        debug!("Starting {} in {} mode on port {}", implementation.name(), scenario.mode, lease.port());
        let instance = implementation.start(scenario.mode, &project, lease.port()).await?;

        let verified = self.verify(&instance, scenario).await;
        let stopped = stop_instance(instance).await;
        verified?;
        stopped
    }

    /// Build on a blocking thread so other cases keep polling
    async fn build(&self, implementation: &Arc<dyn Implementation>, project: Project) -> E2eResult<Project> {
        let name = implementation.name();
        let implementation = Arc::clone(implementation);
        let (project, result) = tokio::task::spawn_blocking(move || {
            let result = implementation
                .build(&project)
                .and_then(|build| build.into_result(implementation.name()));
            (project, result)
        })
        .await
        .map_err(|e| E2eError::Task(format!("{} build: {}", name, e)))?;

        result?;
        Ok(project)
    }

    async fn verify(&self, instance: &RunningInstance, scenario: &Scenario) -> E2eResult<()> {
        for check in &scenario.checks {
            match check {
                Check::Html { path, pattern } => self.check_html(instance, path, pattern).await?,
                Check::Browser(steps) => self.browser.run(instance.base_url(), steps).await?,
            }
        }
        Ok(())
    }

    async fn check_html(&self, instance: &RunningInstance, path: &str, pattern: &str) -> E2eResult<()> {
        let pattern = Regex::new(pattern)?;
        let url = format!("{}{}", instance.base_url(), path);
        let body = self.http.get(&url).send().await?.text().await?;

        if pattern.is_match(&body) {
            Ok(())
        } else {
            warn!("Body of {} ({} bytes) lacks {}", url, body.len(), pattern);
            Err(E2eError::AssertionFailed(format!(
                "response body of {} does not match /{}/",
                url, pattern
            )))
        }
    }

    /// Write test results to JSON file
    pub fn write_results(&self, results: &SuiteResult) -> E2eResult<PathBuf> {
        std::fs::create_dir_all(&self.output_dir)?;

        let path = self.output_dir.join("test-results.json");
        let json = serde_json::to_string_pretty(results)?;
        std::fs::write(&path, json)?;

        info!("Results written to: {}", path.display());
        Ok(path)
    }
}

/// Stop on a blocking thread; the grace wait would otherwise stall every case on this task
async fn stop_instance(mut instance: RunningInstance) -> E2eResult<()> {
    tokio::task::spawn_blocking(move || instance.stop())
        .await
        .map_err(|e| E2eError::Task(format!("stopping server: {}", e)))?
}

/// Keep scenarios whose name is listed, and only the requested mode
pub fn filter_scenarios(scenarios: Vec<Scenario>, names: &[String], mode: Option<ServeMode>) -> Vec<Scenario> {
    scenarios
        .into_iter()
        .filter(|s| names.is_empty() || names.iter().any(|n| *n == s.name))
        .filter(|s| mode.map_or(true, |m| m == s.mode))
        .collect()
}
