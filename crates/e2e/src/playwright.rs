//! Playwright browser automation

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use crate::error::{E2eError, E2eResult};
use crate::process::kill_process_group;
use crate::scenario::PageStep;

/// Drives a page against a running server
#[async_trait]
pub trait Browser: Send + Sync {
    /// Execute `steps` in order within one browser session
    async fn run(&self, base_url: &str, steps: &[PageStep]) -> E2eResult<()>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserKind {
    #[default]
    Chromium,
    Firefox,
    Webkit,
}

impl BrowserKind {
    fn as_str(&self) -> &'static str {
        match self {
            BrowserKind::Chromium => "chromium",
            BrowserKind::Firefox => "firefox",
            BrowserKind::Webkit => "webkit",
        }
    }
}

impl std::str::FromStr for BrowserKind {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chromium" => Ok(BrowserKind::Chromium),
            "firefox" => Ok(BrowserKind::Firefox),
            "webkit" => Ok(BrowserKind::Webkit),
            other => Err(E2eError::Config(format!("unknown browser '{}'", other))),
        }
    }
}

/// Configuration for Playwright
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlaywrightConfig {
    pub browser: BrowserKind,
    pub headless: bool,

    /// Bound for each navigation, click and text expectation
    pub step_timeout_ms: u64,

    /// Bound for a whole script run
    pub script_timeout_secs: u64,

    /// Node executable
    pub node_binary: String,

    /// Extra module search path so `require('playwright')` resolves
    pub node_path: Option<PathBuf>,
}

impl Default for PlaywrightConfig {
    fn default() -> Self {
        Self {
            browser: BrowserKind::Chromium,
            headless: true,
            step_timeout_ms: 5000,
            script_timeout_secs: 120,
            node_binary: "node".to_string(),
            node_path: None,
        }
    }
}

/// Last line a script writes to stderr when it fails
#[derive(Debug, Deserialize)]
struct ScriptFailure {
    #[serde(default)]
    step: String,
    #[serde(default)]
    assertion: bool,
    error: String,
}

/// Runs each check as a generated Node script using the Playwright library
#[derive(Debug, Clone)]
pub struct PlaywrightBrowser {
    config: PlaywrightConfig,
}

impl PlaywrightBrowser {
    pub fn new(config: PlaywrightConfig) -> Self {
        Self { config }
    }

    /// Check that Node can load the Playwright library
    pub async fn check_installed(&self) -> E2eResult<()> {
        let status = self
            .node()
            .args(["-e", "require.resolve('playwright')"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;

        match status {
            Ok(status) if status.success() => Ok(()),
            _ => Err(E2eError::Playwright(
                "the playwright package is not resolvable; install it and set browser.node_path".to_string(),
            )),
        }
    }

    fn node(&self) -> Command {
        let mut cmd = Command::new(&self.config.node_binary);
        if let Some(path) = &self.config.node_path {
            cmd.env("NODE_PATH", path);
        }
        cmd
    }

    /// Build the Playwright script for a set of steps
    pub fn build_script(&self, base_url: &str, steps: &[PageStep]) -> String {
        let mut script = String::new();

        script.push_str(&format!(
            r#"
const {{ chromium, firefox, webkit }} = require('playwright');

class ExpectationError extends Error {{}}

(async () => {{
  const browser = await {browser}.launch({{ headless: {headless} }});
  const page = await browser.newPage();
  const baseUrl = {base_url};
  const timeout = {timeout};
  let navigations = 0;
  let step = '';
  page.on('framenavigated', (frame) => {{
    if (frame === page.mainFrame()) navigations++;
  }});

  try {{
"#,
            browser = self.config.browser.as_str(),
            headless = self.config.headless,
            base_url = js(base_url),
            timeout = self.config.step_timeout_ms,
        ));

        for (i, step) in steps.iter().enumerate() {
            script.push_str(&format!("\n    // Step {}: {}\n", i + 1, step.name()));
            script.push_str(&format!("    step = {};\n", js(&step.name())));
            script.push_str(&step_to_js(step));
            script.push('\n');
        }

        script.push_str(
            r#"
    console.log(JSON.stringify({ success: true }));
  } catch (error) {
    console.error(JSON.stringify({
      success: false,
      step,
      assertion: error instanceof ExpectationError,
      error: error.message,
    }));
    process.exitCode = 1;
  } finally {
    await browser.close();
  }
})();
"#,
        );

        script
    }

    /// Execute the full script via Node
    pub async fn run_script(&self, script: &str) -> E2eResult<()> {
        let temp_dir = tempfile::tempdir()?;
        let script_path = temp_dir.path().join("case.cjs");
        std::fs::write(&script_path, script)?;

        debug!("Running Playwright script: {}", script_path.display());

        let limit = Duration::from_secs(self.config.script_timeout_secs);
        let mut node = self.node();
        node.arg(&script_path)
            .current_dir(temp_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Browsers launched by the script join its group, so one killpg reaches them
        #[cfg(unix)]
        node.process_group(0);

        let child = node.spawn()?;
        let pid = child.id();
        let output = tokio::time::timeout(limit, child.wait_with_output()).await;
        if let Some(pid) = pid {
            kill_process_group(pid);
        }
        let output =
            output.map_err(|_| E2eError::Timeout(format!("browser script to finish within {:?}", limit)))??;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let failure = stderr
            .lines()
            .rev()
            .find_map(|line| serde_json::from_str::<ScriptFailure>(line).ok());

        Err(match failure {
            Some(f) if f.assertion => E2eError::AssertionFailed(format!("{}: {}", f.step, f.error)),
            Some(f) => E2eError::Playwright(format!("{}: {}", f.step, f.error)),
            None => E2eError::Playwright(format!(
                "Script failed:\nstdout: {}\nstderr: {}",
                String::from_utf8_lossy(&output.stdout),
                stderr
            )),
        })
    }
}

#[async_trait]
impl Browser for PlaywrightBrowser {
    async fn run(&self, base_url: &str, steps: &[PageStep]) -> E2eResult<()> {
        let script = self.build_script(base_url, steps);
        self.run_script(&script).await
    }
}

/// Convert a step to JavaScript code
fn step_to_js(step: &PageStep) -> String {
    match step {
        PageStep::Navigate { path, wait_for } => {
            let wait = wait_for
                .as_ref()
                .map(|s| format!("\n    await page.waitForSelector({}, {{ timeout }});", js(s)))
                .unwrap_or_default();
            format!(
                "    await page.goto(baseUrl + {}, {{ timeout }});{}\n    navigations = 0;",
                js(path),
                wait
            )
        }
        PageStep::Reload => "    await page.reload({ timeout });\n    navigations = 0;".to_string(),
        PageStep::Click { selector } => {
            format!("    await page.click({}, {{ timeout }});", js(selector))
        }
        PageStep::Fill { selector, value } => {
            format!("    await page.fill({}, {}, {{ timeout }});", js(selector), js(value))
        }
        PageStep::ExpectText { selector, text } => format!(
            r#"    try {{
      await page.waitForFunction(
        ([sel, text]) => document.querySelector(sel)?.textContent === text,
        [{sel}, {text}],
        {{ timeout }},
      );
    }} catch (_) {{
      const actual = await page.locator({sel}).first().textContent({{ timeout: 1000 }}).catch(() => null);
      throw new ExpectationError(`expected ${{{sel}}} to have text ${{JSON.stringify({text})}}, got ${{JSON.stringify(actual)}}`);
    }}"#,
            sel = js(selector),
            text = js(text),
        ),
        PageStep::ExpectNoNavigation => r#"    if (navigations !== 0) {
      throw new ExpectationError(`expected no navigation, saw ${navigations}`);
    }"#
        .to_string(),
    }
}

/// A JavaScript string literal
fn js(value: &str) -> String {
    serde_json::Value::String(value.to_string()).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn browser() -> PlaywrightBrowser {
        PlaywrightBrowser::new(PlaywrightConfig::default())
    }

    #[test]
    fn test_script_runs_all_steps_in_one_session() {
        let steps = vec![
            PageStep::navigate("/", Some("[data-count]")),
            PageStep::expect_text("[data-count]", "Count: 0"),
            PageStep::click("[data-count]"),
            PageStep::ExpectNoNavigation,
        ];
        let script = browser().build_script("http://localhost:4100", &steps);

        assert_eq!(script.matches("browser.newPage()").count(), 1);
        assert!(script.contains(r#"const baseUrl = "http://localhost:4100";"#));
        assert!(script.contains(r#"await page.goto(baseUrl + "/", { timeout });"#));
        assert!(script.contains(r#"await page.click("[data-count]", { timeout });"#));
        assert!(script.contains("// Step 4: expect_no_navigation"));
        assert!(script.contains("const timeout = 5000;"));
    }

    #[test]
    fn test_literals_are_escaped() {
        let steps = vec![PageStep::expect_text("[data-title='x']", "It's \"quoted\"")];
        let script = browser().build_script("http://localhost:1", &steps);
        assert!(script.contains(r#""It's \"quoted\"""#));
        assert!(script.contains(r#""[data-title='x']""#));
    }

    #[test]
    fn test_configured_browser_is_launched() {
        let browser = PlaywrightBrowser::new(PlaywrightConfig {
            browser: BrowserKind::Firefox,
            headless: false,
            ..Default::default()
        });
        let script = browser.build_script("http://localhost:1", &[]);
        assert!(script.contains("await firefox.launch({ headless: false })"));
    }

    #[test]
    fn test_failure_line_parses() {
        let line = r#"{"success":false,"step":"expect_text:[data-home]","assertion":true,"error":"expected"}"#;
        let failure: ScriptFailure = serde_json::from_str(line).unwrap();
        assert!(failure.assertion);
        assert_eq!(failure.step, "expect_text:[data-home]");
    }

    #[test]
    fn test_browser_kind_parses() {
        assert_eq!("webkit".parse::<BrowserKind>().unwrap(), BrowserKind::Webkit);
        assert!("lynx".parse::<BrowserKind>().is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_timeout_kills_processes_the_script_started() {
        let dir = tempfile::tempdir().unwrap();
        let pid_file = dir.path().join("browser.pid");
        let browser = PlaywrightBrowser::new(PlaywrightConfig {
            node_binary: "sh".to_string(),
            script_timeout_secs: 1,
            ..Default::default()
        });

        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let err = browser.run_script(&script).await.unwrap_err();
        assert!(matches!(err, E2eError::Timeout(_)), "{err:?}");

        let pid = std::fs::read_to_string(&pid_file).unwrap().trim().to_string();
        std::thread::sleep(Duration::from_millis(200));
        // Gone entirely, or a zombie awaiting its reaper
        let running = std::fs::read_to_string(format!("/proc/{}/stat", pid))
            .map(|stat| !stat.contains(") Z"))
            .unwrap_or(false);
        assert!(!running, "browser stand-in {pid} outlived the script timeout");
    }
}
