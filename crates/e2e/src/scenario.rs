//! Scenario model and the built-in RSC suite

use serde::{Deserialize, Serialize};

use crate::scaffold::FileSet;

/// `(self.__FLIGHT_DATA||=[]).push(` as injected into streamed HTML
pub const FLIGHT_DATA_PATTERN: &str = r"\(self\.__FLIGHT_DATA\s*\|\|=\s*\[\]\)\.push\(";

/// How a built project is served
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServeMode {
    /// Serve the build output via `run`
    Production,
    /// Serve through the tool's dev server via `dev`
    Development,
}

impl ServeMode {
    pub const ALL: [ServeMode; 2] = [ServeMode::Production, ServeMode::Development];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServeMode::Production => "production",
            ServeMode::Development => "development",
        }
    }
}

impl std::fmt::Display for ServeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ServeMode {
    type Err = crate::error::E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "production" | "prod" => Ok(ServeMode::Production),
            "development" | "dev" => Ok(ServeMode::Development),
            other => Err(crate::error::E2eError::Config(format!("unknown serve mode '{}'", other))),
        }
    }
}

/// A single browser action or expectation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PageStep {
    /// Load a path (relative to the server) and optionally wait for a selector
    Navigate {
        path: String,
        #[serde(default)]
        wait_for: Option<String>,
    },

    /// Reload the current page
    Reload,

    /// Click an element
    Click { selector: String },

    /// Fill an input field
    Fill { selector: String, value: String },

    /// Wait until the first match of `selector` has exactly `text`
    ExpectText { selector: String, text: String },

    /// Fail if the main frame navigated since the last `Navigate` or `Reload`
    ExpectNoNavigation,
}

impl PageStep {
    pub fn navigate(path: &str, wait_for: Option<&str>) -> Self {
        PageStep::Navigate {
            path: path.to_string(),
            wait_for: wait_for.map(String::from),
        }
    }

    pub fn click(selector: &str) -> Self {
        PageStep::Click {
            selector: selector.to_string(),
        }
    }

    pub fn fill(selector: &str, value: &str) -> Self {
        PageStep::Fill {
            selector: selector.to_string(),
            value: value.to_string(),
        }
    }

    pub fn expect_text(selector: &str, text: &str) -> Self {
        PageStep::ExpectText {
            selector: selector.to_string(),
            text: text.to_string(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            PageStep::Navigate { path, .. } => format!("navigate:{}", path),
            PageStep::Reload => "reload".to_string(),
            PageStep::Click { selector } => format!("click:{}", selector),
            PageStep::Fill { selector, .. } => format!("fill:{}", selector),
            PageStep::ExpectText { selector, .. } => format!("expect_text:{}", selector),
            PageStep::ExpectNoNavigation => "expect_no_navigation".to_string(),
        }
    }
}

/// Something verified against the live server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    /// Fetch the raw document and require a regex match on the body
    Html { path: String, pattern: String },

    /// Drive the page through the browser
    Browser(Vec<PageStep>),
}

/// One test case, run once per implementation
#[derive(Debug, Clone)]
pub struct Scenario {
    pub name: String,
    pub mode: ServeMode,
    pub files: FileSet,
    pub checks: Vec<Check>,

    /// Reason the scenario is specified but not yet expected to pass
    pub pending: Option<String>,
}

impl Scenario {
    pub fn new(name: impl Into<String>, mode: ServeMode, files: FileSet) -> Self {
        Self {
            name: name.into(),
            mode,
            files,
            checks: Vec::new(),
            pending: None,
        }
    }

    pub fn check(mut self, check: Check) -> Self {
        self.checks.push(check);
        self
    }

    pub fn pending(mut self, reason: impl Into<String>) -> Self {
        self.pending = Some(reason.into());
        self
    }

    /// `name (mode)`, unique within a suite
    pub fn id(&self) -> String {
        format!("{} ({})", self.name, self.mode)
    }
}

const ROUTES: &str = "src/routes/config.ts";
const HOME: &str = "src/routes/home.tsx";
const HOME_CLIENT: &str = "src/routes/home.client.tsx";
const HOME_ACTIONS: &str = "src/routes/home.actions.ts";

const ROUTE_CONFIG: &str = r#"import type { unstable_RSCRouteConfig as RSCRouteConfig } from "react-router";

export function routes() {
  return [
    {
      id: "root",
      path: "",
      lazy: () => import("./root"),
      children: [
        {
          id: "home",
          index: true,
          lazy: () => import("./home"),
        },
      ],
    },
  ] satisfies RSCRouteConfig;
}
"#;

const LOADER_HOME: &str = r#"export function loader() {
  return { message: "Loader Data" };
}

export default function HomeRoute({ loaderData }: { loaderData: { message: string } }) {
  return <h2 data-home>Home: {loaderData.message}</h2>;
}
"#;

const COUNTER_HOME: &str = r#"import { Counter } from "./home.client";

export function loader() {
  return { message: "Loader Data" };
}

export default function HomeRoute({ loaderData }: { loaderData: { message: string } }) {
  return (
    <div>
      <h2 data-home>Home: {loaderData.message}</h2>
      <Counter />
    </div>
  );
}
"#;

const COUNTER_CLIENT: &str = r#""use client";

import { useState } from "react";

export function Counter() {
  const [count, setCount] = useState(0);
  return (
    <button type="button" data-count onClick={() => setCount((c) => c + 1)}>
      Count: {count}
    </button>
  );
}
"#;

const ACTION_HOME: &str = r#"import { getCount, incrementCount } from "./home.actions";

export default function HomeRoute() {
  return (
    <div>
      <form action={incrementCount}>
        <button type="submit" data-submit>
          Increment
        </button>
      </form>
      <div data-count>Count: {getCount()}</div>
    </div>
  );
}
"#;

const ACTION_SERVER: &str = r#""use server";

let count = 0;

export function getCount() {
  return count;
}

export async function incrementCount() {
  count++;
}
"#;

const ERROR_HOME: &str = r#"import { useRouteError } from "react-router";

export function loader() {
  throw new Error("This is an error");
}

export default function HomeRoute() {
  return <h2>Should not render</h2>;
}

export function ErrorBoundary() {
  const error = useRouteError() as Error;
  return <h2 data-error-title>{error.message}</h2>;
}
"#;

/// The cross-bundler suite: every scenario in both serve modes
pub fn rsc_scenarios() -> Vec<Scenario> {
    ServeMode::ALL
        .into_iter()
        .flat_map(|mode| {
            [
                loader_data(mode),
                client_counter(mode),
                server_action(mode),
                error_boundary(mode),
            ]
        })
        .collect()
}

/// Route loader data is rendered on the server and streamed
pub fn loader_data(mode: ServeMode) -> Scenario {
    let files = FileSet::new()
        .with(ROUTES, ROUTE_CONFIG)
        .with(HOME, LOADER_HOME);

    Scenario::new("loader-data", mode, files)
        .check(Check::Html {
            path: "/".to_string(),
            pattern: FLIGHT_DATA_PATTERN.to_string(),
        })
        .check(Check::Browser(vec![
            PageStep::navigate("/", Some("[data-home]")),
            PageStep::expect_text("[data-home]", "Home: Loader Data"),
        ]))
}

/// A client component hydrates and keeps its state without navigating
pub fn client_counter(mode: ServeMode) -> Scenario {
    let files = FileSet::new()
        .with(ROUTES, ROUTE_CONFIG)
        .with(HOME, COUNTER_HOME)
        .with(HOME_CLIENT, COUNTER_CLIENT);

    Scenario::new("client-counter", mode, files).check(Check::Browser(vec![
        PageStep::navigate("/", Some("[data-home]")),
        PageStep::expect_text("[data-home]", "Home: Loader Data"),
        PageStep::expect_text("[data-count]", "Count: 0"),
        PageStep::click("[data-count]"),
        PageStep::expect_text("[data-count]", "Count: 1"),
        PageStep::click("[data-count]"),
        PageStep::expect_text("[data-count]", "Count: 2"),
        PageStep::ExpectNoNavigation,
    ]))
}

/// A form bound to a server action mutates state held by the server
pub fn server_action(mode: ServeMode) -> Scenario {
    let files = FileSet::new()
        .with(ROUTES, ROUTE_CONFIG)
        .with(HOME, ACTION_HOME)
        .with(HOME_ACTIONS, ACTION_SERVER);

    Scenario::new("server-action", mode, files).check(Check::Browser(vec![
        PageStep::navigate("/", Some("[data-submit]")),
        PageStep::expect_text("[data-count]", "Count: 0"),
        PageStep::click("[data-submit]"),
        PageStep::expect_text("[data-count]", "Count: 1"),
        PageStep::click("[data-submit]"),
        PageStep::expect_text("[data-count]", "Count: 2"),
        // A fresh document can only know the count if the server kept it
        PageStep::Reload,
        PageStep::expect_text("[data-count]", "Count: 2"),
    ]))
}

/// A loader error renders the route's error boundary with the message
pub fn error_boundary(mode: ServeMode) -> Scenario {
    let files = FileSet::new()
        .with(ROUTES, ROUTE_CONFIG)
        .with(HOME, ERROR_HOME);

    Scenario::new("error-boundary", mode, files)
        .check(Check::Browser(vec![
            PageStep::navigate("/", Some("[data-error-title]")),
            PageStep::expect_text("[data-error-title]", "This is an error"),
        ]))
        .pending("server-side loader errors do not reach the route error boundary yet")
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;
    use std::collections::HashSet;

    #[test]
    fn test_suite_covers_both_modes() {
        let scenarios = rsc_scenarios();
        assert_eq!(scenarios.len(), 8);

        let ids: HashSet<String> = scenarios.iter().map(Scenario::id).collect();
        assert_eq!(ids.len(), scenarios.len());
        assert!(ids.contains("loader-data (production)"));
        assert!(ids.contains("server-action (development)"));
    }

    #[test]
    fn test_file_sets_are_scaffoldable() {
        for scenario in rsc_scenarios() {
            scenario.files.validate().unwrap();
            assert!(scenario.files.get(ROUTES).is_some(), "{}", scenario.id());
            assert!(scenario.files.get(HOME).is_some(), "{}", scenario.id());
        }
    }

    #[test]
    fn test_only_error_boundary_is_pending() {
        let pending: Vec<String> = rsc_scenarios()
            .into_iter()
            .filter(|s| s.pending.is_some())
            .map(|s| s.name)
            .collect();
        assert_eq!(pending, vec!["error-boundary", "error-boundary"]);
    }

    #[test]
    fn test_flight_pattern_matches_streamed_html() {
        let pattern = Regex::new(FLIGHT_DATA_PATTERN).unwrap();
        let html = r#"<div id="root"></div><script>(self.__FLIGHT_DATA||=[]).push("0:{}")</script>"#;
        assert!(pattern.is_match(html));
        assert!(pattern.is_match("(self.__FLIGHT_DATA ||= []).push(1)"));
        assert!(!pattern.is_match("<script>self.__FLIGHT_DATA = []</script>"));
    }

    #[test]
    fn test_loader_scenario_expects_loader_text() {
        let scenario = loader_data(ServeMode::Production);
        let steps = scenario
            .checks
            .iter()
            .find_map(|c| match c {
                Check::Browser(steps) => Some(steps),
                _ => None,
            })
            .unwrap();
        assert!(steps.contains(&PageStep::expect_text("[data-home]", "Home: Loader Data")));
    }

    #[test]
    fn test_page_step_deserializes_from_json() {
        let json = r#"[{"action":"navigate","path":"/"},{"action":"expect_no_navigation"}]"#;
        let steps: Vec<PageStep> = serde_json::from_str(json).unwrap();
        assert_eq!(steps, vec![PageStep::navigate("/", None), PageStep::ExpectNoNavigation]);
    }
}
