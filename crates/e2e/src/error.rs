//! Error types for the bundler harness

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum E2eError {
    #[error("Scaffold failed: {0}")]
    Scaffold(String),

    #[error("Refusing to write outside the project root: {path}")]
    UnsafePath { path: String },

    #[error("{implementation} expects a project scaffolded from '{expected}', got '{found}'")]
    TemplateMismatch {
        implementation: String,
        expected: String,
        found: String,
    },

    #[error("{implementation} build failed ({status})\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}")]
    Build {
        implementation: String,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("`{command}` did not accept connections on port {port} within {timeout:?}")]
    ReadinessTimeout {
        command: String,
        port: u16,
        timeout: Duration,
    },

    #[error("Server failed to start: {0}")]
    ServerStartup(String),

    #[error("No unleased port found after {attempts} attempts")]
    PortExhausted { attempts: usize },

    #[error("Background task failed: {0}")]
    Task(String),

    #[error("Timeout waiting for: {0}")]
    Timeout(String),

    #[error("Assertion failed: {0}")]
    AssertionFailed(String),

    #[error("Playwright error: {0}")]
    Playwright(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),
}

pub type E2eResult<T> = Result<T, E2eError>;
