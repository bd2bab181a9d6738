//! Cross-bundler E2E harness for the RSC framework
//!
//! This crate checks that the framework behaves the same under every
//! supported bundler:
//! - Scaffolds a throwaway project per case from a template plus a file overlay
//! - Builds it and serves it through a per-tool adapter
//! - Asserts on the streamed HTML and drives the page with Playwright
//! - Stops every server it started, whatever the outcome
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 TestRunner (per case, sequential)           │
//! ├─────────────────────────────────────────────────────────────┤
//! │  PortAllocator::acquire()        -> PortLease               │
//! │  Scaffolder::scaffold(template)  -> Project                 │
//! │  Implementation::build(project)  -> BuildResult             │
//! │  Implementation::start(mode)     -> RunningInstance         │
//! │  Check::Html / Check::Browser    -> pass | fail             │
//! │  RunningInstance::stop()         (always, also on Drop)     │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Implementations                                            │
//! │    ├── vite    port via --port, run = start script          │
//! │    └── parcel  port via PORT env, run delegates to dev      │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod error;
pub mod implementation;
pub mod logging;
pub mod playwright;
pub mod port;
pub mod process;
pub mod runner;
pub mod scaffold;
pub mod scenario;
pub mod server;

pub use config::HarnessConfig;
pub use error::{E2eError, E2eResult};
pub use implementation::{implementations, Implementation};
pub use runner::TestRunner;
pub use scaffold::{FileSet, Project, Scaffolder, Template};
pub use scenario::{Check, PageStep, Scenario, ServeMode};
pub use server::RunningInstance;
