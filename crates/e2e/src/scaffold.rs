//! Project scaffolding - template skeleton plus a per-case file overlay

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use tempfile::TempDir;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{E2eError, E2eResult};

/// Baseline project skeleton, one per build tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Template {
    RscVite,
    RscParcel,
}

impl Template {
    pub const ALL: [Template; 2] = [Template::RscVite, Template::RscParcel];

    /// Directory name under the templates root
    pub fn as_str(&self) -> &'static str {
        match self {
            Template::RscVite => "rsc-vite",
            Template::RscParcel => "rsc-parcel",
        }
    }
}

impl std::fmt::Display for Template {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Template {
    type Err = E2eError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Template::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| E2eError::Scaffold(format!("unknown template '{}'", s)))
    }
}

/// Relative path -> source text, overlaid on a template
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    files: BTreeMap<String, String>,
}

impl FileSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, path: impl Into<String>, contents: impl Into<String>) -> Self {
        self.insert(path, contents);
        self
    }

    pub fn insert(&mut self, path: impl Into<String>, contents: impl Into<String>) {
        self.files.insert(path.into(), contents.into());
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.files.get(path).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.files.iter().map(|(p, c)| (p.as_str(), c.as_str()))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Check every path before anything touches the disk
    pub fn validate(&self) -> E2eResult<()> {
        for path in self.files.keys() {
            relative_path(path)?;
        }
        Ok(())
    }
}

impl<P: Into<String>, C: Into<String>> FromIterator<(P, C)> for FileSet {
    fn from_iter<I: IntoIterator<Item = (P, C)>>(iter: I) -> Self {
        let mut set = FileSet::new();
        for (path, contents) in iter {
            set.insert(path, contents);
        }
        set
    }
}

/// Resolve `path` to a relative path that stays inside the project root
fn relative_path(path: &str) -> E2eResult<PathBuf> {
    let unsafe_path = || E2eError::UnsafePath {
        path: path.to_string(),
    };

    let mut clean = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path())
            }
        }
    }

    if clean.as_os_str().is_empty() {
        return Err(unsafe_path());
    }
    // node_modules is a link into the template, so writes there would leak into every project
    if clean.starts_with("node_modules") {
        return Err(unsafe_path());
    }
    Ok(clean)
}

/// A materialized project, owned by exactly one case
#[derive(Debug)]
pub struct Project {
    path: PathBuf,
    template: Template,
    _dir: Option<TempDir>,
}

impl Project {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn template(&self) -> Template {
        self.template
    }
}

/// Turns a template plus a [`FileSet`] into a fresh project directory
#[derive(Debug, Clone)]
pub struct Scaffolder {
    templates_dir: PathBuf,
    work_dir: Option<PathBuf>,
    keep_projects: bool,
}

impl Scaffolder {
    pub fn new(templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates_dir: templates_dir.into(),
            work_dir: None,
            keep_projects: false,
        }
    }

    /// Create projects under `dir` instead of the system temp dir
    pub fn work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(dir.into());
        self
    }

    /// Leave projects on disk after they are dropped
    pub fn keep_projects(mut self, keep: bool) -> Self {
        self.keep_projects = keep;
        self
    }

    pub fn template_dir(&self, template: Template) -> PathBuf {
        self.templates_dir.join(template.as_str())
    }

    /// Materialize `files` on top of `template` in a new unique directory
    pub fn scaffold(&self, template: Template, files: &FileSet) -> E2eResult<Project> {
        files.validate()?;

        let source = self.template_dir(template);
        if !source.is_dir() {
            return Err(E2eError::Scaffold(format!(
                "template '{}' not found at {}",
                template,
                source.display()
            )));
        }

        let dir = self.create_dir(template)?;
        let root = dir.path().to_path_buf();

        copy_template(&source, &root)
            .map_err(|e| E2eError::Scaffold(format!("copying {}: {}", source.display(), e)))?;
        link_node_modules(&source, &root)
            .map_err(|e| E2eError::Scaffold(format!("linking node_modules: {}", e)))?;

        let canonical_root = root
            .canonicalize()
            .map_err(|e| E2eError::Scaffold(format!("resolving {}: {}", root.display(), e)))?;

        for (path, contents) in files.iter() {
            let target = root.join(relative_path(path)?);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| E2eError::Scaffold(format!("creating {}: {}", parent.display(), e)))?;
                ensure_inside(&canonical_root, parent, path)?;
            }
            fs::write(&target, contents)
                .map_err(|e| E2eError::Scaffold(format!("writing {}: {}", target.display(), e)))?;
            debug!("Wrote {}", target.display());
        }

        info!("Scaffolded {} project at {} ({} overlay file(s))", template, root.display(), files.len());

        let dir = if self.keep_projects {
            #[allow(deprecated)]
            let kept = dir.into_path();
            info!("Keeping project {}", kept.display());
            None
        } else {
            Some(dir)
        };

        Ok(Project {
            path: root,
            template,
            _dir: dir,
        })
    }

    fn create_dir(&self, template: Template) -> E2eResult<TempDir> {
        let prefix = format!("{}-", template.as_str());
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix);

        let dir = match &self.work_dir {
            Some(parent) => {
                fs::create_dir_all(parent).map_err(|e| {
                    E2eError::Scaffold(format!("creating work dir {}: {}", parent.display(), e))
                })?;
                builder.tempdir_in(parent)
            }
            None => builder.tempdir(),
        };
        dir.map_err(|e| E2eError::Scaffold(format!("creating project dir: {}", e)))
    }
}

/// A parent reached through a symlink must still resolve under the project root
fn ensure_inside(canonical_root: &Path, parent: &Path, path: &str) -> E2eResult<()> {
    let resolved = parent
        .canonicalize()
        .map_err(|e| E2eError::Scaffold(format!("resolving {}: {}", parent.display(), e)))?;
    if resolved.starts_with(canonical_root) {
        Ok(())
    } else {
        Err(E2eError::UnsafePath {
            path: path.to_string(),
        })
    }
}

fn copy_template(source: &Path, dest: &Path) -> std::io::Result<()> {
    let entries = WalkDir::new(source)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| e.file_name() != "node_modules");

    for entry in entries {
        let entry = entry?;
        let rel = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
        let target = dest.join(rel);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Installed dependencies are shared with the template, never copied
#[cfg(unix)]
fn link_node_modules(source: &Path, dest: &Path) -> std::io::Result<()> {
    let modules = source.join("node_modules");
    if modules.is_dir() {
        std::os::unix::fs::symlink(modules.canonicalize()?, dest.join("node_modules"))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn link_node_modules(_source: &Path, _dest: &Path) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn templates() -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        let vite = dir.path().join("rsc-vite");
        fs::create_dir_all(vite.join("src/routes")).unwrap();
        fs::write(vite.join("package.json"), r#"{"name":"rsc-vite"}"#).unwrap();
        fs::write(vite.join("src/routes/home.tsx"), "export default function Home() {}").unwrap();
        fs::create_dir_all(vite.join("node_modules/react")).unwrap();
        fs::write(vite.join("node_modules/react/index.js"), "ORIGINAL").unwrap();
        dir
    }

    #[test]
    fn test_overlay_replaces_and_adds_files() {
        let templates = templates();
        let work = tempfile::tempdir().unwrap();
        let files = FileSet::new()
            .with("src/routes/home.tsx", "HOME")
            .with("src/routes/home.client.tsx", "CLIENT");

        let project = Scaffolder::new(templates.path())
            .work_dir(work.path())
            .scaffold(Template::RscVite, &files)
            .unwrap();

        assert!(project.path().starts_with(work.path()));
        assert_eq!(project.template(), Template::RscVite);
        let read = |p: &str| fs::read_to_string(project.path().join(p)).unwrap();
        assert_eq!(read("package.json"), r#"{"name":"rsc-vite"}"#);
        assert_eq!(read("src/routes/home.tsx"), "HOME");
        assert_eq!(read("src/routes/home.client.tsx"), "CLIENT");
    }

    #[cfg(unix)]
    #[test]
    fn test_node_modules_is_linked_not_copied() {
        let templates = templates();
        let project = Scaffolder::new(templates.path())
            .scaffold(Template::RscVite, &FileSet::new())
            .unwrap();

        let modules = project.path().join("node_modules");
        assert!(fs::symlink_metadata(&modules).unwrap().file_type().is_symlink());
        assert!(modules.join("react/index.js").exists());
    }

    #[test]
    fn test_each_scaffold_gets_its_own_dir() {
        let templates = templates();
        let scaffolder = Scaffolder::new(templates.path());
        let first = scaffolder
            .scaffold(Template::RscVite, &FileSet::new().with("a.txt", "first"))
            .unwrap();
        let second = scaffolder
            .scaffold(Template::RscVite, &FileSet::new().with("a.txt", "second"))
            .unwrap();

        assert_ne!(first.path(), second.path());
        assert_eq!(fs::read_to_string(first.path().join("a.txt")).unwrap(), "first");
    }

    #[test]
    fn test_drop_removes_project_unless_kept() {
        let templates = templates();
        let project = Scaffolder::new(templates.path())
            .scaffold(Template::RscVite, &FileSet::new())
            .unwrap();
        let path = project.path().to_path_buf();
        drop(project);
        assert!(!path.exists());

        let kept = Scaffolder::new(templates.path())
            .keep_projects(true)
            .scaffold(Template::RscVite, &FileSet::new())
            .unwrap();
        let path = kept.path().to_path_buf();
        drop(kept);
        assert!(path.exists());
        fs::remove_dir_all(path).unwrap();
    }

    #[test]
    fn test_missing_template_is_scaffold_error() {
        let templates = templates();
        let err = Scaffolder::new(templates.path())
            .scaffold(Template::RscParcel, &FileSet::new())
            .unwrap_err();
        assert!(matches!(err, E2eError::Scaffold(_)));
    }

    #[test_case("../../etc/passthrough.tsx" ; "parent traversal")]
    #[test_case("src/../../outside.tsx" ; "traversal after normal component")]
    #[test_case("/etc/passwd" ; "absolute path")]
    #[test_case("" ; "empty path")]
    #[test_case("./." ; "only current dir")]
    #[test_case("node_modules/react/index.js" ; "shared node_modules")]
    #[test_case("./node_modules/.pnpm/x.js" ; "shared node_modules after current dir")]
    fn test_unsafe_paths_are_rejected(path: &str) {
        let templates = templates();
        let work = tempfile::tempdir().unwrap();
        let files = FileSet::new().with("src/ok.tsx", "fine").with(path, "escaped");

        let err = Scaffolder::new(templates.path())
            .work_dir(work.path())
            .scaffold(Template::RscVite, &files)
            .unwrap_err();

        assert!(matches!(err, E2eError::UnsafePath { .. }));
        // Nothing was materialized, not even the safe files
        assert_eq!(fs::read_dir(work.path()).unwrap().count(), 0);
        assert!(!templates.path().join("../outside.tsx").exists());
        let react = templates.path().join("rsc-vite/node_modules/react/index.js");
        assert_eq!(fs::read_to_string(react).unwrap(), "ORIGINAL");
    }

    #[cfg(unix)]
    #[test]
    fn test_write_through_link_out_of_project_is_rejected() {
        let templates = templates();
        let outside = tempfile::tempdir().unwrap();
        let project = Scaffolder::new(templates.path())
            .scaffold(Template::RscVite, &FileSet::new())
            .unwrap();
        let linked = project.path().join("linked");
        std::os::unix::fs::symlink(outside.path(), &linked).unwrap();

        let root = project.path().canonicalize().unwrap();
        let err = ensure_inside(&root, &linked, "linked/escape.tsx").unwrap_err();
        assert!(matches!(err, E2eError::UnsafePath { .. }));
        ensure_inside(&root, &project.path().join("src/routes"), "src/routes/home.tsx").unwrap();
    }

    #[test]
    fn test_template_names_round_trip() {
        for template in Template::ALL {
            assert_eq!(template.as_str().parse::<Template>().unwrap(), template);
        }
        assert!("rsc-webpack".parse::<Template>().is_err());
    }
}
