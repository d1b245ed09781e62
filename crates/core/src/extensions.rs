//! Image extension inspection
//!
//! After the detect phase copies its artifacts into the run's scratch
//! directory, this module answers whether build- or run-side extensions
//! apply and yields the ordered Dockerfiles they generated. Ordering follows
//! `group.toml`; everything parses defensively because absence simply means
//! "no extensions".

use crate::errors::Result;
use crate::metadata::AnalyzedMetadata;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Which image an extension Dockerfile mutates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerfileKind {
    Build,
    Run,
}

impl DockerfileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DockerfileKind::Build => "build",
            DockerfileKind::Run => "run",
        }
    }
}

/// One generated extension Dockerfile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerfileSpec {
    pub path: PathBuf,
    pub kind: DockerfileKind,
    /// explicit base image; None means the Dockerfile expects the
    /// `base_image` build argument
    pub with_base: Option<String>,
    /// whether the Dockerfile mutates its base; a Dockerfile that only
    /// names a new base switches the image without extending it
    pub extend: bool,
}

#[derive(Debug, Deserialize)]
struct GroupFile {
    #[serde(default, rename = "group-extensions")]
    group_extensions: Vec<GroupElement>,
}

#[derive(Debug, Deserialize)]
struct GroupElement {
    id: String,
}

/// Ordered view over the extensions the detect phase selected.
#[derive(Debug, Default)]
pub struct Extensions {
    ids: Vec<String>,
}

impl Extensions {
    /// Read the extension order from `group.toml` in the scratch directory.
    /// A missing or malformed file leaves the order empty.
    pub fn set_extensions(&mut self, tmp_dir: &Path) {
        self.ids = std::fs::read_to_string(tmp_dir.join("group.toml"))
            .ok()
            .and_then(|s| toml::from_str::<GroupFile>(&s).ok())
            .map(|g| g.group_extensions.into_iter().map(|e| e.id).collect())
            .unwrap_or_default();
        debug!("extension order: {:?}", self.ids);
    }

    pub fn ids(&self) -> &[String] {
        &self.ids
    }

    /// Ordered Dockerfiles of the given kind. Extensions that generated no
    /// Dockerfile for this kind are skipped; a missing directory yields an
    /// empty list.
    pub fn dockerfiles(&self, kind: DockerfileKind, tmp_dir: &Path) -> Result<Vec<DockerfileSpec>> {
        let base = generated_dir(tmp_dir, kind);
        let mut out = Vec::new();
        for id in &self.ids {
            let path = base.join(escape_id(id)).join("Dockerfile");
            if !path.is_file() {
                continue;
            }
            let (with_base, extend) = parse_dockerfile(&path)?;
            out.push(DockerfileSpec {
                path,
                kind,
                with_base,
                extend,
            });
        }
        Ok(out)
    }
}

/// Directory holding the generated Dockerfiles of a kind.
///
/// The detect phase copies `<layers>/generated/<kind>` into the scratch
/// directory; depending on how the archive was unpacked the kind directory
/// sits under `generated/` or at the scratch root, so both are probed.
pub fn generated_dir(tmp_dir: &Path, kind: DockerfileKind) -> PathBuf {
    let nested = tmp_dir.join("generated").join(kind.as_str());
    if nested.is_dir() {
        return nested;
    }
    tmp_dir.join(kind.as_str())
}

/// Whether build-side extensions apply: the generated build directory
/// exists and is non-empty.
pub fn has_extensions_for_build(tmp_dir: &Path) -> bool {
    std::fs::read_dir(generated_dir(tmp_dir, DockerfileKind::Build))
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

/// Whether run-side extensions apply: `analyzed.toml` marks the run image
/// for extension.
pub fn has_extensions_for_run(tmp_dir: &Path) -> bool {
    AnalyzedMetadata::read_or_default(&tmp_dir.join("analyzed.toml"))
        .run_image
        .map(|r| r.extend)
        .unwrap_or(false)
}

/// The run image once extensions are taken into account: the image recorded
/// by analyze, falling back to the configured run image when the file or
/// field is absent.
pub fn run_image_after_extensions(tmp_dir: &Path, configured_run_image: &str) -> String {
    let analyzed = AnalyzedMetadata::read_or_default(&tmp_dir.join("analyzed.toml"));
    match analyzed.run_image {
        Some(run_image) if !run_image.image.is_empty() => run_image.image,
        _ => configured_run_image.to_string(),
    }
}

// extension ids use `/` namespacing; the generated directory flattens it
fn escape_id(id: &str) -> String {
    id.replace('/', "_")
}

/// Read the base and extension behavior of a generated Dockerfile.
///
/// The first FROM line decides the base: `FROM ${base_image}` means the base
/// is injected as a build argument (`with_base` is None), anything else
/// names an explicit base. Any instruction after the FROM (other than ARG)
/// mutates the base, making the Dockerfile an extension; a FROM-only
/// Dockerfile merely switches the image.
fn parse_dockerfile(path: &Path) -> Result<(Option<String>, bool)> {
    let contents = std::fs::read_to_string(path)?;
    let mut with_base = None;
    let mut seen_from = false;
    let mut extend = false;
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let keyword = line
            .split_whitespace()
            .next()
            .unwrap_or_default()
            .to_ascii_uppercase();
        if !seen_from {
            // only ARG may precede FROM in a generated Dockerfile
            if keyword == "FROM" {
                seen_from = true;
                let base = line.split_whitespace().nth(1).unwrap_or_default();
                if !base.contains("${base_image}") && !base.contains("$base_image") {
                    with_base = Some(base.to_string());
                }
            }
            continue;
        }
        if keyword == "ARG" {
            continue;
        }
        extend = true;
        break;
    }
    Ok((with_base, extend))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_group(tmp: &Path, ids: &[&str]) {
        let mut contents = String::new();
        for id in ids {
            contents.push_str(&format!(
                "[[group-extensions]]\nid = \"{}\"\nversion = \"1.0\"\n\n",
                id
            ));
        }
        std::fs::write(tmp.join("group.toml"), contents).unwrap();
    }

    fn write_dockerfile(tmp: &Path, kind: &str, id: &str, contents: &str) {
        let dir = tmp.join("generated").join(kind).join(id.replace('/', "_"));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("Dockerfile"), contents).unwrap();
    }

    #[test]
    fn test_set_extensions_reads_group_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_group(tmp.path(), &["second/ext", "first/ext"]);

        let mut extensions = Extensions::default();
        extensions.set_extensions(tmp.path());
        assert_eq!(extensions.ids(), &["second/ext", "first/ext"]);
    }

    #[test]
    fn test_set_extensions_missing_group_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let mut extensions = Extensions::default();
        extensions.set_extensions(tmp.path());
        assert!(extensions.ids().is_empty());
    }

    #[test]
    fn test_dockerfiles_follow_group_order() {
        let tmp = tempfile::tempdir().unwrap();
        write_group(tmp.path(), &["b/ext", "a/ext"]);
        write_dockerfile(
            tmp.path(),
            "build",
            "a/ext",
            "ARG base_image\nFROM ${base_image}\nRUN apk add git\n",
        );
        write_dockerfile(tmp.path(), "build", "b/ext", "FROM alpine:3.19\nRUN apk add curl\n");

        let mut extensions = Extensions::default();
        extensions.set_extensions(tmp.path());
        let specs = extensions
            .dockerfiles(DockerfileKind::Build, tmp.path())
            .unwrap();

        assert_eq!(specs.len(), 2);
        assert!(specs[0].path.ends_with("b_ext/Dockerfile"));
        assert_eq!(specs[0].with_base.as_deref(), Some("alpine:3.19"));
        assert!(specs[1].path.ends_with("a_ext/Dockerfile"));
        assert_eq!(specs[1].with_base, None);
    }

    #[test]
    fn test_dockerfile_with_instructions_extends_its_base() {
        let tmp = tempfile::tempdir().unwrap();
        write_group(tmp.path(), &["a/ext"]);
        write_dockerfile(
            tmp.path(),
            "run",
            "a/ext",
            "ARG base_image\nFROM ${base_image}\nARG build_id=0\nRUN apk add tzdata\n",
        );

        let mut extensions = Extensions::default();
        extensions.set_extensions(tmp.path());
        let specs = extensions
            .dockerfiles(DockerfileKind::Run, tmp.path())
            .unwrap();
        assert!(specs[0].extend);
    }

    #[test]
    fn test_from_only_dockerfile_switches_without_extending() {
        let tmp = tempfile::tempdir().unwrap();
        write_group(tmp.path(), &["a/ext"]);
        write_dockerfile(
            tmp.path(),
            "run",
            "a/ext",
            "# switch the runtime base\nFROM registry.example/alt-run:latest\n",
        );

        let mut extensions = Extensions::default();
        extensions.set_extensions(tmp.path());
        let specs = extensions
            .dockerfiles(DockerfileKind::Run, tmp.path())
            .unwrap();
        assert_eq!(
            specs[0].with_base.as_deref(),
            Some("registry.example/alt-run:latest")
        );
        assert!(!specs[0].extend);
    }

    #[test]
    fn test_dockerfiles_missing_dir_is_empty_not_error() {
        let tmp = tempfile::tempdir().unwrap();
        write_group(tmp.path(), &["a/ext"]);
        let mut extensions = Extensions::default();
        extensions.set_extensions(tmp.path());
        assert!(extensions
            .dockerfiles(DockerfileKind::Run, tmp.path())
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_has_extensions_for_build() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!has_extensions_for_build(tmp.path()));
        write_dockerfile(tmp.path(), "build", "a_ext", "FROM x\n");
        assert!(has_extensions_for_build(tmp.path()));
    }

    #[test]
    fn test_has_extensions_for_build_probes_scratch_root_layout() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("build/a_ext")).unwrap();
        std::fs::write(tmp.path().join("build/a_ext/Dockerfile"), "FROM x\n").unwrap();
        assert!(has_extensions_for_build(tmp.path()));
    }

    #[test]
    fn test_has_extensions_for_run_requires_extend_flag() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(!has_extensions_for_run(tmp.path()));

        std::fs::write(
            tmp.path().join("analyzed.toml"),
            "[run-image]\nextend = false\nimage = \"run\"\n",
        )
        .unwrap();
        assert!(!has_extensions_for_run(tmp.path()));

        std::fs::write(
            tmp.path().join("analyzed.toml"),
            "[run-image]\nextend = true\nimage = \"run\"\n",
        )
        .unwrap();
        assert!(has_extensions_for_run(tmp.path()));
    }

    #[test]
    fn test_run_image_after_extensions_fallback() {
        let tmp = tempfile::tempdir().unwrap();
        assert_eq!(
            run_image_after_extensions(tmp.path(), "configured/run"),
            "configured/run"
        );

        std::fs::write(
            tmp.path().join("analyzed.toml"),
            "[run-image]\nimage = \"analyzed/run\"\n",
        )
        .unwrap();
        assert_eq!(
            run_image_after_extensions(tmp.path(), "configured/run"),
            "analyzed/run"
        );
    }
}
