//! In-container mount path resolution
//!
//! Every phase container in a run sees the same set of absolute paths for
//! the app dir, layers dir, caches, and metadata files. The set is a pure
//! function of the container OS (path separator, drive prefix) and the
//! optional user-chosen workspace directory name.

/// Container-OS-specific mount path set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPaths {
    volume: String,
    separator: char,
    workspace: String,
}

/// Resolve the mount path set for a container OS.
///
/// `workspace` overrides the app directory name (default "workspace").
pub fn mount_paths_for_os(os: &str, workspace: Option<&str>) -> MountPaths {
    let workspace = match workspace {
        Some(w) if !w.is_empty() => w.to_string(),
        _ => "workspace".to_string(),
    };
    if os == "windows" {
        MountPaths {
            volume: "c:".to_string(),
            separator: '\\',
            workspace,
        }
    } else {
        MountPaths {
            volume: String::new(),
            separator: '/',
            workspace,
        }
    }
}

impl MountPaths {
    fn join(&self, parts: &[&str]) -> String {
        parts.join(&self.separator.to_string())
    }

    pub fn app_dir(&self) -> String {
        self.join(&[&self.volume, &self.workspace])
    }

    pub fn layers_dir(&self) -> String {
        self.join(&[&self.volume, "layers"])
    }

    pub fn cache_dir(&self) -> String {
        self.join(&[&self.volume, "cache"])
    }

    pub fn launch_cache_dir(&self) -> String {
        self.join(&[&self.volume, "launch-cache"])
    }

    pub fn kaniko_cache_dir(&self) -> String {
        self.join(&[&self.volume, "kaniko", "cache"])
    }

    pub fn cnb_dir(&self) -> String {
        self.join(&[&self.volume, "cnb"])
    }

    pub fn extended_dir(&self) -> String {
        self.join(&[&self.volume, "extended-new"])
    }

    pub fn layout_dir(&self) -> String {
        self.join(&[&self.volume, "layout-repo"])
    }

    pub fn stack_path(&self) -> String {
        self.join(&[&self.layers_dir(), "stack.toml"])
    }

    pub fn run_path(&self) -> String {
        self.join(&[&self.layers_dir(), "run.toml"])
    }

    pub fn project_path(&self) -> String {
        self.join(&[&self.layers_dir(), "project-metadata.toml"])
    }

    pub fn analyzed_path(&self) -> String {
        self.join(&[&self.layers_dir(), "analyzed.toml"])
    }

    pub fn group_path(&self) -> String {
        self.join(&[&self.layers_dir(), "group.toml"])
    }

    pub fn generated_dir(&self) -> String {
        self.join(&[&self.layers_dir(), "generated"])
    }

    pub fn generated_kind_dir(&self, kind: &str) -> String {
        self.join(&[&self.generated_dir(), kind])
    }

    pub fn sbom_dir(&self) -> String {
        self.join(&[&self.layers_dir(), "sbom"])
    }

    pub fn report_path(&self) -> String {
        self.join(&[&self.layers_dir(), "report.toml"])
    }
}

// Device names Windows reserves; a volume named after one is rejected by the
// daemon, so reserved tokens get a digit appended.
const RESERVED_NAMES: &[&str] = &[
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

/// Rewrite dash-separated tokens that collide with reserved Windows device
/// names. Idempotent: rewritten tokens are no longer reserved.
pub fn filter_reserved_names(name: &str) -> String {
    name.split('-')
        .map(|token| {
            if RESERVED_NAMES.contains(&token.to_ascii_lowercase().as_str()) {
                format!("{}1", token)
            } else {
                token.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("-")
}
