//! Error types and handling
//!
//! Domain-specific error types for the orchestrator. The taxonomy keeps one
//! enum per domain (configuration, container daemon, phase execution) and
//! wraps them in the main `KilnError` enum for unified handling. Errors that
//! abort a build before any container starts live in `ConfigError`; runtime
//! failures of a phase container live in `PhaseError`.

use thiserror::Error;

/// Configuration and pre-flight validation errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Image reference failed even weak validation
    #[error("invalid image name {reference}: {message}")]
    InvalidImageRef { reference: String, message: String },

    /// A lifecycle platform API version string could not be parsed
    #[error("unable to parse lifecycle api version {value}")]
    InvalidApiVersion { value: String },

    /// No platform API version is supported by all parties
    #[error("unable to find a supported Platform API version")]
    UnsupportedPlatformApi,

    /// Extensions require a volume build cache
    #[error("build cache must be volume cache when building with extensions")]
    CacheNotVolume,

    /// The consolidated creator binary cannot apply extensions
    #[error("builder has an order for extensions which is not supported when using the creator")]
    CreatorWithExtensions,

    /// Publishing requires image and previous image to share a registry
    #[error(
        "when --publish is used, <previous-image> must be in the same image registry as <image>\n\
         image registry = {image_registry}\n\
         previous-image registry = {previous_registry}"
    )]
    RegistryMismatch {
        image_registry: String,
        previous_registry: String,
    },

    /// Generic validation failure
    #[error("configuration validation error: {message}")]
    Validation { message: String },
}

/// Container daemon errors
#[derive(Error, Debug)]
pub enum DockerError {
    /// The container runtime binary is missing or not executable
    #[error("docker is not installed or not accessible")]
    NotInstalled,

    /// A daemon CLI invocation failed
    #[error("docker CLI error: {0}")]
    CliError(String),

    /// The daemon reported a missing object where one was required
    #[error("no such {kind}: {name}")]
    NotFound { kind: String, name: String },

    /// I/O failure while talking to the daemon
    #[error("docker I/O error")]
    Io(#[from] std::io::Error),
}

/// Phase container execution errors
#[derive(Error, Debug)]
pub enum PhaseError {
    /// The phase container exited non-zero
    #[error("failed with status code: {code}")]
    ExitCode { phase: String, code: i64 },

    /// A configured post-run artifact could not be copied out
    #[error("copying {path} from {phase} container: {message}")]
    CopyOut {
        phase: String,
        path: String,
        message: String,
    },
}

/// Main error enum wrapping all domain-specific errors
#[derive(Error, Debug)]
pub enum KilnError {
    /// Configuration and pre-flight errors
    #[error("{0}")]
    Config(#[from] ConfigError),

    /// Container daemon errors
    #[error("{0}")]
    Docker(#[from] DockerError),

    /// Phase execution errors
    #[error("{0}")]
    Phase(#[from] PhaseError),

    /// Filesystem errors (scratch dir, cache dirs)
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    /// TOML metadata serialization errors
    #[error("serializing metadata")]
    TomlSer(#[from] toml::ser::Error),

    /// Contextual wrapper identifying the failing operation
    #[error("{context}: {source}")]
    Wrapped {
        context: String,
        #[source]
        source: Box<KilnError>,
    },
}

impl KilnError {
    /// Wrap an error with context naming the operation that failed.
    pub fn context(self, context: impl Into<String>) -> Self {
        KilnError::Wrapped {
            context: context.into(),
            source: Box::new(self),
        }
    }
}

/// Extension adding operation context to Results carrying a `KilnError`.
pub trait ResultExt<T> {
    fn err_context(self, context: impl Into<String>) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn err_context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }
}

/// Convenience type alias for Results with KilnError
pub type Result<T> = std::result::Result<T, KilnError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;

    #[test]
    fn test_config_error_display() {
        let error = ConfigError::UnsupportedPlatformApi;
        assert_eq!(
            format!("{}", error),
            "unable to find a supported Platform API version"
        );

        let error = ConfigError::CacheNotVolume;
        assert_eq!(
            format!("{}", error),
            "build cache must be volume cache when building with extensions"
        );
    }

    #[test]
    fn test_registry_mismatch_names_both_registries() {
        let error = ConfigError::RegistryMismatch {
            image_registry: "index.docker.io".to_string(),
            previous_registry: "registry.example.com".to_string(),
        };
        let msg = format!("{}", error);
        assert!(msg.contains("index.docker.io"));
        assert!(msg.contains("registry.example.com"));
    }

    #[test]
    fn test_phase_error_display() {
        let error = PhaseError::ExitCode {
            phase: "builder".to_string(),
            code: 51,
        };
        assert_eq!(format!("{}", error), "failed with status code: 51");
    }

    #[test]
    fn test_kiln_error_from_domain_errors() {
        let config_error = ConfigError::UnsupportedPlatformApi;
        let kiln_error: KilnError = config_error.into();
        assert!(matches!(kiln_error, KilnError::Config(_)));

        let docker_error = DockerError::NotInstalled;
        let kiln_error: KilnError = docker_error.into();
        assert!(matches!(kiln_error, KilnError::Docker(_)));
    }

    #[test]
    fn test_wrapped_error_preserves_source() {
        let inner: KilnError = DockerError::CliError("volume rm failed".to_string()).into();
        let wrapped = inner.context("clearing build cache");
        assert_eq!(
            format!("{}", wrapped),
            "clearing build cache: docker CLI error: volume rm failed"
        );
        assert!(wrapped.source().is_some());
    }
}
