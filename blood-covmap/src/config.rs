//! Pipeline configuration.
//!
//! # Example
//!
//! ```toml
//! passes = "default<O2>"
//!
//! [coverage]
//! source_file = "src/main.blood"
//! atomic_counters = true
//! compress_filenames = true
//! object_format = "elf"
//! ```
//!
//! Coverage is requested exactly when the `[coverage]` table is present.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Object file format of the target, which decides the coverage section
/// names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectFormat {
    #[default]
    Elf,
    Macho,
    Coff,
}

/// Section names `llvm-cov` looks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionNames {
    pub covmap: &'static str,
    pub covfun: &'static str,
}

impl ObjectFormat {
    pub fn sections(self) -> SectionNames {
        match self {
            ObjectFormat::Elf => SectionNames {
                covmap: "__llvm_covmap",
                covfun: "__llvm_covfun",
            },
            ObjectFormat::Macho => SectionNames {
                covmap: "__LLVM_COV,__llvm_covmap",
                covfun: "__LLVM_COV,__llvm_covfun",
            },
            ObjectFormat::Coff => SectionNames {
                covmap: ".lcovmap$M",
                covfun: ".lcovfun$M",
            },
        }
    }
}

impl std::fmt::Display for ObjectFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectFormat::Elf => write!(f, "elf"),
            ObjectFormat::Macho => write!(f, "macho"),
            ObjectFormat::Coff => write!(f, "coff"),
        }
    }
}

/// Coverage instrumentation settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoverageOptions {
    /// The single source file every region is attributed to.
    pub source_file: String,

    /// Lower increments to atomic read-modify-write operations
    #[serde(default = "default_true")]
    pub atomic_counters: bool,

    /// Zlib-compress the filenames table
    #[serde(default = "default_true")]
    pub compress_filenames: bool,

    #[serde(default)]
    pub object_format: ObjectFormat,
}

fn default_true() -> bool {
    true
}

impl CoverageOptions {
    /// Defaults for `source_file`: atomic counters, compressed filenames, ELF.
    pub fn new(source_file: impl Into<String>) -> Self {
        Self {
            source_file: source_file.into(),
            atomic_counters: true,
            compress_filenames: true,
            object_format: ObjectFormat::default(),
        }
    }
}

/// Everything a pipeline run needs besides the module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Textual pass pipeline, e.g. `default<O2>`
    pub passes: String,

    pub coverage: Option<CoverageOptions>,
}

impl PipelineConfig {
    /// A pipeline without coverage.
    pub fn new(passes: impl Into<String>) -> Self {
        Self {
            passes: passes.into(),
            coverage: None,
        }
    }

    pub fn with_coverage(mut self, coverage: CoverageOptions) -> Self {
        self.coverage = Some(coverage);
        self
    }

    pub fn coverage_enabled(&self) -> bool {
        self.coverage.is_some()
    }

    /// Parse a config from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config from a file path.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(coverage) = &self.coverage {
            if coverage.source_file.is_empty() {
                return Err(ConfigError::Invalid("coverage.source_file is empty".to_string()));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_without_coverage() {
        let config = PipelineConfig::from_toml_str(r#"passes = "default<O0>""#).unwrap();
        assert_eq!(config.passes, "default<O0>");
        assert!(!config.coverage_enabled());
    }

    #[test]
    fn test_parse_coverage_defaults() {
        let content = r#"
            passes = "default<O2>"

            [coverage]
            source_file = "src/main.blood"
        "#;

        let config = PipelineConfig::from_toml_str(content).unwrap();
        let coverage = config.coverage.unwrap();
        assert_eq!(coverage, CoverageOptions::new("src/main.blood"));
        assert!(coverage.atomic_counters);
        assert!(coverage.compress_filenames);
        assert_eq!(coverage.object_format, ObjectFormat::Elf);
    }

    #[test]
    fn test_parse_full_coverage() {
        let content = r#"
            passes = "globaldce"

            [coverage]
            source_file = "main.c"
            atomic_counters = false
            compress_filenames = false
            object_format = "macho"
        "#;

        let coverage = PipelineConfig::from_toml_str(content).unwrap().coverage.unwrap();
        assert!(!coverage.atomic_counters);
        assert!(!coverage.compress_filenames);
        assert_eq!(coverage.object_format.sections().covmap, "__LLVM_COV,__llvm_covmap");
    }

    #[test]
    fn test_empty_source_file_rejected() {
        let content = r#"
            passes = "default<O0>"
            [coverage]
            source_file = ""
        "#;
        assert!(matches!(
            PipelineConfig::from_toml_str(content),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_object_format_rejected() {
        let content = r#"
            passes = "default<O0>"
            [coverage]
            source_file = "a.c"
            object_format = "wasm"
        "#;
        assert!(matches!(
            PipelineConfig::from_toml_str(content),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let err = PipelineConfig::load(Path::new("/nonexistent/covmap.toml")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/covmap.toml"));
    }

    #[test]
    fn test_section_names() {
        assert_eq!(ObjectFormat::Elf.sections().covfun, "__llvm_covfun");
        assert_eq!(ObjectFormat::Coff.sections().covmap, ".lcovmap$M");
        assert_eq!(ObjectFormat::Coff.to_string(), "coff");
    }
}
