use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CanonConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub embedding: EmbeddingConfig,
    pub chunking: ChunkingConfig,
    pub filter: FilterConfig,
    pub retrieval: RetrievalConfig,
    pub sacred: SacredConfig,
    pub drift: DriftConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    /// Root for `registry.db` and the per-project `projects/<id>/` directories.
    pub data_dir: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: String,
    pub model: String,
    pub dimensions: usize,
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub max_chars: usize,
    pub overlap_lines: usize,
    pub max_overlap_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FilterConfig {
    /// Directory names that are never descended into, at any depth.
    pub ignore_dirs: Vec<String>,
    pub include_hidden: bool,
    /// Lower-case extensions without the dot.
    pub allowed_extensions: Vec<String>,
    pub max_file_bytes: u64,
    /// Extra regexes, applied after the built-in credential patterns.
    pub redaction_patterns: Vec<String>,
    pub redaction_marker: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_k: usize,
    pub max_k: usize,
    pub synthesis_context_chars: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SacredConfig {
    /// Name of the environment variable holding the secondary approval secret.
    pub approval_secret_env: String,
    pub verification_code_length: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DriftConfig {
    pub recency_half_life_hours: f64,
    pub max_events: usize,
    /// Events whose best plan similarity falls below this are reported as unrelated.
    pub unrelated_threshold: f64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_canon_dir().to_string_lossy().into_owned(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".into(),
            model: "canon-hashing-v1".into(),
            dimensions: 384,
            batch_size: 32,
            max_retries: 2,
            retry_backoff_ms: 250,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: 1500,
            overlap_lines: 3,
            max_overlap_chars: 400,
        }
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        let ignore_dirs = [
            ".git",
            ".hg",
            ".svn",
            "node_modules",
            "target",
            "dist",
            "build",
            "out",
            "vendor",
            "__pycache__",
            ".venv",
            "venv",
            ".tox",
            ".mypy_cache",
            ".pytest_cache",
            ".next",
            "coverage",
            ".idea",
            ".vscode",
        ];
        let allowed_extensions = [
            "rs", "py", "js", "jsx", "ts", "tsx", "go", "java", "kt", "rb", "php", "c", "h",
            "cc", "cpp", "hpp", "cs", "swift", "scala", "sh", "sql", "toml", "yaml", "yml",
            "json", "md", "markdown", "txt", "rst", "adoc",
        ];
        Self {
            ignore_dirs: ignore_dirs.iter().map(|s| s.to_string()).collect(),
            include_hidden: false,
            allowed_extensions: allowed_extensions.iter().map(|s| s.to_string()).collect(),
            max_file_bytes: 1024 * 1024,
            redaction_patterns: Vec::new(),
            redaction_marker: "[REDACTED]".into(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_k: 5,
            max_k: 50,
            synthesis_context_chars: 6000,
        }
    }
}

impl Default for SacredConfig {
    fn default() -> Self {
        Self {
            approval_secret_env: "CANON_APPROVAL_SECRET".into(),
            verification_code_length: 10,
        }
    }
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            recency_half_life_hours: 24.0,
            max_events: 500,
            unrelated_threshold: 0.5,
        }
    }
}

/// Returns `~/.canon/`
pub fn default_canon_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".canon")
}

/// Returns the default config file path: `~/.canon/config.toml`
pub fn default_config_path() -> PathBuf {
    default_canon_dir().join("config.toml")
}

impl CanonConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides and validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            CanonConfig::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// A config rooted at `data_dir`, everything else default. Handy for tests and embedding.
    pub fn with_data_dir(data_dir: impl AsRef<Path>) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir.as_ref().to_string_lossy().into_owned();
        config
    }

    /// Apply environment variable overrides (CANON_DATA_DIR, CANON_LOG_LEVEL, CANON_EMBEDDING_PROVIDER).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("CANON_DATA_DIR") {
            self.storage.data_dir = val;
        }
        if let Ok(val) = std::env::var("CANON_LOG_LEVEL") {
            self.server.log_level = val;
        }
        if let Ok(val) = std::env::var("CANON_EMBEDDING_PROVIDER") {
            self.embedding.provider = val;
        }
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.embedding.dimensions > 0, "embedding.dimensions must be > 0");
        anyhow::ensure!(self.embedding.batch_size > 0, "embedding.batch_size must be > 0");
        anyhow::ensure!(self.chunking.max_chars > 0, "chunking.max_chars must be > 0");
        anyhow::ensure!(
            self.chunking.max_overlap_chars < self.chunking.max_chars,
            "chunking.max_overlap_chars must be smaller than chunking.max_chars"
        );
        anyhow::ensure!(self.retrieval.max_k > 0, "retrieval.max_k must be > 0");
        anyhow::ensure!(
            (1..=self.retrieval.max_k).contains(&self.retrieval.default_k),
            "retrieval.default_k must be between 1 and retrieval.max_k"
        );
        anyhow::ensure!(
            self.sacred.verification_code_length >= 6,
            "sacred.verification_code_length must be at least 6"
        );
        anyhow::ensure!(
            self.drift.recency_half_life_hours > 0.0,
            "drift.recency_half_life_hours must be > 0"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.drift.unrelated_threshold),
            "drift.unrelated_threshold must be in [0.0, 1.0]"
        );
        Ok(())
    }

    /// Resolve the data directory, expanding `~` if needed.
    pub fn resolved_data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    pub fn registry_db_path(&self) -> PathBuf {
        self.resolved_data_dir().join("registry.db")
    }

    /// Directory owning every collection of one project.
    pub fn project_dir(&self, project_id: &str) -> PathBuf {
        self.resolved_data_dir().join("projects").join(project_id)
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}
