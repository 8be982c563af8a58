//! Per-project knowledge index with sacred architecture plans and drift detection.
//!
//! Canon ingests a project's files into an isolated vector collection and
//! answers questions from that collection only. Alongside it, each project
//! keeps a separate collection of *sacred plans*: formally approved, immutable
//! architecture documents. Recent version-control activity is compared with
//! the plans in force to report how far development has drifted from them.
//!
//! | Status | Alignment score |
//! |--------|-----------------|
//! | **aligned** | ≥ 0.90 |
//! | **minor_drift** | 0.70 – 0.89 |
//! | **moderate_drift** | 0.50 – 0.69 |
//! | **critical_violation** | < 0.50 |
//!
//! # Architecture
//!
//! - **Storage**: SQLite with [sqlite-vec](https://github.com/asg017/sqlite-vec);
//!   `registry.db` plus `projects/<id>/knowledge.db` and `projects/<id>/sacred.db`
//! - **Embeddings**: any [`embedding::EmbeddingProvider`]; a deterministic
//!   feature-hashing provider ships built in
//! - **Isolation**: queries require a project id and never fall back to a wider search
//!
//! # Modules
//!
//! - [`config`] — TOML configuration with environment overrides
//! - [`db`] — Database initialization, schema, migrations, and health checks
//! - [`filter`] / [`segment`] — File eligibility, redaction and segmentation
//! - [`knowledge`] — Ingestion, background jobs and project-scoped retrieval
//! - [`registry`] — Project lifecycle, decisions and objectives
//! - [`sacred`] — Sacred plan store and approval workflow
//! - [`drift`] — Alignment scoring against recent [`activity`]
//! - [`service`] — Async facade over all of the above

pub mod activity;
pub mod config;
pub mod db;
pub mod drift;
pub mod embedding;
pub mod error;
pub mod filter;
pub mod knowledge;
pub mod llm;
pub mod registry;
pub mod retry;
pub mod sacred;
pub mod segment;
pub mod service;

pub use error::{CanonError, Result};
pub use service::Canon;
