//! Checkpointed, budget-bounded multi-domain review.
//!
//! ## Components
//!
//! - [`fingerprint`]: config hash and per-file content hashes of the scope
//! - [`cache`]: TTL-bound per-domain result cache
//! - [`checkpoint`]: versioned progress records for crash recovery
//! - [`findings`]: improvement and per-domain result types
//! - [`orchestrator`]: drives one review across the enabled domains
//!
//! ## Example
//!
//! ```
//! use mason::review::{Improvement, ReviewDomainResult};
//!
//! let result = ReviewDomainResult::new("security")
//!     .add_improvement(Improvement::new("Validate input", "security", 9, 2))
//!     .with_usage(1200, 0.04);
//! assert_eq!(result.improvements.len(), 1);
//! ```

pub mod cache;
pub mod checkpoint;
pub mod findings;
pub mod fingerprint;
pub mod orchestrator;

pub use cache::{CacheEntry, ReviewCache};
pub use checkpoint::{CheckpointStatus, CheckpointStore, ReviewCheckpoint};
pub use findings::{DomainFailure, FileSkip, Improvement, ReviewDomainResult};
pub use fingerprint::{FileHashes, Scope, ScopeFile, ScopeFilter, config_hash, scan_scope};
pub use orchestrator::{
    AnalysisProvider, DomainAnalysisOrchestrator, DomainAnalysisRequest, ReviewEvent,
    ReviewOutcome, ReviewStatus,
};
