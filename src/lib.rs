//! **resync** - Continuous git reconciliation agent
//!
//! Keeps a large working tree synchronized with a remote, including embedded
//! repositories that carry their own git metadata and are tracked through
//! path virtualization. Divergence against the remote is classified each
//! cycle and resolved by fast-forward, push, or a three-way merge with
//! backup and rollback.

/// Command-line interface with clap integration
pub mod cli;

/// Core engine - reconciliation, index mutation, and merge logic
pub mod core {
    /// Content identity cache keyed by (path, mtime, size)
    pub mod cache;
    pub use self::cache::HashCache;

    /// Size-tier partitioning that selects the hashing strategy
    pub mod classify;
    pub use self::classify::{SizeClasses, classify_by_size};

    /// Synchronous git command surface with typed errors
    pub mod git;
    pub use self::git::{GitError, GitOps};

    /// Bulk index mutation with stale-lock recovery
    pub mod index;
    pub use self::index::{FileMode, FileOperation, IndexMutator};

    /// Chunked stage/untrack executor with backoff retry
    pub mod batch;
    pub use self::batch::{BatchExecutor, BatchOp, BatchReport};

    /// Embedded-repository virtualization and reconciliation
    pub mod reconcile;
    pub use self::reconcile::{ReconcileReport, Reconciler};

    /// Divergence classification and the three-way merge engine
    pub mod merge;
    pub use self::merge::{BranchState, MergeEngine, MergeError, classify};

    /// Cycle orchestration across all components
    pub mod cycle;
    pub use self::cycle::SyncAgent;
}

/// Infrastructure - configuration, retry policy, and directory walking
pub mod infra {
    /// Configuration management with TOML support and env overrides
    pub mod config;
    pub use self::config::{FailureStrategy, SyncConfig, init as config_init, load_config};

    /// Reusable retry policy shared by index and batch paths
    pub mod retry;
    pub use self::retry::{RetryExhausted, RetryPolicy};

    /// Directory walking with noise-directory pruning
    pub mod walk;
    pub use self::walk::PrunedWalker;
}

// Strategic re-exports for the binary and integration tests
pub use cli::{Cli, Commands};
pub use self::core::{
    BatchExecutor, BatchOp, GitOps, HashCache, IndexMutator, MergeEngine, Reconciler,
    SyncAgent,
};
pub use infra::{RetryPolicy, SyncConfig, load_config};
