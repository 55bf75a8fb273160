//! Size-tier classification used to pick a hashing strategy.
//!
//! Small files benefit from parallel fan-out; large files are hashed
//! strictly serially to bound peak memory and IO and to keep per-file
//! progress visible in the log. The classifier stats each path once and
//! partitions the set into the three tiers.

use std::{fs, path::PathBuf};

/// Total, disjoint partition of a file set into size tiers.
#[derive(Debug, Default)]
pub struct SizeClasses {
    pub small: Vec<PathBuf>,
    pub medium: Vec<PathBuf>,
    pub large: Vec<PathBuf>,
}

impl SizeClasses {
    pub fn total(&self) -> usize {
        self.small.len() + self.medium.len() + self.large.len()
    }
}

/// Partitions `paths` by on-disk size.
///
/// `size < small_limit` is small, `size < medium_limit` is medium, the rest
/// is large; a file exactly at a limit therefore falls out of the lower tier
/// (the lower tier's bound is exclusive). Paths that cannot be stat'ed are
/// silently excluded from the partition rather than treated as errors.
pub fn classify_by_size(
    paths: impl IntoIterator<Item = PathBuf>,
    small_limit: u64,
    medium_limit: u64,
) -> SizeClasses {
    let mut classes = SizeClasses::default();

    for path in paths {
        let Ok(meta) = fs::metadata(&path) else {
            continue;
        };
        let size = meta.len();

        if size < small_limit {
            classes.small.push(path);
        } else if size < medium_limit {
            classes.medium.push(path);
        } else {
            classes.large.push(path);
        }
    }

    classes
}
