//! Path containment checking and repository URL canonicalization.
//!
//! Every workspace file operation funnels through [`resolve_contained`]
//! before touching disk; every repo URL a session spec carries funnels
//! through [`canonicalize_repo_url`] before a clone is attempted.

use std::path::{Component, Path, PathBuf};

use crate::errors::ValidationError;

/// Resolve `candidate` against `base` and verify containment.
///
/// `candidate` is interpreted as relative to `base` if it is not already
/// absolute. The check canonicalizes the deepest existing ancestor of the
/// resulting path (collapsing `.`/`..` and resolving symlinks) and then
/// lexically re-applies any non-existent suffix, rejecting the suffix if it
/// contains `.` or `..` components. This lets new files be addressed (the
/// common case for a `PUT`) without the check failing just because the file
/// does not exist yet, while still refusing to be fooled by a symlink
/// planted somewhere in the existing part of the path.
///
/// # Errors
///
/// Returns [`ValidationError::PathEscape`] if the resolved path is not
/// `base` or a descendant of it.
pub fn resolve_contained(base: &Path, candidate: &str) -> Result<PathBuf, ValidationError> {
    let escape_err = || ValidationError::PathEscape {
        path: candidate.to_owned(),
    };

    let candidate_path = Path::new(candidate);
    if candidate_path
        .components()
        .any(|c| matches!(c, Component::ParentDir))
    {
        return Err(escape_err());
    }

    let joined = if candidate_path.is_absolute() {
        candidate_path.to_path_buf()
    } else {
        base.join(candidate_path)
    };

    let (existing_ancestor, suffix) = deepest_existing_ancestor(&joined);

    let canonical_base = base.canonicalize().map_err(|_| escape_err())?;
    let canonical_ancestor = existing_ancestor.canonicalize().map_err(|_| escape_err())?;

    if !is_contained(&canonical_ancestor, &canonical_base) {
        return Err(escape_err());
    }

    let mut resolved = canonical_ancestor;
    for part in &suffix {
        resolved.push(part);
    }

    Ok(resolved)
}

/// Split `path` into its deepest existing ancestor and the remaining,
/// not-yet-existing path components.
fn deepest_existing_ancestor(path: &Path) -> (PathBuf, Vec<PathBuf>) {
    let mut suffix = Vec::new();
    let mut current = path.to_path_buf();

    while !current.exists() {
        match current.file_name() {
            Some(name) => {
                suffix.push(PathBuf::from(name));
                if !current.pop() {
                    break;
                }
            }
            None => break,
        }
    }

    suffix.reverse();
    (current, suffix)
}

/// Returns true iff `path` equals `root` or descends from it.
///
/// Both arguments must already be canonicalized; this function never
/// inspects string prefixes, only component sequences, so `/tenant-a` is
/// never considered contained within `/tenant` despite the shared prefix.
#[must_use]
pub fn is_contained(path: &Path, root: &Path) -> bool {
    path.strip_prefix(root).is_ok()
}

/// A repository reference reduced to its owner and repo name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    /// The owning org or user.
    pub owner: String,
    /// The repository name, with any trailing `.git` stripped.
    pub name: String,
}

impl RepoRef {
    /// The workspace subdirectory a clone of this repo lands in: its name.
    #[must_use]
    pub fn workspace_folder(&self) -> &str {
        &self.name
    }
}

/// Canonicalize a repository URL into `(owner, name)`.
///
/// Accepts four forms: bare `owner/name`, `https://host/owner/name(.git)?`,
/// `ssh://[user@]host[:port]/owner/name(.git)?`, and the scp-like
/// `git@host:owner/name(.git)?`.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidRepoUrl`] if none of the accepted forms
/// match.
pub fn canonicalize_repo_url(url: &str) -> Result<RepoRef, ValidationError> {
    let invalid = |reason: &str| ValidationError::InvalidRepoUrl {
        url: url.to_owned(),
        reason: reason.to_owned(),
    };

    let trimmed = url.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty URL"));
    }

    // git@host:owner/name(.git)?
    if let Some(rest) = trimmed.strip_prefix("git@") {
        let (_host, path) = rest.split_once(':').ok_or_else(|| invalid("missing ':' after host in scp-like URL"))?;
        return parse_owner_name(path).ok_or_else(|| invalid("path after ':' is not 'owner/name'"));
    }

    // ssh://[user@]host[:port]/owner/name(.git)?
    if let Some(rest) = trimmed.strip_prefix("ssh://") {
        let path = rest.splitn(2, '/').nth(1).ok_or_else(|| invalid("missing path component"))?;
        return parse_owner_name(path).ok_or_else(|| invalid("path is not 'owner/name'"));
    }

    // https://host/owner/name(.git)?  (also accepts http://)
    if let Some(rest) = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
    {
        let path = rest.splitn(2, '/').nth(1).ok_or_else(|| invalid("missing path component"))?;
        return parse_owner_name(path).ok_or_else(|| invalid("path is not 'owner/name'"));
    }

    // bare owner/name
    parse_owner_name(trimmed).ok_or_else(|| invalid("expected 'owner/name'"))
}

/// Parse a trailing `owner/name(.git)?` path segment, stripping any query
/// string or further path segments after `name`.
fn parse_owner_name(path: &str) -> Option<RepoRef> {
    let path = path.trim_start_matches('/');
    let path = path.split(['?', '#']).next().unwrap_or(path);
    let mut parts = path.splitn(3, '/');
    let owner = parts.next()?;
    let name = parts.next()?;
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    let name = name.strip_suffix(".git").unwrap_or(name);
    Some(RepoRef {
        owner: owner.to_owned(),
        name: name.to_owned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contained_child_path_is_allowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sub = dir.path().join("workspace");
        std::fs::create_dir(&sub).expect("mkdir");

        let resolved = resolve_contained(&sub, "notes.txt").expect("should resolve");
        assert_eq!(resolved, sub.canonicalize().expect("canon").join("notes.txt"));
    }

    #[test]
    fn parent_traversal_is_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sub = dir.path().join("workspace");
        std::fs::create_dir(&sub).expect("mkdir");

        let err = resolve_contained(&sub, "../../etc/passwd");
        assert!(err.is_err());
    }

    #[test]
    fn nested_new_file_under_existing_dir_is_allowed() {
        let dir = tempfile::tempdir().expect("tempdir");
        let sub = dir.path().join("workspace");
        std::fs::create_dir(&sub).expect("mkdir");

        let resolved = resolve_contained(&sub, "repo/new-file.txt").expect("resolves even though file is new");
        assert!(resolved.ends_with("repo/new-file.txt"));
    }

    #[test]
    fn is_contained_rejects_sibling_with_shared_prefix() {
        let root = Path::new("/tenant");
        let sibling = Path::new("/tenant-a/file.txt");
        assert!(!is_contained(sibling, root));
    }

    #[test]
    fn repo_url_bare_owner_name() {
        let r = canonicalize_repo_url("owner/repo").expect("parses");
        assert_eq!(r.owner, "owner");
        assert_eq!(r.name, "repo");
    }

    #[test]
    fn repo_url_https_with_git_suffix() {
        let r = canonicalize_repo_url("https://github.com/owner/repo.git").expect("parses");
        assert_eq!(r.owner, "owner");
        assert_eq!(r.name, "repo");
        assert_eq!(r.workspace_folder(), "repo");
    }

    #[test]
    fn repo_url_scp_like() {
        let r = canonicalize_repo_url("git@github.com:owner/repo.git").expect("parses");
        assert_eq!(r.owner, "owner");
        assert_eq!(r.name, "repo");
    }

    #[test]
    fn repo_url_ssh_scheme() {
        let r = canonicalize_repo_url("ssh://git@github.com:22/owner/repo.git").expect("parses");
        assert_eq!(r.owner, "owner");
        assert_eq!(r.name, "repo");
    }

    #[test]
    fn repo_url_empty_is_invalid() {
        assert!(canonicalize_repo_url("").is_err());
    }

    #[test]
    fn repo_url_missing_name_is_invalid() {
        assert!(canonicalize_repo_url("https://github.com/owner").is_err());
    }
}
