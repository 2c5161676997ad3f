//! Directory URI helpers
//!
//! One metafile exists per canonical directory URI, and the canonical URI
//! also names the sidecar document on disk.

use std::path::{Path, PathBuf};
use tracing::warn;
use url::Url;

/// Suffix appended to the escaped URI to form the sidecar file name
pub const SIDECAR_SUFFIX: &str = ".xml";

/// Canonicalize a directory URI
///
/// Paths become `file://` URIs (relative ones are resolved against the
/// current directory), the scheme is lowercased, hierarchical URIs have
/// their dot segments resolved, and a trailing slash is dropped unless it
/// is the root.
pub fn canonicalize(uri: &str) -> String {
    let trimmed = uri.trim();
    let candidate = if trimmed.starts_with('/') {
        format!("file://{trimmed}")
    } else if scheme(trimmed).is_none() {
        match std::path::absolute(trimmed) {
            Ok(path) => format!("file://{}", path.display()),
            Err(e) => {
                warn!("Cannot resolve directory {:?}: {}", trimmed, e);
                trimmed.to_string()
            }
        }
    } else {
        trimmed.to_string()
    };

    let mut canonical = match Url::parse(&candidate) {
        Ok(url) => url.to_string(),
        Err(_) => candidate,
    };

    while canonical.ends_with('/') && !canonical.ends_with("://") && !canonical.ends_with(":///")
    {
        canonical.pop();
    }
    canonical
}

/// Extract the scheme of a URI, if it has one
pub fn scheme(uri: &str) -> Option<&str> {
    let (scheme, _) = uri.split_once(':')?;
    let mut chars = scheme.chars();
    let first = chars.next()?;
    let valid = first.is_ascii_alphabetic()
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    valid.then_some(scheme)
}

/// Check whether a URI belongs to a scheme that never has durable metadata
pub fn is_metadata_excluded(uri: &str, excluded_schemes: &[String]) -> bool {
    scheme(uri).is_some_and(|scheme| {
        excluded_schemes
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(scheme))
    })
}

/// File name of the sidecar document for a canonical URI
pub fn sidecar_file_name(canonical_uri: &str) -> String {
    format!("{}{SIDECAR_SUFFIX}", urlencoding::encode(canonical_uri))
}

/// Full path of the sidecar document for a canonical URI
pub fn sidecar_path(metafiles_dir: &Path, canonical_uri: &str) -> PathBuf {
    metafiles_dir.join(sidecar_file_name(canonical_uri))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonicalize_paths() {
        assert_eq!(canonicalize("/tmp/x"), "file:///tmp/x");
        assert_eq!(canonicalize("  file:///tmp/x/  "), "file:///tmp/x");
        assert_eq!(canonicalize("FILE:///tmp/./a/../b"), "file:///tmp/b");
        assert_eq!(canonicalize("file:///"), "file:///");
    }

    #[test]
    fn test_canonicalize_same_directory() {
        assert_eq!(canonicalize("/tmp/x/"), canonicalize("file:///tmp/x"));
    }

    #[test]
    fn test_canonicalize_opaque() {
        assert_eq!(canonicalize("man:ls"), "man:ls");
        assert_eq!(canonicalize(""), "");
    }

    #[test]
    fn test_canonicalize_relative_path() {
        let cwd = std::env::current_dir().unwrap();
        let expected = canonicalize(&cwd.join("tmp/x").display().to_string());

        assert!(expected.starts_with("file:///"));
        assert_eq!(canonicalize("tmp/x"), expected);
        assert_eq!(canonicalize("./tmp/x/"), expected);
        assert_eq!(canonicalize("tmp/y/../x"), expected);
    }

    #[test]
    fn test_scheme() {
        assert_eq!(scheme("file:///tmp"), Some("file"));
        assert_eq!(scheme("x-nautilus-search:foo"), Some("x-nautilus-search"));
        assert_eq!(scheme("/tmp/x"), None);
        assert_eq!(scheme("1abc:foo"), None);
    }

    #[test]
    fn test_excluded_schemes() {
        let excluded = vec!["ghelp".to_string(), "search".to_string()];
        assert!(is_metadata_excluded("ghelp:nautilus", &excluded));
        assert!(is_metadata_excluded("SEARCH:[file:///]name", &excluded));
        assert!(!is_metadata_excluded("file:///tmp/x", &excluded));
        assert!(!is_metadata_excluded("/tmp/x", &excluded));
    }

    #[test]
    fn test_sidecar_file_name() {
        assert_eq!(
            sidecar_file_name("file:///tmp/x"),
            "file%3A%2F%2F%2Ftmp%2Fx.xml"
        );
        let path = sidecar_path(Path::new("/home/u/metafiles"), "file:///tmp/x");
        assert_eq!(
            path,
            PathBuf::from("/home/u/metafiles/file%3A%2F%2F%2Ftmp%2Fx.xml")
        );
    }
}
