use crate::GmemError;
use serde::Serialize;
use sha2::{Digest, Sha256};

/// A resolved project: canonical form for hashing, short id, native form for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProjectRef {
    pub canonical: String,
    pub id: String,
    pub native: String,
    pub name: String,
}

impl ProjectRef {
    /// Namespace tag attached to every episode from this project.
    pub fn namespace(&self) -> String {
        format!("project_{}", self.id)
    }
}

pub fn resolve(raw: &str) -> Result<ProjectRef, GmemError> {
    let canonical = canonicalize(raw)?;
    Ok(ProjectRef {
        id: project_id(&canonical),
        native: native_path(&canonical),
        name: derive_project_name(&canonical),
        canonical,
    })
}

/// Normalize any platform path form to forward slashes.
///
/// Accepts unix paths, `C:\...` and `C:/...`, `\\?\C:\...` verbatim paths,
/// UNC shares and WSL `/mnt/<drive>/...` mounts (folded onto the drive form
/// so both views of one checkout hash identically). `.` and `..` segments
/// are resolved lexically; nothing touches the filesystem.
pub fn canonicalize(raw: &str) -> Result<String, GmemError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(GmemError::Path("empty path".into()));
    }
    if trimmed.contains('\0') {
        return Err(GmemError::Path("path contains NUL byte".into()));
    }

    let mut s = trimmed.replace('\\', "/");
    if let Some(rest) = s.strip_prefix("//?/").or_else(|| s.strip_prefix("//./")) {
        s = rest.strip_prefix("UNC/").map(|r| format!("//{r}")).unwrap_or_else(|| rest.to_string());
    }

    let (prefix, rest) = split_root(&s)
        .ok_or_else(|| GmemError::Path(format!("not an absolute path: {trimmed}")))?;

    let mut segments: Vec<&str> = Vec::new();
    for seg in rest.split('/') {
        match seg {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if prefix == "//" && segments.len() < 2 {
        return Err(GmemError::Path(format!("incomplete UNC path: {trimmed}")));
    }

    Ok(format!("{prefix}{}", segments.join("/")))
}

/// Split into (root prefix, remainder). Root prefixes: `/`, `X:/`, `//`.
fn split_root(s: &str) -> Option<(String, &str)> {
    let bytes = s.as_bytes();

    if let Some(rest) = s.strip_prefix("/mnt/") {
        let rb = rest.as_bytes();
        if !rb.is_empty() && rb[0].is_ascii_alphabetic() && (rb.len() == 1 || rb[1] == b'/') {
            let drive = (rb[0] as char).to_ascii_uppercase();
            return Some((format!("{drive}:/"), &rest[1..]));
        }
    }

    if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        if bytes.len() > 2 && bytes[2] != b'/' {
            // `C:foo` is drive-relative
            return None;
        }
        let drive = (bytes[0] as char).to_ascii_uppercase();
        return Some((format!("{drive}:/"), &s[2..]));
    }

    if s.starts_with("//") {
        return Some(("//".into(), &s[2..]));
    }

    if s.starts_with('/') {
        return Some(("/".into(), &s[1..]));
    }

    None
}

/// Deterministic 12-hex-char project id.
pub fn project_id(canonical: &str) -> String {
    let digest = Sha256::digest(canonical.as_bytes());
    digest.iter().take(6).map(|b| format!("{b:02x}")).collect()
}

/// Platform-native rendering of a canonical path.
pub fn native_path(canonical: &str) -> String {
    if cfg!(windows) {
        canonical.replace('/', "\\")
    } else {
        canonical.to_string()
    }
}

/// Human-readable project name: the last meaningful path component,
/// skipping generic container directories.
pub fn derive_project_name(canonical: &str) -> String {
    let home = std::env::var("HOME")
        .ok()
        .and_then(|h| canonicalize(&h).ok())
        .unwrap_or_default();
    if !home.is_empty() && canonical == home {
        return "home".into();
    }

    let skip = ["src", "workspace", "dev", "projects", "repos", "code"];
    let parts: Vec<&str> = canonical
        .split('/')
        .filter(|p| !p.is_empty() && !p.ends_with(':'))
        .collect();

    parts
        .iter()
        .rev()
        .find(|p| !skip.contains(p))
        .or(parts.last())
        .map(|p| (*p).to_string())
        .unwrap_or_else(|| "root".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_paths_are_cleaned() {
        assert_eq!(canonicalize("/home/a/proj/").unwrap(), "/home/a/proj");
        assert_eq!(canonicalize("/home//a/./proj").unwrap(), "/home/a/proj");
        assert_eq!(canonicalize("/home/a/x/../proj").unwrap(), "/home/a/proj");
        assert_eq!(canonicalize("/").unwrap(), "/");
        assert_eq!(canonicalize("/..").unwrap(), "/");
    }

    #[test]
    fn windows_forms_share_one_canonical() {
        let a = canonicalize(r"C:\Users\dev\proj").unwrap();
        let b = canonicalize("c:/Users/dev/proj/").unwrap();
        let c = canonicalize(r"\\?\C:\Users\dev\proj").unwrap();
        let d = canonicalize("/mnt/c/Users/dev/proj").unwrap();
        assert_eq!(a, "C:/Users/dev/proj");
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(a, d);
        assert_eq!(project_id(&a), project_id(&d));
    }

    #[test]
    fn unc_paths() {
        assert_eq!(canonicalize(r"\\server\share\repo").unwrap(), "//server/share/repo");
        assert_eq!(canonicalize(r"\\?\UNC\server\share").unwrap(), "//server/share");
        assert!(canonicalize(r"\\server").is_err());
    }

    #[test]
    fn structurally_invalid_input_fails() {
        assert!(canonicalize("").is_err());
        assert!(canonicalize("   ").is_err());
        assert!(canonicalize("relative/path").is_err());
        assert!(canonicalize("C:relative").is_err());
        assert!(canonicalize("/tmp/a\0b").is_err());
    }

    #[test]
    fn project_id_is_short_and_stable() {
        let id = project_id("/home/a/proj");
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(id, project_id("/home/a/proj"));
        assert_ne!(id, project_id("/home/a/other"));
    }

    #[test]
    fn resolve_fills_every_field() {
        let p = resolve("/srv/work/gmem/").unwrap();
        assert_eq!(p.canonical, "/srv/work/gmem");
        assert_eq!(p.name, "gmem");
        assert_eq!(p.namespace(), format!("project_{}", p.id));
        if !cfg!(windows) {
            assert_eq!(p.native, "/srv/work/gmem");
        }
    }

    #[test]
    fn project_name_skips_container_dirs() {
        assert_eq!(derive_project_name("/opt/myapp/src"), "myapp");
        assert_eq!(derive_project_name("C:/code"), "code");
        assert_eq!(derive_project_name("/"), "root");
    }
}
