use crate::error::{Result, WardenError};
use crate::template::uid::TemplateUid;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Snapshot file names
// ---------------------------------------------------------------------------

pub const SERVICE_FILE: &str = "service.yaml";
pub const STATE_FILE: &str = "state.yaml";
pub const DATA_FILE: &str = "data.yaml";
pub const TASKS_FILE: &str = "tasks.yaml";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

/// `<root>/<host>/<account>/<repo>/<name>`
pub fn template_dir(root: &Path, uid: &TemplateUid) -> PathBuf {
    root.join(&uid.host)
        .join(&uid.account)
        .join(&uid.repo)
        .join(&uid.name)
}

/// `<root>/<host>/<account>/<repo>/<name>/<service name>/<guid>`
pub fn service_dir(root: &Path, uid: &TemplateUid, name: &str, guid: &str) -> PathBuf {
    template_dir(root, uid).join(name).join(guid)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

static SERVICE_NAME_RE: OnceLock<Regex> = OnceLock::new();

fn service_name_re() -> &'static Regex {
    SERVICE_NAME_RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_.\-]*$").unwrap())
}

/// Service names become a directory component of the snapshot layout.
pub fn validate_service_name(name: &str) -> Result<()> {
    if name.len() > 128 || !service_name_re().is_match(name) {
        return Err(WardenError::InvalidServiceName(name.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_service_names() {
        for name in ["svc1", "web-01", "db.primary", "_internal", "0b1c0e2a-7a52-4c1e"] {
            validate_service_name(name).unwrap_or_else(|_| panic!("expected valid: {name}"));
        }
    }

    #[test]
    fn invalid_service_names() {
        for name in ["", ".", "..", "-flag", "a/b", "has space", ".hidden"] {
            assert!(validate_service_name(name).is_err(), "expected invalid: {name}");
        }
    }

    #[test]
    fn layout_helpers() {
        let uid: TemplateUid = "github.com/acct/repo/node/0.0.1".parse().unwrap();
        assert_eq!(
            service_dir(Path::new("/srv"), &uid, "svc1", "g1"),
            PathBuf::from("/srv/github.com/acct/repo/node/svc1/g1")
        );
    }
}
