//! Structured template identity: `host/account/repo/name[/version]`.

use crate::error::{Result, WardenError};
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

static NAME_RE: OnceLock<Regex> = OnceLock::new();
static VERSION_RE: OnceLock<Regex> = OnceLock::new();
static SOURCE_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| Regex::new(r"^\w+$").unwrap())
}

fn version_re() -> &'static Regex {
    VERSION_RE.get_or_init(|| Regex::new(r"^\d+\.\d+\.\d+$").unwrap())
}

fn source_re() -> &'static Regex {
    // https://host/account/repo(.git), git@host:account/repo.git, host/account/repo
    SOURCE_RE.get_or_init(|| {
        Regex::new(r"^(?:[a-z][a-z0-9+.\-]*://)?(?:[^@/]+@)?([^/:]+)(?::\d+)?[:/]([^/]+)/([^/]+?)(?:\.git)?/?$")
            .unwrap()
    })
}

pub fn validate_name(name: &str) -> Result<()> {
    if !name_re().is_match(name) {
        return Err(WardenError::InvalidTemplateUid(format!(
            "name '{name}' must match ^\\w+$"
        )));
    }
    Ok(())
}

pub fn validate_version(version: &str) -> Result<()> {
    if !version_re().is_match(version) {
        return Err(WardenError::InvalidTemplateUid(format!(
            "version '{version}' must look like 1.2.3"
        )));
    }
    Ok(())
}

/// Identity of a template. Equality covers the full tuple, version included.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateUid {
    pub host: String,
    pub account: String,
    pub repo: String,
    pub name: String,
    pub version: Option<String>,
}

impl TemplateUid {
    pub fn new(
        host: impl Into<String>,
        account: impl Into<String>,
        repo: impl Into<String>,
        name: impl Into<String>,
        version: Option<String>,
    ) -> Result<Self> {
        let uid = Self {
            host: host.into(),
            account: account.into(),
            repo: repo.into(),
            name: name.into(),
            version,
        };
        for part in [&uid.host, &uid.account, &uid.repo] {
            if part.is_empty() || part.contains('/') {
                return Err(WardenError::InvalidTemplateUid(uid.to_string()));
            }
        }
        validate_name(&uid.name)?;
        if let Some(v) = &uid.version {
            validate_version(v)?;
        }
        Ok(uid)
    }

    /// Build a uid from a repository URL plus the template's declared name and version.
    pub fn from_source(url: &str, name: &str, version: Option<String>) -> Result<Self> {
        let caps = source_re()
            .captures(url.trim())
            .ok_or_else(|| WardenError::InvalidTemplateUid(format!("source url '{url}'")))?;
        Self::new(&caps[1], &caps[2], &caps[3], name, version)
    }

    /// The same identity without a version.
    pub fn unversioned(&self) -> Self {
        Self {
            version: None,
            ..self.clone()
        }
    }

    pub fn same_template(&self, other: &Self) -> bool {
        self.host == other.host
            && self.account == other.account
            && self.repo == other.repo
            && self.name == other.name
    }

    /// Order two uids of the same template by version.
    ///
    /// Versions compare as plain strings, so `"10.0.0"` sorts before `"9.0.0"`.
    /// Uids of different templates cannot be compared.
    pub fn try_cmp(&self, other: &Self) -> Result<Ordering> {
        if !self.same_template(other) {
            return Err(WardenError::IncomparableTemplates(
                self.to_string(),
                other.to_string(),
            ));
        }
        Ok(self.version.cmp(&other.version))
    }
}

impl fmt::Display for TemplateUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.host, self.account, self.repo, self.name)?;
        if let Some(v) = &self.version {
            write!(f, "/{v}")?;
        }
        Ok(())
    }
}

impl FromStr for TemplateUid {
    type Err = WardenError;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [host, account, repo, name] => Self::new(*host, *account, *repo, *name, None),
            [host, account, repo, name, version] => {
                Self::new(*host, *account, *repo, *name, Some(version.to_string()))
            }
            _ => Err(WardenError::InvalidTemplateUid(s.to_string())),
        }
    }
}

impl Serialize for TemplateUid {
    fn serialize<S: Serializer>(&self, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TemplateUid {
    fn deserialize<D: Deserializer<'de>>(d: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Partial match over uid fields; `None` matches anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UidFilter {
    pub host: Option<String>,
    pub account: Option<String>,
    pub repo: Option<String>,
    pub name: Option<String>,
    pub version: Option<String>,
}

impl UidFilter {
    pub fn by_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Default::default()
        }
    }

    /// Filter matching every version of the template `uid` names.
    pub fn any_version(uid: &TemplateUid) -> Self {
        Self {
            host: Some(uid.host.clone()),
            account: Some(uid.account.clone()),
            repo: Some(uid.repo.clone()),
            name: Some(uid.name.clone()),
            version: None,
        }
    }

    pub fn matches(&self, uid: &TemplateUid) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref().map_or(true, |w| w == have)
        }
        eq(&self.host, &uid.host)
            && eq(&self.account, &uid.account)
            && eq(&self.repo, &uid.repo)
            && eq(&self.name, &uid.name)
            && self
                .version
                .as_deref()
                .map_or(true, |w| uid.version.as_deref() == Some(w))
    }
}
