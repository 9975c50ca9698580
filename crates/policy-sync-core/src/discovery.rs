//! Local discovery of policy definitions, initiatives and assignments.
//!
//! Layout conventions:
//! - a definition is a directory containing `policy.json`, optionally with the
//!   rule and parameters split out into `policy.rules.json` / `policy.parameters.json`
//! - an initiative is a directory containing `policyset.json`
//! - an assignment is any file whose name matches one of the assignment patterns

use std::fs;
use std::path::Path;

use globset::{Glob, GlobBuilder, GlobSet, GlobSetBuilder};
use serde_json::Value;
use walkdir::WalkDir;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::model::{LocalPolicy, PolicyKind, PolicyObject};

const DEFINITION_FILE: &str = "policy.json";
const DEFINITION_RULES_FILE: &str = "policy.rules.json";
const DEFINITION_PARAMETERS_FILE: &str = "policy.parameters.json";
const INITIATIVE_FILE: &str = "policyset.json";

const ENFORCE_DEFAULT: &str = "Default";
const ENFORCE_DISABLED: &str = "DoNotEnforce";

/// Everything found in the repository, each list sorted by path.
#[derive(Debug, Default)]
pub struct Discovered {
    pub definitions: Vec<LocalPolicy>,
    pub initiatives: Vec<LocalPolicy>,
    pub assignments: Vec<LocalPolicy>,
}

impl Discovered {
    pub fn len(&self) -> usize {
        self.definitions.len() + self.initiatives.len() + self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All objects in upsert order: definitions, initiatives, assignments.
    pub fn all(&self) -> impl Iterator<Item = &LocalPolicy> {
        self.definitions
            .iter()
            .chain(&self.initiatives)
            .chain(&self.assignments)
    }
}

fn glob(pattern: &str) -> Result<Glob> {
    Ok(GlobBuilder::new(pattern).literal_separator(true).build()?)
}

fn glob_set<'a>(patterns: impl IntoIterator<Item = &'a str>) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(glob(pattern)?);
    }
    Ok(builder.build()?)
}

/// Include/exclude filter over repository-relative paths.
struct PathFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl PathFilter {
    fn new(paths: &[String], ignore_paths: &[String]) -> Result<Self> {
        let include = glob_set(
            paths
                .iter()
                .filter(|p| !p.starts_with('!'))
                .map(String::as_str),
        )?;
        let exclude = glob_set(
            paths
                .iter()
                .filter_map(|p| p.strip_prefix('!'))
                .chain(ignore_paths.iter().map(String::as_str)),
        )?;
        Ok(Self { include, exclude })
    }

    fn matches(&self, rel: &str) -> bool {
        self.include.is_match(rel) && !self.exclude.is_match(rel)
    }
}

struct EnforcementRules {
    enforce: GlobSet,
    disable: GlobSet,
}

impl EnforcementRules {
    fn new(patterns: &[String]) -> Result<Self> {
        let enforce = glob_set(
            patterns
                .iter()
                .filter(|p| !p.starts_with('~'))
                .map(String::as_str),
        )?;
        let disable = glob_set(patterns.iter().filter_map(|p| p.strip_prefix('~')))?;
        Ok(Self { enforce, disable })
    }

    /// `~` patterns win over plain ones.
    fn mode_for(&self, rel: &str) -> Option<&'static str> {
        if self.disable.is_match(rel) {
            Some(ENFORCE_DISABLED)
        } else if self.enforce.is_match(rel) {
            Some(ENFORCE_DEFAULT)
        } else {
            None
        }
    }
}

fn relative(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn read_json(path: &Path, rel: &str) -> Result<Value> {
    let content = fs::read_to_string(path)?;
    serde_json::from_str(&content).map_err(|e| SyncError::malformed(rel, e.to_string()))
}

fn into_policy(value: Value, rel: &str, expected: PolicyKind) -> Result<PolicyObject> {
    let policy: PolicyObject =
        serde_json::from_value(value).map_err(|e| SyncError::malformed(rel, e.to_string()))?;
    if policy.kind() != expected {
        return Err(SyncError::malformed(
            rel,
            format!("expected a {expected}, found a {}", policy.kind()),
        ));
    }
    if !policy.is_valid() {
        return Err(SyncError::malformed(rel, "id and name must be non-empty"));
    }
    Ok(policy)
}

fn load_definition(dir: &Path, rel: &str) -> Result<PolicyObject> {
    let mut value = read_json(&dir.join(DEFINITION_FILE), rel)?;

    let split_files = [
        ("policyRule", DEFINITION_RULES_FILE),
        ("parameters", DEFINITION_PARAMETERS_FILE),
    ];
    for (key, file) in split_files {
        let path = dir.join(file);
        if value.pointer(&format!("/properties/{key}")).is_some() || !path.is_file() {
            continue;
        }
        let part = read_json(&path, rel)?;
        let Some(obj) = value.as_object_mut() else {
            return Err(SyncError::malformed(rel, "policy file is not a JSON object"));
        };
        let properties = obj
            .entry("properties")
            .or_insert_with(|| Value::Object(Default::default()));
        if let Some(props) = properties.as_object_mut() {
            props.insert(key.to_string(), part);
        }
    }

    into_policy(value, rel, PolicyKind::Definition)
}

fn load_assignment(
    file: &Path,
    rel: &str,
    enforcement: &EnforcementRules,
) -> Result<PolicyObject> {
    let mut policy = into_policy(read_json(file, rel)?, rel, PolicyKind::Assignment)?;
    if let (PolicyObject::Assignment(assignment), Some(mode)) =
        (&mut policy, enforcement.mode_for(rel))
    {
        assignment.properties.enforcement_mode = Some(mode.to_string());
    }
    Ok(policy)
}

/// Walk the repository root and load every selected policy object.
///
/// A file that cannot be parsed, or that lacks an id, name or type, aborts
/// discovery with [`SyncError::MalformedPolicy`].
pub fn discover(config: &SyncConfig) -> Result<Discovered> {
    let root = config.root.as_path();
    let filter = PathFilter::new(&config.paths, &config.ignore_paths)?;
    let assignment_names = glob_set(config.assignments.iter().map(String::as_str))?;
    let enforcement = EnforcementRules::new(&config.enforce)?;

    let mut discovered = Discovered::default();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !e.file_name().to_string_lossy().starts_with('.'));

    for entry in walker {
        let entry = entry?;
        let path = entry.path();
        let rel = relative(root, path);

        if entry.file_type().is_dir() {
            if !filter.matches(&rel) {
                continue;
            }
            if path.join(DEFINITION_FILE).is_file() {
                let policy = load_definition(path, &rel)?;
                discovered.definitions.push(LocalPolicy { path: rel, policy });
            } else if path.join(INITIATIVE_FILE).is_file() {
                let value = read_json(&path.join(INITIATIVE_FILE), &rel)?;
                let policy = into_policy(value, &rel, PolicyKind::Initiative)?;
                discovered.initiatives.push(LocalPolicy { path: rel, policy });
            }
        } else if entry.file_type().is_file() {
            if !assignment_names.is_match(entry.file_name().to_string_lossy().as_ref()) {
                continue;
            }
            let parent = path.parent().map(|p| relative(root, p)).unwrap_or_default();
            if !filter.matches(&rel) && !filter.matches(&parent) {
                continue;
            }
            let policy = load_assignment(path, &rel, &enforcement)?;
            discovered.assignments.push(LocalPolicy { path: rel, policy });
        }
    }

    tracing::info!(
        definitions = discovered.definitions.len(),
        initiatives = discovered.initiatives.len(),
        assignments = discovered.assignments.len(),
        "Discovered local policies"
    );
    Ok(discovered)
}
