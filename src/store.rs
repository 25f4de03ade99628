//! Named snapshot sets on disk.
//!
//! ```text
//! <db>/
//! ├── snapshots/<name>/<absolute path without leading '/'>.json
//! └── registry.txt
//! ```
//!
//! `registry.txt` is a tab-separated index (`NAME CREATED FILE_COUNT
//! DESCRIPTION`) kept sorted by name. Set directories missing from the index
//! are still listed.

use crate::error::{Error, Result};
use crate::snapshot::Snapshot;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

const REGISTRY_FILE: &str = "registry.txt";
const SNAPSHOTS_DIR: &str = "snapshots";
const REGISTRY_HEADER: &str = "# XCOFF Scan Registry\n# NAME\tCREATED\tFILE_COUNT\tDESCRIPTION\n";

/// One row of the registry index
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotSet {
    pub name: String,
    pub created: String,
    pub file_count: usize,
    pub description: String,
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn set_dir(&self, name: &str) -> PathBuf {
        self.root.join(SNAPSHOTS_DIR).join(name)
    }

    fn registry_path(&self) -> PathBuf {
        self.root.join(REGISTRY_FILE)
    }

    /// Store `snapshot` under set `name`; returns the written document path
    pub fn store(&self, name: &str, snapshot: &Snapshot, description: Option<&str>) -> Result<PathBuf> {
        check_set_name(name)?;
        let mut named = snapshot.clone();
        named.name = Some(name.to_string());

        let path = self.set_dir(name).join(relative_document_path(&snapshot.filepath));
        named.save(&path)?;
        debug!(set = name, path = %path.display(), "Stored snapshot");

        self.update_registry(name, description)?;
        Ok(path)
    }

    /// Load the snapshot of `filepath` from set `name`, if stored
    pub fn load(&self, name: &str, filepath: &str) -> Result<Option<Snapshot>> {
        check_set_name(name)?;
        let path = self.set_dir(name).join(relative_document_path(filepath));
        if !path.is_file() {
            return Ok(None);
        }
        Snapshot::load(&path).map(Some)
    }

    /// Every set, from the index and from the snapshot directory, sorted by name
    pub fn list_snapshots(&self) -> Result<Vec<SnapshotSet>> {
        let mut sets = self.read_registry()?;

        let base = self.root.join(SNAPSHOTS_DIR);
        if base.is_dir() {
            for entry in fs::read_dir(&base)?.flatten() {
                let path = entry.path();
                let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                if !path.is_dir() || sets.contains_key(name) {
                    continue;
                }
                let created = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|t| format_timestamp(DateTime::<Utc>::from(t)))
                    .unwrap_or_default();
                sets.insert(
                    name.to_string(),
                    SnapshotSet {
                        name: name.to_string(),
                        created,
                        file_count: count_documents(&path),
                        description: String::new(),
                    },
                );
            }
        }

        Ok(sets.into_values().collect())
    }

    /// Target paths stored in set `name`, sorted
    pub fn list_files(&self, name: &str) -> Result<Vec<String>> {
        check_set_name(name)?;
        let dir = self.set_dir(name);
        if !dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<String> = documents(&dir)
            .filter_map(|path| {
                let rel = path.strip_prefix(&dir).ok()?.to_string_lossy().into_owned();
                let rel = rel.strip_suffix(".json")?;
                Some(format!("/{}", rel.replace('\\', "/")))
            })
            .collect();
        files.sort();
        Ok(files)
    }

    /// Remove set `name`; false when it did not exist
    pub fn delete(&self, name: &str) -> Result<bool> {
        check_set_name(name)?;
        let dir = self.set_dir(name);
        let existed = dir.is_dir();
        if existed {
            fs::remove_dir_all(&dir)?;
        }

        let mut sets = self.read_registry()?;
        let indexed = sets.remove(name).is_some();
        if indexed {
            self.write_registry(&sets)?;
        }
        Ok(existed || indexed)
    }

    fn update_registry(&self, name: &str, description: Option<&str>) -> Result<()> {
        let mut sets = self.read_registry()?;
        let file_count = count_documents(&self.set_dir(name));
        let entry = sets.entry(name.to_string()).or_insert_with(|| SnapshotSet {
            name: name.to_string(),
            created: format_timestamp(Utc::now()),
            file_count: 0,
            description: String::new(),
        });
        entry.file_count = file_count;
        if let Some(description) = description {
            entry.description = sanitize(description);
        }
        self.write_registry(&sets)
    }

    fn read_registry(&self) -> Result<BTreeMap<String, SnapshotSet>> {
        let path = self.registry_path();
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let text = fs::read_to_string(&path)?;
        Ok(text
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .filter_map(parse_registry_line)
            .map(|set| (set.name.clone(), set))
            .collect())
    }

    fn write_registry(&self, sets: &BTreeMap<String, SnapshotSet>) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| {
            Error::storage(format!("cannot create {}: {}", self.root.display(), e))
        })?;
        let mut text = String::from(REGISTRY_HEADER);
        for set in sets.values() {
            text.push_str(&format!(
                "{}\t{}\t{}\t{}\n",
                set.name, set.created, set.file_count, set.description
            ));
        }
        fs::write(self.registry_path(), text)?;
        Ok(())
    }
}

fn parse_registry_line(line: &str) -> Option<SnapshotSet> {
    let mut parts = line.split('\t');
    let name = parts.next()?.to_string();
    let created = parts.next()?.to_string();
    let file_count = parts.next()?.trim().parse().ok()?;
    let description = parts.next().unwrap_or("").to_string();
    Some(SnapshotSet {
        name,
        created,
        file_count,
        description,
    })
}

/// `/usr/bin/ls` becomes `usr/bin/ls.json`
fn relative_document_path(filepath: &str) -> PathBuf {
    let rel = filepath.trim_start_matches(['/', '\\']).replace(':', "");
    PathBuf::from(format!("{}.json", rel))
}

fn check_set_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\t', '\n']) {
        return Err(Error::storage(format!("invalid snapshot name: {:?}", name)));
    }
    Ok(())
}

fn sanitize(text: &str) -> String {
    text.replace(['\t', '\n', '\r'], " ")
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn documents(dir: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(dir)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|e| e == "json"))
}

fn count_documents(dir: &Path) -> usize {
    documents(dir).count()
}
