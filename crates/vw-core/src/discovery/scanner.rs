//! Process directory scanner.
//!
//! Enumerates backing files under every temporary-directory root and derives
//! instance ids from their names. Names that fit neither convention are
//! skipped silently: foreign files in `/tmp` are normal.

use std::collections::BTreeSet;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, trace};

use vw_common::{Error, InstanceId, Result};

use super::tempdirs::TempDirectories;
use crate::logging::event_names;

/// Prefix shared by per-user directories and legacy flat files.
pub const DIR_PREFIX: &str = "hsperfdata_";

static USER_DIR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^hsperfdata_\S*$").expect("valid user dir regex"));
static CURRENT_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9]+$").expect("valid file regex"));
static LEGACY_FILE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^hsperfdata_[0-9]+(_[1-2]+)?$").expect("valid legacy regex"));

/// Which naming generation a backing file follows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackingGeneration {
    Current,
    Legacy,
}

/// A discovered backing file. Recomputed on every scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackingLocation {
    pub path: PathBuf,
    pub id: InstanceId,
    pub generation: BackingGeneration,
}

/// Name of the per-user directory for `user`.
pub fn user_dir_name(user: &str) -> String {
    format!("{}{}", DIR_PREFIX, user)
}

/// Derive an id from a current-generation file name (`<pid>`).
pub fn parse_current_name(name: &str) -> Result<InstanceId> {
    if !CURRENT_FILE_RE.is_match(name) {
        return Err(Error::MalformedName(name.to_string()));
    }
    parse_id(name)
}

/// Derive an id from a legacy file name (`hsperfdata_<pid>[_<variant>]`).
///
/// With one `_` the id is everything after it; otherwise it is the text
/// between the first and the last `_`.
pub fn parse_legacy_name(name: &str) -> Result<InstanceId> {
    if !LEGACY_FILE_RE.is_match(name) {
        return Err(Error::MalformedName(name.to_string()));
    }
    let malformed = || Error::MalformedName(name.to_string());
    let first = name.find('_').ok_or_else(malformed)?;
    let last = name.rfind('_').ok_or_else(malformed)?;
    let id = if first == last {
        &name[first + 1..]
    } else {
        &name[first + 1..last]
    };
    parse_id(id).map_err(|_| malformed())
}

fn parse_id(s: &str) -> Result<InstanceId> {
    match s.parse::<u32>() {
        Ok(0) | Err(_) => Err(Error::MalformedName(s.to_string())),
        Ok(id) => Ok(InstanceId(id)),
    }
}

/// Regular file that we are able to open for reading.
fn is_readable_file(path: &Path) -> bool {
    match fs::metadata(path) {
        Ok(meta) if meta.is_file() => File::open(path).is_ok(),
        _ => false,
    }
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn file_name(path: &Path) -> Option<&str> {
    path.file_name().and_then(|n| n.to_str())
}

/// Directory entries of `dir`, or nothing if it cannot be read.
fn entries(dir: &Path) -> Vec<PathBuf> {
    match fs::read_dir(dir) {
        Ok(iter) => iter.filter_map(|e| e.ok()).map(|e| e.path()).collect(),
        Err(err) => {
            trace!(
                event = event_names::SCAN_ROOT_UNREADABLE,
                dir = %dir.display(),
                error = %err,
                "skipping unreadable directory"
            );
            Vec::new()
        }
    }
}

/// Finds backing files for local instances.
///
/// Holds no mutable state; concurrent scans are safe.
pub struct ProcessDirectoryScanner {
    dirs: Arc<dyn TempDirectories>,
}

impl ProcessDirectoryScanner {
    pub fn new(dirs: Arc<dyn TempDirectories>) -> Self {
        ProcessDirectoryScanner { dirs }
    }

    pub fn temp_directories(&self) -> &Arc<dyn TempDirectories> {
        &self.dirs
    }

    /// Ids of every instance with a readable backing file.
    pub fn scan(&self, user: Option<&str>) -> BTreeSet<InstanceId> {
        let ids: BTreeSet<InstanceId> = self.locations(user).into_iter().map(|l| l.id).collect();
        debug!(
            event = event_names::SCAN_COMPLETE,
            instances = ids.len(),
            "scan complete"
        );
        ids
    }

    /// All backing files, in scan order.
    pub fn locations(&self, user: Option<&str>) -> Vec<BackingLocation> {
        let mut found = Vec::new();
        for root in self.dirs.temporary_directories(user, InstanceId::SELF) {
            for dir in user_dirs(&root, user) {
                for path in entries(&dir) {
                    let Some(name) = file_name(&path) else { continue };
                    let Ok(id) = parse_current_name(name) else { continue };
                    if is_readable_file(&path) {
                        found.push(BackingLocation {
                            path,
                            id,
                            generation: BackingGeneration::Current,
                        });
                    }
                }
            }

            for path in entries(&root) {
                let Some(name) = file_name(&path) else { continue };
                let Ok(id) = parse_legacy_name(name) else { continue };
                if is_readable_file(&path) {
                    found.push(BackingLocation {
                        path,
                        id,
                        generation: BackingGeneration::Legacy,
                    });
                }
            }
        }
        found
    }

    /// Most recently modified backing file for `id`, either generation.
    pub fn resolve_file(&self, id: InstanceId, user: Option<&str>) -> Option<PathBuf> {
        if id.is_self() {
            return None;
        }
        let names = self.file_ids(id);
        let mut candidates = Vec::new();
        for root in self.dirs.temporary_directories(user, id) {
            candidates.extend(current_candidates(&root, user, &names));
            candidates.extend(legacy_candidates(&root, &names));
        }
        newest(candidates)
    }

    /// Most recently modified current-generation file for `id`.
    pub fn resolve_current_file(&self, id: InstanceId, user: Option<&str>) -> Option<PathBuf> {
        if id.is_self() {
            return None;
        }
        let names = self.file_ids(id);
        let candidates = self
            .dirs
            .temporary_directories(user, id)
            .into_iter()
            .flat_map(|root| current_candidates(&root, user, &names))
            .collect();
        newest(candidates)
    }

    /// Most recently modified legacy-generation file for `id`.
    pub fn resolve_legacy_file(&self, id: InstanceId) -> Option<PathBuf> {
        if id.is_self() {
            return None;
        }
        let names = self.file_ids(id);
        let candidates = self
            .dirs
            .temporary_directories(None, id)
            .into_iter()
            .flat_map(|root| legacy_candidates(&root, &names))
            .collect();
        newest(candidates)
    }

    /// Ids a backing file for `id` may be named after.
    fn file_ids(&self, id: InstanceId) -> Vec<InstanceId> {
        let local = self.dirs.namespace_local_id(id);
        if local == id || local.is_self() {
            vec![id]
        } else {
            vec![local, id]
        }
    }
}

/// Per-user directories under `root`: the filtered one, or every match.
fn user_dirs(root: &Path, user: Option<&str>) -> Vec<PathBuf> {
    match user {
        Some(user) => {
            let dir = root.join(user_dir_name(user));
            if dir.is_dir() {
                vec![dir]
            } else {
                Vec::new()
            }
        }
        None => entries(root)
            .into_iter()
            .filter(|p| file_name(p).is_some_and(|n| USER_DIR_RE.is_match(n)) && p.is_dir())
            .collect(),
    }
}

fn current_candidates(root: &Path, user: Option<&str>, ids: &[InstanceId]) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for dir in user_dirs(root, user) {
        for id in ids {
            let path = dir.join(id.to_string());
            if is_readable_file(&path) {
                out.push(path);
            }
        }
    }
    out
}

fn legacy_candidates(root: &Path, ids: &[InstanceId]) -> Vec<PathBuf> {
    entries(root)
        .into_iter()
        .filter(|path| {
            file_name(path)
                .and_then(|name| parse_legacy_name(name).ok())
                .is_some_and(|found| ids.contains(&found))
        })
        .filter(|path| is_readable_file(path))
        .collect()
}

/// Greatest modification time wins; ties keep the earlier candidate.
fn newest(candidates: Vec<PathBuf>) -> Option<PathBuf> {
    let mut best: Option<(PathBuf, Option<SystemTime>)> = None;
    for path in candidates {
        let mtime = modified(&path);
        let replace = match &best {
            None => true,
            Some((_, best_time)) => mtime > *best_time,
        };
        if replace {
            best = Some((path, mtime));
        }
    }
    best.map(|(path, _)| path)
}
