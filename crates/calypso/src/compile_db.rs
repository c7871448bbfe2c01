//! Loader and query interface for `compile_commands.json`.
//!
//! This module is the single source of truth for compiler flags: every flag
//! forwarded to the extractor must originate from a compilation database.
//! Lookup keys are normalised lower-case absolute paths so lookups behave on
//! case-insensitive filesystems.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::hasher;
use crate::manifest::normalize_path;

/// Whether a compile entry matched the queried file exactly or via the
/// best-effort header fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileMatchType {
    Exact,
    Fallback,
}

/// A single entry from `compile_commands.json`, with the compiler executable
/// and source operand stripped and the flags hash precomputed.
#[derive(Debug, Clone)]
pub struct CompileEntry {
    pub file: String,
    pub directory: String,
    pub arguments: Vec<String>,
    pub flags_hash: String,
}

#[derive(Debug, Deserialize)]
struct RawEntry {
    #[serde(default)]
    file: String,
    #[serde(default)]
    directory: String,
    #[serde(default)]
    arguments: Option<Vec<String>>,
    #[serde(default)]
    command: Option<String>,
}

/// In-memory index over one `compile_commands.json` file.
#[derive(Debug)]
pub struct CompilationDatabase {
    entries: HashMap<String, CompileEntry>,
    fallback_cache: Mutex<HashMap<String, Option<String>>>,
}

impl CompilationDatabase {
    /// Parse `path` and return a ready-to-query database.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::NotFound(format!("compile_commands.json not found: {}: {e}", path.display()))
        })?;
        let items: Vec<RawEntry> = serde_json::from_str(&raw)?;

        let mut entries = HashMap::new();
        for item in items {
            if item.file.is_empty() {
                continue;
            }
            let arguments = match (&item.arguments, &item.command) {
                (Some(args), _) => args.clone(),
                (None, Some(cmd)) => split_command(cmd),
                (None, None) => {
                    warn!(file = %item.file, "compile entry with no arguments or command");
                    continue;
                }
            };

            let abs_file = resolve_entry_path(&item.file, &item.directory);
            let flags = extract_flags(&arguments, &abs_file, &item.directory);
            let flags_hash = hasher::flags_hash(&flags);

            entries.insert(
                normalise_key(&abs_file),
                CompileEntry {
                    file: abs_file,
                    directory: item.directory,
                    arguments: flags,
                    flags_hash,
                },
            );
        }

        debug!(entries = entries.len(), path = %path.display(), "loaded compilation database");
        Ok(Self {
            entries,
            fallback_cache: Mutex::new(HashMap::new()),
        })
    }

    /// Look up compile flags for an exact translation unit.
    #[must_use]
    pub fn get(&self, file_path: &Path) -> Option<&CompileEntry> {
        self.entries.get(&normalise_key(&file_path.to_string_lossy()))
    }

    /// Best-effort entry for files that are not explicit translation units,
    /// primarily headers. Scores every entry by path affinity and caches the
    /// winner per queried path.
    #[must_use]
    pub fn fallback_entry(&self, file_path: &Path) -> Option<&CompileEntry> {
        if let Some(exact) = self.get(file_path) {
            return Some(exact);
        }

        let key = normalise_key(&file_path.to_string_lossy());
        if let Ok(cache) = self.fallback_cache.lock() {
            if let Some(cached) = cache.get(&key) {
                return cached.as_ref().and_then(|k| self.entries.get(k));
            }
        }

        let target_parts = path_parts(&key);
        let target = PathBuf::from(&key);
        let target_stem = target.file_stem().map(|s| s.to_string_lossy().to_lowercase());
        let target_suffix = target.extension().map(|s| s.to_string_lossy().to_lowercase());
        let is_header = matches!(
            target_suffix.as_deref(),
            Some("h" | "hh" | "hpp" | "hxx" | "inc" | "ipp" | "tpp")
        );

        let mut best: Option<(&String, i64)> = None;
        for (entry_key, _entry) in &self.entries {
            let entry_parts = path_parts(entry_key);
            let entry_path = PathBuf::from(entry_key);
            let common = common_prefix_len(&target_parts, &entry_parts);
            let distance =
                (target_parts.len() - common) as i64 + (entry_parts.len() - common) as i64;

            let same_dir = i64::from(target.parent() == entry_path.parent());
            let same_stem = i64::from(
                target_stem.is_some()
                    && entry_path.file_stem().map(|s| s.to_string_lossy().to_lowercase())
                        == target_stem,
            );
            let source_like = i64::from(matches!(
                entry_path.extension().map(|s| s.to_string_lossy().to_lowercase()).as_deref(),
                Some("c" | "cc" | "cpp" | "cxx" | "m" | "mm")
            ));
            let header_bonus = i64::from(is_header) * same_stem * source_like * 20;

            let score =
                (common as i64) * 10 + same_dir * 8 + same_stem * 6 + source_like * 2 + header_bonus
                    - distance;
            match best {
                Some((best_key, best_score))
                    if (score, entry_key.as_str()) <= (best_score, best_key.as_str()) => {}
                _ => best = Some((entry_key, score)),
            }
        }

        let winner = best.map(|(k, _)| k.clone());
        if let Ok(mut cache) = self.fallback_cache.lock() {
            cache.insert(key, winner.clone());
        }
        winner.and_then(|k| self.entries.get(&k))
    }

    /// All translation-unit paths present in the database.
    #[must_use]
    pub fn all_files(&self) -> Vec<String> {
        self.entries.values().map(|e| e.file.clone()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalise_key(path: &str) -> String {
    normalize_path(path).to_lowercase()
}

fn path_parts(normalised: &str) -> Vec<&str> {
    normalised.split('/').filter(|p| !p.is_empty()).collect()
}

fn common_prefix_len(lhs: &[&str], rhs: &[&str]) -> usize {
    lhs.iter().zip(rhs.iter()).take_while(|(l, r)| l == r).count()
}

fn resolve_entry_path(raw_file: &str, directory: &str) -> String {
    let fp = Path::new(raw_file);
    if fp.is_absolute() || directory.is_empty() {
        normalize_path(raw_file)
    } else {
        normalize_path(&Path::new(directory).join(fp).to_string_lossy())
    }
}

/// Split a shell command string into arguments. Quoted segments stay intact;
/// malformed quoting degrades to whitespace splitting.
fn split_command(command: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;

    for c in command.chars() {
        match (c, quote) {
            ('"' | '\'', None) => quote = Some(c),
            (q, Some(open)) if q == open => quote = None,
            (c, None) if c.is_whitespace() => {
                if !current.is_empty() {
                    out.push(std::mem::take(&mut current));
                }
            }
            (c, _) => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(current);
    }
    out
}

/// Strip the compiler executable and the source operand from `arguments`,
/// returning only the flags that should be forwarded to the extractor.
fn extract_flags(arguments: &[String], source_file: &str, directory: &str) -> Vec<String> {
    if arguments.is_empty() {
        return Vec::new();
    }

    let source_norm = normalise_key(source_file);
    let source_rel_norm = if directory.is_empty() {
        String::new()
    } else {
        normalise_key(
            &Path::new(source_file)
                .strip_prefix(directory)
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        )
    };

    let mut filtered = Vec::new();
    let mut skip_next = false;
    // First element is the compiler binary.
    for flag in &arguments[1..] {
        if skip_next {
            skip_next = false;
            continue;
        }
        match flag.as_str() {
            "-o" | "/Fo" | "/Fe" => {
                skip_next = true;
                continue;
            }
            "-c" | "/c" => continue,
            _ => {}
        }
        if looks_like_path(flag) {
            let norm = normalise_key(flag);
            if norm == source_norm || (!source_rel_norm.is_empty() && norm == source_rel_norm) {
                continue;
            }
        }
        filtered.push(flag.clone());
    }
    filtered
}

fn looks_like_path(value: &str) -> bool {
    let v = value.trim().trim_matches(|c| c == '"' || c == '\'');
    if v.is_empty() {
        return false;
    }
    if v.starts_with('/') || v.starts_with('\\') {
        return true;
    }
    let bytes = v.as_bytes();
    if bytes.len() >= 3
        && bytes[1] == b':'
        && bytes[0].is_ascii_alphabetic()
        && (bytes[2] == b'\\' || bytes[2] == b'/')
    {
        return true;
    }
    v.contains('/') || v.contains('\\')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_db(dir: &TempDir, json: &str) -> PathBuf {
        let path = dir.path().join("compile_commands.json");
        fs::write(&path, json).expect("write compile db");
        path
    }

    #[test]
    fn load_parses_arguments_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_db(
            &dir,
            r#"[{"directory": "/ws/repo_a", "file": "/ws/repo_a/src/x.cpp",
                 "arguments": ["clang++", "-Iinclude", "-DX=1", "-c", "/ws/repo_a/src/x.cpp", "-o", "x.o"]}]"#,
        );
        let db = CompilationDatabase::load(&path).expect("load");
        assert_eq!(db.len(), 1);

        let entry = db.get(Path::new("/ws/repo_a/src/x.cpp")).expect("entry");
        assert_eq!(entry.arguments, vec!["-Iinclude", "-DX=1"]);
        assert!(!entry.flags_hash.is_empty());
    }

    #[test]
    fn load_parses_command_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_db(
            &dir,
            r#"[{"directory": "/ws/r", "file": "/ws/r/a.cpp",
                 "command": "cl.exe /DX=1 \"/I spaced dir\" /c /ws/r/a.cpp"}]"#,
        );
        let db = CompilationDatabase::load(&path).expect("load");
        let entry = db.get(Path::new("/ws/r/a.cpp")).expect("entry");
        assert!(entry.arguments.contains(&"/DX=1".to_string()));
        assert!(entry.arguments.contains(&"/I spaced dir".to_string()));
        assert!(!entry.arguments.iter().any(|f| f == "/c"));
    }

    #[test]
    fn lookup_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_db(
            &dir,
            r#"[{"directory": "/ws/r", "file": "/ws/r/Main.CPP", "arguments": ["cc", "-DY"]}]"#,
        );
        let db = CompilationDatabase::load(&path).expect("load");
        assert!(db.get(Path::new("/ws/r/main.cpp")).is_some());
    }

    #[test]
    fn relative_file_resolves_against_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_db(
            &dir,
            r#"[{"directory": "/ws/r", "file": "src/x.cpp", "arguments": ["cc", "-DZ"]}]"#,
        );
        let db = CompilationDatabase::load(&path).expect("load");
        assert!(db.get(Path::new("/ws/r/src/x.cpp")).is_some());
    }

    #[test]
    fn fallback_prefers_sibling_source_with_same_stem() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_db(
            &dir,
            r#"[
                {"directory": "/ws/r", "file": "/ws/r/src/widget.cpp", "arguments": ["cc", "-Ia"]},
                {"directory": "/ws/r", "file": "/ws/r/other/unrelated.cpp", "arguments": ["cc", "-Ib"]}
            ]"#,
        );
        let db = CompilationDatabase::load(&path).expect("load");
        let entry = db.fallback_entry(Path::new("/ws/r/src/widget.h")).expect("fallback");
        assert_eq!(normalize_path(&entry.file), "/ws/r/src/widget.cpp");
    }

    #[test]
    fn missing_db_is_not_found() {
        let err = CompilationDatabase::load(Path::new("/nope/compile_commands.json")).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NotFound);
    }
}
