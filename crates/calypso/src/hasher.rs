//! Composite hashing for cache invalidation.
//!
//! The composite hash for a translation unit is:
//!
//! ```text
//! SHA-256( content_hash || "|" || flags_hash || "|" || includes_hash )
//! ```
//!
//! where each component is itself a hex-encoded SHA-256 digest. A tracked
//! file is fresh for a context iff its stored composite hash matches the one
//! recomputed from current bytes, sanitised flags, and transitive include
//! hashes.
//!
//! Flags are sanitised before hashing: code-gen-only flags that do not affect
//! semantics are dropped, MSVC spellings are translated to their portable
//! equivalents, and the result is sorted so argument order never causes
//! spurious staleness.

use std::path::Path;

use sha2::{Digest, Sha256};

fn hex_digest(input: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 hex digest of a file's raw bytes.
///
/// Returns the empty string if the file cannot be read; callers treat an
/// empty content hash as "always stale".
#[must_use]
pub fn content_hash(path: &Path) -> String {
    match std::fs::read(path) {
        Ok(bytes) => hex_digest(&bytes),
        Err(_) => String::new(),
    }
}

/// SHA-256 hex digest over the sanitised, sorted compile-argument list.
#[must_use]
pub fn flags_hash(flags: &[String]) -> String {
    let mut sanitised = sanitize_flags(flags);
    sanitised.sort();
    hex_digest(sanitised.join("\0").as_bytes())
}

/// SHA-256 hex digest over the sorted `(included_file_key, content_hash)`
/// pairs of every transitive include that resolved to a known repo file.
#[must_use]
pub fn includes_hash(pairs: &[(String, String)]) -> String {
    let mut entries: Vec<String> = pairs
        .iter()
        .map(|(file_key, hash)| format!("{file_key}={hash}"))
        .collect();
    entries.sort();
    hex_digest(entries.join("\0").as_bytes())
}

/// Combine the three component hashes into the invalidation key.
#[must_use]
pub fn composite_hash(content: &str, flags: &str, includes: &str) -> String {
    hex_digest(format!("{content}|{flags}|{includes}").as_bytes())
}

/// Flags that only affect code generation or compiler housekeeping and are
/// dropped entirely. `/Fo` and `/Fd` are matched as prefixes.
const DROPPED_EXACT: &[&str] = &[
    "/nologo", "/Zi", "/Z7", "/Ob0", "/Ob1", "/Ob2", "/EHsc", "/EHa", "/utf-8", "-c", "/c", "/MP",
    "/W0", "/W1", "/W2", "/W3", "/W4", "/WX", "/MD", "/MDd", "/MT", "/MTd", "/GR", "/Gy", "/GL",
    "/FS", "/FC", "/bigobj", "/permissive-",
];

const DROPPED_PREFIXES: &[&str] = &["/Fo", "/Fd", "/Fe", "/Fp", "-o"];

/// Normalise a raw compile-argument list into the portable form that feeds
/// [`flags_hash`]. Deterministic; preserves input order (sorting happens at
/// hash time so callers can still inspect flags in invocation order).
#[must_use]
pub fn sanitize_flags(flags: &[String]) -> Vec<String> {
    let mut out = Vec::with_capacity(flags.len());
    let mut skip_next = false;

    for flag in flags {
        if skip_next {
            skip_next = false;
            continue;
        }
        let f = flag.as_str();

        if DROPPED_EXACT.contains(&f) {
            continue;
        }
        if f == "-o" {
            // `-o <path>` consumes its operand; attached `-opath` handled below.
            skip_next = true;
            continue;
        }
        if DROPPED_PREFIXES.iter().any(|p| f.starts_with(p) && f.len() > p.len()) {
            continue;
        }

        if let Some(translated) = translate_msvc_flag(f) {
            out.extend(translated);
            continue;
        }

        out.push(f.to_string());
    }

    out
}

/// Translate an MSVC-style flag to its portable spelling, or `None` when the
/// flag passes through unchanged.
fn translate_msvc_flag(flag: &str) -> Option<Vec<String>> {
    if let Some(rest) = flag.strip_prefix("/D") {
        if !rest.is_empty() {
            return Some(vec![format!("-D{rest}")]);
        }
    }
    if let Some(rest) = flag.strip_prefix("/U") {
        if !rest.is_empty() {
            return Some(vec![format!("-U{rest}")]);
        }
    }
    if let Some(rest) = flag.strip_prefix("/I") {
        if !rest.is_empty() {
            return Some(vec![format!("-I{rest}")]);
        }
    }
    if let Some(rest) = flag.strip_prefix("/std:") {
        return Some(vec![format!("-std={rest}")]);
    }
    if let Some(rest) = flag.strip_prefix("/FI") {
        if rest.is_empty() {
            // `/FI <header>` with a separate operand becomes `-include`.
            return Some(vec!["-include".to_string()]);
        }
        return Some(vec!["-include".to_string(), rest.to_string()]);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn composite_is_pure_over_components() {
        let a = composite_hash("c1", "f1", "i1");
        let b = composite_hash("c1", "f1", "i1");
        assert_eq!(a, b);
        assert_ne!(a, composite_hash("c2", "f1", "i1"));
        assert_ne!(a, composite_hash("c1", "f2", "i1"));
        assert_ne!(a, composite_hash("c1", "f1", "i2"));
    }

    #[test]
    fn flags_hash_is_order_independent() {
        let fwd: Vec<String> = ["-Ia", "-Ib", "-DX=1", "-std=c++17"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let rev: Vec<String> = fwd.iter().rev().cloned().collect();
        assert_eq!(flags_hash(&fwd), flags_hash(&rev));
    }

    #[test]
    fn flags_hash_distinguishes_different_flag_sets() {
        let a: Vec<String> = vec!["-DX=1".into()];
        let b: Vec<String> = vec!["-DX=2".into()];
        assert_ne!(flags_hash(&a), flags_hash(&b));
    }

    #[rstest]
    #[case("/DX=1", "-DX=1")]
    #[case("/Iinclude", "-Iinclude")]
    #[case("/std:c++17", "-std=c++17")]
    #[case("/Uassert", "-Uassert")]
    fn msvc_flags_translate_to_portable(#[case] msvc: &str, #[case] portable: &str) {
        let sanitised = sanitize_flags(&[msvc.to_string()]);
        assert_eq!(sanitised, vec![portable.to_string()]);
    }

    #[test]
    fn fi_with_operand_becomes_include_pair() {
        let sanitised = sanitize_flags(&["/FIpch.h".to_string()]);
        assert_eq!(sanitised, vec!["-include".to_string(), "pch.h".to_string()]);
    }

    #[test]
    fn codegen_only_flags_are_dropped() {
        let flags: Vec<String> = [
            "/nologo", "/Zi", "/Ob0", "/EHsc", "/utf-8", "/FoC:/out/x.obj", "/FdC:/out/x.pdb",
            "-c", "/c", "-Iinclude",
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(sanitize_flags(&flags), vec!["-Iinclude".to_string()]);
    }

    #[test]
    fn dash_o_consumes_its_operand() {
        let flags: Vec<String> = ["-o", "build/x.o", "-DX"].iter().map(ToString::to_string).collect();
        assert_eq!(sanitize_flags(&flags), vec!["-DX".to_string()]);
    }

    #[test]
    fn msvc_and_portable_spellings_hash_identically() {
        let msvc: Vec<String> = ["/DX=1", "/Iinc", "/std:c++17", "/nologo"]
            .iter()
            .map(ToString::to_string)
            .collect();
        let portable: Vec<String> = ["-DX=1", "-Iinc", "-std=c++17"]
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(flags_hash(&msvc), flags_hash(&portable));
    }

    #[test]
    fn includes_hash_ignores_pair_order() {
        let a = vec![
            ("repo_b:include/u.h".to_string(), "h1".to_string()),
            ("repo_a:src/v.h".to_string(), "h2".to_string()),
        ];
        let b: Vec<_> = a.iter().rev().cloned().collect();
        assert_eq!(includes_hash(&a), includes_hash(&b));
    }

    #[test]
    fn includes_hash_changes_with_header_content() {
        let before = vec![("repo_b:include/u.h".to_string(), "h1".to_string())];
        let after = vec![("repo_b:include/u.h".to_string(), "h2".to_string())];
        assert_ne!(includes_hash(&before), includes_hash(&after));
    }

    #[test]
    fn content_hash_of_missing_file_is_empty() {
        assert_eq!(content_hash(Path::new("/nonexistent/zzz.cpp")), "");
    }

    #[test]
    fn content_hash_matches_known_sha256() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("a.cpp");
        std::fs::write(&path, b"int main() {}\n").expect("write");
        // Any change to the bytes must change the digest.
        let h1 = content_hash(&path);
        assert_eq!(h1.len(), 64);
        std::fs::write(&path, b"int main() { return 1; }\n").expect("write");
        assert_ne!(content_hash(&path), h1);
    }
}
