//! Integration tests for freshness classification and composite hashing.
//!
//! Builds a real temp workspace (manifest, compile database, sources) and
//! drives classification through the orchestrator's exploration surface, so
//! the whole chain from file bytes to stored hash is exercised without the
//! native extractor binary.

use std::fs;
use std::path::Path;

use calypso::{
    build_app_state, AnalysisContextSpec, ExtractedReference, ExtractorOutput, Freshness,
    ParsePayload, ResolvedIncludeDep, Settings, SharedState, WriteOp,
};
use tempfile::TempDir;

/// Two-repo workspace: repo_a/src/x.cpp includes repo_b/include/u.h through
/// an external prefix covered by a path remap.
fn workspace_fixture() -> (TempDir, SharedState) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let root = dir.path();

    fs::create_dir_all(root.join("repo_a/src")).unwrap();
    fs::create_dir_all(root.join("repo_b/include")).unwrap();
    fs::write(
        root.join("repo_a/src/x.cpp"),
        "#include \"u.h\"\nvoid call_foo() { repoB::util::foo(); }\n",
    )
    .unwrap();
    fs::write(root.join("repo_b/include/u.h"), "#pragma once\nnamespace repoB::util { void foo(); }\n").unwrap();

    let compile_db = serde_json::json!([{
        "directory": root.join("repo_a").to_string_lossy(),
        "file": root.join("repo_a/src/x.cpp").to_string_lossy(),
        "arguments": ["clang++", "-Iinclude", "-DX=1", "-c",
                      root.join("repo_a/src/x.cpp").to_string_lossy()],
    }]);
    fs::write(
        root.join("repo_a/compile_commands.json"),
        compile_db.to_string(),
    )
    .unwrap();

    let manifest = "\
workspace_id: ws
repos:
  - repo_id: repo_a
    root: repo_a
    compile_commands: repo_a/compile_commands.json
    depends_on: [repo_b]
  - repo_id: repo_b
    root: repo_b
path_remaps:
  - from_prefix: /external/libb
    to_repo_id: repo_b
    to_prefix: repo_b
";
    fs::write(root.join("workspace.yaml"), manifest).unwrap();

    let settings = Settings {
        db_path: root.join("calypso.db").to_string_lossy().into_owned(),
        ..Settings::default()
    };
    let state = build_app_state(settings).expect("build app state");
    state
        .orchestrator
        .register_workspace("ws", &root.to_string_lossy(), "")
        .expect("register workspace");
    (dir, state)
}

/// Persist facts for x.cpp with hashes matching the live workspace state, as
/// a successful extractor run would have.
async fn persist_x_cpp(state: &SharedState, root: &Path) {
    let abs = root.join("repo_a/src/x.cpp");
    let header_abs = root.join("repo_b/include/u.h");

    let (_, flags_hash, _) = state
        .orchestrator
        .explore_compile_command("ws", "repo_a:src/x.cpp")
        .expect("compile command lookup")
        .expect("compile entry exists");

    let include_pairs = vec![(
        "repo_b:include/u.h".to_string(),
        calypso::content_hash(&header_abs),
    )];
    let content = calypso::content_hash(&abs);
    let includes = calypso::includes_hash(&include_pairs);
    let composite = calypso::composite_hash(&content, &flags_hash, &includes);

    let payload = ParsePayload {
        context_id: "ws:baseline".into(),
        file_key: "repo_a:src/x.cpp".into(),
        repo_id: "repo_a".into(),
        rel_path: "src/x.cpp".into(),
        abs_path: abs.to_string_lossy().into_owned(),
        output: ExtractorOutput {
            file: abs.to_string_lossy().into_owned(),
            symbols: vec![],
            references: vec![ExtractedReference {
                symbol: "repoB::util::foo".into(),
                line: 2,
                col: 20,
                kind: "call".into(),
            }],
            call_edges: vec![],
            include_deps: vec![],
            success: true,
            diagnostics: vec![],
        },
        include_deps: vec![ResolvedIncludeDep {
            raw_path: "/external/libb/include/u.h".into(),
            file_key: "repo_b:include/u.h".into(),
            abs_path: header_abs.to_string_lossy().into_owned(),
            resolved: true,
            depth: 1,
        }],
        content_hash: content,
        flags_hash,
        includes_hash: includes,
        composite_hash: composite,
        warnings: vec![],
    };

    state
        .writer
        .submit(WriteOp::UpsertFileFacts {
            payload: Box::new(payload),
            bulk: false,
        })
        .await
        .expect("persist facts");
}

#[tokio::test]
async fn unparsed_file_classifies_as_unparsed() {
    let (_dir, state) = workspace_fixture();
    let classified = state
        .orchestrator
        .explore_classify(
            "ws",
            &AnalysisContextSpec::default(),
            &["repo_a:src/x.cpp".to_string()],
        )
        .expect("classify");
    assert_eq!(classified["repo_a:src/x.cpp"], Freshness::Unparsed);
}

#[tokio::test]
async fn fresh_after_persist_with_matching_hashes() {
    let (dir, state) = workspace_fixture();
    persist_x_cpp(&state, dir.path()).await;

    let classified = state
        .orchestrator
        .explore_classify(
            "ws",
            &AnalysisContextSpec::default(),
            &["repo_a:src/x.cpp".to_string()],
        )
        .expect("classify");
    assert_eq!(classified["repo_a:src/x.cpp"], Freshness::Fresh);
}

#[tokio::test]
async fn editing_source_makes_file_stale() {
    let (dir, state) = workspace_fixture();
    persist_x_cpp(&state, dir.path()).await;

    fs::write(
        dir.path().join("repo_a/src/x.cpp"),
        "#include \"u.h\"\nvoid call_foo_v2() { repoB::util::foo(); }\n",
    )
    .unwrap();

    let classified = state
        .orchestrator
        .explore_classify(
            "ws",
            &AnalysisContextSpec::default(),
            &["repo_a:src/x.cpp".to_string()],
        )
        .expect("classify");
    assert_eq!(classified["repo_a:src/x.cpp"], Freshness::Stale);
}

#[tokio::test]
async fn editing_cross_repo_header_makes_includer_stale() {
    let (dir, state) = workspace_fixture();
    persist_x_cpp(&state, dir.path()).await;

    // Only the header in repo_b changes; repo_a's source bytes are untouched.
    fs::write(
        dir.path().join("repo_b/include/u.h"),
        "#pragma once\nnamespace repoB::util { void foo(); void bar(); }\n",
    )
    .unwrap();

    let classified = state
        .orchestrator
        .explore_classify(
            "ws",
            &AnalysisContextSpec::default(),
            &["repo_a:src/x.cpp".to_string()],
        )
        .expect("classify");
    assert_eq!(classified["repo_a:src/x.cpp"], Freshness::Stale);
}

#[tokio::test]
async fn file_without_compile_entry_reports_missing_flags() {
    let (dir, state) = workspace_fixture();
    fs::write(dir.path().join("repo_b/include/lone.cpp"), "int lone;\n").unwrap();

    // repo_b has no compile database at all.
    let classified = state
        .orchestrator
        .explore_classify(
            "ws",
            &AnalysisContextSpec::default(),
            &["repo_b:include/lone.cpp".to_string()],
        )
        .expect("classify");
    assert_eq!(
        classified["repo_b:include/lone.cpp"],
        Freshness::MissingFlags
    );
}

#[tokio::test]
async fn compile_command_lookup_reports_exact_match() {
    let (_dir, state) = workspace_fixture();
    let (arguments, flags_hash, match_type) = state
        .orchestrator
        .explore_compile_command("ws", "repo_a:src/x.cpp")
        .expect("lookup")
        .expect("entry");
    assert!(arguments.contains(&"-DX=1".to_string()));
    assert!(!flags_hash.is_empty());
    assert_eq!(match_type, calypso::CompileMatchType::Exact);
}
