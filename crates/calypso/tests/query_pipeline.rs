//! End-to-end pipeline tests: recall, freshness, merge, confidence.
//!
//! The extractor binary is external, so these tests seed facts through the
//! writer exactly as a successful parse would, then drive real queries. The
//! scope is pinned to repos with FTS coverage so no `rg` fallback runs and
//! results stay deterministic.

use std::fs;

use calypso::{
    build_app_state, AnalysisContextSpec, ExtractedCallEdge, ExtractedReference, ExtractedSymbol,
    ExtractorOutput, ParsePayload, QueryInput, QueryScope, ResolvedIncludeDep, Settings,
    SharedState, WriteOp,
};
use tempfile::TempDir;

fn workspace_fixture() -> (TempDir, SharedState) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let root = dir.path();

    fs::create_dir_all(root.join("repo_a/src")).unwrap();
    fs::create_dir_all(root.join("repo_b/src")).unwrap();
    fs::write(
        root.join("repo_a/src/x.cpp"),
        "void caller() { repoB::util::foo(); }\n",
    )
    .unwrap();
    fs::write(
        root.join("repo_b/src/util.cpp"),
        "// definition of repoB::util::foo\nnamespace repoB::util { void foo() {} }\n",
    )
    .unwrap();

    for repo in ["repo_a", "repo_b"] {
        let src = if repo == "repo_a" { "src/x.cpp" } else { "src/util.cpp" };
        let file = root.join(repo).join(src);
        let compile_db = serde_json::json!([{
            "directory": root.join(repo).to_string_lossy(),
            "file": file.to_string_lossy(),
            "arguments": ["clang++", "-std=c++17", "-c", file.to_string_lossy()],
        }]);
        fs::write(
            root.join(repo).join("compile_commands.json"),
            compile_db.to_string(),
        )
        .unwrap();
    }

    let manifest = "\
workspace_id: ws
repos:
  - repo_id: repo_a
    root: repo_a
    compile_commands: repo_a/compile_commands.json
    depends_on: [repo_b]
  - repo_id: repo_b
    root: repo_b
    compile_commands: repo_b/compile_commands.json
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
        .expect("register");
    (dir, state)
}

/// Persist facts with hashes matching the live tree, as the extractor would.
async fn seed_file(
    state: &SharedState,
    root: &std::path::Path,
    file_key: &str,
    output: ExtractorOutput,
) {
    let (repo_id, rel) = calypso::split_file_key(file_key).unwrap();
    let abs = root.join(repo_id).join(rel);
    let (_, flags_hash, _) = state
        .orchestrator
        .explore_compile_command("ws", file_key)
        .expect("compile lookup")
        .expect("compile entry");

    let content = calypso::content_hash(&abs);
    let includes = calypso::includes_hash(&[]);
    let composite = calypso::composite_hash(&content, &flags_hash, &includes);

    let payload = ParsePayload {
        context_id: "ws:baseline".into(),
        file_key: file_key.into(),
        repo_id: repo_id.into(),
        rel_path: rel.into(),
        abs_path: abs.to_string_lossy().into_owned(),
        output,
        include_deps: Vec::<ResolvedIncludeDep>::new(),
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
        .expect("seed facts");
}

async fn seed_cross_repo_facts(state: &SharedState, root: &std::path::Path) {
    seed_file(
        state,
        root,
        "repo_a:src/x.cpp",
        ExtractorOutput {
            file: String::new(),
            symbols: vec![ExtractedSymbol {
                name: "caller".into(),
                qualified_name: "caller".into(),
                kind: "Function".into(),
                line: 1,
                col: 6,
                extent_end_line: 1,
            }],
            references: vec![ExtractedReference {
                symbol: "repoB::util::foo".into(),
                line: 1,
                col: 17,
                kind: "call".into(),
            }],
            call_edges: vec![ExtractedCallEdge {
                caller: "caller".into(),
                callee: "repoB::util::foo".into(),
                line: 1,
            }],
            include_deps: vec![],
            success: true,
            diagnostics: vec![],
        },
    )
    .await;
    seed_file(
        state,
        root,
        "repo_b:src/util.cpp",
        ExtractorOutput {
            file: String::new(),
            symbols: vec![ExtractedSymbol {
                name: "foo".into(),
                qualified_name: "repoB::util::foo".into(),
                kind: "Function".into(),
                line: 1,
                col: 25,
                extent_end_line: 1,
            }],
            references: vec![],
            call_edges: vec![],
            include_deps: vec![],
            success: true,
            diagnostics: vec![],
        },
    )
    .await;
}

fn input(symbol: &str) -> QueryInput {
    QueryInput {
        workspace_id: "ws".into(),
        symbol: symbol.into(),
        analysis_context: AnalysisContextSpec::default(),
        scope: QueryScope {
            entry_repos: vec!["repo_a".into()],
            max_repo_hops: 2,
        },
        max_recall_files: None,
        max_parse_budget: None,
    }
}

#[tokio::test]
async fn cross_repo_reference_query_with_full_coverage() {
    let (dir, state) = workspace_fixture();
    seed_cross_repo_facts(&state, dir.path()).await;

    let response = state
        .orchestrator
        .query_references(input("repoB::util::foo"))
        .await
        .expect("query");

    assert_eq!(response.references.len(), 1);
    assert_eq!(response.references[0].file_key, "repo_a:src/x.cpp");
    assert_eq!(response.references[0].kind, "call");
    let definition = response.definition.expect("definition found");
    assert_eq!(definition.file_key, "repo_b:src/util.cpp");

    let confidence = &response.confidence;
    assert!((confidence.repo_coverage["repo_a"] - 1.0).abs() < 1e-9);
    assert!((confidence.repo_coverage["repo_b"] - 1.0).abs() < 1e-9);
    assert!((confidence.verified_ratio - 1.0).abs() < 1e-9);
    assert!(confidence.unparsed_files.is_empty());
}

#[tokio::test]
async fn call_graph_query_returns_incoming_edges() {
    let (dir, state) = workspace_fixture();
    seed_cross_repo_facts(&state, dir.path()).await;

    let response = state
        .orchestrator
        .query_call_graph(input("repoB::util::foo"), calypso::CallDirection::Incoming)
        .await
        .expect("query");
    assert_eq!(response.edges.len(), 1);
    assert_eq!(response.edges[0].caller, "caller");
    assert_eq!(response.edges[0].callee, "repoB::util::foo");
}

#[tokio::test]
async fn scope_hops_zero_excludes_dependency_repo() {
    let (dir, state) = workspace_fixture();
    seed_cross_repo_facts(&state, dir.path()).await;

    let mut query = input("repoB::util::foo");
    query.scope.max_repo_hops = 0;
    let response = state
        .orchestrator
        .query_references(query)
        .await
        .expect("query");

    // Only repo_a is in scope; repo_b never enters the envelope.
    assert!(response.confidence.repo_coverage.contains_key("repo_a"));
    assert!(!response.confidence.repo_coverage.contains_key("repo_b"));
}

#[tokio::test]
async fn unknown_symbol_yields_no_candidates_warning() {
    let (_dir, state) = workspace_fixture();

    let response = state
        .orchestrator
        .query_references(input("totally::absent"))
        .await
        .expect("query");
    assert!(response.references.is_empty());
    assert!(response.confidence.repo_coverage.is_empty());
    assert!(response
        .confidence
        .warnings
        .contains(&"no_candidates".to_string()));
}

#[tokio::test]
async fn budget_overflow_reports_unparsed_files() {
    let (dir, state) = workspace_fixture();
    seed_cross_repo_facts(&state, dir.path()).await;

    // Touch x.cpp so it classifies stale, then query with a zero parse
    // budget: the file must come back in unparsed_files with the warning.
    fs::write(
        dir.path().join("repo_a/src/x.cpp"),
        "void caller() { repoB::util::foo(); } // edited\n",
    )
    .unwrap();

    let mut query = input("repoB::util::foo");
    query.max_parse_budget = Some(0);
    let response = state
        .orchestrator
        .query_references(query)
        .await
        .expect("query");

    assert!(response
        .confidence
        .unparsed_files
        .contains(&"repo_a:src/x.cpp".to_string()));
    assert!(response
        .confidence
        .warnings
        .contains(&"budget_exceeded".to_string()));
    // repo_b stayed verified.
    assert!((response.confidence.repo_coverage["repo_b"] - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn empty_symbol_is_a_validation_error() {
    let (_dir, state) = workspace_fixture();
    let err = state
        .orchestrator
        .query_references(input("  "))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), calypso::ErrorKind::Validation);
}
