use super::*;
use crate::timestamp::parse_rfc3339;

const COMMIT_A: &str = "0123456789abcdef0123456789abcdef01234567";
const COMMIT_B: &str = "89abcdef0123456789abcdef0123456789abcdef";

fn sample_config() -> &'static str {
    r#"
apiVersion: gitdep/v1
commands:
  migrate-v2:
    run: ./scripts/migrate-v2.sh
    description: Rewrite imports for v2
    working_dir: tools
    env:
      MODE: strict
      RETRIES: 3
  check: cargo test --workspace
changes:
  v2:
    type: breaking
    description: Renamed the client module
    migration: migrate-v2
    verify: check
    metadata:
      ticket: API-42
  v1.1:
    type: feature
    description: Added retries
"#
}

#[test]
fn parse_dependency_config() {
    let config = DependencyConfig::from_yaml_str(sample_config()).expect("config should parse");
    assert_eq!(config.api_version, CONFIG_API_VERSION);

    let change = config.change("v2").expect("v2 must be declared");
    assert!(change.is_breaking());
    assert_eq!(change.migration.as_deref(), Some("migrate-v2"));
    assert_eq!(change.verify.as_deref(), Some("check"));
    assert_eq!(
        change.metadata.get("ticket"),
        Some(&serde_yaml::Value::String("API-42".to_string()))
    );

    let migrate = config.migration_for(change).expect("migration must resolve");
    assert_eq!(migrate.run, "./scripts/migrate-v2.sh");
    assert_eq!(migrate.working_dir.as_deref(), Some(std::path::Path::new("tools")));
    assert_eq!(migrate.env.get("RETRIES").map(String::as_str), Some("3"));

    let check = config.verify_for(change).expect("verify must resolve");
    assert_eq!(check.run, "cargo test --workspace");

    let minor = config.change("v1.1").expect("v1.1 must be declared");
    assert!(!minor.has_commands());
    assert_eq!(minor.change_type.as_deref(), Some("feature"));
}

#[test]
fn change_type_is_open_ended() {
    let config = DependencyConfig::from_yaml_str(
        "apiVersion: gitdep/v1\nchanges:\n  v3:\n    type: security\n",
    )
    .expect("unknown change types are accepted");
    assert_eq!(
        config.change("v3").and_then(|c| c.change_type.as_deref()),
        Some("security")
    );
}

#[test]
fn change_referencing_missing_command_is_rejected() {
    let err = DependencyConfig::from_yaml_str(
        r#"
apiVersion: gitdep/v1
commands:
  check: make test
changes:
  v2:
    migration: migrate
    verify: check
"#,
    )
    .expect_err("missing migration command must fail");
    assert!(err.has_issue_for("changes.v2.migration"));
    assert!(err.to_string().contains("unknown command 'migrate'"));
}

#[test]
fn validation_reports_every_problem_in_one_pass() {
    let err = DependencyConfig::from_yaml_str(
        r#"
apiVersion: gitdep/v9
commands:
  "dep:cmd": echo hi
  empty:
    run: ""
  escape:
    run: ./x.sh
    working_dir: ../outside
changes:
  v2:
    verify: nope
  v3:
    migration: ""
"#,
    )
    .expect_err("invalid config must fail");

    assert_eq!(err.issues.len(), 6, "unexpected issues: {err}");
    assert!(err.has_issue_for("apiVersion"));
    assert!(err.has_issue_for("commands.dep:cmd"));
    assert!(err.has_issue_for("commands.empty.run"));
    assert!(err.has_issue_for("commands.escape.working_dir"));
    assert!(err.has_issue_for("changes.v2.verify"));
    assert!(err.has_issue_for("changes.v3.migration"));
}

#[test]
fn missing_api_version_is_rejected() {
    let err = DependencyConfig::from_yaml_str("changes: {}\n").expect_err("must fail");
    assert!(err.has_issue_for("apiVersion"));
}

#[test]
fn malformed_yaml_is_a_single_issue() {
    let err = DependencyConfig::from_yaml_str("apiVersion: [unterminated\n").expect_err("must fail");
    assert_eq!(err.issues.len(), 1);
    assert!(err.to_string().contains("malformed YAML"));
}

#[test]
fn absolute_working_dir_is_rejected() {
    let err = DependencyConfig::from_yaml_str(
        "apiVersion: gitdep/v1\ncommands:\n  fix:\n    run: ./fix.sh\n    working_dir: /etc\n",
    )
    .expect_err("must fail");
    assert!(err.to_string().contains("must be relative"));
}

#[test]
fn numeric_change_references_are_accepted() {
    let config =
        DependencyConfig::from_yaml_str("apiVersion: gitdep/v1\nchanges:\n  1.5:\n    description: tagged\n")
            .expect("numeric refs must parse");
    assert!(config.change("1.5").is_some());
}

#[test]
fn commit_id_requires_forty_lowercase_hex_characters() {
    assert!(CommitId::parse(COMMIT_A).is_ok());
    assert!(CommitId::parse(&COMMIT_A[..39]).is_err());
    assert!(CommitId::parse(&COMMIT_A.to_ascii_uppercase()).is_err());
    assert!(CommitId::parse("g123456789abcdef0123456789abcdef01234567").is_err());

    let commit = CommitId::parse(COMMIT_A).expect("valid commit");
    assert_eq!(commit.short(), "0123456789ab");
}

fn sample_lock() -> LockFile {
    let consumed_at = parse_rfc3339("2026-10-01T12:30:00.123456Z").expect("valid timestamp");
    LockFile::new()
        .with_entry(
            "zeta",
            LockEntry::new(
                "https://GitHub.com/acme/zeta/",
                "v1",
                CommitId::parse(COMMIT_A).expect("valid commit"),
                consumed_at,
            )
            .expect("valid entry"),
        )
        .expect("valid name")
        .with_entry(
            "alpha",
            LockEntry::new(
                "git@github.com:acme/alpha.git",
                "main",
                CommitId::parse(COMMIT_B).expect("valid commit"),
                consumed_at,
            )
            .expect("valid entry"),
        )
        .expect("valid name")
}

#[test]
fn lock_file_round_trip() {
    let lock = sample_lock();
    let rendered = lock.to_yaml_string().expect("must serialize");
    let parsed = LockFile::from_yaml_str(&rendered).expect("must parse");
    assert_eq!(parsed, lock);
    assert_eq!(parsed.to_yaml_string().expect("must serialize"), rendered);
}

#[test]
fn lock_file_writes_entries_alphabetically() {
    let rendered = sample_lock().to_yaml_string().expect("must serialize");
    let alpha = rendered.find("alpha:").expect("alpha present");
    let zeta = rendered.find("zeta:").expect("zeta present");
    assert!(alpha < zeta, "entries must be sorted:\n{rendered}");
    assert!(rendered.starts_with("apiVersion: gitdep/v1"));
}

#[test]
fn lock_file_accepts_any_entry_order() {
    let raw = format!(
        "apiVersion: gitdep/v1\ndependencies:\n  zeta:\n    source: https://github.com/acme/zeta\n    ref: v1\n    commit: {COMMIT_A}\n    consumed_at: 2026-10-01T12:30:00Z\n  alpha:\n    consumed_at: 2026-10-01T12:30:00+02:00\n    commit: {COMMIT_B}\n    ref: main\n    source: ssh://git@github.com/acme/alpha.git\n"
    );
    let lock = LockFile::from_yaml_str(&raw).expect("unordered entries must parse");
    let names = lock.dependencies.keys().cloned().collect::<Vec<_>>();
    assert_eq!(names, vec!["alpha", "zeta"]);
}

#[test]
fn lock_file_rejects_malformed_commit_and_timestamp() {
    let raw = "apiVersion: gitdep/v1\ndependencies:\n  foo:\n    source: https://example.test/foo\n    ref: v1\n    commit: ABC\n    consumed_at: yesterday\n";
    let err = LockFile::from_yaml_str(raw).expect_err("must reject malformed entry");
    assert!(err.has_issue_for("dependencies.foo.commit"));
    assert!(err.has_issue_for("dependencies.foo.consumed_at"));
}

#[test]
fn lock_file_rejects_unknown_api_version() {
    let err = LockFile::from_yaml_str("apiVersion: gitdep/v0\ndependencies: {}\n")
        .expect_err("must reject version");
    assert!(err.has_issue_for("apiVersion"));
}

#[test]
fn with_entry_replaces_without_touching_original() {
    let lock = sample_lock();
    let replacement = LockEntry::new(
        "https://github.com/acme/zeta",
        "v2",
        CommitId::parse(COMMIT_B).expect("valid commit"),
        timestamp::now_utc(),
    )
    .expect("valid entry");
    let next = lock.with_entry("zeta", replacement).expect("valid name");

    assert_eq!(lock.get("zeta").map(|e| e.reference.as_str()), Some("v1"));
    assert_eq!(next.get("zeta").map(|e| e.reference.as_str()), Some("v2"));
    assert_eq!(next.dependencies.len(), 2);
}

#[test]
fn normalize_source_canonical_forms() {
    let cases = [
        ("https://GitHub.com/acme/zeta/", "https://github.com/acme/zeta"),
        ("git@GitHub.com:acme/alpha.git", "ssh://git@github.com/acme/alpha.git"),
        ("git+ssh://git@host.test/repo", "ssh://git@host.test/repo"),
        ("file:///srv/git/foo/", "file:///srv/git/foo"),
    ];
    for (input, expected) in cases {
        assert_eq!(
            normalize_source(input).expect("must normalize"),
            expected,
            "input: {input}"
        );
    }
}

#[cfg(unix)]
#[test]
fn normalize_source_turns_absolute_paths_into_file_urls() {
    assert_eq!(
        normalize_source("/srv/git/foo").expect("must normalize"),
        "file:///srv/git/foo"
    );
}

#[test]
fn normalize_source_is_idempotent_and_rejects_garbage() {
    let once = normalize_source("git@example.test:team/repo").expect("must normalize");
    assert_eq!(normalize_source(&once).expect("must normalize"), once);

    assert!(normalize_source("").is_err());
    assert!(normalize_source("relative/path").is_err());
    assert!(normalize_source("ftp://example.test/repo").is_err());
}

#[test]
fn command_ref_parsing() {
    assert_eq!(
        parse_command_ref("foo:migrate").expect("must parse"),
        ("foo".to_string(), "migrate".to_string())
    );
    assert!(parse_command_ref("foo").is_err());
    assert!(parse_command_ref(":migrate").is_err());
    assert!(parse_command_ref("foo:a:b").is_err());
}

#[test]
fn dependency_name_grammar() {
    assert!(validate_dependency_name("foo-bar_2.x").is_ok());
    assert!(validate_dependency_name("").is_err());
    assert!(validate_dependency_name("Foo").is_err());
    assert!(validate_dependency_name("foo:bar").is_err());
    assert!(validate_dependency_name("-foo").is_err());
}

#[test]
fn parse_project_manifest() {
    let manifest = ProjectManifest::from_toml_str(
        r#"
[settings]
timeout_secs = 900

[dependencies.foo]
source = "git@github.com:acme/foo.git"
"#,
    )
    .expect("manifest should parse");
    assert_eq!(
        manifest.source_for("foo"),
        Some("ssh://git@github.com/acme/foo.git")
    );
    assert_eq!(manifest.timeout(), Some(std::time::Duration::from_secs(900)));
    assert!(manifest.source_for("bar").is_none());
}

#[test]
fn project_manifest_rejects_zero_timeout_and_bad_names() {
    assert!(ProjectManifest::from_toml_str("[settings]\ntimeout_secs = 0\n").is_err());
    assert!(
        ProjectManifest::from_toml_str("[dependencies.Foo]\nsource = \"https://x.test/foo\"\n")
            .is_err()
    );
}
