//! Source fetching tests

use std::time::Duration;

use webmgr::deploy::git::{SourceFetcher, SourceLocator};
use webmgr::errors::ManagerError;
use webmgr::filesys::dir::Dir;
use webmgr::models::deployment::SourceProtocol;

use crate::common::{FakeRunner, NEXT_FILES, SHOP_REPO, SHOP_SSH};

fn fetcher(runner: &std::sync::Arc<FakeRunner>) -> SourceFetcher {
    SourceFetcher::new(runner.clone(), Duration::from_secs(5))
}

#[tokio::test]
async fn test_ssh_falls_back_to_https() {
    let runner = FakeRunner::new();
    let commit = runner.push(SHOP_REPO, "main", NEXT_FILES);
    let tmp = tempfile::tempdir().unwrap();
    let dest = Dir::new(tmp.path().join("shop"));

    let locator = SourceLocator::parse(SHOP_SSH).unwrap();
    let source = fetcher(&runner).fetch(&locator, "main", &dest).await.unwrap();

    assert_eq!(source.protocol, SourceProtocol::Https);
    assert!(source.protocol_substituted);
    assert!(!source.branch_substituted);
    assert_eq!(source.commit.as_deref(), Some(commit.as_str()));
    assert_eq!(
        source.attempts,
        vec!["ssh:main", "ssh:master", "ssh:develop", "ssh:dev", "https:main"]
    );
    assert!(dest.file("package.json").exists().await);
}

#[tokio::test]
async fn test_missing_branch_falls_back_to_master() {
    let runner = FakeRunner::new();
    runner.push(SHOP_REPO, "master", NEXT_FILES);
    let tmp = tempfile::tempdir().unwrap();
    let dest = Dir::new(tmp.path().join("shop"));

    let locator = SourceLocator::parse(SHOP_REPO).unwrap();
    let source = fetcher(&runner).fetch(&locator, "main", &dest).await.unwrap();

    assert_eq!(source.branch.as_deref(), Some("master"));
    assert!(source.branch_substituted);
    assert!(!source.protocol_substituted);
    assert_eq!(source.attempts, vec!["https:main", "https:master"]);
}

#[tokio::test]
async fn test_unavailable_source_lists_every_attempt() {
    let runner = FakeRunner::new();
    let tmp = tempfile::tempdir().unwrap();
    let dest = Dir::new(tmp.path().join("shop"));

    let locator = SourceLocator::parse(SHOP_SSH).unwrap();
    let err = fetcher(&runner).fetch(&locator, "release", &dest).await.unwrap_err();

    match err {
        ManagerError::SourceUnavailable { attempts } => {
            assert_eq!(attempts.len(), 10);
            assert_eq!(attempts.first().map(String::as_str), Some("ssh:release"));
            assert_eq!(attempts.last().map(String::as_str), Some("https:dev"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!dest.exists().await);
}

#[tokio::test]
async fn test_local_source_is_copied() {
    let runner = FakeRunner::new();
    let tmp = tempfile::tempdir().unwrap();
    let source_dir = Dir::new(tmp.path().join("site"));
    source_dir.file("index.html").write_string("<h1>hi</h1>").await.unwrap();
    let dest = Dir::new(tmp.path().join("copy"));

    let locator = SourceLocator::parse(&source_dir.path().display().to_string()).unwrap();
    let source = fetcher(&runner).fetch(&locator, "main", &dest).await.unwrap();

    assert_eq!(source.protocol, SourceProtocol::Local);
    assert!(source.branch.is_none());
    assert_eq!(dest.file("index.html").read_string().await.unwrap(), "<h1>hi</h1>");
    assert!(runner.executed().is_empty());

    let missing = SourceLocator::parse(&tmp.path().join("nope").display().to_string()).unwrap();
    let err = fetcher(&runner).fetch(&missing, "main", &dest).await.unwrap_err();
    assert!(matches!(err, ManagerError::SourceUnavailable { .. }));
}

#[tokio::test]
async fn test_refresh_moves_clone_to_newest_commit() {
    let runner = FakeRunner::new();
    runner.push(SHOP_REPO, "main", NEXT_FILES);
    let tmp = tempfile::tempdir().unwrap();
    let dest = Dir::new(tmp.path().join("shop"));
    let locator = SourceLocator::parse(SHOP_REPO).unwrap();
    fetcher(&runner).fetch(&locator, "main", &dest).await.unwrap();

    let newer = runner.push(SHOP_REPO, "main", &[("pages/about.js", "about")]);
    let source = fetcher(&runner).refresh(&dest, "main").await.unwrap();

    assert_eq!(source.commit.as_deref(), Some(newer.as_str()));
    assert_eq!(source.protocol, SourceProtocol::Https);
    assert!(dest.file("pages/about.js").exists().await);
    assert_eq!(runner.count("fetch --depth 1 --prune origin"), 1);
    assert_eq!(runner.count("reset --hard origin/main"), 1);
    assert_eq!(runner.count("ls-remote"), 0);
}

#[tokio::test]
async fn test_refresh_checks_fallback_branches_after_one_fetch() {
    let runner = FakeRunner::new();
    runner.push(SHOP_REPO, "main", NEXT_FILES);
    let tmp = tempfile::tempdir().unwrap();
    let dest = Dir::new(tmp.path().join("shop"));
    let locator = SourceLocator::parse(SHOP_REPO).unwrap();
    fetcher(&runner).fetch(&locator, "main", &dest).await.unwrap();

    let fallback = fetcher(&runner).refresh(&dest, "missing").await.unwrap();

    assert_eq!(fallback.branch.as_deref(), Some("main"));
    assert!(fallback.branch_substituted);
    assert_eq!(fallback.attempts, vec!["https:missing", "https:main"]);
    assert_eq!(runner.count(" fetch "), 1);
    assert_eq!(runner.count("rev-parse --verify --quiet refs/remotes/origin/missing"), 1);
    assert_eq!(runner.count("rev-parse --verify --quiet refs/remotes/origin/main"), 1);
}

#[tokio::test]
async fn test_refresh_fails_when_no_candidate_exists() {
    let runner = FakeRunner::new();
    runner.push(SHOP_REPO, "trunk", NEXT_FILES);
    let tmp = tempfile::tempdir().unwrap();
    let dest = Dir::new(tmp.path().join("shop"));
    let locator = SourceLocator::parse(SHOP_REPO).unwrap();
    fetcher(&runner).fetch(&locator, "trunk", &dest).await.unwrap();

    let err = fetcher(&runner).refresh(&dest, "release").await.unwrap_err();
    match err {
        ManagerError::SourceUnavailable { attempts } => assert_eq!(
            attempts,
            vec!["https:release", "https:main", "https:master", "https:develop", "https:dev"]
        ),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runner.count(" fetch "), 1);
    assert_eq!(runner.count("reset --hard"), 0);
    assert!(dest.file("package.json").exists().await);
}

#[tokio::test]
async fn test_refresh_fails_when_origin_is_unreachable() {
    let runner = FakeRunner::new();
    runner.push(SHOP_REPO, "main", NEXT_FILES);
    let tmp = tempfile::tempdir().unwrap();
    let dest = Dir::new(tmp.path().join("shop"));
    let locator = SourceLocator::parse(SHOP_REPO).unwrap();
    fetcher(&runner).fetch(&locator, "main", &dest).await.unwrap();

    runner.fail_always(" fetch ");
    let err = fetcher(&runner).refresh(&dest, "main").await.unwrap_err();
    match err {
        ManagerError::SourceUnavailable { attempts } => assert_eq!(attempts.len(), 4),
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runner.count("rev-parse --verify"), 0);
    assert!(dest.file("package.json").exists().await);
}
