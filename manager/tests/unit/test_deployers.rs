//! Archetype deployer tests

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use webmgr::deploy::deployer::AppDeployer;
use webmgr::errors::{BuildStage, ManagerError};
use webmgr::filesys::dir::Dir;
use webmgr::models::app::{AppType, ApplicationRecord};

use crate::common::{spec, FakeRunner, FASTAPI_FILES, NEXT_FILES};

async fn tree(files: &[(&str, &str)]) -> (tempfile::TempDir, Dir) {
    let tmp = tempfile::tempdir().unwrap();
    let dir = Dir::new(tmp.path().join("src"));
    for (path, contents) in files {
        dir.file(path).write_string(contents).await.unwrap();
    }
    (tmp, dir)
}

fn record(app_type: AppType, port: u16) -> ApplicationRecord {
    ApplicationRecord::new(
        &spec("app.test", app_type, "/srv/app", port),
        PathBuf::from("/var/www/apps/app.test"),
    )
}

fn deployer(runner: &Arc<FakeRunner>, app_type: AppType) -> AppDeployer {
    AppDeployer::for_type(app_type, runner.clone(), Duration::from_secs(30))
}

#[tokio::test]
async fn test_nextjs_installs_builds_and_starts_on_port() {
    let runner = FakeRunner::new();
    let (_tmp, dir) = tree(NEXT_FILES).await;
    let mut record = record(AppType::Nextjs, 3100);
    record.env_vars = BTreeMap::from([("API_URL".to_string(), "https://api.test".to_string())]);

    let result = deployer(&runner, AppType::Nextjs).prepare(&dir, &record).await.unwrap();

    assert_eq!(
        result.start_command.as_deref(),
        Some("./node_modules/.bin/next start --port 3100")
    );
    assert_eq!(result.environment.get("PORT").map(String::as_str), Some("3100"));
    assert_eq!(result.environment.get("NODE_ENV").map(String::as_str), Some("production"));
    assert_eq!(result.environment.get("API_URL").map(String::as_str), Some("https://api.test"));
    // A lockfile selects a clean install, with devDependencies for the build
    assert_eq!(runner.executed(), vec!["npm ci --include=dev", "npm run build"]);
}

#[tokio::test]
async fn test_nextjs_without_manifest_is_an_env_error() {
    let runner = FakeRunner::new();
    let (_tmp, dir) = tree(&[("index.html", "<html></html>")]).await;

    let err = deployer(&runner, AppType::Nextjs)
        .prepare(&dir, &record(AppType::Nextjs, 3100))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::BuildError { stage: BuildStage::Env, .. }));
}

#[tokio::test]
async fn test_build_failure_carries_stage_and_output() {
    let runner = FakeRunner::new();
    runner.fail_once("npm run build");
    let (_tmp, dir) = tree(NEXT_FILES).await;

    let err = deployer(&runner, AppType::Nextjs)
        .prepare(&dir, &record(AppType::Nextjs, 3100))
        .await
        .unwrap_err();
    match err {
        ManagerError::BuildError { stage, output_tail, .. } => {
            assert_eq!(stage, BuildStage::Build);
            assert_eq!(output_tail, "simulated failure");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_fastapi_prepare_is_idempotent() {
    let runner = FakeRunner::new();
    let (_tmp, dir) = tree(FASTAPI_FILES).await;
    let record = record(AppType::Fastapi, 8001);
    let fastapi = deployer(&runner, AppType::Fastapi);

    let first = fastapi.prepare(&dir, &record).await.unwrap();
    let second = fastapi.prepare(&dir, &record).await.unwrap();

    assert_eq!(first, second);
    assert_eq!(
        first.start_command.as_deref(),
        Some(".venv/bin/python -m uvicorn main:app --host 127.0.0.1 --port 8001")
    );
    assert_eq!(runner.count("-m venv"), 1);
    assert_eq!(runner.count("pip install -r requirements.txt"), 2);
    assert_eq!(
        first.environment.get("PYTHONPATH").map(String::as_str),
        Some("/var/www/apps/app.test")
    );
    assert!(first.environment["PATH"].starts_with("/var/www/apps/app.test/.venv/bin:"));
}

#[tokio::test]
async fn test_fastapi_loads_dotenv_and_finds_package_module() {
    let runner = FakeRunner::new();
    let (_tmp, dir) = tree(&[
        ("app/main.py", "app = None\n"),
        (".env", "DATABASE_URL=\"sqlite:///db\"\n"),
    ])
    .await;

    let result = deployer(&runner, AppType::Fastapi)
        .prepare(&dir, &record(AppType::Fastapi, 8001))
        .await
        .unwrap();

    assert!(result.start_command.unwrap().contains("uvicorn app.main:app"));
    assert_eq!(result.environment.get("DATABASE_URL").map(String::as_str), Some("sqlite:///db"));
    assert_eq!(runner.count("pip install fastapi"), 1);
}

#[tokio::test]
async fn test_nodejs_start_command_detection() {
    let runner = FakeRunner::new();
    let (_tmp, scripted) = tree(&[("package.json", r#"{"scripts": {"start": "node app.js"}}"#)]).await;
    let result = deployer(&runner, AppType::Nodejs)
        .prepare(&scripted, &record(AppType::Nodejs, 4000))
        .await
        .unwrap();
    assert_eq!(result.start_command.as_deref(), Some("npm start"));
    assert_eq!(runner.executed(), vec!["npm install --omit=dev"]);

    let (_tmp, bare) = tree(&[("package.json", "{}"), ("server.js", "listen()")]).await;
    let result = deployer(&runner, AppType::Nodejs)
        .prepare(&bare, &record(AppType::Nodejs, 4000))
        .await
        .unwrap();
    assert_eq!(result.start_command.as_deref(), Some("node server.js"));

    let (_tmp, empty) = tree(&[("package.json", "{}")]).await;
    let err = deployer(&runner, AppType::Nodejs)
        .prepare(&empty, &record(AppType::Nodejs, 4000))
        .await
        .unwrap_err();
    assert!(matches!(err, ManagerError::BuildError { stage: BuildStage::Build, .. }));
}

#[tokio::test]
async fn test_static_document_root() {
    let runner = FakeRunner::new();
    let (_tmp, dir) = tree(&[("dist/index.html", "<html></html>")]).await;

    let result = deployer(&runner, AppType::Static)
        .prepare(&dir, &record(AppType::Static, 9001))
        .await
        .unwrap();
    assert!(result.start_command.is_none());
    assert_eq!(
        result.document_root,
        Some(PathBuf::from("/var/www/apps/app.test/dist"))
    );
    assert!(runner.executed().is_empty());

    let (_tmp, empty) = tree(&[("README.md", "nothing to serve")]).await;
    assert!(deployer(&runner, AppType::Static)
        .prepare(&empty, &record(AppType::Static, 9001))
        .await
        .is_err());
}
