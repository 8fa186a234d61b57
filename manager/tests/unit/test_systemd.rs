//! systemd unit management tests

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use webmgr::errors::ManagerError;
use webmgr::models::app::RunState;
use webmgr::services::systemd::SystemdService;
use webmgr::storage::layout::SystemPaths;

use crate::common::FakeRunner;

fn setup() -> (tempfile::TempDir, SystemPaths, Arc<FakeRunner>, SystemdService) {
    let tmp = tempfile::tempdir().unwrap();
    let paths = SystemPaths::under(tmp.path());
    let runner = FakeRunner::new();
    let systemd = SystemdService::new(paths.clone(), runner.clone(), "deploy");
    (tmp, paths, runner, systemd)
}

#[tokio::test]
async fn test_create_writes_unit_and_private_env_file() {
    let (_tmp, paths, runner, systemd) = setup();
    let env = BTreeMap::from([
        ("PORT".to_string(), "4000".to_string()),
        ("SECRET".to_string(), "s3cr\"t".to_string()),
    ]);

    systemd
        .create("api.test", "npm start", Path::new("/var/www/apps/api.test"), &env)
        .await
        .unwrap();

    let unit = paths.unit_file("api.test").read_string().await.unwrap();
    assert!(unit.contains("User=deploy"));
    assert!(unit.contains(r#"ExecStart=/bin/sh -c "cd /var/www/apps/api.test && exec npm start""#));

    let env_file = paths.env_file("api.test");
    assert_eq!(
        env_file.read_string().await.unwrap(),
        "PORT=\"4000\"\nSECRET=\"s3cr\\\"t\"\n"
    );
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = std::fs::metadata(env_file.path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
    assert_eq!(runner.executed(), vec!["systemctl daemon-reload"]);
}

#[tokio::test]
async fn test_status_and_restart() {
    let (_tmp, _paths, runner, systemd) = setup();
    assert_eq!(systemd.status("api.test").await.unwrap(), RunState::Unknown);

    systemd
        .create("api.test", "npm start", Path::new("/srv/api"), &BTreeMap::new())
        .await
        .unwrap();
    assert_eq!(systemd.status("api.test").await.unwrap(), RunState::Inactive);

    // Not running yet: restart starts it
    systemd.restart("api.test").await.unwrap();
    assert_eq!(runner.count("systemctl start api.test.service"), 1);
    assert_eq!(systemd.status("api.test").await.unwrap(), RunState::Active);

    systemd.restart("api.test").await.unwrap();
    assert_eq!(runner.count("systemctl restart api.test.service"), 1);

    systemd.stop("api.test").await.unwrap();
    assert_eq!(runner.unit_state("api.test"), RunState::Inactive);
}

#[tokio::test]
async fn test_failed_systemctl_is_a_supervisor_error() {
    let (_tmp, _paths, runner, systemd) = setup();
    runner.fail_once("systemctl enable");
    let err = systemd.enable("api.test").await.unwrap_err();
    assert!(matches!(err, ManagerError::SupervisorError(_)));
}

#[tokio::test]
async fn test_remove_deletes_unit_and_env() {
    let (_tmp, paths, runner, systemd) = setup();
    systemd
        .create("api.test", "npm start", Path::new("/srv/api"), &BTreeMap::new())
        .await
        .unwrap();
    systemd.start("api.test").await.unwrap();

    systemd.remove("api.test").await.unwrap();

    assert!(!systemd.exists("api.test").await);
    assert!(!paths.env_file("api.test").exists().await);
    assert_eq!(runner.unit_state("api.test"), RunState::Inactive);
    assert_eq!(runner.count("systemctl disable api.test.service"), 1);

    // Nothing left to stop the second time
    systemd.remove("api.test").await.unwrap();
    assert_eq!(runner.count("systemctl disable api.test.service"), 1);
}

#[tokio::test]
async fn test_logs_and_follow_command() {
    let (_tmp, _paths, runner, systemd) = setup();
    let logs = systemd.logs("api.test", 25).await.unwrap();
    assert!(logs.contains("Started web application"));
    assert_eq!(runner.executed(), vec!["journalctl -u api.test.service -n 25 --no-pager"]);
    assert_eq!(
        SystemdService::follow_command("api.test", 10),
        "journalctl -u api.test.service -n 10 -f"
    );
}
