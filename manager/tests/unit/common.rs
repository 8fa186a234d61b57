//! Shared fixtures: a scripted command runner and a sandboxed orchestrator

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tempfile::TempDir;

use webmgr::app::options::AppOptions;
use webmgr::app::run::build_orchestrator_with;
use webmgr::cmd::{CommandOutput, CommandRunner, CommandSpec};
use webmgr::deploy::cancel::CancelToken;
use webmgr::deploy::orchestrator::Orchestrator;
use webmgr::errors::ManagerError;
use webmgr::models::app::{AppSpec, AppType, RunState};

pub const SHOP_REPO: &str = "https://github.com/acme/shop.git";
pub const SHOP_SSH: &str = "git@github.com:acme/shop.git";

pub const NEXT_FILES: &[(&str, &str)] = &[
    (
        "package.json",
        r#"{"dependencies": {"next": "14.2.0", "react": "18.3.0"}, "scripts": {"build": "next build", "start": "next start"}}"#,
    ),
    ("package-lock.json", "{}"),
    ("pages/index.js", "export default () => 'shop'"),
];

pub const FASTAPI_FILES: &[(&str, &str)] = &[
    ("main.py", "from fastapi import FastAPI\napp = FastAPI()\n"),
    ("requirements.txt", "fastapi\nuvicorn\n"),
];

#[derive(Clone)]
struct Branch {
    files: Vec<(String, String)>,
    commit: String,
}

struct Rule {
    pattern: String,
    skip: usize,
    times: usize,
    time_out: bool,
}

#[derive(Default)]
struct FakeState {
    remotes: HashMap<String, HashMap<String, Branch>>,
    units: HashMap<String, RunState>,
    crash_next_start: HashSet<String>,
    hang_next_start: HashSet<String>,
    rules: Vec<Rule>,
    cancel_hooks: Vec<(String, CancelToken)>,
    executed: Vec<String>,
    commits: usize,
}

/// Simulates git, npm, python, nginx and systemd against the sandbox filesystem
#[derive(Default)]
pub struct FakeRunner {
    state: Mutex<FakeState>,
}

impl FakeRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Publish `files` as the newest revision of `branch` on `remote`; returns its commit
    pub fn push(&self, remote: &str, branch: &str, files: &[(&str, &str)]) -> String {
        let mut state = self.lock();
        state.commits += 1;
        let commit = format!("abc{:04}", state.commits);
        let branch_state = Branch {
            files: files.iter().map(|(p, c)| (p.to_string(), c.to_string())).collect(),
            commit: commit.clone(),
        };
        state
            .remotes
            .entry(remote.to_string())
            .or_default()
            .insert(branch.to_string(), branch_state);
        commit
    }

    /// Commands containing `pattern` fail `times` times after `skip` successful runs
    pub fn fail_after(&self, pattern: &str, skip: usize, times: usize) {
        self.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            skip,
            times,
            time_out: false,
        });
    }

    /// The next command containing `pattern` runs past its time limit
    pub fn time_out_once(&self, pattern: &str) {
        self.lock().rules.push(Rule {
            pattern: pattern.to_string(),
            skip: 0,
            times: 1,
            time_out: true,
        });
    }

    pub fn fail_once(&self, pattern: &str) {
        self.fail_after(pattern, 0, 1);
    }

    pub fn fail_always(&self, pattern: &str) {
        self.fail_after(pattern, 0, usize::MAX);
    }

    /// Cancel `token` when a command containing `pattern` runs
    pub fn cancel_on(&self, pattern: &str, token: &CancelToken) {
        self.lock().cancel_hooks.push((pattern.to_string(), token.clone()));
    }

    /// The next start or restart of the unit leaves it failed
    pub fn crash_next_start(&self, domain: &str) {
        self.lock().crash_next_start.insert(domain.to_string());
    }

    /// The next start or restart of the unit never gets past activating
    pub fn hang_next_start(&self, domain: &str) {
        self.lock().hang_next_start.insert(domain.to_string());
    }

    pub fn unit_state(&self, domain: &str) -> RunState {
        self.lock().units.get(domain).copied().unwrap_or(RunState::Inactive)
    }

    pub fn executed(&self) -> Vec<String> {
        self.lock().executed.clone()
    }

    pub fn count(&self, pattern: &str) -> usize {
        self.lock().executed.iter().filter(|c| c.contains(pattern)).count()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput, ManagerError> {
        let mut state = self.lock();
        state.executed.push(spec.command.clone());

        for (pattern, token) in &state.cancel_hooks {
            if spec.command.contains(pattern.as_str()) {
                token.cancel();
            }
        }

        if let Some(rule) = state
            .rules
            .iter_mut()
            .find(|r| spec.command.contains(r.pattern.as_str()) && (r.skip > 0 || r.times > 0))
        {
            if rule.skip > 0 {
                rule.skip -= 1;
            } else {
                rule.times -= 1;
                if rule.time_out {
                    return Err(ManagerError::TimedOut(format!("`{}` did not finish", spec.command)));
                }
                return Ok(failed(1, "simulated failure"));
            }
        }

        let words: Vec<&str> = spec.command.split_whitespace().collect();
        let cwd = spec.cwd.clone().unwrap_or_default();
        let output = match words.as_slice() {
            ["git", "clone", "--depth", "1", "--branch", branch, remote, dest] => {
                match state.branch(remote, branch) {
                    Some(found) => {
                        checkout(Path::new(dest), remote, &found);
                        ok("")
                    }
                    None => failed(128, &format!("fatal: Remote branch {} not found in upstream origin", branch)),
                }
            }
            ["git", "-C", dir, "fetch", ..] => {
                let dir = Path::new(dir);
                let origin = read(dir, ".git/origin");
                let _ = fs::remove_dir_all(dir.join(".git/refs/remotes"));
                for (branch, found) in state.remotes.get(&origin).into_iter().flatten() {
                    write(dir, &format!(".git/refs/remotes/origin/{}", branch), &found.commit);
                }
                ok("")
            }
            ["git", "-C", dir, "rev-parse", "--verify", "--quiet", reference] => {
                match fs::read_to_string(Path::new(dir).join(".git").join(reference)) {
                    Ok(commit) => ok(&format!("{}\n", commit)),
                    Err(_) => failed(1, ""),
                }
            }
            ["git", "-C", dir, "reset", "--hard", target] => {
                let origin = read(Path::new(dir), ".git/origin");
                let branch = target.trim_start_matches("origin/");
                match state.branch(&origin, branch) {
                    Some(found) => {
                        checkout(Path::new(dir), &origin, &found);
                        ok("")
                    }
                    None => failed(128, "fatal: ambiguous argument"),
                }
            }
            ["git", "-C", dir, "rev-parse", ..] => ok(&format!("{}\n", read(Path::new(dir), ".git/HEAD"))),
            ["git", "-C", dir, "remote", "get-url", "origin"] => {
                ok(&format!("{}\n", read(Path::new(dir), ".git/origin")))
            }
            ["npm", "ci" | "install", ..] => {
                write(&cwd, "node_modules/.installed", "ok");
                ok("added 42 packages")
            }
            ["npm", "run", "build"] => {
                write(&cwd, ".next/BUILD_ID", "build");
                ok("Compiled successfully")
            }
            ["python3", "-m", "venv", venv] => {
                let bin = cwd.join(venv).join("bin");
                write(&bin, "python", "#!python");
                write(&bin, "pip", &format!("#!{}\nimport pip\n", bin.join("python").display()));
                write(&bin, "activate", &format!("VIRTUAL_ENV=\"{}\"\nexport VIRTUAL_ENV\n", cwd.join(venv).display()));
                ok("")
            }
            [_, "-m", "pip", ..] => ok("Successfully installed"),
            ["nginx", "-t"] => CommandOutput {
                exit_code: 0,
                stdout: String::new(),
                stderr: "nginx: configuration file /etc/nginx/nginx.conf test is successful\n".to_string(),
            },
            ["systemctl", "is-active", unit] => {
                let state = state.units.get(domain_of(unit)).copied().unwrap_or(RunState::Inactive);
                let text = state.to_string();
                CommandOutput {
                    exit_code: if state == RunState::Active { 0 } else { 3 },
                    stdout: format!("{}\n", text),
                    stderr: String::new(),
                }
            }
            ["systemctl", "start" | "restart", unit] => {
                let domain = domain_of(unit).to_string();
                let next = if state.crash_next_start.remove(&domain) {
                    RunState::Failed
                } else if state.hang_next_start.remove(&domain) {
                    RunState::Activating
                } else {
                    RunState::Active
                };
                state.units.insert(domain, next);
                ok("")
            }
            ["systemctl", "stop", unit] => {
                state.units.insert(domain_of(unit).to_string(), RunState::Inactive);
                ok("")
            }
            ["systemctl", ..] => ok(""),
            ["journalctl", ..] => ok("Started web application\nListening on 127.0.0.1\n"),
            ["command", "-v", tool] => ok(&format!("/usr/bin/{}\n", tool)),
            _ => ok(""),
        };
        Ok(output)
    }
}

impl FakeState {
    fn branch(&self, remote: &str, branch: &str) -> Option<Branch> {
        self.remotes.get(remote)?.get(branch).cloned()
    }
}

fn domain_of(unit: &str) -> &str {
    unit.trim_end_matches(".service")
}

fn ok(stdout: &str) -> CommandOutput {
    CommandOutput {
        exit_code: 0,
        stdout: stdout.to_string(),
        stderr: String::new(),
    }
}

fn failed(exit_code: i32, stderr: &str) -> CommandOutput {
    CommandOutput {
        exit_code,
        stdout: String::new(),
        stderr: format!("{}\n", stderr),
    }
}

fn checkout(dir: &Path, remote: &str, branch: &Branch) {
    for (path, contents) in &branch.files {
        write(dir, path, contents);
    }
    write(dir, ".git/origin", remote);
    write(dir, ".git/HEAD", &branch.commit);
}

fn write(dir: &Path, relative: &str, contents: &str) {
    let path = dir.join(relative);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, contents).unwrap();
}

fn read(dir: &Path, relative: &str) -> String {
    fs::read_to_string(dir.join(relative)).unwrap_or_default()
}

/// Orchestrator over a temporary host root and a [`FakeRunner`]
pub struct Sandbox {
    pub tmp: TempDir,
    pub runner: Arc<FakeRunner>,
    pub orchestrator: Orchestrator,
}

impl Sandbox {
    pub async fn new() -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let runner = FakeRunner::new();

        let mut options = AppOptions::under(tmp.path().join("root"));
        options.console_progress = false;
        options.settings.verify_port_binding = false;
        options.settings.health_timeout_secs = 1;
        options.settings.health_poll_interval_ms = 10;

        let orchestrator = build_orchestrator_with(&options, runner.clone());
        orchestrator.setup().await.unwrap();
        Self {
            tmp,
            runner,
            orchestrator,
        }
    }

    /// A local source directory holding `files`
    pub fn local_source(&self, name: &str, files: &[(&str, &str)]) -> PathBuf {
        let dir = self.tmp.path().join("sources").join(name);
        for (path, contents) in files {
            write(&dir, path, contents);
        }
        dir
    }

    /// Every host artifact of `domain` with its contents
    pub fn artifacts(&self, domain: &str) -> BTreeMap<PathBuf, String> {
        let mut tree = BTreeMap::new();
        for path in self.orchestrator.paths().artifacts(domain) {
            collect(&path, &mut tree);
        }
        tree
    }
}

fn collect(path: &Path, tree: &mut BTreeMap<PathBuf, String>) {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.file_type().is_symlink() => {
            let target = fs::read_link(path).unwrap();
            tree.insert(path.to_path_buf(), format!("-> {}", target.display()));
        }
        Ok(meta) if meta.is_dir() => {
            tree.insert(path.to_path_buf(), "<dir>".to_string());
            for entry in fs::read_dir(path).unwrap() {
                collect(&entry.unwrap().path(), tree);
            }
        }
        Ok(_) => {
            tree.insert(path.to_path_buf(), fs::read_to_string(path).unwrap_or_default());
        }
        Err(_) => {}
    }
}

pub fn spec(domain: &str, app_type: AppType, source: &str, port: u16) -> AppSpec {
    AppSpec {
        domain: domain.to_string(),
        app_type,
        source: source.to_string(),
        branch: "main".to_string(),
        port,
        build_command: None,
        start_command: None,
        env_vars: BTreeMap::new(),
    }
}
