//! Integration tests for Shipyard

mod cli_tests {
    use assert_cmd::{cargo::cargo_bin_cmd, Command};
    use predicates::prelude::*;
    use tempfile::TempDir;

    /// Isolated config and state directory per test
    struct Sandbox {
        dir: TempDir,
    }

    impl Sandbox {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            let state = dir.path().join("state");
            let config = format!(
                "[general]\naudit_log = false\nstate_dir = {:?}\n\n[scheduler]\nstart_grace_ms = 50\n",
                state.display().to_string()
            );
            std::fs::write(dir.path().join("config.toml"), config).unwrap();
            Self { dir }
        }

        fn shipyard(&self) -> Command {
            let mut cmd = cargo_bin_cmd!("shipyard");
            cmd.env("SHIPYARD_CONFIG", self.dir.path().join("config.toml"));
            cmd
        }

        fn source(&self) -> std::path::PathBuf {
            let source = self.dir.path().join("src");
            std::fs::create_dir_all(&source).unwrap();
            source
        }

        fn inline_app(&self, name: &str) {
            self.shipyard().args(["create", name]).assert().success();
            self.shipyard()
                .args([
                    "env",
                    name,
                    "set",
                    "BUILDPACK_URL=https://github.com/kr/heroku-buildpack-inline",
                ])
                .assert()
                .success();
        }
    }

    #[test]
    fn help_displays() {
        Sandbox::new()
            .shipyard()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("push"))
            .stdout(predicate::str::contains("scale"));
    }

    #[test]
    fn version_displays() {
        Sandbox::new()
            .shipyard()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("shipyard"));
    }

    #[test]
    fn config_path() {
        Sandbox::new()
            .shipyard()
            .args(["config", "path"])
            .assert()
            .success()
            .stdout(predicate::str::contains("config.toml"));
    }

    #[test]
    fn config_show() {
        Sandbox::new()
            .shipyard()
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[formation]"));
    }

    #[test]
    fn apps_empty() {
        Sandbox::new()
            .shipyard()
            .arg("apps")
            .assert()
            .success()
            .stdout(predicate::str::contains("No apps yet"));
    }

    #[test]
    fn create_and_list() {
        let sandbox = Sandbox::new();
        sandbox
            .shipyard()
            .args(["create", "my-app"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created my-app"));
        sandbox
            .shipyard()
            .arg("apps")
            .assert()
            .success()
            .stdout(predicate::str::contains("my-app"));
    }

    #[test]
    fn create_duplicate_fails() {
        let sandbox = Sandbox::new();
        sandbox.shipyard().args(["create", "twice"]).assert().success();
        sandbox
            .shipyard()
            .args(["create", "twice"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("App already exists"));
    }

    #[test]
    fn create_invalid_name_fails() {
        Sandbox::new()
            .shipyard()
            .args(["create", "Bad_Name"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid app name"));
    }

    #[test]
    fn delete_missing_app() {
        Sandbox::new()
            .shipyard()
            .args(["delete", "ghost", "-y"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("App not found"));
    }

    #[test]
    fn delete_with_yes() {
        let sandbox = Sandbox::new();
        sandbox.shipyard().args(["create", "doomed"]).assert().success();
        sandbox
            .shipyard()
            .args(["delete", "doomed", "-y"])
            .assert()
            .success();
        sandbox
            .shipyard()
            .arg("apps")
            .assert()
            .success()
            .stdout(predicate::str::contains("doomed").not());
    }

    #[test]
    fn env_set_and_show() {
        let sandbox = Sandbox::new();
        sandbox.shipyard().args(["create", "envy"]).assert().success();
        sandbox
            .shipyard()
            .args(["env", "envy", "set", "FOO=bar"])
            .assert()
            .success();
        sandbox
            .shipyard()
            .args(["env", "envy"])
            .assert()
            .success()
            .stdout(predicate::str::contains("FOO=bar"));
        sandbox
            .shipyard()
            .args(["env", "envy", "unset", "FOO"])
            .assert()
            .success();
        sandbox
            .shipyard()
            .args(["env", "envy"])
            .assert()
            .success()
            .stdout(predicate::str::contains("no environment variables"));
    }

    #[test]
    fn run_without_release_fails() {
        let sandbox = Sandbox::new();
        sandbox.shipyard().args(["create", "fresh"]).assert().success();
        sandbox
            .shipyard()
            .args(["run", "fresh", "--", "true"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No release found"));
    }

    #[test]
    fn scale_rejects_bad_assignment() {
        let sandbox = Sandbox::new();
        sandbox.shipyard().args(["create", "scaly"]).assert().success();
        sandbox
            .shipyard()
            .args(["scale", "scaly", "web"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid formation"));
    }

    #[test]
    fn push_missing_path_fails() {
        let sandbox = Sandbox::new();
        sandbox.inline_app("lost");
        sandbox
            .shipyard()
            .args(["push", "lost", "--path"])
            .arg(sandbox.dir.path().join("nowhere"))
            .assert()
            .failure()
            .stderr(predicate::str::contains("Path not found"));
    }

    #[test]
    fn push_empty_tree_then_releases() {
        let sandbox = Sandbox::new();
        sandbox.inline_app("empty-release");
        let source = sandbox.source();

        sandbox
            .shipyard()
            .args(["push", "empty-release", "--path"])
            .arg(&source)
            .assert()
            .success()
            .stdout(predicate::str::contains("-----> Building empty-release..."))
            .stdout(predicate::str::contains("=====> Application deployed"));

        sandbox
            .shipyard()
            .args(["releases", "empty-release"])
            .assert()
            .success()
            .stdout(predicate::str::contains("v1"));
    }

    #[cfg(unix)]
    #[test]
    fn run_uses_latest_release_and_exit_code() {
        let sandbox = Sandbox::new();
        sandbox.inline_app("runner");
        let source = sandbox.source();
        sandbox
            .shipyard()
            .args(["push", "runner", "--path"])
            .arg(&source)
            .assert()
            .success();

        sandbox
            .shipyard()
            .args(["run", "runner", "--", "echo", "foo"])
            .assert()
            .success()
            .stdout(predicate::str::contains("foo"));
        sandbox
            .shipyard()
            .args(["run", "runner", "--", "sh", "-c", "exit 3"])
            .assert()
            .code(3);
    }
}

#[cfg(unix)]
mod pipeline_tests {
    use serial_test::serial;
    use shipyard::build::{BUILDPACK_URL_VAR, INLINE_BUILDPACK_URL};
    use shipyard::config::{Config, StateLayout};
    use shipyard::events::EventFilter;
    use shipyard::gateway::PushGateway;
    use shipyard::release::Formation;
    use shipyard::scheduler::JobState;
    use shipyard::transcript::Transcript;
    use shipyard::ShipyardError;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    struct Pipeline {
        _state: TempDir,
        source: TempDir,
        gateway: Arc<PushGateway>,
    }

    async fn pipeline() -> Pipeline {
        let state = TempDir::new().unwrap();
        let source = TempDir::new().unwrap();
        let mut config = Config::default();
        config.general.audit_log = false;
        config.scheduler.start_grace_ms = 50;
        config.formation.converge_timeout_secs = 10;
        config.formation.retry_initial_ms = 20;

        let gateway = PushGateway::open(&config, &StateLayout::new(state.path()))
            .await
            .unwrap();
        Pipeline {
            _state: state,
            source,
            gateway: Arc::new(gateway),
        }
    }

    async fn inline_app(gateway: &PushGateway, name: &str) {
        gateway.create_app(name).await.unwrap();
        gateway
            .set_env(
                name,
                vec![(BUILDPACK_URL_VAR.to_string(), INLINE_BUILDPACK_URL.to_string())],
            )
            .await
            .unwrap();
    }

    fn write_compile(source: &Path, body: &str) {
        let bin = source.join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let script = bin.join("compile");
        std::fs::write(&script, format!("#!/bin/sh\n{}\n", body)).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    async fn push(p: &Pipeline, name: &str) -> Transcript {
        let transcript = Transcript::new();
        p.gateway
            .push(name, p.source.path(), &transcript)
            .await
            .unwrap();
        transcript
    }

    #[tokio::test]
    #[serial]
    async fn build_cache_counts_hits() {
        let p = pipeline().await;
        inline_app(&p.gateway, "build-cache").await;

        assert!(!push(&p, "build-cache").await.contains("cached"));
        assert!(push(&p, "build-cache").await.contains("cached: 0"));
        assert!(push(&p, "build-cache").await.contains("cached: 1"));
        p.gateway.shutdown().await;
    }

    #[tokio::test]
    #[serial]
    async fn recreated_app_starts_cold() {
        let p = pipeline().await;
        inline_app(&p.gateway, "phoenix").await;
        push(&p, "phoenix").await;
        assert!(push(&p, "phoenix").await.contains("cached: 0"));

        p.gateway.delete_app("phoenix").await.unwrap();
        inline_app(&p.gateway, "phoenix").await;

        assert!(!push(&p, "phoenix").await.contains("cached"));
        assert!(push(&p, "phoenix").await.contains("cached: 0"));
        assert_eq!(p.gateway.releases("phoenix").await.unwrap().len(), 2);
        p.gateway.shutdown().await;
    }

    #[tokio::test]
    #[serial]
    async fn empty_release_runs_one_off() {
        let p = pipeline().await;
        inline_app(&p.gateway, "empty-release").await;
        push(&p, "empty-release").await;

        let output = Mutex::new(Vec::new());
        let collect = |line: String| output.lock().unwrap().push(line);
        let code = p
            .gateway
            .run("empty-release", vec!["echo".into(), "foo".into()], &collect)
            .await
            .unwrap();

        assert_eq!(code, 0);
        assert_eq!(*output.lock().unwrap(), vec!["foo".to_string()]);
    }

    #[tokio::test]
    #[serial]
    async fn compile_reads_env_dir() {
        let p = pipeline().await;
        write_compile(p.source.path(), "cat \"$3/FOO\"; echo");
        inline_app(&p.gateway, "env-dir").await;
        p.gateway
            .set_env("env-dir", vec![("FOO".into(), "bar".into())])
            .await
            .unwrap();

        let transcript = push(&p, "env-dir").await;
        assert!(transcript.lines().iter().any(|l| l.trim() == "bar"));
    }

    #[tokio::test]
    #[serial]
    async fn web_job_comes_up_before_deploy_finishes() {
        let p = pipeline().await;
        std::fs::write(p.source.path().join("Procfile"), "web: sleep 30\n").unwrap();
        inline_app(&p.gateway, "watched").await;

        let mut events = p
            .gateway
            .subscribe("watched", EventFilter::process_type("web"))
            .await
            .unwrap();
        let transcript = push(&p, "watched").await;

        let lines = transcript.lines();
        assert_eq!(lines.last().unwrap(), "=====> Application deployed");
        assert!(transcript.contains("Added default web=1 formation"));

        let mut seen = Vec::new();
        for _ in 0..3 {
            seen.push(events.recv().await.unwrap().unwrap().state);
        }
        assert_eq!(seen, vec![JobState::Pending, JobState::Starting, JobState::Up]);

        let jobs = p.gateway.ps("watched").await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert!(jobs[0].port.is_some());
        p.gateway.shutdown().await;
    }

    #[tokio::test]
    #[serial]
    async fn scale_without_rebuild() {
        let p = pipeline().await;
        std::fs::write(p.source.path().join("Procfile"), "web: sleep 30\n").unwrap();
        inline_app(&p.gateway, "scaler").await;
        push(&p, "scaler").await;

        let (_, formation) = p
            .gateway
            .scale("scaler", &Formation::parse(["web=0"]).unwrap())
            .await
            .unwrap();
        assert_eq!(formation.get("web"), 0);
        assert!(p
            .gateway
            .ps("scaler")
            .await
            .unwrap()
            .iter()
            .all(|j| !j.state.is_active()));

        let (release, _) = p
            .gateway
            .scale("scaler", &Formation::parse(["web=1"]).unwrap())
            .await
            .unwrap();
        assert_eq!(release.version, 1);
        assert_eq!(p.gateway.releases("scaler").await.unwrap().len(), 1);
        let up = p
            .gateway
            .ps("scaler")
            .await
            .unwrap()
            .iter()
            .filter(|j| j.state == JobState::Up)
            .count();
        assert_eq!(up, 1);
        p.gateway.shutdown().await;
    }

    #[tokio::test]
    #[serial]
    async fn second_push_during_build_is_rejected() {
        let p = pipeline().await;
        write_compile(p.source.path(), "sleep 2");
        inline_app(&p.gateway, "busy").await;

        let first = {
            let gateway = Arc::clone(&p.gateway);
            let source = p.source.path().to_path_buf();
            tokio::spawn(async move { gateway.push("busy", &source, &Transcript::new()).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        let err = p
            .gateway
            .push("busy", p.source.path(), &Transcript::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ShipyardError::BuildInProgress(_)));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    #[serial]
    async fn crashing_worker_does_not_block_deploy() {
        let p = pipeline().await;
        std::fs::write(p.source.path().join("Procfile"), "web: sleep 30\nworker: sleep 30\n").unwrap();
        inline_app(&p.gateway, "iso").await;
        push(&p, "iso").await;
        p.gateway
            .scale("iso", &Formation::parse(["worker=1"]).unwrap())
            .await
            .unwrap();

        std::fs::write(p.source.path().join("Procfile"), "web: sleep 30\nworker: exit 1\n").unwrap();
        let transcript = push(&p, "iso").await;
        assert!(transcript.contains("worker=1 not up yet"));
        assert!(transcript.contains("Application deployed"));

        let releases = p.gateway.releases("iso").await.unwrap();
        assert_eq!(releases.len(), 2);
        let v2 = releases.iter().find(|r| r.version == 2).unwrap();
        let web_up = p
            .gateway
            .ps("iso")
            .await
            .unwrap()
            .iter()
            .filter(|j| {
                j.release_id == v2.id && j.process_type == "web" && j.state == JobState::Up
            })
            .count();
        assert_eq!(web_up, 1);
        p.gateway.shutdown().await;
    }

    #[tokio::test]
    #[serial]
    async fn delete_during_compile_cancels_push() {
        let p = pipeline().await;
        write_compile(p.source.path(), "echo compiling; sleep 5");
        inline_app(&p.gateway, "doomed").await;

        let transcript = Arc::new(Transcript::new());
        let first = {
            let (gateway, transcript) = (Arc::clone(&p.gateway), Arc::clone(&transcript));
            let source = p.source.path().to_path_buf();
            tokio::spawn(async move { gateway.push("doomed", &source, &transcript).await })
        };
        while !transcript.contains("compiling") {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let started = std::time::Instant::now();
        p.gateway.delete_app("doomed").await.unwrap();
        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, ShipyardError::BuildCancelled(_)));
        assert!(started.elapsed() < std::time::Duration::from_secs(4));

        write_compile(p.source.path(), "true");
        inline_app(&p.gateway, "doomed").await;
        let transcript = push(&p, "doomed").await;
        assert!(!transcript.contains("cached"));
        assert_eq!(p.gateway.releases("doomed").await.unwrap().len(), 1);
    }
}
