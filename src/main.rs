use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use shipyard::build::{BuildError, BuildEvent, BuildOptions, Orchestrator, spawn_build};
use shipyard::config::{self, Config};
use shipyard::docker::{CancelToken, DockerCli};
use shipyard::queue::{BuildInfo, BuildTask, Commit};
use shipyard::recipe;
use shipyard::repo::{EnvVars, Repo};
use shipyard::script;

/// Exit status for failures of the build system itself.
const SYSTEM_FAILURE: u8 = 2;

#[derive(Parser)]
#[command(name = "shipyard", version, about)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run a script in a disposable container
    Run {
        #[command(flatten)]
        target: Target,
        /// Checked-out source tree copied into the image
        #[arg(long, value_name = "DIR")]
        source: Option<PathBuf>,
        /// Config file. Defaults to .shipyard.yml in the current directory
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,
        /// Print the build report as JSON instead of the log
        #[arg(long)]
        json: bool,
    },
    /// Print the recipe a build would use
    Recipe {
        #[command(flatten)]
        target: Target,
    },
}

#[derive(Args)]
struct Target {
    /// Build script YAML
    #[arg(long, value_name = "FILE")]
    script: PathBuf,
    /// Repository location (path or remote URL)
    #[arg(long, default_value = ".")]
    repo: String,
    /// Checkout path inside the container
    #[arg(long)]
    workdir: Option<String>,
    /// Owner opted into privileged builds
    #[arg(long)]
    privileged: bool,
    /// Pull request that triggered the build
    #[arg(long, env = "DRONE_PR")]
    pull_request: Option<String>,
    /// Repository parameter, repeatable
    #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param)]
    params: Vec<(String, String)>,
    #[arg(long, default_value = "")]
    commit: String,
    #[arg(long, default_value = "")]
    branch: String,
    #[arg(long, default_value_t = 0)]
    build_number: u64,
}

impl Target {
    fn task(&self, source_dir: Option<PathBuf>) -> Result<BuildTask> {
        let script = script::load_script(&self.script)?;

        let mut repo = Repo::new(&self.repo)
            .with_privileged(self.privileged)
            .with_params(self.params.iter().cloned().collect::<EnvVars>());
        if let Some(dir) = &self.workdir {
            repo = repo.with_working_dir(dir);
        }
        if let Some(pr) = &self.pull_request {
            repo = repo.with_pull_request(pr);
        }

        Ok(BuildTask {
            repo,
            commit: Commit {
                hash: self.commit.clone(),
                branch: self.branch.clone(),
                author: String::new(),
            },
            build: BuildInfo {
                number: self.build_number,
                slug: String::new(),
            },
            script,
            source_dir,
        })
    }
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    init_tracing();
    let cli = Cli::parse();

    let result = match cli.cmd {
        Commands::Run {
            target,
            source,
            config,
            json,
        } => run(&target, source, config.as_deref(), json),
        Commands::Recipe { target } => print_recipe(&target),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(SYSTEM_FAILURE)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => config::load_file(path),
        None => {
            let cwd = std::env::current_dir().context("cannot determine current directory")?;
            config::load(&cwd)
        }
    }
}

fn run(target: &Target, source: Option<PathBuf>, config: Option<&Path>, json: bool) -> Result<ExitCode> {
    let cfg = load_config(config)?;
    let options = BuildOptions::from_config(&cfg)?;
    let input = target.task(source)?.into_input();

    let docker = Arc::new(DockerCli::new(&cfg.docker_binary, cfg.docker_host.clone()));
    docker.ensure_available()?;

    let orchestrator = Orchestrator::new(docker.clone(), docker).with_options(options);
    let events = spawn_build(orchestrator, input, CancelToken::new());

    for event in events {
        match event {
            BuildEvent::Log(line) if !json => println!("{}", line.text()),
            BuildEvent::Completed(report) => {
                if json {
                    println!("{}", serde_json::to_string_pretty(&report)?);
                }
                return Ok(ExitCode::from(exit_status(report.exit_code)));
            }
            BuildEvent::Aborted(e) => {
                if let Some(code) = script_status(&e) {
                    eprintln!("build failed: {e}");
                    return Ok(ExitCode::from(code));
                }
                return Err(e.into());
            }
            _ => {}
        }
    }
    bail!("build thread exited without a result")
}

fn print_recipe(target: &Target) -> Result<ExitCode> {
    let task = target.task(None)?;
    let env = task.environment();
    let recipe = recipe::generate(&task.repo, &task.script, &env)?;
    print!("{recipe}");
    Ok(ExitCode::SUCCESS)
}

/// Exit status for a build whose script failed before a container ran.
fn script_status(err: &BuildError) -> Option<u8> {
    err.exit_code().map(exit_status)
}

/// Container exit statuses outside the process range map to 1.
fn exit_status(status: i64) -> u8 {
    u8::try_from(status).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_split_on_first_equals() {
        assert_eq!(
            parse_param("OPTS=a=b").unwrap(),
            ("OPTS".to_string(), "a=b".to_string())
        );
        assert!(parse_param("=x").is_err());
        assert!(parse_param("novalue").is_err());
    }

    #[test]
    fn cli_parses_run() {
        let cli = Cli::try_parse_from([
            "shipyard",
            "run",
            "--script",
            ".drone.yml",
            "--repo",
            "git://github.com/drone/drone",
            "--privileged",
            "--param",
            "GOPATH=/go",
            "--json",
        ])
        .unwrap();
        let Commands::Run { target, json, .. } = cli.cmd else {
            panic!("expected run");
        };
        assert!(json);
        assert!(target.privileged);
        assert_eq!(target.params, vec![("GOPATH".to_string(), "/go".to_string())]);
    }

    #[test]
    fn recipe_command_reads_script() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("build.yml");
        std::fs::write(&path, "image: golang\nscript:\n  - go test\n").unwrap();
        let target = Target {
            script: path,
            repo: "git://github.com/drone/drone".into(),
            workdir: None,
            privileged: false,
            pull_request: None,
            params: Vec::new(),
            commit: "abc".into(),
            branch: "main".into(),
            build_number: 7,
        };
        let task = target.task(None).unwrap();
        assert_eq!(task.script.image, "golang");
        assert_eq!(task.environment().get("DRONE_BUILD_NUMBER"), Some("7"));
    }

    #[test]
    fn failed_build_step_exits_with_its_status() {
        let err = BuildError::StepFailed {
            tag: "shipyard-1".into(),
            exit_code: 3,
            source: shipyard::docker::RuntimeError::StepFailed {
                code: 3,
                detail: "returned a non-zero code: 3".into(),
            },
        };
        assert_eq!(script_status(&err), Some(3));
        assert_eq!(script_status(&BuildError::Cancelled), None);
    }

    #[test]
    fn exit_codes_out_of_range_fail() {
        assert_eq!(exit_status(0), 0);
        assert_eq!(exit_status(137), 137);
        assert_eq!(exit_status(-1), 1);
        assert_eq!(exit_status(256), 1);
    }
}
