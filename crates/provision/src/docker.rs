use std::collections::HashMap;
use std::io::Seek;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use futures_util::{StreamExt, TryStreamExt};
use tokio_util::io::ReaderStream;

#[derive(Debug, Clone)]
pub struct ExecId(pub(crate) Box<str>);

/// Program and environment of a command run inside a backend container.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    pub argv: Vec<String>,
    pub env: Vec<String>,
    secret_args: Vec<usize>,
}

impl Command {
    pub fn new(program: &str) -> Self {
        Command {
            argv: vec![program.to_owned()],
            env: Vec::new(),
            secret_args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Argument masked in logs.
    pub fn secret_arg(mut self, arg: impl Into<String>) -> Self {
        self.secret_args.push(self.argv.len());
        self.argv.push(arg.into());
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.env.push(format!("{key}={value}"));
        self
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }
}

// Environment values and secret arguments carry credentials and never
// reach the logs.
impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let argv: Vec<&str> = self
            .argv
            .iter()
            .enumerate()
            .map(|(i, arg)| if self.secret_args.contains(&i) { "***" } else { arg.as_str() })
            .collect();
        let env_keys: Vec<&str> = self
            .env
            .iter()
            .map(|kv| kv.split_once('=').map_or(kv.as_str(), |(k, _)| k))
            .collect();
        f.debug_struct("Command")
            .field("argv", &argv)
            .field("env", &env_keys)
            .finish()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        ExecOutput {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i64, stderr: impl Into<String>) -> Self {
        ExecOutput {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turns a non-zero exit into an error carrying the command's stderr.
    pub fn check(self, program: &str) -> anyhow::Result<Self> {
        if self.success() {
            return Ok(self);
        }
        let detail = match self.stderr.trim() {
            "" => self.stdout.trim(),
            stderr => stderr,
        };
        anyhow::bail!("{program} exited with {}: {detail}", self.exit_code)
    }
}

/// A running backend service reached through its container.
pub trait Container: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Creates and starts the container if needed.
    fn ensure_running(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn exec(&self, command: &Command) -> impl Future<Output = anyhow::Result<ExecOutput>> + Send;

    /// Copies a host file to the absolute path `dest` inside the container.
    fn upload(&self, file: &Path, dest: &str) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Runs `command` and fails on a non-zero exit code.
    fn run_cmd(&self, command: &Command) -> impl Future<Output = anyhow::Result<ExecOutput>> + Send {
        async move {
            tracing::debug!(container = self.name(), ?command, "exec");
            let output = self.exec(command).await?;
            output.check(command.program())
        }
    }
}

/// Container managed through the docker engine API.
pub struct DockerContainer {
    docker: bollard::Docker,
    name: Box<str>,
    image: Box<str>,
    env: Vec<String>,
    ports: Vec<String>,
}

impl DockerContainer {
    pub fn new(docker: bollard::Docker, descriptor: &polystore_config::BackendConfig) -> Self {
        DockerContainer {
            docker,
            name: descriptor.container.as_str().into(),
            image: descriptor.image.as_str().into(),
            env: descriptor.env.clone(),
            ports: descriptor.ports.clone(),
        }
    }

    async fn pull_image(&self) -> anyhow::Result<()> {
        let options = bollard::image::CreateImageOptions {
            from_image: self.image.as_ref(),
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, None)
            .try_collect::<Vec<_>>()
            .await?;
        Ok(())
    }

    async fn create_container(&self) -> anyhow::Result<bollard::models::ContainerCreateResponse> {
        let (exposed_ports, port_bindings) = port_bindings(&self.ports)?;
        let options = bollard::container::CreateContainerOptions {
            name: self.name.as_ref(),
            platform: None,
        };
        let config = bollard::container::Config {
            image: Some(self.image.to_string()),
            env: Some(self.env.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(bollard::models::HostConfig {
                port_bindings: Some(port_bindings),
                ..Default::default()
            }),
            ..Default::default()
        };
        let container = self.docker.create_container(Some(options), config).await?;
        Ok(container)
    }

    async fn start_container(&self) -> anyhow::Result<()> {
        let options = bollard::container::StartContainerOptions {
            ..Default::default()
        };
        self.docker
            .start_container::<String>(&self.name, Some(options))
            .await?;
        Ok(())
    }

    async fn create_exec(&self, command: &Command) -> anyhow::Result<ExecId> {
        let config = bollard::exec::CreateExecOptions {
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            cmd: Some(command.argv.clone()),
            env: Some(command.env.clone()),
            ..Default::default()
        };
        let exec = self.docker.create_exec(&self.name, config).await?;
        Ok(ExecId(exec.id.into_boxed_str()))
    }

    async fn start_exec(&self, exec_id: &ExecId) -> anyhow::Result<bollard::exec::StartExecResults> {
        let options = bollard::exec::StartExecOptions {
            detach: false,
            ..Default::default()
        };
        let attach = self.docker.start_exec(&exec_id.0, Some(options)).await?;
        Ok(attach)
    }
}

impl Container for DockerContainer {
    fn name(&self) -> &str {
        &self.name
    }

    async fn ensure_running(&self) -> anyhow::Result<()> {
        let inspect = self
            .docker
            .inspect_container(&self.name, None::<bollard::container::InspectContainerOptions>)
            .await;
        match inspect {
            Ok(info) => {
                let running = info.state.and_then(|state| state.running).unwrap_or(false);
                if running {
                    tracing::debug!(container = %self.name, "container already running");
                    return Ok(());
                }
                tracing::info!(container = %self.name, "starting stopped container");
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                tracing::info!(container = %self.name, image = %self.image, "creating container");
                self.pull_image().await?;
                self.create_container().await?;
            }
            Err(err) => return Err(err.into()),
        }
        self.start_container().await
    }

    async fn exec(&self, command: &Command) -> anyhow::Result<ExecOutput> {
        let exec_id = self.create_exec(command).await?;
        let attach = self.start_exec(&exec_id).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();
        if let bollard::exec::StartExecResults::Attached { mut output, .. } = attach {
            while let Some(message) = output.next().await {
                match message? {
                    bollard::container::LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message))
                    }
                    bollard::container::LogOutput::StdOut { message }
                    | bollard::container::LogOutput::Console { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message))
                    }
                    bollard::container::LogOutput::StdIn { .. } => {}
                }
            }
        }

        let docker = &self.docker;
        let id = exec_id.0.as_ref();
        let exit_code = settled_exit_code(
            move || async move {
                let inspect = docker.inspect_exec(id).await?;
                Ok::<_, anyhow::Error>((inspect.running, inspect.exit_code))
            },
            EXIT_CHECKS,
            EXIT_CHECK_INTERVAL,
        )
        .await
        .with_context(|| format!("{} in {}", command.program(), self.name))?;
        let Some(exit_code) = exit_code else {
            anyhow::bail!("{} in {} reported no exit code", command.program(), self.name);
        };
        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    async fn upload(&self, file: &Path, dest: &str) -> anyhow::Result<()> {
        let archive = {
            let file = file.to_owned();
            let entry = dest.trim_start_matches('/').to_owned();
            tokio::task::spawn_blocking(move || tar_single_file(&file, &entry)).await??
        };
        let options = bollard::container::UploadToContainerOptions {
            path: "/".to_owned(),
            ..Default::default()
        };

        let read_error = Arc::new(Mutex::new(None::<std::io::Error>));
        let body = ReaderStream::new(tokio::fs::File::from_std(archive)).scan(
            Arc::clone(&read_error),
            |read_error, chunk| {
                futures_util::future::ready(match chunk {
                    Ok(bytes) => Some(bytes),
                    Err(err) => {
                        if let Ok(mut slot) = read_error.lock() {
                            *slot = Some(err);
                        }
                        None
                    }
                })
            },
        );
        self.docker
            .upload_to_container_streaming(&self.name, Some(options), body)
            .await?;
        if let Some(err) = read_error.lock().ok().and_then(|mut slot| slot.take()) {
            return Err(anyhow::Error::new(err).context(format!("upload of {} was cut short", file.display())));
        }
        Ok(())
    }
}

const EXIT_CHECKS: u32 = 50;
const EXIT_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Exit code of an exec once the engine stops reporting it as running. The
/// attach stream can close shortly before the exit code is recorded.
async fn settled_exit_code<F, Fut>(mut inspect: F, checks: u32, interval: Duration) -> anyhow::Result<Option<i64>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<(Option<bool>, Option<i64>)>>,
{
    for check in 1..=checks {
        match inspect().await? {
            (Some(true), _) | (None, None) => {
                if check < checks {
                    tokio::time::sleep(interval).await;
                }
            }
            (_, exit_code) => return Ok(exit_code),
        }
    }
    anyhow::bail!("exec still running after {checks} checks")
}

/// Tar archive holding `file` under `entry`, readable by any user of the
/// container (server-side bulk copies run as the database user). Spooled to
/// an anonymous temporary file and rewound for streaming.
fn tar_single_file(file: &Path, entry: &str) -> anyhow::Result<std::fs::File> {
    let source = std::fs::File::open(file)?;
    let mut header = tar::Header::new_gnu();
    header.set_size(source.metadata()?.len());
    header.set_mode(0o644);
    header.set_cksum();

    let mut builder = tar::Builder::new(tempfile::tempfile()?);
    builder.append_data(&mut header, entry, source)?;
    let mut archive = builder.into_inner()?;
    archive.rewind()?;
    Ok(archive)
}

type ExposedPorts = HashMap<String, HashMap<(), ()>>;
type PortBindings = HashMap<String, Option<Vec<bollard::models::PortBinding>>>;

/// Parses `host:container` bindings.
fn port_bindings(ports: &[String]) -> anyhow::Result<(ExposedPorts, PortBindings)> {
    let mut exposed = HashMap::new();
    let mut bindings = HashMap::new();
    for port in ports {
        let Some((host, container)) = port.split_once(':') else {
            anyhow::bail!("invalid port binding `{port}`, expected host:container");
        };
        host.parse::<u16>()?;
        container.parse::<u16>()?;
        let key = format!("{container}/tcp");
        exposed.insert(key.clone(), HashMap::new());
        let binding = bollard::models::PortBinding {
            host_ip: None,
            host_port: Some(host.to_owned()),
        };
        bindings.insert(key, Some(vec![binding]));
    }
    Ok((exposed, bindings))
}
