use async_trait::async_trait;
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use crate::controller::Error;

/// Program name of the stage that applies manifests to the cluster.
pub const APPLY_PROGRAM: &str = "kapp";

/// One invocation of a pipeline stage binary.
#[derive(Clone, Debug, PartialEq, Default)]
pub struct StageCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Option<Vec<u8>>,
    pub current_dir: Option<PathBuf>,
}

impl StageCommand {
    pub fn new(program: &str) -> StageCommand {
        StageCommand {
            program: program.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> StageCommand {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> StageCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn envs(mut self, env: &[(String, String)]) -> StageCommand {
        self.env.extend(env.iter().cloned());
        self
    }

    pub fn stdin(mut self, input: Vec<u8>) -> StageCommand {
        self.stdin = Some(input);
        self
    }
}

impl std::fmt::Display for StageCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Executes stage binaries and hands back what they wrote to stdout.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CmdRunner: Send + Sync {
    async fn run(&self, cmd: StageCommand) -> Result<Vec<u8>, Error>;

    /// Like `run`, but the child is killed as soon as `cancel` fires.
    async fn run_cancelable(
        &self,
        cmd: StageCommand,
        cancel: oneshot::Receiver<()>,
    ) -> Result<Vec<u8>, Error>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Verbosity {
    /// Progress dots only.
    Simple,
    /// Full command lines, plus apply-stage output streamed to the log.
    Detailed,
}

/// Stops listening for the interrupt once dropped.
pub struct InterruptGuard(JoinHandle<()>);

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Receiver that fires when the user interrupts the installer with Ctrl-C.
pub fn interrupt_channel() -> (oneshot::Receiver<()>, InterruptGuard) {
    let (tx, rx) = oneshot::channel();
    let handle = tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => warn!("Unable to listen for interrupts: {}", e),
        }
    });
    (rx, InterruptGuard(handle))
}

type Progress = Arc<Mutex<Box<dyn Write + Send>>>;

pub struct ProcessRunner {
    verbosity: Verbosity,
    progress: Progress,
}

impl ProcessRunner {
    pub fn new(verbosity: Verbosity) -> ProcessRunner {
        ProcessRunner {
            verbosity,
            progress: Arc::new(Mutex::new(Box::new(std::io::stderr()))),
        }
    }

    /// Where simple-mode progress markers go instead of stderr.
    pub fn with_progress<W: Write + Send + 'static>(mut self, progress: W) -> ProcessRunner {
        self.progress = Arc::new(Mutex::new(Box::new(progress)));
        self
    }

    fn marker(&self) {
        if self.verbosity != Verbosity::Simple {
            return;
        }
        let mut progress = match self.progress.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let _ = write!(progress, ".");
        let _ = progress.flush();
    }

    /// Only the apply stage has output worth following live.
    fn tees_output(&self, program: &str) -> bool {
        self.verbosity == Verbosity::Detailed && program == APPLY_PROGRAM
    }

    async fn execute(
        &self,
        cmd: StageCommand,
        cancel: Option<oneshot::Receiver<()>>,
    ) -> Result<Vec<u8>, Error> {
        let command_line = cmd.to_string();
        let tee = self.tees_output(&cmd.program);

        if self.verbosity == Verbosity::Detailed {
            info!("==> Executing {}", command_line);
        }
        self.marker();

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| Error::CommandFailed {
            command: command_line.clone(),
            status: "not started".into(),
            output: e.to_string(),
        })?;

        let input = cmd.stdin;
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let run = async move {
            let write = async move {
                if let (Some(mut pipe), Some(data)) = (stdin, input) {
                    match pipe.write_all(&data).await {
                        Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                        _ => {}
                    }
                }
                Ok(())
            };
            let (written, out, err) =
                tokio::join!(write, collect(stdout, tee), collect(stderr, tee));
            written?;
            let (out, err) = (out?, err?);
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, out, err))
        };

        let (status, stdout, stderr) = match cancel {
            None => run.await?,
            Some(mut cancel) => {
                tokio::select! {
                    result = run => result?,
                    Ok(()) = &mut cancel => {
                        info!("Cancelling {}", command_line);
                        return Err(Error::Cancelled(command_line));
                    }
                }
            }
        };

        self.marker();
        if self.verbosity == Verbosity::Detailed {
            info!("==> Finished {} ({})", command_line, status);
        }

        if !status.success() {
            let mut output = String::from_utf8_lossy(&stdout).to_string();
            output.push_str(&String::from_utf8_lossy(&stderr));
            return Err(Error::CommandFailed {
                command: command_line,
                status: status.to_string(),
                output: output.trim().to_string(),
            });
        }

        Ok(stdout)
    }
}

#[async_trait]
impl CmdRunner for ProcessRunner {
    async fn run(&self, cmd: StageCommand) -> Result<Vec<u8>, Error> {
        self.execute(cmd, None).await
    }

    async fn run_cancelable(
        &self,
        cmd: StageCommand,
        cancel: oneshot::Receiver<()>,
    ) -> Result<Vec<u8>, Error> {
        self.execute(cmd, Some(cancel)).await
    }
}

async fn collect<R>(reader: Option<R>, tee: bool) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = Vec::new();
    let reader = match reader {
        Some(r) => r,
        None => return Ok(buffer),
    };

    if tee {
        let mut reader = BufReader::new(reader);
        let mut line = Vec::new();
        loop {
            line.clear();
            if reader.read_until(b'\n', &mut line).await? == 0 {
                break;
            }
            buffer.extend_from_slice(&line);
            let text = String::from_utf8_lossy(&line);
            info!(target: "kapp", "{}", text.trim_end_matches(|c| c == '\r' || c == '\n'));
        }
    } else {
        BufReader::new(reader).read_to_end(&mut buffer).await?;
    }
    Ok(buffer)
}
