use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use tracing::debug;

use super::service::RuntimeError;
use super::types::{OutputLine, OutputSink};

/// Output lines kept for error messages.
const TAIL_LINES: usize = 20;

/// Last few output lines of a child process, from both streams.
#[derive(Debug, Clone, Default)]
pub(crate) struct Tail(Arc<Mutex<VecDeque<String>>>);

impl Tail {
    fn push(&self, line: &str) {
        if let Ok(mut lines) = self.0.lock() {
            if lines.len() == TAIL_LINES {
                lines.pop_front();
            }
            lines.push_back(line.to_string());
        }
    }

    pub(crate) fn joined(&self) -> String {
        self.0
            .lock()
            .map(|lines| lines.iter().cloned().collect::<Vec<_>>().join("\n"))
            .unwrap_or_default()
    }
}

/// Spawn `cmd` with piped output and forward every line to `sink` from
/// background reader threads.
pub(crate) fn spawn_streaming(
    mut cmd: Command,
    sink: &OutputSink,
) -> Result<(Child, Vec<JoinHandle<()>>, Tail), RuntimeError> {
    debug!(command = %command_line(&cmd), "spawning docker");
    let mut child = cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).spawn()?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| RuntimeError::Protocol("child stdout was not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| RuntimeError::Protocol("child stderr was not captured".into()))?;

    let tail = Tail::default();
    let readers = vec![
        forward(stdout, sink.clone(), OutputLine::Stdout, tail.clone()),
        forward(stderr, sink.clone(), OutputLine::Stderr, tail.clone()),
    ];
    Ok((child, readers, tail))
}

/// Run `cmd` to completion, streaming its output to `sink`.
pub(crate) fn run_streaming(cmd: Command, sink: &OutputSink) -> Result<(), RuntimeError> {
    let what = command_line(&cmd);
    let (mut child, readers, tail) = spawn_streaming(cmd, sink)?;
    let status = child.wait()?;
    for reader in readers {
        let _ = reader.join();
    }

    if !status.success() {
        return Err(RuntimeError::Daemon(format!(
            "`{what}` exited with {status}: {}",
            tail.joined()
        )));
    }
    Ok(())
}

fn forward<R, F>(
    source: R,
    sink: OutputSink,
    wrap: F,
    tail: Tail,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
    F: Fn(String) -> OutputLine + Send + 'static,
{
    std::thread::spawn(move || {
        let reader = BufReader::new(source);
        for line in reader.lines() {
            match line {
                Ok(l) => {
                    tail.push(&l);
                    // Receiver may be dropped; ignore send errors.
                    let _ = sink.send(wrap(l));
                }
                Err(_) => break,
            }
        }
    })
}

/// Render a command for logs.
pub(crate) fn command_line(cmd: &Command) -> String {
    let mut words = vec![cmd.get_program().to_string_lossy().to_string()];
    words.extend(cmd.get_args().map(|a| a.to_string_lossy().to_string()));
    shell_words::join(words)
}
