use std::{
    io,
    path::Path,
    process::{ExitStatus, Stdio},
    time::Duration,
};

use bytes::Bytes;
use futures::{Stream, StreamExt, stream};
use tokio::{
    process::{Child, ChildStderr, ChildStdout, Command},
    sync::{OwnedSemaphorePermit, mpsc},
    task::JoinHandle,
    time::timeout,
};
use tokio_util::io::ReaderStream;
use tracing::{Instrument, debug, info, warn};

use crate::{args::ArgumentVector, error::DownloadError, jar::CookieJar};

const DEFAULT_CHUNK_BYTES: usize = 64 * 1024;
const DEFAULT_BUFFER_CHUNKS: usize = 8;
const DEFAULT_IDLE_TIMEOUT_SECONDS: u64 = 180;
const STDERR_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy)]
pub struct BridgeSettings {
    pub chunk_bytes: usize,
    pub buffer_chunks: usize,
    pub idle_timeout: Duration,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            chunk_bytes: DEFAULT_CHUNK_BYTES,
            buffer_chunks: DEFAULT_BUFFER_CHUNKS,
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_TIMEOUT_SECONDS),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success { bytes: u64 },
    NoData,
    ToolFailed(String),
    IdleTimeout(u64),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }

    pub fn into_error(self) -> Option<DownloadError> {
        match self {
            Self::Success { .. } => None,
            Self::NoData => Some(DownloadError::NoData),
            Self::ToolFailed(status) => Some(DownloadError::ToolFailed(status)),
            Self::IdleTimeout(seconds) => Some(DownloadError::IdleTimeout(seconds)),
        }
    }
}

#[derive(Debug)]
pub enum BridgeEvent {
    Chunk(Bytes),
    Finished(Outcome),
}

#[derive(Debug)]
pub struct StreamBridge {
    events: mpsc::Receiver<BridgeEvent>,
}

impl StreamBridge {
    async fn next_event(&mut self) -> Option<BridgeEvent> {
        self.events.recv().await
    }

    /// Nothing is committed to the client while this is pending.
    pub async fn first_chunk(&mut self) -> Result<Bytes, DownloadError> {
        match self.next_event().await {
            Some(BridgeEvent::Chunk(chunk)) => Ok(chunk),
            Some(BridgeEvent::Finished(outcome)) => {
                Err(outcome.into_error().unwrap_or(DownloadError::NoData))
            }
            None => Err(DownloadError::ToolFailed(
                "supervisor finalizado sin resultado".to_string(),
            )),
        }
    }

    /// A failure after the headers are committed aborts the stream.
    pub fn into_body_stream(
        self,
        first: Bytes,
    ) -> impl Stream<Item = Result<Bytes, io::Error>> + Send + 'static {
        let rest = stream::unfold(self.events, |mut events| async move {
            match events.recv().await {
                None => None,
                Some(BridgeEvent::Chunk(chunk)) => Some((Ok(chunk), events)),
                Some(BridgeEvent::Finished(Outcome::Success { bytes })) => {
                    info!("Descarga concluida, {bytes} bytes enviados.");
                    None
                }
                Some(BridgeEvent::Finished(outcome)) => {
                    let message = outcome
                        .into_error()
                        .map(|error| error.to_string())
                        .unwrap_or_default();
                    warn!("Descarga truncada despues de enviar cabeceras: {message}");
                    Some((Err(io::Error::other(message)), events))
                }
            }
        });

        stream::once(async move { Ok(first) }).chain(rest)
    }
}

enum Termination {
    Eof,
    ClientGone,
    Idle,
    ReadFailed(io::Error),
}

pub async fn spawn(
    program: &Path,
    args: &ArgumentVector,
    jar: Option<CookieJar>,
    permit: Option<OwnedSemaphorePermit>,
    settings: BridgeSettings,
) -> Result<StreamBridge, DownloadError> {
    let mut command = Command::new(program);
    command
        .args(args.as_slice())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(error) => {
            warn!("Error en el proceso {:?}: {error}", program);
            if let Some(jar) = jar {
                jar.release().await;
            }
            return Err(DownloadError::Spawn(error));
        }
    };

    let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
        terminate(&mut child).await;
        if let Some(jar) = jar {
            jar.release().await;
        }
        return Err(DownloadError::Spawn(io::Error::other(
            "no se pudieron abrir las salidas del proceso",
        )));
    };

    info!(pid = child.id(), "Proceso {:?} iniciado.", program);

    let (sender, events) = mpsc::channel(settings.buffer_chunks.max(1));
    tokio::spawn(
        supervise(child, stdout, stderr, jar, permit, sender, settings).in_current_span(),
    );

    Ok(StreamBridge { events })
}

async fn supervise(
    mut child: Child,
    stdout: ChildStdout,
    stderr: ChildStderr,
    jar: Option<CookieJar>,
    permit: Option<OwnedSemaphorePermit>,
    sender: mpsc::Sender<BridgeEvent>,
    settings: BridgeSettings,
) {
    let stderr_task = tokio::spawn(drain_stderr(stderr).in_current_span());
    let mut chunks = ReaderStream::with_capacity(stdout, settings.chunk_bytes.max(1));
    let mut delivered: u64 = 0;

    let mut termination = loop {
        tokio::select! {
            _ = sender.closed() => break Termination::ClientGone,
            next = timeout(settings.idle_timeout, chunks.next()) => match next {
                Err(_) => break Termination::Idle,
                Ok(None) => break Termination::Eof,
                Ok(Some(Err(error))) => break Termination::ReadFailed(error),
                Ok(Some(Ok(chunk))) => {
                    if chunk.is_empty() {
                        debug!("Chunk vacio recibido de la herramienta.");
                        continue;
                    }
                    delivered += chunk.len() as u64;
                    if sender.send(BridgeEvent::Chunk(chunk)).await.is_err() {
                        break Termination::ClientGone;
                    }
                }
            }
        }
    };

    // stdout closed, but the tool may keep running.
    let mut exit = None;
    if matches!(termination, Termination::Eof) {
        termination = tokio::select! {
            status = child.wait() => {
                exit = Some(status);
                Termination::Eof
            }
            _ = sender.closed() => Termination::ClientGone,
            _ = tokio::time::sleep(settings.idle_timeout) => Termination::Idle,
        };
    }

    match &termination {
        Termination::Eof => {}
        Termination::ClientGone => {
            info!("Cliente desconectado tras {delivered} bytes; terminando proceso.");
            terminate(&mut child).await;
        }
        Termination::Idle => {
            warn!(
                "Sin datos durante {} segundos; terminando proceso.",
                settings.idle_timeout.as_secs()
            );
            terminate(&mut child).await;
        }
        Termination::ReadFailed(error) => {
            warn!("Error leyendo la salida del proceso: {error}");
            terminate(&mut child).await;
        }
    }

    drop(chunks);
    let status = match exit {
        Some(status) => status,
        None => child.wait().await,
    };
    let last_stderr_line = finish_stderr(stderr_task).await;

    // Released before Finished is published.
    if let Some(jar) = jar {
        jar.release().await;
    }
    drop(permit);

    let outcome = match termination {
        Termination::ClientGone => return,
        Termination::Idle => Outcome::IdleTimeout(settings.idle_timeout.as_secs()),
        Termination::ReadFailed(error) => Outcome::ToolFailed(format!("error de lectura: {error}")),
        Termination::Eof => match status {
            Ok(status) if status.success() && delivered > 0 => Outcome::Success { bytes: delivered },
            Ok(status) if status.success() => Outcome::NoData,
            Ok(status) => Outcome::ToolFailed(describe_status(status)),
            Err(error) => Outcome::ToolFailed(format!("estado desconocido: {error}")),
        },
    };

    if !outcome.is_success() {
        warn!(
            "Proceso finalizado con {:?} ({delivered} bytes). Ultimo mensaje: {}",
            outcome,
            last_stderr_line.as_deref().unwrap_or("-")
        );
    }

    let _ = sender.send(BridgeEvent::Finished(outcome)).await;
}

async fn terminate(child: &mut Child) {
    if let Err(error) = child.start_kill() {
        debug!("No se pudo terminar el proceso: {error}");
    }
    if let Err(error) = child.wait().await {
        debug!("No se pudo esperar al proceso: {error}");
    }
}

/// Logs tool diagnostics line by line; returns the last non-empty line.
async fn drain_stderr(stderr: ChildStderr) -> Option<String> {
    let mut chunks = ReaderStream::new(stderr);
    let mut last_line = None;

    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                debug!("Error leyendo stderr: {error}");
                break;
            }
        };

        let text = String::from_utf8_lossy(&chunk);
        for line in text
            .split(['\n', '\r'])
            .map(str::trim)
            .filter(|line| !line.is_empty())
        {
            info!(target: "media_relay::tool", "[yt-dlp] {line}");
            last_line = Some(line.to_string());
        }
    }

    last_line
}

async fn finish_stderr(task: JoinHandle<Option<String>>) -> Option<String> {
    let abort = task.abort_handle();
    match timeout(STDERR_GRACE, task).await {
        Ok(Ok(last_line)) => last_line,
        Ok(Err(error)) => {
            debug!("Tarea de stderr fallo: {error}");
            None
        }
        Err(_) => {
            // A grandchild may still hold the pipe open.
            abort.abort();
            None
        }
    }
}

fn describe_status(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("codigo {code}");
    }

    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("senal {signal}");
        }
    }

    "terminacion desconocida".to_string()
}

#[cfg(all(test, unix))]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::{
        args::build_arguments,
        cookies::{Credential, materialize},
        test_support::{stub_tool, wait_until_removed},
    };

    const URL: &str = "https://www.youtube.com/watch?v=abc";

    fn settings() -> BridgeSettings {
        BridgeSettings {
            chunk_bytes: 4096,
            buffer_chunks: 2,
            idle_timeout: Duration::from_secs(10),
        }
    }

    async fn jar_in(dir: &Path) -> CookieJar {
        let credential = Credential {
            raw: "SID=secret".to_string(),
            default_domain: ".youtube.com".to_string(),
        };
        materialize(dir, &credential).await.unwrap()
    }

    async fn collect(mut bridge: StreamBridge) -> (Vec<Bytes>, Option<Outcome>) {
        let mut chunks = Vec::new();
        while let Some(event) = bridge.next_event().await {
            match event {
                BridgeEvent::Chunk(chunk) => chunks.push(chunk),
                BridgeEvent::Finished(outcome) => return (chunks, Some(outcome)),
            }
        }
        (chunks, None)
    }

    async fn run(tool: &Path, jar: Option<CookieJar>) -> (Vec<Bytes>, Option<Outcome>) {
        let path = jar.as_ref().map(|jar| jar.path().to_path_buf());
        let args = build_arguments(URL, None, path.as_deref());
        let bridge = spawn(tool, &args, jar, None, settings()).await.unwrap();
        collect(bridge).await
    }

    #[tokio::test]
    async fn streams_every_byte_in_bounded_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "head -c 300000 /dev/zero");

        let (chunks, outcome) = run(&tool, None).await;

        let total: usize = chunks.iter().map(Bytes::len).sum();
        assert_eq!(total, 300_000);
        assert!(chunks.iter().all(|chunk| chunk.len() <= 4096 && !chunk.is_empty()));
        assert_eq!(outcome, Some(Outcome::Success { bytes: 300_000 }));
    }

    #[tokio::test]
    async fn preserves_byte_order() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "printf 'first-'; printf 'second-'; printf 'third'");

        let (chunks, outcome) = run(&tool, None).await;

        assert_eq!(chunks.concat(), b"first-second-third");
        assert!(outcome.unwrap().is_success());
    }

    #[tokio::test]
    async fn silent_success_is_no_data() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "exit 0");

        let (chunks, outcome) = run(&tool, None).await;

        assert!(chunks.is_empty());
        assert_eq!(outcome, Some(Outcome::NoData));
    }

    #[tokio::test]
    async fn non_zero_exit_after_output_is_tool_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "printf 'abc'; exit 3");

        let (chunks, outcome) = run(&tool, None).await;

        assert_eq!(chunks.concat(), b"abc");
        assert_eq!(outcome, Some(Outcome::ToolFailed("codigo 3".to_string())));
    }

    #[tokio::test]
    async fn stderr_never_reaches_the_body() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "echo 'ERROR: something' >&2; printf 'ok'");

        let (chunks, outcome) = run(&tool, None).await;

        assert_eq!(chunks.concat(), b"ok");
        assert!(outcome.unwrap().is_success());
    }

    #[tokio::test]
    async fn jar_is_readable_while_tool_runs() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(
            dir.path(),
            r#"while [ "$#" -gt 0 ]; do
  if [ "$1" = "--cookies" ]; then cat "$2"; fi
  shift
done"#,
        );
        let jar = jar_in(dir.path()).await;
        let jar_path = jar.path().to_path_buf();

        let (chunks, outcome) = run(&tool, Some(jar)).await;

        let echoed = String::from_utf8(chunks.concat()).unwrap();
        assert!(echoed.contains("\tSID\tsecret"));
        assert!(outcome.unwrap().is_success());
        assert!(!jar_path.exists());
    }

    #[tokio::test]
    async fn jar_is_removed_on_every_exit_path() {
        for body in ["printf 'data'", "printf 'data'; exit 1", "exit 0", "exit 7"] {
            let dir = tempfile::tempdir().unwrap();
            let tool = stub_tool(dir.path(), body);
            let jar = jar_in(dir.path()).await;
            let jar_path = jar.path().to_path_buf();

            let (_, outcome) = run(&tool, Some(jar)).await;

            assert!(outcome.is_some(), "no outcome for {body:?}");
            assert!(!jar_path.exists(), "jar left behind for {body:?}");
        }
    }

    #[tokio::test]
    async fn spawn_failure_removes_jar() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("yt-dlp");
        std::fs::write(&tool, "#!/bin/sh\nprintf 'never'\n").unwrap();
        std::fs::set_permissions(&tool, std::fs::Permissions::from_mode(0o644)).unwrap();
        let jar = jar_in(dir.path()).await;
        let jar_path = jar.path().to_path_buf();

        let args = build_arguments(URL, None, Some(&jar_path));
        let error = spawn(&tool, &args, Some(jar), None, settings())
            .await
            .unwrap_err();

        assert!(matches!(error, DownloadError::Spawn(_)));
        assert!(!jar_path.exists());
    }

    #[tokio::test]
    async fn idle_tool_is_killed() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "exec sleep 30");
        let jar = jar_in(dir.path()).await;
        let jar_path = jar.path().to_path_buf();

        let args = build_arguments(URL, None, Some(&jar_path));
        let bridge = spawn(
            &tool,
            &args,
            Some(jar),
            None,
            BridgeSettings {
                idle_timeout: Duration::from_millis(200),
                ..settings()
            },
        )
        .await
        .unwrap();

        let (chunks, outcome) = collect(bridge).await;
        assert!(chunks.is_empty());
        assert_eq!(outcome, Some(Outcome::IdleTimeout(0)));
        assert!(!jar_path.exists());
    }

    #[tokio::test]
    async fn dropping_the_receiver_kills_tool_and_removes_jar() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "printf 'x'; exec sleep 30");
        let jar = jar_in(dir.path()).await;
        let jar_path = jar.path().to_path_buf();

        let args = build_arguments(URL, None, Some(&jar_path));
        let mut bridge = spawn(&tool, &args, Some(jar), None, settings())
            .await
            .unwrap();

        let first = bridge.first_chunk().await.unwrap();
        assert_eq!(first, Bytes::from_static(b"x"));
        assert!(jar_path.exists());

        drop(bridge);
        assert!(wait_until_removed(&jar_path, Duration::from_secs(5)).await);
    }

    #[tokio::test]
    async fn disconnect_after_stdout_closes_still_kills_tool() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "printf 'x'; exec 1>&-; exec sleep 30");
        let jar = jar_in(dir.path()).await;
        let jar_path = jar.path().to_path_buf();

        let args = build_arguments(URL, None, Some(&jar_path));
        let mut bridge = spawn(&tool, &args, Some(jar), None, settings())
            .await
            .unwrap();

        bridge.first_chunk().await.unwrap();
        // Let the supervisor reach EOF before the client leaves.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(jar_path.exists());

        drop(bridge);
        assert!(wait_until_removed(&jar_path, Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn tool_lingering_after_stdout_closes_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "printf 'x'; exec 1>&-; exec sleep 30");
        let jar = jar_in(dir.path()).await;
        let jar_path = jar.path().to_path_buf();

        let args = build_arguments(URL, None, Some(&jar_path));
        let bridge = spawn(
            &tool,
            &args,
            Some(jar),
            None,
            BridgeSettings {
                idle_timeout: Duration::from_millis(300),
                ..settings()
            },
        )
        .await
        .unwrap();

        let (chunks, outcome) = timeout(Duration::from_secs(5), collect(bridge))
            .await
            .unwrap();
        assert_eq!(chunks, [Bytes::from_static(b"x")]);
        assert_eq!(outcome, Some(Outcome::IdleTimeout(0)));
        assert!(!jar_path.exists());
    }

    #[tokio::test]
    async fn permit_is_held_until_termination() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "printf 'x'; exec sleep 30");
        let semaphore = std::sync::Arc::new(tokio::sync::Semaphore::new(1));
        let permit = semaphore.clone().acquire_owned().await.unwrap();

        let args = build_arguments(URL, None, None);
        let mut bridge = spawn(&tool, &args, None, Some(permit), settings())
            .await
            .unwrap();
        bridge.first_chunk().await.unwrap();
        assert_eq!(semaphore.available_permits(), 0);

        drop(bridge);
        let reacquired = timeout(Duration::from_secs(5), semaphore.acquire()).await;
        assert!(reacquired.is_ok());
    }

    #[tokio::test]
    async fn body_stream_aborts_after_late_failure() {
        let dir = tempfile::tempdir().unwrap();
        let tool = stub_tool(dir.path(), "printf 'partial'; exit 1");

        let args = build_arguments(URL, None, None);
        let mut bridge = spawn(&tool, &args, None, None, settings()).await.unwrap();
        let first = bridge.first_chunk().await.unwrap();

        let items = bridge.into_body_stream(first).collect::<Vec<_>>().await;
        let bytes = items
            .iter()
            .filter_map(|item| item.as_ref().ok())
            .flat_map(|chunk| chunk.iter().copied())
            .collect::<Vec<u8>>();

        assert_eq!(bytes, b"partial");
        assert!(items.last().unwrap().is_err());
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let args = build_arguments(URL, None, None);
        let error = spawn(
            &PathBuf::from("/nonexistent/yt-dlp"),
            &args,
            None,
            None,
            settings(),
        )
        .await
        .unwrap_err();
        assert!(matches!(error, DownloadError::Spawn(_)));
    }
}
