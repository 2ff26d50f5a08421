use std::{
    io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::atomic::{AtomicBool, Ordering},
};

use bytes::Bytes;
use futures::{
    future,
    stream::{self, BoxStream},
    StreamExt,
};
use tempfile::{Builder, TempPath};
use tokio::{
    io::AsyncReadExt,
    process::{Child, ChildStderr, ChildStdout, Command},
    select,
    sync::mpsc,
    task::{self, JoinHandle},
};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, instrument, warn};

use super::{encoder_args, ConversionRequest, Delivery, OutputFormat, OutputTarget};
use crate::error::ConvertError;

/// Chunks in flight between the encoder and a slow consumer.
const STREAM_CHANNEL_CAPACITY: usize = 16;

/// Byte chunks of a streamed conversion, in the order the encoder wrote them.
/// A failed conversion ends with a single `Err` item.
pub type EncodedStream = BoxStream<'static, Result<Bytes, ConvertError>>;

pub enum Encoded {
    Buffered(Bytes),
    Streamed(EncodedStream),
}

/// Check the input exists, then run the encoder with the requested delivery.
#[instrument(skip(encoder, scratch_dir))]
pub async fn convert(
    encoder: &Encoder,
    request: &ConversionRequest,
    delivery: Delivery,
    scratch_dir: &Path,
) -> Result<Encoded, ConvertError> {
    ensure_input(&request.input_path).await?;

    match delivery {
        Delivery::Buffered => {
            let scratch = scratch_file(scratch_dir, request.format)?;
            let args = encoder_args(request, &OutputTarget::File(&scratch));
            encoder
                .run_buffered(&args, Some(scratch))
                .await
                .map(Encoded::Buffered)
        }
        Delivery::Streamed => {
            let args = encoder_args(request, &OutputTarget::Pipe);
            let chunks = encoder.run_streamed(&args)?;
            first_chunk(chunks).await.map(Encoded::Streamed)
        }
    }
}

/// Wait for the first item of a stream. An encoder that fails before
/// writing anything comes back as a plain error, while nothing has been
/// sent to the client yet.
async fn first_chunk(mut chunks: EncodedStream) -> Result<EncodedStream, ConvertError> {
    match chunks.next().await {
        Some(Ok(first)) => Ok(stream::once(future::ready(Ok(first)))
            .chain(chunks)
            .boxed()),
        Some(Err(err)) => Err(err),
        None => Ok(stream::empty().boxed()),
    }
}

async fn ensure_input(path: &Path) -> Result<(), ConvertError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => Ok(()),
        _ => Err(ConvertError::InputNotFound(path.to_path_buf())),
    }
}

/// Reserve a uniquely named output file. It is deleted when the returned
/// path is dropped.
fn scratch_file(scratch_dir: &Path, format: OutputFormat) -> Result<TempPath, ConvertError> {
    let file = Builder::new()
        .prefix("converted_")
        .suffix(&format!(".{}", format.as_str()))
        .tempfile_in(scratch_dir)?;
    Ok(file.into_temp_path())
}

/// Runs the external encoder binary.
#[derive(Debug, Clone)]
pub struct Encoder {
    program: PathBuf,
    global_args: Vec<String>,
}

impl Encoder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            global_args: Vec::new(),
        }
    }

    /// Arguments placed before every conversion's own arguments.
    pub fn with_global_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.global_args = args.into_iter().map(Into::into).collect();
        self
    }

    fn spawn(&self, args: &[String], stdout: Stdio) -> Result<Child, ConvertError> {
        debug!(
            "encoder command: {} {} {}",
            self.program.display(),
            self.global_args.join(" "),
            args.join(" ")
        );
        let child = Command::new(&self.program)
            .args(&self.global_args)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ConvertError::ProcessStartFailed {
                program: self.program.clone(),
                source,
            })?;
        info!("started encoder, pid {:?}", child.id());
        Ok(child)
    }

    /// Run to completion and return everything the encoder produced.
    ///
    /// Without `scratch` the output is read from stdout. With it, the encoder
    /// is expected to write that file, which is read back after a clean exit.
    /// The file goes away with `scratch`, so it is also removed on error and
    /// when this future is dropped part way.
    #[instrument(skip(self, args, scratch))]
    pub async fn run_buffered(
        &self,
        args: &[String],
        scratch: Option<TempPath>,
    ) -> Result<Bytes, ConvertError> {
        let stdout = match scratch {
            None => Stdio::piped(),
            Some(_) => Stdio::null(),
        };
        let child = self.spawn(args, stdout)?;

        // drains stdout and stderr concurrently
        let output = child.wait_with_output().await?;
        check_status(output.status, &output.stderr)?;
        let bytes = match scratch {
            None => Bytes::from(output.stdout),
            Some(path) => {
                let bytes = tokio::fs::read(&path).await?;
                if let Err(err) = path.close() {
                    debug!("could not remove scratch file: {}", err);
                }
                Bytes::from(bytes)
            }
        };

        info!("conversion finished, {} bytes", bytes.len());
        Ok(bytes)
    }

    /// Start the encoder and hand back its stdout as it is produced.
    ///
    /// Dropping the returned stream stops the encoder.
    #[instrument(skip(self, args))]
    pub fn run_streamed(&self, args: &[String]) -> Result<EncodedStream, ConvertError> {
        let mut child = self.spawn(args, Stdio::piped())?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("could not get stdout from child encoder"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("could not get stderr from child encoder"))?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        task::spawn(pump(child, stdout, stderr, ChunkSink::new(tx)));

        Ok(ReceiverStream::new(rx).boxed())
    }
}

fn check_status(status: ExitStatus, stderr: &[u8]) -> Result<(), ConvertError> {
    if status.success() {
        debug!("encoder exited cleanly");
        Ok(())
    } else {
        Err(ConvertError::EncodingFailed {
            code: status.code(),
            stderr: String::from_utf8_lossy(stderr).into_owned(),
        })
    }
}

fn drain_stderr(mut stderr: ChildStderr) -> JoinHandle<Vec<u8>> {
    task::spawn(async move {
        let mut buf = Vec::new();
        if let Err(err) = stderr.read_to_end(&mut buf).await {
            debug!("error reading encoder stderr: {}", err);
        }
        buf
    })
}

/// Forward stdout chunks into the sink until the encoder exits or the
/// consumer goes away, whichever comes first.
async fn pump(mut child: Child, stdout: ChildStdout, stderr: ChildStderr, sink: ChunkSink) {
    let stderr_task = drain_stderr(stderr);
    let mut chunks = ReaderStream::new(stdout);
    let mut sent: usize = 0;

    let cancelled = loop {
        let chunk = select! {
            chunk = chunks.next() => chunk,
            _ = sink.cancelled() => break true,
        };
        match chunk {
            Some(Ok(bytes)) => {
                let len = bytes.len();
                if !sink.emit(Ok(bytes)).await {
                    break true;
                }
                sent += len;
            }
            Some(Err(err)) => {
                warn!("error reading encoder stdout: {}", err);
                sink.fail(err.into()).await;
                break true;
            }
            None => break false,
        }
    };

    if cancelled {
        if sink.close() {
            warn!("stream consumer went away after {} bytes, stopping encoder", sent);
        }
        if let Err(err) = child.kill().await {
            debug!("could not kill encoder: {}", err);
        }
        stderr_task.abort();
        return;
    }

    let status = child.wait().await;
    let stderr = stderr_task.await.unwrap_or_default();
    match status.map_err(ConvertError::from).and_then(|s| check_status(s, &stderr)) {
        Ok(()) => {
            info!("stream finished, {} bytes", sent);
            sink.close();
        }
        Err(err) => {
            warn!("stream failed after {} bytes: {}", sent, err);
            sink.fail(err).await;
        }
    }
}

/// Sending half of a streamed conversion.
///
/// Exit, error and consumer disconnect can each try to end the stream; the
/// `closed` flag makes only the first one count. Emitting after that is a
/// no-op.
pub struct ChunkSink {
    tx: mpsc::Sender<Result<Bytes, ConvertError>>,
    closed: AtomicBool,
}

impl ChunkSink {
    pub fn new(tx: mpsc::Sender<Result<Bytes, ConvertError>>) -> Self {
        Self {
            tx,
            closed: AtomicBool::new(false),
        }
    }

    /// Forward one item. Returns `false` once the sink is closed, whether
    /// by us or by the consumer dropping its end.
    pub async fn emit(&self, item: Result<Bytes, ConvertError>) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.tx.send(item).await.is_err() {
            self.close();
            return false;
        }
        true
    }

    /// Deliver a terminal error, then close.
    pub async fn fail(&self, err: ConvertError) {
        self.emit(Err(err)).await;
        self.close();
    }

    /// Mark the sink closed. Only the first call returns `true`.
    pub fn close(&self) -> bool {
        !self.closed.swap(true, Ordering::AcqRel)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    async fn cancelled(&self) {
        self.tx.closed().await
    }
}
