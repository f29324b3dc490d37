//! Command execution over SSH
//!
//! Provides the [`RemoteExecutor`] seam and the streaming loop that turns
//! channel messages into [`OutputEvent`]s as they arrive.

use async_trait::async_trait;
use russh::client::Msg;
use russh::{Channel, ChannelMsg};
use tracing::{debug, warn};

use super::output::{present, ChunkDecoder, OutputEvent, OutputSink, TeeSink};
use crate::error::{IsyncError, Result};

/// Exit status reported when the remote process was killed by a signal
pub const SIGNAL_EXIT_STATUS: u32 = 255;

/// Runs shell commands on a device
#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    /// Run `command` in the remote shell and return its exit status.
    ///
    /// Output is forwarded to `sink` incrementally, filtered by the sink's
    /// mode. A non-zero status is not an error here.
    async fn exec(&self, command: &str, sink: &mut dyn OutputSink) -> Result<u32>;
}

/// Run `command` and turn a non-zero exit status into
/// [`IsyncError::RemoteCommand`] carrying the captured output.
pub async fn exec_checked(
    executor: &dyn RemoteExecutor,
    command: &str,
    sink: &mut dyn OutputSink,
) -> Result<()> {
    let mut tee = TeeSink::new(sink);
    let exit_code = executor.exec(command, &mut tee).await?;
    if exit_code == 0 {
        return Ok(());
    }
    Err(IsyncError::RemoteCommand {
        command: command.to_string(),
        exit_code,
        output: tee.into_captured(),
    })
}

/// Transport-neutral view of what an exec channel delivers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamItem {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    ExitSignal(String),
    Eof,
    Closed,
}

/// Source of [`StreamItem`]s; `None` means the channel is gone
#[async_trait]
pub trait StreamSource: Send {
    async fn next_item(&mut self) -> Option<StreamItem>;
}

/// Adapter over a russh exec channel.
///
/// russh already multiplexes stdout and stderr into one ordered message
/// stream, so a single `wait()` preserves interleaving without polling.
pub struct ChannelSource {
    channel: Channel<Msg>,
}

impl ChannelSource {
    pub fn new(channel: Channel<Msg>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl StreamSource for ChannelSource {
    async fn next_item(&mut self) -> Option<StreamItem> {
        loop {
            let msg = self.channel.wait().await?;
            let item = match msg {
                ChannelMsg::Data { data } => StreamItem::Stdout(data.to_vec()),
                // ext == 1 is SSH_EXTENDED_DATA_STDERR
                ChannelMsg::ExtendedData { data, ext } => {
                    if ext == 1 {
                        StreamItem::Stderr(data.to_vec())
                    } else {
                        StreamItem::Stdout(data.to_vec())
                    }
                }
                ChannelMsg::ExitStatus { exit_status } => StreamItem::ExitStatus(exit_status),
                ChannelMsg::ExitSignal { signal_name, .. } => {
                    StreamItem::ExitSignal(format!("{:?}", signal_name))
                }
                ChannelMsg::Eof => StreamItem::Eof,
                ChannelMsg::Close => StreamItem::Closed,
                _ => continue,
            };
            return Some(item);
        }
    }
}

/// Drain `source`, forwarding decoded chunks to `sink` as they arrive.
///
/// Returns once the channel closes. An exit status must have been seen by
/// then, otherwise the connection dropped mid-command.
pub async fn stream_output(
    source: &mut dyn StreamSource,
    sink: &mut dyn OutputSink,
) -> Result<u32> {
    let mut stdout = ChunkDecoder::new();
    let mut stderr = ChunkDecoder::new();
    let mut exit_code = None;

    while let Some(item) = source.next_item().await {
        match item {
            StreamItem::Stdout(bytes) => {
                let text = stdout.decode(&bytes);
                if !text.is_empty() {
                    present(sink, OutputEvent::Stdout(text));
                }
            }
            StreamItem::Stderr(bytes) => {
                let text = stderr.decode(&bytes);
                if !text.is_empty() {
                    present(sink, OutputEvent::Stderr(text));
                }
            }
            StreamItem::ExitStatus(code) => exit_code = Some(code),
            StreamItem::ExitSignal(signal) => {
                warn!("Remote process terminated by signal {}", signal);
                exit_code = Some(SIGNAL_EXIT_STATUS);
            }
            StreamItem::Eof => {}
            StreamItem::Closed => break,
        }
    }

    let tail = stdout.finish();
    if !tail.is_empty() {
        present(sink, OutputEvent::Stdout(tail));
    }
    let tail = stderr.finish();
    if !tail.is_empty() {
        present(sink, OutputEvent::Stderr(tail));
    }

    match exit_code {
        Some(code) => {
            debug!("Command completed: exit_code={}", code);
            present(sink, OutputEvent::Exit(code));
            Ok(code)
        }
        None => Err(IsyncError::Disconnected(
            "channel closed before an exit status was received".to_string(),
        )),
    }
}
