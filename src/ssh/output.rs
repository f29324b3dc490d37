//! Streamed command output
//!
//! Output from remote commands is forwarded chunk by chunk to an
//! [`OutputSink`]. What a sink gets to see is decided by its [`OutputMode`];
//! the mode never changes what runs on the device.

use serde::Serialize;
use tokio::sync::mpsc;

/// Presentation policy carried by a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputMode {
    /// Echo `$ command`, stream output, report `[exit N]`
    #[default]
    Normal,
    /// Stream output only
    Raw,
    /// Echo the command line only
    CommandsOnly,
}

impl OutputMode {
    /// Whether a sink in this mode should receive `event`
    pub fn allows(&self, event: &OutputEvent) -> bool {
        match (self, event) {
            (OutputMode::Normal, _) => true,
            (OutputMode::Raw, OutputEvent::Stdout(_) | OutputEvent::Stderr(_)) => true,
            (OutputMode::Raw, _) => false,
            (OutputMode::CommandsOnly, OutputEvent::Command(_)) => true,
            (OutputMode::CommandsOnly, _) => false,
        }
    }
}

/// A single item of streamed output
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "text", rename_all = "kebab-case")]
pub enum OutputEvent {
    /// The command line about to run
    Command(String),
    Stdout(String),
    Stderr(String),
    /// Remote exit status
    Exit(u32),
    /// Human-readable progress line from a flow
    Message(String),
}

impl OutputEvent {
    /// Text to show in a log view
    pub fn render(&self) -> String {
        match self {
            OutputEvent::Command(cmd) => format!("$ {}", cmd),
            OutputEvent::Stdout(text) | OutputEvent::Stderr(text) => text.clone(),
            OutputEvent::Exit(code) => format!("[exit {}]", code),
            OutputEvent::Message(text) => text.clone(),
        }
    }
}

/// Receiver of streamed output
pub trait OutputSink: Send {
    fn mode(&self) -> OutputMode {
        OutputMode::Normal
    }

    fn emit(&mut self, event: OutputEvent);
}

/// Forward `event` if the sink's mode allows it
pub fn present(sink: &mut dyn OutputSink, event: OutputEvent) {
    if sink.mode().allows(&event) {
        sink.emit(event);
    }
}

/// Emit a flow message
pub fn message(sink: &mut dyn OutputSink, text: impl Into<String>) {
    present(sink, OutputEvent::Message(text.into()));
}

/// Sink that keeps every event it is allowed to see
#[derive(Debug, Default)]
pub struct CollectingSink {
    mode: OutputMode,
    pub events: Vec<OutputEvent>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_mode(mode: OutputMode) -> Self {
        Self {
            mode,
            events: Vec::new(),
        }
    }

    /// Concatenated stdout and stderr chunks, in arrival order
    pub fn output(&self) -> String {
        self.events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Stdout(t) | OutputEvent::Stderr(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }
}

impl OutputSink for CollectingSink {
    fn mode(&self) -> OutputMode {
        self.mode
    }

    fn emit(&mut self, event: OutputEvent) {
        self.events.push(event);
    }
}

/// Sink handing events to another task over an unbounded channel.
///
/// A closed receiver is ignored: output of a worker nobody listens to is
/// dropped, the worker keeps going.
pub struct ChannelSink<T> {
    mode: OutputMode,
    tx: mpsc::UnboundedSender<T>,
    wrap: Box<dyn Fn(OutputEvent) -> T + Send>,
}

impl<T: Send> ChannelSink<T> {
    /// `wrap` turns each event into the channel's message type, e.g. to
    /// tag it with the id of the flow that produced it
    pub fn new(
        tx: mpsc::UnboundedSender<T>,
        mode: OutputMode,
        wrap: impl Fn(OutputEvent) -> T + Send + 'static,
    ) -> Self {
        Self {
            mode,
            tx,
            wrap: Box::new(wrap),
        }
    }
}

impl<T: Send> OutputSink for ChannelSink<T> {
    fn mode(&self) -> OutputMode {
        self.mode
    }

    fn emit(&mut self, event: OutputEvent) {
        let _ = self.tx.send((self.wrap)(event));
    }
}

/// Forwards to an inner sink while capturing all command output
pub struct TeeSink<'a> {
    inner: &'a mut dyn OutputSink,
    captured: String,
}

impl<'a> TeeSink<'a> {
    pub fn new(inner: &'a mut dyn OutputSink) -> Self {
        Self {
            inner,
            captured: String::new(),
        }
    }

    pub fn into_captured(self) -> String {
        self.captured
    }
}

impl OutputSink for TeeSink<'_> {
    fn emit(&mut self, event: OutputEvent) {
        if let OutputEvent::Stdout(text) | OutputEvent::Stderr(text) = &event {
            self.captured.push_str(text);
        }
        present(self.inner, event);
    }
}

/// Incremental UTF-8 decoder.
///
/// A multibyte sequence split across two chunks is held back until the rest
/// arrives; invalid bytes become U+FFFD. Never fails.
#[derive(Debug, Default)]
pub struct ChunkDecoder {
    pending: Vec<u8>,
}

impl ChunkDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to guarantees this prefix is UTF-8
                    out.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[bad..];
                        }
                        None => {
                            // incomplete sequence at the end, wait for more
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        let leftover = rest.to_vec();
        self.pending = leftover;
        out
    }

    /// Flush whatever is still held back
    pub fn finish(&mut self) -> String {
        let tail = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        tail
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_filtering() {
        let cmd = OutputEvent::Command("ls".into());
        let out = OutputEvent::Stdout("a\n".into());
        let exit = OutputEvent::Exit(0);

        assert!(OutputMode::Normal.allows(&cmd));
        assert!(OutputMode::Normal.allows(&exit));

        assert!(!OutputMode::Raw.allows(&cmd));
        assert!(OutputMode::Raw.allows(&out));
        assert!(!OutputMode::Raw.allows(&exit));

        assert!(OutputMode::CommandsOnly.allows(&cmd));
        assert!(!OutputMode::CommandsOnly.allows(&out));
        assert!(!OutputMode::CommandsOnly.allows(&OutputEvent::Message("x".into())));
    }

    #[test]
    fn test_render() {
        assert_eq!(OutputEvent::Command("ls /".into()).render(), "$ ls /");
        assert_eq!(OutputEvent::Exit(3).render(), "[exit 3]");
    }

    #[test]
    fn test_decoder_split_multibyte() {
        let bytes = "héllo".as_bytes();
        let mut decoder = ChunkDecoder::new();
        // split inside the two-byte 'é'
        let first = decoder.decode(&bytes[..2]);
        let second = decoder.decode(&bytes[2..]);
        assert_eq!(first, "h");
        assert_eq!(format!("{}{}", first, second), "héllo");
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_decoder_replaces_invalid() {
        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(b"ok\xffgo"), "ok\u{FFFD}go");
    }

    #[test]
    fn test_decoder_flushes_truncated_tail() {
        let mut decoder = ChunkDecoder::new();
        assert_eq!(decoder.decode(b"x\xe2\x82"), "x");
        assert_eq!(decoder.finish(), "\u{FFFD}");
    }

    #[test]
    fn test_tee_captures_even_when_inner_is_quiet() {
        let mut quiet = CollectingSink::with_mode(OutputMode::CommandsOnly);
        let mut tee = TeeSink::new(&mut quiet);
        present(&mut tee, OutputEvent::Command("id".into()));
        present(&mut tee, OutputEvent::Stdout("uid=0\n".into()));
        present(&mut tee, OutputEvent::Exit(0));
        assert_eq!(tee.into_captured(), "uid=0\n");
        assert_eq!(quiet.events, vec![OutputEvent::Command("id".into())]);
    }

    #[test]
    fn test_channel_sink_preserves_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut sink = ChannelSink::new(tx, OutputMode::Normal, |e| e);
        message(&mut sink, "one");
        message(&mut sink, "two");
        assert_eq!(rx.try_recv().unwrap(), OutputEvent::Message("one".into()));
        assert_eq!(rx.try_recv().unwrap(), OutputEvent::Message("two".into()));
    }
}
