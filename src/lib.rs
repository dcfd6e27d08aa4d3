//! Converts a stream of line-delimited raw messages into transport-ready
//! structured messages.
//!
//! This is the stage of a log tailing agent that sits between the byte-level
//! reader and the downstream transport. Over-long physical lines are cut at
//! the line limit without losing the offset accounting that lets the tailer
//! resume at the right byte after a restart, multi-line logical messages
//! (stack traces, multi-line exceptions) are reassembled behind a
//! start-of-message pattern, and streams of unknown shape are probed against
//! a catalogue of well-known timestamp prefixes before committing to a
//! handler.

#![deny(clippy::all)]

mod auto_multiline;
mod message;
mod multi_line;
mod single_line;
mod timestamp;

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub use self::auto_multiline::{AutoMultilineConfig, AutoMultilineHandler};
pub use self::message::Message;
pub use self::multi_line::{InvalidPatternError, MultiLineConfig, MultiLineHandler};
pub use self::single_line::{SingleLineConfig, SingleLineHandler};

/// Sentinel marking a cut at the line limit: appended to the payload that was
/// cut, and prepended to the payload carrying its continuation.
pub const TRUNCATED_FLAG: &[u8] = b"...TRUNCATED...";

/// Literal backslash-n written between aggregated lines, so the downstream
/// transport, which frames on a real line feed, sees a single frame.
pub const ESCAPED_LINE_FEED: &[u8] = b"\\n";

/// Default maximum byte length of an output's content.
pub const DEFAULT_LINE_LIMIT: usize = 256_000;

/// Default idle duration after which a partial aggregation is flushed
/// downstream.
pub const DEFAULT_FLUSH_TIMEOUT: Duration = Duration::from_millis(1000);

/// Default number of leading lines probed before committing to multi-line
/// aggregation.
pub const DEFAULT_LINES_TO_ASSESS: usize = 12;

/// Strips leading and trailing line whitespace from `content`.
///
/// The predicate covers ASCII space, tab, CR, LF, vertical tab and form feed.
/// `u8::is_ascii_whitespace` is not used because it excludes the vertical
/// tab.
pub(crate) fn trim_whitespace(content: &[u8]) -> &[u8] {
    let is_space = |b: &u8| matches!(*b, b' ' | b'\t' | b'\r' | b'\n' | 0x0b | 0x0c);
    let start = content
        .iter()
        .position(|b| !is_space(b))
        .unwrap_or(content.len());
    let end = content
        .iter()
        .rposition(|b| !is_space(b))
        .map_or(start, |i| i + 1);
    &content[start..end]
}

/// A line handler of any variant, as built from a [`LineHandlerConfig`].
#[derive(Debug)]
pub enum LineHandler {
    /// Forwards each input as one output.
    SingleLine(SingleLineHandler),
    /// Aggregates consecutive inputs into one output.
    MultiLine(MultiLineHandler),
    /// Forwards inputs one-to-one while probing for a timestamp prefix, then
    /// commits to either mode.
    AutoMultiline(AutoMultilineHandler),
}

impl LineHandler {
    /// Enqueues one raw line.
    pub async fn handle(&self, message: Message) {
        match self {
            LineHandler::SingleLine(handler) => handler.handle(message).await,
            LineHandler::MultiLine(handler) => handler.handle(message).await,
            LineHandler::AutoMultiline(handler) => handler.handle(message).await,
        }
    }

    /// Spawns the handler's worker.
    pub fn start(&mut self) {
        match self {
            LineHandler::SingleLine(handler) => handler.start(),
            LineHandler::MultiLine(handler) => handler.start(),
            LineHandler::AutoMultiline(handler) => handler.start(),
        }
    }

    /// Closes the input side; the worker drains, flushes anything buffered
    /// and closes the output sink.
    pub async fn stop(self) {
        match self {
            LineHandler::SingleLine(handler) => handler.stop().await,
            LineHandler::MultiLine(handler) => handler.stop().await,
            LineHandler::AutoMultiline(handler) => handler.stop().await,
        }
    }
}

/// Configuration selecting and parameterizing a line handler variant.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum LineHandlerConfig {
    /// Forward each line as-is.
    SingleLine(SingleLineConfig),
    /// Aggregate lines behind a user-supplied start-of-message pattern.
    MultiLine(MultiLineConfig),
    /// Probe leading lines for a well-known timestamp prefix, then commit.
    AutoMultiline(AutoMultilineConfig),
}

impl LineHandlerConfig {
    /// Builds the configured handler variant over `output`.
    pub fn build(&self, output: mpsc::Sender<Message>) -> Result<LineHandler, InvalidPatternError> {
        match self {
            LineHandlerConfig::SingleLine(config) => {
                Ok(LineHandler::SingleLine(config.build(output)))
            }
            LineHandlerConfig::MultiLine(config) => {
                Ok(LineHandler::MultiLine(config.build(output)?))
            }
            LineHandlerConfig::AutoMultiline(config) => {
                Ok(LineHandler::AutoMultiline(config.build(output)))
            }
        }
    }
}

impl From<SingleLineConfig> for LineHandlerConfig {
    fn from(config: SingleLineConfig) -> Self {
        Self::SingleLine(config)
    }
}

impl From<MultiLineConfig> for LineHandlerConfig {
    fn from(config: MultiLineConfig) -> Self {
        Self::MultiLine(config)
    }
}

impl From<AutoMultilineConfig> for LineHandlerConfig {
    fn from(config: AutoMultilineConfig) -> Self {
        Self::AutoMultiline(config)
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::trim_whitespace;

    #[rstest]
    #[case(b"  hello  ", b"hello")]
    #[case(b"\t\x0b\x0chello\r\n", b"hello")]
    #[case(b"", b"")]
    #[case(b" \t\r\n\x0b\x0c", b"")]
    #[case(b"inner  space", b"inner  space")]
    #[case(b"no-op", b"no-op")]
    fn trims_line_whitespace(#[case] content: &[u8], #[case] expected: &[u8]) {
        assert_eq!(trim_whitespace(content), expected);
    }
}
