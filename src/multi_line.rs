//! A line handler that reassembles multi-line logical messages (stack
//! traces, multi-line exceptions) behind a start-of-message pattern.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, sleep},
};
use tracing::warn;

use crate::{
    DEFAULT_FLUSH_TIMEOUT, DEFAULT_LINE_LIMIT, ESCAPED_LINE_FEED, Message, TRUNCATED_FLAG,
    trim_whitespace,
};

/// Error returned when a configured start-of-message pattern does not
/// compile.
#[derive(Debug, Snafu)]
#[snafu(display("invalid start-of-message pattern {pattern:?}"))]
pub struct InvalidPatternError {
    pattern: String,
    source: regex::Error,
}

/// Config used to build a `MultiLineHandler`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MultiLineConfig {
    /// Pattern matching the first physical line of a new logical message.
    pub pattern: String,

    /// How long, in milliseconds, an idle aggregation waits before it is
    /// flushed downstream.
    #[serde(default = "default_flush_timeout_millis")]
    pub flush_timeout_millis: u64,

    /// The maximum byte length of an output's content.
    #[serde(default = "default_line_limit")]
    pub line_limit: usize,
}

const fn default_flush_timeout_millis() -> u64 {
    DEFAULT_FLUSH_TIMEOUT.as_millis() as u64
}

const fn default_line_limit() -> usize {
    DEFAULT_LINE_LIMIT
}

impl MultiLineConfig {
    /// Creates a config with the given pattern and defaults elsewhere.
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            flush_timeout_millis: default_flush_timeout_millis(),
            line_limit: default_line_limit(),
        }
    }

    /// Build the `MultiLineHandler` from this configuration.
    pub fn build(
        &self,
        output: mpsc::Sender<Message>,
    ) -> Result<MultiLineHandler, InvalidPatternError> {
        let new_content = Regex::new(&self.pattern).context(InvalidPatternSnafu {
            pattern: self.pattern.clone(),
        })?;
        Ok(MultiLineHandler::new(
            output,
            new_content,
            Duration::from_millis(self.flush_timeout_millis),
            self.line_limit,
        ))
    }
}

/// Aggregates consecutive inputs into one output until the next input
/// matches the start-of-message pattern, the aggregation crosses the line
/// limit, or the flush timeout elapses.
#[derive(Debug)]
pub struct MultiLineHandler {
    input: mpsc::Sender<Message>,
    worker: Option<Worker>,
    task: Option<JoinHandle<()>>,
}

impl MultiLineHandler {
    /// Creates a handler emitting to `output`. `new_content` marks the first
    /// physical line of a new logical message.
    pub fn new(
        output: mpsc::Sender<Message>,
        new_content: Regex,
        flush_timeout: Duration,
        line_limit: usize,
    ) -> Self {
        let (input, receiver) = mpsc::channel(1);
        Self {
            input,
            worker: Some(Worker::new(
                receiver,
                output,
                new_content,
                flush_timeout,
                line_limit,
            )),
            task: None,
        }
    }

    /// Enqueues one raw line. Blocks while the worker is saturated, which is
    /// how downstream backpressure reaches the producer.
    pub async fn handle(&self, message: Message) {
        self.input
            .send(message)
            .await
            .expect("line handler input closed");
    }

    /// Spawns the worker and arms the flush timer.
    pub fn start(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.task = Some(tokio::spawn(worker.run()));
        }
    }

    /// Closes the input side and waits for the worker to drain. Any partial
    /// aggregation is flushed before the output sink closes.
    pub async fn stop(self) {
        drop(self.input);
        if let Some(task) = self.task {
            task.await.expect("multi-line worker panicked");
        }
    }
}

#[derive(Debug)]
pub(crate) struct Worker {
    input: mpsc::Receiver<Message>,
    aggregator: Aggregator,
    flush_timeout: Duration,
}

impl Worker {
    pub(crate) fn new(
        input: mpsc::Receiver<Message>,
        output: mpsc::Sender<Message>,
        new_content: Regex,
        flush_timeout: Duration,
        line_limit: usize,
    ) -> Self {
        Self {
            input,
            aggregator: Aggregator::new(output, new_content, line_limit),
            flush_timeout,
        }
    }

    pub(crate) async fn run(mut self) {
        // Single-shot flush timer, rearmed on every input. The loop owns
        // both the timer tick and input closure, so a stop racing a tick
        // still ends in one terminal flush and one sink closure.
        let timer = sleep(self.flush_timeout);
        tokio::pin!(timer);
        let mut armed = true;
        loop {
            tokio::select! {
                received = self.input.recv() => match received {
                    Some(message) => {
                        self.aggregator.process(message).await;
                        timer.as_mut().reset(Instant::now() + self.flush_timeout);
                        armed = true;
                    }
                    None => break,
                },
                () = timer.as_mut(), if armed => {
                    armed = false;
                    self.aggregator.flush().await;
                }
            }
        }
        self.aggregator.flush().await;
    }
}

#[derive(Debug)]
struct Aggregator {
    output: mpsc::Sender<Message>,
    new_content: Regex,
    line_limit: usize,
    buffer: BytesMut,
    raw_data_len: usize,
    timestamp: String,
    status: String,
    should_truncate: bool,
}

impl Aggregator {
    fn new(output: mpsc::Sender<Message>, new_content: Regex, line_limit: usize) -> Self {
        Self {
            output,
            new_content,
            line_limit,
            buffer: BytesMut::new(),
            raw_data_len: 0,
            timestamp: String::new(),
            status: String::new(),
            should_truncate: false,
        }
    }

    async fn process(&mut self, message: Message) {
        if self.new_content.is_match(&message.content) {
            self.flush().await;
        }

        let was_truncated = self.should_truncate;
        self.should_truncate = false;

        // Offset accounting and origin metadata follow the latest line even
        // when its content later trims to nothing.
        self.raw_data_len += message.raw_data_len;
        self.timestamp = message.timestamp;
        self.status = message.status;

        if !self.buffer.is_empty() {
            self.buffer.extend_from_slice(ESCAPED_LINE_FEED);
        }
        if was_truncated {
            self.buffer.extend_from_slice(TRUNCATED_FLAG);
        }
        self.buffer.extend_from_slice(&message.content);

        if self.buffer.len() >= self.line_limit {
            warn!(
                message = "Aggregated content crossed the line limit, truncating.",
                length = self.buffer.len(),
                limit = self.line_limit,
                internal_log_rate_limit = true
            );
            self.buffer.extend_from_slice(TRUNCATED_FLAG);
            self.flush().await;
            self.should_truncate = true;
        }
    }

    async fn flush(&mut self) {
        let content = trim_whitespace(&self.buffer);
        if !content.is_empty() || self.raw_data_len > 0 {
            let message = Message::new(
                Bytes::copy_from_slice(content),
                self.status.clone(),
                self.timestamp.clone(),
                self.raw_data_len,
            );
            self.output
                .send(message)
                .await
                .expect("output sink closed before the line handler finished");
        }
        self.buffer.clear();
        self.raw_data_len = 0;
        self.should_truncate = false;
    }
}
