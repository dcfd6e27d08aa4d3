//! A line handler that forwards each raw line as one structured message,
//! cutting content over the line limit.

use bytes::BytesMut;
use serde::{Deserialize, Serialize};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::warn;

use crate::{DEFAULT_LINE_LIMIT, Message, TRUNCATED_FLAG, trim_whitespace};

/// Config used to build a `SingleLineHandler`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SingleLineConfig {
    /// The maximum byte length of an output's content.
    #[serde(default = "default_line_limit")]
    pub line_limit: usize,
}

const fn default_line_limit() -> usize {
    DEFAULT_LINE_LIMIT
}

impl Default for SingleLineConfig {
    fn default() -> Self {
        Self {
            line_limit: default_line_limit(),
        }
    }
}

impl SingleLineConfig {
    /// Build the `SingleLineHandler` from this configuration.
    pub fn build(&self, output: mpsc::Sender<Message>) -> SingleLineHandler {
        SingleLineHandler::new(output, self.line_limit)
    }
}

/// Forwards each input as one output, cutting over-limit content and marking
/// continuation fragments with [`TRUNCATED_FLAG`].
#[derive(Debug)]
pub struct SingleLineHandler {
    input: mpsc::Sender<Message>,
    worker: Option<Worker>,
    task: Option<JoinHandle<()>>,
}

impl SingleLineHandler {
    /// Creates a handler emitting to `output`, cutting content at
    /// `line_limit` bytes.
    pub fn new(output: mpsc::Sender<Message>, line_limit: usize) -> Self {
        let (input, receiver) = mpsc::channel(1);
        Self {
            input,
            worker: Some(Worker {
                input: receiver,
                processor: SingleLineProcessor::new(output, line_limit),
            }),
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

    /// Spawns the worker. Lines enqueued before `start` are processed once
    /// the worker is live.
    pub fn start(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.task = Some(tokio::spawn(worker.run()));
        }
    }

    /// Closes the input side and waits for the worker to drain. The output
    /// sink closes once the last in-flight line has been emitted.
    pub async fn stop(self) {
        drop(self.input);
        if let Some(task) = self.task {
            task.await.expect("single-line worker panicked");
        }
    }
}

#[derive(Debug)]
struct Worker {
    input: mpsc::Receiver<Message>,
    processor: SingleLineProcessor,
}

impl Worker {
    async fn run(mut self) {
        while let Some(message) = self.input.recv().await {
            self.processor.process(message).await;
        }
    }
}

/// The single-line processing state. The auto-multiline handler runs the
/// same processor while it probes the stream.
#[derive(Debug)]
pub(crate) struct SingleLineProcessor {
    output: mpsc::Sender<Message>,
    line_limit: usize,
    should_truncate: bool,
}

impl SingleLineProcessor {
    pub(crate) fn new(output: mpsc::Sender<Message>, line_limit: usize) -> Self {
        Self {
            output,
            line_limit,
            should_truncate: false,
        }
    }

    pub(crate) async fn process(&mut self, message: Message) {
        let Message {
            content,
            status,
            timestamp,
            raw_data_len,
        } = message;

        // raw_data_len tracks the source bytes, so trimming does not touch it.
        let trimmed = trim_whitespace(&content);
        let mut line = BytesMut::with_capacity(trimmed.len() + TRUNCATED_FLAG.len());
        if self.should_truncate {
            line.extend_from_slice(TRUNCATED_FLAG);
            self.should_truncate = false;
        }
        line.extend_from_slice(trimmed);

        if line.len() >= self.line_limit {
            warn!(
                message = "Truncating line over the line limit.",
                length = line.len(),
                limit = self.line_limit,
                internal_log_rate_limit = true
            );
            line.extend_from_slice(TRUNCATED_FLAG);
            self.should_truncate = true;
        }

        // Lines that trim to nothing still carry raw_data_len, and skipping
        // them would stall the offset accounting.
        let message = Message::new(line.freeze(), status, timestamp, raw_data_len);
        self.output
            .send(message)
            .await
            .expect("output sink closed before the line handler finished");
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use tracing_test::traced_test;

    use super::*;

    #[tokio::test]
    async fn forwards_trimmed_lines() {
        let (output, mut received) = mpsc::channel(4);
        let mut handler = SingleLineHandler::new(output, 100);
        handler.start();

        handler
            .handle(Message::new("  hello world \t", "info", "ts-1", 16))
            .await;
        handler.stop().await;

        let message = received.recv().await.expect("one output");
        assert_eq!(message.content, Bytes::from("hello world"));
        assert_eq!(message.status, "info");
        assert_eq!(message.timestamp, "ts-1");
        assert_eq!(message.raw_data_len, 16);
        assert!(received.recv().await.is_none());
    }

    #[tokio::test]
    async fn marks_both_sides_of_a_cut() {
        let limit = 20;
        let (output, mut received) = mpsc::channel(4);
        let mut handler = SingleLineHandler::new(output, limit);
        handler.start();

        handler
            .handle(Message::new(vec![b'a'; limit], "info", "t0", limit + 1))
            .await;
        handler.handle(Message::new("tail!", "info", "t1", 6)).await;
        handler.stop().await;

        let first = received.recv().await.expect("first output");
        assert!(first.content.ends_with(TRUNCATED_FLAG));
        assert_eq!(first.content.len(), limit + TRUNCATED_FLAG.len());

        let second = received.recv().await.expect("second output");
        assert!(second.content.starts_with(TRUNCATED_FLAG));
        assert!(second.content.ends_with(b"tail!"));
        assert!(received.recv().await.is_none());
    }

    #[tokio::test]
    async fn a_short_line_closes_the_continuation_chain() {
        let limit = 30;
        let (output, mut received) = mpsc::channel(8);
        let mut handler = SingleLineHandler::new(output, limit);
        handler.start();

        handler
            .handle(Message::new(vec![b'x'; limit], "info", "t0", limit))
            .await;
        handler.handle(Message::new("end", "info", "t1", 4)).await;
        handler.handle(Message::new("fresh", "info", "t2", 6)).await;
        handler.stop().await;

        let first = received.recv().await.expect("first output");
        assert!(first.content.ends_with(TRUNCATED_FLAG));

        let second = received.recv().await.expect("second output");
        assert!(second.content.starts_with(TRUNCATED_FLAG));
        assert!(!second.content.ends_with(TRUNCATED_FLAG));

        let third = received.recv().await.expect("third output");
        assert_eq!(third.content, Bytes::from("fresh"));
    }

    #[tokio::test]
    async fn emits_blank_lines_for_offset_progress() {
        let (output, mut received) = mpsc::channel(4);
        let mut handler = SingleLineHandler::new(output, 100);
        handler.start();

        handler.handle(Message::new(" \t ", "info", "t0", 4)).await;
        handler.stop().await;

        let message = received.recv().await.expect("one output");
        assert!(message.content.is_empty());
        assert_eq!(message.raw_data_len, 4);
    }

    #[tokio::test]
    #[traced_test]
    async fn warns_when_truncating() {
        let (output, mut received) = mpsc::channel(4);
        let mut handler = SingleLineHandler::new(output, 5);
        handler.start();

        handler
            .handle(Message::new("abcdefghij", "info", "t0", 11))
            .await;
        handler.stop().await;

        assert!(received.recv().await.is_some());
        assert!(logs_contain("Truncating line over the line limit."));
    }
}
