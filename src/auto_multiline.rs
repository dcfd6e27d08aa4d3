//! A line handler that senses whether a stream is single-line or multi-line
//! by probing its leading lines for a well-known timestamp prefix.

use regex::bytes::Regex;
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};
use tracing::{debug, info};

use crate::{
    DEFAULT_FLUSH_TIMEOUT, DEFAULT_LINE_LIMIT, DEFAULT_LINES_TO_ASSESS, Message, multi_line,
    single_line::SingleLineProcessor, timestamp::well_known_timestamp_formats,
};

/// Config used to build an `AutoMultilineHandler`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AutoMultilineConfig {
    /// The maximum byte length of an output's content.
    #[serde(default = "default_line_limit")]
    pub line_limit: usize,

    /// How many leading lines are probed before committing to multi-line
    /// aggregation.
    #[serde(default = "default_lines_to_assess")]
    pub lines_to_assess: usize,
}

const fn default_line_limit() -> usize {
    DEFAULT_LINE_LIMIT
}

const fn default_lines_to_assess() -> usize {
    DEFAULT_LINES_TO_ASSESS
}

impl Default for AutoMultilineConfig {
    fn default() -> Self {
        Self {
            line_limit: default_line_limit(),
            lines_to_assess: default_lines_to_assess(),
        }
    }
}

impl AutoMultilineConfig {
    /// Build the `AutoMultilineHandler` from this configuration.
    pub fn build(&self, output: mpsc::Sender<Message>) -> AutoMultilineHandler {
        AutoMultilineHandler::new(output, self.line_limit, self.lines_to_assess)
    }
}

/// Forwards inputs one-to-one while probing their content against the
/// catalogue of well-known timestamp prefixes. Once `lines_to_assess`
/// consecutive lines have matched, the handler commits to multi-line
/// aggregation keyed on the surviving prefix; the first line matching no
/// surviving prefix commits it to single-line forwarding instead. Either
/// commitment is permanent.
#[derive(Debug)]
pub struct AutoMultilineHandler {
    input: mpsc::Sender<Message>,
    worker: Option<Worker>,
    task: Option<JoinHandle<()>>,
}

impl AutoMultilineHandler {
    /// Creates a handler emitting to `output`, probing `lines_to_assess`
    /// leading lines.
    pub fn new(output: mpsc::Sender<Message>, line_limit: usize, lines_to_assess: usize) -> Self {
        let (input, receiver) = mpsc::channel(1);
        let (commit, switch) = oneshot::channel();
        Self {
            input,
            worker: Some(Worker {
                input: receiver,
                processor: SingleLineProcessor::new(output.clone(), line_limit),
                output,
                detection: TimestampDetection::new(lines_to_assess, commit),
                switch,
                line_limit,
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

    /// Spawns the worker in probing mode.
    pub fn start(&mut self) {
        if let Some(worker) = self.worker.take() {
            self.task = Some(tokio::spawn(worker.run()));
        }
    }

    /// Closes the input side and waits for the worker to drain. Whichever
    /// mode is active at that point flushes and closes the output sink.
    pub async fn stop(self) {
        drop(self.input);
        if let Some(task) = self.task {
            task.await.expect("auto-multiline worker panicked");
        }
    }
}

#[derive(Debug)]
struct Worker {
    input: mpsc::Receiver<Message>,
    output: mpsc::Sender<Message>,
    processor: SingleLineProcessor,
    detection: TimestampDetection,
    switch: oneshot::Receiver<&'static Regex>,
    line_limit: usize,
}

impl Worker {
    async fn run(self) {
        let Worker {
            mut input,
            output,
            mut processor,
            mut detection,
            mut switch,
            line_limit,
        } = self;

        // Only one consumer loop ever reads `input`: this one until the
        // switch signal is observed, then the multi-line worker it hands the
        // channel to. The signal is polled ahead of the input so no line
        // enqueued after a commit is processed single-line.
        let mut probing = true;
        let committed = loop {
            tokio::select! {
                biased;
                commit = &mut switch, if probing => match commit {
                    Ok(new_content) => break Some(new_content),
                    Err(_) => probing = false,
                },
                received = input.recv() => match received {
                    Some(message) => {
                        if probing {
                            let content = message.content.clone();
                            processor.process(message).await;
                            probing = detection.assess(&content);
                        } else {
                            processor.process(message).await;
                        }
                    }
                    None => break None,
                },
            }
        };

        if let Some(new_content) = committed {
            info!(
                message = "Committing to multi-line aggregation.",
                pattern = %new_content
            );
            // Dropping the single-line processor releases its clone of the
            // output sender; the sink itself stays open across the handover.
            drop(processor);
            multi_line::Worker::new(
                input,
                output,
                new_content.clone(),
                DEFAULT_FLUSH_TIMEOUT,
                line_limit,
            )
            .run()
            .await;
        }
    }
}

/// Tracks which of the well-known timestamp prefixes are still plausible for
/// the stream, and fires the commit signal once enough leading lines have
/// matched.
#[derive(Debug)]
struct TimestampDetection {
    candidates: Vec<&'static Regex>,
    assessed: usize,
    lines_to_assess: usize,
    commit: Option<oneshot::Sender<&'static Regex>>,
}

impl TimestampDetection {
    fn new(lines_to_assess: usize, commit: oneshot::Sender<&'static Regex>) -> Self {
        Self {
            candidates: well_known_timestamp_formats().iter().collect(),
            assessed: 0,
            lines_to_assess,
            commit: Some(commit),
        }
    }

    /// Probes one line, narrowing the surviving set. Returns whether probing
    /// should continue.
    fn assess(&mut self, content: &[u8]) -> bool {
        self.candidates.retain(|format| format.is_match(content));
        if self.candidates.is_empty() {
            debug!(message = "No known timestamp prefix matched, staying single-line.");
            self.commit = None;
            return false;
        }

        self.assessed += 1;
        if self.assessed >= self.lines_to_assess
            && let Some(commit) = self.commit.take()
        {
            // Ties among surviving prefixes resolve in catalogue order.
            let _ = commit.send(self.candidates[0]);
        }
        true
    }
}
