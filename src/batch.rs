use log::{Level, debug, error, info, log_enabled};
use regex::Regex;
use std::collections::BTreeSet as Set;
use std::io;
use std::sync::LazyLock;

use crate::backend::{KernelBackend, Tool};


/// Classified cause of a rejected line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    AlreadyExists,
    InUse,
    /// a set referenced as a list member does not exist
    MemberMissing,
    DoesNotExist,
    Other,
}

const MESSAGES: &[(&str, ErrorKind)] = &[
    (
        "Set to be added/deleted/tested as element does not exist",
        ErrorKind::MemberMissing,
    ),
    ("set with the same name already exists", ErrorKind::AlreadyExists),
    ("it's already added", ErrorKind::AlreadyExists),
    ("Chain already exists", ErrorKind::AlreadyExists),
    ("File exists", ErrorKind::AlreadyExists),
    ("in use by a kernel component", ErrorKind::InUse),
    ("Device or resource busy", ErrorKind::InUse),
    ("Too many links", ErrorKind::InUse),
    ("The set with the given name does not exist", ErrorKind::DoesNotExist),
    ("it's not added", ErrorKind::DoesNotExist),
    ("does a matching rule exist", ErrorKind::DoesNotExist),
    ("No chain/target/match by that name", ErrorKind::DoesNotExist),
    ("No such file or directory", ErrorKind::DoesNotExist),
];

impl ErrorKind {
    pub fn classify(message: &str) -> Self {
        MESSAGES
            .iter()
            .find(|(text, _)| message.contains(text))
            .map(|(_, kind)| *kind)
            .unwrap_or(Self::Other)
    }
}

static FAILED_LINE: LazyLock<Result<Regex, regex::Error>> =
    LazyLock::new(|| Regex::new(r"(?i)\bline (\d+)"));

/// Line number (1-based, in the submitted file) reported by the tool.
pub fn failed_line(message: &str) -> Option<usize> {
    let re = FAILED_LINE.as_ref().ok()?;
    re.captures(message)?.get(1)?.as_str().parse().ok()
}

/// What a rejected line means for its section.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Handling {
    /// the kernel is already in the wanted state for this line
    Ignore,
    /// like `Ignore`, and the other lines of the section are not needed anymore
    IgnoreSection,
    /// leave the section pending for a later apply, without failing this one
    Defer,
    /// unresolved failure; the section stays pending and the apply fails
    Fail,
}

pub type Handler = fn(ErrorKind) -> Handling;

/// Handler for lines whose failure is always unresolved.
pub fn fail(_: ErrorKind) -> Handling {
    Handling::Fail
}

#[derive(Clone, Debug)]
pub struct Line {
    pub text: String,
    /// entity the line belongs to
    pub section: Option<String>,
    handler: Handler,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{tool} restore could not run: {source}")]
    Exec {
        tool: Tool,
        #[source]
        source: io::Error,
    },
    #[error("{tool} restore failed without a usable line number: {message}")]
    Unparsable { tool: Tool, message: String },
    #[error("{tool} restore rejected {text:?} ({kind:?}): {message}")]
    LineFailed {
        tool: Tool,
        kind: ErrorKind,
        text: String,
        message: String,
    },
    #[error("{tool} restore still failing after {tries} tries: {message}")]
    RetryFailed {
        tool: Tool,
        tries: usize,
        message: String,
    },
}

/// Result of a batch run.
#[derive(Debug, Default)]
pub struct Outcome {
    /// sections with lines that did not apply
    pub failed: Set<String>,
    /// sections left pending by a `Defer` handling
    pub deferred: Set<String>,
    pub retries: usize,
    /// first unresolved error
    pub error: Option<Error>,
}
impl Outcome {
    /// Sections that must stay pending.
    pub fn pending(&self) -> impl Iterator<Item = &String> {
        self.failed.union(&self.deferred)
    }

    pub fn is_pending(&self, section: &str) -> bool {
        self.failed.contains(section) || self.deferred.contains(section)
    }

    fn fail(&mut self, error: Error) {
        self.error.get_or_insert(error);
    }

    fn fail_lines(&mut self, lines: &[Line]) {
        self.failed
            .extend(lines.iter().filter_map(|l| l.section.clone()));
    }
}

/// An ordered restore file for one tool, run as a single call.
///
/// When the tool rejects a line, the line's handler decides what the failure means. The failing
/// line (and the rest of its section when needed) is removed and the remainder is submitted
/// again, a bounded number of times.
pub struct Batch {
    tool: Tool,
    lines: Vec<Line>,
}

impl Batch {
    pub fn new(tool: Tool) -> Self {
        Self {
            tool,
            lines: Vec::new(),
        }
    }

    pub fn tool(&self) -> Tool {
        self.tool
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(|l| l.text.as_str())
    }

    pub fn push(&mut self, section: Option<&str>, handler: Handler, text: impl Into<String>) {
        self.lines.push(Line {
            text: text.into(),
            section: section.map(str::to_string),
            handler,
        });
    }

    /// The restore file as submitted to the tool.
    pub fn render(&self) -> String {
        render(self.tool, &self.lines)
    }

    /// Submit the batch, recovering from rejected lines up to `max_tries` submissions.
    pub fn run(self, backend: &dyn KernelBackend, max_tries: usize) -> Outcome {
        let Self { tool, mut lines } = self;
        let mut outcome = Outcome::default();
        let max_tries = max_tries.max(1);

        for attempt in 1..=max_tries {
            if lines.is_empty() {
                break;
            }

            let script = render(tool, &lines);
            debug!("{tool}: submitting {} lines (try {attempt})", lines.len());

            let output = match backend.restore(tool, &script) {
                Ok(output) => output,
                Err(source) => {
                    error!("{tool}: restore failed to run: {source}");
                    outcome.fail_lines(&lines);
                    outcome.fail(Error::Exec { tool, source });
                    return outcome;
                }
            };
            if output.success() {
                return outcome;
            }

            let message = output.message();
            if log_enabled!(Level::Debug) {
                debug!("{tool}: restore failed ({message}), batch was:\n{script}");
            }

            let index = failed_line(&message)
                .and_then(|n| n.checked_sub(header_len(tool) + 1))
                .filter(|&idx| idx < lines.len());
            let Some(index) = index else {
                error!("{tool}: restore failed: {message}");
                // nothing tells what was applied
                outcome.fail_lines(&lines);
                outcome.fail(Error::Unparsable { tool, message });
                return outcome;
            };

            let mut rest = lines.split_off(index);
            let failing = rest.remove(0);
            let mut remainder = if applies_partially(tool) {
                rest
            } else {
                lines.append(&mut rest);
                lines
            };

            let kind = ErrorKind::classify(&message);
            let handling = (failing.handler)(kind);
            let section = failing.section.as_deref();

            match handling {
                Handling::Ignore => {
                    info!("{tool}: ignoring {kind:?} on {:?}", failing.text);
                }
                Handling::IgnoreSection => {
                    info!("{tool}: ignoring {kind:?} on {:?} and its section", failing.text);
                    drop_section(&mut remainder, section);
                }
                Handling::Defer => {
                    info!("{tool}: deferring {section:?} after {kind:?} on {:?}", failing.text);
                    outcome.deferred.extend(section.map(str::to_string));
                    drop_section(&mut remainder, section);
                }
                Handling::Fail => {
                    error!("{tool}: {kind:?} on {:?}: {message}", failing.text);
                    outcome.failed.extend(section.map(str::to_string));
                    drop_section(&mut remainder, section);
                    outcome.fail(Error::LineFailed {
                        tool,
                        kind,
                        text: failing.text.clone(),
                        message: message.clone(),
                    });
                }
            }

            if remainder.is_empty() {
                return outcome;
            }
            if attempt == max_tries {
                outcome.fail_lines(&remainder);
                outcome.fail(Error::RetryFailed {
                    tool,
                    tries: max_tries,
                    message,
                });
                return outcome;
            }

            lines = remainder;
            outcome.retries += 1;
        }

        outcome
    }
}

/// ipset keeps the lines applied before a failure; iptables-restore commits all or nothing.
fn applies_partially(tool: Tool) -> bool {
    matches!(tool, Tool::IpSet)
}

fn header_len(tool: Tool) -> usize {
    match tool {
        Tool::IpSet => 0,
        Tool::IpTables => 1,
    }
}

fn render(tool: Tool, lines: &[Line]) -> String {
    let mut script = String::new();
    if let Tool::IpTables = tool {
        script.push_str("*filter\n");
    }
    for line in lines {
        script.push_str(&line.text);
        script.push('\n');
    }
    if let Tool::IpTables = tool {
        script.push_str("COMMIT\n");
    }
    script
}

fn drop_section(lines: &mut Vec<Line>, section: Option<&str>) {
    if let Some(section) = section {
        lines.retain(|l| l.section.as_deref() != Some(section));
    }
}
