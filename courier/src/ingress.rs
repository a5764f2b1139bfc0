//! Line based operator input.
//!
//! Every line is either an entry to publish or a command:
//!
//! ```text
//! callback:joe priority=9 topic=sport.tennis ttl=5000 Match point
//! !pause callback:joe
//! !resume callback:joe
//! !retry peer:osprey
//! !stats
//! ```
//!
//! Options follow the destination and stop at the first token that is not
//! `key=value`; the rest of the line is the payload.

use std::{str::FromStr, time::Duration};

use courier_common::Destination;
use courier_queue::{Priority, QueueEntry};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("Empty line")]
    Empty,

    #[error("Unknown command '!{0}'")]
    UnknownCommand(String),

    #[error("'!{0}' needs a destination")]
    MissingDestination(&'static str),

    #[error("Nothing to publish to {0}")]
    MissingPayload(String),

    #[error("Invalid {option}: '{value}'")]
    InvalidOption { option: &'static str, value: String },
}

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Publish {
        destination: Destination,
        priority: Priority,
        topic: Option<String>,
        ttl: Option<Duration>,
        payload: String,
    },
    Pause(Destination),
    Resume(Destination),
    Retry(Destination),
    Stats,
}

impl Command {
    /// Build the queue entry of a publish command.
    pub fn entry(&self) -> Option<QueueEntry> {
        let Self::Publish {
            priority,
            topic,
            ttl,
            payload,
            ..
        } = self
        else {
            return None;
        };

        let mut entry = QueueEntry::new(payload.as_bytes()).with_priority(*priority);
        if let Some(topic) = topic {
            entry = entry.with_topic(topic.as_str());
        }
        if let Some(ttl) = ttl {
            entry = entry.with_ttl(*ttl);
        }

        Some(entry)
    }
}

fn destination_arg(
    name: &'static str,
    mut args: std::str::SplitWhitespace<'_>,
) -> Result<Destination, ParseError> {
    args.next()
        .map(Destination::new)
        .ok_or(ParseError::MissingDestination(name))
}

fn parse_command(line: &str) -> Result<Command, ParseError> {
    let mut words = line.split_whitespace();
    let name = words.next().unwrap_or_default();

    match name {
        "pause" => destination_arg("pause", words).map(Command::Pause),
        "resume" => destination_arg("resume", words).map(Command::Resume),
        "retry" => destination_arg("retry", words).map(Command::Retry),
        "stats" => Ok(Command::Stats),
        other => Err(ParseError::UnknownCommand(other.to_string())),
    }
}

fn parse_publish(line: &str) -> Result<Command, ParseError> {
    let (destination, mut rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));

    let mut priority = Priority::default();
    let mut topic = None;
    let mut ttl = None;

    loop {
        rest = rest.trim_start();
        let (token, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        let Some((key, value)) = token.split_once('=') else {
            break;
        };

        match key {
            "priority" => {
                priority = value
                    .parse::<u8>()
                    .ok()
                    .filter(|p| *p <= Priority::MAX.value())
                    .map(Priority::new)
                    .ok_or_else(|| ParseError::InvalidOption {
                        option: "priority",
                        value: value.to_string(),
                    })?;
            }
            "topic" => topic = Some(value.to_string()),
            "ttl" => {
                let millis = value.parse::<u64>().map_err(|_| ParseError::InvalidOption {
                    option: "ttl",
                    value: value.to_string(),
                })?;
                ttl = Some(Duration::from_millis(millis));
            }
            _ => break,
        }

        rest = tail;
    }

    let payload = rest.trim();
    if payload.is_empty() {
        return Err(ParseError::MissingPayload(destination.to_string()));
    }

    Ok(Command::Publish {
        destination: Destination::new(destination),
        priority,
        topic,
        ttl,
        payload: payload.to_string(),
    })
}

impl FromStr for Command {
    type Err = ParseError;

    fn from_str(line: &str) -> Result<Self, Self::Err> {
        let line = line.trim();
        if line.is_empty() {
            return Err(ParseError::Empty);
        }

        match line.strip_prefix('!') {
            Some(command) => parse_command(command),
            None => parse_publish(line),
        }
    }
}
