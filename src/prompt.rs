//! Asking the user for connection settings and credentials
//!
//! Both the one-shot CLI and the menu go through a [`Prompter`], so the
//! parsing rules live in one place: an empty answer keeps the current value
//! and `-` clears it.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::config::{ConfigError, ConnectionConfig, DEFAULT_INTERFACE};
use crate::session::{Credentials, SessionError};

/// Answer that clears an optional value
const CLEAR: &str = "-";

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("Failed to read input: {0}")]
    Io(#[from] io::Error),
    #[error("Input ended before all values were entered")]
    Cancelled,
    #[error(transparent)]
    Invalid(#[from] ConfigError),
}

impl From<PromptError> for SessionError {
    fn from(err: PromptError) -> Self {
        match err {
            PromptError::Io(source) => SessionError::Io {
                path: PathBuf::from("<stdin>"),
                source,
            },
            PromptError::Cancelled => SessionError::Io {
                path: PathBuf::from("<stdin>"),
                source: io::Error::from(io::ErrorKind::UnexpectedEof),
            },
            PromptError::Invalid(e) => e.into(),
        }
    }
}

pub trait Prompter {
    /// Ask one question, showing `current` as the default.
    ///
    /// Returns `None` at end of input.
    fn ask(&mut self, question: &str, current: Option<&str>) -> io::Result<Option<String>>;

    /// Ask without echoing the answer.
    fn ask_secret(&mut self, question: &str) -> io::Result<String>;
}

/// Prompts on stderr, reads answers from stdin
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn ask(&mut self, question: &str, current: Option<&str>) -> io::Result<Option<String>> {
        let mut stderr = io::stderr().lock();
        match current.filter(|c| !c.is_empty()) {
            Some(current) => write!(stderr, "{question} [{current}]: ")?,
            None => write!(stderr, "{question}: ")?,
        }
        stderr.flush()?;

        let mut line = String::new();
        if io::stdin().lock().read_line(&mut line)? == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end_matches(['\r', '\n']).to_string()))
    }

    fn ask_secret(&mut self, question: &str) -> io::Result<String> {
        rpassword::prompt_password(format!("{question}: "))
    }
}

enum Answer {
    Keep,
    Clear,
    Set(String),
}

fn ask_field<P: Prompter + ?Sized>(
    prompter: &mut P,
    question: &str,
    current: Option<&str>,
) -> Result<Answer, PromptError> {
    let answer = prompter.ask(question, current)?.ok_or(PromptError::Cancelled)?;
    Ok(match answer.trim() {
        "" => Answer::Keep,
        CLEAR => Answer::Clear,
        value => Answer::Set(value.to_string()),
    })
}

fn ask_optional<P: Prompter + ?Sized>(
    prompter: &mut P,
    question: &str,
    current: Option<String>,
) -> Result<Option<String>, PromptError> {
    Ok(match ask_field(prompter, question, current.as_deref())? {
        Answer::Keep => current,
        Answer::Clear => None,
        Answer::Set(value) => Some(value),
    })
}

fn parse_yes_no(answer: &str) -> Option<bool> {
    match answer.to_ascii_lowercase().as_str() {
        "y" | "yes" | "true" | "1" => Some(true),
        "n" | "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// Walk through every field of `base`, returning the edited and validated record.
pub fn acquire_config<P: Prompter + ?Sized>(
    prompter: &mut P,
    base: &ConnectionConfig,
) -> Result<ConnectionConfig, PromptError> {
    let mut config = base.clone();

    config.server = match ask_field(prompter, "VPN server", Some(&base.server))? {
        Answer::Keep => base.server.clone(),
        Answer::Clear => String::new(),
        Answer::Set(server) => server,
    };
    config.username = ask_optional(prompter, "Username", base.username.clone())?;
    config.auth_group = ask_optional(prompter, "Auth group", base.auth_group.clone())?;
    config.interface_name =
        match ask_field(prompter, "Interface", Some(&base.interface_name))? {
            Answer::Keep => base.interface_name.clone(),
            Answer::Clear => DEFAULT_INTERFACE.to_string(),
            Answer::Set(name) => name,
        };
    config.server_cert_pin = ask_optional(
        prompter,
        "Server certificate pin",
        base.server_cert_pin.clone(),
    )?;

    let current = if base.disable_dtls { "y" } else { "n" };
    config.disable_dtls = match ask_field(prompter, "Disable DTLS (force TLS/TCP)? y/n", Some(current))? {
        Answer::Keep => base.disable_dtls,
        Answer::Clear => false,
        Answer::Set(answer) => parse_yes_no(&answer).ok_or_else(|| ConfigError::Invalid {
            field: "disable_dtls",
            reason: format!("expected y or n, got {answer:?}"),
        })?,
    };

    let current = base.log_file_path.as_deref().map(Path::to_string_lossy);
    config.log_file_path = match ask_field(prompter, "Log file", current.as_deref())? {
        Answer::Keep => base.log_file_path.clone(),
        Answer::Clear => None,
        Answer::Set(path) => Some(PathBuf::from(path)),
    };

    // Split on whitespace only; no quoting
    let current = base.extra_args.join(" ");
    config.extra_args = match ask_field(prompter, "Extra openconnect arguments", Some(&current))? {
        Answer::Keep => base.extra_args.clone(),
        Answer::Clear => Vec::new(),
        Answer::Set(args) => args.split_whitespace().map(str::to_string).collect(),
    };

    let config = config.normalized();
    config.validate()?;
    Ok(config)
}

/// Ask for whatever openconnect will need on stdin.
///
/// With `interactive_auth` nothing is asked and openconnect prompts on the
/// terminal itself. Otherwise a missing username is asked for and stored in
/// `config`, since stdin carries only the password.
pub fn acquire_credentials<P: Prompter + ?Sized>(
    prompter: &mut P,
    config: &mut ConnectionConfig,
    interactive_auth: bool,
) -> Result<Credentials, PromptError> {
    if interactive_auth {
        return Ok(Credentials::default());
    }

    if config.username.is_none() {
        let username = prompter.ask("Username", None)?.ok_or(PromptError::Cancelled)?;
        let username = username.trim();
        if username.is_empty() {
            return Err(ConfigError::Invalid {
                field: "username",
                reason: "required unless --interactive-auth is used".to_string(),
            }
            .into());
        }
        config.username = Some(username.to_string());
    }

    let password = prompter.ask_secret("Password")?;
    Ok(Credentials::password(password))
}

/// Replays canned answers and records the questions asked
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct ScriptedPrompter {
    answers: std::collections::VecDeque<String>,
    secrets: std::collections::VecDeque<String>,
    pub questions: Vec<String>,
}

#[cfg(test)]
impl ScriptedPrompter {
    pub fn new(answers: &[&str]) -> Self {
        Self {
            answers: answers.iter().map(|a| a.to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn with_secret(mut self, secret: &str) -> Self {
        self.secrets.push_back(secret.to_string());
        self
    }
}

#[cfg(test)]
impl Prompter for ScriptedPrompter {
    fn ask(&mut self, question: &str, _current: Option<&str>) -> io::Result<Option<String>> {
        self.questions.push(question.to_string());
        Ok(self.answers.pop_front())
    }

    fn ask_secret(&mut self, question: &str) -> io::Result<String> {
        self.questions.push(question.to_string());
        self.secrets
            .pop_front()
            .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))
    }
}
