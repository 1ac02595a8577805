//! Interactive menu over the session manager

use std::io::{self, Write};

use crate::config::{ConfigError, ConfigStore};
use crate::platform::{self, ProcessControl};
use crate::prompt::{Prompter, acquire_config, acquire_credentials};
use crate::session::{SessionError, SessionManager};

const ENTRIES: &[(&str, &str)] = &[
    ("1", "Connect"),
    ("2", "Disconnect"),
    ("3", "Status"),
    ("4", "Configure"),
    ("5", "Show configuration"),
    ("6", "Forget configuration"),
    ("q", "Quit"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    Connect,
    Disconnect,
    Status,
    Configure,
    Show,
    Forget,
    Quit,
}

impl Choice {
    fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "1" | "connect" => Some(Choice::Connect),
            "2" | "disconnect" => Some(Choice::Disconnect),
            "3" | "status" => Some(Choice::Status),
            "4" | "configure" => Some(Choice::Configure),
            "5" | "show" => Some(Choice::Show),
            "6" | "forget" => Some(Choice::Forget),
            "q" | "quit" | "exit" => Some(Choice::Quit),
            _ => None,
        }
    }
}

pub struct Menu<'a, C, P, W> {
    manager: &'a mut SessionManager<C>,
    store: &'a ConfigStore,
    prompter: &'a mut P,
    out: W,
    interactive_auth: bool,
}

impl<'a, C, P, W> Menu<'a, C, P, W>
where
    C: ProcessControl,
    P: Prompter,
    W: Write,
{
    pub fn new(
        manager: &'a mut SessionManager<C>,
        store: &'a ConfigStore,
        prompter: &'a mut P,
        out: W,
    ) -> Self {
        Self {
            manager,
            store,
            prompter,
            out,
            interactive_auth: false,
        }
    }

    /// Let openconnect ask for credentials itself instead of prompting here.
    pub fn interactive_auth(mut self, enabled: bool) -> Self {
        self.interactive_auth = enabled;
        self
    }

    /// Show the menu until the user quits or input ends. Failed actions are
    /// reported inline and never end the loop.
    pub async fn run(mut self) -> io::Result<()> {
        loop {
            self.render()?;
            let Some(answer) = self.prompter.ask("Choose", None)? else {
                writeln!(self.out)?;
                return Ok(());
            };

            let result = match Choice::parse(&answer) {
                Some(Choice::Quit) => return Ok(()),
                Some(choice) => self.perform(choice).await,
                None => {
                    writeln!(self.out, "Unknown choice {:?}", answer.trim())?;
                    continue;
                }
            };

            match result {
                Ok(message) => writeln!(self.out, "{message}")?,
                Err(e) => {
                    writeln!(self.out, "Error: {e}")?;
                    if let Some(hint) = e.hint() {
                        writeln!(self.out, "hint: {hint}")?;
                    }
                }
            }
        }
    }

    fn render(&mut self) -> io::Result<()> {
        let status = match self.manager.status() {
            Ok(report) => report.to_string(),
            Err(e) => format!("unknown ({e})"),
        };
        writeln!(self.out)?;
        writeln!(self.out, "ocvpn [{status}]")?;
        for (key, label) in ENTRIES {
            writeln!(self.out, "  {key}) {label}")?;
        }
        self.out.flush()
    }

    async fn perform(&mut self, choice: Choice) -> Result<String, SessionError> {
        match choice {
            Choice::Connect => self.connect().await,
            Choice::Disconnect => {
                let pid = self.manager.disconnect().await?;
                Ok(format!("Disconnected (pid {pid})"))
            }
            Choice::Status => Ok(self.manager.status()?.to_string()),
            Choice::Configure => {
                let base = self.store.load_or_default()?;
                let config = acquire_config(&mut *self.prompter, &base)?;
                self.store.save(&config)?;
                Ok(format!("Saved {}", self.store.path().display()))
            }
            Choice::Show => Ok(self.store.load()?.to_toml()?),
            Choice::Forget => {
                self.store.delete()?;
                Ok(format!("Removed {}", self.store.path().display()))
            }
            Choice::Quit => Ok(String::new()),
        }
    }

    async fn connect(&mut self) -> Result<String, SessionError> {
        let mut config = match self.store.load() {
            Ok(config) => config,
            Err(ConfigError::NotFound(_)) => {
                writeln!(self.out, "No saved configuration yet.").map_err(stdout_error)?;
                let config = acquire_config(&mut *self.prompter, &Default::default())?;
                self.store.save(&config)?;
                config
            }
            Err(e) => return Err(e.into()),
        };

        let credentials = acquire_credentials(&mut *self.prompter, &mut config, self.interactive_auth)?;
        let session = self.manager.connect(&config, &credentials).await?;
        let pid = session.pid();

        if session.is_foreground() {
            writeln!(
                self.out,
                "Connected to {} (pid {pid}). Press Ctrl+C to disconnect.",
                config.server
            )
            .map_err(stdout_error)?;
            let code = self.manager.supervise(session, platform::interrupted()).await?;
            return Ok(format!("openconnect exited ({code:?})"));
        }

        Ok(format!("Connected to {} (pid {pid})", config.server))
    }
}

fn stdout_error(source: io::Error) -> SessionError {
    SessionError::Io {
        path: "<stdout>".into(),
        source,
    }
}
