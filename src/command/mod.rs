//! Single-key command registry and dispatch loop.
//!
//! Commands are grouped into named contexts so a subsystem can atomically
//! replace its own subset without touching anyone else's keys. The dispatch
//! loop reads raw stdin bytes from the console: in `Normal` mode each byte is
//! matched against the key map; a command with a line consumer switches to
//! `ReadLine` mode, which accumulates bytes until Enter and delivers the
//! whole line.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::console::Console;
use crate::error::RegistrationError;

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[91m";
const RESET: &str = "\x1b[0m";

const HELP_KEY: char = 'h';
const HELP_PROMPT_PRIORITY: i32 = 10_000;

/// Renders a command's current toggle state in the help listing, e.g.
/// `[o] Toggle test output (disabled)`.
pub struct HelpState {
    color: Box<dyn Fn() -> &'static str + Send + Sync>,
    state: Box<dyn Fn() -> String + Send + Sync>,
}

impl HelpState {
    pub fn new(
        color: impl Fn() -> &'static str + Send + Sync + 'static,
        state: impl Fn() -> String + Send + Sync + 'static,
    ) -> Self {
        Self {
            color: Box::new(color),
            state: Box::new(state),
        }
    }

    /// Green "enabled" / red "disabled" from a boolean supplier.
    pub fn toggle(enabled: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        let enabled = Arc::new(enabled);
        let color_enabled = Arc::clone(&enabled);
        Self {
            color: Box::new(move || if (*color_enabled)() { GREEN } else { RED }),
            state: Box::new(move || {
                if (*enabled)() { "enabled" } else { "disabled" }.to_string()
            }),
        }
    }

    fn render(&self) -> String {
        format!(" ({}{}{})", (self.color)(), (self.state)(), RESET)
    }
}

/// What happens when a command's key is pressed.
pub enum CommandAction {
    /// Invoked synchronously on the input thread.
    Run(Box<dyn Fn() + Send + Sync>),
    /// Switches the loop to readline mode; the accumulated line is delivered
    /// whole on Enter.
    ReadLine(Box<dyn Fn(&str) + Send + Sync>),
}

pub struct CommandPrompt {
    pub text: String,
    pub priority: i32,
}

pub struct ConsoleCommand {
    key: char,
    description: String,
    prompt: Option<CommandPrompt>,
    help: Option<HelpState>,
    action: CommandAction,
}

impl ConsoleCommand {
    pub fn run(
        key: char,
        description: impl Into<String>,
        action: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: normalize_key(key),
            description: description.into(),
            prompt: None,
            help: None,
            action: CommandAction::Run(Box::new(action)),
        }
    }

    pub fn read_line(
        key: char,
        description: impl Into<String>,
        consumer: impl Fn(&str) + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: normalize_key(key),
            description: description.into(),
            prompt: None,
            help: None,
            action: CommandAction::ReadLine(Box::new(consumer)),
        }
    }

    /// Advertise this command on the prompt line, ordered by `priority`.
    pub fn with_prompt(mut self, text: impl Into<String>, priority: i32) -> Self {
        self.prompt = Some(CommandPrompt {
            text: text.into(),
            priority,
        });
        self
    }

    pub fn with_help(mut self, help: HelpState) -> Self {
        self.help = Some(help);
        self
    }

    pub fn key(&self) -> char {
        self.key
    }
}

fn normalize_key(key: char) -> char {
    if key == '\r' {
        '\n'
    } else {
        key
    }
}

struct CommandHolder {
    context: String,
    command: Arc<ConsoleCommand>,
}

enum InputMode {
    Normal,
    ReadLine { key: char, buffer: Vec<u8> },
}

struct DispatchState {
    commands: HashMap<char, CommandHolder>,
    contexts: Vec<String>,
    mode: InputMode,
    last_prompt: Option<String>,
}

/// Process-wide command registry, explicitly constructed and attached to one
/// console at the composition root.
pub struct CommandRegistry {
    console: Arc<dyn Console>,
    state: Arc<Mutex<DispatchState>>,
}

impl CommandRegistry {
    /// Attach a new registry to `console` as its input handler and register
    /// the built-in help command.
    pub fn install(console: Arc<dyn Console>) -> Arc<Self> {
        let registry = Arc::new(Self {
            console: Arc::clone(&console),
            state: Arc::new(Mutex::new(DispatchState {
                commands: HashMap::new(),
                contexts: Vec::new(),
                mode: InputMode::Normal,
                last_prompt: None,
            })),
        });

        let weak = Arc::downgrade(&registry);
        console.set_input_handler(Some(Box::new(move |bytes| {
            if let Some(registry) = weak.upgrade() {
                registry.on_bytes(bytes);
            }
        })));

        let help = registry.create_context("System");
        let help_registry: Weak<CommandRegistry> = Arc::downgrade(&registry);
        let _ = help.add_command(
            ConsoleCommand::run(HELP_KEY, "Shows the command help", move || {
                if let Some(registry) = help_registry.upgrade() {
                    registry.print_help();
                }
            })
            .with_prompt("for more options", HELP_PROMPT_PRIORITY),
        );
        registry
    }

    /// Create (or rejoin) a named command context.
    pub fn create_context(&self, name: impl Into<String>) -> ConsoleContext {
        let name = name.into();
        {
            let mut state = self.lock_state();
            if !state.contexts.contains(&name) {
                state.contexts.push(name.clone());
            }
        }
        ConsoleContext {
            name,
            console: Arc::clone(&self.console),
            state: Arc::clone(&self.state),
        }
    }

    /// Feed raw stdin bytes through the dispatch state machine.
    pub fn on_bytes(&self, bytes: &[u8]) {
        for &byte in bytes {
            self.on_byte(byte);
        }
    }

    fn on_byte(&self, byte: u8) {
        enum Step {
            Ignore,
            Echo(String),
            BlankLine,
            Invoke(Arc<ConsoleCommand>),
            BeginReadLine,
            Flush {
                command: Option<Arc<ConsoleCommand>>,
                line: String,
                prompt: Option<String>,
            },
        }

        // Decide under the lock, act after releasing it: actions may call
        // back into registration.
        let step = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            match &mut state.mode {
                InputMode::ReadLine { key, buffer } => {
                    if byte == b'\n' || byte == b'\r' {
                        let key = *key;
                        let line = String::from_utf8_lossy(buffer).into_owned();
                        state.mode = InputMode::Normal;
                        let command = state
                            .commands
                            .get(&key)
                            .map(|holder| Arc::clone(&holder.command));
                        let prompt = rebuild_prompt(state);
                        Step::Flush {
                            command,
                            line,
                            prompt,
                        }
                    } else {
                        buffer.push(byte);
                        if byte.is_ascii_graphic() || byte == b' ' {
                            Step::Echo((byte as char).to_string())
                        } else {
                            Step::Ignore
                        }
                    }
                }
                InputMode::Normal => {
                    let key = normalize_key(byte as char);
                    enum Found {
                        Run(Arc<ConsoleCommand>),
                        ReadLine,
                        Unmapped,
                    }
                    let found = match state.commands.get(&key) {
                        Some(holder) => match holder.command.action {
                            CommandAction::Run(_) => Found::Run(Arc::clone(&holder.command)),
                            CommandAction::ReadLine(_) => Found::ReadLine,
                        },
                        None => Found::Unmapped,
                    };
                    match found {
                        Found::Run(command) => Step::Invoke(command),
                        Found::ReadLine => {
                            state.mode = InputMode::ReadLine {
                                key,
                                buffer: Vec::new(),
                            };
                            // Forget the rendered prompt so it is pushed
                            // again once the line is flushed.
                            state.last_prompt = None;
                            Step::BeginReadLine
                        }
                        Found::Unmapped if key == '\n' => Step::BlankLine,
                        Found::Unmapped => Step::Ignore,
                    }
                }
            }
        };

        match step {
            Step::Ignore => {}
            Step::Echo(text) => {
                let _ = self.console.write(&text);
            }
            Step::BlankLine => {
                let _ = self.console.write("\n");
            }
            Step::Invoke(command) => {
                if let CommandAction::Run(action) = &command.action {
                    action();
                }
            }
            Step::BeginReadLine => {
                self.console.set_prompt_message("");
            }
            Step::Flush {
                command,
                line,
                prompt,
            } => {
                let _ = self.console.write("\n");
                if let Some(prompt) = prompt {
                    self.console.set_prompt_message(&prompt);
                }
                if let Some(command) = command {
                    if let CommandAction::ReadLine(consumer) = &command.action {
                        consumer(&line);
                    }
                }
            }
        }
    }

    /// Write the full command listing, grouped by context.
    pub fn print_help(&self) {
        let text = {
            let state = self.lock_state();
            let mut text = String::from("\nThe following commands are currently available:\n");
            for context in &state.contexts {
                let mut entries: Vec<&CommandHolder> = state
                    .commands
                    .values()
                    .filter(|holder| holder.context == *context)
                    .collect();
                if entries.is_empty() {
                    continue;
                }
                entries.sort_by_key(|holder| holder.command.key);
                text.push_str(&format!("\n=== {context}\n"));
                for holder in entries {
                    let command = &holder.command;
                    let help = command
                        .help
                        .as_ref()
                        .map(HelpState::render)
                        .unwrap_or_default();
                    text.push_str(&format!(
                        "[{}] {}{}\n",
                        key_label(command.key),
                        command.description,
                        help
                    ));
                }
            }
            text
        };
        let _ = self.console.write(&text);
    }

    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to one named subset of the key map.
#[derive(Clone)]
pub struct ConsoleContext {
    name: String,
    console: Arc<dyn Console>,
    state: Arc<Mutex<DispatchState>>,
}

impl ConsoleContext {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register one command. A key held by any context is a hard error.
    pub fn add_command(&self, command: ConsoleCommand) -> Result<(), RegistrationError> {
        let prompt = {
            let mut state = self.lock_state();
            let key = command.key;
            if state.commands.contains_key(&key) {
                return Err(RegistrationError::KeyInUse { key });
            }
            state.commands.insert(
                key,
                CommandHolder {
                    context: self.name.clone(),
                    command: Arc::new(command),
                },
            );
            rebuild_prompt(&mut state)
        };
        if let Some(prompt) = prompt {
            self.console.set_prompt_message(&prompt);
        }
        Ok(())
    }

    /// Atomically replace this context's entire subset. On a key collision
    /// nothing is changed.
    pub fn reset(&self, commands: Vec<ConsoleCommand>) -> Result<(), RegistrationError> {
        let prompt = {
            let mut state = self.lock_state();
            let retained: HashSet<char> = state
                .commands
                .iter()
                .filter(|(_, holder)| holder.context != self.name)
                .map(|(key, _)| *key)
                .collect();
            let mut seen = HashSet::new();
            for command in &commands {
                if retained.contains(&command.key) || !seen.insert(command.key) {
                    return Err(RegistrationError::KeyInUse { key: command.key });
                }
            }
            state
                .commands
                .retain(|_, holder| holder.context != self.name);
            for command in commands {
                state.commands.insert(
                    command.key,
                    CommandHolder {
                        context: self.name.clone(),
                        command: Arc::new(command),
                    },
                );
            }
            rebuild_prompt(&mut state)
        };
        if let Some(prompt) = prompt {
            self.console.set_prompt_message(&prompt);
        }
        Ok(())
    }

    /// Drop every command this context registered.
    pub fn clear(&self) {
        let _ = self.reset(Vec::new());
    }

    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Rebuild the single-line prompt; returns it only when it changed.
fn rebuild_prompt(state: &mut DispatchState) -> Option<String> {
    let mut entries: Vec<(i32, char, &str)> = state
        .commands
        .values()
        .filter_map(|holder| {
            holder
                .command
                .prompt
                .as_ref()
                .map(|prompt| (prompt.priority, holder.command.key, prompt.text.as_str()))
        })
        .collect();
    entries.sort_by_key(|(priority, key, _)| (*priority, *key));

    let prompt = if entries.is_empty() {
        String::new()
    } else {
        let parts: Vec<String> = entries
            .iter()
            .map(|(_, key, text)| format!("[{}] {}", key_label(*key), text))
            .collect();
        format!("Press {} >", parts.join(", "))
    };

    if state.last_prompt.as_deref() == Some(prompt.as_str()) {
        None
    } else {
        state.last_prompt = Some(prompt.clone());
        Some(prompt)
    }
}

fn key_label(key: char) -> String {
    match key {
        ' ' => "space".to_string(),
        '\n' => "enter".to_string(),
        other => other.to_string(),
    }
}
