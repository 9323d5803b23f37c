use std::io::{self, BufRead, Write};
use std::sync::Mutex;

/// Blocking operator prompts.
///
/// The engine asks for host-trust confirmations and passwords through this
/// capability; the production implementation talks to the terminal, tests
/// install canned answers.
pub trait Prompter: Send + Sync {
    fn ask_yes_no(&self, text: &str) -> bool;

    /// None means the operator cancelled.
    fn ask_password(&self, text: &str) -> Option<String>;
}

/// Terminal prompter for the CLI binary.
pub struct StdioPrompter;

impl Prompter for StdioPrompter {
    fn ask_yes_no(&self, text: &str) -> bool {
        let mut line = String::new();
        loop {
            print!("{text} [y/n] ");
            let _ = io::stdout().flush();
            line.clear();
            if io::stdin().lock().read_line(&mut line).is_err() {
                return false;
            }
            match line.trim() {
                "y" | "Y" | "yes" => return true,
                "n" | "N" | "no" => return false,
                _ => {}
            }
        }
    }

    fn ask_password(&self, text: &str) -> Option<String> {
        print!("{text} ");
        let _ = io::stdout().flush();
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line).ok()?;
        let trimmed = line.trim_end_matches(['\n', '\r']);
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Test prompter with scripted answers.
pub struct CannedPrompter {
    yes_no: bool,
    passwords: Mutex<Vec<String>>,
}

impl CannedPrompter {
    pub fn new(yes_no: bool, passwords: Vec<String>) -> Self {
        Self {
            yes_no,
            passwords: Mutex::new(passwords),
        }
    }
}

impl Prompter for CannedPrompter {
    fn ask_yes_no(&self, _text: &str) -> bool {
        self.yes_no
    }

    fn ask_password(&self, _text: &str) -> Option<String> {
        self.passwords.lock().unwrap().pop()
    }
}
