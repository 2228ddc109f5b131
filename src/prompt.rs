use crate::error::Cancelled;
use colored::*;
use log::{debug, warn};
use std::collections::BTreeSet;
use std::io::{self, BufRead, BufReader, Write};

/// Re-displays the valid options after a rejected indexed answer.
pub type OptionPrinter<'a> = &'a dyn Fn(&mut dyn Write) -> io::Result<()>;

/// Line-based question/answer cycle over any reader and writer.
///
/// Boolean questions accept `Y`/`y`/`yes`, `n`/`no` and `q`/`quit`, matched
/// against the whole trimmed line. Anything else repeats the question.
/// Indexed questions take a comma separated list of previously displayed
/// indices; one bad token rejects the whole answer.
pub struct Prompter<R = Box<dyn BufRead + Send>, W = Box<dyn Write + Send>> {
    input: R,
    output: W,
}

impl Prompter {
    pub fn stdio() -> Self {
        Prompter {
            input: Box::new(BufReader::new(io::stdin())),
            output: Box::new(io::stdout()),
        }
    }

    #[cfg(test)]
    pub fn boxed(input: impl BufRead + Send + 'static, output: impl Write + Send + 'static) -> Self {
        Prompter {
            input: Box::new(input),
            output: Box::new(output),
        }
    }
}

impl<R: BufRead, W: Write> Prompter<R, W> {
    #[cfg(test)]
    pub fn new(input: R, output: W) -> Self {
        Prompter { input, output }
    }

    #[cfg(test)]
    pub fn into_output(self) -> W {
        self.output
    }

    /// Print an informational line to the operator.
    pub fn say(&mut self, line: &str) {
        if let Err(e) = writeln!(self.output, "{line}") {
            debug!("Unable to write to operator: {e}");
        }
    }

    /// Ask a yes/no question. `Err(Cancelled)` on quit or closed input.
    pub fn ask(&mut self, question: &str) -> Result<bool, Cancelled> {
        loop {
            self.say(&format!("{} {}", question.trim_end(), "[Y/n/q]".bold()));
            let answer = self.read_answer()?;
            match answer.as_str() {
                "Y" | "y" | "yes" | "Yes" | "YES" => return Ok(true),
                "n" | "N" | "no" | "No" | "NO" => return Ok(false),
                "q" | "Q" | "quit" => return Err(Cancelled),
                other => {
                    warn!("Invalid input: {other:?}");
                    self.say(&"Invalid input, please answer Y, n or q".red().to_string());
                }
            }
        }
    }

    /// Ask for a comma separated list of indices drawn from `valid`.
    /// Returns the chosen indices sorted and deduplicated.
    pub fn ask_indices(
        &mut self,
        question: &str,
        valid: &BTreeSet<usize>,
        printer: Option<OptionPrinter<'_>>,
    ) -> Result<Vec<usize>, Cancelled> {
        loop {
            self.say(question);
            let answer = self.read_answer()?;
            if answer == "q" || answer == "Q" || answer == "quit" {
                return Err(Cancelled);
            }

            match parse_indices(&answer, valid) {
                Ok(chosen) => return Ok(chosen),
                Err(bad) => {
                    warn!("Rejected index selection {answer:?}: invalid token {bad:?}");
                    self.say(&format!("{} {bad:?}", "Invalid index:".red().bold()));
                    if let Some(print) = printer {
                        if let Err(e) = print(&mut self.output) {
                            debug!("Unable to re-display options: {e}");
                        }
                    }
                }
            }
        }
    }

    fn read_answer(&mut self) -> Result<String, Cancelled> {
        if let Err(e) = self.output.flush() {
            debug!("Unable to flush prompt: {e}");
        }
        let mut line = String::new();
        match self.input.read_line(&mut line) {
            Ok(0) => {
                warn!("Input closed while waiting for an answer");
                Err(Cancelled)
            }
            Ok(_) => Ok(line.trim().to_string()),
            Err(e) => {
                warn!("Failed to read input: {e}");
                Err(Cancelled)
            }
        }
    }
}

/// Parse `1, 3,4` against the valid set. Returns the first offending token.
fn parse_indices(answer: &str, valid: &BTreeSet<usize>) -> Result<Vec<usize>, String> {
    if answer.trim().is_empty() {
        return Err(String::new());
    }
    let mut chosen = BTreeSet::new();
    for token in answer.split(',') {
        let token = token.trim();
        match token.parse::<usize>() {
            Ok(index) if valid.contains(&index) => {
                chosen.insert(index);
            }
            _ => return Err(token.to_string()),
        }
    }
    Ok(chosen.into_iter().collect())
}
