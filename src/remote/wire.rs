//! Line format of the control protocol.
//!
//! A line is a sequence of words separated by spaces or tabs. Inside a word
//! a backslash escapes the next character; `\n` stands for a newline and a
//! word that is exactly `\z` is the empty word.

use crate::error::{Error, Result};

fn is_separator(c: char) -> bool {
    c == ' ' || c == '\t'
}

/// Split a line into words, undoing escapes. A trailing `\n` is ignored.
pub fn parse_line(line: &str) -> Result<Vec<String>> {
    let line = line.strip_suffix('\n').unwrap_or(line);

    let mut words = Vec::new();
    let mut word = String::new();
    // A word may consist of escapes that expand to nothing (`\z`).
    let mut in_word = false;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some('n') => word.push('\n'),
                    Some('z') => {}
                    Some(escaped) => word.push(escaped),
                    None => return Err(Error::Syntax("dangling escape at end of line".to_string())),
                }
            }
            c if is_separator(c) => {
                if in_word {
                    words.push(std::mem::take(&mut word));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                word.push(c);
            }
        }
    }

    if in_word {
        words.push(word);
    }
    Ok(words)
}

/// Escape one word.
pub fn compose_word(word: &str) -> String {
    if word.is_empty() {
        return "\\z".to_string();
    }

    let mut out = String::with_capacity(word.len());
    for c in word.chars() {
        match c {
            '\\' | ' ' | '\t' => {
                out.push('\\');
                out.push(c);
            }
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out
}

/// Join words into a line (without the terminating newline).
pub fn compose_line<S: AsRef<str>>(words: &[S]) -> String {
    words
        .iter()
        .map(|w| compose_word(w.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}
