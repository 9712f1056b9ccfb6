use std::fmt;
use std::fs::File;
use std::io::{self, BufRead, BufReader, Cursor};
use std::path::Path;
use std::sync::Arc;

use crate::env::EnvProvider;
use crate::errors::{KconfigError, KconfigResult};

#[cfg(test)]
mod tests;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Location {
    pub file: String,
    pub line: usize,
}

impl Location {
    pub fn new(file: impl Into<String>, line: usize) -> Location {
        Location {
            file: file.into(),
            line,
        }
    }

    /// Location for symbols that have no source line (constant literals).
    pub fn internal() -> Location {
        Location {
            file: "<builtin>".into(),
            line: 1,
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ReadOptions {
    pub skip_blank: bool,
    pub strip_comments: bool,
    pub expand_env: bool,
}

impl Default for ReadOptions {
    fn default() -> Self {
        ReadOptions {
            skip_blank: true,
            strip_comments: true,
            expand_env: true,
        }
    }
}

impl ReadOptions {
    /// Verbatim lines, as needed for help blocks: keep blanks, keep `#`,
    /// no interpolation.
    pub fn raw() -> ReadOptions {
        ReadOptions {
            skip_blank: false,
            strip_comments: false,
            expand_env: false,
        }
    }
}

struct Pushed {
    text: String,
    line: usize,
}

/// Line-oriented reader over one Kconfig source file. Each nested `source`
/// directive opens a fresh reader while the outer one stays paused on the
/// parser's stack.
pub struct SourceReader {
    inner: Box<dyn BufRead>,
    file: String,
    /// Line number of the last line handed to the parser.
    line: usize,
    /// Lines consumed from the underlying stream.
    consumed: usize,
    pushback: Option<Pushed>,
    tab_width: usize,
    env: Arc<dyn EnvProvider>,
}

impl SourceReader {
    pub fn open(
        path: &Path,
        tab_width: usize,
        env: Arc<dyn EnvProvider>,
    ) -> io::Result<SourceReader> {
        let file = File::open(path)?;
        Ok(SourceReader {
            inner: Box::new(BufReader::new(file)),
            file: path.display().to_string(),
            line: 0,
            consumed: 0,
            pushback: None,
            tab_width,
            env,
        })
    }

    pub fn from_string(
        name: impl Into<String>,
        text: impl Into<String>,
        tab_width: usize,
        env: Arc<dyn EnvProvider>,
    ) -> SourceReader {
        SourceReader {
            inner: Box::new(Cursor::new(text.into())),
            file: name.into(),
            line: 0,
            consumed: 0,
            pushback: None,
            tab_width,
            env,
        }
    }

    pub fn location(&self) -> Location {
        Location {
            file: self.file.clone(),
            line: self.line.max(1),
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    /// One-slot push-back for attribute-loop look-ahead. The pushed line is
    /// returned verbatim by the next read, with its original line number.
    pub fn push_back(&mut self, text: String) {
        debug_assert!(self.pushback.is_none(), "push-back buffer already full");
        self.pushback = Some(Pushed {
            text,
            line: self.line,
        });
    }

    pub fn next_line(&mut self, opts: ReadOptions) -> KconfigResult<Option<String>> {
        if let Some(pushed) = self.pushback.take() {
            self.line = pushed.line;
            return Ok(Some(pushed.text));
        }

        loop {
            let mut raw = String::new();
            if self.inner.read_line(&mut raw)? == 0 {
                return Ok(None);
            }
            self.consumed += 1;

            while raw.ends_with('\n') || raw.ends_with('\r') {
                raw.pop();
            }

            let mut line = expand_tabs(&raw, self.tab_width);
            if opts.strip_comments {
                line = strip_comment(&line);
                line.truncate(line.trim_end().len());
            }
            if opts.expand_env {
                line = self.expand_env(&line)?;
            }

            if opts.skip_blank && line.trim().is_empty() {
                continue;
            }

            self.line = self.consumed;
            return Ok(Some(line));
        }
    }

    /// Re-apply default-mode processing to a line that was read raw (help
    /// blocks read ahead verbatim and push the terminating line back).
    pub fn reprocess(&self, line: &str) -> KconfigResult<String> {
        let mut out = strip_comment(line);
        out.truncate(out.trim_end().len());
        self.expand_env(&out)
    }

    /// Interpolate `$VAR` references inside quoted regions. An unset
    /// variable is fatal to the parse.
    fn expand_env(&self, line: &str) -> KconfigResult<String> {
        if !line.contains('$') {
            return Ok(line.to_string());
        }

        let mut out = String::with_capacity(line.len());
        let mut chars = line.chars().peekable();
        let mut quote: Option<char> = None;

        while let Some(c) = chars.next() {
            match c {
                '\\' => {
                    out.push(c);
                    if let Some(next) = chars.next() {
                        out.push(next);
                    }
                }
                '"' | '\'' => {
                    match quote {
                        None => quote = Some(c),
                        Some(q) if q == c => quote = None,
                        Some(_) => {}
                    }
                    out.push(c);
                }
                '$' if quote.is_some() => {
                    let mut name = String::new();
                    while let Some(&n) = chars.peek() {
                        if n.is_ascii_alphanumeric() || n == '_' {
                            name.push(n);
                            chars.next();
                        } else {
                            break;
                        }
                    }
                    if name.is_empty() {
                        out.push('$');
                        continue;
                    }
                    match self.env.get(&name) {
                        Some(value) => out.push_str(&value),
                        None => {
                            return Err(KconfigError::Env {
                                file: self.file.clone(),
                                line: self.consumed,
                                var: name,
                            }
                            .into())
                        }
                    }
                }
                _ => out.push(c),
            }
        }

        Ok(out)
    }
}

fn expand_tabs(line: &str, tab_width: usize) -> String {
    if !line.contains('\t') {
        return line.to_string();
    }
    let width = tab_width.max(1);
    let mut out = String::with_capacity(line.len());
    let mut col = 0usize;
    for c in line.chars() {
        if c == '\t' {
            let pad = width - (col % width);
            for _ in 0..pad {
                out.push(' ');
            }
            col += pad;
        } else {
            out.push(c);
            col += 1;
        }
    }
    out
}

/// Remove an unquoted `#` comment, respecting both quote styles and
/// backslash escapes inside them.
fn strip_comment(line: &str) -> String {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (idx, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '"' | '\'' => match quote {
                None => quote = Some(c),
                Some(q) if q == c => quote = None,
                Some(_) => {}
            },
            '#' if quote.is_none() => return line[..idx].to_string(),
            _ => {}
        }
    }
    line.to_string()
}
