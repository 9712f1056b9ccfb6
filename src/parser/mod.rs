use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use log::warn;

use crate::env::EnvProvider;
use crate::errors::{KconfigError, KconfigResult};
use crate::reader::{Location, ReadOptions, SourceReader};
use crate::symbol::{Attribute, AttributeKind, EntryKind, SymbolArena, SymbolId, ValueType};


/// Everything the parse needs from its surroundings. Threaded explicitly so
/// `source` path resolution and `option env=` writes go through one seam.
pub struct ParserContext {
    pub cwd: PathBuf,
    pub tab_width: usize,
    pub env: Arc<dyn EnvProvider>,
}

impl ParserContext {
    pub fn new(cwd: impl Into<PathBuf>, tab_width: usize, env: Arc<dyn EnvProvider>) -> ParserContext {
        ParserContext {
            cwd: cwd.into(),
            tab_width,
            env,
        }
    }
}

/// Parse a Kconfig file into a fresh entry tree rooted at a synthetic
/// main-menu entry. The root is returned and also recorded on the arena.
pub fn parse_file(
    arena: &mut SymbolArena,
    ctx: &ParserContext,
    path: &Path,
) -> KconfigResult<SymbolId> {
    let mut reader = SourceReader::open(path, ctx.tab_width, ctx.env.clone())
        .with_context(|| format!("opening {}", path.display()))?;
    let root = arena.alloc(
        EntryKind::MainMenu,
        "",
        Location::new(path.display().to_string(), 1),
    );
    arena.root = Some(root);
    Parser { arena, ctx }.parse_block(&mut reader, root, None)?;
    Ok(root)
}

/// Parse in-memory Kconfig text. Fixture entry point used by the tests.
pub fn parse_str(
    arena: &mut SymbolArena,
    ctx: &ParserContext,
    name: &str,
    text: &str,
) -> KconfigResult<SymbolId> {
    let mut reader = SourceReader::from_string(name, text, ctx.tab_width, ctx.env.clone());
    let root = arena.alloc(EntryKind::MainMenu, "", Location::new(name, 1));
    arena.root = Some(root);
    Parser { arena, ctx }.parse_block(&mut reader, root, None)?;
    Ok(root)
}

struct Parser<'a> {
    arena: &'a mut SymbolArena,
    ctx: &'a ParserContext,
}

impl<'a> Parser<'a> {
    fn parse_block(
        &mut self,
        r: &mut SourceReader,
        parent: SymbolId,
        terminator: Option<&str>,
    ) -> KconfigResult<()> {
        loop {
            let line = match r.next_line(ReadOptions::default())? {
                Some(line) => line,
                None => {
                    if let Some(t) = terminator {
                        return Err(self.err(r, format!("missing `{}`", t)).into());
                    }
                    return Ok(());
                }
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (kw, rest) = split_keyword(trimmed);

            if Some(kw) == terminator {
                return Ok(());
            }

            match kw {
                "endmenu" | "endchoice" | "endif" => {
                    return Err(self.err(r, format!("unpaired `{}`", kw)).into());
                }
                "mainmenu" => {
                    let prompt = self.quoted(r, rest)?;
                    let root = self.arena.root.expect("parse started");
                    self.arena.get_mut(root).name = prompt;
                }
                "menu" => {
                    let prompt = self.quoted(r, rest)?;
                    let id = self.start_entry(EntryKind::Menu, prompt, parent, r);
                    self.parse_attributes(r, id)?;
                    self.parse_block(r, id, Some("endmenu"))?;
                    self.finish_entry(parent, id);
                }
                "menuconfig" => {
                    let name = self.ident(r, rest)?;
                    let id = self.start_entry(EntryKind::MenuConfig, name, parent, r);
                    self.parse_attributes(r, id)?;
                    self.apply_env_option(id);
                    self.finish_entry(parent, id);
                }
                "config" => {
                    let name = self.ident(r, rest)?;
                    let id = self.start_entry(EntryKind::Config, name, parent, r);
                    self.parse_attributes(r, id)?;
                    self.apply_env_option(id);
                    self.finish_entry(parent, id);
                }
                "choice" => {
                    let name = rest.trim().to_string();
                    let id = self.start_entry(EntryKind::Choice, name, parent, r);
                    self.parse_attributes(r, id)?;
                    self.parse_block(r, id, Some("endchoice"))?;
                    self.validate_choice(id)?;
                    self.finish_entry(parent, id);
                }
                "if" => {
                    let cond = rest.trim();
                    if cond.is_empty() {
                        return Err(self.err(r, "`if` without a condition").into());
                    }
                    let id = self.start_entry(EntryKind::If, cond.to_string(), parent, r);
                    self.parse_block(r, id, Some("endif"))?;
                    self.finish_entry(parent, id);
                }
                "comment" => {
                    let prompt = self.quoted(r, rest)?;
                    let id = self.start_entry(EntryKind::Comment, prompt, parent, r);
                    self.parse_attributes(r, id)?;
                    self.finish_entry(parent, id);
                }
                "source" => {
                    self.parse_source(r, parent, rest)?;
                }
                other => {
                    return Err(self.err(r, format!("unknown keyword `{}`", other)).into());
                }
            }
        }
    }

    /// `source` expands relative to the context cwd and parses into the
    /// source entry itself. I/O failure keeps the entry childless.
    fn parse_source(
        &mut self,
        r: &mut SourceReader,
        parent: SymbolId,
        rest: &str,
    ) -> KconfigResult<()> {
        let raw = rest.trim();
        let path_text = if raw.starts_with('"') || raw.starts_with('\'') {
            self.quoted(r, raw)?
        } else if raw.is_empty() {
            return Err(self.err(r, "`source` without a path").into());
        } else {
            raw.to_string()
        };

        let id = self.start_entry(EntryKind::Source, path_text.clone(), parent, r);
        let path = self.ctx.cwd.join(&path_text);
        match SourceReader::open(&path, self.ctx.tab_width, self.ctx.env.clone()) {
            Ok(mut nested) => self.parse_block(&mut nested, id, None)?,
            Err(e) => warn!("{}: cannot read source `{}`: {}", r.location(), path_text, e),
        }
        self.finish_entry(parent, id);
        Ok(())
    }

    fn start_entry(
        &mut self,
        kind: EntryKind,
        name: String,
        parent: SymbolId,
        r: &SourceReader,
    ) -> SymbolId {
        let id = self.arena.alloc(kind, name, r.location());
        let nest = {
            let p = self.arena.get(parent);
            if p.kind == EntryKind::If {
                match &p.nest_depends_on {
                    Some(outer) => Some(format!("({}) && ({})", outer, p.name)),
                    None => Some(p.name.clone()),
                }
            } else {
                p.nest_depends_on.clone()
            }
        };
        self.arena.get_mut(id).nest_depends_on = nest;
        self.arena.attach(parent, id);
        id
    }

    /// The hanging-block idiom: an `if M` sibling right after `menuconfig M`
    /// has its children spliced flat into M; a sibling that carries
    /// `depends on M` moves under M itself.
    fn finish_entry(&mut self, parent: SymbolId, id: SymbolId) {
        let children = &self.arena.get(parent).children;
        let pos = match children.iter().position(|&c| c == id) {
            Some(pos) if pos > 0 => pos,
            _ => return,
        };
        let prev = children[pos - 1];
        if self.arena.get(prev).kind != EntryKind::MenuConfig {
            return;
        }
        let menuconfig_name = self.arena.get(prev).name.clone();

        let entry = self.arena.get(id);
        match entry.kind {
            EntryKind::If => {
                if entry.name.trim() != menuconfig_name {
                    return;
                }
                let kids: Vec<SymbolId> = entry.children.clone();
                self.arena.detach(parent, id);
                self.arena.get_mut(id).children.clear();
                for kid in kids {
                    self.arena.get_mut(kid).parent = None;
                    self.arena.attach(prev, kid);
                }
            }
            _ => {
                let depends_on_menuconfig = entry
                    .attributes
                    .iter()
                    .any(|a| a.is(AttributeKind::DependsOn) && a.value.trim() == menuconfig_name);
                if !depends_on_menuconfig {
                    return;
                }
                self.arena.detach(parent, id);
                self.arena.attach(prev, id);
            }
        }
    }

    fn parse_attributes(&mut self, r: &mut SourceReader, entry: SymbolId) -> KconfigResult<()> {
        loop {
            let line = match r.next_line(ReadOptions::default())? {
                Some(line) => line,
                None => return Ok(()),
            };
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let (kw, rest) = split_keyword(trimmed);

            match kw {
                "bool" | "tristate" | "string" | "hex" | "int" => {
                    let vt = match kw {
                        "bool" => ValueType::Bool,
                        "tristate" => ValueType::Tristate,
                        "string" => ValueType::String,
                        "hex" => ValueType::Hex,
                        _ => ValueType::Int,
                    };
                    self.arena.get_mut(entry).value_type = vt;
                    let mut attr = Attribute::new(AttributeKind::Type);
                    attr.value_type = vt;
                    self.arena.get_mut(entry).attributes.push(attr);

                    let rest = rest.trim();
                    if !rest.is_empty() {
                        let (prompt, cond) = self.quoted_with_cond(r, rest)?;
                        let mut attr = Attribute::new(AttributeKind::Prompt);
                        attr.value = prompt;
                        attr.cond = cond;
                        self.arena.get_mut(entry).attributes.push(attr);
                    }
                }
                "def_bool" | "def_tristate" => {
                    let vt = if kw == "def_bool" {
                        ValueType::Bool
                    } else {
                        ValueType::Tristate
                    };
                    self.arena.get_mut(entry).value_type = vt;
                    let mut attr = Attribute::new(AttributeKind::Type);
                    attr.value_type = vt;
                    self.arena.get_mut(entry).attributes.push(attr);

                    let (value, cond) = split_value_cond(rest);
                    if value.is_empty() {
                        return Err(self.err(r, format!("`{}` without a value", kw)).into());
                    }
                    let mut attr = Attribute::new(AttributeKind::Default);
                    attr.value = value;
                    attr.cond = cond;
                    self.arena.get_mut(entry).attributes.push(attr);
                }
                "prompt" => {
                    let (prompt, cond) = self.quoted_with_cond(r, rest)?;
                    let mut attr = Attribute::new(AttributeKind::Prompt);
                    attr.value = prompt;
                    attr.cond = cond;
                    self.arena.get_mut(entry).attributes.push(attr);
                }
                "default" => {
                    let (value, cond) = split_value_cond(rest);
                    if value.is_empty() {
                        return Err(self.err(r, "`default` without a value").into());
                    }
                    let mut attr = Attribute::new(AttributeKind::Default);
                    attr.value = value;
                    attr.cond = cond;
                    self.arena.get_mut(entry).attributes.push(attr);
                }
                "depends" => {
                    let rest = rest.trim();
                    let expr = rest
                        .strip_prefix("on")
                        .filter(|e| e.is_empty() || e.starts_with(char::is_whitespace))
                        .ok_or_else(|| self.err(r, "expected `on` after `depends`"))?
                        .trim();
                    if expr.is_empty() {
                        return Err(self.err(r, "`depends on` without an expression").into());
                    }
                    let mut attr = Attribute::new(AttributeKind::DependsOn);
                    attr.value = expr.to_string();
                    self.arena.get_mut(entry).attributes.push(attr);
                }
                "select" | "imply" => {
                    let (target, cond) = split_value_cond(rest);
                    let target = target.trim().to_string();
                    if !is_identifier(&target) {
                        return Err(self.err(r, format!("`{}` needs a symbol name", kw)).into());
                    }
                    let kind = if kw == "select" {
                        AttributeKind::Select
                    } else {
                        AttributeKind::Imply
                    };
                    let mut attr = Attribute::new(kind);
                    attr.value = target;
                    attr.cond = cond;
                    self.arena.get_mut(entry).attributes.push(attr);
                }
                "visible" => {
                    if self.arena.get(entry).kind != EntryKind::Menu {
                        return Err(self.err(r, "`visible if` is only valid on a menu").into());
                    }
                    let expr = rest
                        .trim()
                        .strip_prefix("if")
                        .filter(|e| e.starts_with(char::is_whitespace))
                        .map(str::trim)
                        .filter(|e| !e.is_empty())
                        .ok_or_else(|| self.err(r, "expected `if EXPR` after `visible`"))?;
                    let mut attr = Attribute::new(AttributeKind::VisibleIf);
                    attr.cond = Some(expr.to_string());
                    self.arena.get_mut(entry).attributes.push(attr);
                }
                "range" => {
                    let (value, cond) = split_value_cond(rest);
                    let bounds: Vec<&str> = value.split_whitespace().collect();
                    if bounds.len() != 2 {
                        return Err(self.err(r, "`range` needs exactly MIN and MAX").into());
                    }
                    let mut attr = Attribute::new(AttributeKind::Range);
                    attr.value = format!("{} {}", bounds[0], bounds[1]);
                    attr.cond = cond;
                    self.arena.get_mut(entry).attributes.push(attr);
                }
                "help" | "---help---" => {
                    let text = self.parse_help(r)?;
                    let mut attr = Attribute::new(AttributeKind::Help);
                    attr.value = text;
                    self.arena.get_mut(entry).attributes.push(attr);
                }
                "option" => {
                    let mut attr = Attribute::new(AttributeKind::Option);
                    attr.value = rest.trim().to_string();
                    self.arena.get_mut(entry).attributes.push(attr);
                }
                "optional" => {
                    if self.arena.get(entry).kind != EntryKind::Choice {
                        return Err(self.err(r, "`optional` is only valid on a choice").into());
                    }
                    self.arena
                        .get_mut(entry)
                        .attributes
                        .push(Attribute::new(AttributeKind::Optional));
                }
                _ => {
                    r.push_back(line);
                    return Ok(());
                }
            }
        }
    }

    /// Help text runs until a non-empty line at a strictly shallower indent
    /// than the first help line; that line is pushed back. Captured lines
    /// are stripped of exactly the first line's whitespace prefix.
    fn parse_help(&mut self, r: &mut SourceReader) -> KconfigResult<String> {
        let mut lines: Vec<String> = Vec::new();
        let mut prefix: Option<String> = None;

        loop {
            let line = match r.next_line(ReadOptions::raw())? {
                Some(line) => line,
                None => break,
            };
            if line.trim().is_empty() {
                if prefix.is_some() {
                    lines.push(String::new());
                }
                continue;
            }
            let indent = line.len() - line.trim_start().len();
            match &prefix {
                None => {
                    if indent == 0 {
                        // Help at column zero would swallow the rest of the
                        // file; treat it as an empty block.
                        let line = r.reprocess(&line)?;
                        r.push_back(line);
                        break;
                    }
                    prefix = Some(line[..indent].to_string());
                    lines.push(line.trim_end()[indent..].to_string());
                }
                Some(p) => {
                    if indent < p.len() {
                        let line = r.reprocess(&line)?;
                        r.push_back(line);
                        break;
                    }
                    lines.push(line[p.len()..].trim_end().to_string());
                }
            }
        }

        while lines.last().map(|l| l.is_empty()).unwrap_or(false) {
            lines.pop();
        }
        Ok(lines.join("\n"))
    }

    /// `option env=V`: after the entry parses, seed the environment variable
    /// named by the entry (leading `$` stripped) with the entry's default,
    /// unless it is already set.
    fn apply_env_option(&mut self, entry: SymbolId) {
        let sym = self.arena.get(entry);
        let has_env_option = sym
            .attributes
            .iter()
            .any(|a| a.is(AttributeKind::Option) && a.value.starts_with("env="));
        if !has_env_option {
            return;
        }

        let key = sym.name.trim_start_matches('$').to_string();
        if key.is_empty() || self.ctx.env.get(&key).is_some() {
            return;
        }
        let default = sym
            .attributes
            .iter()
            .find(|a| a.is(AttributeKind::Default))
            .map(|a| unquote(&a.value));
        if let Some(default) = default {
            self.ctx.env.set(&key, &default);
        }
    }

    /// Every config descendant of a choice (looking through `if` blocks)
    /// must be bool or tristate, and they must agree; the common type
    /// becomes the choice's own type.
    fn validate_choice(&mut self, choice: SymbolId) -> KconfigResult<()> {
        let children = self.arena.choice_config_children(choice);
        let mut common: Option<ValueType> = None;
        for child in &children {
            let child_sym = self.arena.get(*child);
            let vt = child_sym.value_type;
            if !vt.is_boolish() {
                let loc = child_sym.location.clone();
                return Err(KconfigError::parse(
                    loc.file,
                    loc.line,
                    format!("choice entry `{}` must be bool or tristate", child_sym.name),
                )
                .into());
            }
            match common {
                None => common = Some(vt),
                Some(seen) if seen != vt => {
                    let choice_sym = self.arena.get(choice);
                    return Err(KconfigError::MixedChoiceTypes {
                        file: choice_sym.location.file.clone(),
                        line: choice_sym.location.line,
                        choice: choice_sym.name.clone(),
                    }
                    .into());
                }
                Some(_) => {}
            }
        }
        self.arena.get_mut(choice).value_type = common.unwrap_or(ValueType::Bool);
        Ok(())
    }

    fn err(&self, r: &SourceReader, message: impl Into<String>) -> KconfigError {
        let loc = r.location();
        KconfigError::parse(loc.file, loc.line, message)
    }

    fn quoted(&self, r: &SourceReader, rest: &str) -> KconfigResult<String> {
        let (text, leftover) = take_quoted(rest)
            .ok_or_else(|| self.err(r, "expected a quoted string"))?;
        if !leftover.trim().is_empty() {
            return Err(self
                .err(r, format!("unexpected text after string: `{}`", leftover.trim()))
                .into());
        }
        Ok(text)
    }

    fn quoted_with_cond(
        &self,
        r: &SourceReader,
        rest: &str,
    ) -> KconfigResult<(String, Option<String>)> {
        let (text, leftover) = take_quoted(rest)
            .ok_or_else(|| self.err(r, "expected a quoted prompt"))?;
        let leftover = leftover.trim();
        if leftover.is_empty() {
            return Ok((text, None));
        }
        let cond = leftover
            .strip_prefix("if")
            .filter(|c| c.starts_with(char::is_whitespace))
            .map(str::trim)
            .ok_or_else(|| self.err(r, format!("unexpected text after prompt: `{}`", leftover)))?;
        Ok((text, Some(cond.to_string())))
    }

    fn ident(&self, r: &SourceReader, rest: &str) -> KconfigResult<String> {
        let name = rest.trim();
        if !is_identifier(name) {
            return Err(self
                .err(r, format!("expected a symbol name, got `{}`", name))
                .into());
        }
        Ok(name.to_string())
    }
}

fn split_keyword(line: &str) -> (&str, &str) {
    match line.find(char::is_whitespace) {
        Some(pos) => (&line[..pos], &line[pos..]),
        None => (line, ""),
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Split `EXPR [if COND]` at the first standalone `if` outside quotes.
fn split_value_cond(rest: &str) -> (String, Option<String>) {
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let bytes = rest.as_bytes();
    for (idx, c) in rest.char_indices() {
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
            'i' if quote.is_none() => {
                let before_ok = idx == 0 || bytes[idx - 1].is_ascii_whitespace();
                let word_end = idx + 2;
                let after_ok = word_end <= rest.len()
                    && rest[idx..].starts_with("if")
                    && rest[word_end..]
                        .chars()
                        .next()
                        .map(|c| c.is_whitespace())
                        .unwrap_or(false);
                if before_ok && after_ok {
                    return (
                        rest[..idx].trim().to_string(),
                        Some(rest[word_end..].trim().to_string()),
                    );
                }
            }
            _ => {}
        }
    }
    (rest.trim().to_string(), None)
}

/// Leading quoted string of `rest`; returns the unescaped body and whatever
/// follows the closing quote.
fn take_quoted(rest: &str) -> Option<(String, &str)> {
    let rest = rest.trim_start();
    let mut chars = rest.char_indices();
    let (_, delim) = chars.next()?;
    if delim != '"' && delim != '\'' {
        return None;
    }
    let mut out = String::new();
    let mut escaped = false;
    for (idx, c) in chars {
        if escaped {
            if c != delim && c != '\\' {
                out.push('\\');
            }
            out.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            c if c == delim => return Some((out, &rest[idx + c.len_utf8()..])),
            c => out.push(c),
        }
    }
    None
}

pub(crate) fn unquote(s: &str) -> String {
    match take_quoted(s) {
        Some((text, leftover)) if leftover.trim().is_empty() => text,
        _ => s.trim().to_string(),
    }
}
