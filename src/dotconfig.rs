use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::Context;
use log::debug;

use crate::errors::KconfigResult;
use crate::eval;
use crate::symbol::{ChangeEvent, EntryKind, Symbol, SymbolArena, SymbolId, ValueType};
use crate::tri::Tristate;

#[derive(Debug, PartialEq, Eq)]
enum DiskValue {
    TriBool(String),
    Int(String),
    Hex(String),
    Str(String),
}

/// Overlay a previous `.config` onto the loaded tree. Records match
/// symbols by name; unmatched names and type mismatches are skipped
/// silently. After the overlay a settle pass re-evaluates every layer.
pub fn read_dot_config(
    arena: &SymbolArena,
    layers: &[Vec<SymbolId>],
    path: &Path,
) -> KconfigResult<Vec<ChangeEvent>> {
    let file =
        File::open(path).with_context(|| format!("reading {}", path.display()))?;
    let mut events = Vec::new();

    for line in BufReader::new(file).lines() {
        let line = line?;
        let record = match parse_line(line.trim()) {
            Some(record) => record,
            None => continue,
        };
        let (name, value) = record;
        let id = match arena.lookup(&name) {
            Some(id) => id,
            None => continue,
        };
        match accepted_value(arena.get(id), &value) {
            Some(v) => events.extend(eval::set_value(arena, id, Some(&v))?),
            None => debug!(
                "ignoring CONFIG_{}: on-disk type does not match `{:?}`",
                name,
                arena.get(id).value_type
            ),
        }
    }

    events.extend(eval::evaluate_all(arena, layers, false)?);
    Ok(events)
}

/// Type check one record against the symbol. A bool additionally accepts a
/// tristate record; the `m` is down-cast to `y`.
fn accepted_value(sym: &Symbol, value: &DiskValue) -> Option<String> {
    match (sym.value_type, value) {
        (ValueType::Bool, DiskValue::TriBool(v)) => {
            Some(if v == "m" { "y".to_string() } else { v.clone() })
        }
        (ValueType::Tristate, DiskValue::TriBool(v)) => Some(v.clone()),
        (ValueType::Int, DiskValue::Int(v)) => Some(v.clone()),
        (ValueType::Hex, DiskValue::Hex(v)) => Some(v.clone()),
        (ValueType::String, DiskValue::Str(v)) => Some(v.clone()),
        _ => None,
    }
}

fn parse_line(line: &str) -> Option<(String, DiskValue)> {
    if let Some(rest) = line.strip_prefix("# CONFIG_") {
        let name = rest.strip_suffix(" is not set")?;
        if name.is_empty() || name.contains(char::is_whitespace) {
            return None;
        }
        return Some((name.to_string(), DiskValue::TriBool("n".to_string())));
    }

    let rest = line.strip_prefix("CONFIG_")?;
    let eq = rest.find('=')?;
    let name = &rest[..eq];
    let rhs = &rest[eq + 1..];
    if name.is_empty() {
        return None;
    }

    let value = match rhs {
        "y" | "m" => DiskValue::TriBool(rhs.to_string()),
        _ if rhs.starts_with('"') => DiskValue::Str(unescape_string(rhs)?),
        _ if rhs.starts_with("0x") || rhs.starts_with("0X") => DiskValue::Hex(rhs.to_string()),
        _ if rhs.parse::<i64>().is_ok() => DiskValue::Int(rhs.to_string()),
        _ => {
            debug!("ignoring malformed .config line: {}", line);
            return None;
        }
    };
    Some((name.to_string(), value))
}

fn unescape_string(rhs: &str) -> Option<String> {
    let body = rhs.strip_prefix('"')?.strip_suffix('"')?;
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            out.push(chars.next()?);
        } else {
            out.push(c);
        }
    }
    Some(out)
}

/// Serialize the current selection in document order: banner, main prompt
/// header, menu headers, one line per config symbol.
pub fn write_dot_config(arena: &SymbolArena, path: &Path) -> KconfigResult<()> {
    let root = arena.root.context("no configuration is loaded")?;
    let mut out = String::new();
    out.push_str("# Automatically generated file; DO NOT EDIT.\n");

    let root_sym = arena.get(root);
    if !root_sym.name.is_empty() {
        out.push_str(&format!("#\n# {}\n#\n", root_sym.name));
    }

    write_entries(arena, root, &mut out);
    std::fs::write(path, out).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

fn write_entries(arena: &SymbolArena, id: SymbolId, out: &mut String) {
    for &child in &arena.get(id).children {
        let sym = arena.get(child);
        match sym.kind {
            EntryKind::Menu => out.push_str(&format!("\n#\n# {}\n#\n", sym.name)),
            EntryKind::Config | EntryKind::MenuConfig => write_symbol_line(sym, out),
            _ => {}
        }
        if sym.kind.is_structural() {
            write_entries(arena, child, out);
        }
    }
}

fn write_symbol_line(sym: &Symbol, out: &mut String) {
    if sym.name.is_empty() {
        return;
    }
    // Environment pass-throughs are not configuration.
    if sym.name.starts_with('$') && sym.is_enable() {
        return;
    }

    match sym.value_type {
        ValueType::Bool | ValueType::Tristate => match sym.tri_value() {
            Tristate::No => out.push_str(&format!("# CONFIG_{} is not set\n", sym.name)),
            tri => out.push_str(&format!("CONFIG_{}={}\n", sym.name, tri)),
        },
        ValueType::Int | ValueType::Hex => {
            if let Some(value) = sym.value() {
                out.push_str(&format!("CONFIG_{}={}\n", sym.name, value));
            }
        }
        ValueType::String => {
            if let Some(value) = sym.value() {
                out.push_str(&format!("CONFIG_{}=\"{}\"\n", sym.name, escape_string(&value)));
            }
        }
        ValueType::Invalid => {}
    }
}

fn escape_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
