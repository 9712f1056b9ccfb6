use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use rayon::prelude::*;
use regex::Regex;

use crate::errors::{KconfigError, KconfigResult};
use crate::symbol::{
    Attribute, AttributeKind, ChangeEvent, ChangeKind, EntryKind, Symbol, SymbolArena, SymbolId,
    ValueType,
};
use crate::tri::Tristate;

#[cfg(test)]
mod tests;

static INT_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^-?\d+$").unwrap());
static HEX_REGEX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]+$").unwrap());

/// Shared per-pass scratch: buffered change notifications and the per-layer
/// error collector. Notifications flush to the caller after the pass;
/// within a layer their order is unspecified.
struct EvalCtx<'a> {
    arena: &'a SymbolArena,
    events: Mutex<Vec<ChangeEvent>>,
    errors: Mutex<Vec<String>>,
}

impl<'a> EvalCtx<'a> {
    fn new(arena: &'a SymbolArena) -> EvalCtx<'a> {
        EvalCtx {
            arena,
            events: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    fn emit(&self, symbol: SymbolId, kind: ChangeKind) {
        self.events.lock().unwrap().push(ChangeEvent { symbol, kind });
    }

    fn fail(&self, message: String) {
        self.errors.lock().unwrap().push(message);
    }

    fn drain_layer_errors(&self) -> Option<KconfigError> {
        let mut errors = self.errors.lock().unwrap();
        if errors.is_empty() {
            None
        } else {
            Some(KconfigError::LayerFailure {
                errors: std::mem::take(&mut *errors),
            })
        }
    }

    fn into_events(self) -> Vec<ChangeEvent> {
        self.events.into_inner().unwrap()
    }
}

/// Full pass over every layer in ascending order. With `load_defaults` this
/// is the initial pass that materializes default values; without it, a
/// settle pass after a `.config` overlay. Layers run in parallel
/// internally and join before the next begins.
pub fn evaluate_all(
    arena: &SymbolArena,
    layers: &[Vec<SymbolId>],
    load_defaults: bool,
) -> KconfigResult<Vec<ChangeEvent>> {
    let ctx = EvalCtx::new(arena);
    for layer in layers {
        layer
            .par_iter()
            .for_each(|&id| guarded_calculate(&ctx, id, None, load_defaults));
        if let Some(err) = ctx.drain_layer_errors() {
            return Err(err.into());
        }
    }
    Ok(ctx.into_events())
}

/// Run one symbol's step, converting a panic into a collected layer error
/// so the rest of the layer still drains.
fn guarded_calculate(ctx: &EvalCtx<'_>, id: SymbolId, source: Option<SymbolId>, load_defaults: bool) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(|| calculate(ctx, id, source, load_defaults))) {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "evaluation panicked".to_string());
        ctx.fail(format!("{}: {}", ctx.arena.get(id).location, message));
    }
}

/// Public mutator: validate, store, then cascade through the precomputed
/// controls frontiers. Choice children translate their assignment onto the
/// choice parent first. Invalid values are retained and flagged but do not
/// cascade.
pub fn set_value(
    arena: &SymbolArena,
    id: SymbolId,
    value: Option<&str>,
) -> KconfigResult<Vec<ChangeEvent>> {
    let sym = arena.get(id);

    // Choice-child transformation: "y" selects this child on the parent,
    // "n" on the selected child of an optional choice clears the parent,
    // "m" (tristate choices) applies directly.
    if sym.kind == EntryKind::Config {
        if let Some(parent) = arena.choice_parent(id) {
            match value {
                Some("y") => return set_value(arena, parent, Some(&sym.name)),
                Some("n") => {
                    let parent_sym = arena.get(parent);
                    let selected = parent_sym.value().as_deref() == Some(sym.name.as_str());
                    if selected && parent_sym.has_attribute(AttributeKind::Optional) {
                        return set_value(arena, parent, None);
                    }
                }
                _ => {}
            }
        }
    }

    let ctx = EvalCtx::new(arena);
    let valid = store_validated(&ctx, id, value.map(str::to_string));
    if valid {
        clamp_reverse_deps(&ctx, id, Some(id));
        propagate(&ctx, id)?;
    }
    if let Some(err) = ctx.drain_layer_errors() {
        return Err(err.into());
    }
    Ok(ctx.into_events())
}

/// Replay the source's controls list: one frontier per downstream layer,
/// parallel within the frontier, strictly sequential across frontiers.
fn propagate(ctx: &EvalCtx<'_>, source: SymbolId) -> KconfigResult<()> {
    let controls = &ctx.arena.get(source).controls_list;
    for frontier in controls {
        frontier
            .par_iter()
            .for_each(|&t| guarded_calculate(ctx, t, Some(source), false));
        if let Some(err) = ctx.drain_layer_errors() {
            return Err(err.into());
        }
    }
    Ok(())
}

/// The unified per-symbol step: dependency result, prompt and default
/// selection, value materialization, visibility, choice-child rule and the
/// reverse-dependency clamp.
fn calculate(ctx: &EvalCtx<'_>, id: SymbolId, source: Option<SymbolId>, load_defaults: bool) {
    let arena = ctx.arena;
    let sym = arena.get(id);

    let depends_result = sym
        .depends_on_expr
        .as_ref()
        .map(|e| e.calculate(arena))
        .unwrap_or(Tristate::Yes);
    let is_enable = depends_result != Tristate::No;
    {
        let mut state = sym.state.write().unwrap();
        if state.is_enable != is_enable {
            state.is_enable = is_enable;
            drop(state);
            ctx.emit(id, ChangeKind::IsEnable);
        }
    }

    match sym.kind {
        EntryKind::Menu | EntryKind::MainMenu => {
            set_prompt(ctx, id, Some(sym.name.clone()));
            let visible = if !is_enable {
                false
            } else {
                visible_if_result(arena, sym) != Tristate::No
            };
            set_visible(ctx, id, visible);
        }
        EntryKind::Comment => {
            set_prompt(ctx, id, Some(sym.name.clone()));
            set_visible(ctx, id, is_enable);
        }
        kind if kind.is_config_like() => {
            let prompt = sym
                .attributes
                .iter()
                .filter(|a| a.is(AttributeKind::Prompt))
                .find(|a| attr_active(arena, a))
                .map(|a| a.value.clone());
            let default = compute_default(arena, id);

            set_prompt(ctx, id, prompt.clone());
            set_default(ctx, id, default.clone());

            if load_defaults {
                // Silent: the initial pass does not notify.
                let mut state = sym.state.write().unwrap();
                state.base_value = default.clone();
                state.value = default;
                state.value_error = None;
            } else if prompt.is_none() {
                // Hidden symbols are driven, never user-typed: go through
                // the validated store so errors and notifications happen.
                store_validated(ctx, id, default);
            }

            let visible = is_enable && prompt.map(|p| !p.is_empty()).unwrap_or(false);
            set_visible(ctx, id, visible);

            if sym.kind == EntryKind::Config {
                if let Some(parent) = arena.choice_parent(id) {
                    apply_choice_child_rule(ctx, id, parent);
                }
            }

            clamp_reverse_deps(ctx, id, source);
        }
        // `if` and `source` entries carry no state beyond is_enable.
        _ => {}
    }
}

fn set_prompt(ctx: &EvalCtx<'_>, id: SymbolId, prompt: Option<String>) {
    let sym = ctx.arena.get(id);
    let mut state = sym.state.write().unwrap();
    if state.prompt != prompt {
        state.prompt = prompt;
        drop(state);
        ctx.emit(id, ChangeKind::Prompt);
    }
}

fn set_default(ctx: &EvalCtx<'_>, id: SymbolId, default: Option<String>) {
    let sym = ctx.arena.get(id);
    let mut state = sym.state.write().unwrap();
    if state.default != default {
        state.default = default;
        drop(state);
        ctx.emit(id, ChangeKind::Default);
    }
}

fn set_visible(ctx: &EvalCtx<'_>, id: SymbolId, visible: bool) {
    let sym = ctx.arena.get(id);
    let mut state = sym.state.write().unwrap();
    if state.is_visible != visible {
        state.is_visible = visible;
        drop(state);
        ctx.emit(id, ChangeKind::IsVisible);
    }
}

/// A conditional attribute is active when its condition is absent or
/// evaluates above `n`. A condition that failed to compile is never
/// active.
fn attr_active(arena: &SymbolArena, attr: &Attribute) -> bool {
    match (&attr.cond, &attr.cond_expr) {
        (None, _) => true,
        (Some(_), Some(expr)) => expr.calculate(arena) != Tristate::No,
        (Some(_), None) => false,
    }
}

fn cond_result(arena: &SymbolArena, attr: &Attribute) -> Tristate {
    match (&attr.cond, &attr.cond_expr) {
        (None, _) => Tristate::Yes,
        (Some(_), Some(expr)) => expr.calculate(arena),
        (Some(_), None) => Tristate::No,
    }
}

/// `visible if` conditions AND together; a menu without any is visible.
fn visible_if_result(arena: &SymbolArena, sym: &Symbol) -> Tristate {
    sym.attributes
        .iter()
        .filter(|a| a.is(AttributeKind::VisibleIf))
        .fold(Tristate::Yes, |acc, a| acc.and(cond_result(arena, a)))
}

fn active_default<'a>(arena: &SymbolArena, sym: &'a Symbol) -> Option<&'a Attribute> {
    sym.attributes
        .iter()
        .filter(|a| a.is(AttributeKind::Default))
        .find(|a| attr_active(arena, a))
}

fn compute_default(arena: &SymbolArena, id: SymbolId) -> Option<String> {
    let sym = arena.get(id);
    match sym.kind {
        EntryKind::Choice => {
            let children = arena.choice_config_children(id);
            let named = active_default(arena, sym).map(|a| a.value.trim().to_string());
            if let Some(name) = named {
                if children.iter().any(|&c| arena.get(c).name == name) {
                    return Some(name);
                }
                // A default that matches no child behaves as if absent.
            }
            if sym.has_attribute(AttributeKind::Optional) {
                None
            } else {
                children.first().map(|&c| arena.get(c).name.clone())
            }
        }
        _ => match sym.value_type {
            ValueType::Bool | ValueType::Tristate => {
                let tri = active_default(arena, sym)
                    .and_then(|a| a.value_expr.as_ref())
                    .map(|e| e.calculate(arena))
                    .unwrap_or(Tristate::No);
                let tri = if sym.value_type == ValueType::Bool && tri == Tristate::Mod {
                    Tristate::Yes
                } else {
                    tri
                };
                Some(tri.as_str().to_string())
            }
            ValueType::Int | ValueType::Hex => {
                if let Some(attr) = active_default(arena, sym) {
                    return Some(default_payload(arena, &attr.value));
                }
                let low = active_range(arena, sym).map(|(low, _)| low);
                Some(low.unwrap_or_else(|| "0".to_string()))
            }
            ValueType::String => active_default(arena, sym)
                .map(|a| default_payload(arena, &a.value)),
            ValueType::Invalid => None,
        },
    }
}

/// Non-expression default payload: a quoted literal, a symbol whose value
/// is copied, or raw text.
fn default_payload(arena: &SymbolArena, raw: &str) -> String {
    let raw = raw.trim();
    if raw.starts_with('"') || raw.starts_with('\'') {
        return crate::parser::unquote(raw);
    }
    if let Some(id) = arena.lookup(raw) {
        return arena.get(id).value().unwrap_or_default();
    }
    raw.to_string()
}

/// First range attribute with an active condition, bounds resolved to
/// strings (symbol bounds read the symbol's current value).
fn active_range(arena: &SymbolArena, sym: &Symbol) -> Option<(String, String)> {
    let attr = sym
        .attributes
        .iter()
        .filter(|a| a.is(AttributeKind::Range))
        .find(|a| attr_active(arena, a))?;
    let mut bounds = attr.value.split_whitespace();
    let low = bounds.next()?;
    let high = bounds.next()?;
    Some((default_payload(arena, low), default_payload(arena, high)))
}

fn parse_number(value_type: ValueType, text: &str) -> Option<i128> {
    match value_type {
        ValueType::Int => text.parse().ok(),
        ValueType::Hex => {
            let digits = text
                .strip_prefix("0x")
                .or_else(|| text.strip_prefix("0X"))
                .unwrap_or(text);
            i128::from_str_radix(digits, 16).ok()
        }
        _ => None,
    }
}

/// Kind- and type-sensitive validation. Returns the error message rather
/// than failing, so invalid values can be retained and flagged.
fn validate(arena: &SymbolArena, id: SymbolId, value: Option<&str>) -> Result<(), String> {
    let sym = arena.get(id);

    if sym.kind == EntryKind::Choice {
        return match value {
            None => {
                if sym.has_attribute(AttributeKind::Optional) {
                    Ok(())
                } else {
                    Err("this choice is not optional".to_string())
                }
            }
            Some(name) => {
                let children = arena.choice_config_children(id);
                if children.iter().any(|&c| arena.get(c).name == name) {
                    Ok(())
                } else {
                    Err(format!("`{}` is not an entry of this choice", name))
                }
            }
        };
    }

    let value = match value {
        Some(v) => v,
        None => return Ok(()),
    };

    match sym.value_type {
        ValueType::Bool => match value {
            "n" | "y" => Ok(()),
            _ => Err(format!("`{}` is not a bool value", value)),
        },
        ValueType::Tristate => match value {
            "n" | "m" | "y" => Ok(()),
            _ => Err(format!("`{}` is not a tristate value", value)),
        },
        ValueType::Int | ValueType::Hex => {
            let well_formed = if sym.value_type == ValueType::Int {
                INT_REGEX.is_match(value)
            } else {
                HEX_REGEX.is_match(value)
            };
            if !well_formed {
                return Err(format!(
                    "`{}` is not a valid {} value",
                    value,
                    if sym.value_type == ValueType::Int {
                        "int"
                    } else {
                        "hex"
                    }
                ));
            }
            if let Some((low, high)) = active_range(arena, sym) {
                let v = parse_number(sym.value_type, value);
                let lo = parse_number(sym.value_type, &low);
                let hi = parse_number(sym.value_type, &high);
                if let (Some(v), Some(lo), Some(hi)) = (v, lo, hi) {
                    if v < lo || v > hi {
                        return Err(format!("`{}` is outside the range {}..{}", value, low, high));
                    }
                }
            }
            Ok(())
        }
        ValueType::String | ValueType::Invalid => Ok(()),
    }
}

/// Store a value with validation. Valid values update base and effective
/// value; invalid ones are retained and flagged on the symbol but report
/// non-cascadable. Emits a value notification on change.
fn store_validated(ctx: &EvalCtx<'_>, id: SymbolId, value: Option<String>) -> bool {
    let verdict = validate(ctx.arena, id, value.as_deref());
    let sym = ctx.arena.get(id);
    let mut state = sym.state.write().unwrap();
    let changed = state.value != value;
    state.base_value = value.clone();
    state.value = value;
    state.value_error = verdict.clone().err();
    drop(state);
    if changed {
        ctx.emit(id, ChangeKind::Value);
    }
    verdict.is_ok()
}

/// A choice child's value is computed from the parent, except that `m`
/// survives on tristate choices.
fn apply_choice_child_rule(ctx: &EvalCtx<'_>, id: SymbolId, parent: SymbolId) {
    let arena = ctx.arena;
    let sym = arena.get(id);
    let parent_sym = arena.get(parent);
    let parent_value = parent_sym.value();
    let selected = parent_value.as_deref() == Some(sym.name.as_str());

    let new_value = if selected {
        "y".to_string()
    } else if parent_sym.value_type != ValueType::Tristate {
        "n".to_string()
    } else {
        let prev = sym.state.read().unwrap().base_value.clone();
        match prev.as_deref() {
            Some("n") | None => "n".to_string(),
            _ => "m".to_string(),
        }
    };

    let mut state = sym.state.write().unwrap();
    let value_changed = state.value.as_deref() != Some(new_value.as_str());
    let selected_changed = state.is_selected != selected;
    state.base_value = Some(new_value.clone());
    state.value = Some(new_value);
    state.is_selected = selected;
    drop(state);
    if value_changed {
        ctx.emit(id, ChangeKind::Value);
    }
    if selected_changed {
        ctx.emit(id, ChangeKind::IsSelected);
    }
}

/// Reverse-dependency clamp: `select` floors the value at the selector's
/// own tri-value; `imply` does the same only when the edit did not
/// originate here. The effective value is re-derived from the base, so a
/// released select lets the symbol drop back.
fn clamp_reverse_deps(ctx: &EvalCtx<'_>, id: SymbolId, source: Option<SymbolId>) {
    let arena = ctx.arena;
    let sym = arena.get(id);
    if sym.kind == EntryKind::Choice || !sym.value_type.is_boolish() {
        return;
    }
    if sym.state.read().unwrap().value_error.is_some() {
        // Invalid values are retained for correction, not clamped.
        return;
    }

    let mut floor = Tristate::No;
    for &r in &sym.be_selected_list {
        floor = floor.or(reverse_dep_contribution(arena, r, id, AttributeKind::Select));
    }
    if source != Some(id) {
        for &r in &sym.be_implied_list {
            floor = floor.or(reverse_dep_contribution(arena, r, id, AttributeKind::Imply));
        }
    }

    let mut state = sym.state.write().unwrap();
    let base = state
        .base_value
        .as_deref()
        .map(Tristate::from_value)
        .unwrap_or(Tristate::No);
    let mut effective = base.or(floor);
    if sym.value_type == ValueType::Bool && effective == Tristate::Mod {
        effective = Tristate::Yes;
    }
    let new_value = Some(effective.as_str().to_string());
    let changed = state.value != new_value;
    state.value = new_value;
    drop(state);

    if changed && source != Some(id) {
        ctx.emit(id, ChangeKind::Value);
    }
}

/// One selector's contribution to the floor: its tri-value limited by the
/// attribute condition, gated on the selector being enabled.
fn reverse_dep_contribution(
    arena: &SymbolArena,
    r: SymbolId,
    target: SymbolId,
    kind: AttributeKind,
) -> Tristate {
    let r_sym = arena.get(r);
    if !r_sym.is_enable() {
        return Tristate::No;
    }
    let r_value = r_sym.tri_value();
    r_sym
        .attributes
        .iter()
        .filter(|a| a.is(kind) && a.reverse_dep == Some(target))
        .fold(Tristate::No, |acc, a| {
            acc.or(r_value.and(cond_result(arena, a)))
        })
}
