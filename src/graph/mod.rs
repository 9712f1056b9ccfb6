use anyhow::Context;
use fxhash::FxHashMap;
use indexmap::IndexSet;
use log::warn;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::Direction;
use rayon::prelude::*;

use crate::errors::{KconfigError, KconfigResult};
use crate::expr::compile::{collect_literals, SymbolLookup};
use crate::expr::{compile, CompiledExpr};
use crate::symbol::{AttributeKind, EntryKind, SymbolArena, SymbolId};

#[cfg(test)]
mod tests;

/// Run the whole post-parse pipeline: flatten the entry tree, compile every
/// expression, wire reverse dependencies, layer the universe and precompute
/// the per-symbol controls frontiers. Returns the layers in ascending
/// order; a depends-on cycle fails the load.
pub fn build(arena: &mut SymbolArena) -> KconfigResult<Vec<Vec<SymbolId>>> {
    let root = arena.root.context("no entry tree has been parsed")?;
    let universe = arena.document_order(root);

    let literals = allocate_literals(arena, &universe);
    compile_expressions(arena, &universe, &literals);
    wire_reverse_deps(arena, &universe);

    let layers = layer(arena, &universe)?;
    close_transitively(arena, &layers);
    compute_controls(arena, &layers);
    Ok(layers)
}

/// Conjunction of the inherited nest condition and every `depends on`
/// attribute, as raw text.
fn depends_text(arena: &SymbolArena, id: SymbolId) -> Option<String> {
    let sym = arena.get(id);
    let mut parts: Vec<&str> = Vec::new();
    if let Some(nest) = sym.nest_depends_on.as_deref() {
        parts.push(nest);
    }
    parts.extend(
        sym.attributes
            .iter()
            .filter(|a| a.is(AttributeKind::DependsOn))
            .map(|a| a.value.as_str()),
    );
    match parts.len() {
        0 => None,
        1 => Some(parts[0].to_string()),
        _ => Some(
            parts
                .iter()
                .map(|p| format!("({})", p))
                .collect::<Vec<_>>()
                .join(" && "),
        ),
    }
}

/// Default values compile as expressions only for boolish non-choice
/// entries. Elsewhere the value is a literal (or a symbol name resolved at
/// evaluation time).
fn default_compiles_as_expr(arena: &SymbolArena, id: SymbolId) -> bool {
    let sym = arena.get(id);
    sym.kind != EntryKind::Choice && sym.value_type.is_boolish()
}

/// Pre-allocate one constant string symbol per distinct quoted literal in
/// the universe, so the parallel compile sweep never mutates the arena.
fn allocate_literals(arena: &mut SymbolArena, universe: &[SymbolId]) -> FxHashMap<String, SymbolId> {
    let mut texts: IndexSet<String> = IndexSet::new();
    for &id in universe {
        if let Some(depends) = depends_text(arena, id) {
            texts.extend(collect_literals(&depends));
        }
        let value_is_expr = default_compiles_as_expr(arena, id);
        for attr in &arena.get(id).attributes {
            if let Some(cond) = attr.cond.as_deref() {
                texts.extend(collect_literals(cond));
            }
            if value_is_expr && attr.is(AttributeKind::Default) {
                texts.extend(collect_literals(&attr.value));
            }
        }
    }

    let mut map = FxHashMap::default();
    for text in texts {
        let id = arena.alloc_const_string(&text);
        map.insert(text, id);
    }
    map
}

struct Table<'a> {
    arena: &'a SymbolArena,
    literals: &'a FxHashMap<String, SymbolId>,
}

impl SymbolLookup for Table<'_> {
    fn resolve(&self, name: &str) -> Option<SymbolId> {
        self.arena.lookup(name)
    }

    fn resolve_literal(&self, text: &str) -> Option<SymbolId> {
        self.literals.get(text).copied()
    }
}

struct CompiledSymbol {
    id: SymbolId,
    depends: Option<CompiledExpr>,
    /// Per attribute index: compiled condition and compiled value.
    attrs: Vec<(usize, Option<CompiledExpr>, Option<CompiledExpr>)>,
    refs: IndexSet<SymbolId>,
}

/// Compile every expression in the universe on the rayon pool, then install
/// the results on the calling thread. A failed compile logs a located
/// diagnostic and leaves a null expression; the load continues.
fn compile_expressions(
    arena: &mut SymbolArena,
    universe: &[SymbolId],
    literals: &FxHashMap<String, SymbolId>,
) {
    let compiled: Vec<CompiledSymbol> = {
        let shared: &SymbolArena = arena;
        let table = Table {
            arena: shared,
            literals,
        };
        universe
            .par_iter()
            .map(|&id| compile_symbol(shared, &table, id))
            .collect()
    };

    for c in compiled {
        let choice_parent = arena.choice_parent(c.id);
        let sym = arena.get_mut(c.id);
        sym.depends_on_expr = c.depends.map(|d| d.expr);
        for (idx, cond, value) in c.attrs {
            sym.attributes[idx].cond_expr = cond.map(|c| c.expr);
            sym.attributes[idx].value_expr = value.map(|v| v.expr);
        }
        sym.depends_on_list = c.refs;
        if let Some(parent) = choice_parent {
            sym.depends_on_list.insert(parent);
        }
    }
}

fn try_compile(
    text: &str,
    table: &Table<'_>,
    location: &crate::reader::Location,
    refs: &mut IndexSet<SymbolId>,
) -> Option<CompiledExpr> {
    match compile(text, table, location) {
        Ok(compiled) => {
            if let Some(c) = &compiled {
                refs.extend(c.refs.iter().copied());
            }
            compiled
        }
        Err(e) => {
            warn!("{}", e);
            None
        }
    }
}

fn compile_symbol(arena: &SymbolArena, table: &Table<'_>, id: SymbolId) -> CompiledSymbol {
    let sym = arena.get(id);
    let location = &sym.location;
    let mut refs: IndexSet<SymbolId> = IndexSet::new();

    let depends =
        depends_text(arena, id).and_then(|text| try_compile(&text, table, location, &mut refs));

    let value_is_expr = default_compiles_as_expr(arena, id);
    let mut attrs = Vec::new();
    for (idx, attr) in sym.attributes.iter().enumerate() {
        let cond = attr
            .cond
            .as_deref()
            .and_then(|c| try_compile(c, table, location, &mut refs));
        let value = if value_is_expr && attr.is(AttributeKind::Default) {
            try_compile(&attr.value, table, location, &mut refs)
        } else {
            None
        };
        if cond.is_some() || value.is_some() {
            attrs.push((idx, cond, value));
        }

        // Non-expression payloads can still reference symbols: a default
        // naming another config, or range bounds given as symbols.
        if !value_is_expr && attr.is(AttributeKind::Default) && sym.kind != EntryKind::Choice {
            if let Some(target) = arena.lookup(attr.value.trim()) {
                refs.insert(target);
            }
        }
        if attr.is(AttributeKind::Range) {
            for bound in attr.value.split_whitespace() {
                if let Some(target) = arena.lookup(bound) {
                    refs.insert(target);
                }
            }
        }
    }

    refs.shift_remove(&id);
    CompiledSymbol {
        id,
        depends,
        attrs,
        refs,
    }
}

/// Resolve `select`/`imply` targets and record the back edges. The selector
/// also becomes a dependency of the target so the clamp re-runs whenever
/// the selector moves. Unknown targets are warnings, not errors.
fn wire_reverse_deps(arena: &mut SymbolArena, universe: &[SymbolId]) {
    for &id in universe {
        for idx in 0..arena.get(id).attributes.len() {
            let attr = &arena.get(id).attributes[idx];
            let kind = attr.kind;
            if !matches!(kind, AttributeKind::Select | AttributeKind::Imply) {
                continue;
            }
            let target_name = attr.value.clone();
            match arena.lookup(&target_name) {
                Some(target) if target != id => {
                    arena.get_mut(id).attributes[idx].reverse_dep = Some(target);
                    let target_sym = arena.get_mut(target);
                    if kind == AttributeKind::Select {
                        target_sym.be_selected_list.push(id);
                    } else {
                        target_sym.be_implied_list.push(id);
                    }
                    target_sym.depends_on_list.insert(id);
                }
                Some(_) => warn!(
                    "{}: `{}` targets itself",
                    arena.get(id).location,
                    target_name
                ),
                None => warn!(
                    "{}: unknown {} target `{}`",
                    arena.get(id).location,
                    if kind == AttributeKind::Select {
                        "select"
                    } else {
                        "imply"
                    },
                    target_name
                ),
            }
        }
    }
}

/// Layered Kahn partition. Layer 0 holds the dependency-free symbols; each
/// later layer depends only on earlier ones. Whatever cannot be placed is
/// the circular set and fails the load.
fn layer(arena: &mut SymbolArena, universe: &[SymbolId]) -> KconfigResult<Vec<Vec<SymbolId>>> {
    let mut node_of: FxHashMap<SymbolId, NodeIndex> = FxHashMap::default();
    let mut graph: DiGraph<SymbolId, ()> = DiGraph::new();
    for &id in universe {
        node_of.insert(id, graph.add_node(id));
    }
    for &id in universe {
        for &dep in &arena.get(id).depends_on_list {
            if let Some(&from) = node_of.get(&dep) {
                graph.add_edge(from, node_of[&id], ());
            }
        }
    }

    let mut indegree: Vec<usize> = graph
        .node_indices()
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();

    let mut current: Vec<NodeIndex> = graph
        .node_indices()
        .filter(|n| indegree[n.index()] == 0)
        .collect();
    let mut layers: Vec<Vec<SymbolId>> = Vec::new();

    while !current.is_empty() {
        let level = layers.len();
        let mut next = Vec::new();
        for &n in &current {
            arena.get_mut(graph[n]).depends_on_level = Some(level);
            for m in graph.neighbors_directed(n, Direction::Outgoing) {
                indegree[m.index()] -= 1;
                if indegree[m.index()] == 0 {
                    next.push(m);
                }
            }
        }
        next.sort_unstable();
        layers.push(current.iter().map(|&n| graph[n]).collect());
        current = next;
    }

    let circulating: Vec<SymbolId> = universe
        .iter()
        .copied()
        .filter(|&id| arena.get(id).depends_on_level.is_none())
        .collect();
    if !circulating.is_empty() {
        let names = circulating
            .iter()
            .map(|&id| arena.get(id).name.clone())
            .collect();
        return Err(KconfigError::CircularDependency { names }.into());
    }

    Ok(layers)
}

/// The depends-on list is transitive. Close the direct reference sets over
/// ascending layers; each layer only reads finalized lower layers, so the
/// sweep parallelizes within a layer.
fn close_transitively(arena: &mut SymbolArena, layers: &[Vec<SymbolId>]) {
    for layer in layers.iter().skip(1) {
        let closed: Vec<(SymbolId, IndexSet<SymbolId>)> = {
            let shared = &*arena;
            layer
                .par_iter()
                .map(|&id| {
                    let mut set = shared.get(id).depends_on_list.clone();
                    for &dep in &shared.get(id).depends_on_list {
                        set.extend(shared.get(dep).depends_on_list.iter().copied());
                    }
                    (id, set)
                })
                .collect()
        };
        for (id, set) in closed {
            arena.get_mut(id).depends_on_list = set;
        }
    }
}

/// For every symbol, the BFS frontier of downstream layers: per higher
/// layer, the symbols there that depend on it. Evaluation replays these
/// sets in order instead of re-walking the graph.
fn compute_controls(arena: &mut SymbolArena, layers: &[Vec<SymbolId>]) {
    let controls: Vec<(SymbolId, Vec<Vec<SymbolId>>)> = {
        let shared = &*arena;
        layers
            .par_iter()
            .enumerate()
            .flat_map(|(level, layer)| {
                layer.par_iter().map(move |&id| {
                    let mut frontiers = Vec::new();
                    for higher in layers.iter().skip(level + 1) {
                        let set: Vec<SymbolId> = higher
                            .iter()
                            .copied()
                            .filter(|&t| shared.get(t).depends_on_list.contains(&id))
                            .collect();
                        if !set.is_empty() {
                            frontiers.push(set);
                        }
                    }
                    (id, frontiers)
                })
            })
            .collect()
    };

    for (id, frontiers) in controls {
        arena.get_mut(id).controls_list = frontiers;
    }
}
