use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::env::MapEnv;
use crate::errors::KconfigError;
use crate::graph;
use crate::parser::{parse_str, ParserContext};
use crate::symbol::{SymbolArena, SymbolId};

fn build(text: &str) -> (SymbolArena, Vec<Vec<SymbolId>>) {
    let mut arena = SymbolArena::new();
    let ctx = ParserContext::new(".", 4, Arc::new(MapEnv::new()));
    parse_str(&mut arena, &ctx, "Kconfig", text).unwrap();
    let layers = graph::build(&mut arena).unwrap();
    (arena, layers)
}

fn deps_of(arena: &SymbolArena, name: &str) -> Vec<String> {
    let id = arena.lookup(name).unwrap();
    arena
        .get(id)
        .depends_on_list
        .iter()
        .map(|&d| arena.get(d).name.clone())
        .collect()
}

#[test]
fn textual_references_become_dependencies() {
    let (arena, _) = build(
        "config A\n\
         \tbool \"a\"\n\
         \tdepends on B && !C\n\
         config B\n\
         \tbool \"b\"\n\
         config C\n\
         \tbool \"c\"\n",
    );
    assert_eq!(deps_of(&arena, "A"), vec!["B", "C"]);
    assert!(deps_of(&arena, "B").is_empty());

    let a = arena.get(arena.lookup("A").unwrap());
    let b = arena.get(arena.lookup("B").unwrap());
    assert!(a.depends_on_level.unwrap() > b.depends_on_level.unwrap());
}

#[test]
fn layers_respect_dependency_order() {
    let (arena, layers) = build(
        "config A\n\
         \tbool \"a\"\n\
         \tdepends on B\n\
         config B\n\
         \tbool \"b\"\n\
         \tdepends on C\n\
         config C\n\
         \tbool \"c\"\n",
    );
    for layer in &layers {
        for &id in layer {
            let level = arena.get(id).depends_on_level.unwrap();
            for &dep in &arena.get(id).depends_on_list {
                assert!(arena.get(dep).depends_on_level.unwrap() < level);
            }
        }
    }
}

#[test]
fn depends_on_list_is_transitive() {
    let (arena, _) = build(
        "config A\n\
         \tbool \"a\"\n\
         \tdepends on B\n\
         config B\n\
         \tbool \"b\"\n\
         \tdepends on C\n\
         config C\n\
         \tbool \"c\"\n",
    );
    assert_eq!(deps_of(&arena, "A"), vec!["B", "C"]);
}

#[test]
fn select_wires_reverse_edges_and_ordering() {
    let (arena, _) = build(
        "config A\n\
         \ttristate \"a\"\n\
         config B\n\
         \ttristate \"b\"\n\
         \tselect A if B\n\
         config C\n\
         \ttristate \"c\"\n\
         \timply A\n",
    );
    let a = arena.lookup("A").unwrap();
    let b = arena.lookup("B").unwrap();
    let c = arena.lookup("C").unwrap();

    assert_eq!(arena.get(a).be_selected_list, vec![b]);
    assert_eq!(arena.get(a).be_implied_list, vec![c]);
    // The selector is a dependency of the target, so the clamp re-runs
    // whenever the selector moves.
    assert!(arena.get(a).depends_on_list.contains(&b));
    assert!(arena.get(a).depends_on_list.contains(&c));

    let select_attr = arena
        .get(b)
        .attributes
        .iter()
        .find(|x| x.reverse_dep.is_some())
        .unwrap();
    assert_eq!(select_attr.reverse_dep, Some(a));
}

#[test_log::test]
fn unknown_select_target_is_not_fatal() {
    let (arena, _) = build(
        "config A\n\
         \tbool \"a\"\n\
         \tselect GHOST\n",
    );
    let a = arena.get(arena.lookup("A").unwrap());
    let select_attr = a
        .attributes
        .iter()
        .find(|x| x.is(crate::symbol::AttributeKind::Select))
        .unwrap();
    assert_eq!(select_attr.reverse_dep, None);
}

#[test]
fn cycles_fail_the_load_with_the_offending_set() {
    let mut arena = SymbolArena::new();
    let ctx = ParserContext::new(".", 4, Arc::new(MapEnv::new()));
    parse_str(
        &mut arena,
        &ctx,
        "Kconfig",
        "config A\n\
         \tbool \"a\"\n\
         \tdepends on B\n\
         config B\n\
         \tbool \"b\"\n\
         \tdepends on A\n",
    )
    .unwrap();
    let err = graph::build(&mut arena).unwrap_err();
    match err.downcast_ref::<KconfigError>() {
        Some(KconfigError::CircularDependency { names }) => {
            let mut names = names.clone();
            names.sort();
            assert_eq!(names, vec!["A", "B"]);
        }
        other => panic!("expected CircularDependency, got {:?}", other),
    }
}

#[test_log::test]
fn bad_expression_leaves_a_null_depends() {
    let (arena, _) = build(
        "config A\n\
         \tbool \"a\"\n\
         \tdepends on NO_SUCH_SYMBOL\n",
    );
    let a = arena.get(arena.lookup("A").unwrap());
    assert!(a.depends_on_expr.is_none());
    assert!(a.depends_on_list.is_empty());
}

#[test]
fn string_literals_do_not_become_dependencies() {
    let (arena, _) = build(
        "config BOARD\n\
         \tstring \"board\"\n\
         config A\n\
         \tbool \"a\"\n\
         \tdepends on BOARD = \"falcon\"\n",
    );
    assert_eq!(deps_of(&arena, "A"), vec!["BOARD"]);
}

#[test]
fn choice_children_depend_on_the_choice() {
    let (arena, _) = build(
        "choice\n\
         \tprompt \"flavor\"\n\
         config X\n\
         \tbool \"x\"\n\
         config Y\n\
         \tbool \"y\"\n\
         endchoice\n",
    );
    let x = arena.lookup("X").unwrap();
    let choice = arena.get(x).parent.unwrap();
    assert!(arena.get(x).depends_on_list.contains(&choice));
    assert!(
        arena.get(x).depends_on_level.unwrap() > arena.get(choice).depends_on_level.unwrap()
    );
}

#[test]
fn controls_enumerate_downstream_frontiers() {
    let (arena, _) = build(
        "config A\n\
         \tbool \"a\"\n\
         \tdepends on B\n\
         config B\n\
         \tbool \"b\"\n\
         \tdepends on C\n\
         config C\n\
         \tbool \"c\"\n",
    );
    let c = arena.get(arena.lookup("C").unwrap());
    let frontiers: Vec<Vec<String>> = c
        .controls_list
        .iter()
        .map(|layer| layer.iter().map(|&t| arena.get(t).name.clone()).collect())
        .collect();
    assert_eq!(frontiers, vec![vec!["B"], vec!["A"]]);

    let b = arena.get(arena.lookup("B").unwrap());
    let frontiers: Vec<Vec<String>> = b
        .controls_list
        .iter()
        .map(|layer| layer.iter().map(|&t| arena.get(t).name.clone()).collect())
        .collect();
    assert_eq!(frontiers, vec![vec!["A"]]);

    let a = arena.get(arena.lookup("A").unwrap());
    assert!(a.controls_list.is_empty());
}
