use std::sync::Arc;

use pretty_assertions::assert_eq;

use crate::env::MapEnv;
use crate::eval::{
    apply_choice_child_rule, clamp_reverse_deps, compute_default, evaluate_all, store_validated,
    EvalCtx,
};
use crate::graph;
use crate::parser::{parse_str, ParserContext};
use crate::symbol::{SymbolArena, SymbolId};

/// Parse, build and run the default pass, leaving the tree ready for poking
/// at individual evaluation steps.
fn fixture(text: &str) -> SymbolArena {
    let mut arena = SymbolArena::new();
    let ctx = ParserContext::new(".", 4, Arc::new(MapEnv::new()));
    parse_str(&mut arena, &ctx, "Kconfig", text).unwrap();
    let layers = graph::build(&mut arena).unwrap();
    evaluate_all(&arena, &layers, true).unwrap();
    arena
}

fn set_base(arena: &SymbolArena, id: SymbolId, value: &str) {
    let mut state = arena.get(id).state.write().unwrap();
    state.base_value = Some(value.to_string());
    state.value = Some(value.to_string());
}

fn value(arena: &SymbolArena, name: &str) -> Option<String> {
    arena.get(arena.lookup(name).unwrap()).value()
}

const TRISTATE_CHOICE: &str = "choice\n\
     \tprompt \"C\"\n\
     \tdefault X\n\
     config X\n\
     \ttristate \"X\"\n\
     config Y\n\
     \ttristate \"Y\"\n\
     endchoice\n";

#[test]
fn choice_child_m_survives_on_tristate_choices() {
    let arena = fixture(TRISTATE_CHOICE);
    let choice = arena.get(arena.root.unwrap()).children[0];
    let y = arena.lookup("Y").unwrap();

    // Unselected child with a modular base keeps it.
    set_base(&arena, y, "m");
    apply_choice_child_rule(&EvalCtx::new(&arena), y, choice);
    assert_eq!(value(&arena, "Y").as_deref(), Some("m"));

    // A plain `n` base stays off.
    set_base(&arena, y, "n");
    apply_choice_child_rule(&EvalCtx::new(&arena), y, choice);
    assert_eq!(value(&arena, "Y").as_deref(), Some("n"));

    // The selected child is forced to `y` regardless of its base.
    let x = arena.lookup("X").unwrap();
    set_base(&arena, x, "m");
    apply_choice_child_rule(&EvalCtx::new(&arena), x, choice);
    assert_eq!(value(&arena, "X").as_deref(), Some("y"));
}

#[test]
fn choice_child_collapses_to_n_on_bool_choices() {
    let arena = fixture(
        "choice\n\
         \tprompt \"C\"\n\
         \tdefault X\n\
         config X\n\
         \tbool \"X\"\n\
         config Y\n\
         \tbool \"Y\"\n\
         endchoice\n",
    );
    let choice = arena.get(arena.root.unwrap()).children[0];
    let y = arena.lookup("Y").unwrap();

    // No m-survival outside tristate choices.
    set_base(&arena, y, "y");
    apply_choice_child_rule(&EvalCtx::new(&arena), y, choice);
    assert_eq!(value(&arena, "Y").as_deref(), Some("n"));
}

#[test]
fn choice_default_matching_no_child_is_ignored() {
    let arena = fixture(
        "choice\n\
         \tprompt \"C\"\n\
         \tdefault GHOST\n\
         config X\n\
         \tbool \"X\"\n\
         config Y\n\
         \tbool \"Y\"\n\
         endchoice\n",
    );
    let choice = arena.get(arena.root.unwrap()).children[0];
    // Behaves as if absent: first child wins.
    assert_eq!(compute_default(&arena, choice).as_deref(), Some("X"));
    assert_eq!(arena.get(choice).value().as_deref(), Some("X"));
}

#[test]
fn optional_choice_default_matching_no_child_clears() {
    let arena = fixture(
        "choice\n\
         \tprompt \"C\"\n\
         \tdefault GHOST\n\
         \toptional\n\
         config X\n\
         \tbool \"X\"\n\
         config Y\n\
         \tbool \"Y\"\n\
         endchoice\n",
    );
    let choice = arena.get(arena.root.unwrap()).children[0];
    assert_eq!(compute_default(&arena, choice), None);
    assert_eq!(arena.get(choice).value(), None);
}

const BOOL_SELECT: &str = "config A\n\
     \tbool \"A\"\n\
     config B\n\
     \ttristate \"B\"\n\
     \tselect A\n";

#[test]
fn clamp_promotes_mod_to_yes_for_bool() {
    let arena = fixture(BOOL_SELECT);
    let a = arena.lookup("A").unwrap();
    let b = arena.lookup("B").unwrap();

    let ctx = EvalCtx::new(&arena);
    assert!(store_validated(&ctx, b, Some("m".to_string())));
    clamp_reverse_deps(&ctx, a, Some(b));
    // The tristate floor is m; a bool target never stores M.
    assert_eq!(value(&arena, "A").as_deref(), Some("y"));
}

#[test]
fn clamp_rederives_the_effective_value_from_the_base() {
    let arena = fixture(BOOL_SELECT);
    let a = arena.lookup("A").unwrap();
    let b = arena.lookup("B").unwrap();

    let ctx = EvalCtx::new(&arena);
    assert!(store_validated(&ctx, b, Some("y".to_string())));
    clamp_reverse_deps(&ctx, a, Some(b));
    assert_eq!(value(&arena, "A").as_deref(), Some("y"));

    // Releasing the select drops the target back to its base, not to the
    // previously clamped value.
    assert!(store_validated(&ctx, b, Some("n".to_string())));
    clamp_reverse_deps(&ctx, a, Some(b));
    assert_eq!(value(&arena, "A").as_deref(), Some("n"));
}

#[test]
fn imply_is_skipped_when_the_edit_originates_locally() {
    let arena = fixture(
        "config A\n\
         \ttristate \"A\"\n\
         config B\n\
         \ttristate \"B\"\n\
         \timply A\n",
    );
    let a = arena.lookup("A").unwrap();
    let b = arena.lookup("B").unwrap();

    let ctx = EvalCtx::new(&arena);
    assert!(store_validated(&ctx, b, Some("m".to_string())));

    // Recomputed from elsewhere, the implication floors A at m.
    clamp_reverse_deps(&ctx, a, Some(b));
    assert_eq!(value(&arena, "A").as_deref(), Some("m"));

    // An edit on A itself ignores the weak edge.
    assert!(store_validated(&ctx, a, Some("n".to_string())));
    clamp_reverse_deps(&ctx, a, Some(a));
    assert_eq!(value(&arena, "A").as_deref(), Some("n"));
}

#[test]
fn invalid_values_are_retained_and_never_clamped() {
    let arena = fixture(BOOL_SELECT);
    let a = arena.lookup("A").unwrap();
    let b = arena.lookup("B").unwrap();

    let ctx = EvalCtx::new(&arena);
    assert!(store_validated(&ctx, b, Some("y".to_string())));
    assert!(!store_validated(&ctx, a, Some("frob".to_string())));

    clamp_reverse_deps(&ctx, a, Some(b));
    assert_eq!(value(&arena, "A").as_deref(), Some("frob"));
    assert!(arena
        .get(a)
        .state
        .read()
        .unwrap()
        .value_error
        .is_some());
}
