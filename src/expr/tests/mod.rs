use fxhash::FxHashMap;
use pretty_assertions::assert_eq;

use crate::expr::compile::{collect_literals, SymbolLookup};
use crate::expr::{compile, ExprKind};
use crate::reader::Location;
use crate::symbol::{EntryKind, SymbolArena, SymbolId, ValueType};
use crate::tri::Tristate;

struct Fixture {
    arena: SymbolArena,
    literals: FxHashMap<String, SymbolId>,
}

impl Fixture {
    fn new(symbols: &[(&str, ValueType, &str)]) -> Fixture {
        let mut arena = SymbolArena::new();
        for &(name, vt, value) in symbols {
            let id = arena.alloc(EntryKind::Config, name, Location::internal());
            let sym = arena.get_mut(id);
            sym.value_type = vt;
            sym.state.get_mut().unwrap().value = Some(value.to_string());
        }
        Fixture {
            arena,
            literals: FxHashMap::default(),
        }
    }

    fn with_literals(mut self, texts: &[&str]) -> Fixture {
        for &text in texts {
            let id = self.arena.alloc_const_string(text);
            self.literals.insert(text.to_string(), id);
        }
        self
    }

    fn eval(&self, text: &str) -> Tristate {
        let compiled = compile(text, self, &Location::internal())
            .unwrap()
            .expect("non-empty expression");
        compiled.expr.calculate(&self.arena)
    }
}

impl SymbolLookup for Fixture {
    fn resolve(&self, name: &str) -> Option<SymbolId> {
        self.arena.lookup(name)
    }

    fn resolve_literal(&self, text: &str) -> Option<SymbolId> {
        self.literals.get(text).copied()
    }
}

#[test]
fn constants_ignore_environment() {
    let f = Fixture::new(&[("A", ValueType::Tristate, "m")]);
    assert_eq!(f.eval("y"), Tristate::Yes);
    assert_eq!(f.eval("M"), Tristate::Mod);
    assert_eq!(f.eval("n"), Tristate::No);
}

#[test]
fn and_or_not_follow_the_lattice() {
    let f = Fixture::new(&[
        ("A", ValueType::Tristate, "m"),
        ("B", ValueType::Tristate, "y"),
        ("C", ValueType::Tristate, "n"),
    ]);
    assert_eq!(f.eval("A && B"), Tristate::Mod);
    assert_eq!(f.eval("A || C"), Tristate::Mod);
    assert_eq!(f.eval("!A"), Tristate::Mod);
    assert_eq!(f.eval("!B"), Tristate::No);
    assert_eq!(f.eval("!(A || B)"), Tristate::No);
}

#[test]
fn precedence_binds_not_eq_and_or() {
    let f = Fixture::new(&[
        ("A", ValueType::Bool, "n"),
        ("B", ValueType::Bool, "y"),
        ("C", ValueType::Bool, "y"),
    ]);
    // (!A) || (B && C), not !(A || B) && C
    assert_eq!(f.eval("!A || B && C"), Tristate::Yes);
    // A && B = y parses as A && (B = y)
    assert_eq!(f.eval("A || B = y"), Tristate::Yes);
    assert_eq!(f.eval("A && B = y"), Tristate::No);
}

#[test]
fn equality_compares_tri_values() {
    let f = Fixture::new(&[
        ("A", ValueType::Tristate, "m"),
        ("B", ValueType::Tristate, "m"),
    ]);
    assert_eq!(f.eval("A = B"), Tristate::Yes);
    assert_eq!(f.eval("A != B"), Tristate::No);
    assert_eq!(f.eval("A = m"), Tristate::Yes);
    assert_eq!(f.eval("A = y"), Tristate::No);
}

#[test]
fn string_symbols_compare_as_strings() {
    let f = Fixture::new(&[
        ("BOARD", ValueType::String, "falcon"),
        ("OTHER", ValueType::String, "Falcon"),
    ])
    .with_literals(&["falcon"]);
    assert_eq!(f.eval("BOARD = \"falcon\""), Tristate::Yes);
    // Case-sensitive, exact.
    assert_eq!(f.eval("OTHER = \"falcon\""), Tristate::No);
    assert_eq!(f.eval("OTHER != \"falcon\""), Tristate::Yes);
}

#[test]
fn bare_symbol_is_wrapped() {
    let f = Fixture::new(&[("A", ValueType::Tristate, "m")]);
    let compiled = compile("A", &f, &Location::internal()).unwrap().unwrap();
    assert_eq!(compiled.expr.kind, ExprKind::None);
    assert_eq!(compiled.expr.calculate(&f.arena), Tristate::Mod);
}

#[test]
fn refs_in_discovery_order_without_constants() {
    let f = Fixture::new(&[
        ("A", ValueType::Bool, "n"),
        ("B", ValueType::Bool, "n"),
        ("C", ValueType::Bool, "n"),
    ]);
    let compiled = compile("C && (A || C) && B && y", &f, &Location::internal())
        .unwrap()
        .unwrap();
    let names: Vec<&str> = compiled
        .refs
        .iter()
        .map(|&id| f.arena.get(id).name.as_str())
        .collect();
    assert_eq!(names, vec!["C", "A", "B"]);
}

#[test]
fn empty_input_compiles_to_nothing() {
    let f = Fixture::new(&[]);
    assert!(compile("", &f, &Location::internal()).unwrap().is_none());
    assert!(compile("   ", &f, &Location::internal()).unwrap().is_none());
}

#[test]
fn unknown_identifier_fails_with_location() {
    let f = Fixture::new(&[]);
    let err = compile("NOPE", &f, &Location::new("k", 7)).unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("k:7"), "{}", msg);
    assert!(msg.contains("NOPE"), "{}", msg);
}

#[test]
fn unbalanced_quotes_fail() {
    let f = Fixture::new(&[]);
    assert!(compile("\"half", &f, &Location::internal()).is_err());
    assert!(compile("'half", &f, &Location::internal()).is_err());
}

#[test]
fn literal_extraction_handles_escapes() {
    assert_eq!(
        collect_literals(r#"A = "a\"b" || B = 'c'"#),
        vec!["a\"b".to_string(), "c".to_string()]
    );
    assert!(collect_literals("no strings here").is_empty());
}

#[test]
fn missing_operands_evaluate_as_no() {
    use crate::expr::Expression;
    let arena = SymbolArena::new();
    let e = Expression {
        kind: ExprKind::And,
        left: None,
        right: None,
    };
    assert_eq!(e.calculate(&arena), Tristate::No);
    // not(n) over a null operand
    let e = Expression {
        kind: ExprKind::Not,
        left: None,
        right: None,
    };
    assert_eq!(e.calculate(&arena), Tristate::Yes);
}
