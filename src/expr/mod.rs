use crate::symbol::{SymbolArena, SymbolId, ValueType};
use crate::tri::Tristate;

pub mod compile;
#[cfg(test)]
mod tests;

pub use compile::{compile, CompiledExpr, SymbolLookup};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExprKind {
    N,
    M,
    Y,
    None,
    Not,
    And,
    Or,
    Equal,
    NotEqual,
}

/// Operand of an expression node: either a symbol handle or a nested
/// expression. Tagged variants, no inheritance.
#[derive(Debug, Clone)]
pub enum ExprData {
    Symbol(SymbolId),
    Expr(Box<Expression>),
}

#[derive(Debug, Clone)]
pub struct Expression {
    pub kind: ExprKind,
    pub left: Option<ExprData>,
    pub right: Option<ExprData>,
}

impl Expression {
    pub fn constant(kind: ExprKind) -> Expression {
        debug_assert!(matches!(kind, ExprKind::N | ExprKind::M | ExprKind::Y));
        Expression {
            kind,
            left: None,
            right: None,
        }
    }

    pub fn unary(kind: ExprKind, operand: ExprData) -> Expression {
        Expression {
            kind,
            left: Some(operand),
            right: None,
        }
    }

    pub fn binary(kind: ExprKind, left: ExprData, right: ExprData) -> Expression {
        Expression {
            kind,
            left: Some(left),
            right: Some(right),
        }
    }

    /// Tri-valued evaluation against the current symbol values. A missing
    /// operand evaluates to `n`.
    pub fn calculate(&self, arena: &SymbolArena) -> Tristate {
        match self.kind {
            ExprKind::N => Tristate::No,
            ExprKind::M => Tristate::Mod,
            ExprKind::Y => Tristate::Yes,
            ExprKind::None => data_tri(self.left.as_ref(), arena),
            ExprKind::Not => data_tri(self.left.as_ref(), arena).not(),
            ExprKind::And => {
                data_tri(self.left.as_ref(), arena).and(data_tri(self.right.as_ref(), arena))
            }
            ExprKind::Or => {
                data_tri(self.left.as_ref(), arena).or(data_tri(self.right.as_ref(), arena))
            }
            ExprKind::Equal | ExprKind::NotEqual => {
                // String-typed operands on both sides compare as exact
                // strings; everything else falls back to the lattice.
                let eq = match (
                    string_operand(self.left.as_ref(), arena),
                    string_operand(self.right.as_ref(), arena),
                ) {
                    (Some(a), Some(b)) => a == b,
                    _ => {
                        data_tri(self.left.as_ref(), arena)
                            == data_tri(self.right.as_ref(), arena)
                    }
                };
                let hit = eq == (self.kind == ExprKind::Equal);
                if hit {
                    Tristate::Yes
                } else {
                    Tristate::No
                }
            }
        }
    }
}

fn data_tri(data: Option<&ExprData>, arena: &SymbolArena) -> Tristate {
    match data {
        None => Tristate::No,
        Some(ExprData::Symbol(id)) => arena.tri_value(*id),
        Some(ExprData::Expr(expr)) => expr.calculate(arena),
    }
}

fn string_operand(data: Option<&ExprData>, arena: &SymbolArena) -> Option<String> {
    match data {
        Some(ExprData::Symbol(id)) if arena.get(*id).value_type == ValueType::String => {
            Some(arena.get(*id).value().unwrap_or_default())
        }
        _ => None,
    }
}
