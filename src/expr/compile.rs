use indexmap::IndexSet;

use crate::errors::KconfigError;
use crate::reader::Location;
use crate::symbol::SymbolId;

use super::{ExprData, ExprKind, Expression};

/// Name resolution provided by the graph builder. Quoted literals are
/// pre-allocated as constant string symbols before compilation, so the
/// compiler only ever looks them up.
pub trait SymbolLookup {
    fn resolve(&self, name: &str) -> Option<SymbolId>;
    fn resolve_literal(&self, text: &str) -> Option<SymbolId>;
}

/// Compilation result: the root expression plus every referenced
/// non-constant symbol in discovery order.
#[derive(Debug)]
pub struct CompiledExpr {
    pub expr: Expression,
    pub refs: IndexSet<SymbolId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Literal(String),
    Not,
    AndAnd,
    OrOr,
    Eq,
    Neq,
    LParen,
    RParen,
}

/// Extract every quoted string literal from `text`, in order. Used by the
/// graph builder to pre-allocate constant symbols. Tokenizer errors are
/// ignored here; the subsequent compile reports them.
pub fn collect_literals(text: &str) -> Vec<String> {
    match tokenize(text) {
        Ok(tokens) => tokens
            .into_iter()
            .filter_map(|t| match t {
                Token::Literal(s) => Some(s),
                _ => None,
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Compile raw expression text against the symbol table. Empty input is not
/// an error and yields no expression. The caller always receives a full
/// expression node, never a bare symbol reference.
pub fn compile(
    text: &str,
    table: &dyn SymbolLookup,
    location: &Location,
) -> Result<Option<CompiledExpr>, KconfigError> {
    let located = |message: String| KconfigError::Parse {
        file: location.file.clone(),
        line: location.line,
        message,
    };

    let tokens = tokenize(text).map_err(|e| located(e))?;
    if tokens.is_empty() {
        return Ok(None);
    }

    let mut parser = ExprParser {
        tokens: &tokens,
        pos: 0,
        table,
        refs: IndexSet::new(),
    };
    let data = parser.parse_or().map_err(|e| located(e))?;
    if parser.pos != tokens.len() {
        return Err(located(format!(
            "trailing tokens after expression in `{}`",
            text.trim()
        )));
    }

    let expr = match data {
        ExprData::Expr(e) => *e,
        sym @ ExprData::Symbol(_) => Expression::unary(ExprKind::None, sym),
    };
    Ok(Some(CompiledExpr {
        expr,
        refs: parser.refs,
    }))
}

fn tokenize(text: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();

    while let Some(&c) = chars.peek() {
        match c {
            ' ' | '\t' => {
                chars.next();
            }
            '"' | '\'' => {
                chars.next();
                tokens.push(Token::Literal(scan_literal(&mut chars, c)?));
            }
            '!' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Neq);
                } else {
                    tokens.push(Token::Not);
                }
            }
            '=' => {
                chars.next();
                tokens.push(Token::Eq);
            }
            '&' => {
                chars.next();
                if chars.next() != Some('&') {
                    return Err("single `&` is not a Kconfig operator".into());
                }
                tokens.push(Token::AndAnd);
            }
            '|' => {
                chars.next();
                if chars.next() != Some('|') {
                    return Err("single `|` is not a Kconfig operator".into());
                }
                tokens.push(Token::OrOr);
            }
            '(' => {
                chars.next();
                tokens.push(Token::LParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RParen);
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        ident.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Ident(ident));
            }
            other => return Err(format!("unrecognized character `{}` in expression", other)),
        }
    }

    Ok(tokens)
}

/// Scan the body of a quoted literal. Backslash escapes the matching
/// delimiter (and itself); anything else keeps the backslash.
fn scan_literal(
    chars: &mut std::iter::Peekable<std::str::Chars<'_>>,
    delim: char,
) -> Result<String, String> {
    let mut out = String::new();
    loop {
        match chars.next() {
            None => return Err(format!("unbalanced `{}` quote in expression", delim)),
            Some('\\') => match chars.next() {
                None => return Err(format!("unbalanced `{}` quote in expression", delim)),
                Some(c) if c == delim || c == '\\' => out.push(c),
                Some(c) => {
                    out.push('\\');
                    out.push(c);
                }
            },
            Some(c) if c == delim => return Ok(out),
            Some(c) => out.push(c),
        }
    }
}

struct ExprParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    table: &'a dyn SymbolLookup,
    refs: IndexSet<SymbolId>,
}

impl<'a> ExprParser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<&Token> {
        let t = self.tokens.get(self.pos);
        if t.is_some() {
            self.pos += 1;
        }
        t
    }

    fn parse_or(&mut self) -> Result<ExprData, String> {
        let mut lhs = self.parse_and()?;
        while self.peek() == Some(&Token::OrOr) {
            self.bump();
            let rhs = self.parse_and()?;
            lhs = ExprData::Expr(Box::new(Expression::binary(ExprKind::Or, lhs, rhs)));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<ExprData, String> {
        let mut lhs = self.parse_eq()?;
        while self.peek() == Some(&Token::AndAnd) {
            self.bump();
            let rhs = self.parse_eq()?;
            lhs = ExprData::Expr(Box::new(Expression::binary(ExprKind::And, lhs, rhs)));
        }
        Ok(lhs)
    }

    fn parse_eq(&mut self) -> Result<ExprData, String> {
        let lhs = self.parse_unary()?;
        let kind = match self.peek() {
            Some(Token::Eq) => ExprKind::Equal,
            Some(Token::Neq) => ExprKind::NotEqual,
            _ => return Ok(lhs),
        };
        self.bump();
        let rhs = self.parse_unary()?;
        Ok(ExprData::Expr(Box::new(Expression::binary(kind, lhs, rhs))))
    }

    fn parse_unary(&mut self) -> Result<ExprData, String> {
        if self.peek() == Some(&Token::Not) {
            self.bump();
            let operand = self.parse_unary()?;
            return Ok(ExprData::Expr(Box::new(Expression::unary(
                ExprKind::Not,
                operand,
            ))));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<ExprData, String> {
        match self.bump().cloned() {
            Some(Token::Ident(name)) => {
                // n/m/y resolve to the constant expressions, case-insensitive.
                match name.to_ascii_lowercase().as_str() {
                    "n" => return Ok(ExprData::Expr(Box::new(Expression::constant(ExprKind::N)))),
                    "m" => return Ok(ExprData::Expr(Box::new(Expression::constant(ExprKind::M)))),
                    "y" => return Ok(ExprData::Expr(Box::new(Expression::constant(ExprKind::Y)))),
                    _ => {}
                }
                let id = self
                    .table
                    .resolve(&name)
                    .ok_or_else(|| format!("unknown symbol `{}` in expression", name))?;
                self.refs.insert(id);
                Ok(ExprData::Symbol(id))
            }
            Some(Token::Literal(text)) => {
                let id = self
                    .table
                    .resolve_literal(&text)
                    .ok_or_else(|| format!("unresolved string literal \"{}\"", text))?;
                Ok(ExprData::Symbol(id))
            }
            Some(Token::LParen) => {
                let inner = self.parse_or()?;
                match self.bump() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("missing closing parenthesis".into()),
                }
            }
            Some(tok) => Err(format!("unexpected token {:?} in expression", tok)),
            None => Err("expression ended unexpectedly".into()),
        }
    }
}
