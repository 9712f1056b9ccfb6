use std::sync::RwLock;

use fxhash::FxHashMap;
use indexmap::IndexSet;

use crate::expr::Expression;
use crate::reader::Location;
use crate::tri::Tristate;

/// Handle into the [`SymbolArena`]. Symbols reference each other through
/// these small indices instead of owning pointers, so the depends-on /
/// be-selected back edges never form ownership cycles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SymbolId(u32);

impl SymbolId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    MainMenu,
    Menu,
    MenuConfig,
    Config,
    Choice,
    Comment,
    If,
    Source,
}

impl EntryKind {
    /// Kinds that recurse during flattening. `Config` and `Comment` are
    /// leaves.
    pub fn is_structural(self) -> bool {
        !matches!(self, EntryKind::Config | EntryKind::Comment)
    }

    /// Kinds that carry a user-visible value.
    pub fn is_config_like(self) -> bool {
        matches!(
            self,
            EntryKind::Config | EntryKind::MenuConfig | EntryKind::Choice
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    Invalid,
    Bool,
    Tristate,
    String,
    Int,
    Hex,
}

impl ValueType {
    pub fn is_boolish(self) -> bool {
        matches!(self, ValueType::Bool | ValueType::Tristate)
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, ValueType::Int | ValueType::Hex)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttributeKind {
    Type,
    Prompt,
    Default,
    DependsOn,
    Select,
    Imply,
    VisibleIf,
    Range,
    Help,
    Option,
    Optional,
}

/// One parsed attribute line. `value` holds the raw payload (prompt text,
/// default expression text, select target, `MIN MAX` pair, help text).
/// `value_expr` and `cond_expr` are filled in by the graph builder.
#[derive(Debug)]
pub struct Attribute {
    pub kind: AttributeKind,
    pub value_type: ValueType,
    pub value: String,
    pub value_expr: Option<Expression>,
    pub cond: Option<String>,
    pub cond_expr: Option<Expression>,
    pub reverse_dep: Option<SymbolId>,
}

impl Attribute {
    pub fn new(kind: AttributeKind) -> Attribute {
        Attribute {
            kind,
            value_type: ValueType::Invalid,
            value: String::new(),
            value_expr: None,
            cond: None,
            cond_expr: None,
            reverse_dep: None,
        }
    }

    pub fn is(&self, kind: AttributeKind) -> bool {
        self.kind == kind
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Value,
    Prompt,
    Default,
    IsEnable,
    IsVisible,
    IsFiltered,
    IsSelected,
    IsExpanded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChangeEvent {
    pub symbol: SymbolId,
    pub kind: ChangeKind,
}

/// Mutable evaluation state, one lock per symbol. Within a propagation
/// layer every symbol writes only its own state, so the locks are
/// uncontended there; cross-symbol reads take short read guards.
#[derive(Debug, Clone, Default)]
pub struct SymbolState {
    /// Effective value: the base clamped by reverse dependencies.
    pub value: Option<String>,
    /// Last user-assigned or defaulted value, before clamping. The clamp
    /// re-derives `value` from this on every recompute, so releasing a
    /// `select` lets the symbol fall back down.
    pub base_value: Option<String>,
    pub prompt: Option<String>,
    pub default: Option<String>,
    pub is_enable: bool,
    pub is_visible: bool,
    pub is_filtered: bool,
    pub is_selected: bool,
    pub is_expanded: bool,
    pub value_error: Option<String>,
}

#[derive(Debug)]
pub struct Symbol {
    pub id: SymbolId,
    pub kind: EntryKind,
    pub name: String,
    pub value_type: ValueType,
    pub is_const: bool,
    pub location: Location,
    pub attributes: Vec<Attribute>,
    pub children: Vec<SymbolId>,
    pub parent: Option<SymbolId>,
    /// Raw condition text inherited from enclosing `if` blocks.
    pub nest_depends_on: Option<String>,
    pub depends_on_expr: Option<Expression>,
    /// Transitive closure of the symbols this one depends on, in discovery
    /// order. Finalized by the graph builder.
    pub depends_on_list: IndexSet<SymbolId>,
    /// Per-layer recomputation frontiers, ascending layer order.
    pub controls_list: Vec<Vec<SymbolId>>,
    pub be_selected_list: Vec<SymbolId>,
    pub be_implied_list: Vec<SymbolId>,
    pub depends_on_level: Option<usize>,
    pub state: RwLock<SymbolState>,
}

impl Symbol {
    fn new(id: SymbolId, kind: EntryKind, name: String, location: Location) -> Symbol {
        Symbol {
            id,
            kind,
            name,
            value_type: ValueType::Invalid,
            is_const: false,
            location,
            attributes: Vec::new(),
            children: Vec::new(),
            parent: None,
            nest_depends_on: None,
            depends_on_expr: None,
            depends_on_list: IndexSet::new(),
            controls_list: Vec::new(),
            be_selected_list: Vec::new(),
            be_implied_list: Vec::new(),
            depends_on_level: None,
            state: RwLock::new(SymbolState::default()),
        }
    }

    pub fn help(&self) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.is(AttributeKind::Help))
            .map(|a| a.value.as_str())
    }

    pub fn has_attribute(&self, kind: AttributeKind) -> bool {
        self.attributes.iter().any(|a| a.is(kind))
    }

    pub fn value(&self) -> Option<String> {
        self.state.read().unwrap().value.clone()
    }

    pub fn tri_value(&self) -> Tristate {
        self.state
            .read()
            .unwrap()
            .value
            .as_deref()
            .map(Tristate::from_value)
            .unwrap_or(Tristate::No)
    }

    pub fn is_enable(&self) -> bool {
        self.state.read().unwrap().is_enable
    }
}

#[derive(Debug, Default)]
pub struct SymbolArena {
    symbols: Vec<Symbol>,
    by_name: FxHashMap<String, SymbolId>,
    pub root: Option<SymbolId>,
}

impl SymbolArena {
    pub fn new() -> SymbolArena {
        SymbolArena::default()
    }

    pub fn alloc(&mut self, kind: EntryKind, name: impl Into<String>, location: Location) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        let name = name.into();
        if !name.is_empty() && kind.is_config_like() {
            // First definition wins; later references resolve to it.
            self.by_name.entry(name.clone()).or_insert(id);
        }
        self.symbols.push(Symbol::new(id, kind, name, location));
        id
    }

    /// Anonymous constant symbol wrapping a quoted string literal found in
    /// an expression.
    pub fn alloc_const_string(&mut self, text: &str) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        let mut sym = Symbol::new(
            id,
            EntryKind::Config,
            String::new(),
            Location::internal(),
        );
        sym.is_const = true;
        sym.value_type = ValueType::String;
        sym.state.get_mut().unwrap().value = Some(text.to_string());
        self.symbols.push(sym);
        id
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.by_name.get(name).copied()
    }

    pub fn get(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.index()]
    }

    pub fn get_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.index()]
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn ids(&self) -> impl Iterator<Item = SymbolId> + '_ {
        (0..self.symbols.len() as u32).map(SymbolId)
    }

    pub fn symbols(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.iter()
    }

    pub fn attach(&mut self, parent: SymbolId, child: SymbolId) {
        self.get_mut(parent).children.push(child);
        self.get_mut(child).parent = Some(parent);
    }

    pub fn detach(&mut self, parent: SymbolId, child: SymbolId) {
        let children = &mut self.get_mut(parent).children;
        if let Some(pos) = children.iter().position(|&c| c == child) {
            children.remove(pos);
        }
        self.get_mut(child).parent = None;
    }

    /// Nearest `Choice` ancestor, looking through interposed `if` blocks
    /// only. This is the "structural parent is a Choice" test used by the
    /// evaluator.
    pub fn choice_parent(&self, id: SymbolId) -> Option<SymbolId> {
        let mut cur = self.get(id).parent;
        while let Some(pid) = cur {
            match self.get(pid).kind {
                EntryKind::If => cur = self.get(pid).parent,
                EntryKind::Choice => return Some(pid),
                _ => return None,
            }
        }
        None
    }

    /// Config children of a choice, descending through nested `if` blocks,
    /// in document order.
    pub fn choice_config_children(&self, choice: SymbolId) -> Vec<SymbolId> {
        let mut out = Vec::new();
        let mut stack: Vec<SymbolId> = self.get(choice).children.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            match self.get(id).kind {
                EntryKind::Config => out.push(id),
                EntryKind::If => {
                    stack.extend(self.get(id).children.iter().rev().copied());
                }
                _ => {}
            }
        }
        out
    }

    /// Preorder document-order walk from `root`.
    pub fn document_order(&self, root: SymbolId) -> Vec<SymbolId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.get(id).children.iter().rev().copied());
        }
        out
    }

    pub fn tri_value(&self, id: SymbolId) -> Tristate {
        self.get(id).tri_value()
    }
}
