use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use once_cell::sync::Lazy;
use regex::Regex;

use crate::dotconfig;
use crate::env::{EnvProvider, ProcessEnv};
use crate::errors::KconfigResult;
use crate::eval;
use crate::graph;
use crate::parser::{self, ParserContext};
use crate::symbol::{ChangeEvent, ChangeKind, EntryKind, SymbolArena, SymbolId, ValueType};

/// `parse`, `write_dot_config` and `filter_select` are serialized against
/// each other so no tree enumeration sees a load in flight.
static STA_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

type Observer = Box<dyn Fn(&ChangeEvent) + Send + Sync>;

/// The facade consumed by UIs and tooling: loads a Kconfig tree, exposes
/// per-symbol state, applies value edits with full propagation, and reads
/// and writes `.config`.
pub struct Kconfig {
    arena: RwLock<SymbolArena>,
    layers: RwLock<Vec<Vec<SymbolId>>>,
    env: Arc<dyn EnvProvider>,
    observers: Mutex<Vec<Observer>>,
}

impl Default for Kconfig {
    fn default() -> Self {
        Kconfig::new()
    }
}

impl Kconfig {
    pub fn new() -> Kconfig {
        Kconfig::with_env(Arc::new(ProcessEnv))
    }

    /// Hermetic construction: all `$VAR` interpolation and `option env=`
    /// traffic goes through the given provider.
    pub fn with_env(env: Arc<dyn EnvProvider>) -> Kconfig {
        Kconfig {
            arena: RwLock::new(SymbolArena::new()),
            layers: RwLock::new(Vec::new()),
            env,
            observers: Mutex::new(Vec::new()),
        }
    }

    pub fn observe(&self, observer: impl Fn(&ChangeEvent) + Send + Sync + 'static) {
        self.observers.lock().unwrap().push(Box::new(observer));
    }

    fn notify(&self, events: &[ChangeEvent]) {
        let observers = self.observers.lock().unwrap();
        for event in events {
            for observer in observers.iter() {
                observer(event);
            }
        }
    }

    pub fn parse(&self, path: impl AsRef<Path>) -> KconfigResult<()> {
        self.parse_with_tab_width(path, 4)
    }

    /// Full load pipeline: parse, compile, layer, precompute controls, then
    /// the initial default pass. `source` paths resolve relative to the
    /// Kconfig file's directory.
    pub fn parse_with_tab_width(
        &self,
        path: impl AsRef<Path>,
        tab_width: usize,
    ) -> KconfigResult<()> {
        let _sta = STA_LOCK.lock().unwrap();
        let path = path.as_ref();
        let cwd = path.parent().unwrap_or_else(|| Path::new("."));
        let ctx = ParserContext::new(cwd, tab_width, self.env.clone());

        let mut arena = SymbolArena::new();
        parser::parse_file(&mut arena, &ctx, path)?;
        let layers = graph::build(&mut arena)?;
        let events = eval::evaluate_all(&arena, &layers, true)?;

        *self.arena.write().unwrap() = arena;
        *self.layers.write().unwrap() = layers;
        self.notify(&events);
        Ok(())
    }

    /// Load from in-memory text; `source` paths resolve against `cwd`.
    pub fn parse_str(
        &self,
        name: &str,
        text: &str,
        cwd: impl AsRef<Path>,
        tab_width: usize,
    ) -> KconfigResult<()> {
        let _sta = STA_LOCK.lock().unwrap();
        let ctx = ParserContext::new(cwd.as_ref(), tab_width, self.env.clone());

        let mut arena = SymbolArena::new();
        parser::parse_str(&mut arena, &ctx, name, text)?;
        let layers = graph::build(&mut arena)?;
        let events = eval::evaluate_all(&arena, &layers, true)?;

        *self.arena.write().unwrap() = arena;
        *self.layers.write().unwrap() = layers;
        self.notify(&events);
        Ok(())
    }

    /// Overlay a previous `.config` onto the loaded tree.
    pub fn read_dot_config(&self, path: impl AsRef<Path>) -> KconfigResult<()> {
        let arena = self.arena.read().unwrap();
        let layers = self.layers.read().unwrap();
        let events = dotconfig::read_dot_config(&arena, &layers, path.as_ref())?;
        drop(layers);
        drop(arena);
        self.notify(&events);
        Ok(())
    }

    pub fn write_dot_config(&self, path: impl AsRef<Path>) -> KconfigResult<()> {
        let _sta = STA_LOCK.lock().unwrap();
        let arena = self.arena.read().unwrap();
        dotconfig::write_dot_config(&arena, path.as_ref())
    }

    pub fn root(&self) -> Option<SymbolId> {
        self.arena.read().unwrap().root
    }

    pub fn lookup(&self, name: &str) -> Option<SymbolId> {
        self.arena.read().unwrap().lookup(name)
    }

    pub fn children(&self, id: SymbolId) -> Vec<SymbolId> {
        self.arena.read().unwrap().get(id).children.clone()
    }

    pub fn name(&self, id: SymbolId) -> String {
        self.arena.read().unwrap().get(id).name.clone()
    }

    pub fn kind(&self, id: SymbolId) -> EntryKind {
        self.arena.read().unwrap().get(id).kind
    }

    pub fn value_type(&self, id: SymbolId) -> ValueType {
        self.arena.read().unwrap().get(id).value_type
    }

    pub fn value(&self, id: SymbolId) -> Option<String> {
        self.arena.read().unwrap().get(id).value()
    }

    pub fn prompt(&self, id: SymbolId) -> Option<String> {
        let arena = self.arena.read().unwrap();
        let state = arena.get(id).state.read().unwrap();
        state.prompt.clone()
    }

    pub fn default_value(&self, id: SymbolId) -> Option<String> {
        let arena = self.arena.read().unwrap();
        let state = arena.get(id).state.read().unwrap();
        state.default.clone()
    }

    pub fn help(&self, id: SymbolId) -> Option<String> {
        self.arena.read().unwrap().get(id).help().map(str::to_string)
    }

    pub fn value_error(&self, id: SymbolId) -> Option<String> {
        let arena = self.arena.read().unwrap();
        let state = arena.get(id).state.read().unwrap();
        state.value_error.clone()
    }

    pub fn is_enable(&self, id: SymbolId) -> bool {
        self.arena.read().unwrap().get(id).is_enable()
    }

    pub fn is_visible(&self, id: SymbolId) -> bool {
        let arena = self.arena.read().unwrap();
        let state = arena.get(id).state.read().unwrap();
        state.is_visible
    }

    pub fn is_filtered(&self, id: SymbolId) -> bool {
        let arena = self.arena.read().unwrap();
        let state = arena.get(id).state.read().unwrap();
        state.is_filtered
    }

    pub fn is_selected(&self, id: SymbolId) -> bool {
        let arena = self.arena.read().unwrap();
        let state = arena.get(id).state.read().unwrap();
        state.is_selected
    }

    pub fn is_expanded(&self, id: SymbolId) -> bool {
        let arena = self.arena.read().unwrap();
        let state = arena.get(id).state.read().unwrap();
        state.is_expanded
    }

    /// UI expansion state; tracked here so tree views can bind to it.
    pub fn set_expanded(&self, id: SymbolId, expanded: bool) {
        let changed = {
            let arena = self.arena.read().unwrap();
            let mut state = arena.get(id).state.write().unwrap();
            let changed = state.is_expanded != expanded;
            state.is_expanded = expanded;
            changed
        };
        if changed {
            self.notify(&[ChangeEvent {
                symbol: id,
                kind: ChangeKind::IsExpanded,
            }]);
        }
    }

    /// Set a symbol's value and cascade through its controls list.
    pub fn set_value(&self, id: SymbolId, value: Option<&str>) -> KconfigResult<()> {
        let events = {
            let arena = self.arena.read().unwrap();
            eval::set_value(&arena, id, value)?
        };
        self.notify(&events);
        Ok(())
    }

    /// Mark every symbol filtered, then clear the flag on each match and
    /// its ancestor chain. Returns the matches.
    pub fn filter_select(&self, pattern: &str, is_regex: bool) -> KconfigResult<Vec<SymbolId>> {
        let _sta = STA_LOCK.lock().unwrap();
        let regex = if is_regex {
            Regex::new(pattern)?
        } else {
            Regex::new(&regex::escape(pattern))?
        };

        let mut events = Vec::new();
        let mut matches = Vec::new();
        {
            let arena = self.arena.read().unwrap();
            for id in arena.ids() {
                if arena.get(id).is_const {
                    continue;
                }
                set_filtered(&arena, id, true, &mut events);
            }
            for id in arena.ids() {
                let sym = arena.get(id);
                if sym.is_const {
                    continue;
                }
                let prompt = sym.state.read().unwrap().prompt.clone();
                let hit = regex.is_match(&sym.name)
                    || prompt.map(|p| regex.is_match(&p)).unwrap_or(false);
                if !hit {
                    continue;
                }
                matches.push(id);
                set_filtered(&arena, id, false, &mut events);
                let mut cursor = sym.parent;
                while let Some(ancestor) = cursor {
                    set_filtered(&arena, ancestor, false, &mut events);
                    cursor = arena.get(ancestor).parent;
                }
            }
        }
        self.notify(&events);
        Ok(matches)
    }

    pub fn clear_filter(&self) {
        let mut events = Vec::new();
        {
            let arena = self.arena.read().unwrap();
            for id in arena.ids() {
                set_filtered(&arena, id, false, &mut events);
            }
        }
        self.notify(&events);
    }
}

fn set_filtered(arena: &SymbolArena, id: SymbolId, filtered: bool, events: &mut Vec<ChangeEvent>) {
    let mut state = arena.get(id).state.write().unwrap();
    if state.is_filtered != filtered {
        state.is_filtered = filtered;
        events.push(ChangeEvent {
            symbol: id,
            kind: ChangeKind::IsFiltered,
        });
    }
}
