//! Lexical scope resolution for load/store emission.
//!
//! Names resolve against a stack of function scopes over a module scope.
//! Parameters load as LOAD_PARAM, function-local assignments as
//! LOAD_FAST/STORE_FAST, declared or module-level globals as
//! LOAD_GLOBAL/STORE_GLOBAL, and anything else at module level as
//! LOAD_NAME/STORE_NAME. Inside a function an unresolved name is a global
//! read, matching how the supported languages actually bind.

use crate::compiler::opcode::OpCode;
use rustc_hash::FxHashSet;

#[derive(Debug, Default)]
pub struct FunctionScope {
    pub params: FxHashSet<String>,
    /// Names assigned somewhere in the function body (pre-scanned).
    pub locals: FxHashSet<String>,
    /// Names declared `nonlocal`; they read through the closure.
    pub nonlocals: FxHashSet<String>,
}

#[derive(Debug, Default)]
pub struct ScopeTracker {
    /// Names bound at module level (assignments and imports), in source
    /// order as compilation reaches them.
    module_names: FxHashSet<String>,
    /// Names declared `global` anywhere in the file (first pass).
    global_declared: FxHashSet<String>,
    /// Active comprehension loop variables.
    comprehension_vars: FxHashSet<String>,
    stack: Vec<FunctionScope>,
}

impl ScopeTracker {
    pub fn new(global_declared: FxHashSet<String>) -> Self {
        Self { global_declared, ..Self::default() }
    }

    pub fn push_function(&mut self, scope: FunctionScope) {
        self.stack.push(scope);
    }

    pub fn pop_function(&mut self) {
        self.stack.pop();
    }

    pub fn in_function(&self) -> bool {
        !self.stack.is_empty()
    }

    pub fn bind_module_name(&mut self, name: &str) {
        if !self.in_function() {
            self.module_names.insert(name.to_string());
        }
    }

    pub fn add_comprehension_var(&mut self, name: &str) {
        self.comprehension_vars.insert(name.to_string());
    }

    pub fn clear_comprehension_vars(&mut self) {
        self.comprehension_vars.clear();
    }

    pub fn load_op(&self, name: &str) -> OpCode {
        if self.comprehension_vars.contains(name) {
            return OpCode::LoadFast;
        }
        if let Some(scope) = self.stack.last() {
            if scope.nonlocals.contains(name) {
                return OpCode::LoadClosure;
            }
            if scope.params.contains(name) {
                return OpCode::LoadParam;
            }
            if scope.locals.contains(name) && !self.global_declared.contains(name) {
                return OpCode::LoadFast;
            }
            // Free variables in a function body read the global scope.
            return OpCode::LoadGlobal;
        }
        if self.global_declared.contains(name) || self.module_names.contains(name) {
            OpCode::LoadGlobal
        } else {
            OpCode::LoadName
        }
    }

    pub fn store_op(&self, name: &str) -> OpCode {
        if self.comprehension_vars.contains(name) {
            return OpCode::StoreFast;
        }
        if let Some(scope) = self.stack.last() {
            if self.global_declared.contains(name) {
                return OpCode::StoreGlobal;
            }
            if scope.nonlocals.contains(name)
                || scope.params.contains(name)
                || scope.locals.contains(name)
            {
                return OpCode::StoreFast;
            }
            // Undeclared assignment targets bind globally (JS semantics;
            // unreachable for the dynamic family, whose pre-scan collects
            // every assignment target).
            return OpCode::StoreGlobal;
        }
        OpCode::StoreName
    }

    pub fn delete_op(&self, _name: &str) -> OpCode {
        OpCode::DeleteName
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope_with(params: &[&str], locals: &[&str]) -> FunctionScope {
        FunctionScope {
            params: params.iter().map(|s| s.to_string()).collect(),
            locals: locals.iter().map(|s| s.to_string()).collect(),
            nonlocals: FxHashSet::default(),
        }
    }

    #[test]
    fn module_level_stores_are_store_name() {
        let tracker = ScopeTracker::new(FxHashSet::default());
        assert_eq!(tracker.store_op("x"), OpCode::StoreName);
    }

    #[test]
    fn module_bound_names_load_as_globals() {
        let mut tracker = ScopeTracker::new(FxHashSet::default());
        assert_eq!(tracker.load_op("os"), OpCode::LoadName);
        tracker.bind_module_name("os");
        assert_eq!(tracker.load_op("os"), OpCode::LoadGlobal);
    }

    #[test]
    fn params_and_locals_resolve_fast() {
        let mut tracker = ScopeTracker::new(FxHashSet::default());
        tracker.push_function(scope_with(&["arg"], &["tmp"]));
        assert_eq!(tracker.load_op("arg"), OpCode::LoadParam);
        assert_eq!(tracker.load_op("tmp"), OpCode::LoadFast);
        assert_eq!(tracker.store_op("tmp"), OpCode::StoreFast);
    }

    #[test]
    fn free_names_in_functions_read_globals() {
        let mut tracker = ScopeTracker::new(FxHashSet::default());
        tracker.push_function(scope_with(&[], &[]));
        assert_eq!(tracker.load_op("subprocess"), OpCode::LoadGlobal);
    }

    #[test]
    fn global_declaration_overrides_local_assignment() {
        let mut declared = FxHashSet::default();
        declared.insert("counter".to_string());
        let mut tracker = ScopeTracker::new(declared);
        tracker.push_function(scope_with(&[], &["counter"]));
        assert_eq!(tracker.load_op("counter"), OpCode::LoadGlobal);
        assert_eq!(tracker.store_op("counter"), OpCode::StoreGlobal);
    }

    #[test]
    fn comprehension_vars_win_over_everything() {
        let mut tracker = ScopeTracker::new(FxHashSet::default());
        tracker.push_function(scope_with(&["item"], &[]));
        tracker.add_comprehension_var("item");
        assert_eq!(tracker.load_op("item"), OpCode::LoadFast);
        tracker.clear_comprehension_vars();
        assert_eq!(tracker.load_op("item"), OpCode::LoadParam);
    }

    #[test]
    fn scope_pops_restore_module_resolution() {
        let mut tracker = ScopeTracker::new(FxHashSet::default());
        tracker.push_function(scope_with(&[], &[]));
        tracker.pop_function();
        assert_eq!(tracker.store_op("x"), OpCode::StoreName);
    }
}
