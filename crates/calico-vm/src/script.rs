//! Compiled scripts: the immutable product of the block compiler.

use crate::engine::BlockFunction;
use crate::list::List;
use crate::value::Value;
use crate::vm::VirtualMachine;
use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonically increasing counter used to mint unique [`ScriptId`]s.
static NEXT_SCRIPT_ID: AtomicU64 = AtomicU64::new(1);

/// A stable identity for a compiled script.
///
/// Threads and hat registries compare scripts by id, so a rebound copy of a
/// script (see [`Script::rebound`]) is still "the same script" to the
/// scheduler even though it references different storage cells.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ScriptId(u64);

impl ScriptId {
    /// Allocate the next unique script id.
    pub fn next() -> Self {
        Self(NEXT_SCRIPT_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for ScriptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScriptId({})", self.0)
    }
}

/// The compiled form of one top-level block: bytecode plus the tables the
/// interpreter indexes into. Immutable once built; shared between every
/// thread started from it.
pub struct Script {
    id: ScriptId,
    bytecode: Rc<Vec<u32>>,
    constants: Rc<Vec<Value>>,
    variables: Vec<Rc<RefCell<Value>>>,
    lists: Vec<Rc<RefCell<List>>>,
    functions: Rc<Vec<BlockFunction>>,
    procedures: Rc<Vec<Rc<Vec<u32>>>>,
}

impl Script {
    /// Wrap a compiled bytecode stream. The stream's word 0 must be the
    /// padding word (the compiler emits it; the dispatch loop pre-increments
    /// over it).
    pub fn new(bytecode: Vec<u32>) -> Self {
        Self {
            id: ScriptId::next(),
            bytecode: Rc::new(bytecode),
            constants: Rc::new(Vec::new()),
            variables: Vec::new(),
            lists: Vec::new(),
            functions: Rc::new(Vec::new()),
            procedures: Rc::new(Vec::new()),
        }
    }

    pub fn id(&self) -> ScriptId {
        self.id
    }

    /// The script's own bytecode stream, shareable into procedure tables.
    pub fn bytecode(&self) -> Rc<Vec<u32>> {
        Rc::clone(&self.bytecode)
    }

    pub fn set_constants(&mut self, constants: Vec<Value>) {
        self.constants = Rc::new(constants);
    }

    pub fn set_variables(&mut self, variables: Vec<Rc<RefCell<Value>>>) {
        self.variables = variables;
    }

    pub fn set_lists(&mut self, lists: Vec<Rc<RefCell<List>>>) {
        self.lists = lists;
    }

    pub fn set_functions(&mut self, functions: Vec<BlockFunction>) {
        self.functions = Rc::new(functions);
    }

    pub fn set_procedures(&mut self, procedures: Vec<Rc<Vec<u32>>>) {
        self.procedures = Rc::new(procedures);
    }

    pub fn variables(&self) -> &[Rc<RefCell<Value>>] {
        &self.variables
    }

    pub fn lists(&self) -> &[Rc<RefCell<List>>] {
        &self.lists
    }

    /// Create a ready-to-run VM bound to this script's tables.
    pub fn start(&self) -> VirtualMachine {
        VirtualMachine::new(
            Rc::clone(&self.bytecode),
            Rc::clone(&self.constants),
            self.variables.clone(),
            self.lists.clone(),
            Rc::clone(&self.functions),
            Rc::clone(&self.procedures),
        )
    }

    /// Like [`Script::start`] but with a deterministic RNG seed, for
    /// reproducible runs.
    pub fn start_seeded(&self, seed: u64) -> VirtualMachine {
        let mut vm = self.start();
        vm.seed_rng(seed);
        vm
    }

    /// A copy of this script bound to different variable and list cells,
    /// keeping the same id and code. Used to run a shared script against a
    /// clone's independent storage.
    pub fn rebound(
        &self,
        variables: Vec<Rc<RefCell<Value>>>,
        lists: Vec<Rc<RefCell<List>>>,
    ) -> Script {
        Script {
            id: self.id,
            bytecode: Rc::clone(&self.bytecode),
            constants: Rc::clone(&self.constants),
            variables,
            lists,
            functions: Rc::clone(&self.functions),
            procedures: Rc::clone(&self.procedures),
        }
    }
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("id", &self.id)
            .field("words", &self.bytecode.len())
            .field("constants", &self.constants.len())
            .field("variables", &self.variables.len())
            .field("lists", &self.lists.len())
            .field("procedures", &self.procedures.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_ids_are_unique() {
        let a = Script::new(vec![0]);
        let b = Script::new(vec![0]);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn rebound_keeps_the_id() {
        let script = Script::new(vec![0]);
        let rebound = script.rebound(vec![Rc::new(RefCell::new(Value::default()))], vec![]);
        assert_eq!(script.id(), rebound.id());
        assert_eq!(rebound.variables().len(), 1);
    }
}
