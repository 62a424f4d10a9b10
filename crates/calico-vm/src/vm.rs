//! Register-arena interpreter for compiled scripts.
//!
//! Each running script is a [`VirtualMachine`]: a program counter into a
//! shared bytecode stream, a fixed arena of reusable value registers, a loop
//! frame stack, a call-return stack for custom blocks, and a stack of
//! procedure argument frames. A `run()` call executes until the script ends,
//! faults, or reaches a yield point (a loop boundary of a non-atomic script,
//! or a host block that stopped the script); the program counter survives
//! across yields so the scheduler can resume the slice later.

use crate::bytecode::Op;
use crate::engine::{BlockFunction, EngineInterface};
use crate::list::{fix_index, List};
use crate::value::{SpecialValue, Value};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use thiserror::Error;

/// Capacity of the register arena.
pub const MAX_REG_COUNT: usize = 1024;

/// Faults that abort a script. Everything here indicates malformed bytecode
/// or a compiler bug, never a user-visible runtime condition; those become
/// special values or silent no-ops instead.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("invalid opcode {word} at word {at}")]
    InvalidOpcode { word: u32, at: usize },
    #[error("bytecode stream ends inside an instruction at word {0}")]
    TruncatedStream(usize),
    #[error("register arena overflow")]
    RegisterOverflow,
    #[error("register arena underflow")]
    RegisterUnderflow,
    #[error("loop end with no open loop at word {0}")]
    UnbalancedLoop(usize),
    #[error("no constant at index {0}")]
    UnknownConstant(usize),
    #[error("no variable at index {0}")]
    UnknownVariable(usize),
    #[error("no list at index {0}")]
    UnknownList(usize),
    #[error("no function at index {0}")]
    UnknownFunction(usize),
    #[error("no procedure at index {0}")]
    UnknownProcedure(usize),
    #[error("no argument at index {0} in the current frame")]
    UnknownArgument(usize),
}

/// Stop/end flags shared between a VM and the scheduler's thread record.
///
/// They live outside the VM so the engine can kill the *active* thread from
/// inside a host block (while the VM itself is mutably borrowed) without
/// touching VM state.
#[derive(Debug, Default)]
pub struct VmFlags {
    stop: Cell<bool>,
    at_end: Cell<bool>,
}

impl VmFlags {
    pub fn at_end(&self) -> bool {
        self.at_end.get()
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.get()
    }

    /// Ask the VM to stop at its next host-call boundary.
    pub fn request_stop(&self) {
        self.stop.set(true);
    }

    /// Terminate the script: stop at the next boundary and never run again.
    pub fn kill(&self) {
        self.stop.set(true);
        self.at_end.set(true);
    }
}

/// An open structured loop.
#[derive(Debug, Clone, Copy)]
enum LoopFrame {
    /// A counted loop; `index` of -1 means "forever".
    Repeat { start: usize, index: i64, max: i64 },
    /// A repeat-until loop; the predicate region begins right after `start`.
    Until { start: usize },
}

/// A pending return into a caller's bytecode stream.
struct CallFrame {
    code: Rc<Vec<u32>>,
    resume: usize,
}

/// What a LOOP_END decided to do.
enum LoopStep {
    Continue(usize),
    Yield(usize),
}

/// One running script instance.
pub struct VirtualMachine {
    code: Rc<Vec<u32>>,
    pc: usize,
    constants: Rc<Vec<Value>>,
    variables: Vec<Rc<RefCell<Value>>>,
    lists: Vec<Rc<RefCell<List>>>,
    functions: Rc<Vec<BlockFunction>>,
    procedures: Rc<Vec<Rc<Vec<u32>>>>,
    regs: Vec<Value>,
    reg_count: usize,
    loops: Vec<LoopFrame>,
    call_tree: Vec<CallFrame>,
    arg_tree: Vec<Vec<Value>>,
    /// Frame read by READ_ARG (the arguments of the procedure being run).
    current_args: Option<usize>,
    /// Frame filled by ADD_ARG (the arguments of the call being set up).
    next_args: Option<usize>,
    atomic: bool,
    flags: Rc<VmFlags>,
    rng: StdRng,
    /// Text emitted by PRINT, in order. Deterministic for a fixed RNG seed
    /// and clock, which is what the reproducibility property is stated over.
    pub output: Vec<String>,
}

impl VirtualMachine {
    pub(crate) fn new(
        code: Rc<Vec<u32>>,
        constants: Rc<Vec<Value>>,
        variables: Vec<Rc<RefCell<Value>>>,
        lists: Vec<Rc<RefCell<List>>>,
        functions: Rc<Vec<BlockFunction>>,
        procedures: Rc<Vec<Rc<Vec<u32>>>>,
    ) -> Self {
        Self {
            code,
            pc: 0,
            constants,
            variables,
            lists,
            functions,
            procedures,
            regs: vec![Value::default(); MAX_REG_COUNT],
            reg_count: 0,
            loops: Vec::new(),
            call_tree: Vec::new(),
            arg_tree: Vec::new(),
            current_args: None,
            next_args: None,
            atomic: true,
            flags: Rc::new(VmFlags::default()),
            rng: StdRng::from_entropy(),
            output: Vec::new(),
        }
    }

    /// Shared stop/end flags, for the scheduler's thread record.
    pub fn flags(&self) -> Rc<VmFlags> {
        Rc::clone(&self.flags)
    }

    pub fn at_end(&self) -> bool {
        self.flags.at_end()
    }

    /// Reseed the RNG behind RANDOM and random list indexing.
    pub fn seed_rng(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// Run one cooperative slice: from the current program counter until the
    /// script ends, faults, or yields. The atomic flag is reset on entry;
    /// scripts opt out of it again with BREAK_ATOMIC each time around.
    pub fn run(&mut self, engine: &mut dyn EngineInterface) {
        if self.flags.at_end() {
            return;
        }
        self.atomic = true;
        match self.interpret(engine, self.pc) {
            Ok(pc) => self.pc = pc,
            Err(err) => {
                tracing::warn!(error = %err, "script aborted on bytecode fault");
                self.flags.at_end.set(true);
            }
        }
    }

    // -- host block API ---------------------------------------------------

    /// Read input `index` of a block that consumes `count` registers.
    ///
    /// # Panics
    /// Panics when the registers are not actually on the stack; that is a
    /// host-block bug, not a script error.
    pub fn read_input(&self, index: usize, count: usize) -> &Value {
        assert!(index < count && count <= self.reg_count, "bad block input read");
        &self.regs[self.reg_count - count + index]
    }

    /// Push a result register.
    pub fn add_return(&mut self, value: Value) {
        assert!(self.reg_count < MAX_REG_COUNT, "register arena overflow in block");
        self.regs[self.reg_count] = value;
        self.reg_count += 1;
    }

    /// Overwrite the register `depth` slots below the top (1 = top).
    pub fn replace_return(&mut self, value: Value, depth: usize) {
        assert!(depth >= 1 && depth <= self.reg_count, "bad block return depth");
        self.regs[self.reg_count - depth] = value;
    }

    /// Ask this script to stop at the end of the current host call.
    pub fn request_stop(&self) {
        self.flags.request_stop();
    }

    // -- dispatch ---------------------------------------------------------

    /// Execute from `start` until HALT of the outermost activation, a yield,
    /// or a fault. Returns the program counter to resume from. Re-entered
    /// recursively to evaluate until-loop predicate regions, which end with
    /// BEGIN_UNTIL_LOOP.
    fn interpret(
        &mut self,
        engine: &mut dyn EngineInterface,
        start: usize,
    ) -> Result<usize, VmError> {
        let mut pc = start;
        loop {
            pc += 1;
            let op = self.op_at(pc)?;
            match op {
                Op::Halt => {
                    if let Some(frame) = self.call_tree.pop() {
                        self.code = frame.code;
                        pc = frame.resume;
                        self.arg_tree.pop();
                        self.current_args = self.arg_tree.len().checked_sub(1);
                    } else {
                        if self.reg_count > 0 {
                            tracing::warn!(
                                leaked = self.reg_count,
                                "script finished with registers still in use"
                            );
                        }
                        self.flags.at_end.set(true);
                        return Ok(pc);
                    }
                }

                Op::Const => {
                    pc += 1;
                    let index = self.word(pc)? as usize;
                    let value = self
                        .constants
                        .get(index)
                        .cloned()
                        .ok_or(VmError::UnknownConstant(index))?;
                    self.push_value(value)?;
                }
                Op::Null => self.push_value(Value::default())?,

                // -- structured control flow --
                Op::If => {
                    let taken = self.last()?.to_bool();
                    let skip_to = if taken {
                        None
                    } else {
                        Some(self.scan_to_else_or_endif(pc)?)
                    };
                    self.free(1)?;
                    if let Some(marker) = skip_to {
                        pc = marker;
                    }
                }
                Op::Else => pc = self.scan_to_endif(pc)?,
                Op::EndIf => {}

                Op::ForeverLoop => self.loops.push(LoopFrame::Repeat {
                    start: pc,
                    index: -1,
                    max: 0,
                }),
                Op::RepeatLoop => {
                    let count = self.last()?.to_integer();
                    self.free(1)?;
                    if count <= 0 {
                        pc = self.scan_to_loop_end(pc)?;
                    } else {
                        self.loops.push(LoopFrame::Repeat {
                            start: pc,
                            index: 0,
                            max: count,
                        });
                    }
                }
                Op::UntilLoop => {
                    let loop_start = pc;
                    let predicate_end = self.interpret(engine, pc)?;
                    let exit = self.last()?.to_bool();
                    self.free(1)?;
                    if exit {
                        pc = self.scan_to_loop_end(predicate_end)?;
                    } else {
                        self.loops.push(LoopFrame::Until { start: loop_start });
                        pc = predicate_end;
                    }
                }
                Op::BeginUntilLoop => return Ok(pc),
                Op::LoopEnd => match self.close_loop(engine, pc)? {
                    LoopStep::Continue(next) => pc = next,
                    LoopStep::Yield(resume) => return Ok(resume),
                },

                Op::Print => {
                    let text = self.pop_value()?.to_string();
                    self.output.push(text);
                }

                // -- arithmetic --
                Op::Add => self.arith(Value::add)?,
                Op::Subtract => self.arith(Value::subtract)?,
                Op::Multiply => self.arith(Value::multiply)?,
                Op::Divide => self.arith(Value::divide)?,
                Op::Mod => self.arith(Value::modulo)?,
                Op::Random => {
                    self.require(2)?;
                    let a = self.regs[self.reg_count - 2].to_number();
                    let b = self.regs[self.reg_count - 1].to_number();
                    let picked = self.random_between(a, b);
                    self.replace(picked, 2)?;
                    self.free(1)?;
                }

                // -- unary math; specials follow the propagation table --
                Op::Round => self.math_op(|v| match v {
                    Value::Special(_) => None,
                    v => Some(Value::Integer(v.to_number().round() as i64)),
                })?,
                Op::Abs => self.math_op(|v| {
                    if v.is_negative_infinity() {
                        Some(Value::Special(SpecialValue::Infinity))
                    } else if v.is_infinity() || v.is_nan() {
                        None
                    } else {
                        Some(Value::from(v.to_number().abs()))
                    }
                })?,
                Op::Floor => self.math_op(|v| match v {
                    Value::Special(_) => None,
                    v => Some(Value::from(v.to_number().floor())),
                })?,
                Op::Ceil => self.math_op(|v| match v {
                    Value::Special(_) => None,
                    v => Some(Value::from(v.to_number().ceil())),
                })?,
                Op::Sqrt => self.math_op(|v| {
                    if v.is_infinity() {
                        None
                    } else {
                        let n = v.to_number();
                        if n < 0.0 {
                            Some(Value::Special(SpecialValue::NaN))
                        } else {
                            Some(Value::from(n.sqrt()))
                        }
                    }
                })?,
                Op::Sin => self.math_op(|v| {
                    if v.is_infinity() || v.is_negative_infinity() {
                        Some(Value::Special(SpecialValue::NaN))
                    } else {
                        Some(Value::from(v.to_number().to_radians().sin()))
                    }
                })?,
                Op::Cos => self.math_op(|v| {
                    if v.is_infinity() || v.is_negative_infinity() {
                        Some(Value::Special(SpecialValue::NaN))
                    } else {
                        Some(Value::from(v.to_number().to_radians().cos()))
                    }
                })?,
                Op::Tan => self.math_op(|v| {
                    if v.is_infinity() || v.is_negative_infinity() {
                        return Some(Value::Special(SpecialValue::NaN));
                    }
                    match v.to_integer() % 360 {
                        90 => Some(Value::Special(SpecialValue::Infinity)),
                        270 => Some(Value::Special(SpecialValue::NegativeInfinity)),
                        _ => Some(Value::from(v.to_number().to_radians().tan())),
                    }
                })?,
                Op::Asin => self.math_op(|v| Some(inverse_trig(v, f64::asin)))?,
                Op::Acos => self.math_op(|v| Some(inverse_trig(v, f64::acos)))?,
                // The same |x| <= 1 domain applies to atan here, unlike the
                // mathematical function; kept for Scratch compatibility.
                Op::Atan => self.math_op(|v| Some(inverse_trig(v, f64::atan)))?,

                // -- comparison and boolean --
                Op::GreaterThan => self.compare(|a, b| a > b)?,
                Op::LessThan => self.compare(|a, b| a < b)?,
                Op::Equals => self.compare(|a, b| a == b)?,
                Op::And => self.compare(|a, b| a.to_bool() && b.to_bool())?,
                Op::Or => self.compare(|a, b| a.to_bool() || b.to_bool())?,
                Op::Not => {
                    let negated = !self.last()?.to_bool();
                    self.replace(Value::Bool(negated), 1)?;
                }

                // -- variables --
                Op::SetVar => {
                    pc += 1;
                    let cell = self.variable(self.word(pc)? as usize)?;
                    *cell.borrow_mut() = self.pop_value()?;
                }
                Op::ChangeVar => {
                    pc += 1;
                    let cell = self.variable(self.word(pc)? as usize)?;
                    let amount = self.pop_value()?;
                    cell.borrow_mut().add(&amount);
                }
                Op::ReadVar => {
                    pc += 1;
                    let value = self.variable(self.word(pc)? as usize)?.borrow().clone();
                    self.push_value(value)?;
                }

                // -- lists --
                Op::ReadList => {
                    pc += 1;
                    let text = self.list(self.word(pc)? as usize)?.borrow().to_string();
                    self.push_value(Value::String(text))?;
                }
                Op::ListAppend => {
                    pc += 1;
                    let list = self.list(self.word(pc)? as usize)?;
                    let value = self.pop_value()?;
                    list.borrow_mut().push(value);
                }
                Op::ListDel => {
                    pc += 1;
                    let list = self.list(self.word(pc)? as usize)?;
                    let index_value = self.pop_value()?;
                    let len = list.borrow().len();
                    let index = if index_value.is_string() {
                        match index_value.to_string().as_str() {
                            "last" => len,
                            "all" => {
                                list.borrow_mut().clear();
                                0
                            }
                            "random" => self.random_list_index(len),
                            _ => 0,
                        }
                    } else {
                        fix_index(index_value.to_integer(), len)
                    };
                    if index != 0 {
                        list.borrow_mut().remove_at(index - 1);
                    }
                }
                Op::ListDelAll => {
                    pc += 1;
                    self.list(self.word(pc)? as usize)?.borrow_mut().clear();
                }
                Op::ListInsert => {
                    pc += 1;
                    let list = self.list(self.word(pc)? as usize)?;
                    let index_value = self.pop_value()?;
                    let item = self.pop_value()?;
                    let len = list.borrow().len();
                    if index_value.is_string() && index_value.to_string() == "last" {
                        list.borrow_mut().push(item);
                    } else {
                        let index = if index_value.is_string() {
                            match index_value.to_string().as_str() {
                                // Inserting into an empty list is valid, so
                                // "random" resolves to 1 rather than no-op.
                                "random" => {
                                    if len == 0 {
                                        1
                                    } else {
                                        self.random_list_index(len)
                                    }
                                }
                                _ => 0,
                            }
                        } else {
                            fix_index(index_value.to_integer(), len)
                        };
                        if index != 0 || len == 0 {
                            let mut list = list.borrow_mut();
                            if list.is_empty() {
                                list.push(item);
                            } else {
                                list.insert(index - 1, item);
                            }
                        }
                    }
                }
                Op::ListReplace => {
                    pc += 1;
                    let list = self.list(self.word(pc)? as usize)?;
                    let item = self.pop_value()?;
                    let index_value = self.pop_value()?;
                    let len = list.borrow().len();
                    let index = if index_value.is_string() {
                        match index_value.to_string().as_str() {
                            "last" => len,
                            "random" => self.random_list_index(len),
                            _ => 0,
                        }
                    } else {
                        fix_index(index_value.to_integer(), len)
                    };
                    if index != 0 {
                        list.borrow_mut().set(index - 1, item);
                    }
                }
                Op::ListGetItem => {
                    pc += 1;
                    let list = self.list(self.word(pc)? as usize)?;
                    let index_value = self.last()?.clone();
                    let len = list.borrow().len();
                    let index = if index_value.is_string() {
                        match index_value.to_string().as_str() {
                            "last" => len,
                            "random" => self.random_list_index(len),
                            _ => 0,
                        }
                    } else {
                        fix_index(index_value.to_integer(), len)
                    };
                    let item = if index == 0 {
                        Value::default()
                    } else {
                        list.borrow().get(index - 1).cloned().unwrap_or_default()
                    };
                    self.replace(item, 1)?;
                }
                Op::ListIndexOf => {
                    pc += 1;
                    let list = self.list(self.word(pc)? as usize)?;
                    let needle = self.last()?.clone();
                    let position = list
                        .borrow()
                        .index_of(&needle)
                        .map(|i| i as i64 + 1)
                        .unwrap_or(0);
                    self.replace(Value::Integer(position), 1)?;
                }
                Op::ListLength => {
                    pc += 1;
                    let len = self.list(self.word(pc)? as usize)?.borrow().len();
                    self.push_value(Value::Integer(len as i64))?;
                }
                Op::ListContains => {
                    pc += 1;
                    let list = self.list(self.word(pc)? as usize)?;
                    let needle = self.last()?.clone();
                    let found = list.borrow().contains(&needle);
                    self.replace(Value::Bool(found), 1)?;
                }

                // -- strings (code-unit indexed over the UTF-16 view) --
                Op::StrConcat => {
                    let suffix = self.pop_value()?;
                    let joined = format!("{}{}", self.last()?, suffix);
                    self.replace(Value::String(joined), 1)?;
                }
                Op::StrAt => {
                    let index = self.pop_value()?.to_integer();
                    let units = self.last()?.to_utf16();
                    let letter = if index >= 1 && index as usize <= units.len() {
                        let i = index as usize;
                        Value::String(String::from_utf16_lossy(&units[i - 1..i]))
                    } else {
                        Value::default()
                    };
                    self.replace(letter, 1)?;
                }
                Op::StrLength => {
                    let len = self.last()?.to_utf16().len();
                    self.replace(Value::Integer(len as i64), 1)?;
                }
                Op::StrContains => {
                    let needle = self.pop_value()?.to_string().to_lowercase();
                    let haystack = self.last()?.to_string().to_lowercase();
                    self.replace(Value::Bool(haystack.contains(&needle)), 1)?;
                }

                // -- host blocks --
                Op::Exec => {
                    pc += 1;
                    let index = self.word(pc)? as usize;
                    let function = self
                        .functions
                        .get(index)
                        .copied()
                        .ok_or(VmError::UnknownFunction(index))?;
                    let consumed = function(self, engine);
                    self.free(consumed)?;
                    if self.flags.stop.get() {
                        self.flags.stop.set(false);
                        if self.reg_count > 0 {
                            tracing::warn!(
                                leaked = self.reg_count,
                                "script stopped with registers still in use"
                            );
                        }
                        self.call_tree.clear();
                        self.arg_tree.clear();
                        self.current_args = None;
                        self.next_args = None;
                        if !self.atomic {
                            engine.break_frame();
                        }
                        return Ok(pc);
                    }
                }

                // -- custom blocks --
                Op::InitProcedure => {
                    self.arg_tree.push(Vec::new());
                    if self.arg_tree.len() >= 2 {
                        self.current_args = Some(self.arg_tree.len() - 2);
                    }
                    self.next_args = Some(self.arg_tree.len() - 1);
                }
                Op::AddArg => {
                    let value = self.pop_value()?;
                    if let Some(frame) = self.next_args.and_then(|i| self.arg_tree.get_mut(i)) {
                        frame.push(value);
                    }
                }
                Op::CallProcedure => {
                    pc += 1;
                    let index = self.word(pc)? as usize;
                    let procedure = self
                        .procedures
                        .get(index)
                        .cloned()
                        .ok_or(VmError::UnknownProcedure(index))?;
                    self.call_tree.push(CallFrame {
                        code: Rc::clone(&self.code),
                        resume: pc,
                    });
                    self.current_args = self.next_args.take();
                    self.code = procedure;
                    pc = 0;
                }
                Op::ReadArg => {
                    pc += 1;
                    let index = self.word(pc)? as usize;
                    let value = self
                        .current_args
                        .and_then(|frame| self.arg_tree.get(frame))
                        .and_then(|args| args.get(index))
                        .cloned()
                        .ok_or(VmError::UnknownArgument(index))?;
                    self.push_value(value)?;
                }

                Op::BreakAtomic => self.atomic = false,
            }
        }
    }

    /// Handle LOOP_END for the innermost frame: jump back, pop, or yield.
    fn close_loop(
        &mut self,
        engine: &mut dyn EngineInterface,
        pc: usize,
    ) -> Result<LoopStep, VmError> {
        let frame = self
            .loops
            .last()
            .copied()
            .ok_or(VmError::UnbalancedLoop(pc))?;
        match frame {
            LoopFrame::Repeat { start, index, max } => {
                let next = if index == -1 {
                    start
                } else if index + 1 < max {
                    *self.loops.last_mut().expect("frame just read") = LoopFrame::Repeat {
                        start,
                        index: index + 1,
                        max,
                    };
                    start
                } else {
                    self.loops.pop();
                    pc
                };
                if !self.atomic {
                    engine.break_frame();
                    return Ok(LoopStep::Yield(next));
                }
                Ok(LoopStep::Continue(next))
            }
            LoopFrame::Until { start } => {
                if !self.atomic {
                    engine.break_frame();
                    // Resume one word early so LOOP_END re-evaluates the
                    // predicate on the next slice.
                    return Ok(LoopStep::Yield(pc - 1));
                }
                let predicate_end = self.interpret(engine, start)?;
                let exit = self.last()?.to_bool();
                self.free(1)?;
                if exit {
                    self.loops.pop();
                    Ok(LoopStep::Continue(pc))
                } else {
                    Ok(LoopStep::Continue(predicate_end))
                }
            }
        }
    }

    // -- register arena ---------------------------------------------------

    fn require(&self, count: usize) -> Result<(), VmError> {
        if self.reg_count < count {
            Err(VmError::RegisterUnderflow)
        } else {
            Ok(())
        }
    }

    fn push_value(&mut self, value: Value) -> Result<(), VmError> {
        if self.reg_count == MAX_REG_COUNT {
            return Err(VmError::RegisterOverflow);
        }
        self.regs[self.reg_count] = value;
        self.reg_count += 1;
        Ok(())
    }

    fn pop_value(&mut self) -> Result<Value, VmError> {
        self.require(1)?;
        self.reg_count -= 1;
        Ok(std::mem::take(&mut self.regs[self.reg_count]))
    }

    fn last(&self) -> Result<&Value, VmError> {
        self.require(1)?;
        Ok(&self.regs[self.reg_count - 1])
    }

    fn replace(&mut self, value: Value, depth: usize) -> Result<(), VmError> {
        self.require(depth)?;
        self.regs[self.reg_count - depth] = value;
        Ok(())
    }

    /// Discard the top `count` registers. The slots are reused in place, not
    /// cleared.
    fn free(&mut self, count: usize) -> Result<(), VmError> {
        self.require(count)?;
        self.reg_count -= count;
        Ok(())
    }

    /// In-place binary arithmetic: fold the top register into the one below.
    fn arith(&mut self, op: fn(&mut Value, &Value)) -> Result<(), VmError> {
        self.require(2)?;
        let rhs = std::mem::take(&mut self.regs[self.reg_count - 1]);
        op(&mut self.regs[self.reg_count - 2], &rhs);
        self.reg_count -= 1;
        Ok(())
    }

    fn compare(&mut self, op: fn(&Value, &Value) -> bool) -> Result<(), VmError> {
        self.require(2)?;
        let result = op(
            &self.regs[self.reg_count - 2],
            &self.regs[self.reg_count - 1],
        );
        self.regs[self.reg_count - 2] = Value::Bool(result);
        self.reg_count -= 1;
        Ok(())
    }

    /// Unary math on the top register; `None` passes the value through.
    fn math_op(&mut self, op: impl FnOnce(&Value) -> Option<Value>) -> Result<(), VmError> {
        self.require(1)?;
        if let Some(result) = op(&self.regs[self.reg_count - 1]) {
            self.regs[self.reg_count - 1] = result;
        }
        Ok(())
    }

    // -- code access and skip scans ---------------------------------------

    fn word(&self, pc: usize) -> Result<u32, VmError> {
        self.code.get(pc).copied().ok_or(VmError::TruncatedStream(pc))
    }

    fn op_at(&self, pc: usize) -> Result<Op, VmError> {
        let word = self.word(pc)?;
        Op::from_word(word).ok_or(VmError::InvalidOpcode { word, at: pc })
    }

    /// Advance past the instruction at `pc` (opcode plus immediates).
    fn step_over(&self, pc: usize) -> Result<usize, VmError> {
        Ok(pc + 1 + self.op_at(pc)?.arg_count())
    }

    /// From an IF, find its matching ELSE or ENDIF.
    fn scan_to_else_or_endif(&self, mut pc: usize) -> Result<usize, VmError> {
        let mut depth = 0usize;
        loop {
            pc = self.step_over(pc)?;
            match self.op_at(pc)? {
                Op::If => depth += 1,
                Op::Else if depth == 0 => return Ok(pc),
                Op::EndIf => {
                    if depth == 0 {
                        return Ok(pc);
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
    }

    /// From an ELSE, find its matching ENDIF.
    fn scan_to_endif(&self, mut pc: usize) -> Result<usize, VmError> {
        let mut depth = 0usize;
        loop {
            pc = self.step_over(pc)?;
            match self.op_at(pc)? {
                Op::If => depth += 1,
                Op::EndIf => {
                    if depth == 0 {
                        return Ok(pc);
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
    }

    /// Find the LOOP_END matching the loop construct at or before `pc`.
    fn scan_to_loop_end(&self, mut pc: usize) -> Result<usize, VmError> {
        let mut depth = 0usize;
        loop {
            pc = self.step_over(pc)?;
            match self.op_at(pc)? {
                Op::ForeverLoop | Op::RepeatLoop | Op::UntilLoop => depth += 1,
                Op::LoopEnd => {
                    if depth == 0 {
                        return Ok(pc);
                    }
                    depth -= 1;
                }
                _ => {}
            }
        }
    }

    // -- table access ------------------------------------------------------

    fn variable(&self, index: usize) -> Result<Rc<RefCell<Value>>, VmError> {
        self.variables
            .get(index)
            .cloned()
            .ok_or(VmError::UnknownVariable(index))
    }

    fn list(&self, index: usize) -> Result<Rc<RefCell<List>>, VmError> {
        self.lists
            .get(index)
            .cloned()
            .ok_or(VmError::UnknownList(index))
    }

    // -- randomness -------------------------------------------------------

    /// Uniform pick between two bounds: integer and inclusive when both
    /// bounds are integer-valued, a double otherwise.
    fn random_between(&mut self, a: f64, b: f64) -> Value {
        if !a.is_finite() || !b.is_finite() {
            return Value::Special(SpecialValue::NaN);
        }
        let (low, high) = if a <= b { (a, b) } else { (b, a) };
        if low == low.trunc() && high == high.trunc() {
            Value::Integer(self.rng.gen_range(low as i64..=high as i64))
        } else {
            Value::from(self.rng.gen_range(low..=high))
        }
    }

    /// A random 1-based index, or 0 for an empty list.
    fn random_list_index(&mut self, len: usize) -> usize {
        if len == 0 {
            0
        } else {
            self.rng.gen_range(1..=len)
        }
    }
}

/// Shared shape of asin/acos/atan: degrees out, |x| > 1 is out of domain.
fn inverse_trig(v: &Value, f: fn(f64) -> f64) -> Value {
    let n = v.to_number();
    if !(-1.0..=1.0).contains(&n) {
        Value::Special(SpecialValue::NaN)
    } else {
        Value::from(f(n).to_degrees())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::Script;

    /// Engine stub: counts yields, answers queries with defaults.
    #[derive(Default)]
    struct TestEngine {
        frame_breaks: usize,
    }

    impl EngineInterface for TestEngine {
        fn break_frame(&mut self) {
            self.frame_breaks += 1;
        }
        fn request_redraw(&mut self) {}
        fn broadcast(&mut self, _index: usize) {}
        fn broadcast_running(&self, _index: usize) -> bool {
            false
        }
        fn stop_all(&mut self) {}
        fn stop_current_script(&mut self) {}
        fn init_clone(&mut self, _name: &str) {}
        fn delete_this_clone(&mut self) {}
        fn key_pressed(&self, _name: &str) -> bool {
            false
        }
        fn mouse_x(&self) -> f64 {
            0.0
        }
        fn mouse_y(&self) -> f64 {
            0.0
        }
        fn mouse_pressed(&self) -> bool {
            false
        }
        fn stage_width(&self) -> u32 {
            480
        }
        fn stage_height(&self) -> u32 {
            360
        }
        fn timer(&self) -> f64 {
            0.0
        }
        fn reset_timer(&mut self) {}
    }

    /// Prefix a program with the padding word the dispatch loop skips.
    fn assemble(words: &[u32]) -> Vec<u32> {
        let mut code = vec![0];
        code.extend_from_slice(words);
        code
    }

    fn run_script(script: &Script) -> VirtualMachine {
        let mut vm = script.start();
        let mut engine = TestEngine::default();
        vm.run(&mut engine);
        vm
    }

    fn var_cell(value: f64) -> Rc<RefCell<Value>> {
        Rc::new(RefCell::new(Value::from(value)))
    }

    const HALT: u32 = Op::Halt as u32;
    const CONST: u32 = Op::Const as u32;
    const PRINT: u32 = Op::Print as u32;

    #[test]
    fn adds_two_constants() {
        // CONST 3; CONST 4; ADD; PRINT; HALT. The print captures the sum.
        let mut script = Script::new(assemble(&[
            CONST, 0, CONST, 1, Op::Add as u32, PRINT, HALT,
        ]));
        script.set_constants(vec![Value::from(3.0), Value::from(4.0)]);
        let vm = run_script(&script);
        assert!(vm.at_end());
        assert_eq!(vm.output, vec!["7"]);
        assert_eq!(vm.reg_count, 0);
    }

    #[test]
    fn repeat_loop_counts() {
        // repeat (5) { change v by 1 }
        let mut script = Script::new(assemble(&[
            CONST,
            0,
            Op::RepeatLoop as u32,
            CONST,
            1,
            Op::ChangeVar as u32,
            0,
            Op::LoopEnd as u32,
            HALT,
        ]));
        script.set_constants(vec![Value::from(5.0), Value::from(1.0)]);
        let v = var_cell(0.0);
        script.set_variables(vec![Rc::clone(&v)]);
        let vm = run_script(&script);
        assert!(vm.at_end());
        assert_eq!(v.borrow().to_number(), 5.0);
    }

    #[test]
    fn repeat_loop_with_non_positive_count_skips_body() {
        let mut script = Script::new(assemble(&[
            CONST,
            0,
            Op::RepeatLoop as u32,
            CONST,
            1,
            Op::ChangeVar as u32,
            0,
            Op::LoopEnd as u32,
            HALT,
        ]));
        script.set_constants(vec![Value::from(0.0), Value::from(1.0)]);
        let v = var_cell(0.0);
        script.set_variables(vec![Rc::clone(&v)]);
        let vm = run_script(&script);
        assert!(vm.at_end());
        assert_eq!(v.borrow().to_number(), 0.0);
    }

    #[test]
    fn until_loop_runs_body_while_predicate_false() {
        // repeat until (v > 2) { change v by 1 }
        let mut script = Script::new(assemble(&[
            Op::UntilLoop as u32,
            Op::ReadVar as u32,
            0,
            CONST,
            0,
            Op::GreaterThan as u32,
            Op::BeginUntilLoop as u32,
            CONST,
            1,
            Op::ChangeVar as u32,
            0,
            Op::LoopEnd as u32,
            HALT,
        ]));
        script.set_constants(vec![Value::from(2.0), Value::from(1.0)]);
        let v = var_cell(0.0);
        script.set_variables(vec![Rc::clone(&v)]);
        let vm = run_script(&script);
        assert!(vm.at_end());
        assert_eq!(v.borrow().to_number(), 3.0);
    }

    #[test]
    fn if_else_takes_the_right_branch() {
        // if (v > 0) { print "pos" } else { print "neg" }
        let words = [
            Op::ReadVar as u32,
            0,
            CONST,
            0,
            Op::GreaterThan as u32,
            Op::If as u32,
            CONST,
            1,
            PRINT,
            Op::Else as u32,
            CONST,
            2,
            PRINT,
            Op::EndIf as u32,
            HALT,
        ];
        let constants = vec![Value::from(0.0), Value::from("pos"), Value::from("neg")];

        let mut script = Script::new(assemble(&words));
        script.set_constants(constants.clone());
        script.set_variables(vec![var_cell(5.0)]);
        assert_eq!(run_script(&script).output, vec!["pos"]);

        let mut script = Script::new(assemble(&words));
        script.set_constants(constants);
        script.set_variables(vec![var_cell(-5.0)]);
        assert_eq!(run_script(&script).output, vec!["neg"]);
    }

    #[test]
    fn nested_if_skips_past_inner_markers() {
        // if (false) { if (true) { print "a" } else { print "b" } }
        // print "after"
        let mut script = Script::new(assemble(&[
            CONST,
            0,
            Op::If as u32,
            CONST,
            1,
            Op::If as u32,
            CONST,
            2,
            PRINT,
            Op::Else as u32,
            CONST,
            3,
            PRINT,
            Op::EndIf as u32,
            Op::EndIf as u32,
            CONST,
            4,
            PRINT,
            HALT,
        ]));
        script.set_constants(vec![
            Value::from(false),
            Value::from(true),
            Value::from("a"),
            Value::from("b"),
            Value::from("after"),
        ]);
        assert_eq!(run_script(&script).output, vec!["after"]);
    }

    #[test]
    fn tan_is_special_at_quarter_turns() {
        for (angle, expect) in [
            (90.0, Value::Special(SpecialValue::Infinity)),
            (270.0, Value::Special(SpecialValue::NegativeInfinity)),
        ] {
            let mut script = Script::new(assemble(&[CONST, 0, Op::Tan as u32, PRINT, HALT]));
            script.set_constants(vec![Value::from(angle)]);
            assert_eq!(run_script(&script).output, vec![expect.to_string()]);
        }

        let mut script = Script::new(assemble(&[CONST, 0, Op::Tan as u32, PRINT, HALT]));
        script.set_constants(vec![Value::from(0.0)]);
        assert_eq!(run_script(&script).output, vec!["0"]);
    }

    #[test]
    fn atan_domain_is_clamped() {
        // atan is defined on all reals mathematically, but the runtime keeps
        // the |x| <= 1 domain for compatibility.
        let mut script = Script::new(assemble(&[CONST, 0, Op::Atan as u32, PRINT, HALT]));
        script.set_constants(vec![Value::from(2.0)]);
        assert_eq!(run_script(&script).output, vec!["NaN"]);

        let mut script = Script::new(assemble(&[CONST, 0, Op::Atan as u32, PRINT, HALT]));
        script.set_constants(vec![Value::from(1.0)]);
        let output = run_script(&script).output;
        let degrees: f64 = output[0].parse().expect("numeric atan result");
        assert!((degrees - 45.0).abs() < 1e-9);
    }

    #[test]
    fn sqrt_of_negative_is_nan() {
        let mut script = Script::new(assemble(&[CONST, 0, Op::Sqrt as u32, PRINT, HALT]));
        script.set_constants(vec![Value::from(-4.0)]);
        assert_eq!(run_script(&script).output, vec!["NaN"]);
    }

    #[test]
    fn list_append_delete_and_literal_indices() {
        // append "a"; append "b"; delete 1; print item "last"
        let mut script = Script::new(assemble(&[
            CONST,
            0,
            Op::ListAppend as u32,
            0,
            CONST,
            1,
            Op::ListAppend as u32,
            0,
            CONST,
            2,
            Op::ListDel as u32,
            0,
            CONST,
            3,
            Op::ListGetItem as u32,
            0,
            PRINT,
            HALT,
        ]));
        script.set_constants(vec![
            Value::from("a"),
            Value::from("b"),
            Value::from(1.0),
            Value::from("last"),
        ]);
        let list = Rc::new(RefCell::new(List::new()));
        script.set_lists(vec![Rc::clone(&list)]);
        let vm = run_script(&script);
        assert_eq!(list.borrow().len(), 1);
        assert_eq!(list.borrow().get(0), Some(&Value::from("b")));
        assert_eq!(vm.output, vec!["b"]);
    }

    #[test]
    fn list_get_item_out_of_range_is_empty() {
        let mut script = Script::new(assemble(&[
            CONST,
            0,
            Op::ListGetItem as u32,
            0,
            Op::StrLength as u32,
            PRINT,
            HALT,
        ]));
        script.set_constants(vec![Value::from(7.0)]);
        script.set_lists(vec![Rc::new(RefCell::new(List::new()))]);
        assert_eq!(run_script(&script).output, vec!["0"]);
    }

    #[test]
    fn list_index_of_is_one_based_with_zero_for_missing() {
        let list: List = [Value::from("x"), Value::from("y")].into_iter().collect();
        let list = Rc::new(RefCell::new(list));
        let mut script = Script::new(assemble(&[
            CONST,
            0,
            Op::ListIndexOf as u32,
            0,
            PRINT,
            CONST,
            1,
            Op::ListIndexOf as u32,
            0,
            PRINT,
            HALT,
        ]));
        script.set_constants(vec![Value::from("y"), Value::from("z")]);
        script.set_lists(vec![list]);
        assert_eq!(run_script(&script).output, vec!["2", "0"]);
    }

    #[test]
    fn procedure_call_passes_arguments() {
        // Caller: INIT_PROCEDURE; CONST 7; ADD_ARG; CALL_PROCEDURE 0; HALT
        // Procedure: READ_ARG 0; SET_VAR 0; HALT
        let procedure = Rc::new(assemble(&[
            Op::ReadArg as u32,
            0,
            Op::SetVar as u32,
            0,
            HALT,
        ]));
        let mut script = Script::new(assemble(&[
            Op::InitProcedure as u32,
            CONST,
            0,
            Op::AddArg as u32,
            Op::CallProcedure as u32,
            0,
            HALT,
        ]));
        script.set_constants(vec![Value::from(7.0)]);
        let v = var_cell(0.0);
        script.set_variables(vec![Rc::clone(&v)]);
        script.set_procedures(vec![procedure]);
        let vm = run_script(&script);
        assert!(vm.at_end());
        assert_eq!(v.borrow().to_number(), 7.0);
        assert_eq!(vm.call_tree.len(), 0);
        assert_eq!(vm.arg_tree.len(), 0);
    }

    #[test]
    fn nested_procedure_calls_read_the_right_frames() {
        // outer(x) calls inner(x + 1); inner stores its argument.
        let inner = Rc::new(assemble(&[
            Op::ReadArg as u32,
            0,
            Op::SetVar as u32,
            0,
            HALT,
        ]));
        let outer = Rc::new(assemble(&[
            Op::InitProcedure as u32,
            Op::ReadArg as u32,
            0,
            CONST,
            1,
            Op::Add as u32,
            Op::AddArg as u32,
            Op::CallProcedure as u32,
            1,
            HALT,
        ]));
        let mut script = Script::new(assemble(&[
            Op::InitProcedure as u32,
            CONST,
            0,
            Op::AddArg as u32,
            Op::CallProcedure as u32,
            0,
            HALT,
        ]));
        script.set_constants(vec![Value::from(10.0), Value::from(1.0)]);
        let v = var_cell(0.0);
        script.set_variables(vec![Rc::clone(&v)]);
        script.set_procedures(vec![outer, inner]);
        let vm = run_script(&script);
        assert!(vm.at_end());
        assert_eq!(v.borrow().to_number(), 11.0);
    }

    #[test]
    fn forever_loop_yields_once_per_iteration_when_non_atomic() {
        // forever { BREAK_ATOMIC; change v by 1 }
        let mut script = Script::new(assemble(&[
            Op::ForeverLoop as u32,
            Op::BreakAtomic as u32,
            CONST,
            0,
            Op::ChangeVar as u32,
            0,
            Op::LoopEnd as u32,
            HALT,
        ]));
        script.set_constants(vec![Value::from(1.0)]);
        let v = var_cell(0.0);
        script.set_variables(vec![Rc::clone(&v)]);

        let mut vm = script.start();
        let mut engine = TestEngine::default();
        for step in 1..=10 {
            vm.run(&mut engine);
            assert!(!vm.at_end());
            assert_eq!(v.borrow().to_number(), step as f64);
        }
        assert_eq!(engine.frame_breaks, 10);
    }

    #[test]
    fn exec_calls_host_block_and_frees_inputs() {
        fn double_it(vm: &mut VirtualMachine, _engine: &mut dyn EngineInterface) -> usize {
            let doubled = vm.read_input(0, 1).to_number() * 2.0;
            vm.replace_return(Value::from(doubled), 1);
            0
        }
        let mut script = Script::new(assemble(&[CONST, 0, Op::Exec as u32, 0, PRINT, HALT]));
        script.set_constants(vec![Value::from(21.0)]);
        script.set_functions(vec![double_it]);
        assert_eq!(run_script(&script).output, vec!["42"]);
    }

    #[test]
    fn exec_stop_unwinds_the_call_tree() {
        fn stop_me(vm: &mut VirtualMachine, _engine: &mut dyn EngineInterface) -> usize {
            vm.request_stop();
            0
        }
        // Procedure body stops the script before SET_VAR runs.
        let procedure = Rc::new(assemble(&[
            Op::Exec as u32,
            0,
            CONST,
            0,
            Op::SetVar as u32,
            0,
            HALT,
        ]));
        let mut script = Script::new(assemble(&[
            Op::InitProcedure as u32,
            Op::CallProcedure as u32,
            0,
            HALT,
        ]));
        script.set_constants(vec![Value::from(9.0)]);
        let v = var_cell(0.0);
        script.set_variables(vec![Rc::clone(&v)]);
        script.set_functions(vec![stop_me]);
        script.set_procedures(vec![procedure]);

        let mut vm = script.start();
        let mut engine = TestEngine::default();
        vm.run(&mut engine);
        assert_eq!(v.borrow().to_number(), 0.0);
        assert_eq!(vm.call_tree.len(), 0);
        assert_eq!(vm.arg_tree.len(), 0);
        assert!(!vm.flags.stop_requested());
    }

    #[test]
    fn killed_vm_never_runs_again() {
        let mut script = Script::new(assemble(&[
            Op::ForeverLoop as u32,
            Op::BreakAtomic as u32,
            Op::LoopEnd as u32,
            HALT,
        ]));
        script.set_constants(vec![]);
        let mut vm = script.start();
        let mut engine = TestEngine::default();
        vm.run(&mut engine);
        vm.flags().kill();
        let pc_before = vm.pc;
        vm.run(&mut engine);
        assert_eq!(vm.pc, pc_before);
        assert!(vm.at_end());
    }

    #[test]
    fn string_ops_use_utf16_code_units() {
        // letter 2 of "héllo", length of "𝄞x", "Hello" contains "ELL"
        let mut script = Script::new(assemble(&[
            CONST,
            0,
            CONST,
            1,
            Op::StrAt as u32,
            PRINT,
            CONST,
            2,
            Op::StrLength as u32,
            PRINT,
            CONST,
            3,
            CONST,
            4,
            Op::StrContains as u32,
            PRINT,
            HALT,
        ]));
        script.set_constants(vec![
            Value::from("héllo"),
            Value::from(2.0),
            Value::from("𝄞x"),
            Value::from("Hello"),
            Value::from("ELL"),
        ]);
        assert_eq!(run_script(&script).output, vec!["é", "3", "true"]);
    }

    #[test]
    fn str_at_out_of_range_is_empty() {
        let mut script = Script::new(assemble(&[
            CONST,
            0,
            CONST,
            1,
            Op::StrAt as u32,
            Op::StrLength as u32,
            PRINT,
            HALT,
        ]));
        script.set_constants(vec![Value::from("ab"), Value::from(9.0)]);
        assert_eq!(run_script(&script).output, vec!["0"]);
    }

    #[test]
    fn random_is_deterministic_for_a_fixed_seed() {
        let mut script = Script::new(assemble(&[
            CONST,
            0,
            CONST,
            1,
            Op::Random as u32,
            PRINT,
            HALT,
        ]));
        script.set_constants(vec![Value::from(1.0), Value::from(10.0)]);

        let mut engine = TestEngine::default();
        let mut first = script.start_seeded(7);
        first.run(&mut engine);
        let mut second = script.start_seeded(7);
        second.run(&mut engine);
        assert_eq!(first.output, second.output);

        let pick: i64 = first.output[0].parse().expect("integer pick");
        assert!((1..=10).contains(&pick));
    }

    #[test]
    fn invalid_opcode_aborts_the_script() {
        let script = Script::new(assemble(&[999, HALT]));
        let vm = run_script(&script);
        assert!(vm.at_end());
    }

    #[test]
    fn register_balance_holds_across_mixed_programs() {
        let mut script = Script::new(assemble(&[
            CONST,
            0,
            CONST,
            1,
            Op::Add as u32,
            Op::SetVar as u32,
            0,
            CONST,
            0,
            Op::Not as u32,
            PRINT,
            Op::Null as u32,
            PRINT,
            HALT,
        ]));
        script.set_constants(vec![Value::from(1.0), Value::from(2.0)]);
        script.set_variables(vec![var_cell(0.0)]);
        let vm = run_script(&script);
        assert!(vm.at_end());
        assert_eq!(vm.reg_count, 0);
    }
}
