//! The bytecode interpreter: a stack machine with a type-argument side
//! stack, exception handlers and dynamic dispatch through class vtables.
//!
//! All stack slots are one word. Integer values narrower than a word are
//! stored zero-extended; pops truncate to the operand width. f32 values
//! occupy the low half of their slot.

use bytecode::{read_vbn_unchecked, Opcode};
use object::{BlockHeader, StrBlock, Tagged};

use crate::builtins;
use crate::error::VmError;
use crate::id::{builtin_index, is_builtin_id, DefnKey, NO_DEFN};
use crate::native;
use crate::ptrmap;
use crate::stack::{
    Stack, CALLER_FP_OFFSET, CALLER_FUNCTION_OFFSET, CALLER_PC_OFFSET, FRAME_CONTROL_SIZE,
    PARAMETERS_OFFSET, STACK_SIZE,
};
use crate::table;
use crate::ty::Type;
use crate::VM;

/// Saved pc value marking the bottom frame.
const PC_DONE: u64 = u64::MAX;

/// Keep this much headroom below the deepest frame.
const STACK_RED_ZONE: usize = 4096;

struct Handler {
    fp_offset: usize,
    sp_offset: usize,
    catch_pc: usize,
    function: DefnKey,
}

pub(crate) struct Interpreter {
    vm: *mut VM,
    stack: Stack,
    function: Option<DefnKey>,
    pc: usize,
    handlers: Vec<Handler>,
    /// Types pushed by TYS/TYD awaiting the next generic call, allocation
    /// or cast.
    type_args: Vec<Type>,
}

/// Invoke a function with raw word arguments and return its raw result.
/// This is the single entry point used by the host API, package
/// initializers and re-entrant native callbacks.
pub fn call_function(vm: &mut VM, key: DefnKey, args: &[u64]) -> Result<u64, VmError> {
    let mut interp = Interpreter::new(vm)?;
    let interp_ptr: *mut Interpreter = &mut interp;
    vm.active_interpreters.push(interp_ptr);
    let result = interp.invoke_from_host(key, args);
    vm.active_interpreters.pop();
    result
}

impl Interpreter {
    fn new(vm: &mut VM) -> Result<Interpreter, VmError> {
        let stack = Stack::new(STACK_SIZE).ok_or(VmError::StackOverflow)?;
        Ok(Interpreter {
            vm,
            stack,
            function: None,
            pc: PC_DONE as usize,
            handlers: Vec::new(),
            type_args: Vec::new(),
        })
    }

    #[inline(always)]
    fn vm(&self) -> &'static mut VM {
        // SAFETY: the interpreter never outlives the call_function borrow of
        // the VM; the 'static is confined to expression temporaries.
        unsafe { &mut *self.vm }
    }

    fn invoke_from_host(&mut self, key: DefnKey, args: &[u64]) -> Result<u64, VmError> {
        let callee = self.vm().function(key);
        if callee.param_types.len() != args.len() {
            return Err(VmError::BadCall("argument count mismatch"));
        }
        if callee.is_builtin() || callee.is_native() || callee.instructions.is_empty() {
            return Err(VmError::BadCall("entry function must be bytecode"));
        }
        for &arg in args {
            self.stack.push(arg);
        }
        self.enter(key)?;
        self.run()
    }

    // ── Frames ─────────────────────────────────────────────────────

    fn ensure_stack_map(&mut self, key: DefnKey) -> Result<(), VmError> {
        let vm = self.vm();
        let function = vm.function(key);
        if function.stack_map.get().is_none() {
            let map = ptrmap::build(vm, key)?;
            let _ = function.stack_map.set(map);
        }
        Ok(())
    }

    fn enter(&mut self, key: DefnKey) -> Result<(), VmError> {
        // Pointer maps must exist before a frame is built: a collection can
        // hit any allocation or call inside.
        self.ensure_stack_map(key)?;
        let callee = self.vm().function(key);
        let locals_size = callee.locals_size as usize;
        if self.stack.available() < locals_size + FRAME_CONTROL_SIZE + STACK_RED_ZONE {
            return Err(VmError::StackOverflow);
        }

        self.stack.push(self.pc as u64);
        self.stack
            .push(self.function.map(|f| f.pack()).unwrap_or(NO_DEFN));
        self.stack.push(self.stack.fp() as u64);
        self.stack.set_fp(self.stack.sp());
        self.stack.set_sp(self.stack.fp() - locals_size);
        for slot in 0..locals_size / 8 {
            self.stack.poke(slot, Tagged::UNINITIALIZED.raw());
        }

        self.function = Some(key);
        self.pc = 0;
        Ok(())
    }

    fn leave(&mut self) {
        let callee = self.vm().function(self.function.expect("leave without frame"));
        let parameters_size = callee.parameters_size();

        let caller_pc = self.stack.read_fp(CALLER_PC_OFFSET);
        let caller_fn = self.stack.read_fp(CALLER_FUNCTION_OFFSET);
        let caller_fp = self.stack.read_fp(CALLER_FP_OFFSET);

        let fp = self.stack.fp();
        self.stack
            .set_sp(fp + FRAME_CONTROL_SIZE + parameters_size);
        self.stack.set_fp(caller_fp as usize);
        self.pc = caller_pc as usize;
        self.function = (caller_fn != NO_DEFN).then(|| DefnKey::unpack(caller_fn));
    }

    fn local_address(&self, slot: i64) -> usize {
        if slot >= 0 {
            let callee = self.vm().function(self.function.expect("no frame"));
            let count = callee.param_types.len();
            debug_assert!((slot as usize) < count);
            self.stack.fp() + PARAMETERS_OFFSET as usize + (count - 1 - slot as usize) * 8
        } else {
            (self.stack.fp() as i64 + slot * 8) as usize
        }
    }

    // ── Exceptions ─────────────────────────────────────────────────

    fn throw_builtin(&mut self, class: DefnKey) -> Result<(), VmError> {
        let vm = self.vm();
        let exception = vm.allocate_builtin_exception(class)?;
        self.do_throw(exception)
    }

    fn do_throw(&mut self, exception: u64) -> Result<(), VmError> {
        self.type_args.clear();
        match self.handlers.pop() {
            Some(handler) => {
                self.stack.set_fp_offset(handler.fp_offset);
                self.stack.set_sp_offset(handler.sp_offset);
                self.function = Some(handler.function);
                self.pc = handler.catch_pc;
                self.stack.push(exception);
                Ok(())
            }
            None => {
                let vm = self.vm();
                // SAFETY: the thrown value is a live exception block.
                let class_key = unsafe {
                    DefnKey::unpack(BlockHeader::of(exception as *const u8).meta().class_key())
                };
                let class_name = vm.class(class_key).name.to_string();
                let trace = self.collect_trace();
                self.stack.reset();
                self.function = None;
                self.handlers.clear();
                Err(VmError::UnhandledException { class_name, trace })
            }
        }
    }

    fn collect_trace(&self) -> Vec<String> {
        let vm = self.vm();
        let mut trace = Vec::new();
        let mut fp = self.stack.fp();
        let mut function = self.function;
        while let Some(key) = function {
            trace.push(vm.function(key).source_name.to_string());
            // SAFETY: fp chains through valid frames until the sentinel.
            unsafe {
                let caller = *((fp as isize + CALLER_FUNCTION_OFFSET) as *const u64);
                fp = *((fp as isize + CALLER_FP_OFFSET) as *const u64) as usize;
                function = (caller != NO_DEFN).then(|| DefnKey::unpack(caller));
            }
        }
        trace
    }

    // ── GC support ─────────────────────────────────────────────────

    /// Visit every reference slot of every frame, guided by the functions'
    /// stack pointer maps. The current pc (and each caller's saved return
    /// pc) is a GC-safe point with a recorded map.
    pub(crate) fn visit_frames(&self, vm: &VM, visitor: &mut dyn FnMut(&mut u64)) {
        let mut fp = self.stack.fp();
        let mut pc = self.pc;
        let mut function = self.function;

        while let Some(key) = function {
            let callee = vm.function(key);
            let map = callee.stack_map().expect("frame without pointer map");

            let (offset, count) = map.locals_region(pc);
            for i in 0..count {
                if map.bit(offset + i) {
                    let slot = (fp - 8 * (i + 1)) as *mut u64;
                    // SAFETY: slots below fp belong to this frame.
                    unsafe {
                        if Tagged::from_raw(*slot).is_block() {
                            visitor(&mut *slot);
                        }
                    }
                }
            }

            let (param_offset, param_count) = map.parameters_region();
            for i in 0..param_count {
                if map.bit(param_offset + i) {
                    let slot = (fp
                        + PARAMETERS_OFFSET as usize
                        + (param_count - 1 - i) * 8) as *mut u64;
                    // SAFETY: parameters sit above the frame control words.
                    unsafe {
                        if Tagged::from_raw(*slot).is_block() {
                            visitor(&mut *slot);
                        }
                    }
                }
            }

            // SAFETY: fp chains through valid frames until the sentinel.
            unsafe {
                let caller_pc = *((fp as isize + CALLER_PC_OFFSET) as *const u64);
                let caller_fn = *((fp as isize + CALLER_FUNCTION_OFFSET) as *const u64);
                fp = *((fp as isize + CALLER_FP_OFFSET) as *const u64) as usize;
                pc = caller_pc as usize;
                function = (caller_fn != NO_DEFN).then(|| DefnKey::unpack(caller_fn));
            }
        }
    }

    // ── Dispatch helpers ───────────────────────────────────────────

    fn code(&self) -> &'static [u8] {
        let callee = self.vm().function(self.function.expect("no frame"));
        // SAFETY: function storage is stable for the life of the VM; the
        // 'static is confined to the dispatch loop.
        unsafe { core::slice::from_raw_parts(callee.instructions.as_ptr(), callee.instructions.len()) }
    }

    #[inline(always)]
    fn operand(&mut self) -> i64 {
        read_vbn_unchecked(self.code(), &mut self.pc)
    }

    fn block_offset(&self, block: i64) -> usize {
        self.vm()
            .function(self.function.expect("no frame"))
            .block_offset(block as usize)
    }

    fn resolve_class_id(&self, id: i64) -> DefnKey {
        if is_builtin_id(id) {
            DefnKey::builtin(builtin_index(id))
        } else {
            let package = self.vm().function(self.function.expect("no frame")).package;
            DefnKey::new(package, id as u32)
        }
    }

    fn current_package(&self) -> u32 {
        self.vm().function(self.function.expect("no frame")).package
    }

    fn linked_function(&self, dep: i64, ext: i64) -> DefnKey {
        let package = self.vm().package(self.current_package());
        package.dependencies[dep as usize].linked_functions[ext as usize]
    }

    fn linked_global(&self, dep: i64, ext: i64) -> DefnKey {
        let package = self.vm().package(self.current_package());
        package.dependencies[dep as usize].linked_globals[ext as usize]
    }

    fn linked_class(&self, dep: i64, ext: i64) -> DefnKey {
        let package = self.vm().package(self.current_package());
        package.dependencies[dep as usize].linked_classes[ext as usize]
    }

    /// Route a resolved callee: builtin intrinsics and natives execute in
    /// the caller's frame, bytecode functions get a frame of their own.
    fn invoke(&mut self, key: DefnKey) -> Result<(), VmError> {
        self.type_args.clear();
        let callee = self.vm().function(key);
        if callee.is_builtin() {
            self.handle_builtin(key)
        } else if callee.is_native() {
            native::call_native(self, key)
        } else {
            self.enter(key)
        }
    }

    // ── Main loop ──────────────────────────────────────────────────

    fn run(&mut self) -> Result<u64, VmError> {
        macro_rules! int_binop {
            ($ty:ty, $op:ident) => {{
                let right = self.stack.pop() as $ty;
                let left = self.stack.pop() as $ty;
                self.push_int(left.$op(right));
            }};
        }
        macro_rules! int_div {
            ($ty:ty, $op:ident) => {{
                let right = self.stack.pop() as $ty;
                let left = self.stack.pop() as $ty;
                if right == 0 {
                    self.throw_builtin(builtins::ARITHMETIC_EXCEPTION_CLASS)?;
                } else {
                    self.push_int(left.$op(right));
                }
            }};
        }
        macro_rules! int_shift {
            ($ty:ty, $op:ident) => {{
                let right = self.stack.pop() as u32;
                let left = self.stack.pop() as $ty;
                self.push_int(left.$op(right));
            }};
        }
        macro_rules! int_compare {
            ($ty:ty, $op:tt) => {{
                let right = self.stack.pop() as $ty;
                let left = self.stack.pop() as $ty;
                self.stack.push((left $op right) as u64);
            }};
        }
        macro_rules! float_binop {
            (f32, $op:tt) => {{
                let right = self.pop_f32();
                let left = self.pop_f32();
                self.push_f32(left $op right);
            }};
            (f64, $op:tt) => {{
                let right = f64::from_bits(self.stack.pop());
                let left = f64::from_bits(self.stack.pop());
                self.stack.push((left $op right).to_bits());
            }};
        }
        macro_rules! float_compare {
            (f32, $op:tt) => {{
                let right = self.pop_f32();
                let left = self.pop_f32();
                self.stack.push((left $op right) as u64);
            }};
            (f64, $op:tt) => {{
                let right = f64::from_bits(self.stack.pop());
                let left = f64::from_bits(self.stack.pop());
                self.stack.push((left $op right) as u64);
            }};
        }

        loop {
            let code = self.code();
            let opcode = code[self.pc];
            self.pc += 1;
            // SAFETY: the pointer-map builder has walked this bytecode and
            // rejected invalid opcodes before the function could run.
            let opcode = unsafe { Opcode::from_u8_unchecked(opcode) };

            match opcode {
                Opcode::Nop => {}

                Opcode::Ret => {
                    let value = self.stack.pop();
                    self.leave();
                    if self.function.is_none() {
                        return Ok(value);
                    }
                    self.stack.push(value);
                }

                Opcode::Branch => {
                    let block = self.operand();
                    self.pc = self.block_offset(block);
                }

                Opcode::BranchIf => {
                    let true_block = self.operand();
                    let false_block = self.operand();
                    let condition = self.stack.pop() != 0;
                    self.pc =
                        self.block_offset(if condition { true_block } else { false_block });
                }

                Opcode::Label => {
                    let block = self.operand();
                    self.stack.push(block as u64);
                }

                Opcode::BranchL => {
                    let count = self.operand();
                    for _ in 0..count {
                        self.operand();
                    }
                    let label = self.stack.pop();
                    self.pc = self.block_offset(label as i64);
                }

                Opcode::PushTry => {
                    let try_block = self.operand();
                    let catch_block = self.operand();
                    self.handlers.push(Handler {
                        fp_offset: self.stack.fp_offset(),
                        sp_offset: self.stack.sp_offset(),
                        catch_pc: self.block_offset(catch_block),
                        function: self.function.expect("no frame"),
                    });
                    self.pc = self.block_offset(try_block);
                }

                Opcode::PopTry => {
                    let done_block = self.operand();
                    self.handlers.pop();
                    self.pc = self.block_offset(done_block);
                }

                Opcode::Throw => {
                    let exception = self.stack.pop();
                    if Tagged::from_raw(exception).is_block() {
                        self.do_throw(exception)?;
                    } else {
                        self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS)?;
                    }
                }

                Opcode::Drop => {
                    self.stack.pop();
                }

                Opcode::DropI => {
                    let count = self.operand();
                    for _ in 0..count {
                        self.stack.pop();
                    }
                }

                Opcode::Dup => {
                    let top = self.stack.peek(0);
                    self.stack.push(top);
                }

                Opcode::DupI => {
                    let index = self.operand();
                    let value = self.stack.peek(index as usize);
                    self.stack.push(value);
                }

                Opcode::Swap => {
                    let top = self.stack.peek(0);
                    let other = self.stack.peek(1);
                    self.stack.poke(0, other);
                    self.stack.poke(1, top);
                }

                Opcode::Swap2 => {
                    let top = self.stack.peek(0);
                    let other = self.stack.peek(2);
                    self.stack.poke(0, other);
                    self.stack.poke(2, top);
                }

                Opcode::Unit | Opcode::False | Opcode::Nul => self.stack.push(0),
                Opcode::True => self.stack.push(1),
                Opcode::Uninitialized => self.stack.push(Tagged::UNINITIALIZED.raw()),

                Opcode::I8 => {
                    let value = self.operand() as i8;
                    self.push_int(value);
                }
                Opcode::I16 => {
                    let value = self.operand() as i16;
                    self.push_int(value);
                }
                Opcode::I32 => {
                    let value = self.operand() as i32;
                    self.push_int(value);
                }
                Opcode::I64 => {
                    let value = self.operand();
                    self.stack.push(value as u64);
                }
                Opcode::F32 => {
                    let code = self.code();
                    let bits =
                        u32::from_le_bytes(code[self.pc..self.pc + 4].try_into().unwrap());
                    self.pc += 4;
                    self.stack.push(bits as u64);
                }
                Opcode::F64 => {
                    let code = self.code();
                    let bits =
                        u64::from_le_bytes(code[self.pc..self.pc + 8].try_into().unwrap());
                    self.pc += 8;
                    self.stack.push(bits);
                }
                Opcode::String => {
                    let index = self.operand();
                    let package = self.vm().package(self.current_package());
                    let string = package.strings[index as usize].get();
                    self.stack.push(string);
                }

                Opcode::LdLocal => {
                    let slot = self.operand();
                    let address = self.local_address(slot);
                    // SAFETY: local addresses stay inside the current frame.
                    let value = unsafe { *(address as *const u64) };
                    if value == Tagged::UNINITIALIZED.raw() {
                        self.throw_builtin(builtins::UNINITIALIZED_EXCEPTION_CLASS)?;
                    } else {
                        self.stack.push(value);
                    }
                }

                Opcode::StLocal => {
                    let slot = self.operand();
                    let address = self.local_address(slot);
                    let value = self.stack.pop();
                    // SAFETY: as LdLocal.
                    unsafe { *(address as *mut u64) = value };
                }

                Opcode::LdG | Opcode::LdGF => {
                    let key = if opcode == Opcode::LdG {
                        let index = self.operand();
                        DefnKey::new(self.current_package(), index as u32)
                    } else {
                        let dep = self.operand();
                        let ext = self.operand();
                        self.linked_global(dep, ext)
                    };
                    let value = self.vm().global(key).raw_value();
                    if value == Tagged::UNINITIALIZED.raw() {
                        self.throw_builtin(builtins::UNINITIALIZED_EXCEPTION_CLASS)?;
                    } else {
                        self.stack.push(value);
                    }
                }

                Opcode::StG | Opcode::StGF => {
                    let key = if opcode == Opcode::StG {
                        let index = self.operand();
                        DefnKey::new(self.current_package(), index as u32)
                    } else {
                        let dep = self.operand();
                        let ext = self.operand();
                        self.linked_global(dep, ext)
                    };
                    let value = self.stack.pop();
                    self.vm().global(key).set_raw_value(value);
                }

                Opcode::LdF | Opcode::LdFF => {
                    let class_key = if opcode == Opcode::LdF {
                        let class_id = self.operand();
                        self.resolve_class_id(class_id)
                    } else {
                        let dep = self.operand();
                        let ext = self.operand();
                        self.linked_class(dep, ext)
                    };
                    let name_index = self.operand();
                    let receiver = self.stack.pop();
                    if !Tagged::from_raw(receiver).is_block() {
                        self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS)?;
                        continue;
                    }
                    let (offset, ty) = self.field_of(class_key, name_index)?;
                    // SAFETY: receiver is a live block of (a subclass of)
                    // the field's class; flattened layouts agree on offsets.
                    let value = unsafe { load_field(receiver as *const u8, offset, &ty) };
                    if ty.is_object() && value == Tagged::UNINITIALIZED.raw() {
                        self.throw_builtin(builtins::UNINITIALIZED_EXCEPTION_CLASS)?;
                    } else {
                        self.stack.push(value);
                    }
                }

                Opcode::StF | Opcode::StFF => {
                    let class_key = if opcode == Opcode::StF {
                        let class_id = self.operand();
                        self.resolve_class_id(class_id)
                    } else {
                        let dep = self.operand();
                        let ext = self.operand();
                        self.linked_class(dep, ext)
                    };
                    let name_index = self.operand();
                    let receiver = self.stack.pop();
                    let value = self.stack.pop();
                    if !Tagged::from_raw(receiver).is_block() {
                        self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS)?;
                        continue;
                    }
                    let (offset, ty) = self.field_of(class_key, name_index)?;
                    // SAFETY: as LdF.
                    unsafe {
                        store_field(receiver as *mut u8, offset, &ty, value);
                        if ty.is_object() {
                            let slot = (receiver as usize + offset) as *mut u64;
                            self.vm().heap.record_write(slot, value);
                        }
                    }
                }

                Opcode::LdE => {
                    let receiver = self.stack.pop();
                    let index = self.stack.pop() as i32 as i64;
                    if !Tagged::from_raw(receiver).is_block() {
                        self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS)?;
                        continue;
                    }
                    // SAFETY: receiver is a live array-like block.
                    let value = unsafe {
                        let meta = BlockHeader::of(receiver as *const u8).meta();
                        let length: i64 =
                            object::load(receiver as *const u8, meta.length_offset() as usize);
                        if index < 0 || index >= length {
                            self.throw_builtin(builtins::OUT_OF_BOUNDS_EXCEPTION_CLASS)?;
                            continue;
                        }
                        let stride = meta.element_size() as usize;
                        let offset = object::elements_offset(meta) + index as usize * stride;
                        load_sized(receiver as *const u8, offset, stride)
                    };
                    let element_is_object = {
                        let meta = unsafe { BlockHeader::of(receiver as *const u8).meta() };
                        meta.has_element_pointers()
                    };
                    if element_is_object && value == Tagged::UNINITIALIZED.raw() {
                        self.throw_builtin(builtins::UNINITIALIZED_EXCEPTION_CLASS)?;
                    } else {
                        self.stack.push(value);
                    }
                }

                Opcode::StE => {
                    let receiver = self.stack.pop();
                    let index = self.stack.pop() as i32 as i64;
                    let value = self.stack.pop();
                    if !Tagged::from_raw(receiver).is_block() {
                        self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS)?;
                        continue;
                    }
                    // SAFETY: receiver is a live array-like block.
                    unsafe {
                        let meta = BlockHeader::of(receiver as *const u8).meta();
                        let length: i64 =
                            object::load(receiver as *const u8, meta.length_offset() as usize);
                        if index < 0 || index >= length {
                            self.throw_builtin(builtins::OUT_OF_BOUNDS_EXCEPTION_CLASS)?;
                            continue;
                        }
                        let stride = meta.element_size() as usize;
                        let offset = object::elements_offset(meta) + index as usize * stride;
                        store_sized(receiver as *mut u8, offset, stride, value);
                        if meta.has_element_pointers() {
                            let slot = (receiver as usize + offset) as *mut u64;
                            self.vm().heap.record_write(slot, value);
                        }
                    }
                }

                Opcode::AllocObj | Opcode::AllocObjF => {
                    let class_key = if opcode == Opcode::AllocObj {
                        let class_id = self.operand();
                        self.resolve_class_id(class_id)
                    } else {
                        let dep = self.operand();
                        let ext = self.operand();
                        self.linked_class(dep, ext)
                    };
                    self.type_args.clear();
                    let block = self.vm().allocate_instance(class_key)?;
                    self.stack.push(block as u64);
                }

                Opcode::AllocArr | Opcode::AllocArrF => {
                    let length = self.stack.pop() as i64;
                    let class_key = if opcode == Opcode::AllocArr {
                        let class_id = self.operand();
                        self.resolve_class_id(class_id)
                    } else {
                        let dep = self.operand();
                        let ext = self.operand();
                        self.linked_class(dep, ext)
                    };
                    self.type_args.clear();
                    if length < 0 {
                        self.throw_builtin(builtins::OUT_OF_BOUNDS_EXCEPTION_CLASS)?;
                        continue;
                    }
                    let block = self.vm().allocate_array(class_key, length)?;
                    self.stack.push(block as u64);
                }

                Opcode::Tys => {
                    let index = self.operand();
                    let ty = self.vm().function(self.function.expect("no frame")).inst_types
                        [index as usize]
                        .clone();
                    self.type_args.push(ty);
                }

                Opcode::Tyd => {
                    let index = self.operand();
                    let ty = self.vm().function(self.function.expect("no frame")).inst_types
                        [index as usize]
                        .clone();
                    self.type_args.push(ty);
                    // The Type value occupies a slot; no pointer map exists
                    // here, so the allocation must not collect.
                    let block = self.allocate_marker(builtins::TYPE_CLASS)?;
                    self.stack.push(block);
                }

                Opcode::Cast => {
                    let target = self
                        .type_args
                        .pop()
                        .ok_or(VmError::Assertion("cast without type argument"))?;
                    let value = self.stack.peek(0);
                    if !self.cast_allowed(value, &target) {
                        self.stack.pop();
                        self.throw_builtin(builtins::CAST_EXCEPTION_CLASS)?;
                    }
                }

                Opcode::CastC => {
                    let target = self
                        .type_args
                        .pop()
                        .ok_or(VmError::Assertion("cast without type argument"))?;
                    self.stack.pop(); // the Type value from TYD
                    let value = self.stack.peek(0);
                    if !self.cast_allowed(value, &target) {
                        self.stack.pop();
                        self.throw_builtin(builtins::CAST_EXCEPTION_CLASS)?;
                    }
                }

                Opcode::CastCBr => {
                    let true_block = self.operand();
                    let false_block = self.operand();
                    let target = self
                        .type_args
                        .pop()
                        .ok_or(VmError::Assertion("cast without type argument"))?;
                    self.stack.pop(); // the Type value from TYD
                    let value = self.stack.peek(0);
                    let block = if self.cast_allowed(value, &target) {
                        true_block
                    } else {
                        false_block
                    };
                    self.pc = self.block_offset(block);
                }

                Opcode::CallG | Opcode::CallGF => {
                    let key = if opcode == Opcode::CallG {
                        let id = self.operand();
                        if is_builtin_id(id) {
                            DefnKey::builtin(builtin_index(id))
                        } else {
                            DefnKey::new(self.current_package(), id as u32)
                        }
                    } else {
                        let dep = self.operand();
                        let ext = self.operand();
                        self.linked_function(dep, ext)
                    };
                    self.invoke(key)?;
                }

                Opcode::CallV | Opcode::CallVF => {
                    let static_key = if opcode == Opcode::CallV {
                        let id = self.operand();
                        if is_builtin_id(id) {
                            DefnKey::builtin(builtin_index(id))
                        } else {
                            DefnKey::new(self.current_package(), id as u32)
                        }
                    } else {
                        let dep = self.operand();
                        let ext = self.operand();
                        self.linked_function(dep, ext)
                    };
                    let argc = self.vm().function(static_key).param_types.len();
                    debug_assert!(argc > 0, "virtual call without receiver");
                    let receiver = self.stack.peek(argc - 1);
                    if !Tagged::from_raw(receiver).is_block() {
                        self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS)?;
                        continue;
                    }
                    // SAFETY: receiver is a live block.
                    let receiver_class = unsafe {
                        DefnKey::unpack(BlockHeader::of(receiver as *const u8).meta().class_key())
                    };
                    let root = self.vm().root_override(static_key);
                    let target = self
                        .vm()
                        .class(receiver_class)
                        .vtable(self.vm())
                        .get(&root.pack())
                        .copied()
                        .ok_or(VmError::Assertion("method missing from vtable"))?;
                    self.invoke(target)?;
                }

                Opcode::Pkg => {
                    let dep = self.operand();
                    let target = self.vm().package(self.current_package()).dependencies
                        [dep as usize]
                        .package;
                    let block = self.allocate_marker(builtins::PACKAGE_CLASS)?;
                    // SAFETY: the Package block's only field is the id.
                    unsafe { object::store::<i64>(block as *mut u8, 16, target as i64) };
                    self.stack.push(block);
                }

                // ── Arithmetic ─────────────────────────────────────
                Opcode::AddI8 => int_binop!(i8, wrapping_add),
                Opcode::SubI8 => int_binop!(i8, wrapping_sub),
                Opcode::MulI8 => int_binop!(i8, wrapping_mul),
                Opcode::DivI8 => int_div!(i8, wrapping_div),
                Opcode::ModI8 => int_div!(i8, wrapping_rem),
                Opcode::LslI8 => int_shift!(i8, wrapping_shl),
                Opcode::LsrI8 => {
                    let right = self.stack.pop() as u32;
                    let left = self.stack.pop() as u8;
                    self.push_int(left.wrapping_shr(right) as i8);
                }
                Opcode::AsrI8 => int_shift!(i8, wrapping_shr),
                Opcode::AndI8 => int_binop!(i8, bitand_op),
                Opcode::OrI8 => int_binop!(i8, bitor_op),
                Opcode::XorI8 => int_binop!(i8, bitxor_op),

                Opcode::AddI16 => int_binop!(i16, wrapping_add),
                Opcode::SubI16 => int_binop!(i16, wrapping_sub),
                Opcode::MulI16 => int_binop!(i16, wrapping_mul),
                Opcode::DivI16 => int_div!(i16, wrapping_div),
                Opcode::ModI16 => int_div!(i16, wrapping_rem),
                Opcode::LslI16 => int_shift!(i16, wrapping_shl),
                Opcode::LsrI16 => {
                    let right = self.stack.pop() as u32;
                    let left = self.stack.pop() as u16;
                    self.push_int(left.wrapping_shr(right) as i16);
                }
                Opcode::AsrI16 => int_shift!(i16, wrapping_shr),
                Opcode::AndI16 => int_binop!(i16, bitand_op),
                Opcode::OrI16 => int_binop!(i16, bitor_op),
                Opcode::XorI16 => int_binop!(i16, bitxor_op),

                Opcode::AddI32 => int_binop!(i32, wrapping_add),
                Opcode::SubI32 => int_binop!(i32, wrapping_sub),
                Opcode::MulI32 => int_binop!(i32, wrapping_mul),
                Opcode::DivI32 => int_div!(i32, wrapping_div),
                Opcode::ModI32 => int_div!(i32, wrapping_rem),
                Opcode::LslI32 => int_shift!(i32, wrapping_shl),
                Opcode::LsrI32 => {
                    let right = self.stack.pop() as u32;
                    let left = self.stack.pop() as u32;
                    self.push_int(left.wrapping_shr(right) as i32);
                }
                Opcode::AsrI32 => int_shift!(i32, wrapping_shr),
                Opcode::AndI32 => int_binop!(i32, bitand_op),
                Opcode::OrI32 => int_binop!(i32, bitor_op),
                Opcode::XorI32 => int_binop!(i32, bitxor_op),

                Opcode::AddI64 => int_binop!(i64, wrapping_add),
                Opcode::SubI64 => int_binop!(i64, wrapping_sub),
                Opcode::MulI64 => int_binop!(i64, wrapping_mul),
                Opcode::DivI64 => int_div!(i64, wrapping_div),
                Opcode::ModI64 => int_div!(i64, wrapping_rem),
                Opcode::LslI64 => int_shift!(i64, wrapping_shl),
                Opcode::LsrI64 => {
                    let right = self.stack.pop() as u32;
                    let left = self.stack.pop();
                    self.stack.push(left.wrapping_shr(right));
                }
                Opcode::AsrI64 => int_shift!(i64, wrapping_shr),
                Opcode::AndI64 => int_binop!(i64, bitand_op),
                Opcode::OrI64 => int_binop!(i64, bitor_op),
                Opcode::XorI64 => int_binop!(i64, bitxor_op),

                Opcode::AddF32 => float_binop!(f32, +),
                Opcode::SubF32 => float_binop!(f32, -),
                Opcode::MulF32 => float_binop!(f32, *),
                Opcode::DivF32 => float_binop!(f32, /),
                Opcode::AddF64 => float_binop!(f64, +),
                Opcode::SubF64 => float_binop!(f64, -),
                Opcode::MulF64 => float_binop!(f64, *),
                Opcode::DivF64 => float_binop!(f64, /),

                Opcode::EqI8 => int_compare!(i8, ==),
                Opcode::NeI8 => int_compare!(i8, !=),
                Opcode::LtI8 => int_compare!(i8, <),
                Opcode::LeI8 => int_compare!(i8, <=),
                Opcode::GtI8 => int_compare!(i8, >),
                Opcode::GeI8 => int_compare!(i8, >=),
                Opcode::EqI16 => int_compare!(i16, ==),
                Opcode::NeI16 => int_compare!(i16, !=),
                Opcode::LtI16 => int_compare!(i16, <),
                Opcode::LeI16 => int_compare!(i16, <=),
                Opcode::GtI16 => int_compare!(i16, >),
                Opcode::GeI16 => int_compare!(i16, >=),
                Opcode::EqI32 => int_compare!(i32, ==),
                Opcode::NeI32 => int_compare!(i32, !=),
                Opcode::LtI32 => int_compare!(i32, <),
                Opcode::LeI32 => int_compare!(i32, <=),
                Opcode::GtI32 => int_compare!(i32, >),
                Opcode::GeI32 => int_compare!(i32, >=),
                Opcode::EqI64 => int_compare!(i64, ==),
                Opcode::NeI64 => int_compare!(i64, !=),
                Opcode::LtI64 => int_compare!(i64, <),
                Opcode::LeI64 => int_compare!(i64, <=),
                Opcode::GtI64 => int_compare!(i64, >),
                Opcode::GeI64 => int_compare!(i64, >=),

                Opcode::EqF32 => float_compare!(f32, ==),
                Opcode::NeF32 => float_compare!(f32, !=),
                Opcode::LtF32 => float_compare!(f32, <),
                Opcode::LeF32 => float_compare!(f32, <=),
                Opcode::GtF32 => float_compare!(f32, >),
                Opcode::GeF32 => float_compare!(f32, >=),
                Opcode::EqF64 => float_compare!(f64, ==),
                Opcode::NeF64 => float_compare!(f64, !=),
                Opcode::LtF64 => float_compare!(f64, <),
                Opcode::LeF64 => float_compare!(f64, <=),
                Opcode::GtF64 => float_compare!(f64, >),
                Opcode::GeF64 => float_compare!(f64, >=),

                Opcode::EqP => {
                    let right = self.stack.pop();
                    let left = self.stack.pop();
                    self.stack.push((left == right) as u64);
                }
                Opcode::NeP => {
                    let right = self.stack.pop();
                    let left = self.stack.pop();
                    self.stack.push((left != right) as u64);
                }

                Opcode::NegI8 => {
                    let value = self.stack.pop() as i8;
                    self.push_int(value.wrapping_neg());
                }
                Opcode::NegI16 => {
                    let value = self.stack.pop() as i16;
                    self.push_int(value.wrapping_neg());
                }
                Opcode::NegI32 => {
                    let value = self.stack.pop() as i32;
                    self.push_int(value.wrapping_neg());
                }
                Opcode::NegI64 => {
                    let value = self.stack.pop() as i64;
                    self.stack.push(value.wrapping_neg() as u64);
                }
                Opcode::NegF32 => {
                    let value = self.pop_f32();
                    self.push_f32(-value);
                }
                Opcode::NegF64 => {
                    let value = f64::from_bits(self.stack.pop());
                    self.stack.push((-value).to_bits());
                }
                Opcode::InvI8 => {
                    let value = self.stack.pop() as i8;
                    self.push_int(!value);
                }
                Opcode::InvI16 => {
                    let value = self.stack.pop() as i16;
                    self.push_int(!value);
                }
                Opcode::InvI32 => {
                    let value = self.stack.pop() as i32;
                    self.push_int(!value);
                }
                Opcode::InvI64 => {
                    let value = self.stack.pop();
                    self.stack.push(!value);
                }
                Opcode::NotB => {
                    let value = self.stack.pop();
                    self.stack.push((value == 0) as u64);
                }

                // ── Conversions ────────────────────────────────────
                Opcode::TruncI8 => {
                    let value = self.stack.pop() as i8;
                    self.push_int(value);
                }
                Opcode::TruncI16 => {
                    let value = self.stack.pop() as i16;
                    self.push_int(value);
                }
                Opcode::TruncI32 => {
                    let value = self.stack.pop() as i32;
                    self.push_int(value);
                }
                Opcode::TruncF32 => {
                    let value = f64::from_bits(self.stack.pop());
                    self.push_f32(value as f32);
                }
                Opcode::SextI16_8 => {
                    let value = self.stack.pop() as i8;
                    self.push_int(value as i16);
                }
                Opcode::SextI32_8 => {
                    let value = self.stack.pop() as i8;
                    self.push_int(value as i32);
                }
                Opcode::SextI32_16 => {
                    let value = self.stack.pop() as i16;
                    self.push_int(value as i32);
                }
                Opcode::SextI64_8 => {
                    let value = self.stack.pop() as i8;
                    self.stack.push(value as i64 as u64);
                }
                Opcode::SextI64_16 => {
                    let value = self.stack.pop() as i16;
                    self.stack.push(value as i64 as u64);
                }
                Opcode::SextI64_32 => {
                    let value = self.stack.pop() as i32;
                    self.stack.push(value as i64 as u64);
                }
                // Values are already stored zero-extended.
                Opcode::ZextI16 | Opcode::ZextI32 | Opcode::ZextI64 => {}
                Opcode::ExtF64 => {
                    let value = self.pop_f32();
                    self.stack.push((value as f64).to_bits());
                }
                Opcode::FcvtI32 => {
                    let value = self.pop_f32();
                    self.push_int(value as i32);
                }
                Opcode::FcvtI64 => {
                    let value = f64::from_bits(self.stack.pop());
                    self.stack.push(value as i64 as u64);
                }
                Opcode::IcvtF32 => {
                    let value = self.stack.pop() as i32;
                    self.push_f32(value as f32);
                }
                Opcode::IcvtF64 => {
                    let value = self.stack.pop() as i64;
                    self.stack.push((value as f64).to_bits());
                }
                // Bit reinterpretations: the slot already holds the bits.
                Opcode::FtoI32 | Opcode::FtoI64 | Opcode::ItoF32 | Opcode::ItoF64 => {}
            }
        }
    }

    // ── Value helpers ──────────────────────────────────────────────

    #[inline(always)]
    fn push_int<T: IntSlot>(&mut self, value: T) {
        self.stack.push(value.to_slot());
    }

    #[inline(always)]
    fn pop_f32(&mut self) -> f32 {
        f32::from_bits(self.stack.pop() as u32)
    }

    #[inline(always)]
    fn push_f32(&mut self, value: f32) {
        self.stack.push(value.to_bits() as u64);
    }

    fn field_of(&self, class_key: DefnKey, name_index: i64) -> Result<(usize, Type), VmError> {
        let vm = self.vm();
        let package = vm.package(self.current_package());
        let name = package.name_at(name_index as u32);
        let class = vm.class(class_key);
        let (index, field) = class
            .find_field(name)
            .ok_or(VmError::Assertion("unknown field"))?;
        Ok((class.field_offset(index) as usize, field.ty.clone()))
    }

    /// Runtime cast check: the value's class must be a subclass of the
    /// target's effective class. Type arguments are not checked; the
    /// compiler's bytecode invariants cover them.
    fn cast_allowed(&self, value: u64, target: &Type) -> bool {
        let tagged = Tagged::from_raw(value);
        if tagged.is_null() {
            return target.is_nullable();
        }
        if !tagged.is_block() {
            return false;
        }
        let vm = self.vm();
        // SAFETY: the value is a live block.
        let class = unsafe {
            DefnKey::unpack(BlockHeader::of(value as *const u8).meta().class_key())
        };
        vm.is_subclass_of(class, target.effective_class(vm))
    }

    /// Allocate a field-free marker block (Type, Package) without
    /// collecting: these sites carry no pointer map.
    fn allocate_marker(&mut self, class_key: DefnKey) -> Result<u64, VmError> {
        let vm = self.vm();
        let (meta, size) = {
            let class = vm.class(class_key);
            (class.meta(class_key) as *const object::Meta, class.instance_size() as usize)
        };
        let block = vm.allocate_block_uncollected(meta, size)?;
        Ok(block as u64)
    }

    // ── Builtin intrinsics ─────────────────────────────────────────

    fn handle_builtin(&mut self, key: DefnKey) -> Result<(), VmError> {
        match key {
            builtins::OBJECT_CTOR_FN | builtins::EXCEPTION_CTOR_FN => {
                self.stack.pop();
                self.stack.push(0);
            }

            builtins::STRING_CONCAT_FN => {
                let right = self.stack.pop();
                let left = self.stack.pop();
                if !Tagged::from_raw(left).is_block() || !Tagged::from_raw(right).is_block() {
                    return self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS);
                }
                // The content is copied out before the allocation can move
                // either operand.
                // SAFETY: both operands are live string blocks.
                let mut content = unsafe { StrBlock::bytes(left as *const u8).to_vec() };
                // SAFETY: as above.
                unsafe { content.extend_from_slice(StrBlock::bytes(right as *const u8)) };
                let result = self.vm().allocate_string(&content)?;
                self.stack.push(result);
            }

            builtins::STRING_EQ_FN => {
                let right = self.stack.pop();
                let left = self.stack.pop();
                if !Tagged::from_raw(left).is_block() || !Tagged::from_raw(right).is_block() {
                    return self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS);
                }
                // SAFETY: both operands are live string blocks.
                let equal = unsafe {
                    StrBlock::bytes(left as *const u8) == StrBlock::bytes(right as *const u8)
                };
                self.stack.push(equal as u64);
            }

            builtins::STRING_LEN_FN => {
                let string = self.stack.pop();
                if !Tagged::from_raw(string).is_block() {
                    return self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS);
                }
                // SAFETY: the operand is a live string block.
                let length = unsafe { StrBlock::bytes(string as *const u8).len() };
                self.stack.push(length as u64);
            }

            builtins::PRINT_FN => {
                let string = self.stack.pop();
                if !Tagged::from_raw(string).is_block() {
                    return self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS);
                }
                // SAFETY: the operand is a live string block.
                let text = unsafe { StrBlock::str(string as *const u8) };
                use std::io::Write;
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(text.as_bytes());
                let _ = stdout.flush();
                self.stack.push(0);
            }

            builtins::TABLE_NEW_FN => {
                let table = table::table_new(self.vm())?;
                self.stack.push(table);
            }

            builtins::TABLE_INSERT_FN => {
                let value = self.stack.pop() as i64;
                let key_word = self.stack.pop();
                let receiver = self.stack.pop();
                if !Tagged::from_raw(receiver).is_block()
                    || !Tagged::from_raw(key_word).is_block()
                {
                    return self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS);
                }
                let added = table::table_insert(
                    self.vm(),
                    receiver,
                    key_word,
                    Tagged::from_number(value),
                )?;
                self.stack.push(added as u64);
            }

            builtins::TABLE_CONTAINS_FN => {
                let key_word = self.stack.pop();
                let receiver = self.stack.pop();
                if !Tagged::from_raw(receiver).is_block()
                    || !Tagged::from_raw(key_word).is_block()
                {
                    return self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS);
                }
                // SAFETY: the key is a live string block.
                let contains = table::table_contains(receiver, unsafe {
                    table::string_bytes(key_word)
                });
                self.stack.push(contains as u64);
            }

            builtins::TABLE_GET_FN | builtins::TABLE_REMOVE_FN => {
                let key_word = self.stack.pop();
                let receiver = self.stack.pop();
                if !Tagged::from_raw(receiver).is_block()
                    || !Tagged::from_raw(key_word).is_block()
                {
                    return self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS);
                }
                // SAFETY: the key is a live string block.
                let key_bytes = unsafe { table::string_bytes(key_word) };
                let result = if key == builtins::TABLE_GET_FN {
                    table::table_get(receiver, key_bytes)
                } else {
                    table::table_remove(receiver, key_bytes)
                };
                match result {
                    Some(value) => {
                        // SAFETY: table values for this signature are numbers.
                        self.stack.push(unsafe { value.number() } as u64)
                    }
                    None => {
                        return self
                            .throw_builtin(builtins::NO_SUCH_ELEMENT_EXCEPTION_CLASS)
                    }
                }
            }

            builtins::TABLE_LEN_FN => {
                let receiver = self.stack.pop();
                if !Tagged::from_raw(receiver).is_block() {
                    return self.throw_builtin(builtins::NULL_POINTER_EXCEPTION_CLASS);
                }
                self.stack.push(table::table_len(receiver) as u64);
            }

            _ => return Err(VmError::Assertion("unknown builtin function")),
        }
        Ok(())
    }

    // ── Accessors used by the native bridge ────────────────────────

    pub(crate) fn vm_mut(&mut self) -> &'static mut VM {
        // SAFETY: as `vm`.
        unsafe { &mut *self.vm }
    }

    pub(crate) fn vm_ptr(&self) -> *mut VM {
        self.vm
    }

    pub(crate) fn stack_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }

    pub(crate) fn raise_pending(&mut self, exception: u64) -> Result<(), VmError> {
        self.do_throw(exception)
    }
}

trait IntSlot {
    fn to_slot(self) -> u64;
}

macro_rules! int_slot {
    ($signed:ty, $unsigned:ty) => {
        impl IntSlot for $signed {
            #[inline(always)]
            fn to_slot(self) -> u64 {
                self as $unsigned as u64
            }
        }
    };
}

int_slot!(i8, u8);
int_slot!(i16, u16);
int_slot!(i32, u32);
int_slot!(i64, u64);

impl IntSlot for u8 {
    fn to_slot(self) -> u64 {
        self as u64
    }
}

trait BitOps {
    fn bitand_op(self, other: Self) -> Self;
    fn bitor_op(self, other: Self) -> Self;
    fn bitxor_op(self, other: Self) -> Self;
}

macro_rules! bit_ops {
    ($ty:ty) => {
        impl BitOps for $ty {
            fn bitand_op(self, other: Self) -> Self {
                self & other
            }
            fn bitor_op(self, other: Self) -> Self {
                self | other
            }
            fn bitxor_op(self, other: Self) -> Self {
                self ^ other
            }
        }
    };
}

bit_ops!(i8);
bit_ops!(i16);
bit_ops!(i32);
bit_ops!(i64);

/// Load a field value, zero-extended into a stack slot.
///
/// # Safety
///
/// `block + offset` must hold an initialized field of `ty`'s width.
unsafe fn load_field(block: *const u8, offset: usize, ty: &Type) -> u64 {
    load_sized(block, offset, ty.type_size())
}

/// # Safety
///
/// As [`load_field`].
unsafe fn load_sized(block: *const u8, offset: usize, size: usize) -> u64 {
    match size {
        1 => object::load::<u8>(block, offset) as u64,
        2 => object::load::<u16>(block, offset) as u64,
        4 => object::load::<u32>(block, offset) as u64,
        _ => object::load::<u64>(block, offset),
    }
}

/// # Safety
///
/// As [`load_field`], and the field must be writable.
unsafe fn store_field(block: *mut u8, offset: usize, ty: &Type, value: u64) {
    store_sized(block, offset, ty.type_size(), value)
}

/// # Safety
///
/// As [`store_field`].
unsafe fn store_sized(block: *mut u8, offset: usize, size: usize, value: u64) {
    match size {
        1 => object::store::<u8>(block, offset, value as u8),
        2 => object::store::<u16>(block, offset, value as u16),
        4 => object::store::<u32>(block, offset, value as u32),
        _ => object::store::<u64>(block, offset, value),
    }
}
