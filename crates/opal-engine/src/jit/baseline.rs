//! Baseline compiler
//!
//! Single-pass translation of the typed AST into machine code, one
//! callable at a time. Expressions are compiled to leave their result in
//! a caller-chosen destination register; statements thread a compilation
//! context that tracks the current stack depth (the basis for 16-byte
//! alignment at call sites) and the unresolved `continue`/`break` labels
//! of the innermost loop.
//!
//! Frame layout (slot 0 closest to the saved frame pointer):
//! parameters, then locals, then temporaries, then — for methods and
//! constructors — the `self` slot. The entry point additionally saves
//! the global pointer below the frame pointer and points it at static
//! memory.
//!
//! Calling convention: arguments 0..5 in the argument registers, the
//! rest on the stack in ascending order; the stack pointer is 16-byte
//! aligned immediately before every call; results come back in `v0`.

use crate::analysis::bitset::BitSet;
use crate::jit::addr_store::{self, AddrKind};
use crate::jit::emitter as asm;
use crate::jit::emitter::Label;
use crate::jit::pool::CodeBuffer;
use crate::jit::regs::{Reg, A0, A1, A2, A3, ARGUMENT_REGS, FP, GP, SP, T0, T1, V0};
use crate::jit::stack_map;
use crate::parser::ast::{NodeId, NodeKind, TypeTag, Value};
use crate::runtime::image::RuntimeImage;
use crate::runtime::object;
use crate::sema::symtab::{builtin_ids, SymFlags, SymId, SymKind};

const WORD: i32 = 8;
const ARG_REGS_NR: usize = ARGUMENT_REGS.len();

/// Frame geometry of the callable being compiled.
struct FrameLayout {
    params_nr: usize,
    locals_nr: usize,
    temps_nr: usize,
    has_self: bool,
    /// Entry point only: the global pointer is saved below `fp`
    gp_saved: bool,
    /// Frame slots holding object references (stack maps)
    obj_slots: BitSet,
}

impl FrameLayout {
    fn slots(&self) -> usize {
        self.params_nr + self.locals_nr + self.temps_nr + self.has_self as usize
    }

    fn param_slot(&self, i: usize) -> usize {
        i
    }

    fn local_slot(&self, i: usize) -> usize {
        self.params_nr + i
    }

    fn temp_slot(&self, t: usize) -> usize {
        self.params_nr + self.locals_nr + t
    }

    fn self_slot(&self) -> usize {
        self.params_nr + self.locals_nr + self.temps_nr
    }

    /// fp-relative byte offset of a frame slot.
    fn slot_offset(&self, slot: usize) -> i32 {
        -WORD * (1 + self.gp_saved as i32 + slot as i32)
    }
}

/// Mutable compilation state.
struct Context {
    /// 8-byte slots on the stack beyond the call boundary (an even depth
    /// means the stack pointer is 16-byte aligned)
    stack_depth: i32,
    continue_labels: Vec<Label>,
    break_labels: Vec<Label>,
    frame: FrameLayout,
}

struct Compiler<'a> {
    image: &'a mut RuntimeImage,
    buf: CodeBuffer,
    ctx: Context,
    /// (code offset, reference map) recorded per call site; registered
    /// once the buffer has its final address
    pending_maps: Vec<(usize, BitSet)>,
}

/// Compile the program entry point (the top-level block).
pub fn compile_entrypoint(image: &mut RuntimeImage) -> CodeBuffer {
    let root = image.root;
    let temps = image
        .symtab
        .lookup(image.main_sym)
        .unwrap()
        .storage
        .temps as usize;
    let statics = image.static_memory.as_ptr() as usize;

    let frame = FrameLayout {
        params_nr: 0,
        locals_nr: 0,
        temps_nr: temps,
        has_self: false,
        gp_saved: true,
        obj_slots: BitSet::new(temps),
    };
    let mut c = Compiler::new(image, frame, 1024);

    asm::push(&mut c.buf, FP);
    c.ctx.stack_depth += 1;
    asm::move_(&mut c.buf, FP, SP);
    c.push(GP);
    c.stack_alloc(temps as i32);
    asm::la(&mut c.buf, GP, statics);

    c.expr(root, V0);

    debug_assert_eq!(c.ctx.stack_depth, 3 + temps as i32);
    asm::ld(&mut c.buf, GP, -WORD, FP);
    asm::move_(&mut c.buf, SP, FP);
    asm::pop(&mut c.buf, FP);
    asm::jreturn(&mut c.buf);

    let buf = c.finish();
    addr_store::put(buf.entrypoint(), AddrKind::Function, "<main>");
    buf
}

/// Compile one function, method, or constructor body.
pub fn compile_callable(image: &mut RuntimeImage, sym_id: SymId) -> CodeBuffer {
    let (astref, params, storage, flags, parent) = {
        let sym = image.symtab.lookup(sym_id).expect("callable symbol");
        debug_assert_eq!(sym.kind, SymKind::Function);
        (
            sym.astref.expect("callable without a definition"),
            sym.params.clone(),
            sym.storage,
            sym.flags,
            sym.parent,
        )
    };
    let body = image
        .ast
        .child(astref, 2)
        .expect("callable without a body");

    let is_method = flags.contains(SymFlags::MEMBER) && !flags.contains(SymFlags::CONSTRUCTOR);
    let has_self = flags.contains(SymFlags::MEMBER) || flags.contains(SymFlags::CONSTRUCTOR);

    let params_nr = params.len();
    let locals_nr = storage.vars as usize;
    let temps_nr = storage.temps as usize;

    let mut frame = FrameLayout {
        params_nr,
        locals_nr,
        temps_nr,
        has_self,
        gp_saved: false,
        obj_slots: BitSet::new(params_nr + locals_nr + temps_nr + has_self as usize),
    };

    // reference slots: object-typed parameters and locals, plus self
    for (i, ty) in params.iter().enumerate() {
        if ty.map(TypeTag::canonical) != Some(TypeTag::Int) {
            frame.obj_slots.set(frame.param_slot(i));
        }
    }
    let local_owner = if flags.contains(SymFlags::CONSTRUCTOR) {
        parent.unwrap_or(sym_id)
    } else {
        sym_id
    };
    let locals: Vec<(usize, Option<TypeTag>)> = image
        .symtab
        .user_symbols()
        .filter(|s| {
            s.parent == Some(local_owner)
                && s.kind == SymKind::Variable
                && !s.flags.contains(SymFlags::PARAM)
                && !s.flags.contains(SymFlags::MEMBER)
        })
        .map(|s| (s.offset as usize, s.ty))
        .collect();
    for (offset, ty) in locals {
        if offset < locals_nr && ty.map(TypeTag::canonical) != Some(TypeTag::Int) {
            frame.obj_slots.set(frame.local_slot(offset));
        }
    }
    if has_self {
        frame.obj_slots.set(frame.self_slot());
    }

    let mut c = Compiler::new(image, frame, 512);

    // prologue
    asm::push(&mut c.buf, FP);
    c.ctx.stack_depth += 1;
    asm::move_(&mut c.buf, FP, SP);
    c.stack_alloc(c.ctx.frame.slots() as i32);

    // spill incoming arguments into their frame slots
    let reg_shift = is_method as usize; // receiver occupies a0
    if is_method {
        let offset = c.ctx.frame.slot_offset(c.ctx.frame.self_slot());
        asm::sd(&mut c.buf, A0, offset, FP);
    }
    for i in 0..params_nr {
        let slot = c.ctx.frame.slot_offset(c.ctx.frame.param_slot(i));
        let pos = i + reg_shift;
        if pos < ARG_REGS_NR {
            asm::sd(&mut c.buf, ARGUMENT_REGS[pos], slot, FP);
        } else {
            // stack-passed: above the return address and saved fp
            let incoming = 2 * WORD + WORD * (pos - ARG_REGS_NR) as i32;
            asm::ld(&mut c.buf, T0, incoming, FP);
            asm::sd(&mut c.buf, T0, slot, FP);
        }
    }

    c.expr(body, V0);

    // fall-off-the-end epilogue (explicit returns emit their own)
    c.emit_epilogue();

    c.finish()
}

impl<'a> Compiler<'a> {
    fn new(image: &'a mut RuntimeImage, frame: FrameLayout, expected_size: usize) -> Compiler<'a> {
        Compiler {
            image,
            buf: CodeBuffer::new(expected_size),
            ctx: Context {
                stack_depth: 1, // the return address
                continue_labels: Vec::new(),
                break_labels: Vec::new(),
                frame,
            },
            pending_maps: Vec::new(),
        }
    }

    /// Terminate the buffer and register the collected stack maps
    /// against their final addresses.
    fn finish(mut self) -> CodeBuffer {
        self.buf.terminate();
        let base = self.buf.entrypoint();
        for (offset, map) in self.pending_maps.drain(..) {
            stack_map::put(unsafe { base.add(offset) } as *const u8, map);
        }
        self.buf
    }

    // ------------------------------------------------------------------
    // Small emission helpers
    // ------------------------------------------------------------------

    fn push(&mut self, reg: Reg) {
        asm::push(&mut self.buf, reg);
        self.ctx.stack_depth += 1;
    }

    fn pop(&mut self, reg: Reg) {
        asm::pop(&mut self.buf, reg);
        self.ctx.stack_depth -= 1;
    }

    fn stack_alloc(&mut self, slots: i32) {
        if slots != 0 {
            asm::subi(&mut self.buf, SP, WORD * slots);
            self.ctx.stack_depth += slots;
        }
    }

    fn stack_free(&mut self, slots: i32) {
        if slots != 0 {
            asm::addi(&mut self.buf, SP, WORD * slots);
            self.ctx.stack_depth -= slots;
        }
    }

    fn emit_epilogue(&mut self) {
        asm::move_(&mut self.buf, SP, FP);
        asm::pop(&mut self.buf, FP);
        asm::jreturn(&mut self.buf);
    }

    /// Call a host helper through `v0`, inserting an alignment filler
    /// when the current depth is odd. Arguments must already be loaded.
    fn call_helper(&mut self, addr: usize) {
        let filler = self.ctx.stack_depth % 2 != 0;
        if filler {
            self.stack_alloc(1);
        }
        asm::la(&mut self.buf, V0, addr);
        asm::jalr(&mut self.buf, V0);
        if filler {
            self.stack_free(1);
        }
    }

    /// Call into the fail helper with a line number and a message.
    /// Follows the guard branch that skips it.
    fn emit_fail(&mut self, line: u32, msg: &'static str) {
        asm::li(&mut self.buf, A0, line as i64);
        asm::la(&mut self.buf, A1, msg.as_ptr() as usize);
        asm::li(&mut self.buf, A2, msg.len() as i64);
        self.call_helper(object::fail_at as usize);
    }

    /// Record the reference map for the call that just ended.
    fn record_stack_map(&mut self) {
        self.pending_maps
            .push((self.buf.len(), self.ctx.frame.obj_slots.clone()));
    }

    // ------------------------------------------------------------------
    // Node plumbing
    // ------------------------------------------------------------------

    fn kind(&self, node: NodeId) -> NodeKind {
        self.image.ast.node(node).kind
    }

    fn child(&self, node: NodeId, i: usize) -> Option<NodeId> {
        self.image.ast.child(node, i)
    }

    fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.image
            .ast
            .node(node)
            .children
            .iter()
            .flatten()
            .copied()
            .collect()
    }

    fn line(&self, node: NodeId) -> u32 {
        self.image.ast.node(node).line
    }

    fn node_ty(&self, node: NodeId) -> TypeTag {
        self.image
            .ast
            .node(node)
            .ty
            .map(TypeTag::canonical)
            .unwrap_or(TypeTag::Obj)
    }

    fn sym_of(&self, node: NodeId) -> Option<SymId> {
        self.image.ast.node(node).sym
    }

    /// Value literals, `null`, and resolved identifiers can be
    /// (re)computed into any register without scratch space.
    fn is_simple(&self, node: NodeId) -> bool {
        self.kind(node).is_value() || self.kind(node) == NodeKind::Null
    }

    fn ice(&self, node: NodeId, what: &str) -> ! {
        panic!(
            "baseline compiler: unsupported AST fragment ({:?}, {}) in line {}",
            self.kind(node),
            what,
            self.line(node)
        );
    }

    /// Base register and byte offset addressing a variable.
    fn var_address(&self, sym_id: SymId) -> (Reg, i32) {
        if sym_id == builtin_ids::OP_SELF {
            return (FP, self.ctx.frame.slot_offset(self.ctx.frame.self_slot()));
        }
        let sym = self.image.symtab.lookup(sym_id).expect("variable symbol");
        if sym.is_static() {
            (GP, WORD * sym.offset)
        } else if sym.flags.contains(SymFlags::PARAM) {
            (
                FP,
                self.ctx
                    .frame
                    .slot_offset(self.ctx.frame.param_slot(sym.offset as usize)),
            )
        } else {
            (
                FP,
                self.ctx
                    .frame
                    .slot_offset(self.ctx.frame.local_slot(sym.offset as usize)),
            )
        }
    }

    fn temp_offset(&self, temp: i32) -> i32 {
        debug_assert!(temp >= 0);
        self.ctx.frame.slot_offset(self.ctx.frame.temp_slot(temp as usize))
    }

    // ------------------------------------------------------------------
    // Expression and statement translation
    // ------------------------------------------------------------------

    fn expr(&mut self, node: NodeId, dest: Reg) {
        match self.kind(node) {
            NodeKind::IntLit => {
                let Some(Value::Int(v)) = self.image.ast.node(node).value else {
                    self.ice(node, "int literal without value");
                };
                asm::li(&mut self.buf, dest, v);
            }

            NodeKind::StrLit => {
                // literals are interned on the heap at compile time
                let text = match &self.image.ast.node(node).value {
                    Some(Value::Str(s)) => s.clone(),
                    _ => self.ice(node, "string literal without value"),
                };
                let obj = self.image.allocate_string(text.as_bytes());
                addr_store::put(obj as *const u8, AddrKind::StringLiteral, &text);
                asm::la(&mut self.buf, dest, obj as usize);
            }

            NodeKind::IdRef => {
                let Some(sym_id) = self.sym_of(node) else {
                    self.ice(node, "unresolved identifier");
                };
                let (base, offset) = self.var_address(sym_id);
                if self.image.ast.node(node).is_lvalue() {
                    // only the address is wanted
                    asm::li(&mut self.buf, dest, offset as i64);
                    asm::add(&mut self.buf, dest, base);
                } else {
                    asm::ld(&mut self.buf, dest, offset, base);
                }
            }

            NodeKind::Null => asm::li(&mut self.buf, dest, 0),

            NodeKind::VarDecl => {
                if self.child(node, 1).is_none() {
                    return; // no initialiser
                }
                self.compile_store(node, dest);
            }
            NodeKind::Assign => self.compile_store(node, dest),

            NodeKind::ArrayVal => self.compile_array_literal(node, dest),
            NodeKind::ArraySub => self.compile_array_subscript(node, dest),

            NodeKind::If => {
                let cond = self.child(node, 0).unwrap_or_else(|| self.ice(node, "if"));
                self.expr(cond, V0);
                let false_label = asm::beqz(&mut self.buf, V0);
                let then = self.child(node, 1).unwrap_or_else(|| self.ice(node, "if"));
                self.expr(then, V0);
                if let Some(els) = self.child(node, 2) {
                    let end_label = asm::j(&mut self.buf);
                    asm::set_label_here(&mut self.buf, &false_label);
                    self.expr(els, V0);
                    asm::set_label_here(&mut self.buf, &end_label);
                } else {
                    asm::set_label_here(&mut self.buf, &false_label);
                }
            }

            NodeKind::While => self.compile_while(node),

            NodeKind::Continue => {
                let label = asm::j(&mut self.buf);
                self.ctx.continue_labels.push(label);
            }

            NodeKind::Break => {
                let label = asm::j(&mut self.buf);
                self.ctx.break_labels.push(label);
            }

            NodeKind::Return => {
                match self.child(node, 0) {
                    Some(value) => self.expr(value, V0),
                    None => asm::li(&mut self.buf, V0, 0),
                }
                self.emit_epilogue();
            }

            NodeKind::FunApp | NodeKind::NewInstance => self.compile_call(node, dest),
            NodeKind::MethodApp => self.compile_method_call(node, dest),
            NodeKind::Member => self.compile_member_read(node, dest),

            NodeKind::Block => {
                for child in self.children(node) {
                    self.expr(child, dest);
                }
            }

            NodeKind::Skip => {}

            // lazily compiled through their trampolines
            NodeKind::FunDef | NodeKind::ClassDef => {}

            NodeKind::IsInstance => {
                let value = self.child(node, 0).unwrap_or_else(|| self.ice(node, "is"));
                let class_node = self.child(node, 1).unwrap_or_else(|| self.ice(node, "is"));
                let Some(class_sym) = self.sym_of(class_node) else {
                    self.ice(node, "unresolved class in `is`");
                };
                let desc = self.class_descriptor_address(class_sym);

                // null is an instance of nothing; otherwise compare the
                // class word against the descriptor address
                self.expr(value, T1);
                let null_label = asm::beqz(&mut self.buf, T1);
                asm::ld(&mut self.buf, T1, 0, T1);
                asm::la(&mut self.buf, T0, desc as usize);
                asm::seq(&mut self.buf, dest, T0, T1);
                let end_label = asm::j(&mut self.buf);
                asm::set_label_here(&mut self.buf, &null_label);
                asm::li(&mut self.buf, dest, 0);
                asm::set_label_here(&mut self.buf, &end_label);
            }

            _ => self.ice(node, "expression"),
        }
    }

    /// `rhs → v0; push; lvalue address → v0; pop; store` — with member
    /// targets routed through the field-write helpers instead.
    fn compile_store(&mut self, node: NodeId, _dest: Reg) {
        let lhs = self.child(node, 0).unwrap_or_else(|| self.ice(node, "assignment"));
        let rhs = self.child(node, 1).unwrap_or_else(|| self.ice(node, "assignment"));

        if self.kind(lhs) == NodeKind::Member {
            // receiver first, value second, then the write helper
            let receiver = self.child(lhs, 0).unwrap_or_else(|| self.ice(lhs, "member"));
            let member = self.child(lhs, 1).unwrap_or_else(|| self.ice(lhs, "member"));
            let selector = self.selector_of(member);
            let line = self.line(lhs);
            let value_ty = self.node_ty(rhs);

            self.expr(receiver, V0);
            self.push(V0);
            self.expr(rhs, V0);
            asm::move_(&mut self.buf, A3, V0);
            self.pop(A0);
            asm::li(&mut self.buf, A1, selector as i64);
            asm::li(&mut self.buf, A2, line as i64);
            let helper = if value_ty == TypeTag::Int {
                object::object_write_field_int as usize
            } else {
                object::object_write_field_obj as usize
            };
            self.call_helper(helper);
            return;
        }

        self.expr(rhs, V0);
        self.push(V0);
        self.expr(lhs, V0); // lvalue: leaves the address
        self.pop(T0);
        asm::sd(&mut self.buf, T0, 0, V0);
    }

    fn compile_while(&mut self, node: NodeId) {
        let cond = self.child(node, 0).unwrap_or_else(|| self.ice(node, "while"));
        let body = self.child(node, 1).unwrap_or_else(|| self.ice(node, "while"));

        let loop_top = self.buf.len();
        self.expr(cond, V0);
        let exit_label = asm::beqz(&mut self.buf, V0);

        // give the body fresh break/continue lists
        let saved_continue = std::mem::take(&mut self.ctx.continue_labels);
        let saved_break = std::mem::take(&mut self.ctx.break_labels);

        self.expr(body, V0);
        let back_label = asm::j(&mut self.buf);
        asm::set_label_to(&mut self.buf, &back_label, loop_top);

        let exit_target = self.buf.len();
        asm::set_label_to(&mut self.buf, &exit_label, exit_target);
        for label in std::mem::take(&mut self.ctx.continue_labels) {
            asm::set_label_to(&mut self.buf, &label, loop_top);
        }
        for label in std::mem::take(&mut self.ctx.break_labels) {
            asm::set_label_to(&mut self.buf, &label, exit_target);
        }

        self.ctx.continue_labels = saved_continue;
        self.ctx.break_labels = saved_break;
    }

    fn compile_array_literal(&mut self, node: NodeId, dest: Reg) {
        let list = self.child(node, 0).unwrap_or_else(|| self.ice(node, "array"));
        let elements = self.children(list);
        let line = self.line(node);

        if let Some(size) = self.child(node, 1) {
            self.expr(size, A0);
            if !self.image.options.no_bounds_checks {
                asm::li(&mut self.buf, T0, elements.len() as i64);
                let ok = asm::ble(&mut self.buf, T0, A0);
                self.emit_fail(
                    line,
                    "Requested array size is smaller than number of array elements",
                );
                asm::set_label_here(&mut self.buf, &ok);
            }
        } else {
            asm::li(&mut self.buf, A0, elements.len() as i64);
        }
        self.call_helper(object::new_array as usize);

        // the array base stays on the stack while elements are filled in
        self.push(V0);
        for (i, element) in elements.iter().enumerate() {
            self.expr(*element, T0);
            if !self.is_simple(*element) {
                asm::ld(&mut self.buf, V0, 0, SP);
            }
            asm::sd(
                &mut self.buf,
                T0,
                2 * WORD + WORD * i as i32, // class word + length word
                V0,
            );
        }
        self.pop(dest);
    }

    fn compile_array_subscript(&mut self, node: NodeId, dest: Reg) {
        let receiver = self.child(node, 0).unwrap_or_else(|| self.ice(node, "subscript"));
        let index = self.child(node, 1).unwrap_or_else(|| self.ice(node, "subscript"));
        let line = self.line(node);
        let array_class = self.image.classes.array.address();

        self.expr(receiver, V0);
        let nonnull = asm::bnez(&mut self.buf, V0);
        self.emit_fail(line, "Attempted to index null");
        asm::set_label_here(&mut self.buf, &nonnull);

        asm::la(&mut self.buf, T1, array_class as usize);
        asm::ld(&mut self.buf, T0, 0, V0);
        let is_array = asm::beq(&mut self.buf, T0, T1);
        self.emit_fail(line, "Attempted to index non-array");
        asm::set_label_here(&mut self.buf, &is_array);

        self.push(V0);
        self.expr(index, T0);
        self.pop(V0);

        if !self.image.options.no_bounds_checks {
            asm::ld(&mut self.buf, T1, WORD, V0); // length
            let non_negative = asm::bgez(&mut self.buf, T0);
            self.emit_fail(line, "Negative index into array");
            asm::set_label_here(&mut self.buf, &non_negative);

            let in_bounds = asm::blt(&mut self.buf, T0, T1);
            self.emit_fail(line, "Index into array out of bounds");
            asm::set_label_here(&mut self.buf, &in_bounds);
        }

        asm::slli(&mut self.buf, T0, T0, 3);
        asm::add(&mut self.buf, V0, T0);

        if self.image.ast.node(node).is_lvalue() {
            asm::addi(&mut self.buf, V0, 2 * WORD); // past class and length
            asm::optmove(&mut self.buf, dest, V0);
        } else {
            asm::ld(&mut self.buf, dest, 2 * WORD, V0);
        }
    }

    /// Function call, instantiation, or builtin operator.
    fn compile_call(&mut self, node: NodeId, dest: Reg) {
        let Some(sym_id) = self.sym_of(node).or_else(|| {
            self.child(node, 0).and_then(|callee| self.sym_of(callee))
        }) else {
            self.ice(node, "unresolved callee");
        };
        let (is_hidden_builtin, target_sym) = {
            let sym = self.image.symtab.lookup(sym_id).expect("callee symbol");
            let hidden = sym.id.is_builtin() && sym.flags.contains(SymFlags::HIDDEN);
            // instantiation routes through the class's constructor
            let target = if sym.kind == SymKind::Class {
                sym.constructor.unwrap_or_else(|| self.ice(node, "class without constructor"))
            } else {
                sym_id
            };
            (hidden, target)
        };

        let actuals = self.child(node, 1).unwrap_or_else(|| self.ice(node, "call"));
        let args = self.children(actuals);

        if is_hidden_builtin {
            self.compile_builtin_op(node, sym_id, &args, dest);
            return;
        }

        let frame_size = self.prepare_arguments(&args, 0, true);

        let code = self.image.symtab.lookup(target_sym).unwrap().code;
        if code.is_null() {
            self.ice(node, "callee has no code address");
        }
        asm::la(&mut self.buf, V0, code as usize);
        asm::jalr(&mut self.buf, V0);
        self.record_stack_map();

        self.stack_free(frame_size);
        asm::optmove(&mut self.buf, dest, V0);
    }

    /// `receiver.m(args)`: resolve through the class's selector table at
    /// run time, then call through the vtable entry.
    fn compile_method_call(&mut self, node: NodeId, dest: Reg) {
        let receiver = self.child(node, 0).unwrap_or_else(|| self.ice(node, "method call"));
        let selector_node = self.child(node, 1).unwrap_or_else(|| self.ice(node, "method call"));
        let actuals = self.child(node, 2).unwrap_or_else(|| self.ice(node, "method call"));
        let args = self.children(actuals);
        let line = self.line(node);
        let selector = self.selector_of(selector_node);

        let method_temp = self.image.ast.node(node).storage;
        let receiver_temp = self.image.ast.node(selector_node).storage;
        if method_temp < 0 || receiver_temp < 0 {
            self.ice(node, "method call without temporaries");
        }
        let method_off = self.temp_offset(method_temp);
        let receiver_off = self.temp_offset(receiver_temp);

        // receiver into its temporary
        self.expr(receiver, V0);
        asm::sd(&mut self.buf, V0, receiver_off, FP);

        // resolve the method before any argument registers are loaded
        asm::move_(&mut self.buf, A0, V0);
        asm::li(&mut self.buf, A1, selector as i64);
        asm::li(&mut self.buf, A2, args.len() as i64);
        asm::li(&mut self.buf, A3, line as i64);
        self.call_helper(object::object_method_lookup as usize);
        asm::sd(&mut self.buf, V0, method_off, FP);

        // arguments shift right by one: the receiver is argument zero
        let frame_size = self.prepare_arguments(&args, 1, true);

        asm::ld(&mut self.buf, A0, receiver_off, FP);
        asm::ld(&mut self.buf, V0, method_off, FP);
        asm::jalr(&mut self.buf, V0);
        self.record_stack_map();

        self.stack_free(frame_size);
        asm::optmove(&mut self.buf, dest, V0);
    }

    /// Field read through the runtime helpers (type-directed: the node's
    /// static type picks the int or object view).
    fn compile_member_read(&mut self, node: NodeId, dest: Reg) {
        let receiver = self.child(node, 0).unwrap_or_else(|| self.ice(node, "member"));
        let member = self.child(node, 1).unwrap_or_else(|| self.ice(node, "member"));
        let selector = self.selector_of(member);
        let line = self.line(node);

        self.expr(receiver, A0);
        asm::li(&mut self.buf, A1, selector as i64);
        asm::li(&mut self.buf, A2, line as i64);
        let helper = if self.node_ty(node) == TypeTag::Int {
            object::object_read_field_int as usize
        } else {
            object::object_read_field_obj as usize
        };
        self.call_helper(helper);
        asm::optmove(&mut self.buf, dest, V0);
    }

    fn selector_of(&self, member_node: NodeId) -> u16 {
        let Some(sym_id) = self.sym_of(member_node) else {
            self.ice(member_node, "unresolved selector");
        };
        let selector = self.image.symtab.lookup(sym_id).map(|s| s.selector).unwrap_or(0);
        if selector == 0 {
            self.ice(member_node, "symbol without selector");
        }
        selector
    }

    /// Descriptor address of a class, creating user descriptors on first
    /// need (builtin classes are always present).
    fn class_descriptor_address(&mut self, class_sym: SymId) -> *const u8 {
        if class_sym.is_builtin() {
            let code = self.image.symtab.lookup(class_sym).map(|s| s.code);
            match code {
                Some(code) if !code.is_null() => code as *const u8,
                _ => panic!("builtin class without descriptor"),
            }
        } else {
            self.image.ensure_class_descriptor(class_sym)
        }
    }

    // ------------------------------------------------------------------
    // Builtin operators
    // ------------------------------------------------------------------

    fn compile_builtin_op(&mut self, node: NodeId, op: SymId, args: &[NodeId], dest: Reg) {
        use builtin_ids::*;

        match op {
            OP_ADD | OP_MUL => {
                let frame_size = self.prepare_arguments(args, 0, false);
                self.stack_free(frame_size);
                if dest == A0 {
                    if op == OP_ADD {
                        asm::add(&mut self.buf, A0, A1);
                    } else {
                        asm::mul(&mut self.buf, A0, A1);
                    }
                } else {
                    if op == OP_ADD {
                        asm::add(&mut self.buf, A1, A0);
                    } else {
                        asm::mul(&mut self.buf, A1, A0);
                    }
                    asm::optmove(&mut self.buf, dest, A1);
                }
            }

            OP_SUB => {
                let frame_size = self.prepare_arguments(args, 0, false);
                self.stack_free(frame_size);
                asm::sub(&mut self.buf, A0, A1);
                asm::optmove(&mut self.buf, dest, A0);
            }

            OP_DIV => {
                // dividend in v0, divisor in t0; the sign extension
                // clobbers a2, so no argument registers are used
                self.expr(args[0], V0);
                self.push(V0);
                self.expr(args[1], T0);
                self.pop(V0);
                asm::div_v0(&mut self.buf, T0);
                asm::optmove(&mut self.buf, dest, V0);
            }

            OP_TEST_EQ => {
                let frame_size = self.prepare_arguments(args, 0, false);
                self.stack_free(frame_size);
                self.compile_builtin_eq(node, args, dest);
            }

            OP_TEST_LE => {
                let frame_size = self.prepare_arguments(args, 0, false);
                self.stack_free(frame_size);
                asm::sle(&mut self.buf, dest, A0, A1);
            }

            OP_TEST_LT => {
                let frame_size = self.prepare_arguments(args, 0, false);
                self.stack_free(frame_size);
                asm::slt(&mut self.buf, dest, A0, A1);
            }

            OP_NOT => {
                let frame_size = self.prepare_arguments(args, 0, false);
                self.stack_free(frame_size);
                asm::not(&mut self.buf, dest, A0);
            }

            OP_CONVERT => self.compile_builtin_convert(node, args[0], dest),

            OP_ALLOCATE => self.compile_builtin_allocate(node, args, dest),

            _ => self.ice(node, "builtin operator"),
        }
    }

    /// `convert(T₁ → T₂)`: identity on equal types, boxing for int→obj,
    /// checked unboxing for obj→int.
    fn compile_builtin_convert(&mut self, node: NodeId, arg: NodeId, dest: Reg) {
        let to_ty = self.node_ty(node);
        let from_ty = self.node_ty(arg);
        let line = self.line(node);

        self.expr(arg, A0);

        match (from_ty, to_ty) {
            (TypeTag::Int, TypeTag::Int) | (TypeTag::Obj, TypeTag::Obj) => {
                asm::optmove(&mut self.buf, dest, A0);
            }
            (TypeTag::Int, TypeTag::Obj) => {
                self.call_helper(object::new_int as usize);
                asm::optmove(&mut self.buf, dest, V0);
            }
            (TypeTag::Obj, TypeTag::Int) => {
                let boxed_int = self.image.classes.boxed_int.address();
                let fail_label = asm::beqz(&mut self.buf, A0);
                asm::ld(&mut self.buf, T0, 0, A0);
                asm::la(&mut self.buf, T1, boxed_int as usize);
                let ok_label = asm::beq(&mut self.buf, T0, T1);
                asm::set_label_here(&mut self.buf, &fail_label);
                self.emit_fail(line, "attempted to convert non-Int object to int");
                asm::set_label_here(&mut self.buf, &ok_label);
                asm::ld(&mut self.buf, dest, WORD, A0); // the boxed value
            }
            _ => self.ice(node, "unsupported conversion"),
        }
    }

    fn compile_builtin_allocate(&mut self, node: NodeId, args: &[NodeId], dest: Reg) {
        // the argument is the class id, known at compile time
        let class_sym = match self.image.ast.node(args[0]).value {
            Some(Value::Int(id)) => SymId::from_raw(id as i32),
            _ => self.ice(node, "allocate without class id"),
        };
        let fields_nr = self
            .image
            .symtab
            .lookup(class_sym)
            .map(|s| s.storage.fields)
            .unwrap_or_else(|| self.ice(node, "allocate of unknown class"));
        let desc = self.class_descriptor_address(class_sym);

        asm::la(&mut self.buf, A0, desc as usize);
        asm::li(&mut self.buf, A1, fields_nr as i64);
        self.call_helper(object::new_object as usize);
        asm::optmove(&mut self.buf, dest, V0);
    }

    /// Equality: equal scalar types compare directly; otherwise both
    /// sides are promoted to objects (an int side is boxed into a
    /// temporary object on the machine stack) and compared by the
    /// object-equality helper.
    fn compile_builtin_eq(&mut self, _node: NodeId, args: &[NodeId], dest: Reg) {
        let mut a0_ty = self.node_ty(args[0]);
        let mut a1_ty = self.node_ty(args[1]);

        let mut temp_object = false;
        if a0_ty != a1_ty && (a0_ty == TypeTag::Int || a1_ty == TypeTag::Int) {
            let conv_reg = if a0_ty == TypeTag::Int {
                a0_ty = TypeTag::Obj;
                A0
            } else {
                a1_ty = TypeTag::Obj;
                A1
            };
            temp_object = true;
            // a boxed int that lives on the stack just for this compare
            let boxed_int = self.image.classes.boxed_int.address();
            self.push(conv_reg);
            asm::la(&mut self.buf, conv_reg, boxed_int as usize);
            self.push(conv_reg);
            asm::move_(&mut self.buf, conv_reg, SP);
        }

        match (a0_ty, a1_ty) {
            (TypeTag::Int, TypeTag::Int) => {
                asm::seq(&mut self.buf, dest, A0, A1);
            }
            (TypeTag::Obj, TypeTag::Obj) => {
                self.call_helper(object::obj_test_eq as usize);
                asm::optmove(&mut self.buf, dest, V0);
            }
            _ => self.ice(args[0], "equality on unsupported types"),
        }

        if temp_object {
            self.stack_free(2);
        }
    }

    // ------------------------------------------------------------------
    // Argument preparation (§calling convention)
    // ------------------------------------------------------------------

    /// Prepare call arguments: overflow arguments on the stack in
    /// ascending order, one spill slot per non-trivial register argument
    /// that a later evaluation would clobber, plus an alignment filler
    /// when required. Returns the stack-frame size (in slots) still
    /// allocated at the call boundary; the caller frees it after the
    /// call.
    ///
    /// `first_arg` shifts every argument right (method calls reserve
    /// argument zero for the receiver).
    fn prepare_arguments(&mut self, args: &[NodeId], first_arg: usize, mustalign: bool) -> i32 {
        let total = first_arg + args.len();
        let stack_args_nr = total.saturating_sub(ARG_REGS_NR);
        let stack_frame_active =
            (mustalign && self.ctx.stack_depth % 2 != 0) || stack_args_nr > 0;

        // spill space for non-trivial register arguments, minus the last
        // one (its value is still fresh at load time)
        let mut backup_space = 0usize;
        let mut last_nonsimple: Option<usize> = None;
        for (i, &arg) in args.iter().enumerate() {
            if !self.is_simple(arg) {
                last_nonsimple = Some(i);
                if first_arg + i < ARG_REGS_NR {
                    backup_space += 1;
                }
            }
        }
        if backup_space > 0 {
            if let Some(last) = last_nonsimple {
                if first_arg + last < ARG_REGS_NR {
                    backup_space -= 1;
                }
            }
        }

        let spill_area = stack_args_nr;
        let mut frame_size = (backup_space + stack_args_nr) as i32;
        if stack_frame_active && (frame_size + self.ctx.stack_depth) % 2 != 0 {
            frame_size += 1; // alignment filler
        }

        self.stack_alloc(frame_size);

        // non-trivial values and stack-passed values, in source order
        let mut spill_counter = 0usize;
        for (i, &arg) in args.iter().enumerate() {
            let pos = first_arg + i;
            let reg = if pos < ARG_REGS_NR {
                ARGUMENT_REGS[pos]
            } else {
                V0
            };
            if pos >= ARG_REGS_NR || !self.is_simple(arg) {
                self.expr(arg, reg);
                let dest_slot = if pos >= ARG_REGS_NR {
                    pos - ARG_REGS_NR
                } else {
                    let slot = spill_area + spill_counter;
                    spill_counter += 1;
                    slot
                };
                if last_nonsimple != Some(i) || pos >= ARG_REGS_NR {
                    asm::sd(&mut self.buf, reg, WORD * dest_slot as i32, SP);
                }
            }
        }

        // trivial register arguments, and reloads of the spilled ones
        let mut spill_counter = 0usize;
        for (i, &arg) in args.iter().enumerate() {
            let pos = first_arg + i;
            if pos >= ARG_REGS_NR {
                break;
            }
            if self.is_simple(arg) {
                self.expr(arg, ARGUMENT_REGS[pos]);
            } else if last_nonsimple != Some(i) {
                asm::ld(
                    &mut self.buf,
                    ARGUMENT_REGS[pos],
                    WORD * (spill_area + spill_counter) as i32,
                    SP,
                );
                spill_counter += 1;
            }
        }

        if !stack_frame_active {
            self.stack_free(frame_size);
            return 0;
        }
        frame_size
    }
}
