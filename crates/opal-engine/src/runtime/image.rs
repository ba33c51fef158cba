//! Runtime image: pipeline driver, loader, and teardown
//!
//! The image aggregates everything a compiled program needs: symbol
//! table, AST arena, builtin and user class descriptors, heap, static
//! memory, the dynamic-compiler entry, the trampoline buffer, and the
//! compiled entry point.
//!
//! Pipeline order: name analysis → type analysis → data-flow
//! (definite assignment) → stack-map init → dynamic-compiler entry →
//! trampolines → heap → baseline compile of the entry point. A pass
//! that reports errors stops the pipeline; the builder then returns no
//! image.
//!
//! One image at a time is *installed* as the process-wide current
//! image; the `extern "C"` runtime helpers reach heap, classes, and
//! symbols through it. Installation happens for compilation (string
//! literals are interned on the heap at compile time) and again for
//! execution.

use crate::analysis::definite_assignment::check_definite_assignment;
use crate::error::EngineError;
use crate::jit::{baseline, dyncomp, pool::CodeBuffer, stack_map};
use crate::options::CompilerOptions;
use crate::parser::ast::{Ast, NodeId, NodeKind};
use crate::parser::{Lexer, Parser};
use crate::runtime::class::{BuiltinClasses, ClassDesc};
use crate::runtime::heap::Heap;
use crate::runtime::object;
use crate::sema::diag::Diagnostics;
use crate::sema::names::name_analysis;
use crate::sema::symtab::{builtin_ids, SymFlags, SymId, SymKind, SymbolTable};
use crate::sema::types::type_analysis;
use std::sync::atomic::{AtomicPtr, Ordering};

/// How far to drive the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RuntimeAction {
    /// Parse only
    Parse,
    NameAnalysis,
    TypeAnalysis,
    /// All semantic passes, including data-flow
    SemanticAnalysis,
    /// Everything: the image is executable afterwards
    Compile,
}

/// The assembled program.
#[derive(Debug)]
pub struct RuntimeImage {
    pub symtab: SymbolTable,
    pub ast: Ast,
    pub root: NodeId,
    pub main_sym: SymId,
    pub options: CompilerOptions,
    /// Builtin class descriptors (addresses compiled into code)
    pub classes: BuiltinClasses,
    /// User class descriptors, created on first need
    pub user_classes: Vec<Box<ClassDesc>>,
    pub heap: Heap,
    /// One word per global, addressed through the global pointer
    pub static_memory: Vec<u64>,
    /// Top-level functions and synthesised constructors
    pub callables: Vec<NodeId>,
    pub class_nodes: Vec<NodeId>,
    /// Entry-point code
    code: Option<CodeBuffer>,
    /// Generic dynamic-compiler entry stub
    dyncomp: Option<CodeBuffer>,
    /// Per-callable trampolines
    trampolines: Option<CodeBuffer>,
    /// Per-class method trampoline buffers
    pub class_trampolines: Vec<CodeBuffer>,
    /// Buffers of lazily compiled bodies
    pub body_buffers: Vec<CodeBuffer>,
    main_entry: *const u8,
}

static CURRENT: AtomicPtr<RuntimeImage> = AtomicPtr::new(std::ptr::null_mut());

/// The installed image.
///
/// Panics when no image is installed. The returned reference is only
/// valid for the synchronous extent of one runtime-helper call; the
/// single-threaded execution model guarantees exclusivity.
pub(crate) fn current() -> &'static mut RuntimeImage {
    unsafe {
        CURRENT
            .load(Ordering::Acquire)
            .as_mut()
            .expect("no runtime image installed")
    }
}

fn install(image: &mut RuntimeImage) {
    CURRENT.store(image, Ordering::Release);
}

impl RuntimeImage {
    /// Run the full pipeline and return an executable image.
    pub fn prepare(
        source: &str,
        options: CompilerOptions,
    ) -> Result<Box<RuntimeImage>, EngineError> {
        RuntimeImage::prepare_with_action(source, options, RuntimeAction::Compile)
    }

    /// Run the pipeline up to `action`.
    pub fn prepare_with_action(
        source: &str,
        options: CompilerOptions,
        action: RuntimeAction,
    ) -> Result<Box<RuntimeImage>, EngineError> {
        let mut symtab = SymbolTable::new();

        let lexer = Lexer::tokenize(source, &mut symtab.interner).map_err(|e| {
            EngineError::Parse {
                line: e.line,
                message: e.message,
            }
        })?;
        let mut ast = Ast::new();
        let root = Parser::new(&lexer, &mut ast, &symtab.interner)
            .parse_program()
            .map_err(|e| EngineError::Parse {
                line: e.line,
                message: e.message,
            })?;

        let classes = BuiltinClasses::install(&mut symtab);

        // builtin functions are entered directly, without trampolines
        symtab.lookup_mut(builtin_ids::FN_PRINT).unwrap().code =
            object::builtin_print as *mut u8;
        symtab.lookup_mut(builtin_ids::FN_ASSERT).unwrap().code =
            object::builtin_assert as *mut u8;
        symtab
            .lookup_mut(builtin_ids::METHOD_STRING_SIZE)
            .unwrap()
            .code = object::builtin_string_size as *mut u8;
        symtab
            .lookup_mut(builtin_ids::METHOD_ARRAY_SIZE)
            .unwrap()
            .code = object::builtin_array_size as *mut u8;

        let main_name = symtab.interner.intern("<main>");
        let main_sym = symtab.new_symbol(
            SymKind::Function,
            SymFlags::HIDDEN,
            None,
            main_name,
            Some(root),
        );

        let heap = Heap::new(options.heap_size);
        let mut image = Box::new(RuntimeImage {
            symtab,
            ast,
            root,
            main_sym,
            options,
            classes,
            user_classes: Vec::new(),
            heap,
            static_memory: Vec::new(),
            callables: Vec::new(),
            class_nodes: Vec::new(),
            code: None,
            dyncomp: None,
            trampolines: None,
            class_trampolines: Vec::new(),
            body_buffers: Vec::new(),
            main_entry: std::ptr::null(),
        });

        if action == RuntimeAction::Parse {
            return Ok(image);
        }

        let mut diags = Diagnostics::new();
        name_analysis(
            &mut image.ast,
            image.root,
            &mut image.symtab,
            image.main_sym,
            &mut diags,
        );
        if let Err(e) = report(&diags, "name analysis") {
            return Err(e);
        }
        if action == RuntimeAction::NameAnalysis {
            return Ok(image);
        }

        let program = type_analysis(
            &mut image.ast,
            image.root,
            &mut image.symtab,
            &image.options,
            &mut diags,
        );
        image.callables = program.callables;
        image.class_nodes = program.classes;
        if let Err(e) = report(&diags, "type analysis") {
            return Err(e);
        }
        if action == RuntimeAction::TypeAnalysis {
            return Ok(image);
        }

        // mandatory correctness analysis over every callable body
        check_definite_assignment(&image.ast, image.root, &image.symtab, &mut diags);
        for body in image.callable_bodies() {
            check_definite_assignment(&image.ast, body, &image.symtab, &mut diags);
        }
        if let Err(e) = report(&diags, "data-flow analysis") {
            return Err(e);
        }
        if action == RuntimeAction::SemanticAnalysis {
            return Ok(image);
        }

        // machine-code phase
        stack_map::init();
        let globals_nr = image
            .symtab
            .lookup(image.main_sym)
            .unwrap()
            .storage
            .vars as usize;
        image.static_memory = vec![0; globals_nr.max(1)];

        install(&mut image);
        let dyncomp_buf = dyncomp::build_generic_entry();
        let dyncomp_entry = dyncomp_buf.entrypoint() as *const u8;
        image.dyncomp = Some(dyncomp_buf);

        let callable_syms: Vec<SymId> = image
            .callables
            .iter()
            .filter_map(|&node| image.ast.child(node, 0))
            .filter_map(|name| image.ast.node(name).sym)
            .collect();
        image.trampolines = dyncomp::build_trampolines(
            &mut image.symtab,
            dyncomp_entry,
            &callable_syms,
            image.options.debug_dynamic_compilation,
        );

        let code = baseline::compile_entrypoint(&mut image);
        image.main_entry = code.entrypoint() as *const u8;
        image.code = Some(code);

        Ok(image)
    }

    /// Bodies of all callables: top-level functions, constructors, and
    /// methods (reached through the class nodes).
    pub fn callable_bodies(&self) -> Vec<NodeId> {
        let mut bodies = Vec::new();
        for &callable in &self.callables {
            if let Some(body) = self.ast.child(callable, 2) {
                bodies.push(body);
            }
        }
        for &class in &self.class_nodes {
            let Some(class_body) = self.ast.child(class, 2) else {
                continue;
            };
            for i in 0..self.ast.node(class_body).children.len() {
                let Some(member) = self.ast.child(class_body, i) else {
                    continue;
                };
                if self.ast.node(member).kind == NodeKind::FunDef {
                    if let Some(body) = self.ast.child(member, 2) {
                        bodies.push(body);
                    }
                }
            }
        }
        bodies
    }

    /// Create (once) the runtime descriptor of a user class, together
    /// with the trampolines of its methods, and return its address.
    pub fn ensure_class_descriptor(&mut self, class_sym: SymId) -> *const u8 {
        let existing = self.symtab.lookup(class_sym).map(|s| s.code);
        if let Some(code) = existing {
            if !code.is_null() {
                return code as *const u8;
            }
        }

        // methods need trampolines before the vtable can be filled
        let method_syms: Vec<SymId> = self
            .symtab
            .user_symbols()
            .filter(|s| {
                s.parent == Some(class_sym)
                    && s.kind == SymKind::Function
                    && s.flags.contains(SymFlags::MEMBER)
            })
            .map(|s| s.id)
            .collect();
        let dyncomp_entry = self
            .dyncomp
            .as_ref()
            .expect("dynamic compiler entry not built")
            .entrypoint() as *const u8;
        if let Some(buf) = dyncomp::build_trampolines(
            &mut self.symtab,
            dyncomp_entry,
            &method_syms,
            self.options.debug_dynamic_compilation,
        ) {
            self.class_trampolines.push(buf);
        }

        let desc = ClassDesc::new_user(&mut self.symtab, class_sym);
        let addr = desc.address();
        self.user_classes.push(desc);
        addr
    }

    /// Allocate a string object on the heap: length word, bytes,
    /// NUL terminator, padded to whole words. Used both for
    /// compile-time literal interning and by the `new_string` helper.
    pub fn allocate_string(&mut self, bytes: &[u8]) -> *mut crate::runtime::object::Object {
        let fields_nr = 1 + (bytes.len() + 1).div_ceil(8);
        let class = self.classes.string.address() as *const ClassDesc;
        let obj = self.heap.allocate_object(class, fields_nr);
        unsafe {
            object::set_field(obj, 0, bytes.len() as u64);
            let dst = (obj as *mut u8).add(16);
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len());
            *dst.add(bytes.len()) = 0;
        }
        obj
    }

    /// The compiled entry point, if the image was fully prepared.
    pub fn entry_point(&self) -> Option<*const u8> {
        if self.main_entry.is_null() {
            None
        } else {
            Some(self.main_entry)
        }
    }

    /// Invoke the program's entry point.
    ///
    /// # Panics
    ///
    /// Panics when the image was not prepared up to
    /// [`RuntimeAction::Compile`].
    pub fn execute(&mut self) {
        let entry = self.entry_point().expect("image was not compiled");
        self.static_memory.fill(0);
        install(self);

        // remember where we called from, for the collector's stack walk
        let frame_marker: u64 = 0;
        self.heap.root_frame = &frame_marker as *const u64 as *mut u8;

        let main: extern "C" fn() = unsafe { std::mem::transmute(entry) };
        main();

        self.heap.root_frame = std::ptr::null_mut();
    }

    /// Pretty-print the (possibly rewritten) AST.
    pub fn dump_ast(&self) -> String {
        let mut out = String::new();
        self.ast.dump(self.root, &self.symtab.interner, &mut out);
        out
    }

    /// Dump the symbol table; `include_builtins` adds the negative ids.
    pub fn dump_symtab(&self, include_builtins: bool) -> String {
        let mut out = String::new();
        if include_builtins {
            for sym in self.symtab.builtin_symbols() {
                self.symtab.dump_entry(sym.id, &mut out);
            }
        }
        for sym in self.symtab.user_symbols() {
            self.symtab.dump_entry(sym.id, &mut out);
        }
        out
    }

    /// Dump the control-flow graph of the entry point in DOT format.
    pub fn dump_cfg(&self) -> String {
        crate::analysis::cfg::Cfg::build(&self.ast, self.root).dottify(&self.ast, "main")
    }

    /// Hex dump of the compiled entry point.
    pub fn dump_code(&self) -> String {
        use std::fmt::Write;
        let mut out = String::new();
        if let Some(code) = &self.code {
            for (i, chunk) in code.bytes().chunks(16).enumerate() {
                let _ = write!(out, "{:06x}:", i * 16);
                for byte in chunk {
                    let _ = write!(out, " {:02x}", byte);
                }
                out.push('\n');
            }
        }
        out
    }
}

fn report(diags: &Diagnostics, pass: &'static str) -> Result<(), EngineError> {
    if diags.is_empty() {
        return Ok(());
    }
    for diag in diags.iter() {
        eprintln!("{}", diag);
    }
    Err(EngineError::AnalysisFailed {
        pass,
        errors: diags.len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RUN_LOCK;

    fn prepare(src: &str) -> Box<RuntimeImage> {
        RuntimeImage::prepare(src, CompilerOptions::default()).expect("pipeline failure")
    }

    #[test]
    fn test_analysis_error_yields_no_image() {
        let _guard = RUN_LOCK.lock();
        let err = RuntimeImage::prepare("print(nope);", CompilerOptions::default()).unwrap_err();
        match err {
            EngineError::AnalysisFailed { pass, errors } => {
                assert_eq!(pass, "name analysis");
                assert_eq!(errors, 1);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_parse_error_reported() {
        let _guard = RUN_LOCK.lock();
        let err =
            RuntimeImage::prepare("while (", CompilerOptions::default()).unwrap_err();
        assert!(matches!(err, EngineError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_uninitialised_variable_blocks_image() {
        let _guard = RUN_LOCK.lock();
        let err =
            RuntimeImage::prepare("int x; print(x);", CompilerOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            EngineError::AnalysisFailed {
                pass: "data-flow analysis",
                ..
            }
        ));
    }

    #[test]
    fn test_stage_limited_preparation() {
        let _guard = RUN_LOCK.lock();
        let image = RuntimeImage::prepare_with_action(
            "int x = 1; print(x);",
            CompilerOptions::default(),
            RuntimeAction::SemanticAnalysis,
        )
        .unwrap();
        assert!(image.entry_point().is_none());
        // the AST is dumpable at any stage
        assert!(image.dump_ast().contains("VarDecl"));
        assert!(image.dump_cfg().starts_with("digraph"));
    }

    #[test]
    fn test_trampoline_patched_after_first_call() {
        let _guard = RUN_LOCK.lock();
        let mut image = prepare("int f() { return 1; } print(f()); print(f());");

        let f_sym = image
            .symtab
            .user_symbols()
            .find(|s| {
                s.kind == SymKind::Function && image.symtab.interner.resolve(s.name) == "f"
            })
            .map(|s| s.id)
            .unwrap();
        {
            let sym = image.symtab.lookup(f_sym).unwrap();
            assert!(!sym.flags.contains(SymFlags::COMPILED));
            // before the first call, the code pointer is the trampoline
            assert_eq!(sym.code, sym.trampoline);
        }

        crate::runtime::object::capture_print();
        image.execute();
        assert_eq!(crate::runtime::object::take_captured_print(), "1\n1\n");

        let sym = image.symtab.lookup(f_sym).unwrap();
        assert!(sym.flags.contains(SymFlags::COMPILED));
        assert_ne!(sym.code, sym.trampoline);
        // the trampoline now opens with an unconditional jump to the body
        unsafe {
            assert_eq!(*sym.trampoline, 0xe9);
            let disp = i32::from_le_bytes(std::slice::from_raw_parts(sym.trampoline.add(1), 4).try_into().unwrap());
            let target = sym.trampoline.add(5).offset(disp as isize);
            assert_eq!(target as *const u8, sym.code as *const u8);
        }
    }

    #[test]
    fn test_globals_reset_between_runs() {
        let _guard = RUN_LOCK.lock();
        let mut image = prepare("int x = 0; x := x + 1; print(x);");
        crate::runtime::object::capture_print();
        image.execute();
        assert_eq!(crate::runtime::object::take_captured_print(), "1\n");
        // statics are cleared on every execution
        crate::runtime::object::capture_print();
        image.execute();
        assert_eq!(crate::runtime::object::take_captured_print(), "1\n");
    }

    #[test]
    fn test_class_descriptor_created_lazily() {
        let _guard = RUN_LOCK.lock();
        let mut image = prepare("class C() { int x = 1; } obj a = C(); print(a.x);");
        assert!(image.user_classes.is_empty());
        crate::runtime::object::capture_print();
        image.execute();
        assert_eq!(crate::runtime::object::take_captured_print(), "1\n");
        assert_eq!(image.user_classes.len(), 1);
    }

    #[test]
    fn test_teardown_releases_buffers() {
        let _guard = RUN_LOCK.lock();
        {
            let mut image = prepare("int f() { return 2; } print(f());");
            crate::runtime::object::capture_print();
            image.execute();
            let _ = crate::runtime::object::take_captured_print();
            assert!(!image.body_buffers.is_empty());
        }
        // dropping freed every buffer back to the pool intact
        assert!(crate::jit::pool::verify_free_list());
    }
}

impl Drop for RuntimeImage {
    fn drop(&mut self) {
        // de-install if this image is current
        let me = self as *mut RuntimeImage;
        let _ = CURRENT.compare_exchange(
            me,
            std::ptr::null_mut(),
            Ordering::AcqRel,
            Ordering::Acquire,
        );

        stack_map::clear();
        if let Some(buf) = self.code.take() {
            buf.free();
        }
        if let Some(buf) = self.dyncomp.take() {
            buf.free();
        }
        if let Some(buf) = self.trampolines.take() {
            buf.free();
        }
        for buf in self.class_trampolines.drain(..) {
            buf.free();
        }
        for buf in self.body_buffers.drain(..) {
            buf.free();
        }
    }
}
