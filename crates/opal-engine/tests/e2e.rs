//! End-to-end scenarios through the whole pipeline: parse, analyse,
//! compile the entry point, run, and compare captured `print` output.
//!
//! Execution installs process-wide state (current image, print sink),
//! so every test here serialises on one lock.

use opal_engine::runtime::object::{capture_print, take_captured_print};
use opal_engine::{CompilerOptions, RuntimeImage};
use parking_lot::Mutex;

static RUN_LOCK: Mutex<()> = Mutex::new(());

fn run(source: &str) -> String {
    run_with(source, CompilerOptions::default())
}

fn run_with(source: &str, options: CompilerOptions) -> String {
    let _guard = RUN_LOCK.lock();
    let mut image = RuntimeImage::prepare(source, options).expect("pipeline failure");
    capture_print();
    image.execute();
    take_captured_print()
}

#[test]
fn test_addition() {
    assert_eq!(run("print(3+4);"), "7\n");
}

#[test]
fn test_while_loop() {
    assert_eq!(
        run("{ int x = 0; while (x < 3) { print(x); x := x + 1; } }"),
        "0\n1\n2\n"
    );
}

#[test]
fn test_factorial() {
    assert_eq!(
        run("int fact(int a) { if (a == 0) return 1; return a * fact(a-1); } print(fact(5));"),
        "120\n"
    );
}

#[test]
fn test_class_field() {
    assert_eq!(
        run("class C() { int x = 17; } obj a = C(); print(a.x);"),
        "17\n"
    );
}

#[test]
fn test_method_call() {
    assert_eq!(
        run("class C() { obj p(obj x) { print(x+2); } } obj a = C(); a.p(1);"),
        "3\n"
    );
}

#[test]
fn test_array_read_and_write() {
    assert_eq!(
        run("obj a = [1,7]; print(a[1]); a[1] := 2; print(a[1]);"),
        "7\n2\n"
    );
}

#[test]
fn test_is_int() {
    assert_eq!(
        run("if (1 is int) print(1); if (\"x\" is int) print(2);"),
        "1\n"
    );
}

// ----------------------------------------------------------------------
// Beyond the basic scenarios
// ----------------------------------------------------------------------

#[test]
fn test_observable_equivalence_of_nested_control_flow() {
    // interpreting the same program by hand: sum of odd numbers < 10
    let src = "int i = 0; int sum = 0;\
               while (i < 10) {\
                   i := i + 1;\
                   if (i / 2 * 2 == i) continue;\
                   sum := sum + i;\
               }\
               print(sum);";
    assert_eq!(run(src), "25\n");
}

#[test]
fn test_whole_program_with_classes_and_functions() {
    let src = "class Counter(int start) {\
                   int value = start;\
                   obj bump(int by) { return by; }\
               }\
               int twice(int v) { return v * 2; }\
               obj c = Counter(5);\
               print(c.value);\
               print(twice(c.value));\
               print(c.bump(3));";
    assert_eq!(run(src), "5\n10\n3\n");
}

#[test]
fn test_string_size_through_selector() {
    assert_eq!(run("print(\"opal\".size());"), "4\n");
}

#[test]
fn test_int_arrays_option() {
    // with --int-arrays, elements are raw ints: reads need no unboxing
    let options = CompilerOptions::default().with_int_arrays();
    assert_eq!(
        run_with("obj a = [10, 20]; int x = a[0]; print(x + 1);", options),
        "11\n"
    );
}

#[test]
fn test_no_bounds_checks_option_runs() {
    let options = CompilerOptions {
        no_bounds_checks: true,
        ..CompilerOptions::default()
    };
    assert_eq!(run_with("obj a = [5]; print(a[0]);", options), "5\n");
}

#[test]
fn test_many_callables_compile_independently() {
    let src = "int a() { return 1; } int b() { return a() + 1; }\
               int c() { return b() + 1; } int d() { return c() + 1; }\
               print(d()); print(d());";
    assert_eq!(run(src), "4\n4\n");
}

#[test]
fn test_program_without_output() {
    assert_eq!(run("int x = 5; x := x * 2;"), "");
}

#[test]
fn test_stack_arguments_with_nontrivial_values() {
    // eight arguments, every one a call: register spills plus the
    // stack-passed tail, through a lazily compiled chain
    let src = "int id(int v) { return v; }\
               int sum8(int a, int b, int c, int d, int e, int f, int g, int h) {\
                   return a + b + c + d + e + f + g + h;\
               }\
               print(sum8(id(1), id(2), id(3), id(4), id(5), id(6), id(7), id(8)));";
    assert_eq!(run(src), "36\n");
}

#[test]
fn test_nested_loops_with_breaks() {
    let src = "int total = 0; int i = 0;\
               while (i < 4) {\
                   int j = 0;\
                   while (1) {\
                       if (j == i) break;\
                       total := total + 1;\
                       j := j + 1;\
                   }\
                   i := i + 1;\
               }\
               print(total);";
    // 0 + 1 + 2 + 3 iterations of the inner body
    assert_eq!(run(src), "6\n");
}

#[test]
fn test_objects_flow_through_array_and_method() {
    let src = "class Box(int v) {\
                   int value = v;\
                   obj get() { return 0; }\
               }\
               obj boxes = [Box(3), Box(4)];\
               obj b = boxes[1];\
               print(b.value);\
               print(boxes[0] is Box);";
    assert_eq!(run(src), "4\n1\n");
}

#[test]
fn test_interleaved_field_reads_and_writes() {
    let src = "class Pair() { int a = 1; int b = 2; }\
               obj p = Pair();\
               p.a := p.b + 10;\
               p.b := p.a + 100;\
               print(p.a); print(p.b);";
    assert_eq!(run(src), "12\n112\n");
}

#[test]
fn test_fibonacci() {
    let src = "int fib(int n) {\
                   if (n < 2) return n;\
                   return fib(n - 1) + fib(n - 2);\
               }\
               print(fib(10));";
    assert_eq!(run(src), "55\n");
}
