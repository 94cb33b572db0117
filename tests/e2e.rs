//! End-to-end scenarios: full source through lex, parse, type-check, codegen
//! and the VM, asserting on observable behavior.

use buzz::{run_source_captured, BuzzError, RunConfig};

fn run(src: &str) -> Result<String, BuzzError> {
    run_source_captured(src, "<e2e>", &RunConfig::default())
}

fn run_tests(src: &str) -> Result<String, BuzzError> {
    let config = RunConfig {
        test: true,
        ..RunConfig::default()
    };
    run_source_captured(src, "<e2e>", &config)
}

// ─────────────────────────────────────────────────────────────────────────────
// Language basics
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn hello_world() {
    assert_eq!(run(r#"print("hello");"#).unwrap(), "hello\n");
}

#[test]
fn empty_script_produces_no_output() {
    assert_eq!(run("").unwrap(), "");
}

#[test]
fn main_is_called_after_the_script_body() {
    let out = run(r#"
        print("body");
        fun main() > void {
            print("main");
        }
    "#)
    .unwrap();
    assert_eq!(out, "body\nmain\n");
}

#[test]
fn test_blocks_report_with_check_marks() {
    let out = run_tests(r#"test "add" { assert(1 + 2 == 3, message: "ok"); }"#).unwrap();
    assert_eq!(out, "\u{2713} add\n");
}

#[test]
fn several_test_blocks_run_in_order() {
    let out = run_tests(
        r#"
        test "first" { assert(true); }
        test "second" { assert(1 < 2); }
        "#,
    )
    .unwrap();
    assert_eq!(out, "\u{2713} first\n\u{2713} second\n");
}

// ─────────────────────────────────────────────────────────────────────────────
// Objects and default-value cloning
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn object_field_defaults_do_not_share_state() {
    let out = run(r#"
        object A { [int] xs = [1, 2, 3] }
        A a = A{};
        A b = A{};
        a.xs.append(4);
        print("{a.xs.len()} {b.xs.len()}");
    "#)
    .unwrap();
    assert_eq!(out, "4 3\n");
}

#[test]
fn uninitialized_field_without_default_is_a_compile_error() {
    let err = run("object P { int x } P p = P{};").unwrap_err();
    assert!(
        err.to_string().contains("not initialized"),
        "unexpected: {err}"
    );
}

#[test]
fn inherited_fields_and_method_override() {
    let out = run(r#"
        object Shape {
            str label = "shape"
            fun area() > int { return 0; }
        }
        object Square < Shape {
            int side = 1
            fun area() > int { return this.side * this.side; }
        }
        Square s = Square{ side = 5 };
        print("{s.label} {s.area()}");
    "#)
    .unwrap();
    assert_eq!(out, "shape 25\n");
}

#[test]
fn static_fields_live_on_the_object() {
    let out = run(r#"
        object Counter {
            static int count = 0
        }
        Counter.count = Counter.count + 1;
        Counter.count = Counter.count + 1;
        print("{Counter.count}");
    "#)
    .unwrap();
    assert_eq!(out, "2\n");
}

// ─────────────────────────────────────────────────────────────────────────────
// Iteration
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn foreach_sums_an_ascending_range() {
    let out = run(r#"int s = 0; foreach (int n in 0..10) { s = s + n; } print("{s}");"#).unwrap();
    assert_eq!(out, "45\n");
}

#[test]
fn foreach_sums_a_descending_range() {
    let out = run(r#"int s = 0; foreach (int n in 10..0) { s = s + n; } print("{s}");"#).unwrap();
    assert_eq!(out, "55\n");
}

#[test]
fn range_to_list_length_matches_distance() {
    let out = run(r#"
        foreach (int a in [0, 3, 9]) {
            foreach (int b in [0, 3, 9]) {
                assert((a..b).toList().len() == (a..b).len());
            }
        }
        print("ok");
    "#)
    .unwrap();
    assert_eq!(out, "ok\n");
}

// ─────────────────────────────────────────────────────────────────────────────
// Round-trip laws
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn parse_int_round_trips_through_to_string() {
    let out = run(r#"
        foreach (int n in [0, 7, -7, 123456, 2147483647, -2147483647 - 1]) {
            assert(parseInt(toString(n))! == n, message: "roundtrip failed for {n}");
        }
        print("ok");
    "#)
    .unwrap();
    assert_eq!(out, "ok\n");
}

// ─────────────────────────────────────────────────────────────────────────────
// Exceptions
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn catch_clause_replaces_the_call_result() {
    let out = run(r#"
        fun may_fail(bool fail) > int {
            if (fail) { throw "nope"; }
            return 10;
        }
        int a = may_fail(false) catch fun (str e) > int { return 0; };
        int b = may_fail(true) catch fun (str e) > int { return 0; };
        print("{a} {b}");
    "#)
    .unwrap();
    assert_eq!(out, "10 0\n");
}

#[test]
fn throws_unwind_through_intermediate_frames() {
    let out = run(r#"
        fun inner() > void { throw "deep"; }
        fun middle() > void { inner(); }
        fun outer() > str {
            middle();
            return "unreachable";
        }
        str got = outer() catch fun (str e) > str { return "caught {e}"; };
        print(got);
    "#)
    .unwrap();
    assert_eq!(out, "caught deep\n");
}

#[test]
fn unhandled_throw_exits_with_the_value() {
    let err = run(r#"throw "kaboom";"#).unwrap_err();
    let text = err.to_string();
    assert!(text.contains("kaboom"), "unexpected: {text}");
}

#[test]
fn integer_overflow_throws_a_catchable_value() {
    let out = run(r#"
        fun inc(int n) > int { return n + 1; }
        int r = inc(2147483647) catch fun (str e) > int { return -1; };
        print("{r}");
    "#)
    .unwrap();
    assert_eq!(out, "-1\n");
}

#[test]
fn deep_recursion_overflows_the_frame_stack() {
    let err = run("fun boom() > void { boom(); } boom();").unwrap_err();
    assert!(
        err.to_string().contains("stack overflow"),
        "unexpected: {err}"
    );
}

// ─────────────────────────────────────────────────────────────────────────────
// Modules
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn imports_resolve_relative_to_the_importing_file() {
    let dir = std::env::temp_dir().join("buzz_e2e_imports");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("util.buzz"),
        r#"
        export fun triple(int n) > int { return n * 3; }
        export const base = 7;
        "#,
    )
    .unwrap();

    let main_path = dir.join("main.buzz");
    let src = r#"
        import "util" as u;
        print("{u.triple(u.base)}");
    "#;
    let out = run_source_captured(src, &main_path.display().to_string(), &RunConfig::default())
        .unwrap();
    assert_eq!(out, "21\n");

    std::fs::remove_dir_all(&dir).ok();
}

#[test]
fn modules_run_once_per_process() {
    let dir = std::env::temp_dir().join("buzz_e2e_run_once");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(
        dir.join("noisy.buzz"),
        r#"
        print("loaded");
        export const marker = 1;
        "#,
    )
    .unwrap();
    std::fs::write(
        dir.join("middle.buzz"),
        r#"
        import "noisy" as n;
        export fun relay() > int { return n.marker; }
        "#,
    )
    .unwrap();

    let main_path = dir.join("main.buzz");
    let src = r#"
        import "noisy" as n;
        import "middle" as m;
        print("{n.marker + m.relay()}");
    "#;
    let out = run_source_captured(src, &main_path.display().to_string(), &RunConfig::default())
        .unwrap();
    // `noisy` prints once even though two modules import it.
    assert_eq!(out, "loaded\n2\n");

    std::fs::remove_dir_all(&dir).ok();
}

// ─────────────────────────────────────────────────────────────────────────────
// Merkle benchmark
// ─────────────────────────────────────────────────────────────────────────────

#[test]
fn merkle_tree_report() {
    let out = run(r#"
        object Node {
            Node? left = null
            Node? right = null
            int hash = 0
        }

        fun build(int depth) > Node {
            if (depth == 0) {
                return Node{ hash = 1 };
            }
            return Node{ left = build(depth - 1), right = build(depth - 1) };
        }

        fun rehash(Node node) > int {
            if (node.left == null) {
                return node.hash;
            }
            int combined = (rehash(node.left!) * 31 + rehash(node.right!)) % 1000003;
            node.hash = combined;
            return combined;
        }

        fun main() > void {
            Node tree = build(6);
            int root = rehash(tree);
            Node stretch = build(6);
            int stretchRoot = rehash(stretch);
            assert(root == stretchRoot, message: "stretch hash diverged");
            print("depth: 6");
            print("leaves: {1 << 6}");
            print("root: {root}");
        }
    "#)
    .unwrap();

    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(lines.len(), 3);
    assert_eq!(lines[0], "depth: 6");
    assert_eq!(lines[1], "leaves: 64");
    assert!(lines[2].starts_with("root: "), "unexpected: {out}");
}
