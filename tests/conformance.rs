//! Every scenario runs through the interpreter and the bytecode VM; both
//! must agree.
#![allow(clippy::unwrap_used, clippy::indexing_slicing, clippy::panic)]

use std::io;
use std::rc::Rc;
use std::sync::Arc;

use ctl::dsl::ast::NodeKind;
use ctl::dsl::error::CompileError;
use ctl::dsl::program::ImportResolver;
use ctl::dsl::{check_source, lexer, parser};
use ctl::metadata::parse_metadata_xml;
use ctl::model::{
    CtlType, FieldMetadata, ListView, MapView, Record, RecordMetadata, RecordRef, RuntimeError,
    Value,
};
use ctl::resources::{InMemoryLookup, InMemorySequence, Resources};
use ctl::{
    compile_source, CompileEnv, EntryPointKind, ExecutionContext, ExecutionMode, Transform,
    TransformCompiler, TransformError, TransformProgram, TransformStatus,
};

const MODES: [ExecutionMode; 2] = [ExecutionMode::Interpret, ExecutionMode::Compile];

fn person() -> Arc<RecordMetadata> {
    Arc::new(RecordMetadata::new(
        "person",
        vec![
            FieldMetadata::new("name", CtlType::String),
            FieldMetadata::new("age", CtlType::Integer),
        ],
    ))
}

fn rate() -> Arc<RecordMetadata> {
    Arc::new(RecordMetadata::new(
        "rate",
        vec![
            FieldMetadata::new("currency", CtlType::String),
            FieldMetadata::new("value", CtlType::Integer),
        ],
    ))
}

fn env() -> CompileEnv {
    CompileEnv::new()
        .with_input(person())
        .with_output(person())
        .with_record_type(person())
        .with_lookup("rates", rate(), &[0])
}

fn context() -> ExecutionContext {
    let rates = InMemoryLookup::new(rate(), vec![0])
        .with_row(vec![Value::String("EUR".into()), Value::Integer(1)])
        .with_row(vec![Value::String("EUR".into()), Value::Integer(2)])
        .with_row(vec![Value::String("USD".into()), Value::Integer(3)]);
    let resources = Resources::new()
        .with_sequence("ids", Arc::new(InMemorySequence::new(100, 10)))
        .with_lookup("rates", Rc::new(rates));
    ExecutionContext::new().with_resources(resources)
}

fn compile(src: &str, mode: ExecutionMode) -> Box<dyn TransformProgram> {
    compile_source(src, &env(), mode).unwrap()
}

fn bind(src: &str, mode: ExecutionMode, kind: EntryPointKind) -> Transform {
    Transform::new(compile(src, mode), kind, context()).unwrap()
}

fn compile_errors(src: &str) -> Vec<String> {
    MODES
        .iter()
        .map(|mode| compile_source(src, &env(), *mode).unwrap_err())
        .map(|errors| errors.into_iter().map(|e| e.message).collect::<Vec<_>>())
        .reduce(|a, b| {
            assert_eq!(a, b, "back-ends disagree on diagnostics");
            a
        })
        .unwrap_or_default()
}

/// Run the global code in both modes and render `names`.
fn globals(src: &str, names: &[&str]) -> Vec<String> {
    let results: Vec<Vec<String>> = MODES
        .iter()
        .map(|mode| {
            let program = compile(src, *mode);
            let mut ctx = context();
            program.run_global(&mut ctx).unwrap();
            names
                .iter()
                .map(|name| program.get_variable_value(&ctx, name).unwrap().to_string())
                .collect()
        })
        .collect();
    assert_eq!(results[0], results[1], "back-ends disagree for:\n{src}");
    results.into_iter().next().unwrap_or_default()
}

fn global(src: &str, name: &str) -> String {
    globals(src, &[name]).remove(0)
}

fn runtime_error(src: &str) -> Vec<RuntimeError> {
    MODES
        .iter()
        .map(|mode| {
            let program = compile(src, *mode);
            program.run_global(&mut context()).unwrap_err()
        })
        .collect()
}

fn person_record(name: &str, age: i32) -> RecordRef {
    let r = Record::new_ref(person());
    r.borrow_mut().set(0, Value::String(name.into())).unwrap();
    r.borrow_mut().set(1, Value::Integer(age)).unwrap();
    r
}

// ── Scenarios ────────────────────────────────────────────────────

#[test]
fn subtraction_of_globals() {
    assert_eq!(global("int i=10; int j=100; int r = i - j;", "r"), "-90");
}

#[test]
fn overloads_resolve_by_argument_type() {
    let src = "function int sum(int a, int b) { return a + b; }\n\
               function string sum(string a, string b) { return a + b; }\n\
               int n = sum(1, 2); string s = sum(\"a\", \"b\");";
    assert_eq!(globals(src, &["n", "s"]), ["3", "ab"]);
}

#[test]
fn denormalize_without_transform_is_a_configuration_error() {
    let src = "function integer append() { return 0; }";
    for mode in MODES {
        let program = compile(src, mode);
        let err = Transform::new(program, EntryPointKind::Denormalize, context()).unwrap_err();
        assert!(
            matches!(&err, TransformError::Configuration(m) if m.contains("transform()")),
            "{err}"
        );

        let mut compiler = TransformCompiler::new(env()).with_default_mode(mode);
        let errors = compiler.compile(src, EntryPointKind::Denormalize, "denorm.ctl");
        let missing = "Required function 'transform()' is not declared";
        assert!(errors.iter().any(|e| e.message == missing));
        assert!(compiler.program().is_none());
    }
}

#[test]
fn duplicate_case_labels_yield_two_diagnostics() {
    let src = "integer x = 5; switch (x) { case 5: x = 1; break; case 5: x = 2; break; }";
    let errors = compile_errors(src);
    assert_eq!(errors, ["Duplicate case", "Duplicate case"]);
}

// ── Type system ──────────────────────────────────────────────────

#[test]
fn promotion_follows_the_numeric_ladder() {
    assert_eq!(global("long r = 2147483647 + 1L;", "r"), "2147483648");
    assert_eq!(global("number r = 1 + 0.5;", "r"), "1.5");
    assert!(global("decimal r = 1.25D * 2;", "r").starts_with("2.5"));
    assert_eq!(global("boolean r = 1 lt 2L and 3.0 ge 3;", "r"), "true");
    assert_eq!(global("string r = \"n\" + 1 + 2;", "r"), "n12");
}

#[test]
fn ambiguous_and_missing_overloads_are_reported() {
    let src = "function integer f(long a, number b) { return 1; }\n\
               function integer f(number a, long b) { return 2; }\n\
               integer r = f(1, 1);";
    assert_eq!(compile_errors(src), ["Function 'f' is ambiguous"]);
    assert_eq!(
        compile_errors("integer r = length(1, 2);"),
        ["Function 'length(integer, integer)' is not declared"]
    );
}

#[test]
fn closest_overload_wins() {
    let src = "function string f(long a) { return \"long\"; }\n\
               function string f(decimal a) { return \"decimal\"; }\n\
               string r = f(1); string d = f(1.0D);";
    assert_eq!(globals(src, &["r", "d"]), ["long", "decimal"]);
}

#[test]
fn narrowing_assignment_is_rejected() {
    assert_eq!(
        compile_errors("long l = 5L; integer i = l;"),
        ["Type mismatch: cannot convert from 'long' to 'integer'"]
    );
}

// ── Control flow ─────────────────────────────────────────────────

#[test]
fn switch_falls_through_positionally() {
    let src = "string t; switch (1) \
               { case 1: t = t + \"1\"; case 2: t = t + \"2\"; break; case 3: t = t + \"3\"; }";
    assert_eq!(global(src, "t"), "12");
    let src = "string t; \
               switch (7) { case 1: t = \"a\"; default: t = t + \"d\"; case 2: t = t + \"2\"; }";
    assert_eq!(global(src, "t"), "d2");
}

#[test]
fn loops_agree() {
    let src = "integer total;\n\
               for (integer i = 0; i < 10; i++) \
               { if (i % 2 == 0) continue; if (i > 7) break; total += i; }\n\
               integer n; while (true) { n++; if (n == 4) break; }\n\
               integer d; do { d += 2; } while (d < 5);\n\
               integer f; foreach (integer v : [3, 4, 5]) { if (v == 4) continue; f += v; }";
    assert_eq!(globals(src, &["total", "n", "d", "f"]), ["16", "4", "6", "8"]);
}

#[test]
fn recursion_and_early_return() {
    let src = "function integer fact(integer n) { if (n <= 1) return 1; return n * fact(n - 1); }\n\
               integer r = fact(10);";
    assert_eq!(global(src, "r"), "3628800");
}

#[test]
fn ternary_evaluates_only_the_selected_branch() {
    let src = "integer calls;\n\
               function integer bump() { calls++; return calls; }\n\
               integer r = true ? 1 : bump(); integer s = false ? bump() : 2;";
    assert_eq!(globals(src, &["r", "s", "calls"]), ["1", "2", "0"]);
}

// ── Value semantics ──────────────────────────────────────────────

#[test]
fn containers_copy_and_records_alias() {
    let src = "integer[] a = [1, 2]; integer[] b = a; append(b, 3);\n\
               integer la = length(a); integer lb = length(b);\n\
               person p; person q = p; q.name = \"x\";\n\
               person c; c.* = p.*; c.name = \"y\";\n\
               string pn = p.name; string cn = c.name;";
    assert_eq!(globals(src, &["la", "lb", "pn", "cn"]), ["2", "3", "x", "y"]);
}

#[test]
fn container_elements_write_through() {
    let src = "map[string, integer] m = {\"a\" -> 1};\n\
               m[\"a\"]++; m[\"b\"] = 5;\n\
               integer a = m[\"a\"]; integer b = m[\"b\"]; boolean missing = isNull(m[\"z\"]);\n\
               integer[] l = [1, 2, 3]; l[1] += 10; integer second = l[1];";
    assert_eq!(globals(src, &["a", "b", "missing", "second"]), ["2", "5", "true", "12"]);
}

#[test]
fn views_share_the_backing_storage() {
    let program = compile("integer[] l = [1, 2]; map[string, string] m;", ExecutionMode::Compile);
    let mut ctx = context();
    program.run_global(&mut ctx).unwrap();

    let list = program.get_variable_value(&ctx, "l").unwrap();
    ListView::wrap(&list).unwrap().add(Value::Integer(3));
    assert_eq!(ListView::wrap(&list).unwrap().len(), 3);

    let map = program.get_variable_value(&ctx, "m").unwrap();
    MapView::wrap(&map).unwrap().put(&Value::String("k".into()), Value::Null).unwrap();
    assert!(MapView::wrap(&map).unwrap().contains_key(&Value::String("k".into())).unwrap());

    assert!(matches!(ListView::wrap(&map), Err(RuntimeError::TypeMismatch { .. })));
}

#[test]
fn list_index_out_of_range_fails_in_both_modes() {
    for err in runtime_error("integer[] l = [1]; integer x = l[3];") {
        assert!(matches!(err.root(), RuntimeError::IndexOutOfBounds { .. }), "{err}");
    }
}

#[test]
fn min_over_minus_one_wraps() {
    let src = "integer m = -2147483647 - 1; integer q = m / -1; integer r = m % -1;\n\
               long lm = -9223372036854775807L - 1L; long lq = lm / -1L; long lr = lm % -1L;";
    assert_eq!(
        globals(src, &["q", "r", "lq", "lr"]),
        ["-2147483648", "0", "-9223372036854775808", "0"]
    );
    for err in runtime_error("integer z = 0; integer r = 5 % z;") {
        assert!(matches!(err.root(), RuntimeError::DivisionByZero), "{err}");
    }
}

#[test]
fn min_literals_compile() {
    let src = "integer i = -2147483648; long l = -9223372036854775808L; \
               integer j = 3 - -2147483648;";
    assert_eq!(globals(src, &["i", "l"]), ["-2147483648", "-9223372036854775808"]);
    assert!(compile_source("integer i = 2147483648;", &env(), ExecutionMode::Interpret).is_err());
}

#[test]
fn nan_comparisons_follow_ieee() {
    let src = "number n = 0.0 / 0.0;\n\
               boolean eq = n == n; boolean ne = n != n; \
               boolean le = n <= 1.0; boolean ge = n >= 1.0;";
    assert_eq!(globals(src, &["eq", "ne", "le", "ge"]), ["false", "true", "false", "false"]);
}

#[test]
fn date_units_may_be_bare_identifiers() {
    let src = "date d = long2date(0L);\n\
               long s = date2long(dateAdd(d, 2, second));\n\
               long h = dateDiff(dateAdd(d, 3, hour), d, hour);\n\
               string day = \"minute\"; long m = date2long(dateAdd(d, 1, day));";
    assert_eq!(globals(src, &["s", "h", "m"]), ["2000", "3", "60000"]);
}

#[test]
fn decimal_results_are_truncated() {
    let r = global("decimal r = 2.0D / 3.0D;", "r");
    assert!(r.starts_with("0.666"), "{r}");
    assert!(r.ends_with('6'), "{r}");
    assert!(r.len() <= 28, "{r}");
    for err in runtime_error("decimal r = 1.0D / 0.0D;") {
        assert!(matches!(err.root(), RuntimeError::DivisionByZero), "{err}");
    }
}

// ── Resources ────────────────────────────────────────────────────

#[test]
fn sequences_advance_and_convert() {
    let src = "integer a = sequence(ids).next(); long b = sequence(ids, long).next();\n\
               string c = sequence(ids, string).current(); sequence(ids).reset();\n\
               integer d = sequence(ids).next();";
    assert_eq!(globals(src, &["a", "b", "c", "d"]), ["100", "110", "110", "100"]);
}

#[test]
fn lookups_walk_duplicate_keys() {
    let src = "integer n = lookup(rates).count(\"EUR\");\n\
               integer sum; rate r = lookup(rates).get(\"EUR\");\n\
               while (!isNull(r)) { sum += r.value; r = lookup(rates).next(); }\n\
               integer none = lookup(rates).count(\"GBP\");";
    assert_eq!(globals(src, &["n", "sum", "none"]), ["2", "3", "0"]);
    assert_eq!(
        compile_errors("integer n = lookup(rates).count(1, 2);"),
        ["Lookup 'rates' expects 1 key(s), found 2"]
    );
}

// ── Entry points ─────────────────────────────────────────────────

#[test]
fn reformat_errors_redirect_to_on_error() {
    let src = "function integer transform()\n\
               { $out.0.age = 100 / $in.0.age; $out.0.name = $in.0.name; return 0; }\n\
               function integer transformOnError(string message, string trace)\n\
               { $out.0.name = message; return 1; }";
    for mode in MODES {
        let mut t = bind(src, mode, EntryPointKind::Reformat);
        assert!(t.init().unwrap());
        let out = Record::new_ref(person());
        let status = t.transform(&[person_record("ok", 4)], &[out.clone()]).unwrap();
        assert_eq!(status, TransformStatus::Ok(0));
        assert!(matches!(out.borrow().get(1), Some(Value::Integer(25))));
        let status = t.transform(&[person_record("bad", 0)], &[out.clone()]).unwrap();
        assert_eq!(status, TransformStatus::Ok(1));
        assert_eq!(out.borrow().get(0).unwrap().to_string(), "division by zero");
    }
}

#[test]
fn unhandled_failures_carry_the_function_name() {
    let src = "function integer helper() { raiseError(\"boom\"); return 0; }\n\
               function integer transform() { return helper(); }";
    for mode in MODES {
        let mut t = bind(src, mode, EntryPointKind::Reformat);
        let out = Record::new_ref(person());
        let err = t.transform(&[person_record("a", 1)], &[out]).unwrap_err();
        match err {
            TransformError::Runtime { function, source } => {
                assert_eq!(function, "transform");
                assert!(matches!(source.root(), RuntimeError::User(m) if m == "boom"));
            }
            other => panic!("unexpected {other}"),
        }
    }
}

#[test]
fn normalize_emits_count_records() {
    let src = "function integer count() { return $in.0.age; }\n\
               function integer transform(integer idx)\n\
               { $out.0.name = $in.0.name + idx; $out.0.age = idx; return idx == 1 ? -1 : 0; }";
    for mode in MODES {
        let mut t = bind(src, mode, EntryPointKind::Normalize);
        let input = person_record("n", 3);
        let n = t.count(&[input.clone()]).unwrap();
        assert_eq!(n, 3);
        let mut names = Vec::new();
        for idx in 0..n {
            let out = Record::new_ref(person());
            let status = t.transform_at(idx, &[input.clone()], &[out.clone()]).unwrap();
            if status == TransformStatus::Ok(0) {
                names.push(out.borrow().get(0).unwrap().to_string());
            }
        }
        assert_eq!(names, ["n0", "n2"]);
    }
}

#[test]
fn denormalize_groups_and_cleans() {
    let src = "integer total;\n\
               function integer append() { total += $in.0.age; return 0; }\n\
               function integer transform() { $out.0.age = total; return 0; }\n\
               function void clean() { total = 0; }";
    for mode in MODES {
        let mut t = bind(src, mode, EntryPointKind::Denormalize);
        for age in [1, 2, 3] {
            t.append(&[person_record("g", age)]).unwrap();
        }
        let out = Record::new_ref(person());
        t.transform(&[], &[out.clone()]).unwrap();
        assert!(matches!(out.borrow().get(1), Some(Value::Integer(6))));
        let total = t.program().get_variable_value(t.context(), "total");
        assert!(matches!(total, Some(Value::Integer(0))));
    }
}

#[test]
fn pragma_selects_the_back_end() {
    let src = "//#CTL2:COMPILE\ninteger x = 1;";
    let program = compile_source(src, &env(), ExecutionMode::Interpret).unwrap();
    assert_eq!(program.mode(), ExecutionMode::Compile);
    assert!(program.listing().is_some());
    let program =
        compile_source("//#CTL2\ninteger x = 1;", &env(), ExecutionMode::Compile).unwrap();
    assert_eq!(program.mode(), ExecutionMode::Interpret);
    assert!(program.listing().is_none());
}

// ── AST duplication ──────────────────────────────────────────────

const PROGRAMS: &[&str] = &[
    "integer a = 1 + 2 * 3; a += 4;",
    "function string f(string s, integer n) { return n > 0 ? s + n : upperCase(s); } \
     string r = f(\"x\", 2);",
    "integer[] l = [1, 2]; map[string, integer] m = {\"a\" -> l[0]}; \
     foreach (integer v : l) { m[\"b\"] = v; }",
    "integer x; switch (x) { case 1: x++; break; default: x--; }",
    "$out.0.* = $in.0.*; $out.0.name = trim($in.person.name);",
];

#[test]
fn duplication_is_deep_and_idempotent() {
    for src in PROGRAMS {
        let mut ast = parser::parse(lexer::lex(src).unwrap()).unwrap();
        let count = ast.len();
        for index in 0..count {
            let id = ctl::dsl::ast::NodeId::new(index);
            if !ast.kind(id).is_duplicable() {
                assert!(ast.duplicate(id).is_err(), "{} duplicated", ast.kind(id).name());
                continue;
            }
            let once = ast.duplicate(id).unwrap();
            let twice = ast.duplicate(once).unwrap();
            assert!(ast.same_shape(id, once), "{src}");
            assert!(ast.same_shape(once, twice), "{src}");
            assert_eq!(ast.parent(once), None);
            assert!(ast.descendants(once).iter().all(|d| d.index() >= count));
        }
    }
}

#[test]
fn compound_assignment_is_desugared() {
    let program = check_source("integer a = 1; a *= 3;", &env(), ExecutionMode::Interpret).unwrap();
    let root = program.ast.root().unwrap();
    let rebuilt = program
        .ast
        .descendants(root)
        .into_iter()
        .any(|id| matches!(program.ast.kind(id), NodeKind::Binary { .. }));
    assert!(rebuilt);
}

// ── Imports ──────────────────────────────────────────────────────

struct Library;

impl ImportResolver for Library {
    fn resolve(&self, _from: Option<&str>, path: &str) -> io::Result<(String, String)> {
        match path {
            "math.ctl" => {
                let source = "function integer twice(integer n) { return n * 2; }";
                Ok((path.to_string(), source.to_string()))
            }
            other => Err(io::Error::new(io::ErrorKind::NotFound, format!("no such file {other}"))),
        }
    }
}

#[test]
fn imported_functions_are_callable() {
    let env = env().with_import_resolver(Library);
    for mode in MODES {
        let program =
            compile_source("import \"math.ctl\"; integer r = twice(21);", &env, mode).unwrap();
        let mut ctx = context();
        program.run_global(&mut ctx).unwrap();
        assert!(matches!(program.get_variable_value(&ctx, "r"), Some(Value::Integer(42))));
    }
    let errors: Vec<CompileError> =
        compile_source("import \"nope.ctl\";", &env, ExecutionMode::Interpret).unwrap_err();
    assert!(errors[0].message.starts_with("Cannot import 'nope.ctl'"));
}

// ── Metadata ─────────────────────────────────────────────────────

#[test]
fn xml_metadata_drives_a_transform() {
    let xml = r#"<Metadata>
        <Record name="order">
            <Field name="id" type="integer" nullable="false"/>
            <Field name="amount" type="decimal" length="10" scale="2"/>
            <Field name="tags" type="string" containerType="list"/>
        </Record>
    </Metadata>"#;
    let records = parse_metadata_xml(xml).unwrap();
    let order = records[0].clone();
    let env = CompileEnv::new().with_input(order.clone()).with_output(order.clone());
    let src = "function integer transform() {\n\
                   $out.0.* = $in.0.*; $out.0.amount = $in.0.amount * 2;\n\
                   append($out.0.tags, \"seen\"); return 0;\n\
               }";
    for mode in MODES {
        let program = compile_source(src, &env, mode).unwrap();
        let mut t =
            Transform::new(program, EntryPointKind::Reformat, ExecutionContext::new()).unwrap();
        let input = Record::new_ref(order.clone());
        input
            .borrow_mut()
            .populate_from_json(&serde_json::json!({ "id": 7, "amount": "1.255", "tags": ["a"] }))
            .unwrap();
        let out = Record::new_ref(order.clone());
        assert_eq!(t.transform(&[input], &[out.clone()]).unwrap(), TransformStatus::Ok(0));
        let json = out.borrow().to_json();
        assert_eq!(json["id"], 7);
        assert_eq!(json["tags"], serde_json::json!(["a", "seen"]));
        assert!(json["amount"].to_string().contains("2.5"), "{json}");
    }
}
