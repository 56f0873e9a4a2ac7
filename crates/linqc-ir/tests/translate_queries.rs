//! End-to-end checks on generated statement lines: the full pipeline from a
//! query tree through shortcut rewriting, simplification, and translation.

use linqc_ast::{CmpOp, NodeId, Query};
use linqc_ir::{compile, GeneratedQuery, SourceConfig};
use linqc_registry::TypeRegistry;

fn compile_query(build: impl FnOnce(&mut Query) -> NodeId) -> GeneratedQuery {
    let mut q = Query::new();
    let root = build(&mut q);
    let registry = TypeRegistry::new();
    compile(&mut q, root, &registry, SourceConfig::default()).expect("query should compile")
}

fn find_line_with(needle: &str, lines: &[String]) -> usize {
    lines
        .iter()
        .position(|l| l.contains(needle))
        .unwrap_or_else(|| panic!("no line contains '{needle}' in:\n{}", lines.join("\n")))
}

/// Header lines of the blocks still open at the end of `lines`.
fn find_open_blocks(lines: &[String]) -> Vec<String> {
    let mut stack = Vec::new();
    let mut header = String::new();
    for line in lines {
        match line.trim() {
            "{" => stack.push(header.clone()),
            "}" => {
                stack.pop();
            }
            other => header = other.to_string(),
        }
    }
    stack
}

/// Number of `for`/`if` blocks open just before line `at`.
fn open_control_blocks(lines: &[String], at: usize) -> usize {
    find_open_blocks(&lines[..at])
        .iter()
        .filter(|h| h.contains("for") || h.contains("if"))
        .count()
}

#[test]
fn test_select_of_jet_pts_fills_an_array_column() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let pts = q.select(jets, "j", pt);
        let sel = q.select(src, "e", pts);
        q.project(sel, &["JetPt"])
    });

    let lines = &g.record_code;
    let l_push = find_line_with("push_back", lines);
    assert_eq!(open_control_blocks(lines, l_push), 1);

    let l_fill = find_line_with("Fill()", lines);
    assert_eq!(open_control_blocks(lines, l_fill), 0);

    let l_clear = find_line_with(".clear()", lines);
    assert!(l_clear > l_fill);

    assert_eq!(g.output_fields.len(), 1);
    let field = &g.output_fields[0];
    assert_eq!(field.column, "JetPt");
    assert_eq!(field.storage, "_JetPt");
    assert_eq!(field.cpp_type, "std::vector<double>");
    assert!(field.is_array);

    find_line_with("output->Branch(\"JetPt\", &_JetPt);", &g.book_code);
    find_line_with("std::vector<double> _JetPt;", &g.declarations);
}

#[test]
fn test_count_accumulates_inside_the_loop_only() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let n = q.method(jets, "Count", &[]);
        let sel = q.select(src, "e", n);
        q.project(sel, &["NJets"])
    });

    let lines = &g.record_code;
    let l_acc = find_line_with("+ 1)", lines);
    assert_eq!(open_control_blocks(lines, l_acc), 1);

    let l_decl = find_line_with("int agg", lines);
    assert_eq!(open_control_blocks(lines, l_decl), 0);

    let l_set = find_line_with("_NJets =", lines);
    assert_eq!(open_control_blocks(lines, l_set), 0);

    assert!(!g.output_fields[0].is_array);
}

#[test]
fn test_first_of_select_is_not_an_array() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let thousand = q.float(1000.0);
        let scaled = q.binary(linqc_ast::BinOp::Div, pt, thousand);
        let pts = q.select(jets, "j", scaled);
        let jpt = q.name("jpt");
        let ten = q.float(10.0);
        let cut = q.compare(CmpOp::Gt, jpt, ten);
        let filtered = q.filter(pts, "jpt", cut);
        let first = q.first(filtered);
        let sel = q.select(src, "e", first);
        q.project(sel, &["FirstJetPt"])
    });

    let lines = &g.record_code;
    assert!(lines.iter().all(|l| !l.contains("push_back")));

    let l_fill = find_line_with("Fill()", lines);
    assert_eq!(open_control_blocks(lines, l_fill), 0);

    // The result lands inside the jet loop, the filter, and the first-guard.
    let l_set = find_line_with("_FirstJetPt", lines);
    assert_eq!(open_control_blocks(lines, l_set), 3);

    // The guard itself is declared once per record, outside the loop.
    let l_guard = find_line_with("(true)", lines);
    assert_eq!(open_control_blocks(lines, l_guard), 0);
}

#[test]
fn test_first_guard_resets_after_the_filter() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let ten = q.float(10.0);
        let cut = q.compare(CmpOp::Gt, pt, ten);
        let filtered = q.filter(jets, "j", cut);
        let first = q.first(filtered);
        let f = q.name("f");
        let fpt = q.method(f, "pt", &[]);
        let invoked = q.push(linqc_ast::Node::Invoke {
            callee: linqc_ast::Lambda::new("f", fpt),
            args: vec![first],
        });
        let sel = q.select(src, "e", invoked);
        q.project(sel, &["FirstJetPt"])
    });

    let lines = &g.record_code;
    let l_cut = find_line_with("> 10.0", lines);
    let l_false = find_line_with("= false;", &lines[l_cut..]);
    assert!(l_false > 0);
}

#[test]
fn test_first_of_collection_is_iterable() {
    // First() hands back the first jet's track collection, which Count()
    // then iterates inside the guard.
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let j = q.name("j");
        let tracks = q.method(j, "Tracks", &[]);
        let per_jet = q.select(jets, "j", tracks);
        let first = q.first(per_jet);
        let n = q.method(first, "Count", &[]);
        let sel = q.select(src, "e", n);
        q.project(sel, &["NTracks"])
    });

    let lines = &g.record_code;
    assert_eq!(lines.iter().filter(|l| l.contains("for (")).count(), 2);

    let l_guard = find_line_with("if (is_first", lines);
    let open = find_open_blocks(&lines[..l_guard]);
    assert_eq!(open.iter().filter(|h| h.contains("for")).count(), 1);

    // The track loop and the accumulate both sit inside the guard.
    let l_acc = find_line_with("+ 1)", lines);
    assert_eq!(open_control_blocks(lines, l_acc), 3);
}

#[test]
fn test_first_of_filtered_sequence_guards_the_count() {
    // The filter forces the track loop to exist before First() is seen, so
    // the guard has to wrap the already-open loop rather than follow it.
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let j = q.name("j");
        let tracks = q.method(j, "Tracks", &[]);
        let t = q.name("t");
        let tpt = q.method(t, "pt", &[]);
        let threshold = q.float(1000.0);
        let cut = q.compare(CmpOp::Gt, tpt, threshold);
        let filtered = q.filter(tracks, "t", cut);
        let per_jet = q.select(jets, "j", filtered);
        let first = q.first(per_jet);
        let n = q.method(first, "Count", &[]);
        let sel = q.select(src, "e", n);
        q.project(sel, &["NTracks"])
    });

    let lines = &g.record_code;
    assert_eq!(lines.iter().filter(|l| l.contains("if (is_first")).count(), 1);

    // The guard sits inside the jet loop only, wrapping the track loop.
    let l_guard = find_line_with("if (is_first", lines);
    let open = find_open_blocks(&lines[..l_guard]);
    assert_eq!(open.iter().filter(|h| h.contains("for")).count(), 1);

    // The accumulate stays under the track-pt filter, now inside the guard.
    let l_acc = find_line_with("+ 1)", lines);
    let open = find_open_blocks(&lines[..l_acc]);
    assert_eq!(open.iter().filter(|h| h.contains("> 1000.0")).count(), 1);
    assert_eq!(open.iter().filter(|h| h.contains("is_first")).count(), 1);

    // The result lands after the loop, still guarded, once per record.
    let l_set = find_line_with("_NTracks =", lines);
    assert_eq!(open_control_blocks(lines, l_set), 2);
    assert!(l_set > l_acc);

    let l_fill = find_line_with("Fill()", lines);
    assert_eq!(open_control_blocks(lines, l_fill), 0);
}

#[test]
fn test_where_guards_the_fill() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let thirty = q.float(30.0);
        let cut = q.compare(CmpOp::Gt, pt, thirty);
        let filtered = q.filter(jets, "j", cut);
        let j2 = q.name("j");
        let pt2 = q.method(j2, "pt", &[]);
        let pts = q.select(filtered, "j", pt2);
        let sel = q.select(src, "e", pts);
        q.project(sel, &["JetPt"])
    });

    let lines = &g.record_code;
    let l_push = find_line_with("push_back", lines);
    assert_eq!(open_control_blocks(lines, l_push), 2);
}

#[test]
fn test_merged_filters_short_circuit_through_a_flag() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let thirty = q.float(30.0);
        let cut1 = q.compare(CmpOp::Gt, pt, thirty);
        let w1 = q.filter(jets, "j", cut1);
        let k = q.name("k");
        let eta = q.method(k, "eta", &[]);
        let lim = q.float(2.5);
        let cut2 = q.compare(CmpOp::Lt, eta, lim);
        let w2 = q.filter(w1, "k", cut2);
        let m = q.name("m");
        let mpt = q.method(m, "pt", &[]);
        let pts = q.select(w2, "m", mpt);
        let sel = q.select(src, "e", pts);
        q.project(sel, &["JetPt"])
    });

    let lines = &g.record_code;
    find_line_with("bool flag", lines);
    // The second comparison is only evaluated inside the first.
    let l_first = find_line_with("> 30.0", lines);
    let l_second = find_line_with("< 2.5", lines);
    assert!(l_second > l_first);
    assert!(open_control_blocks(lines, l_second) > open_control_blocks(lines, l_first));
    // The fill sits under the loop plus the single merged filter test.
    let l_push = find_line_with("push_back", lines);
    assert_eq!(open_control_blocks(lines, l_push), 2);
}

#[test]
fn test_selectmany_flattens_into_one_loop() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let flat = q.select_many(src, "e", jets);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let sel = q.select(flat, "j", pt);
        q.project(sel, &["JetPt"])
    });

    let lines = &g.record_code;
    let l_push = find_line_with("push_back", lines);
    assert_eq!(open_control_blocks(lines, l_push), 1);
    assert!(g.output_fields[0].is_array);
}

#[test]
fn test_nested_count_declares_above_both_loops() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let j = q.name("j");
        let tracks = q.method(j, "Tracks", &[]);
        let flat = q.select_many(jets, "j", tracks);
        let n = q.method(flat, "Count", &[]);
        let sel = q.select(src, "e", n);
        q.project(sel, &["NTracks"])
    });

    let lines = &g.record_code;
    let l_decl = find_line_with("int agg", lines);
    assert_eq!(open_control_blocks(lines, l_decl), 0);

    let l_acc = find_line_with("+ 1)", lines);
    assert_eq!(open_control_blocks(lines, l_acc), 2);
}

#[test]
fn test_max_seeds_from_the_first_item() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let pts = q.select(jets, "j", pt);
        let max = q.method(pts, "Max", &[]);
        let sel = q.select(src, "e", max);
        q.project(sel, &["MaxPt"])
    });

    let lines = &g.record_code;
    assert!(lines.iter().all(|l| !l.contains("push_back")));

    let l_guard = find_line_with("bool is_first", lines);
    assert_eq!(open_control_blocks(lines, l_guard), 0);
    find_line_with("else", lines);

    let l_set = find_line_with("_MaxPt =", lines);
    assert_eq!(open_control_blocks(lines, l_set), 0);
}

#[test]
fn test_tuple_selector_fills_parallel_array_columns() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let j2 = q.name("j");
        let eta = q.method(j2, "eta", &[]);
        let pair = q.tuple(&[pt, eta]);
        let pairs = q.select(jets, "j", pair);
        let sel = q.select(src, "e", pairs);
        q.project(sel, &["JetPt", "JetEta"])
    });

    let lines = &g.record_code;
    let l_pt = find_line_with("_JetPt.push_back", lines);
    let l_eta = find_line_with("_JetEta.push_back", lines);
    assert_eq!(open_control_blocks(lines, l_pt), 1);
    assert_eq!(open_control_blocks(lines, l_eta), 1);

    assert_eq!(g.output_fields.len(), 2);
    assert!(g.output_fields.iter().all(|f| f.is_array));
    assert_eq!(lines.iter().filter(|l| l.contains(".clear()")).count(), 2);
}

#[test]
fn test_scalar_and_array_columns_mix() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let n = q.method(jets, "Count", &[]);
        let e2 = q.name("e");
        let jets2 = q.method(e2, "Jets", &[]);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let pts = q.select(jets2, "j", pt);
        let pair = q.tuple(&[n, pts]);
        let sel = q.select(src, "e", pair);
        q.project(sel, &["NJets", "JetPt"])
    });

    let lines = &g.record_code;
    let l_set = find_line_with("_NJets =", lines);
    assert_eq!(open_control_blocks(lines, l_set), 0);
    let l_push = find_line_with("_JetPt.push_back", lines);
    assert_eq!(open_control_blocks(lines, l_push), 1);

    assert_eq!(g.output_fields[0].is_array, false);
    assert_eq!(g.output_fields[1].is_array, true);
    assert_eq!(lines.iter().filter(|l| l.contains(".clear()")).count(), 1);
}

#[test]
fn test_container_methods_contribute_includes() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let pts = q.select(jets, "j", pt);
        let sel = q.select(src, "e", pts);
        q.project(sel, &["JetPt"])
    });

    assert_eq!(g.includes, vec!["event_model/Jet.h".to_string()]);
}

#[test]
fn test_exactly_one_commit_per_record() {
    let g = compile_query(|q| {
        let src = q.source();
        let e = q.name("e");
        let jets = q.method(e, "Jets", &[]);
        let j = q.name("j");
        let pt = q.method(j, "pt", &[]);
        let j2 = q.name("j");
        let eta = q.method(j2, "eta", &[]);
        let pair = q.tuple(&[pt, eta]);
        let pairs = q.select(jets, "j", pair);
        let sel = q.select(src, "e", pairs);
        q.project(sel, &["JetPt", "JetEta"])
    });

    let fills = g.record_code.iter().filter(|l| l.contains("Fill()")).count();
    assert_eq!(fills, 1);
}
