//! Compile a small query and print the generated artifacts.
//!
//! Run with: cargo run --example compile_query

use anyhow::Result;
use linqc_ast::{CmpOp, Query};
use linqc_ir::{compile, SourceConfig};
use linqc_registry::TypeRegistry;

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    // source.Select(e: e.Jets().Where(j: j.pt() > 30.0).Select(j: j.pt()))
    //       .Project(JetPt)
    let mut q = Query::new();
    let src = q.source();
    let e = q.name("e");
    let jets = q.method(e, "Jets", &[]);
    let j = q.name("j");
    let pt = q.method(j, "pt", &[]);
    let threshold = q.float(30.0);
    let cut = q.compare(CmpOp::Gt, pt, threshold);
    let filtered = q.filter(jets, "j", cut);
    let j2 = q.name("j");
    let pt2 = q.method(j2, "pt", &[]);
    let mapped = q.select(filtered, "j", pt2);
    let sel = q.select(src, "e", mapped);
    let root = q.project(sel, &["JetPt"]);

    println!("query:       {}", q.render(root));
    println!("fingerprint: {}", q.fingerprint(root));

    let registry = TypeRegistry::new();
    let generated = compile(&mut q, root, &registry, SourceConfig::default())?;

    println!("\n// includes");
    for include in &generated.includes {
        println!("#include \"{include}\"");
    }
    println!("\n// persistent declarations");
    for line in &generated.declarations {
        println!("{line}");
    }
    println!("\n// book");
    for line in &generated.book_code {
        println!("{line}");
    }
    println!("\n// per record");
    for line in &generated.record_code {
        println!("{line}");
    }
    Ok(())
}
