use criterion::{criterion_group, criterion_main, Criterion};
use piece_buffer::{Engine, Eol, PieceTreeBuilder};

fn large_engine() -> Engine {
    let mut builder = PieceTreeBuilder::new();
    for i in 0..20_000 {
        builder.accept_chunk(format!("line {i} of the benchmark corpus\n").as_bytes());
    }
    let factory = builder.finish(true);
    let (engine, _) = factory.create(Eol::Lf);
    engine
}

fn offsets(c: &mut Criterion) {
    c.bench_function("get_offset_at_sequential", |bench| {
        let engine = large_engine();
        let line_count = engine.line_count();
        let mut line = 1;
        bench.iter(|| {
            let offset = engine.get_offset_at(line, 1);
            line = if line >= line_count { 1 } else { line + 1 };
            offset
        });
    });

    c.bench_function("get_position_at_sequential", |bench| {
        let engine = large_engine();
        let len = engine.len();
        let mut offset = 0;
        bench.iter(|| {
            let pos = engine.get_position_at(offset);
            offset = if offset >= len { 0 } else { offset + 1 };
            pos
        });
    });
}

fn line_content(c: &mut Criterion) {
    c.bench_function("get_line_content_sequential", |bench| {
        let mut engine = large_engine();
        let line_count = engine.line_count();
        let mut line = 1;
        bench.iter(|| {
            let content = engine.get_line_content(line);
            line = if line >= line_count { 1 } else { line + 1 };
            content
        });
    });
}

fn edits(c: &mut Criterion) {
    c.bench_function("insert_sequential_append", |bench| {
        let mut engine = Engine::new();
        let mut offset = 0;
        bench.iter(|| {
            engine.insert(offset, b"x", true);
            offset += 1;
        });
    });

    c.bench_function("insert_then_delete_interior", |bench| {
        let template = large_engine();
        bench.iter(move || {
            let mut engine = template.clone();
            engine.insert(100, b"inserted text", true);
            engine.delete(50, 20);
            engine.len()
        });
    });
}

criterion_group!(benches, offsets, line_content, edits);
criterion_main!(benches);
