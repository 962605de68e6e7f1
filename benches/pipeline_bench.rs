use criterion::{black_box, criterion_group, criterion_main, Criterion};
use qicode::{CompileOptions, Compiler, ParameterTable, Program, ProgramBuilder, Pulse, Recording};

fn rabi_program() -> Program {
    let mut p = ProgramBuilder::new("rabi").unwrap();
    let cells = p.cells(2);
    let t = p.time_var("t", None);
    let f = p.freq_var("f", Some(60e6));
    {
        let mut body = p.for_range(&t, 0.0, 400e-9, 4e-9).unwrap();
        for &q in &cells {
            body.play(q, &Pulse::new(&t).frequency(&f));
            body.play_readout(q, &Pulse::new(q.property("readout_len")).frequency(30e6));
            body.record(q, Recording::new(400e-9).save_to("result"));
            body.wait(q, 10e-6);
        }
    }
    p.finish().unwrap()
}

fn parameters() -> ParameterTable {
    let mut table = ParameterTable::new();
    table
        .set(qicode::Cell::new(0), "readout_len", 400e-9)
        .set(qicode::Cell::new(1), "readout_len", 480e-9);
    table
}

fn pipeline_benchmark(c: &mut Criterion) {
    let program = rabi_program();
    let table = parameters();
    let compiler = Compiler::new(CompileOptions::default());

    c.bench_function("compile rabi sweep", |b| {
        b.iter(|| compiler.compile(black_box(&program), black_box(&table)).unwrap())
    });

    let prepared = compiler.prepare(&program).unwrap();
    c.bench_function("compile prepared rabi sweep", |b| {
        b.iter(|| {
            compiler
                .compile_prepared(black_box(&prepared), black_box(&table))
                .unwrap()
        })
    });
}

criterion_group!(benches, pipeline_benchmark);
criterion_main!(benches);
