use criterion::{black_box, criterion_group, criterion_main, Criterion};

use nsm::console::Console;
use nsm::script::{Dialect, Interpreter};

fn interp() -> Interpreter {
    let (console, _) = Console::captured();
    Interpreter::new(console, std::env::temp_dir())
}

fn literal_page(repeats: usize) -> String {
    "<p>The quick brown fox jumps over the lazy dog.</p>\n".repeat(repeats)
}

fn call_heavy_page(repeats: usize) -> String {
    let mut src = String::from("@int(total=0)@function(cell){<td>$[params[0]]</td>}\n");
    for i in 0..repeats {
        src.push_str(&format!("<tr>@cell({i})@cell(@+({i}, 1))</tr>@+=(total, {i})\n"));
    }
    src.push_str("$[total]\n");
    src
}

const LOOP_F: &str = "int(i=0)\nint(sum=0)\nwhile(i < 500)\n{\n\t+=(sum, i)\n\ti++\n}\n+{o}(sum)";

fn bench_process(c: &mut Criterion) {
    let literal = literal_page(1000);
    let calls = call_heavy_page(200);

    let mut g = c.benchmark_group("process");

    g.bench_function("literal_n", |b| {
        b.iter(|| interp().process_str(black_box(&literal), Dialect::N))
    });
    g.bench_function("calls_n", |b| {
        b.iter(|| interp().process_str(black_box(&calls), Dialect::N))
    });
    g.bench_function("while_f", |b| {
        b.iter(|| interp().process_str(black_box(LOOP_F), Dialect::F))
    });

    g.finish();
}

criterion_group!(benches, bench_process);
criterion_main!(benches);
