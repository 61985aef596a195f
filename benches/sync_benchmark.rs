use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::fs;
use std::sync::Arc;
use syncagent::metrics::{DataFormat, Metric};
use syncagent::sync::fingerprint::{Fingerprint, Fingerprinter};
use syncagent::sync::section::{SectionEditor, SentinelEditor};
use tempfile::TempDir;

const BANNER: &str = "###############################################################################";

/// A configuration file with `inputs` plugin tables in its managed section
fn managed_config(inputs: usize) -> String {
    let mut config = String::from("[agent]\n  interval = 10\n\n");
    config.push_str(BANNER);
    config.push_str("\n#                            INPUT PLUGINS                                    #\n");
    config.push_str(BANNER);
    config.push('\n');
    config.push_str(&section_body(inputs));
    config.push_str(BANNER);
    config.push_str("\n#                            SERVICE INPUT PLUGINS                            #\n");
    config.push_str(BANNER);
    config.push('\n');
    config
}

fn section_body(inputs: usize) -> String {
    (0..inputs)
        .map(|i| format!("\n[[inputs.cpu]]\n  percpu = {}\n  totalcpu = true\n", i % 2 == 0))
        .collect()
}

/// Benchmark fingerprinting the managed section on disk
fn bench_fingerprint(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("syncagent.conf");
    fs::write(&path, managed_config(500)).unwrap();
    let fingerprinter = Fingerprinter::new(Arc::new(SentinelEditor::default()));

    c.bench_function("fingerprint_file", |b| {
        b.iter(|| black_box(fingerprinter.fingerprint(&path).unwrap()));
    });

    let body = section_body(500);
    c.bench_function("fingerprint_content", |b| {
        b.iter(|| black_box(Fingerprint::of_content(black_box(&body))));
    });
}

/// Benchmark writing a candidate with a new managed section
fn bench_splice(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("syncagent.conf");
    fs::write(&path, managed_config(100)).unwrap();
    let editor = SentinelEditor::default();
    let content = section_body(200);

    c.bench_function("splice_candidate", |b| {
        b.iter(|| {
            let candidate = editor.splice(&path, black_box(&content), "42").unwrap();
            candidate.discard();
        });
    });
}

/// Benchmark serializing a flush batch
fn bench_serialize(c: &mut Criterion) {
    let batch: Vec<Metric> = (0..1000)
        .map(|i| {
            Metric::new("cpu")
                .with_tag("host", "bench-01")
                .with_tag("cpu", format!("cpu{}", i % 8))
                .with_field("usage_active", 12.5)
                .with_field("usage_idle", 87.5)
        })
        .collect();

    c.bench_function("serialize_influx", |b| {
        b.iter(|| black_box(DataFormat::Influx.serialize(&batch).unwrap()));
    });

    c.bench_function("serialize_json", |b| {
        b.iter(|| black_box(DataFormat::Json.serialize(&batch).unwrap()));
    });
}

criterion_group!(benches, bench_fingerprint, bench_splice, bench_serialize);
criterion_main!(benches);
