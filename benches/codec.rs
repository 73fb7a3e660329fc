//! Benchmark for the command codec
//!
//! Target: encode/decode well under a microsecond per entry, discovery log
//! parsing linear in the number of records

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nvme_host_manager::codec::command::{get_log_page, identify};
use nvme_host_manager::codec::completion::command_specific;
use nvme_host_manager::codec::fabrics::connect;
use nvme_host_manager::codec::{
    build_discovery_log, cns, decode_completion, log_id, Command, Completion, ConnectData,
    ConnectParams, DiscoveryLog, DiscoveryLogEntry, IdentifyController, StatusCodeType,
    StatusField, IDENTIFY_DATA_SIZE,
};
use nvme_host_manager::{QueueKind, TransportType};
use uuid::Uuid;

fn bench_submission_entries(c: &mut Criterion) {
    let mut group = c.benchmark_group("sqe");
    group.throughput(Throughput::Elements(1));

    let command = identify(cns::CONTROLLER, 0, 0).with_command_id(7);
    group.bench_function("encode_identify", |b| {
        b.iter(|| black_box(&command).to_bytes());
    });

    let sqe = command.to_bytes();
    group.bench_function("decode_identify", |b| {
        b.iter(|| Command::from_bytes(black_box(&sqe), QueueKind::Admin));
    });

    group.bench_function("build_get_log_page", |b| {
        let mut offset = 0u64;
        b.iter(|| {
            offset = (offset + 4096) % (1 << 20);
            get_log_page(log_id::DISCOVERY, 0, black_box(offset), 4096, 0, false)
        });
    });

    group.finish();
}

fn bench_completions(c: &mut Criterion) {
    let mut group = c.benchmark_group("cqe");
    group.throughput(Throughput::Elements(1));

    let busy = StatusField::new(
        StatusCodeType::CommandSpecific,
        command_specific::CONNECT_CONTROLLER_BUSY,
    );
    let cqe = Completion::new(3, busy).with_result(0x10).to_bytes();

    group.bench_function("decode", |b| {
        b.iter(|| decode_completion(black_box(&cqe)));
    });

    let completion = Completion::new(3, busy.with_dnr(true));
    let opcode = identify(cns::CONTROLLER, 0, 0).opcode;
    group.bench_function("classify", |b| {
        b.iter(|| black_box(&completion).outcome(opcode));
    });

    group.finish();
}

fn bench_connect(c: &mut Criterion) {
    let mut group = c.benchmark_group("fabrics");
    group.throughput(Throughput::Elements(1));

    let data = ConnectData::new(
        Uuid::new_v4(),
        "nqn.2024-01.io.example:subsys-a",
        "nqn.2014-08.org.nvmexpress:uuid:00000000-0000-0000-0000-000000000001",
    );
    group.bench_function("encode_connect", |b| {
        b.iter(|| connect(ConnectParams::admin(32, 120_000), black_box(&data)));
    });

    group.finish();
}

fn bench_identify(c: &mut Criterion) {
    let mut group = c.benchmark_group("identify");
    group.throughput(Throughput::Bytes(IDENTIFY_DATA_SIZE as u64));

    let mut page = vec![0u8; IDENTIFY_DATA_SIZE];
    page[4..12].copy_from_slice(b"SN000001");
    page[24..34].copy_from_slice(b"Bench NVMe");
    group.bench_function("parse_controller", |b| {
        b.iter(|| IdentifyController::parse(black_box(&page)));
    });

    group.finish();
}

fn bench_discovery_log(c: &mut Criterion) {
    let mut group = c.benchmark_group("discovery_log");

    for records in [1usize, 16, 256] {
        let entries: Vec<DiscoveryLogEntry> = (0..records)
            .map(|i| {
                DiscoveryLogEntry::nvm(
                    TransportType::Tcp,
                    &format!("nqn.2024-01.io.example:subsys-{}", i),
                    &format!("10.0.{}.{}", i / 250, i % 250 + 1),
                    "4420",
                )
            })
            .collect();
        let page = build_discovery_log(1, &entries);

        group.throughput(Throughput::Elements(records as u64));
        group.bench_with_input(BenchmarkId::new("parse", records), &page, |b, page| {
            b.iter(|| DiscoveryLog::parse(black_box(page)));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_submission_entries,
    bench_completions,
    bench_connect,
    bench_identify,
    bench_discovery_log,
);
criterion_main!(benches);
