use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use codesync_collab::lifecycle::{Connection, LifecycleManager};
use codesync_collab::protocol::{ClientMessage, ServerMessage};
use codesync_collab::registry::{RegistryConfig, SessionRegistry};
use codesync_collab::relay::BroadcastRelay;
use codesync_collab::storage::{NewVersion, SnapshotStore, StoreConfig};
use codesync_core::{FileRecord, VersionFile};
use std::sync::Arc;
use uuid::Uuid;

fn sample_files(count: usize) -> Vec<FileRecord> {
    (0..count)
        .map(|i| FileRecord::inferred(format!("src/file_{i}.js"), format!("export const v{i} = {i};\n").repeat(20)))
        .collect()
}

fn bench_edit_encode(c: &mut Criterion) {
    let msg = ClientMessage::Edit {
        session_id: "bench".into(),
        files: sample_files(10),
    };

    c.bench_function("edit_encode_10_files", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });

    c.bench_function("edit_encode_json_10_files", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode_json().unwrap());
        })
    });
}

fn bench_edit_decode(c: &mut Criterion) {
    let encoded = ClientMessage::Edit {
        session_id: "bench".into(),
        files: sample_files(10),
    }
    .encode()
    .unwrap();

    c.bench_function("edit_decode_10_files", |b| {
        b.iter(|| {
            black_box(ClientMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_fan_out_100_members(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let registry = Arc::new(SessionRegistry::new(RegistryConfig {
        outbox_capacity: 4096,
        ..Default::default()
    }));
    let lifecycle = LifecycleManager::open(registry.clone());
    let relay = BroadcastRelay::new(registry.clone());

    let (originator, mut receivers) = rt.block_on(async {
        let mut receivers = Vec::new();
        let mut first = None;
        for _ in 0..100 {
            let (mut conn, rx) = Connection::open(&registry);
            lifecycle.attach(&mut conn, "bench", None).await.unwrap();
            first.get_or_insert(conn.id());
            receivers.push((conn, rx));
        }
        (first.unwrap(), receivers)
    });
    let files = sample_files(5);

    let mut group = c.benchmark_group("Broadcast Relay");
    group.throughput(Throughput::Elements(99));
    group.bench_function("edit_fan_out_100_members", |b| {
        b.iter(|| {
            let delivered =
                rt.block_on(relay.on_edit("bench", originator, black_box(files.clone())));
            for (_, rx) in receivers.iter_mut() {
                while rx.try_recv().is_ok() {}
            }
            black_box(delivered);
        })
    });
    group.finish();
}

fn bench_outbound_encode(c: &mut Criterion) {
    let msg = ServerMessage::FilesReplaced {
        session_id: "bench".into(),
        files: sample_files(10),
    };

    c.bench_function("files_replaced_encode_10_files", |b| {
        b.iter(|| {
            black_box(black_box(&msg).encode().unwrap());
        })
    });
}

fn bench_version_save(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::open(StoreConfig::for_testing(dir.path().join("bench_db"))).unwrap();
    let files: Vec<VersionFile> = sample_files(10).iter().map(FileRecord::to_version_file).collect();

    c.bench_function("version_save_10_files", |b| {
        b.iter(|| {
            let version = store
                .save(NewVersion {
                    session_id: "bench".into(),
                    files: files.clone(),
                    message: "bench".into(),
                    author: None,
                    audio_path: None,
                })
                .unwrap();
            black_box(version);
        })
    });
}

fn bench_version_list(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let store = SnapshotStore::open(StoreConfig::for_testing(dir.path().join("bench_db"))).unwrap();
    let files = vec![VersionFile::new("main.js", "console.log(1)")];
    for _ in 0..100 {
        store
            .save(NewVersion {
                session_id: "bench".into(),
                files: files.clone(),
                ..Default::default()
            })
            .unwrap();
    }
    let unrelated = Uuid::new_v4().to_string();

    c.bench_function("version_list_100", |b| {
        b.iter(|| {
            black_box(store.list(black_box("bench")).unwrap());
        })
    });

    c.bench_function("version_list_empty_session", |b| {
        b.iter(|| {
            black_box(store.list(black_box(&unrelated)).unwrap());
        })
    });
}

criterion_group!(
    benches,
    bench_edit_encode,
    bench_edit_decode,
    bench_fan_out_100_members,
    bench_outbound_encode,
    bench_version_save,
    bench_version_list,
);
criterion_main!(benches);
