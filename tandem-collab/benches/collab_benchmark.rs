use std::hint::black_box;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use tandem_collab::broadcast::BroadcastGroup;
use tandem_collab::protocol::{ClientFrame, ServerFrame};
use tandem_collab::OfflineQueue;
use tandem_core::{CharacterNode, EditOp, Editor, NodeId};
use uuid::Uuid;

fn typed_editor(n: usize) -> Editor {
    let mut editor = Editor::new("bench");
    for i in 0..n {
        editor.insert_at(i, 'a');
    }
    editor
}

fn keystroke() -> EditOp {
    EditOp::Insert(CharacterNode::new(
        'x',
        NodeId::new("alice_1700000000001"),
        NodeId::new("alice_1700000000000"),
    ))
}

fn bench_edit_frame_encode(c: &mut Criterion) {
    let op = keystroke();
    c.bench_function("edit_frame_encode", |b| {
        b.iter(|| {
            let frame = ClientFrame::edit(black_box("48213"), black_box(&op));
            black_box(frame.encode().unwrap());
        })
    });
}

fn bench_edit_frame_decode(c: &mut Criterion) {
    let encoded = ClientFrame::edit("48213", &keystroke()).encode().unwrap();
    c.bench_function("edit_frame_decode", |b| {
        b.iter(|| {
            let frame = ClientFrame::decode(black_box(&encoded)).unwrap();
            if let ClientFrame::Edit { message, .. } = frame {
                black_box(EditOp::try_from(message).unwrap());
            }
        })
    });
}

fn bench_sync_response_10k(c: &mut Criterion) {
    let editor = typed_editor(10_000);
    let snapshot = editor.document().snapshot();

    c.bench_function("sync_response_encode_10k", |b| {
        b.iter(|| {
            let frame = ServerFrame::sync_response("48213", black_box(&snapshot));
            black_box(frame.encode().unwrap());
        })
    });

    let encoded = ServerFrame::sync_response("48213", &snapshot).encode().unwrap();
    c.bench_function("sync_response_bootstrap_10k", |b| {
        b.iter_batched(
            || encoded.clone(),
            |text| {
                let ServerFrame::SyncResponse { messages, .. } = ServerFrame::decode(&text).unwrap() else {
                    unreachable!()
                };
                let ops = messages.into_iter().map(|m| EditOp::try_from(m).unwrap());
                let mut joiner = Editor::new("joiner");
                black_box(joiner.bootstrap(ops));
            },
            BatchSize::LargeInput,
        )
    });
}

fn bench_broadcast_1000_frames(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let update = ServerFrame::Update {
        doc_id: "48213".into(),
        message: (&keystroke()).into(),
    };

    c.bench_function("broadcast_1000_frames_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048, 100);
                let mut receivers = Vec::with_capacity(100);
                for _ in 0..100 {
                    receivers.push(group.add_peer(Uuid::new_v4()).await.unwrap());
                }
                let origin = Some(Uuid::new_v4());
                for _ in 0..1000 {
                    black_box(group.broadcast(origin, &update).unwrap());
                }
                black_box(receivers.len());
            })
        })
    });
}

fn bench_offline_queue_replay(c: &mut Criterion) {
    let ops = typed_editor(1000).document().snapshot();

    c.bench_function("offline_queue_replay_1000", |b| {
        b.iter(|| {
            let mut queue = OfflineQueue::new(10_000);
            for node in &ops {
                queue.enqueue(EditOp::Insert(node.clone()));
            }
            for op in queue.drain() {
                black_box(ClientFrame::edit("48213", &op).encode().unwrap());
            }
        })
    });
}

criterion_group!(
    benches,
    bench_edit_frame_encode,
    bench_edit_frame_decode,
    bench_sync_response_10k,
    bench_broadcast_1000_frames,
    bench_offline_queue_replay,
);
criterion_main!(benches);
