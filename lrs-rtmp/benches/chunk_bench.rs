use bytes::Bytes;
use criterion::{criterion_group, criterion_main, Criterion};
use lrs_rtmp::chunk::{ChunkDecoder, ChunkEncoder};
use lrs_rtmp::message::{msg_type, RtmpMessage};

fn benchmark_chunk_codec(c: &mut Criterion) {
    let mut encoder = ChunkEncoder::new();
    encoder.set_chunk_size(4096).unwrap();
    let payload: Vec<u8> = (0..60_000).map(|i| (i % 251) as u8).collect();
    let msg = RtmpMessage::new(msg_type::VIDEO, 40, 1, Bytes::from(payload));

    let wire = encoder.write_message(6, &msg);
    {
        let mut decoder = ChunkDecoder::new();
        decoder.set_chunk_size(4096).unwrap();
        decoder.handle_read(&wire).unwrap();
        let got = decoder.poll_message().unwrap();
        if got != msg {
            panic!("chunk codec round trip mismatch");
        }
    }

    c.bench_function("ChunkEncoder write_message 60k", |b| {
        b.iter(|| {
            let _ = encoder.write_message(6, &msg);
        })
    });

    c.bench_function("ChunkDecoder reassemble 60k", |b| {
        b.iter(|| {
            let mut decoder = ChunkDecoder::new();
            decoder.set_chunk_size(4096).unwrap();
            decoder.handle_read(&wire).unwrap();
            let _ = decoder.poll_message().unwrap();
        })
    });
}

criterion_group!(benches, benchmark_chunk_codec);
criterion_main!(benches);
