use criterion::{black_box, criterion_group, criterion_main, Criterion};
use parisync::RaidCodec;

fn bench_raid(c: &mut Criterion) {
    let block = vec![0xABu8; 256 * 1024];
    let data: Vec<&[u8]> = vec![&block; 8];

    let codec1 = RaidCodec::new(8, 1);
    c.bench_function("raid_gen_8x256k_l1", |b| b.iter(|| codec1.gen(black_box(&data))));

    let codec2 = RaidCodec::new(8, 2);
    c.bench_function("raid_gen_8x256k_l2", |b| b.iter(|| codec2.gen(black_box(&data))));

    let parity = codec2.gen(&data).unwrap();
    let present: Vec<Option<&[u8]>> = data
        .iter()
        .enumerate()
        .map(|(i, d)| if i < 2 { None } else { Some(*d) })
        .collect();
    let parity_refs: Vec<&[u8]> = parity.iter().map(|p| p.as_slice()).collect();
    c.bench_function("raid_rec_2_of_8_l2", |b| {
        b.iter(|| codec2.rec(black_box(&present), &[0, 1], &parity_refs))
    });
}

criterion_group!(benches, bench_raid);
criterion_main!(benches);
