//! Candidate derivation benchmarks.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use url::Url;

use ava::avatar_ref::parse_avatar_src;
use ava::resolver::{derive_candidates, AssetKind};

fn bench_derive_candidates(c: &mut Criterion) {
    let base = Url::parse("https://tavern.local/").expect("base url");
    let avatar =
        parse_avatar_src("/thumbnail?type=avatar&file=Aria.png", &base).expect("avatar ref");
    let order = [AssetKind::Webp, AssetKind::Webm, AssetKind::Mp4];

    let mut group = c.benchmark_group("derive_candidates");
    group.bench_function("thumbnail_reference", |b| {
        b.iter(|| black_box(derive_candidates(&avatar, &order)))
    });
    group.bench_function("parse_and_derive", |b| {
        b.iter(|| {
            let avatar = parse_avatar_src(black_box("/characters/Seraphina.png"), &base)
                .expect("avatar ref");
            black_box(derive_candidates(&avatar, &order))
        })
    });
    group.finish();
}

criterion_group!(benches, bench_derive_candidates);
criterion_main!(benches);
