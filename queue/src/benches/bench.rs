use criterion::criterion_main;


criterion_main!(push_pop::benches, contended::benches);
