use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};

use gris_pong::game::{tick, GameConfig, PaddleDirection, PongState};

fn bench_single_tick(c: &mut Criterion) {
    let config = GameConfig::default();
    let inputs = [PaddleDirection::Up, PaddleDirection::Down];

    c.bench_function("tick_rally", |b| {
        b.iter_batched(
            || {
                let mut state = PongState::new(7, 0);
                tick(&mut state, &inputs, &config);
                state
            },
            |mut state| tick(black_box(&mut state), black_box(&inputs), &config),
            BatchSize::SmallInput,
        )
    });
}

fn bench_full_match(c: &mut Criterion) {
    let config = GameConfig::default();

    c.bench_function("match_to_win", |b| {
        b.iter(|| {
            let mut state = PongState::new(black_box(42), config.serve_delay_ticks);
            while !state.is_ended() && state.tick < 1_000_000 {
                let track = PaddleDirection::toward(state.paddles[0].y, state.ball.position.y, 0);
                tick(&mut state, &[track, PaddleDirection::Stop], &config);
            }
            state.score
        })
    });
}

criterion_group!(benches, bench_single_tick, bench_full_match);
criterion_main!(benches);
