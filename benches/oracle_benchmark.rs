use criterion::{Criterion, black_box, criterion_group, criterion_main};
use image::imageops;
use touch_vision::gesture::synthesize_path;
use touch_vision::oracle::{content_signals, match_template};
use touch_vision::region::Point;
use touch_vision::snapshot::MockFramebuffer;

fn listing_screen() -> MockFramebuffer {
    let mut fb = MockFramebuffer::with_color(540, 1200, [245, 245, 245]);
    for row in 0..40u32 {
        let shade = (row * 6) as u8;
        fb.draw_rect(0, row * 30, 540, 28, [255 - shade, 200, shade]);
        fb.draw_text_scaled(8, row * 30 + 6, "Listing 42 price", [20, 20, 20], [255 - shade, 200, shade], 2);
    }
    fb.draw_circle(470, 1100, 40, [30, 90, 220]);
    fb
}

fn benchmark_content(c: &mut Criterion) {
    let image = listing_screen().to_image();

    c.bench_function("content_signals_540x1200", |b| {
        b.iter(|| content_signals(black_box(&image)))
    });
}

fn benchmark_template(c: &mut Criterion) {
    let gray = imageops::grayscale(&listing_screen().to_image());
    let template = imageops::crop_imm(&gray, 420, 1050, 100, 100).to_image();

    c.bench_function("match_template_540x1200", |b| {
        b.iter(|| {
            let found = match_template(black_box(&gray), black_box(&template));
            assert!(found.is_some());
        })
    });
}

fn benchmark_gesture(c: &mut Criterion) {
    c.bench_function("synthesize_path_400ms", |b| {
        b.iter(|| {
            synthesize_path(
                black_box(Point::new(540.0, 1800.0)),
                black_box(Point::new(540.0, 600.0)),
                std::time::Duration::from_millis(400),
            )
        })
    });
}

criterion_group!(benches, benchmark_content, benchmark_template, benchmark_gesture);
criterion_main!(benches);
