use astc_compression::{
    reference_psnr, AstcCompressor, AstcError, BlockFootprint, Image, PsnrEvaluator,
    PsnrOutcome, Settings, VoidExtentKernel,
};
use rstest::rstest;

use crate::common::{
    create_software_queue, create_wgpu_queue, gradient_image, solid_image,
};

mod common;

fn print_metrics(name: &str, outcome: &PsnrOutcome) {
    let report = outcome.report().expect("comparable images");
    println!("-----------------------");
    println!("Image name: {}", name);
    println!("Overall PSNR: {:.2} dB", report.psnr);
    println!("Overall MSE: {:.6}", report.mse);
    println!(
        "Channel errors: R {:.4} G {:.4} B {:.4} A {:.4}",
        report.channel_sums[0],
        report.channel_sums[1],
        report.channel_sums[2],
        report.channel_sums[3]
    );
    println!("-----------------------");
}

/// Shifts every channel of every second texel by `offset`.
fn perturbed(image: &Image, offset: u8) -> Image {
    let data = image
        .data()
        .chunks_exact(4)
        .enumerate()
        .flat_map(|(index, texel)| {
            let shift = if index % 2 == 0 { offset } else { 0 };
            texel.iter().map(move |value| value.wrapping_add(shift)).collect::<Vec<_>>()
        })
        .collect();
    Image::from_rgba8(image.width(), image.height(), data).unwrap()
}

#[test]
fn software_psnr_of_compressed_image() {
    let queue = create_software_queue();
    let image = gradient_image(64, 48);
    let compressed = AstcCompressor::new(queue.clone(), Settings::default())
        .run(&image, BlockFootprint::Rgba4x4)
        .unwrap();

    let outcome = PsnrEvaluator::new(queue, Settings::default())
        .evaluate(&image, &compressed)
        .unwrap();
    let reference = reference_psnr(
        &image,
        &compressed,
        Some(&VoidExtentKernel),
        &Settings::default(),
    )
    .unwrap();

    print_metrics("gradient 64x48", &outcome);
    let psnr = outcome.psnr().unwrap();
    assert!(psnr > 10.0 && psnr < Settings::DEFAULT_MAX_PSNR);
    assert!((psnr - reference.psnr().unwrap()).abs() < 0.1);
}

#[test]
fn software_multi_pass_reduction() {
    let queue = create_software_queue();
    // 1100 x 1000 texels need three reduction passes.
    let image = gradient_image(1100, 1000);
    let target = perturbed(&image, 16);

    let outcome = PsnrEvaluator::new(queue, Settings::default())
        .evaluate(&image, &target)
        .unwrap();
    let reference = reference_psnr(&image, &target, None, &Settings::default()).unwrap();

    assert!((outcome.psnr().unwrap() - reference.psnr().unwrap()).abs() < 0.1);
}

#[test]
fn incomparable_images_are_reported() {
    let evaluator = PsnrEvaluator::new(create_software_queue(), Settings::default());

    let outcome = evaluator
        .evaluate(&solid_image(16, 16, [0; 4]), &solid_image(16, 8, [0; 4]))
        .unwrap();

    assert_eq!(
        outcome,
        PsnrOutcome::Incomparable {
            source: (16, 16),
            target: (16, 8),
        }
    );
    assert!(matches!(
        outcome.into_result(),
        Err(AstcError::Incomparable {
            source_width: 16,
            source_height: 16,
            target_width: 16,
            target_height: 8,
        })
    ));
}

#[rstest]
#[case(16, 16)]
#[case(33, 31)]
#[case(1100, 1000)]
fn wgpu_reduction_matches_reference(#[case] width: u32, #[case] height: u32) {
    let Some(queue) = create_wgpu_queue() else {
        return;
    };
    let image = gradient_image(width, height);
    let target = perturbed(&image, 9);

    let outcome = PsnrEvaluator::new(queue, Settings::default())
        .evaluate(&image, &target)
        .unwrap();
    let reference = reference_psnr(&image, &target, None, &Settings::default()).unwrap();

    print_metrics(&format!("gradient {width}x{height}"), &outcome);
    assert!((outcome.psnr().unwrap() - reference.psnr().unwrap()).abs() < 0.1);
}

#[test]
fn wgpu_identical_images_are_clamped() {
    let Some(queue) = create_wgpu_queue() else {
        return;
    };
    let image = gradient_image(40, 40);
    let settings = Settings::new().with_max_psnr(60.0);

    let outcome = PsnrEvaluator::new(queue, settings)
        .evaluate(&image, &image)
        .unwrap();

    let report = outcome.report().unwrap();
    assert_eq!(report.psnr, 60.0);
    assert!(report.clamped);
    assert_eq!(report.mse, 0.0);
}

#[rstest]
#[case(BlockFootprint::Rgba4x4)]
#[case(BlockFootprint::Rgb6x6)]
fn wgpu_psnr_of_compressed_image(#[case] footprint: BlockFootprint) {
    let Some(queue) = create_wgpu_queue() else {
        return;
    };
    if !queue.supports_astc_textures() {
        eprintln!("device can't sample ASTC textures, skipping");
        return;
    }

    let image = gradient_image(96, 80);
    let compressed = AstcCompressor::new(queue.clone(), Settings::default())
        .run(&image, footprint)
        .unwrap();

    let outcome = PsnrEvaluator::new(queue, Settings::default())
        .evaluate(&image, &compressed)
        .unwrap();
    let reference = reference_psnr(
        &image,
        &compressed,
        Some(&VoidExtentKernel),
        &Settings::default(),
    )
    .unwrap();

    print_metrics(&format!("gradient 96x80 {footprint}"), &outcome);
    // Hardware decoders may round void-extent colours differently.
    assert!((outcome.psnr().unwrap() - reference.psnr().unwrap()).abs() < 0.5);
}
