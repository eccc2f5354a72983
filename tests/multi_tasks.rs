use std::sync::Arc;
use std::thread;

use astc_compression::{AstcCompressor, BlockFootprint, ComputeQueue, Image, Settings};

use crate::common::{create_software_queue, create_wgpu_queue, gradient_image};

mod common;

const THREADS: usize = 8;
const ROUNDS: usize = 4;

fn task(index: usize) -> (Image, BlockFootprint) {
    let sizes = [(64, 64), (97, 33), (128, 70), (33, 200)];
    let (width, height) = sizes[index % sizes.len()];

    (
        gradient_image(width, height),
        BlockFootprint::ALL[index % BlockFootprint::ALL.len()],
    )
}

/// Runs `THREADS` compressors on one shared queue and checks every artifact
/// against the software queue.
fn test_shared_queue_compression<Q: ComputeQueue>(queue: Arc<Q>) {
    let software = AstcCompressor::new(create_software_queue(), Settings::default());
    let expected: Vec<Vec<u8>> = (0..THREADS)
        .map(|index| {
            let (image, footprint) = task(index);
            software.run(&image, footprint).unwrap().into_data()
        })
        .collect();

    thread::scope(|scope| {
        for (index, expected) in expected.iter().enumerate() {
            let compressor = AstcCompressor::new(queue.clone(), Settings::default());

            scope.spawn(move || {
                let (image, footprint) = task(index);

                for round in 0..ROUNDS {
                    let compressed = compressor.run(&image, footprint).unwrap();
                    assert!(
                        compressed.data() == expected.as_slice(),
                        "task {index} round {round} ({footprint}) differs"
                    );
                }
            });
        }
    });
}

#[test]
fn software_queue_shared_between_threads() {
    test_shared_queue_compression(create_software_queue());
}

#[test]
fn wgpu_queue_shared_between_threads() {
    let Some(queue) = create_wgpu_queue() else {
        return;
    };

    test_shared_queue_compression(queue);
}
