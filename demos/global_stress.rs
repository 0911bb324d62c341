//! Installs the zone allocator as the global allocator and churns through a
//! randomized mix of buffers from every size class, growing and shrinking
//! them through `realloc`, and checking the allocator's own invariants as it
//! goes.
//!
//! No logger is installed: logging from inside the global allocator would
//! allocate while the allocator is locked.

use zone_allocator::{UnixAllocator, SMALL_MAX, TINY_MAX};

use rand::distributions::{Distribution, Uniform, WeightedIndex};
use rand::{Rng, RngCore, SeedableRng};

#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

// Steps to run
const STEPS: usize = 64 * 1024;
// Buffers kept alive at most
const MAX_LIVE: usize = 2048;

// A buffer whose every byte is `tag`, so corruption shows up on inspection.
struct Tagged {
    bytes: Vec<u8>,
    tag: u8,
}

impl Tagged {
    fn new(len: usize, tag: u8) -> Self {
        Tagged {
            bytes: vec![tag; len],
            tag,
        }
    }

    fn check(&self) {
        assert!(
            self.bytes.iter().all(|&b| b == self.tag),
            "buffer of {} bytes lost its contents",
            self.bytes.len()
        );
    }

    // Goes through realloc in both directions
    fn reshape(&mut self, len: usize) {
        self.check();
        if len > self.bytes.len() {
            self.bytes.resize(len, self.tag);
        } else {
            self.bytes.truncate(len);
            self.bytes.shrink_to_fit();
        }
        self.check();
    }
}

// Request sizes biased toward tiny, with some small and a few large.
fn random_len<R: Rng>(rng: &mut R, classes: &WeightedIndex<u32>) -> usize {
    match classes.sample(rng) {
        0 => rng.gen_range(0..=TINY_MAX),
        1 => rng.gen_range(TINY_MAX + 1..=SMALL_MAX),
        _ => rng.gen_range(SMALL_MAX + 1..=16 * SMALL_MAX),
    }
}

fn main() {
    let steps: usize = std::env::args()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(STEPS);

    let seed: u64 = rand::thread_rng().next_u64();
    println!("Running {} steps with seed {}", steps, seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let classes = WeightedIndex::new([16u32, 4, 1]).unwrap();

    let mut live: Vec<Tagged> = Vec::with_capacity(MAX_LIVE);
    for step in 1..=steps {
        let tag = (step % 255) as u8 + 1;
        let action = if live.is_empty() {
            0
        } else if live.len() >= MAX_LIVE {
            2
        } else {
            Uniform::new(0, 3).sample(&mut rng)
        };

        match action {
            0 => {
                let len = random_len(&mut rng, &classes);
                live.push(Tagged::new(len, tag));
            }
            1 => {
                let ix = rng.gen_range(0..live.len());
                let len = random_len(&mut rng, &classes);
                live[ix].reshape(len);
            }
            _ => {
                let ix = rng.gen_range(0..live.len());
                let buffer = live.swap_remove(ix);
                buffer.check();
            }
        }

        let (validity, stats) = ALLOCATOR.stats();
        assert!(validity.is_valid(), "step {}: {:?}", step, validity);
        if step % 4096 == 0 {
            println!(
                "step {:>6}: {} buffers, {} zones, {} live / {} free chunks, {} large",
                step,
                live.len(),
                stats.zones,
                stats.live_chunks,
                stats.free_chunks,
                stats.large_chunks
            );
        }
    }

    for buffer in live.drain(..) {
        buffer.check();
    }
    let (validity, stats) = ALLOCATOR.stats();
    assert!(validity.is_valid(), "{:?}", validity);
    println!("Finished: {:?}", stats);
}
