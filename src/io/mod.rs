//! Randomness abstraction shared by production code and simulation.
//!
//! Anything that makes a random decision (retry jitter, fault injection,
//! workload generation) goes through [`Rng`] so a simulation run can be
//! replayed from its seed.

pub mod simulation;

pub use simulation::SimulatedRng;

/// Random number source.
pub trait Rng: Send + 'static {
    fn next_u64(&mut self) -> u64;

    fn gen_bool(&mut self, probability: f64) -> bool;

    /// Uniform in `[min, max)`. Returns `min` when the range is empty.
    fn gen_range(&mut self, min: u64, max: u64) -> u64;

    fn shuffle<T>(&mut self, slice: &mut [T]);
}

pub mod production {
    use super::Rng;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// OS-seeded generator for production paths.
    pub struct ProductionRng {
        inner: StdRng,
    }

    impl ProductionRng {
        pub fn new() -> Self {
            ProductionRng {
                inner: StdRng::from_entropy(),
            }
        }
    }

    impl Default for ProductionRng {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Rng for ProductionRng {
        fn next_u64(&mut self) -> u64 {
            use rand::RngCore;
            self.inner.next_u64()
        }

        fn gen_bool(&mut self, probability: f64) -> bool {
            use rand::Rng as _;
            self.inner.gen_bool(probability.clamp(0.0, 1.0))
        }

        fn gen_range(&mut self, min: u64, max: u64) -> u64 {
            use rand::Rng as _;
            if min >= max {
                return min;
            }
            self.inner.gen_range(min..max)
        }

        fn shuffle<T>(&mut self, slice: &mut [T]) {
            use rand::seq::SliceRandom;
            slice.shuffle(&mut self.inner);
        }
    }
}

pub use production::ProductionRng;
