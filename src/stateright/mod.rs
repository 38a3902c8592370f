//! Stateright model checking.
//!
//! Exhaustive state-space exploration of protocols whose interleavings are
//! too many to cover with simulation alone. Models compile only under
//! `cfg(test)`; the exhaustive checks are `#[ignore]` to keep CI fast.
//!
//! ## Available Models
//!
//! - `checkpoint`: barrier checkpoints across sinks, with sink failure and
//!   coordinator crash
//!
//! ## Running Model Checks
//!
//! ```bash
//! cargo test stateright -- --ignored --nocapture
//! ```

pub mod checkpoint;

pub use checkpoint::CheckpointModel;
