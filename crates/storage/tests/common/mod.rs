pub mod fixtures;

#[allow(unused_imports)]
pub use fixtures::{chunked_stream, seeded_bytes};
