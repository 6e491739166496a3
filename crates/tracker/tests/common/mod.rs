pub mod fakes;

#[allow(unused_imports)]
pub use fakes::{FakeRemote, FlakyStore, Harness, params, params_with_sensor};
