#![deny(unused_variables)]
#![deny(dead_code)]
#![deny(unused_imports)]
#![deny(clippy::no_effect_underscore_binding)]

pub mod config;
pub mod estimate;
pub mod inference;
pub mod linalg;
pub mod marginal;
pub mod partition;
pub mod pipeline;
pub mod products;
pub mod resolve;
pub mod types;

#[path = "../shared/store.rs"]
pub mod store;
#[path = "../shared/volume.rs"]
pub mod volume;

pub mod shared {
    pub use super::store;
    pub use super::volume;
}
