pub mod providers;
pub mod binance;
pub mod cache;
pub mod normalizer;

pub use providers::*;
pub use binance::*;
pub use cache::*;
pub use normalizer::*;
