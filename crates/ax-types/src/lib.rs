pub mod market;
pub mod orders;
pub mod portfolio;
pub mod strategy;
pub mod run;
pub mod leaderboard;
pub mod errors;

pub use market::*;
pub use orders::*;
pub use portfolio::*;
pub use strategy::*;
pub use run::*;
pub use leaderboard::*;
pub use errors::*;
