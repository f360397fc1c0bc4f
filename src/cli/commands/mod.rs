//! CLI command implementations

pub mod apps;
pub mod config;
pub mod env;
pub mod ps;
pub mod push;
pub mod run;
pub mod scale;

pub use apps::{create, delete, list as apps};
pub use config::execute as config;
pub use env::execute as env;
pub use ps::{ps, releases};
pub use push::execute as push;
pub use run::execute as run;
pub use scale::execute as scale;
