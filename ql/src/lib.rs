pub mod learn;
pub mod log;
pub mod model;
pub mod prelude;
pub mod util;
