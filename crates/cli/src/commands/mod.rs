pub mod ingest;
pub mod inspect;
pub mod logging;
pub mod project;
pub mod status;
pub mod symbolize;
pub mod util;

pub use ingest::*;
pub use inspect::*;
pub use logging::*;
pub use project::*;
pub use status::*;
pub use symbolize::*;
pub use util::*;
