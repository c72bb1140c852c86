pub mod case;
pub mod enums;
pub mod event;
pub mod verdict;

pub use case::*;
pub use enums::*;
pub use event::*;
pub use verdict::*;
