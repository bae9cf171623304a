pub mod backlog;
pub mod constraints;
pub mod ids;
pub mod item;
pub mod partition;
pub mod shadow;

pub use backlog::*;
pub use constraints::*;
pub use ids::*;
pub use item::*;
pub use partition::*;
pub use shadow::*;
