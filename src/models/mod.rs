pub mod progress;
pub mod proxy;
pub mod work;

pub use progress::*;
pub use proxy::*;
pub use work::*;
