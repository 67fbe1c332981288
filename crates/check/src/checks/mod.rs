//! Built-in checks.

pub mod pingpong;
pub mod pinning;
pub mod soc;

use std::sync::Arc;

use crate::check::Check;

pub use pingpong::PingCheck;
pub use pinning::PinningCheck;
pub use soc::SocCheck;

/// Names accepted by [`by_name`].
pub const NAMES: [&str; 3] = [pingpong::NAME, pinning::NAME, soc::NAME];

/// Look a built-in check up by name.
pub fn by_name(name: &str) -> Option<Arc<dyn Check>> {
    match name {
        pingpong::NAME => Some(Arc::new(PingCheck::new())),
        pinning::NAME => Some(Arc::new(PinningCheck::new())),
        soc::NAME => Some(Arc::new(SocCheck::new())),
        _ => None,
    }
}
