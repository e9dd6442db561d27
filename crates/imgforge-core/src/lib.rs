//! Core engines for imgforge: toolchain cache, overlay staging, build
//! orchestration, flash writing, and the durable state store. Adapters (CLI,
//! HTTP, MCP) talk to [`service::ImgforgeService`] and never reach into the
//! engines directly.

pub mod build;
pub mod config;
pub mod flash;
pub mod overlay;
pub mod service;
pub mod store;
pub mod toolchain;

mod lock;
mod util;

pub use config::Settings;
pub use service::ImgforgeService;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cooperative cancellation flag shared between a caller and the engines.
/// Engines poll it at suspension points; subprocess supervision converts it
/// into signal escalation.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }
}
