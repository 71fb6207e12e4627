//! Backend command sets.
//!
//! - `echo`: upper-cased echo, the reference behavior
//! - `image`: image display frames (regions, count limits, averages)
//! - `detector`: pixel detector acquisition with binary frame readout

pub mod detector;
pub mod echo;
pub mod image;

use crate::config::{BackendConfig, BackendKind};
use crate::dispatcher::Dispatcher;
use std::sync::Arc;
use tracing::info;

/// Build the dispatcher selected by configuration.
pub fn build(config: &BackendConfig) -> Arc<dyn Dispatcher> {
    info!(backend = ?config.kind, "Initializing backend");

    match config.kind {
        BackendKind::Echo => Arc::new(echo::EchoDispatcher),
        BackendKind::Image => Arc::new(image::ImageServer::new(
            config.base_dir.clone(),
            Box::new(image::TextImageReader),
            config.initial_frames,
        )),
        BackendKind::Detector => Arc::new(detector::DetectorServer::new(Arc::new(
            detector::SimulatedDetector::default(),
        ))),
    }
}
