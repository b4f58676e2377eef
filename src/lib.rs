//! gpuoa - accumulation of GPU OA counter reports.
//!
//! The sampling server streams raw OA reports and tracepoint samples; a
//! [`Session`] folds consecutive reports into counter deltas over time
//! windows, attributes GPU time to hardware contexts and correlates those
//! contexts with the processes that submitted work.
//!
//! # Modules
//!
//! - [`chunk`] - reference-counted storage for delivered blocks
//! - [`accumulator`] - folding report pairs into 64bit deltas
//! - [`window`] - accumulated windows and bounded window tracks
//! - [`session`] - the controller tying streams and windows together
//! - [`tracepoint`] - tracepoint formats, samples and correlation
//!
//! # Example
//!
//! ```no_run
//! use gpuoa::{Config, NullSink, Session};
//! use std::path::Path;
//!
//! let config = Config::load(Path::new("gpuoa.json")).expect("Failed to load config");
//! let mut session = Session::new(&config, Box::new(NullSink)).expect("Failed to create session");
//! session.start_sampling();
//! // feed payloads with session.handle_data(...)
//! println!("busyness: {}", session.busyness());
//! ```

pub mod accumulator;
pub mod capture;
pub mod chunk;
pub mod config;
pub mod context;
pub mod metrics;
pub mod oa;
pub mod process;
pub mod record;
pub mod ringbuf;
pub mod session;
pub mod tracepoint;
pub mod transport;
pub mod window;

pub use accumulator::OaAccumulator;
pub use config::Config;
pub use context::HwContext;
pub use metrics::{Counter, DevInfo, MetricSet, OaFormat};
pub use session::{ReplayedReport, Session, SessionStats};
pub use transport::{NullSink, RecordingSink, Request, RequestSink, ServerMessage};
pub use window::{AccumulatedWindow, WindowId};
