//! fmtbridge — Out-of-Process Formatting Coordinator
//!
//! This library integrates an external text-formatting engine into an
//! interactive editor by running it in a separate worker process and
//! exchanging structured requests over a byte stream:
//!
//! - `codec` - Content-Length frame codec over raw byte chunks
//! - `rpc` - JSON-RPC 2.0 channel (dispatch, batches, pending calls)
//! - `supervisor` - worker process lifecycle with crash-restart
//! - `diff` / `reconcile` - minimal-edit application with selection tracking
//! - `format` - typed worker method surface and the high-level service
//!
//! # Data Flow
//!
//! ```text
//! caller ──► WorkerSupervisor::request ──► RpcChannel ──► FrameCodec ──► worker
//!    ▲                                                                    │
//!    └── buffer mutation ◄── EditReconciler ◄── formatted text ◄──────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use fmtbridge::format::{FormattingService, FormatParams};
//! use fmtbridge::supervisor::{ProcessLauncher, WorkerSupervisor};
//!
//! let launcher = ProcessLauncher::new("node", "/project");
//! let supervisor = WorkerSupervisor::new(launcher);
//! supervisor.start("/project/node_modules/.bin/worker.js").await?;
//! supervisor.ready().await?;
//!
//! let service = FormattingService::new(supervisor);
//! let outcome = service.format(params).await?;
//! ```

pub mod codec;
pub mod diff;
pub mod format;
pub mod reconcile;
pub mod rpc;
pub mod supervisor;
