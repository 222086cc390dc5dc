//! # perfflux-types
//!
//! Core value types shared by the perfflux pipeline. A monitoring perfdata
//! record is parsed into one [`MetricPoint`] per performance label; status
//! interface events become [`EventRecord`]s; both travel to backend workers
//! wrapped in a [`DispatchJob`].
//!
//! ## Features
//!
//! - `serde`: derive `Serialize`/`Deserialize` for all types
//!
//! ## Example
//!
//! ```rust
//! use perfflux_types::{DispatchJob, MetricPoint};
//!
//! let point = MetricPoint::builder()
//!     .hostname("web01")
//!     .service("disk /")
//!     .command("check_disk")
//!     .label("used")
//!     .unit("MB")
//!     .time_ms(1_441_791_000_000)
//!     .field("value", "4.0")
//!     .field("warn", "2.0")
//!     .tag("warn-fill", "none")
//!     .build();
//!
//! assert_eq!(point.field("value"), Some("4.0"));
//! let job = DispatchJob::from(point);
//! assert!(job.is_point());
//! ```

mod event;
mod job;
mod point;

pub use event::*;
pub use job::*;
pub use point::*;
