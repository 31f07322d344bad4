//! Shared scenario-test harness for the pipeline's crates: DB fixture
//! builders and in-memory doubles for the outbox's downstream sink and the
//! graph builder's sink. Only ever a dev-dependency — never wire this crate
//! into a production binary's `[dependencies]`.

mod fixtures;
mod sinks;

pub use ctp_db::testkit_db_pool;
pub use fixtures::{seed_pending_relationship, seed_run_and_file, PoiFixture};
pub use sinks::{RecordingDownstreamSink, RecordingGraphSink};
