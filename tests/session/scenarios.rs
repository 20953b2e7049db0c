//! BDD scenarios for the session lifecycle.

use rstest_bdd_macros::scenario;

use super::test_helpers::{SessionContext, session_context};

#[scenario(
    path = "tests/features/session_lifecycle.feature",
    name = "A session becomes ready on the third attempt"
)]
fn scenario_ready_on_third_attempt(session_context: SessionContext) {
    let _ = session_context;
}

#[scenario(
    path = "tests/features/session_lifecycle.feature",
    name = "Stopping a session releases everything"
)]
fn scenario_stop_releases_everything(session_context: SessionContext) {
    let _ = session_context;
}

#[scenario(
    path = "tests/features/session_lifecycle.feature",
    name = "A session that never becomes ready is torn down"
)]
fn scenario_never_ready(session_context: SessionContext) {
    let _ = session_context;
}

#[scenario(
    path = "tests/features/session_lifecycle.feature",
    name = "A failed session is kept for inspection on request"
)]
fn scenario_failed_session_kept(session_context: SessionContext) {
    let _ = session_context;
}
