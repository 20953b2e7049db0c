//! BDD step definitions for the session lifecycle.

use std::future::pending;

use hatch::{
    CreateRequest, Description, ProviderKind, SessionError, SessionFilter, SessionSpec,
    SessionStatus,
};
use rstest_bdd_macros::{given, then, when};
use tokio::runtime::Runtime;

use super::test_helpers::{CreateFailureKind, CreateResult, SessionContext};

#[derive(Debug, thiserror::Error)]
pub enum StepError {
    #[error("assertion failed: {0}")]
    Assertion(String),
}

#[given("a vm-instance driver that is ready after \"{attempts}\" attempts")]
fn ready_after(mut session_context: SessionContext, attempts: usize) -> SessionContext {
    let waiting = attempts.saturating_sub(1);
    session_context.driver = session_context
        .driver
        .with_descriptions(std::iter::repeat_with(Description::provisioning).take(waiting));
    session_context
}

#[given("a vm-instance driver that never becomes ready")]
fn never_ready(mut session_context: SessionContext) -> SessionContext {
    session_context.driver = session_context
        .driver
        .with_fallback(Description::provisioning());
    session_context
}

#[given("a vm-instance driver that fails with \"{reason}\"")]
fn fails_with(mut session_context: SessionContext, reason: String) -> SessionContext {
    session_context.driver = session_context
        .driver
        .with_fallback(Description::failed(reason));
    session_context
}

#[given("failed sessions are kept")]
fn keep_failed(mut session_context: SessionContext) -> SessionContext {
    session_context.keep_on_failure = true;
    session_context
}

#[when("I create a session")]
fn create_session(mut session_context: SessionContext) -> Result<SessionContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let spec = SessionSpec::builder("scenario")
        .build()
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    let request = CreateRequest::new(ProviderKind::VmInstance, spec)
        .keep_on_failure(session_context.keep_on_failure);
    let manager = session_context.manager();

    let result = runtime.block_on(async { manager.create(&request, pending()).await });
    session_context.outcome = Some(match result {
        Ok(session) => CreateResult::Ready {
            endpoint: session
                .endpoint()
                .map_or_else(String::new, ToString::to_string),
            id: session.id,
        },
        Err(err) => CreateResult::Failure {
            kind: failure_kind(&err),
            message: err.to_string(),
        },
    });
    Ok(session_context)
}

#[when("I stop the session")]
fn stop_session(session_context: SessionContext) -> Result<SessionContext, StepError> {
    let runtime = Runtime::new().map_err(|err| StepError::Assertion(err.to_string()))?;
    let id = session_context
        .ready_id()
        .ok_or_else(|| StepError::Assertion(String::from("no ready session to stop")))?
        .to_owned();
    let manager = session_context.manager();
    runtime
        .block_on(async { manager.stop(&id).await })
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    Ok(session_context)
}

#[then("the session is ready at \"{endpoint}\"")]
fn ready_at(session_context: &SessionContext, endpoint: String) -> Result<(), StepError> {
    match &session_context.outcome {
        Some(CreateResult::Ready { endpoint: actual, .. }) if *actual == endpoint => Ok(()),
        other => Err(StepError::Assertion(format!(
            "expected ready at {endpoint}, got {other:?}"
        ))),
    }
}

#[then("the driver was described \"{count}\" times")]
fn described(session_context: &SessionContext, count: usize) -> Result<(), StepError> {
    let actual = session_context.driver.describe_calls();
    if actual == count {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {count} describe calls, got {actual}"
        )))
    }
}

#[then("the create error kind is \"{kind}\"")]
fn create_error_kind(session_context: &SessionContext, kind: String) -> Result<(), StepError> {
    let expected = match kind.as_str() {
        "timeout" => CreateFailureKind::Timeout,
        "terminal" => CreateFailureKind::Terminal,
        other => {
            return Err(StepError::Assertion(format!("unknown failure kind {other}")));
        }
    };
    let Some(CreateResult::Failure { kind: actual, message }) = &session_context.outcome else {
        return Err(StepError::Assertion(String::from(
            "expected failure outcome",
        )));
    };
    if *actual == expected {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected {expected:?}, got {actual:?}: {message}"
        )))
    }
}

#[then("the remote resource was terminated")]
fn resource_terminated(session_context: &SessionContext) -> Result<(), StepError> {
    let driver = &session_context.driver;
    if !driver.created().is_empty() && driver.active().is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "resources still active: {:?}",
            driver.active()
        )))
    }
}

#[then("the registry is empty")]
fn registry_empty(session_context: &SessionContext) -> Result<(), StepError> {
    let sessions = session_context
        .registry()
        .list(&SessionFilter::default())
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if sessions.is_empty() {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected no sessions, found {}",
            sessions.len()
        )))
    }
}

#[then("no key files remain")]
fn no_key_files(session_context: &SessionContext) -> Result<(), StepError> {
    match session_context.key_files() {
        0 => Ok(()),
        count => Err(StepError::Assertion(format!("{count} key files remain"))),
    }
}

#[then("the registry holds a \"{status}\" session")]
fn registry_holds(session_context: &SessionContext, status: String) -> Result<(), StepError> {
    let expected: SessionStatus = status
        .parse()
        .map_err(|err: hatch::session::UnknownStatus| StepError::Assertion(err.to_string()))?;
    let sessions = session_context
        .registry()
        .list(&SessionFilter {
            provider: None,
            status: Some(expected),
        })
        .map_err(|err| StepError::Assertion(err.to_string()))?;
    if sessions.len() == 1 {
        Ok(())
    } else {
        Err(StepError::Assertion(format!(
            "expected one {status} session, found {}",
            sessions.len()
        )))
    }
}

const fn failure_kind(err: &SessionError) -> CreateFailureKind {
    match err {
        SessionError::ReadinessTimeout { .. } => CreateFailureKind::Timeout,
        SessionError::TerminalFailure { .. } => CreateFailureKind::Terminal,
        _ => CreateFailureKind::Other,
    }
}
