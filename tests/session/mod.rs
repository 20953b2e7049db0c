//! Step definitions and fixtures for the session lifecycle scenarios.

mod bdd_steps;
mod scenarios;
mod test_helpers;
