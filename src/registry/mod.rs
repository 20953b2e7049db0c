//! Persisted session registry.
//!
//! Sessions are stored as a JSON array in `sessions.json` under the state
//! directory. Every mutation reads the whole file, applies the change, writes
//! a temporary sibling, and renames it over the original. The registry is
//! safe for sequential use within one process; concurrent processes mutating
//! the same file race and the last writer wins.

use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::session::{ProviderKind, Session, SessionState, SessionStatus, TransitionError};

/// File name of the registry inside the state directory.
pub const REGISTRY_FILE_NAME: &str = "sessions.json";

/// Errors raised by the session registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Raised when the registry file or directory cannot be accessed.
    #[error("failed to access {path}: {message}")]
    Io {
        /// Path being accessed.
        path: Utf8PathBuf,
        /// Operating system error string.
        message: String,
    },
    /// Raised when the registry file holds invalid JSON.
    #[error("failed to parse {path}: {message}")]
    Parse {
        /// Registry file path.
        path: Utf8PathBuf,
        /// Parser error string.
        message: String,
    },
    /// Raised when appending a session whose id is already recorded.
    #[error("session {id} is already recorded")]
    Duplicate {
        /// Conflicting id.
        id: String,
    },
    /// Raised when no session matches an id or prefix.
    #[error("no session matches '{query}'")]
    NotFound {
        /// Id or prefix that was looked up.
        query: String,
    },
    /// Raised when a prefix matches more than one session.
    #[error("'{prefix}' matches several sessions: {}", .matches.join(", "))]
    Ambiguous {
        /// Prefix that was looked up.
        prefix: String,
        /// Ids of every matching session.
        matches: Vec<String>,
    },
    /// Raised when an update breaks the session lifecycle.
    #[error("cannot update session {id}: {source}")]
    Transition {
        /// Session being updated.
        id: String,
        /// Rejected transition.
        #[source]
        source: TransitionError,
    },
}

/// Optional constraints applied by [`SessionRegistry::list`].
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct SessionFilter {
    /// Only sessions on this provider.
    pub provider: Option<ProviderKind>,
    /// Only sessions in this status.
    pub status: Option<SessionStatus>,
}

impl SessionFilter {
    /// Reports whether `session` satisfies every set constraint.
    #[must_use]
    pub fn matches(&self, session: &Session) -> bool {
        self.provider.is_none_or(|provider| provider == session.provider)
            && self.status.is_none_or(|status| status == session.status())
    }
}

/// Durable store of session records.
#[derive(Clone, Debug)]
pub struct SessionRegistry {
    dir: Utf8PathBuf,
}

impl SessionRegistry {
    /// Opens the registry stored under `state_dir`. Nothing is created until
    /// the first mutation.
    #[must_use]
    pub fn new(state_dir: impl Into<Utf8PathBuf>) -> Self {
        Self {
            dir: state_dir.into(),
        }
    }

    /// Returns the path of the registry file.
    #[must_use]
    pub fn path(&self) -> Utf8PathBuf {
        self.dir.join(REGISTRY_FILE_NAME)
    }

    /// Records a new session.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Duplicate`] when the id is taken, or an I/O or
    /// parse error.
    pub fn append(&self, session: &Session) -> Result<(), RegistryError> {
        self.mutate(|sessions| {
            if sessions.iter().any(|existing| existing.id == session.id) {
                return Err(RegistryError::Duplicate {
                    id: session.id.clone(),
                });
            }
            sessions.push(session.clone());
            Ok(())
        })?;
        debug!(session = %session.id, status = %session.status(), "recorded session");
        Ok(())
    }

    /// Moves session `id` to `next`, refreshing its `last_seen_at`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] for an unknown id,
    /// [`RegistryError::Transition`] when the lifecycle forbids the move, or
    /// an I/O or parse error.
    pub fn update(&self, id: &str, next: SessionState) -> Result<Session, RegistryError> {
        let updated = self.mutate(|sessions| {
            let session = sessions
                .iter_mut()
                .find(|session| session.id == id)
                .ok_or_else(|| RegistryError::NotFound {
                    query: id.to_owned(),
                })?;
            session
                .transition(next)
                .map_err(|source| RegistryError::Transition {
                    id: id.to_owned(),
                    source,
                })?;
            Ok(session.clone())
        })?;
        debug!(session = id, status = %updated.status(), "updated session");
        Ok(updated)
    }

    /// Deletes session `id`, returning the removed record if there was one.
    ///
    /// # Errors
    ///
    /// Returns an I/O or parse error.
    pub fn remove(&self, id: &str) -> Result<Option<Session>, RegistryError> {
        let removed = self.mutate(|sessions| {
            let index = sessions.iter().position(|session| session.id == id);
            Ok(index.map(|found| sessions.remove(found)))
        })?;
        if removed.is_some() {
            debug!(session = id, "removed session");
        }
        Ok(removed)
    }

    /// Looks up a session by exact id.
    ///
    /// # Errors
    ///
    /// Returns an I/O or parse error.
    pub fn find(&self, id: &str) -> Result<Option<Session>, RegistryError> {
        Ok(self.load()?.into_iter().find(|session| session.id == id))
    }

    /// Lists sessions matching `filter`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an I/O or parse error.
    pub fn list(&self, filter: &SessionFilter) -> Result<Vec<Session>, RegistryError> {
        let mut sessions = self.load()?;
        sessions.retain(|session| filter.matches(session));
        sessions.sort_by(|lhs, rhs| lhs.created_at.cmp(&rhs.created_at));
        Ok(sessions)
    }

    /// Finds the session whose id equals `query` or uniquely starts with it.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::NotFound`] when nothing matches,
    /// [`RegistryError::Ambiguous`] when several ids share the prefix, or an
    /// I/O or parse error.
    pub fn resolve(&self, query: &str) -> Result<Session, RegistryError> {
        let needle = query.trim();
        if needle.is_empty() {
            return Err(RegistryError::NotFound {
                query: String::new(),
            });
        }
        let sessions = self.load()?;
        if let Some(exact) = sessions.iter().find(|session| session.id == needle) {
            return Ok(exact.clone());
        }
        let mut matches: Vec<Session> = sessions
            .into_iter()
            .filter(|session| session.id.starts_with(needle))
            .collect();
        match matches.len() {
            0 => Err(RegistryError::NotFound {
                query: needle.to_owned(),
            }),
            1 => matches.pop().ok_or_else(|| RegistryError::NotFound {
                query: needle.to_owned(),
            }),
            _ => Err(RegistryError::Ambiguous {
                prefix: needle.to_owned(),
                matches: matches.into_iter().map(|session| session.id).collect(),
            }),
        }
    }

    fn mutate<T>(
        &self,
        change: impl FnOnce(&mut Vec<Session>) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut sessions = self.load()?;
        let outcome = change(&mut sessions)?;
        self.store(&sessions)?;
        Ok(outcome)
    }

    fn load(&self) -> Result<Vec<Session>, RegistryError> {
        let path = self.path();
        let dir = match Dir::open_ambient_dir(&self.dir, ambient_authority()) {
            Ok(dir) => dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&self.dir, &err)),
        };
        let contents = match dir.read_to_string(REGISTRY_FILE_NAME) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&path, &err)),
        };
        if contents.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&contents).map_err(|err| RegistryError::Parse {
            path,
            message: err.to_string(),
        })
    }

    fn store(&self, sessions: &[Session]) -> Result<(), RegistryError> {
        let path = self.path();
        Dir::create_ambient_dir_all(&self.dir, ambient_authority())
            .map_err(|err| io_error(&self.dir, &err))?;
        let dir = Dir::open_ambient_dir(&self.dir, ambient_authority())
            .map_err(|err| io_error(&self.dir, &err))?;

        let mut rendered =
            serde_json::to_string_pretty(sessions).map_err(|err| RegistryError::Parse {
                path: path.clone(),
                message: err.to_string(),
            })?;
        rendered.push('\n');

        let temp_name = format!(".{REGISTRY_FILE_NAME}.{}.tmp", Uuid::new_v4().simple());
        let temp_path = self.dir.join(&temp_name);
        dir.write(&temp_name, rendered)
            .map_err(|err| io_error(&temp_path, &err))?;
        if let Err(err) = dir.rename(&temp_name, &dir, REGISTRY_FILE_NAME) {
            dir.remove_file(&temp_name).ok();
            return Err(io_error(&path, &err));
        }
        Ok(())
    }
}

fn io_error(path: &Utf8Path, err: &io::Error) -> RegistryError {
    RegistryError::Io {
        path: path.to_path_buf(),
        message: err.to_string(),
    }
}
