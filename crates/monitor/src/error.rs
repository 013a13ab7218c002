#![forbid(unsafe_code)]

use crate::introspection::{ImageError, IntrospectionError};
use crate::walker::WalkAbort;
use config::ObjectClass;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to open introspection session for `{guest}`: {source}")]
    CollaboratorInit {
        guest: String,
        #[source]
        source: IntrospectionError,
    },

    #[error("address translation failed: {0}")]
    Translation(#[source] IntrospectionError),

    #[error("guest memory read failed: {0}")]
    Read(#[source] IntrospectionError),

    #[error("none of the {attempted} {class} targets could be watched")]
    Register { class: ObjectClass, attempted: usize },

    #[error("initial {class} scan aborted: {source}")]
    WalkAbort {
        class: ObjectClass,
        #[source]
        source: WalkAbort,
    },

    #[error("failed to pause guest: {0}")]
    Pause(#[source] IntrospectionError),

    #[error("config error: {0}")]
    Config(#[from] config::Error),

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("failed to spawn {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("analysis dispatcher panicked")]
    DispatcherPanicked,

    #[error("introspection session failed: {0}")]
    Session(#[source] IntrospectionError),
}

impl From<IntrospectionError> for Error {
    fn from(err: IntrospectionError) -> Self {
        match err {
            IntrospectionError::Unmapped(_) => Error::Translation(err),
            IntrospectionError::ReadVirtual(_) | IntrospectionError::ReadPhysical(_) => {
                Error::Read(err)
            }
            err => Error::Session(err),
        }
    }
}

impl Error {
    /// Whether the error happened while building the initial watchpoint set.
    pub fn is_registration(&self) -> bool {
        matches!(self, Error::Register { .. } | Error::WalkAbort { .. })
    }
}
