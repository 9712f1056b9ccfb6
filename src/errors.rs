use std::io;

use itertools::Itertools;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum KconfigError {
    #[error("{file}:{line}: {message}")]
    Parse {
        file: String,
        line: usize,
        message: String,
    },

    #[error("{file}:{line}: environment variable `{var}` is not set")]
    Env {
        file: String,
        line: usize,
        var: String,
    },

    #[error("circular depends-on chain: {}", names.iter().format(", "))]
    CircularDependency { names: Vec<String> },

    #[error("{file}:{line}: choice `{choice}` mixes bool and tristate children")]
    MixedChoiceTypes {
        file: String,
        line: usize,
        choice: String,
    },

    #[error("{} error(s) while evaluating a dependency layer", errors.len())]
    LayerFailure { errors: Vec<String> },

    #[error(transparent)]
    Io {
        #[from]
        source: io::Error,
    },
}

impl KconfigError {
    pub fn parse(file: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        KconfigError::Parse {
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

pub type KconfigResult<T> = anyhow::Result<T>;
