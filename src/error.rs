use crate::samples::ChannelKind;

pub type ReconResult<T> = Result<T, ReconError>;

#[derive(thiserror::Error, Debug)]
pub enum ReconError {
    #[error("load error (line {line}): {reason}")]
    Load { line: usize, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("channel `{name}` holds {found:?} data, requested as {expected:?}")]
    ChannelType {
        name: String,
        expected: ChannelKind,
        found: ChannelKind,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReconError {
    pub fn load(line: usize, reason: impl Into<String>) -> Self {
        Self::Load {
            line,
            reason: reason.into(),
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
