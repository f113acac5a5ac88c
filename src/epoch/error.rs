use thiserror::Error;

use super::EpochId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EpochError {
    #[error("epoch {0:?} is rooted; this operation requires a collective epoch")]
    NotCollective(EpochId),

    #[error("epoch {0:?} is collective; this operation requires a rooted epoch")]
    NotRooted(EpochId),

    #[error("epoch {0:?} has already terminated")]
    AlreadyTerminated(EpochId),
}
