use crate::{ConfigError, InfeasibleError, InvariantError, VariantError};

#[derive(Debug, thiserror::Error)]
pub enum TilingError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Infeasible(#[from] InfeasibleError),
    #[error(transparent)]
    Variant(#[from] VariantError),
    #[error(transparent)]
    Invariant(#[from] InvariantError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
