use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error:\n{0}")]
    Parse(String),

    #[error("invalid model: {0}")]
    Model(String),

    /// Evidence or a model that cannot be grounded.
    #[error("grounding failed: {0}")]
    Ground(String),

    /// Ground structure exceeds the compilation bound.
    #[error("ground structure too large to compile ({0} outcomes)")]
    Compile(u64),

    #[error("example {example}: evidence probability is zero under the current weights")]
    ZeroEvidence { example: usize },
}

impl Error {
    /// Example-scoped failures are skipped with a warning during example
    /// preparation; everything else aborts the run.
    pub fn example_scoped(&self) -> bool {
        matches!(self, Self::Ground(_) | Self::Compile(_))
    }
}
