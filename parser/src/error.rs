use thiserror::Error;

/// Coarse classification of a [`GrammarError`], stable across messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    InvalidVocabulary,
    SchemaCompile,
    StructuralTagCompile,
    IncompatibleVocabulary,
    GrammarViolation,
    FrozenState,
    ResourceLimit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GrammarError {
    /// A vocabulary entry could not be decoded under the declared encoding,
    /// or the stop/special token ids are out of range.
    #[error("invalid vocabulary: {0}")]
    InvalidVocabulary(String),

    #[error("JSON schema compilation failed: {0}")]
    SchemaCompile(String),

    #[error("structural tag compilation failed: {0}")]
    StructuralTagCompile(String),

    /// Token ids or bitmask buffers that do not fit the grammar's vocabulary.
    #[error("incompatible vocabulary: {0}")]
    IncompatibleVocabulary(String),

    #[error("token rejected by grammar: {0}")]
    GrammarViolation(String),

    /// The matcher is terminated (rejected or complete); only reset() helps.
    #[error("matcher is frozen: {0}")]
    FrozenState(String),

    #[error("resource limit exceeded: {0}")]
    ResourceLimit(String),
}

impl GrammarError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            GrammarError::InvalidVocabulary(_) => ErrorKind::InvalidVocabulary,
            GrammarError::SchemaCompile(_) => ErrorKind::SchemaCompile,
            GrammarError::StructuralTagCompile(_) => ErrorKind::StructuralTagCompile,
            GrammarError::IncompatibleVocabulary(_) => ErrorKind::IncompatibleVocabulary,
            GrammarError::GrammarViolation(_) => ErrorKind::GrammarViolation,
            GrammarError::FrozenState(_) => ErrorKind::FrozenState,
            GrammarError::ResourceLimit(_) => ErrorKind::ResourceLimit,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            GrammarError::InvalidVocabulary(m)
            | GrammarError::SchemaCompile(m)
            | GrammarError::StructuralTagCompile(m)
            | GrammarError::IncompatibleVocabulary(m)
            | GrammarError::GrammarViolation(m)
            | GrammarError::FrozenState(m)
            | GrammarError::ResourceLimit(m) => m,
        }
    }

    pub(crate) fn schema(e: anyhow::Error) -> Self {
        GrammarError::SchemaCompile(format!("{e:#}"))
    }

    pub(crate) fn structural_tag(e: anyhow::Error) -> Self {
        GrammarError::StructuralTagCompile(format!("{e:#}"))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kind_and_message() {
        let e = GrammarError::schema(anyhow::anyhow!("Unsupported type in schema: banana"));
        assert_eq!(e.kind(), ErrorKind::SchemaCompile);
        assert_eq!(e.message(), "Unsupported type in schema: banana");
        assert!(e.to_string().starts_with("JSON schema compilation failed"));
    }

    #[test]
    fn context_chain_is_kept() {
        let e = anyhow::anyhow!("minimum 5 is greater than maximum 3").context("structure 1");
        let e = GrammarError::structural_tag(e);
        assert_eq!(e.message(), "structure 1: minimum 5 is greater than maximum 3");
    }
}
