//! Model configuration

/// How to handle input keys not declared on a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExtraFields {
    /// Drop extra keys silently (default)
    #[default]
    Ignore,
    /// Keep extra keys and carry them through to output
    Allow,
    /// Report each extra key as an `extra_forbidden` error
    Forbid,
}

/// Coercion policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CoercionMode {
    /// Numeric strings become numbers, "true"/"1" become booleans, etc.
    #[default]
    Lax,
    /// Only exact JSON types are accepted (int widening to float is still allowed)
    Strict,
}

/// Configuration options for model validation
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelConfig {
    pub extra: ExtraFields,
    pub coercion: CoercionMode,
    /// Drop null-valued fields when serializing
    pub exclude_none: bool,
}

impl ModelConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extra(mut self, extra: ExtraFields) -> Self {
        self.extra = extra;
        self
    }

    pub fn forbid_extra(self) -> Self {
        self.extra(ExtraFields::Forbid)
    }

    pub fn strict(mut self) -> Self {
        self.coercion = CoercionMode::Strict;
        self
    }

    pub fn exclude_none(mut self, exclude: bool) -> Self {
        self.exclude_none = exclude;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ModelConfig::default();
        assert_eq!(config.extra, ExtraFields::Ignore);
        assert_eq!(config.coercion, CoercionMode::Lax);
        assert!(!config.exclude_none);
    }

    #[test]
    fn test_builder() {
        let config = ModelConfig::new().forbid_extra().strict().exclude_none(true);
        assert_eq!(config.extra, ExtraFields::Forbid);
        assert_eq!(config.coercion, CoercionMode::Strict);
        assert!(config.exclude_none);
    }
}
